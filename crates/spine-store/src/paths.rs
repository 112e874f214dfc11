use std::env;
use std::path::PathBuf;

/// Data directory: `$SPINE_DATA_DIR`, else `~/.symbiotic-spine`.
pub fn default_base_dir() -> PathBuf {
    env::var_os("SPINE_DATA_DIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| dirs_home().join(".symbiotic-spine"))
}

pub fn default_ledger_path() -> PathBuf {
    default_base_dir().join("ledger.db")
}

pub fn default_rights_path() -> PathBuf {
    default_base_dir().join("rights.toml")
}

pub fn default_config_path() -> PathBuf {
    default_base_dir().join("spine.toml")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
