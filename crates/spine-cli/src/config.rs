//! `spine.toml` loading.
//!
//! Every section is optional. Precedence, lowest first: built-in defaults,
//! the config file, `SPINE_*` environment variables, command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spine_core::{EntrySigner, InterpreterConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpineConfig {
    pub proxy: ProxyConfig,
    pub ledger: LedgerConfig,
    pub rights: RightsConfig,
    pub retrieval: RetrievalConfig,
    pub integrity: IntegrityConfig,
    pub admin: AdminConfig,
    pub signing: SigningConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: String,
    pub upstream_base_url: String,
    /// Request header naming the caller. Falls back to the body's `user` field.
    ///
    /// This is not authentication. A trusted front end must set it, and strip
    /// any client-supplied copy, before requests reach the proxy.
    pub identity_header: String,
    pub default_identity: String,
    /// Role of the message carrying the memory block.
    pub context_role: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5500".to_string(),
            upstream_base_url: "http://localhost:11434".to_string(),
            identity_header: "x-spine-identity".to_string(),
            default_identity: "anonymous".to_string(),
            context_role: "system".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RightsConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub recency_bias: f64,
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        let base = InterpreterConfig::default();
        Self {
            top_k: base.top_k,
            recency_bias: base.recency_bias,
            timeout_ms: base.retrieval_timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Scheduled verification period for `spine serve`. Zero disables it.
    pub interval_secs: u64,
    pub staleness_secs: u64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            staleness_secs: InterpreterConfig::default().staleness.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token for `/admin/*`. Unset disables those routes.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub key: Option<String>,
}

impl SpineConfig {
    /// Load from `explicit`, else `$SPINE_CONFIG`, else `<data_dir>/spine.toml`,
    /// then apply environment overrides.
    ///
    /// An explicitly named file must exist; the default one may be absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let named = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("SPINE_CONFIG").map(PathBuf::from));

        let mut config = match named {
            Some(path) => Self::from_file(&path)?,
            None => {
                let path = spine_store::default_config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::parse(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `SPINE_UPSTREAM_URL`, `SPINE_ADMIN_TOKEN` and `SPINE_SIGNING_KEY`
    /// as looked up through `var`. Empty values are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| var(key).filter(|v| !v.is_empty());
        if let Some(url) = var("SPINE_UPSTREAM_URL") {
            self.proxy.upstream_base_url = url;
        }
        if let Some(token) = var("SPINE_ADMIN_TOKEN") {
            self.admin.token = Some(token);
        }
        if let Some(key) = var("SPINE_SIGNING_KEY") {
            self.signing.key = Some(key);
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger
            .path
            .clone()
            .unwrap_or_else(spine_store::default_ledger_path)
    }

    pub fn rights_path(&self) -> PathBuf {
        self.rights
            .path
            .clone()
            .unwrap_or_else(spine_store::default_rights_path)
    }

    pub fn interpreter_config(&self) -> InterpreterConfig {
        InterpreterConfig {
            top_k: self.retrieval.top_k,
            recency_bias: self.retrieval.recency_bias,
            retrieval_timeout: Duration::from_millis(self.retrieval.timeout_ms),
            staleness: Duration::from_secs(self.integrity.staleness_secs),
        }
    }

    pub fn signer(&self) -> Result<Option<EntrySigner>> {
        self.signing
            .key
            .as_deref()
            .map(|key| EntrySigner::new(key.as_bytes()).context("invalid [signing] key"))
            .transpose()
    }

    /// Upstream base URL without a trailing slash.
    pub fn upstream_base(&self) -> &str {
        self.proxy.upstream_base_url.trim_end_matches('/')
    }
}
