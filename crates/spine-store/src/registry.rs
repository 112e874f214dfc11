//! Rights registry file (`rights.toml`).
//!
//! ```toml
//! default = ["agent"]   # optional; may name only the lowest class
//!
//! [identities]
//! operator = ["system", "agent"]
//! paul = ["user_sovereign", "symbiotic_fluid", "agent"]
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use serde::Deserialize;
use spine_core::{RightsClass, RightsRegistry};

use crate::error::{Result, StoreError};

#[derive(Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RegistryFile {
    default: BTreeSet<RightsClass>,
    identities: HashMap<String, BTreeSet<RightsClass>>,
}

/// Parse a registry. Unknown rights tags are rejected, and so is a
/// `default` that would hand unknown identities more than the lowest class.
pub fn parse_registry(text: &str) -> Result<RightsRegistry> {
    let file: RegistryFile = toml::from_str(text)?;
    if let Some(elevated) = file.default.iter().find(|c| **c != RightsClass::LOWEST) {
        return Err(StoreError::InvalidData(format!(
            "default rights may only be '{}', found '{elevated}'",
            RightsClass::LOWEST
        )));
    }
    Ok(RightsRegistry {
        identities: file.identities,
    })
}

/// Load the registry at `path`. A missing file is an empty registry, under
/// which every identity holds only the lowest class.
pub fn load_registry(path: &Path) -> Result<RightsRegistry> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no rights registry; all identities get the lowest class");
        return Ok(RightsRegistry::new());
    }
    let text = fs::read_to_string(path)?;
    let registry = parse_registry(&text)?;
    tracing::debug!(
        path = %path.display(),
        identities = registry.identities.len(),
        "rights registry loaded"
    );
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_registry() {
        let registry = parse_registry(
            r#"
            default = ["agent"]

            [identities]
            operator = ["system", "user_sovereign"]
            paul = ["user_sovereign"]
            "#,
        )
        .unwrap();
        assert!(registry.granted("operator").contains(&RightsClass::System));
        assert!(registry.granted("paul").contains(&RightsClass::UserSovereign));
        assert_eq!(
            registry.granted("stranger"),
            BTreeSet::from([RightsClass::Agent])
        );
    }

    #[test]
    fn test_elevated_default_rejected() {
        let err = parse_registry("default = [\"system\", \"user_sovereign\"]\n").unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)), "{err}");
        let err = parse_registry("default = [\"agent\", \"symbiotic_fluid\"]\n").unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)), "{err}");
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(parse_registry("defaults = [\"agent\"]\n").is_err());
    }

    #[test]
    fn test_sections_are_optional() {
        let registry = parse_registry("").unwrap();
        assert!(registry.identities.is_empty());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = parse_registry("[identities]\nmallory = [\"root\"]\n").unwrap_err();
        assert!(matches!(err, StoreError::Toml(_)));
    }

    #[test]
    fn test_missing_file_is_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = load_registry(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(registry, RightsRegistry::new());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rights.toml");
        fs::write(&path, "[identities]\nops = [\"system\"]\n").unwrap();
        let registry = load_registry(&path).unwrap();
        assert!(registry.is_known("ops"));
    }
}
