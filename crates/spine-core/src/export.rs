//! JSON wire format for offline ledger export and audit.

use serde::{Deserialize, Serialize};

use crate::constants::{GENESIS_HASH, HASH_DOMAIN};
use crate::entry::{EntrySigner, MemoryEntry};
use crate::integrity::{IntegritySnapshot, IntegrityStatus, verify_entries};
use crate::time::{now_iso8601, now_unix_millis};

pub const CURRENT_FORMAT: &str = HASH_DOMAIN;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LedgerExport {
    pub format: String,
    #[serde(default)]
    pub exported_at: String,
    pub head_hash: String,
    pub entries: Vec<MemoryEntry>,
}

impl LedgerExport {
    pub fn from_entries(entries: &[MemoryEntry]) -> Self {
        Self {
            format: CURRENT_FORMAT.to_string(),
            exported_at: now_iso8601(),
            head_hash: entries
                .last()
                .map(|e| e.entry_hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string()),
            entries: entries.to_vec(),
        }
    }

    /// Re-walk the exported chain. A head hash that disagrees with the last
    /// entry is reported as a violation at the position after the chain.
    pub fn audit(&self, signer: Option<&EntrySigner>) -> IntegritySnapshot {
        let mut snapshot = verify_entries(&self.entries, signer, now_unix_millis());
        if snapshot.is_secure() && snapshot.head_hash != self.head_hash {
            snapshot.status = IntegrityStatus::Compromised;
            snapshot.violation_at = Some(self.entries.len() as u64);
            snapshot.reason = Some("stated head_hash does not match the chain".to_string());
        }
        snapshot
    }
}

/// Serialize a ledger snapshot to pretty JSON.
pub fn export_json(entries: &[MemoryEntry]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&LedgerExport::from_entries(entries))
}

/// Parse an export. Unknown `format` values are rejected.
pub fn import_json(json: &str) -> Result<LedgerExport, serde_json::Error> {
    let export: LedgerExport = serde_json::from_str(json)?;
    if export.format != CURRENT_FORMAT {
        return Err(serde::de::Error::custom(format!(
            "unsupported ledger format '{}', expected '{CURRENT_FORMAT}'",
            export.format
        )));
    }
    Ok(export)
}
