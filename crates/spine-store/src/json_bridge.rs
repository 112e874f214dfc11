use std::fs;
use std::path::Path;

use spine_core::{EntrySigner, IntegritySnapshot, LedgerExport, export_json, import_json};

use crate::error::{Result, StoreError};
use crate::store::LedgerStore;

impl LedgerStore {
    /// Export the full ledger as a `spine-ledger/1` JSON string.
    pub fn export_json_string(&self) -> Result<String> {
        let entries = self.load_all()?;
        Ok(export_json(&entries)?)
    }

    pub fn export_json_file(&self, path: &Path) -> Result<()> {
        let json = self.export_json_string()?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Restore an export into this store. Only an empty store accepts a
    /// restore, and only when the export's chain verifies.
    pub fn import_json_str(&mut self, json: &str, signer: Option<&EntrySigner>) -> Result<usize> {
        if self.entry_count()? > 0 {
            return Err(StoreError::InvalidData(
                "restore target ledger is not empty".to_string(),
            ));
        }
        let export = import_json(json)?;
        let audit = export.audit(signer);
        if let Some(violation) = audit.violation() {
            return Err(StoreError::InvalidData(format!(
                "export does not verify: {violation}"
            )));
        }
        for entry in &export.entries {
            if !self.append_entry(entry)? {
                return Err(StoreError::InvalidData(format!(
                    "restore interrupted at sequence {}",
                    entry.sequence_number
                )));
            }
        }
        tracing::info!(entries = export.entries.len(), "ledger restored from export");
        Ok(export.entries.len())
    }

    pub fn import_json_file(&mut self, path: &Path, signer: Option<&EntrySigner>) -> Result<usize> {
        let json = fs::read_to_string(path)?;
        self.import_json_str(&json, signer)
    }
}

/// Read an export from disk.
pub fn read_export(path: &Path) -> Result<LedgerExport> {
    let json = fs::read_to_string(path)?;
    Ok(import_json(&json)?)
}

/// Re-verify an exported ledger offline.
pub fn audit_export_file(path: &Path, signer: Option<&EntrySigner>) -> Result<IntegritySnapshot> {
    Ok(read_export(path)?.audit(signer))
}
