use std::fs;
use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use spine_core::{
    EntrySigner, GENESIS_HASH, LedgerSink, LockCell, MemoryEntry, MemoryLedger, RightsClass,
    SinkError,
};

use crate::error::{Result, StoreError};
use crate::schema;

/// Durable, append-only ledger file.
///
/// Rows are only ever inserted; triggers reject UPDATE and DELETE. The
/// recorded head sequence lives in `metadata` and is advanced in the same
/// transaction as each insert, so a truncated store is detectable on load.
pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = ?1")?;
        let result = stmt.query_row([key], |row| row.get(0)).optional()?;
        Ok(result)
    }

    /// Head sequence recorded alongside the last successful insert.
    pub fn recorded_head(&self) -> Result<Option<u64>> {
        self.get_metadata("head_sequence")?
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| StoreError::InvalidData(format!("bad head_sequence '{v}'")))
            })
            .transpose()
    }

    // --- Append ---

    /// Insert `entry` if the stored tail is its predecessor.
    ///
    /// Returns `Ok(false)` without writing when another writer moved the tail.
    pub fn append_entry(&mut self, entry: &MemoryEntry) -> Result<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let tail: Option<(i64, String)> = tx
            .query_row(
                "SELECT sequence, entry_hash FROM ledger_entries ORDER BY sequence DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let sequence = to_sql_int(entry.sequence_number, "sequence")?;
        let links = match &tail {
            Some((seq, hash)) => sequence == seq + 1 && entry.previous_hash == *hash,
            None => sequence == 0 && entry.previous_hash == GENESIS_HASH,
        };
        if !links {
            tracing::debug!(sequence, tail = ?tail.map(|t| t.0), "stored tail moved");
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO ledger_entries
                (sequence, timestamp, content, author_rights, previous_hash, entry_hash, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sequence,
                to_sql_int(entry.timestamp, "timestamp")?,
                entry.content,
                entry.author_rights.as_str(),
                entry.previous_hash,
                entry.entry_hash,
                entry.signature,
            ],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('head_sequence', ?1)",
            [sequence.to_string()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // --- Load ---

    /// Entries with sequence greater than `after`, in order.
    ///
    /// Undecodable rows, gaps in the sequence, and a tail that disagrees with
    /// the recorded head are all storage errors.
    pub fn load_after(&self, after: Option<u64>) -> Result<Vec<MemoryEntry>> {
        let start = match after {
            Some(seq) => seq + 1,
            None => 0,
        };
        let mut stmt = self.conn.prepare(
            "SELECT sequence, timestamp, content, author_rights, previous_hash, entry_hash, signature
             FROM ledger_entries WHERE sequence >= ?1 ORDER BY sequence",
        )?;
        let rows: Vec<RawEntry> = stmt
            .query_map([to_sql_int(start, "sequence")?], |row| {
                Ok(RawEntry {
                    sequence: row.get(0)?,
                    timestamp: row.get(1)?,
                    content: row.get(2)?,
                    author_rights: row.get(3)?,
                    previous_hash: row.get(4)?,
                    entry_hash: row.get(5)?,
                    signature: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut expected = start;
        let mut entries = Vec::with_capacity(rows.len());
        for raw in rows {
            let entry = raw.decode()?;
            if entry.sequence_number != expected {
                return Err(StoreError::InvalidData(format!(
                    "sequence gap: expected {expected}, found {}",
                    entry.sequence_number
                )));
            }
            expected += 1;
            entries.push(entry);
        }

        let loaded_through = expected.checked_sub(1);
        let recorded = self.recorded_head()?;
        if loaded_through != recorded {
            return Err(StoreError::InvalidData(format!(
                "ledger rows end at {loaded_through:?} but recorded head is {recorded:?}; \
                 store is truncated or was modified out of band"
            )));
        }
        Ok(entries)
    }

    pub fn load_all(&self) -> Result<Vec<MemoryEntry>> {
        self.load_after(None)
    }

    pub fn entry_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

impl LedgerSink for LedgerStore {
    fn persist(&mut self, entry: &MemoryEntry) -> std::result::Result<(), SinkError> {
        match self.append_entry(entry) {
            Ok(true) => Ok(()),
            Ok(false) => Err(SinkError::HeadMoved),
            Err(e) => Err(SinkError::Storage(e.to_string())),
        }
    }

    fn load_after(
        &mut self,
        after: Option<u64>,
    ) -> std::result::Result<Vec<MemoryEntry>, SinkError> {
        LedgerStore::load_after(self, after).map_err(|e| SinkError::Storage(e.to_string()))
    }
}

/// Open the ledger file at `path` as a [`MemoryLedger`].
pub fn open_ledger(
    path: &Path,
    lock: Arc<LockCell>,
    signer: Option<EntrySigner>,
) -> spine_core::Result<MemoryLedger> {
    let store = LedgerStore::open(path)?;
    MemoryLedger::open(Box::new(store), lock, signer)
}

struct RawEntry {
    sequence: i64,
    timestamp: i64,
    content: String,
    author_rights: String,
    previous_hash: String,
    entry_hash: String,
    signature: Option<String>,
}

impl RawEntry {
    fn decode(self) -> Result<MemoryEntry> {
        let sequence_number = u64::try_from(self.sequence)
            .map_err(|_| StoreError::InvalidData(format!("negative sequence {}", self.sequence)))?;
        let timestamp = u64::try_from(self.timestamp).map_err(|_| {
            StoreError::InvalidData(format!(
                "negative timestamp at sequence {sequence_number}"
            ))
        })?;
        let author_rights = self.author_rights.parse::<RightsClass>().map_err(|_| {
            StoreError::InvalidData(format!(
                "unknown rights tag '{}' at sequence {sequence_number}",
                self.author_rights
            ))
        })?;
        Ok(MemoryEntry {
            sequence_number,
            timestamp,
            content: self.content,
            author_rights,
            previous_hash: self.previous_hash,
            entry_hash: self.entry_hash,
            signature: self.signature,
        })
    }
}

fn to_sql_int(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| StoreError::InvalidData(format!("{field} {value} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(seq: u64, prev: &str, content: &str) -> MemoryEntry {
        MemoryEntry::seal(seq, 1_000 + seq, content, RightsClass::Agent, prev, None)
    }

    #[test]
    fn test_append_and_load() {
        let mut store = LedgerStore::open_in_memory().unwrap();
        let a = sealed(0, GENESIS_HASH, "a");
        let b = sealed(1, &a.entry_hash, "b");
        assert!(store.append_entry(&a).unwrap());
        assert!(store.append_entry(&b).unwrap());

        let all = store.load_all().unwrap();
        assert_eq!(all, vec![a.clone(), b.clone()]);
        assert_eq!(store.load_after(Some(0)).unwrap(), vec![b]);
        assert!(store.load_after(Some(1)).unwrap().is_empty());
        assert_eq!(store.entry_count().unwrap(), 2);
        assert_eq!(store.recorded_head().unwrap(), Some(1));
    }

    #[test]
    fn test_non_successor_is_refused_without_writing() {
        let mut store = LedgerStore::open_in_memory().unwrap();
        let a = sealed(0, GENESIS_HASH, "a");
        store.append_entry(&a).unwrap();

        let stale = sealed(0, GENESIS_HASH, "racing");
        assert!(!store.append_entry(&stale).unwrap());
        let wrong_link = sealed(1, GENESIS_HASH, "wrong link");
        assert!(!store.append_entry(&wrong_link).unwrap());
        assert_eq!(store.entry_count().unwrap(), 1);
    }

    #[test]
    fn test_sink_reports_head_moved() {
        let mut store = LedgerStore::open_in_memory().unwrap();
        let orphan = sealed(3, "nope", "orphan");
        assert_eq!(
            LedgerSink::persist(&mut store, &orphan),
            Err(SinkError::HeadMoved)
        );
    }

    #[test]
    fn test_signature_persisted() {
        let signer = EntrySigner::new(b"k").unwrap();
        let mut store = LedgerStore::open_in_memory().unwrap();
        let e = MemoryEntry::seal(0, 1, "s", RightsClass::Agent, GENESIS_HASH, Some(&signer));
        store.append_entry(&e).unwrap();
        assert_eq!(store.load_all().unwrap()[0].signature, e.signature);
    }

    #[test]
    fn test_unknown_rights_tag_is_storage_error() {
        let store = LedgerStore::open_in_memory().unwrap();
        store
            .conn()
            .execute_batch(
                "INSERT INTO ledger_entries VALUES (0, 1, 'x', 'root', 'p', 'h', NULL);
                 INSERT INTO metadata (key, value) VALUES ('head_sequence', '0');",
            )
            .unwrap();
        let err = store.load_all().unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(ref m) if m.contains("root")));
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/ledger.db");
        LedgerStore::open(&path).unwrap();
        assert!(path.exists());
    }
}
