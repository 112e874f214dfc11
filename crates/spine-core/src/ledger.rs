//! Append-only, hash-chained memory ledger.
//!
//! Readers take an immutable snapshot (`Arc<Vec<MemoryEntry>>`) and never
//! wait on writers. Appends are serialized behind a single writer mutex that
//! also owns the durable sink, so an entry is either hashed, persisted and
//! published, or has no effect at all.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::constants::{GENESIS_HASH, MAX_APPEND_RETRIES};
use crate::entry::{EntrySigner, MemoryEntry, validate_content};
use crate::error::{Result, SpineError};
use crate::lock::LockCell;
use crate::rights::RightsClass;
use crate::time::now_unix_millis;

/// Immutable view of the ledger at one instant.
pub type LedgerSnapshot = Arc<Vec<MemoryEntry>>;

/// Failure reported by a durable sink.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// The durable tail is not the entry's predecessor; nothing was written.
    #[error("durable head moved")]
    HeadMoved,
    #[error("{0}")]
    Storage(String),
}

impl From<SinkError> for SpineError {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::HeadMoved => SpineError::SequenceConflict { attempts: 1 },
            SinkError::Storage(msg) => SpineError::Storage(msg),
        }
    }
}

/// Durable backing store for the ledger.
pub trait LedgerSink: Send {
    /// Atomically append `entry`. Must write nothing and return
    /// [`SinkError::HeadMoved`] when the stored tail is not `entry`'s predecessor.
    fn persist(&mut self, entry: &MemoryEntry) -> std::result::Result<(), SinkError>;

    /// Entries with a sequence number greater than `after` (all when `None`), in order.
    fn load_after(&mut self, after: Option<u64>) -> std::result::Result<Vec<MemoryEntry>, SinkError>;
}

/// Non-durable sink that keeps entries in memory. Used for tests and
/// ephemeral ledgers.
#[derive(Debug, Default)]
pub struct VolatileSink {
    entries: Vec<MemoryEntry>,
}

impl VolatileSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with pre-existing entries, exactly as given.
    pub fn with_entries(entries: Vec<MemoryEntry>) -> Self {
        Self { entries }
    }
}

impl LedgerSink for VolatileSink {
    fn persist(&mut self, entry: &MemoryEntry) -> std::result::Result<(), SinkError> {
        let (next_seq, tail_hash) = tail_of(&self.entries);
        if entry.sequence_number != next_seq || entry.previous_hash != tail_hash {
            return Err(SinkError::HeadMoved);
        }
        self.entries.push(entry.clone());
        Ok(())
    }

    fn load_after(&mut self, after: Option<u64>) -> std::result::Result<Vec<MemoryEntry>, SinkError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| after.is_none_or(|seq| e.sequence_number > seq))
            .cloned()
            .collect())
    }
}

/// Next sequence number and head hash for a sequence of entries.
fn tail_of(entries: &[MemoryEntry]) -> (u64, String) {
    match entries.last() {
        Some(last) => (last.sequence_number + 1, last.entry_hash.clone()),
        None => (0, GENESIS_HASH.to_string()),
    }
}

pub struct MemoryLedger {
    snapshot: RwLock<LedgerSnapshot>,
    writer: Mutex<Box<dyn LedgerSink>>,
    lock: Arc<LockCell>,
    signer: Option<EntrySigner>,
}

impl MemoryLedger {
    /// Open a ledger over `sink`, loading every stored entry.
    ///
    /// Loading does not verify the chain; that is the integrity monitor's job.
    pub fn open(
        mut sink: Box<dyn LedgerSink>,
        lock: Arc<LockCell>,
        signer: Option<EntrySigner>,
    ) -> Result<Self> {
        let entries = sink.load_after(None)?;
        tracing::debug!(entries = entries.len(), "ledger opened");
        Ok(Self {
            snapshot: RwLock::new(Arc::new(entries)),
            writer: Mutex::new(sink),
            lock,
            signer,
        })
    }

    /// Empty, non-durable ledger with its own lock cell.
    pub fn in_memory() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Vec::new())),
            writer: Mutex::new(Box::new(VolatileSink::new())),
            lock: Arc::new(LockCell::new()),
            signer: None,
        }
    }

    /// Append `content` under `claimed_rights`, stamped with the current time.
    ///
    /// The caller must have authorized `claimed_rights` through the rights guard.
    pub fn append(&self, content: &str, claimed_rights: RightsClass) -> Result<MemoryEntry> {
        self.append_at(content, claimed_rights, now_unix_millis())
    }

    /// Append with an explicit timestamp (Unix milliseconds).
    pub fn append_at(
        &self,
        content: &str,
        claimed_rights: RightsClass,
        timestamp: u64,
    ) -> Result<MemoryEntry> {
        validate_content(content)?;
        if self.lock.is_locked() {
            return Err(SpineError::LedgerLocked);
        }

        let mut sink = self.writer.lock();
        let mut conflicts = 0;
        loop {
            // The monitor may have locked while we waited for the writer.
            if self.lock.is_locked() {
                return Err(SpineError::LedgerLocked);
            }

            let current = self.read_all();
            let (sequence, previous_hash) = tail_of(&current);
            let entry = MemoryEntry::seal(
                sequence,
                timestamp,
                content,
                claimed_rights,
                &previous_hash,
                self.signer.as_ref(),
            );

            match sink.persist(&entry) {
                Ok(()) => {
                    Arc::make_mut(&mut *self.snapshot.write()).push(entry.clone());
                    tracing::debug!(
                        sequence = entry.sequence_number,
                        rights = %entry.author_rights,
                        hash = %&entry.entry_hash[..12],
                        "ledger append"
                    );
                    return Ok(entry);
                }
                Err(SinkError::HeadMoved) => {
                    conflicts += 1;
                    tracing::warn!(sequence, conflicts, "durable head moved during append");
                    if conflicts >= MAX_APPEND_RETRIES {
                        return Err(SpineError::SequenceConflict {
                            attempts: conflicts,
                        });
                    }
                    let after = current.last().map(|e| e.sequence_number);
                    let newer = sink.load_after(after)?;
                    if !newer.is_empty() {
                        Arc::make_mut(&mut *self.snapshot.write()).extend(newer);
                    }
                }
                Err(SinkError::Storage(msg)) => return Err(SpineError::Storage(msg)),
            }
        }
    }

    /// Immutable snapshot of every entry, in order.
    pub fn read_all(&self) -> LedgerSnapshot {
        self.snapshot.read().clone()
    }

    /// Hash of the last entry, or the genesis value when empty.
    pub fn head(&self) -> String {
        tail_of(&self.read_all()).1
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lock_cell(&self) -> &Arc<LockCell> {
        &self.lock
    }

    pub fn signer(&self) -> Option<&EntrySigner> {
        self.signer.as_ref()
    }

    /// Full durable contents plus the snapshot published at the same instant.
    ///
    /// The writer is held only for the read, so no append interleaves with it.
    pub fn load_durable(&self) -> Result<(LedgerSnapshot, LedgerSnapshot)> {
        let mut sink = self.writer.lock();
        let durable = sink.load_after(None)?;
        Ok((Arc::new(durable), self.read_all()))
    }

    /// Publish a verified durable read as the live snapshot. Entries this
    /// process appended after the read are kept on top of it.
    pub fn publish_durable(&self, durable: &LedgerSnapshot) {
        let _writer = self.writer.lock();
        let mut snapshot = self.snapshot.write();
        let after = durable.last().map(|e| e.sequence_number);
        let newer: Vec<MemoryEntry> = snapshot
            .iter()
            .filter(|e| after.is_none_or(|seq| e.sequence_number > seq))
            .cloned()
            .collect();
        if newer.is_empty() {
            *snapshot = Arc::clone(durable);
        } else {
            let mut merged = durable.to_vec();
            merged.extend(newer);
            *snapshot = Arc::new(merged);
        }
    }

    /// Replace the in-memory snapshot with the sink's full contents.
    /// Administrative path used when re-anchoring after remediation.
    pub fn reload(&self) -> Result<usize> {
        let mut sink = self.writer.lock();
        let entries = sink.load_after(None)?;
        let count = entries.len();
        *self.snapshot.write() = Arc::new(entries);
        tracing::info!(entries = count, "ledger reloaded from durable storage");
        Ok(count)
    }
}
