//! Chain verification and the lockdown it drives.
//!
//! [`verify_entries`] is a pure walk over a snapshot. [`IntegrityMonitor`]
//! wraps it with the only code path allowed to lock the ledger, and the
//! administrative re-anchor that is the only way back to `Open`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::constants::GENESIS_HASH;
use crate::entry::{EntrySigner, MemoryEntry};
use crate::error::{Result, SpineError};
use crate::ledger::{LedgerSnapshot, MemoryLedger};
use crate::lock::LockState;
use crate::time::{millis_to_iso8601, now_unix_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    Secure,
    Compromised,
}

/// Result of one verification pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegritySnapshot {
    pub status: IntegrityStatus,
    /// Last sequence number that verified cleanly. `None` when nothing did.
    pub checked_through: Option<u64>,
    /// First offending sequence number.
    pub violation_at: Option<u64>,
    pub reason: Option<String>,
    pub entries_checked: usize,
    /// Head hash of the snapshot that was walked.
    pub head_hash: String,
    /// Unix milliseconds.
    pub verified_at: u64,
}

impl IntegritySnapshot {
    pub fn is_secure(&self) -> bool {
        self.status == IntegrityStatus::Secure
    }

    pub fn verified_at_iso8601(&self) -> String {
        millis_to_iso8601(self.verified_at)
    }

    /// The violation as an error, if this pass found one.
    pub fn violation(&self) -> Option<SpineError> {
        self.violation_at.map(|sequence| SpineError::IntegrityViolation {
            sequence,
            reason: self.reason.clone().unwrap_or_default(),
        })
    }
}

/// Walk `entries` from genesis and report the first broken link.
///
/// Each entry must sit at its own index, link to its predecessor's hash, hash
/// to its stated `entry_hash`, and (when `signer` is given) carry a valid
/// signature over that hash.
pub fn verify_entries(
    entries: &[MemoryEntry],
    signer: Option<&EntrySigner>,
    now: u64,
) -> IntegritySnapshot {
    let mut expected_previous = GENESIS_HASH;
    let mut checked_through = None;

    for (index, entry) in entries.iter().enumerate() {
        if let Some(reason) = check_entry(index as u64, entry, expected_previous, signer) {
            return IntegritySnapshot {
                status: IntegrityStatus::Compromised,
                checked_through,
                violation_at: Some(index as u64),
                reason: Some(reason),
                entries_checked: index,
                head_hash: head_of(entries),
                verified_at: now,
            };
        }
        checked_through = Some(entry.sequence_number);
        expected_previous = &entry.entry_hash;
    }

    IntegritySnapshot {
        status: IntegrityStatus::Secure,
        checked_through,
        violation_at: None,
        reason: None,
        entries_checked: entries.len(),
        head_hash: head_of(entries),
        verified_at: now,
    }
}

fn check_entry(
    index: u64,
    entry: &MemoryEntry,
    expected_previous: &str,
    signer: Option<&EntrySigner>,
) -> Option<String> {
    if entry.sequence_number != index {
        return Some(format!(
            "sequence number {} found at position {index}",
            entry.sequence_number
        ));
    }
    if entry.previous_hash != expected_previous {
        return Some("previous_hash does not link to the prior entry".to_string());
    }
    if entry.recompute_hash() != entry.entry_hash {
        return Some("entry_hash does not match the entry's fields".to_string());
    }
    if let Some(signer) = signer {
        match entry.signature.as_deref() {
            None => return Some("signature missing".to_string()),
            Some(sig) if !signer.verify(&entry.entry_hash, sig) => {
                return Some("signature does not verify".to_string());
            }
            Some(_) => {}
        }
    }
    None
}

/// Position of the first entry whose hash differs between two reads.
fn first_divergence(durable: &[MemoryEntry], published: &[MemoryEntry]) -> Option<u64> {
    durable
        .iter()
        .zip(published)
        .position(|(d, p)| d.entry_hash != p.entry_hash)
        .map(|at| at as u64)
}

fn head_of(entries: &[MemoryEntry]) -> String {
    entries
        .last()
        .map(|e| e.entry_hash.clone())
        .unwrap_or_else(|| GENESIS_HASH.to_string())
}

pub struct IntegrityMonitor {
    ledger: Arc<MemoryLedger>,
    last: RwLock<Option<IntegritySnapshot>>,
    /// Entries as of the last `Secure` pass; what retrieval serves while locked.
    verified: RwLock<LedgerSnapshot>,
}

impl IntegrityMonitor {
    pub fn new(ledger: Arc<MemoryLedger>) -> Self {
        Self {
            ledger,
            last: RwLock::new(None),
            verified: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    pub fn lock_state(&self) -> LockState {
        self.ledger.lock_cell().state()
    }

    /// Re-read the durable ledger and walk it from genesis. Locks the
    /// ledger on `Compromised`; never repairs anything.
    ///
    /// A durable entry that differs from the one this process already holds
    /// is a violation even when the rewritten chain links up. A durable read
    /// that fails, or returns fewer entries than were published, is a
    /// storage error and leaves the lock state alone.
    pub fn verify(&self) -> Result<IntegritySnapshot> {
        let (durable, published) = self.ledger.load_durable().inspect_err(|e| {
            tracing::error!(error = %e, "integrity check could not read the ledger");
        })?;
        if durable.len() < published.len() {
            let err = SpineError::storage(format!(
                "durable ledger holds {} entries, {} were already published",
                durable.len(),
                published.len()
            ));
            tracing::error!(error = %err, "integrity check could not read the ledger");
            return Err(err);
        }

        let now = now_unix_millis();
        let mut snapshot = verify_entries(&durable, self.ledger.signer(), now);
        if snapshot.is_secure()
            && let Some(at) = first_divergence(&durable, &published)
        {
            snapshot = IntegritySnapshot {
                status: IntegrityStatus::Compromised,
                checked_through: at.checked_sub(1),
                violation_at: Some(at),
                reason: Some("durable entry differs from the entry already published".to_string()),
                entries_checked: at as usize,
                head_hash: head_of(&durable),
                verified_at: now,
            };
        }

        if snapshot.is_secure() {
            tracing::debug!(
                entries = snapshot.entries_checked,
                head = %snapshot.head_hash,
                "integrity verified"
            );
            self.ledger.publish_durable(&durable);
            *self.verified.write() = durable;
        } else {
            let transitioned = self.ledger.lock_cell().lock();
            tracing::error!(
                violation_at = ?snapshot.violation_at,
                reason = snapshot.reason.as_deref().unwrap_or(""),
                transitioned,
                "integrity violation: ledger locked"
            );
        }

        *self.last.write() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Verify only when no pass has run within `max_age`.
    pub fn verify_if_stale(&self, max_age: Duration) -> Result<IntegritySnapshot> {
        if let Some(last) = self.last_snapshot() {
            let age = now_unix_millis().saturating_sub(last.verified_at);
            if u128::from(age) < max_age.as_millis() {
                return Ok(last);
            }
        }
        self.verify()
    }

    pub fn last_snapshot(&self) -> Option<IntegritySnapshot> {
        self.last.read().clone()
    }

    /// Entries covered by the most recent `Secure` pass.
    pub fn verified_entries(&self) -> LedgerSnapshot {
        self.verified.read().clone()
    }

    /// Administrative reset after out-of-band remediation: reload the ledger
    /// from durable storage, verify it, and reopen only if it is now intact.
    pub fn reanchor(&self) -> Result<IntegritySnapshot> {
        self.ledger.reload()?;
        let snapshot = self.verify()?;
        if let Some(violation) = snapshot.violation() {
            tracing::warn!(%violation, "re-anchor refused: ledger still compromised");
            return Err(violation);
        }
        if self.ledger.lock_cell().open() {
            tracing::warn!(
                head = %snapshot.head_hash,
                entries = snapshot.entries_checked,
                "ledger re-anchored: lock released"
            );
        }
        Ok(snapshot)
    }
}
