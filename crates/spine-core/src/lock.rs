use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Process-wide write gate. `Locked` rejects every append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Open,
    Locked,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Open => f.write_str("open"),
            LockState::Locked => f.write_str("locked"),
        }
    }
}

impl LockState {
    pub fn is_locked(self) -> bool {
        self == LockState::Locked
    }
}

const OPEN: u8 = 0;
const LOCKED: u8 = 1;

/// Single atomically-updated flag observed by every request path.
///
/// Readable everywhere; only the integrity monitor (this crate) can write it.
#[derive(Debug, Default)]
pub struct LockCell {
    state: AtomicU8,
}

impl LockCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LockState {
        match self.state.load(Ordering::Acquire) {
            OPEN => LockState::Open,
            _ => LockState::Locked,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state().is_locked()
    }

    /// Returns true when this call performed the Open → Locked transition.
    pub(crate) fn lock(&self) -> bool {
        self.state
            .compare_exchange(OPEN, LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns true when this call performed the Locked → Open transition.
    pub(crate) fn open(&self) -> bool {
        self.state
            .compare_exchange(LOCKED, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
