use thiserror::Error;

use crate::rights::RightsClass;

/// Failure taxonomy shared by every spine component.
///
/// Retrieval-side failures (`RetrievalDegraded`) are absorbed by the
/// interpreter; tampering and unauthorized writes never are.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpineError {
    #[error("invalid entry: {0}")]
    Validation(String),

    #[error("rights violation: identity '{identity}' is not granted '{claimed}'")]
    RightsViolation {
        identity: String,
        claimed: RightsClass,
    },

    #[error("integrity violation at sequence {sequence}: {reason}")]
    IntegrityViolation { sequence: u64, reason: String },

    #[error("ledger is locked after an integrity violation")]
    LedgerLocked,

    #[error("sequence conflict: durable head moved on {attempts} consecutive append attempts")]
    SequenceConflict { attempts: usize },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("retrieval degraded: {0}")]
    RetrievalDegraded(String),

    #[error("upstream error: {0}")]
    Upstream(String),
}

impl SpineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// True for failures that must change observable state or be rejected
    /// outright rather than degraded around.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            Self::RightsViolation { .. } | Self::IntegrityViolation { .. } | Self::LedgerLocked
        )
    }
}

pub type Result<T> = std::result::Result<T, SpineError>;
