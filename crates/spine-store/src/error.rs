use spine_core::SpineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Every persistence failure is a storage error to the core, never an
/// integrity violation.
impl From<StoreError> for SpineError {
    fn from(e: StoreError) -> Self {
        SpineError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
