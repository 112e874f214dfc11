//! Symbiotic Spine memory-integrity core.
//!
//! Hash-chained, append-only memory ledger with claimed-vs-granted rights
//! checks, flood-resistant retrieval, tamper-driven lockdown, and an
//! injection-safe encoding for splicing retrieved memory into prompts.
//!
//! Zero I/O: durability is plugged in through [`LedgerSink`].

pub mod constants;
pub mod encode;
pub mod entry;
pub mod error;
pub mod export;
pub mod integrity;
pub mod interpreter;
pub mod ledger;
pub mod lock;
pub mod retriever;
pub mod rights;
pub mod time;
pub mod tokenizer;

pub use constants::{GENESIS_HASH, HASH_DOMAIN, MAX_APPEND_RETRIES};
pub use encode::{
    DecodedMemory, EncodedContext, decode_context, encode_context, encode_context_at,
};
pub use entry::{EntrySigner, MemoryEntry, compute_entry_hash, validate_content};
pub use error::{Result, SpineError};
pub use export::{CURRENT_FORMAT, LedgerExport, export_json, import_json};
pub use integrity::{IntegrityMonitor, IntegritySnapshot, IntegrityStatus, verify_entries};
pub use interpreter::{BuiltContext, ContextInterpreter, InterpreterConfig};
pub use ledger::{LedgerSink, LedgerSnapshot, MemoryLedger, SinkError, VolatileSink};
pub use lock::{LockCell, LockState};
pub use retriever::{AttentionRetriever, RetrievalQuery, ScoredMemory, rank};
pub use rights::{RightsClass, RightsGuard, RightsRegistry};
pub use tokenizer::tokenize;
