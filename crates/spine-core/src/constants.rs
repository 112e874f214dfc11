/// Head hash of an empty ledger: 64 hex zeros (the width of a SHA-256 digest).
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Domain tag mixed into every entry hash. Bumped with the encoding version.
pub const HASH_DOMAIN: &str = "spine-ledger/1";

/// Bounded retries when the durable tail moved under an append.
pub const MAX_APPEND_RETRIES: usize = 3;

/// Relevance a memory must reach before recency may add to its score.
pub const MIN_RELEVANCE: f64 = 0.15;

/// Upper bound on the recency contribution, as a fraction of the entry's relevance.
pub const RECENCY_CAP: f64 = 0.25;

/// Recency decay per day of age: decay = 1 / (1 + days * rate).
pub const RECENCY_DECAY_RATE: f64 = 1.0 / 7.0;

/// Retrieval checks its deadline once per this many scored entries.
pub const DEADLINE_CHECK_INTERVAL: usize = 256;

/// Default number of memories returned by a retrieval.
pub const DEFAULT_TOP_K: usize = 5;

/// Default weight of the recency term in [0, 1].
pub const DEFAULT_RECENCY_BIAS: f64 = 0.3;

/// Maximum content length accepted by the ledger, in bytes.
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;

/// Per-side truncation applied to exchange records written by the proxy.
pub const EXCHANGE_EXCERPT_CHARS: usize = 2000;
