//! Flood-resistant relevance ranking over a ledger snapshot.
//!
//! Relevance is the IDF-weighted fraction of the query's distinct tokens an
//! entry contains. IDF is computed over the snapshot being ranked, so a phrase
//! repeated across a thousand filler entries becomes nearly worthless. Recency
//! only adds to entries that already clear [`MIN_RELEVANCE`], and never by more
//! than [`RECENCY_CAP`] of their own relevance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::constants::{
    DEADLINE_CHECK_INTERVAL, DEFAULT_RECENCY_BIAS, DEFAULT_TOP_K, MIN_RELEVANCE, RECENCY_CAP,
    RECENCY_DECAY_RATE,
};
use crate::entry::MemoryEntry;
use crate::error::{Result, SpineError};
use crate::integrity::IntegrityMonitor;
use crate::ledger::LedgerSnapshot;
use crate::time::{age_days, now_unix_millis};
use crate::tokenizer::{token_set, unique_tokens};

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalQuery {
    pub text: String,
    pub top_k: usize,
    /// Weight of the recency term, clamped to [0, 1].
    pub recency_bias: f64,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: DEFAULT_TOP_K,
            recency_bias: DEFAULT_RECENCY_BIAS,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_recency_bias(mut self, recency_bias: f64) -> Self {
        self.recency_bias = recency_bias;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredMemory {
    pub entry: MemoryEntry,
    pub score: f64,
    pub relevance: f64,
}

/// Rank `entries` against `query`.
///
/// Returns at most `top_k` entries with nonzero relevance, ordered by score
/// descending then sequence number ascending. When `deadline` passes
/// mid-scan the whole retrieval is abandoned with `RetrievalDegraded`.
pub fn rank(
    entries: &[MemoryEntry],
    query: &RetrievalQuery,
    now: u64,
    deadline: Option<Instant>,
) -> Result<Vec<ScoredMemory>> {
    let query_tokens = unique_tokens(&query.text);
    if query_tokens.is_empty() || query.top_k == 0 || entries.is_empty() {
        return Ok(Vec::new());
    }

    let index_of: HashMap<&str, usize> = query_tokens
        .iter()
        .enumerate()
        .map(|(i, t)| (t.as_str(), i))
        .collect();

    // Pass 1: which query tokens each entry contains, and document frequency.
    let mut doc_freq = vec![0usize; query_tokens.len()];
    let mut candidates: Vec<(usize, Vec<usize>)> = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        check_deadline(i, deadline)?;
        let mut matched: Vec<usize> = token_set(&entry.content)
            .iter()
            .filter_map(|t| index_of.get(t.as_str()).copied())
            .collect();
        if matched.is_empty() {
            continue;
        }
        matched.sort_unstable();
        for &q in &matched {
            doc_freq[q] += 1;
        }
        candidates.push((i, matched));
    }

    let n = entries.len() as f64;
    let idf: Vec<f64> = doc_freq
        .iter()
        .map(|&df| (1.0 + (n + 1.0) / (df as f64 + 1.0)).ln())
        .collect();
    let idf_total: f64 = idf.iter().sum();
    let bias = query.recency_bias.clamp(0.0, 1.0);

    // Pass 2: combine.
    let mut scored = Vec::with_capacity(candidates.len());
    for (checked, (i, matched)) in candidates.into_iter().enumerate() {
        check_deadline(checked, deadline)?;
        let entry = &entries[i];
        let relevance = matched.iter().map(|&q| idf[q]).sum::<f64>() / idf_total;
        let score = relevance + recency_term(relevance, bias, age_days(entry.timestamp, now));
        scored.push(ScoredMemory {
            entry: entry.clone(),
            score,
            relevance,
        });
    }

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.entry.sequence_number.cmp(&b.entry.sequence_number))
    });
    scored.truncate(query.top_k);
    Ok(scored)
}

/// Bounded recency contribution. Zero below the relevance floor.
fn recency_term(relevance: f64, bias: f64, age_days: f64) -> f64 {
    if relevance < MIN_RELEVANCE {
        return 0.0;
    }
    let decay = 1.0 / (1.0 + age_days * RECENCY_DECAY_RATE);
    (bias * decay).min(RECENCY_CAP * relevance)
}

fn check_deadline(i: usize, deadline: Option<Instant>) -> Result<()> {
    if let Some(deadline) = deadline
        && i % DEADLINE_CHECK_INTERVAL == 0
        && Instant::now() >= deadline
    {
        return Err(SpineError::RetrievalDegraded(format!(
            "retrieval deadline passed after {i} entries"
        )));
    }
    Ok(())
}

/// Ranks the ledger snapshot appropriate to the current lock state.
pub struct AttentionRetriever {
    monitor: Arc<IntegrityMonitor>,
}

impl AttentionRetriever {
    pub fn new(monitor: Arc<IntegrityMonitor>) -> Self {
        Self { monitor }
    }

    /// Live snapshot while open; the last verified snapshot while locked.
    fn snapshot(&self) -> LedgerSnapshot {
        if self.monitor.ledger().lock_cell().is_locked() {
            self.monitor.verified_entries()
        } else {
            self.monitor.ledger().read_all()
        }
    }

    pub fn retrieve(&self, query: &RetrievalQuery) -> Vec<ScoredMemory> {
        let entries = self.snapshot();
        rank(&entries, query, now_unix_millis(), None).unwrap_or_default()
    }

    /// Like [`retrieve`](Self::retrieve), abandoning the scan once `deadline` passes.
    pub fn retrieve_within(
        &self,
        query: &RetrievalQuery,
        deadline: Instant,
    ) -> Result<Vec<ScoredMemory>> {
        let entries = self.snapshot();
        rank(&entries, query, now_unix_millis(), Some(deadline))
    }
}
