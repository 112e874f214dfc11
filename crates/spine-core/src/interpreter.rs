//! Request-side orchestration: verified retrieval in, encoded context out,
//! and authorized recording of the finished exchange.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::constants::{DEFAULT_RECENCY_BIAS, DEFAULT_TOP_K, EXCHANGE_EXCERPT_CHARS};
use crate::encode::{EncodedContext, encode_context};
use crate::entry::MemoryEntry;
use crate::error::Result;
use crate::integrity::IntegrityMonitor;
use crate::retriever::{AttentionRetriever, RetrievalQuery};
use crate::rights::{RightsClass, RightsGuard};

#[derive(Debug, Clone, PartialEq)]
pub struct InterpreterConfig {
    pub top_k: usize,
    pub recency_bias: f64,
    /// Budget for one retrieval before falling back to no context.
    pub retrieval_timeout: Duration,
    /// Maximum age of the last integrity pass before a request forces a new one.
    pub staleness: Duration,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            recency_bias: DEFAULT_RECENCY_BIAS,
            retrieval_timeout: Duration::from_millis(250),
            staleness: Duration::from_secs(300),
        }
    }
}

/// Outcome of [`ContextInterpreter::build_context`].
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltContext {
    Context(EncodedContext),
    /// Ledger is locked: forward the request without memory.
    Locked,
    /// Retrieval failed or timed out: forward the request without memory.
    Degraded(String),
}

impl BuiltContext {
    pub fn is_degraded(&self) -> bool {
        !matches!(self, BuiltContext::Context(_))
    }

    pub fn memory_count(&self) -> usize {
        match self {
            BuiltContext::Context(ctx) => ctx.memory_count,
            _ => 0,
        }
    }
}

pub struct ContextInterpreter {
    guard: Arc<RightsGuard>,
    monitor: Arc<IntegrityMonitor>,
    retriever: AttentionRetriever,
    config: InterpreterConfig,
}

impl ContextInterpreter {
    pub fn new(
        guard: Arc<RightsGuard>,
        monitor: Arc<IntegrityMonitor>,
        config: InterpreterConfig,
    ) -> Self {
        let retriever = AttentionRetriever::new(Arc::clone(&monitor));
        Self {
            guard,
            monitor,
            retriever,
            config,
        }
    }

    pub fn guard(&self) -> &Arc<RightsGuard> {
        &self.guard
    }

    pub fn monitor(&self) -> &Arc<IntegrityMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    /// Verified, encoded memory for `query`. Never fails the request:
    /// lockdown and retrieval trouble both degrade to "no context".
    pub fn build_context(&self, query: &str, identity: &str) -> BuiltContext {
        if self.monitor.lock_state().is_locked() {
            tracing::warn!(identity, "ledger locked: serving without memory");
            return BuiltContext::Locked;
        }

        match self.monitor.verify_if_stale(self.config.staleness) {
            Ok(integrity) if !integrity.is_secure() => return BuiltContext::Locked,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(identity, error = %e, "integrity check failed: serving without memory");
                return BuiltContext::Degraded(e.to_string());
            }
        }

        let retrieval = RetrievalQuery::new(query)
            .with_top_k(self.config.top_k)
            .with_recency_bias(self.config.recency_bias);
        let deadline = Instant::now() + self.config.retrieval_timeout;
        match self.retriever.retrieve_within(&retrieval, deadline) {
            Ok(memories) => {
                tracing::debug!(identity, memories = memories.len(), "context built");
                BuiltContext::Context(encode_context(&memories))
            }
            Err(e) => {
                tracing::warn!(identity, error = %e, "retrieval degraded: serving without memory");
                BuiltContext::Degraded(e.to_string())
            }
        }
    }

    /// Record a completed exchange under the rights the registry grants
    /// `identity`.
    pub fn record_exchange(
        &self,
        identity: &str,
        user_message: &str,
        assistant_reply: &str,
    ) -> Result<MemoryEntry> {
        let rights = self.guard.registry().exchange_rights(identity);
        let content = format!(
            "USER: {}\nASSISTANT: {}",
            excerpt(user_message),
            excerpt(assistant_reply)
        );
        self.commit_memory(identity, rights, &content)
    }

    /// Authorize then append. The claim is rejected before anything is hashed.
    pub fn commit_memory(
        &self,
        identity: &str,
        claimed: RightsClass,
        content: &str,
    ) -> Result<MemoryEntry> {
        self.guard.authorize(claimed, identity)?;
        self.monitor.ledger().append(content, claimed)
    }
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(EXCHANGE_EXCERPT_CHARS) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
