use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use spine_core::{
    ContextInterpreter, IntegrityMonitor, IntegritySnapshot, InterpreterConfig, LockCell,
    MemoryLedger, RightsGuard, RightsRegistry,
};
use tokio_util::sync::CancellationToken;

use crate::config::SpineConfig;

/// The wired-up core: one ledger, its monitor, and the interpreter over both.
#[derive(Clone)]
pub struct Spine {
    interpreter: Arc<ContextInterpreter>,
    rights_path: PathBuf,
}

impl Spine {
    /// Open the durable ledger and rights registry named by `config`.
    pub fn open(config: &SpineConfig) -> Result<Self> {
        let ledger_path = config.ledger_path();
        let ledger = spine_store::open_ledger(
            &ledger_path,
            Arc::new(LockCell::new()),
            config.signer()?,
        )
        .with_context(|| format!("failed to open ledger {}", ledger_path.display()))?;

        let rights_path = config.rights_path();
        let registry = spine_store::load_registry(&rights_path)
            .with_context(|| format!("failed to load rights {}", rights_path.display()))?;

        tracing::debug!(
            ledger = %ledger_path.display(),
            entries = ledger.len(),
            "spine opened"
        );
        Ok(Self::from_parts(
            Arc::new(ledger),
            registry,
            config.interpreter_config(),
            rights_path,
        ))
    }

    pub fn from_parts(
        ledger: Arc<MemoryLedger>,
        registry: RightsRegistry,
        config: InterpreterConfig,
        rights_path: PathBuf,
    ) -> Self {
        let monitor = Arc::new(IntegrityMonitor::new(ledger));
        let guard = Arc::new(RightsGuard::new(registry));
        Self {
            interpreter: Arc::new(ContextInterpreter::new(guard, monitor, config)),
            rights_path,
        }
    }

    pub fn interpreter(&self) -> &Arc<ContextInterpreter> {
        &self.interpreter
    }

    pub fn monitor(&self) -> &Arc<IntegrityMonitor> {
        self.interpreter.monitor()
    }

    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        self.monitor().ledger()
    }

    pub fn guard(&self) -> &Arc<RightsGuard> {
        self.interpreter.guard()
    }

    /// Re-read the rights file and swap it in. Returns the identity count.
    pub fn reload_rights(&self) -> Result<usize> {
        let registry = spine_store::load_registry(&self.rights_path).with_context(|| {
            format!("failed to reload rights {}", self.rights_path.display())
        })?;
        let identities = registry.identities.len();
        self.guard().reload(registry);
        Ok(identities)
    }
}

/// Run `verify()` every `period` until `cancel` fires. The first pass is
/// left to the caller.
pub async fn scheduled_verification(
    monitor: Arc<IntegrityMonitor>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let monitor = Arc::clone(&monitor);
                match tokio::task::spawn_blocking(move || monitor.verify()).await {
                    Ok(Ok(snapshot)) => log_scheduled(&snapshot),
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "scheduled verification could not read the ledger")
                    }
                    Err(e) => tracing::error!(error = %e, "scheduled verification task failed"),
                }
            }
        }
    }
    tracing::debug!("scheduled verification stopped");
}

fn log_scheduled(snapshot: &IntegritySnapshot) {
    if snapshot.is_secure() {
        tracing::debug!(entries = snapshot.entries_checked, "scheduled verification: secure");
    } else {
        tracing::error!(
            violation_at = ?snapshot.violation_at,
            "scheduled verification: compromised"
        );
    }
}
