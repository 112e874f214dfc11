mod config;
mod proxy;
mod relay;
mod runtime;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spine_core::{AttentionRetriever, IntegritySnapshot, RetrievalQuery, RightsClass, RightsGuard};
use spine_store::LedgerStore;
use tokio_util::sync::CancellationToken;

use crate::config::SpineConfig;
use crate::proxy::ProxyState;
use crate::runtime::{Spine, scheduled_verification};

/// Exit code for a ledger or export that failed verification.
const EXIT_COMPROMISED: u8 = 2;

#[derive(Parser)]
#[command(name = "spine", about = "Symbiotic Spine memory proxy and ledger tools")]
struct Cli {
    /// Config file (default: $SPINE_CONFIG, then <data dir>/spine.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat-completion proxy
    Serve {
        /// Listen address, overriding [proxy] listen
        #[arg(long)]
        listen: Option<String>,

        /// Upstream model base URL, overriding [proxy] upstream_base_url
        #[arg(long)]
        upstream: Option<String>,
    },

    /// Verify the ledger hash chain (exit 2 when compromised)
    Verify,

    /// Append a memory under an identity's granted rights
    Append {
        /// Text to remember
        text: String,

        /// Writing identity (default: [proxy] default_identity)
        #[arg(long)]
        identity: Option<String>,

        /// Rights class claimed for the entry
        #[arg(long, default_value = "agent")]
        rights: RightsClass,
    },

    /// Rank stored memories against a query
    Query {
        /// Text to query
        text: String,

        /// Number of memories to return
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Show ledger statistics
    Stats,

    /// Export the ledger to a JSON file
    Export {
        /// Output file path
        path: PathBuf,
    },

    /// Verify an exported ledger offline (exit 2 when compromised)
    Audit {
        /// Export file path
        path: PathBuf,
    },

    /// Restore an export into an empty ledger
    Import {
        /// Export file path
        path: PathBuf,
    },

    /// Inspect the rights registry
    Rights {
        #[command(subcommand)]
        command: RightsCommand,
    },
}

#[derive(Subcommand)]
enum RightsCommand {
    /// Check whether an identity may claim a rights class (exit 1 when not)
    Check { identity: String, class: RightsClass },

    /// List identities and their granted classes
    List,
}

fn init_tracing(verbose: bool, default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    init_tracing(cli.verbose, default_level);

    let config = SpineConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Serve { listen, upstream } => {
            cmd_serve(config, listen.as_deref(), upstream.as_deref()).await
        }
        Commands::Verify => cmd_verify(&config),
        Commands::Append {
            text,
            identity,
            rights,
        } => cmd_append(&config, text, identity.as_deref(), *rights),
        Commands::Query { text, top_k } => cmd_query(&config, text, *top_k),
        Commands::Stats => cmd_stats(&config),
        Commands::Export { path } => cmd_export(&config, path),
        Commands::Audit { path } => cmd_audit(&config, path),
        Commands::Import { path } => cmd_import(&config, path),
        Commands::Rights { command } => cmd_rights(&config, command),
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn cmd_serve(
    mut config: SpineConfig,
    listen: Option<&str>,
    upstream: Option<&str>,
) -> Result<ExitCode> {
    if let Some(listen) = listen {
        config.proxy.listen = listen.to_string();
    }
    if let Some(upstream) = upstream {
        config.proxy.upstream_base_url = upstream.to_string();
    }

    let spine = Spine::open(&config)?;
    let monitor = Arc::clone(spine.monitor());
    let first = {
        let monitor = Arc::clone(&monitor);
        tokio::task::spawn_blocking(move || monitor.verify())
            .await?
            .context("failed to read ledger")?
    };
    if first.is_secure() {
        tracing::info!(entries = first.entries_checked, "ledger verified");
    } else {
        tracing::error!(
            violation_at = ?first.violation_at,
            "ledger compromised at startup; serving without memory until re-anchored"
        );
    }

    let listener = tokio::net::TcpListener::bind(&config.proxy.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.proxy.listen))?;
    let addr = listener.local_addr()?;
    let state = Arc::new(ProxyState::new(spine, &config)?);

    let cancel = CancellationToken::new();
    let verifier = (config.integrity.interval_secs > 0).then(|| {
        tokio::spawn(scheduled_verification(
            monitor,
            Duration::from_secs(config.integrity.interval_secs),
            cancel.clone(),
        ))
    });
    let signal = shutdown_signal().context("failed to install signal handlers")?;
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                name = signal => {
                    tracing::info!(signal = name, "shutting down");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    println!("listening on http://{addr}");
    tracing::info!(%addr, upstream = config.upstream_base(), "proxy listening");

    proxy::serve(listener, state, cancel.clone())
        .await
        .context("proxy server failed")?;

    cancel.cancel();
    if let Some(verifier) = verifier {
        let _ = verifier.await;
    }
    tracing::info!("proxy stopped");
    Ok(ExitCode::SUCCESS)
}

/// Resolves on SIGTERM or interrupt. Handlers are installed before this
/// returns, so a signal that arrives before the first poll is not lost.
#[cfg(unix)]
fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    Ok(async move {
        tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "interrupt",
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
        "interrupt"
    })
}

// ---------------------------------------------------------------------------
// one-shot commands
// ---------------------------------------------------------------------------

fn print_snapshot(snapshot: &IntegritySnapshot) {
    match snapshot.violation_at {
        None => println!("status:          secure"),
        Some(at) => println!("status:          compromised at sequence {at}"),
    }
    println!("entries:         {}", snapshot.entries_checked);
    match snapshot.checked_through {
        Some(seq) => println!("checked_through: {seq}"),
        None => println!("checked_through: -"),
    }
    if let Some(reason) = &snapshot.reason {
        println!("reason:          {reason}");
    }
    println!("head:            {}", snapshot.head_hash);
}

fn exit_for(snapshot: &IntegritySnapshot) -> ExitCode {
    if snapshot.is_secure() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_COMPROMISED)
    }
}

fn cmd_verify(config: &SpineConfig) -> Result<ExitCode> {
    let spine = Spine::open(config)?;
    let snapshot = spine.monitor().verify().context("failed to read ledger")?;
    print_snapshot(&snapshot);
    Ok(exit_for(&snapshot))
}

fn cmd_append(
    config: &SpineConfig,
    text: &str,
    identity: Option<&str>,
    rights: RightsClass,
) -> Result<ExitCode> {
    let spine = Spine::open(config)?;
    // Locks the ledger if the stored chain is already broken.
    spine.monitor().verify().context("failed to read ledger")?;

    let identity = identity.unwrap_or(&config.proxy.default_identity);
    let entry = spine
        .interpreter()
        .commit_memory(identity, rights, text)
        .context("append rejected")?;
    println!(
        "appended #{} [{}] {}",
        entry.sequence_number, entry.author_rights, entry.entry_hash
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_query(config: &SpineConfig, text: &str, top_k: Option<usize>) -> Result<ExitCode> {
    let spine = Spine::open(config)?;
    let snapshot = spine.monitor().verify().context("failed to read ledger")?;
    if !snapshot.is_secure() {
        eprintln!("warning: ledger is compromised; nothing verified to search");
    }

    let query = RetrievalQuery::new(text)
        .with_top_k(top_k.unwrap_or(config.retrieval.top_k))
        .with_recency_bias(config.retrieval.recency_bias);
    let results = AttentionRetriever::new(Arc::clone(spine.monitor())).retrieve(&query);

    if results.is_empty() {
        println!("(no memories found)");
    }
    for scored in &results {
        println!(
            "#{} [{}] score={:.3}  {}",
            scored.entry.sequence_number, scored.entry.author_rights, scored.score, scored.entry.content
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_stats(config: &SpineConfig) -> Result<ExitCode> {
    let spine = Spine::open(config)?;
    let snapshot = spine.monitor().verify().context("failed to read ledger")?;
    let entries = spine.ledger().read_all();
    let signed = entries.iter().filter(|e| e.signature.is_some()).count();
    let registry = spine.guard().registry();

    println!("ledger:     {}", config.ledger_path().display());
    println!("entries:    {}", entries.len());
    println!("head:       {}", spine.ledger().head());
    println!("signed:     {signed}/{}", entries.len());
    match snapshot.violation_at {
        None => println!("integrity:  secure"),
        Some(at) => println!("integrity:  compromised at sequence {at}"),
    }
    println!("lock:       {}", spine.monitor().lock_state());
    println!(
        "identities: {} ({})",
        registry.identities.len(),
        config.rights_path().display()
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_export(config: &SpineConfig, path: &Path) -> Result<ExitCode> {
    let store = LedgerStore::open(&config.ledger_path()).context("failed to open ledger")?;
    store
        .export_json_file(path)
        .with_context(|| format!("failed to export to {}", path.display()))?;
    println!(
        "exported {} entries to {}",
        store.entry_count()?,
        path.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_audit(config: &SpineConfig, path: &Path) -> Result<ExitCode> {
    let signer = config.signer()?;
    let snapshot = spine_store::audit_export_file(path, signer.as_ref())
        .with_context(|| format!("failed to read export {}", path.display()))?;
    print_snapshot(&snapshot);
    Ok(exit_for(&snapshot))
}

fn cmd_import(config: &SpineConfig, path: &Path) -> Result<ExitCode> {
    let signer = config.signer()?;
    let mut store = LedgerStore::open(&config.ledger_path()).context("failed to open ledger")?;
    let count = store
        .import_json_file(path, signer.as_ref())
        .with_context(|| format!("failed to import {}", path.display()))?;
    println!("imported {count} entries from {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_rights(config: &SpineConfig, command: &RightsCommand) -> Result<ExitCode> {
    let rights_path = config.rights_path();
    let registry = spine_store::load_registry(&rights_path)
        .with_context(|| format!("failed to load rights {}", rights_path.display()))?;

    match command {
        RightsCommand::Check { identity, class } => {
            match RightsGuard::new(registry).authorize(*class, identity) {
                Ok(()) => {
                    println!("granted: '{identity}' may claim '{class}'");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    println!("denied: {e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        RightsCommand::List => {
            let mut identities: Vec<_> = registry.identities.keys().collect();
            identities.sort();
            for identity in identities {
                println!("{identity}: {}", join_classes(registry.granted(identity)));
            }
            println!("(default): {}", join_classes([RightsClass::LOWEST]));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn join_classes(classes: impl IntoIterator<Item = RightsClass>) -> String {
    classes
        .into_iter()
        .map(RightsClass::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
