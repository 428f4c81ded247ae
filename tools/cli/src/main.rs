//! Lifetrack CLI - sync diagnostics and offline queue management.
//!
//! This tool drives the sync engine from a terminal: run domain syncs,
//! inspect freshness and breaker health, and act on queued writes.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lifetrack_common::Domain;
use lifetrack_storage::FileStore;
use lifetrack_sync::{SyncConfig, SyncCoordinator, SyncOutcome, SyncSnapshot};

#[derive(Parser)]
#[command(name = "lifetrack")]
#[command(about = "Lifetrack - Sync engine diagnostics")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Config file (JSON). Defaults to the platform config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the offline queue and cached data.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync one domain, or every domain.
    Sync {
        /// Domain to sync (default: all).
        #[arg(long)]
        domain: Option<Domain>,

        /// Sync even if the data is still fresh.
        #[arg(short, long)]
        force: bool,
    },

    /// Show per-domain sync state.
    Status {
        /// Print the snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Inspect and manage the offline queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Show circuit breaker diagnostics.
    Breaker,
}

#[derive(Subcommand)]
enum QueueAction {
    /// List pending operations.
    List,
    /// List permanently failed operations.
    Failed,
    /// Move a failed operation back to pending.
    Retry { id: String },
    /// Drop a failed operation.
    Discard { id: String },
    /// Drop every failed operation.
    Clear,
    /// Replay pending operations now.
    Process,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => default_dir(dirs::config_dir())?.join("config.json"),
    };
    let config = load_config(&config_path)?;

    let data_dir = match cli.data_dir {
        Some(path) => path,
        None => default_dir(dirs::data_dir())?,
    };
    let coordinator = open_coordinator(config, &data_dir).await?;

    match cli.command {
        Commands::Sync { domain, force } => cmd_sync(&coordinator, domain, force).await,

        Commands::Status { json } => cmd_status(&coordinator, json),

        Commands::Queue { action } => cmd_queue(&coordinator, action).await,

        Commands::Breaker => cmd_breaker(&coordinator),
    }
}

fn default_dir(base: Option<PathBuf>) -> Result<PathBuf> {
    base.map(|dir| dir.join("lifetrack"))
        .context("Could not determine a platform directory; pass it explicitly")
}

/// Load the config file if present, then apply environment overrides.
fn load_config(path: &Path) -> Result<SyncConfig> {
    let mut config = if path.exists() {
        SyncConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?
    } else {
        info!("No config at {}, using defaults", path.display());
        SyncConfig::default()
    };

    config.apply_env();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn open_coordinator(config: SyncConfig, data_dir: &Path) -> Result<SyncCoordinator> {
    let store = FileStore::new(data_dir)
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;

    SyncCoordinator::connect(config, Arc::new(store))
        .await
        .context("Failed to start sync engine")
}

/// Run a sync and print the resulting state.
async fn cmd_sync(coordinator: &SyncCoordinator, domain: Option<Domain>, force: bool) -> Result<()> {
    match domain {
        Some(domain) => {
            let outcome = coordinator.sync(domain).await;
            match &outcome {
                SyncOutcome::Fresh(_) => println!("{}: synced", domain),
                SyncOutcome::FromCache { error, .. } => {
                    println!("{}: showing saved data ({})", domain, error)
                }
                SyncOutcome::Failed { error } => println!("{}: failed ({})", domain, error),
            }
            if let Some(model) = outcome.model() {
                println!("{}", serde_json::to_string_pretty(&model.payload)?);
            }
        }
        None => {
            let timeout = coordinator.config().sync_all_timeout;
            let snapshot = coordinator.sync_all_bounded(force, timeout).await;
            if snapshot.is_syncing_all {
                println!("Some domains are still syncing after {:?}.", timeout);
            }
            print_snapshot(&snapshot);
        }
    }

    Ok(())
}

/// Show per-domain state.
fn cmd_status(coordinator: &SyncCoordinator, json: bool) -> Result<()> {
    coordinator.refresh_staleness();
    let snapshot = coordinator.snapshot();

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot);
    }
    Ok(())
}

/// Offline queue management.
async fn cmd_queue(coordinator: &SyncCoordinator, action: QueueAction) -> Result<()> {
    let queue = coordinator.queue();

    match action {
        QueueAction::List => {
            let pending = queue.pending_items().await;
            if pending.is_empty() {
                println!("No pending operations.");
            }
            for op in pending {
                println!(
                    "  {}  {:<15} {} (retries: {}{})",
                    op.id,
                    op.kind.as_str(),
                    op.description,
                    op.retry_count,
                    op.last_error
                        .map(|e| format!(", last error: {}", e))
                        .unwrap_or_default()
                );
            }
        }
        QueueAction::Failed => {
            let failed = queue.get_failed_items().await;
            if failed.is_empty() {
                println!("No failed operations.");
            }
            for entry in failed {
                println!(
                    "  {}  {:<15} {} (failed {}: {})",
                    entry.id,
                    entry.kind.as_str(),
                    entry.description,
                    format_time(Some(entry.failed_at)),
                    entry.last_error.unwrap_or_default()
                );
            }
        }
        QueueAction::Retry { id } => {
            if queue.retry_failed_item(&id).await? {
                println!("Operation {} queued for retry.", id);
            } else {
                println!("No failed operation {}.", id);
            }
        }
        QueueAction::Discard { id } => {
            if queue.discard_failed_item(&id).await? {
                println!("Operation {} discarded.", id);
            } else {
                println!("No failed operation {}.", id);
            }
        }
        QueueAction::Clear => {
            let removed = queue.clear_failed_items().await?;
            println!("Removed {} failed operations.", removed);
        }
        QueueAction::Process => {
            let report = queue
                .process_queue()
                .await
                .context("Queue pass could not be saved")?;
            println!(
                "Delivered {}, deferred {}, failed {}.",
                report.delivered, report.deferred, report.failed_permanently
            );
            println!("{} operations still pending.", queue.get_queue_count().await);
        }
    }

    Ok(())
}

/// Show breaker diagnostics.
fn cmd_breaker(coordinator: &SyncCoordinator) -> Result<()> {
    let diagnostics = coordinator.breaker_diagnostics();

    println!("Circuit breaker:");
    println!("  State:         {:?}", diagnostics.state);
    println!("  Failures:      {}", diagnostics.failure_count);
    println!("  Last failure:  {}", format_time(diagnostics.last_failure));
    println!("  Last success:  {}", format_time(diagnostics.last_success));

    Ok(())
}

fn print_snapshot(snapshot: &SyncSnapshot) {
    for (domain, state) in &snapshot.domains {
        let source = if state.is_from_cache { "cached" } else { "live" };
        println!(
            "  {:<10} {:<6} {:<7} last sync: {}{}",
            domain.as_str(),
            state.staleness.as_str(),
            source,
            format_time(state.last_success),
            state
                .last_error
                .as_ref()
                .map(|e| format!("  error: {}", e))
                .unwrap_or_default()
        );
    }
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = load_config(&temp.path().join("config.json")).unwrap();
        assert_eq!(config.max_concurrent_syncs, 4);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"max_concurrent_syncs": 0}}"#).unwrap();

        let error = load_config(&path).unwrap_err();
        assert!(error.to_string().contains("Failed to load config"));
    }

    #[test]
    fn test_cli_parses_queue_commands() {
        let cli = Cli::try_parse_from(["lifetrack", "queue", "retry", "op-1"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Queue {
                action: QueueAction::Retry { .. }
            }
        ));

        let cli = Cli::try_parse_from(["lifetrack", "sync", "--domain", "finance", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Sync {
                domain: Some(Domain::Finance),
                force: true
            }
        ));
    }

    #[tokio::test]
    async fn test_open_coordinator_creates_data_dir() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path().join("data");

        let coordinator = open_coordinator(SyncConfig::default(), &data_dir)
            .await
            .unwrap();

        assert!(data_dir.exists());
        assert_eq!(coordinator.queue().get_queue_count().await, 0);
    }
}
