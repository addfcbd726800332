//! # rs-onyx CLI
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rs-onyx sync` | Run, resume, or incrementally continue a sync |
//! | `rs-onyx check` | Verify RepairShopr credentials |
//! | `rs-onyx status` | Print the checkpoint |
//! | `rs-onyx ids` | Print every document id the source would produce |
//!
//! ## Exit codes
//!
//! `0` on success, `1` on a fatal error, `130` when interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rs_onyx_bridge::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use rs_onyx_bridge::config::{self, CheckpointBackend, Config};
use rs_onyx_bridge::destination::{Destination, DryRunDestination, OnyxClient};
use rs_onyx_bridge::error::SyncError;
use rs_onyx_bridge::fetcher::list_doc_ids;
use rs_onyx_bridge::logging;
use rs_onyx_bridge::models::EntityType;
use rs_onyx_bridge::progress::{failure_breakdown, format_number, ProgressMode};
use rs_onyx_bridge::rate_limit::RateBudget;
use rs_onyx_bridge::retry::RetryPolicy;
use rs_onyx_bridge::source::{RepairShoprClient, SourceApi};
use rs_onyx_bridge::sqlite_store::SqliteCheckpointStore;
use rs_onyx_bridge::status;
use rs_onyx_bridge::sync::{RunOptions, SyncEngine};

const EXIT_FATAL: u8 = 1;
const EXIT_CANCELLED: u8 = 130;

/// Sync RepairShopr customers, assets, tickets and invoices into Onyx.
///
/// Configuration comes from a TOML file (default
/// `~/.onyx-rs-bridge/config.toml`) overridden by `RS_*` / `ONYX_*`
/// environment variables.
#[derive(Parser)]
#[command(name = "rs-onyx", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync records into Onyx.
    ///
    /// Resumes an interrupted run from its checkpoint. After a completed
    /// run, only records updated since that run started are synced.
    Sync {
        /// Discard the checkpoint and resync everything.
        #[arg(long, conflicts_with = "since")]
        full: bool,

        /// Only sync records updated after this instant (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Build documents but send nothing to Onyx.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Verify RepairShopr credentials.
    Check,

    /// Show the sync checkpoint.
    Status,

    /// Print the document id of every record of the enabled entity types.
    Ids,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match config::load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };
    if let Err(e) = logging::init(&cfg.logging) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(EXIT_FATAL);
    }

    let result = match cli.command {
        Commands::Sync {
            full,
            since,
            dry_run,
            progress,
        } => run_sync(&cfg, full, since, dry_run, progress).await,
        Commands::Check => run_check(&cfg).await,
        Commands::Status => run_status(&cfg).await,
        Commands::Ids => run_ids(&cfg).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run_sync(
    cfg: &Config,
    full: bool,
    since: Option<String>,
    dry_run: bool,
    progress: Option<ProgressMode>,
) -> anyhow::Result<ExitCode> {
    let since = since.as_deref().map(parse_since).transpose()?;

    let (source, budget) = source_client(cfg)?;
    let destination: Arc<dyn Destination> = if dry_run {
        Arc::new(DryRunDestination::new())
    } else {
        let (url, key) = cfg.destination_credentials()?;
        Arc::new(OnyxClient::new(&cfg.destination, &url, key)?)
    };
    let mut store = open_store(cfg).await?;
    if dry_run {
        let current = store.load().await?;
        store = Arc::new(MemoryCheckpointStore::new(current));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next safe point");
            on_signal.cancel();
        }
    });

    let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
    let engine = SyncEngine::new(cfg, source, destination, store)
        .with_progress(reporter)
        .with_cancel(cancel)
        .with_rate_budget(budget);

    match engine.run(RunOptions { full, since }).await {
        Ok(report) => {
            let counts = report.run;
            println!(
                "{} {}: {} processed, {} delivered, {} failed{}, {} skipped",
                if dry_run { "Dry run" } else { "Sync" },
                if report.resumed { "resumed and completed" } else { "completed" },
                format_number(counts.processed),
                format_number(counts.delivered),
                format_number(counts.failed),
                failure_breakdown(&report.failures),
                format_number(counts.skipped),
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(SyncError::Cancelled) => {
            warn!("sync cancelled; checkpoint left at the last delivered batch");
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
        Err(e) => Err(anyhow::Error::new(e).context("sync aborted")),
    }
}

async fn run_check(cfg: &Config) -> anyhow::Result<ExitCode> {
    let (source, _) = source_client(cfg)?;
    let identity = source.check().await.context("RepairShopr check failed")?;
    println!(
        "Connected to {}.repairshopr.com as {} (user id {})",
        cfg.source.subdomain,
        identity.user_name.as_deref().unwrap_or("unknown user"),
        identity
            .user_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "?".to_string())
    );
    Ok(ExitCode::SUCCESS)
}

async fn run_status(cfg: &Config) -> anyhow::Result<ExitCode> {
    let store = open_store(cfg).await?;
    let checkpoint = store.load().await?;
    print!("{}", status::render(checkpoint.as_ref(), &store.describe()));
    Ok(ExitCode::SUCCESS)
}

async fn run_ids(cfg: &Config) -> anyhow::Result<ExitCode> {
    let (source, _) = source_client(cfg)?;
    let retry = RetryPolicy::from(&cfg.retry);
    let cancel = CancellationToken::new();
    for entity in EntityType::ALL {
        if !cfg.sync.includes(entity) {
            continue;
        }
        let ids = list_doc_ids(
            source.as_ref(),
            entity,
            cfg.source.page_size,
            retry,
            cancel.clone(),
        )
        .await
        .with_context(|| format!("listing {} ids", entity))?;
        info!(entity = %entity, count = ids.len(), "listed ids");
        for id in ids {
            println!("{}", id);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn source_client(cfg: &Config) -> anyhow::Result<(Arc<dyn SourceApi>, Arc<RateBudget>)> {
    let api_key = cfg.source_credentials()?;
    let budget = Arc::new(RateBudget::new(
        cfg.source.requests_per_minute,
        cfg.source.burst_capacity,
    ));
    let client: Arc<dyn SourceApi> =
        Arc::new(RepairShoprClient::new(&cfg.source, api_key, budget.clone())?);
    Ok((client, budget))
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    let path = &cfg.checkpoint.path;
    let store: Arc<dyn CheckpointStore> = match cfg.checkpoint.backend {
        CheckpointBackend::File => Arc::new(FileCheckpointStore::new(path.clone())),
        CheckpointBackend::Sqlite => Arc::new(
            SqliteCheckpointStore::open(path)
                .await
                .with_context(|| format!("opening checkpoint database {}", path.display()))?
                .with_name(cfg.checkpoint.name.clone()),
        ),
    };
    Ok(store)
}

/// RFC 3339, or a bare date taken as midnight UTC.
fn parse_since(s: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("--since must be RFC 3339 or YYYY-MM-DD, got '{}'", s))?;
    date.and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .with_context(|| format!("invalid date '{}'", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_accepts_date_or_timestamp() {
        let a = parse_since("2024-03-01").unwrap();
        assert_eq!(a.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        let b = parse_since("2024-03-01T12:30:00+02:00").unwrap();
        assert_eq!(b.to_rfc3339(), "2024-03-01T10:30:00+00:00");
        assert!(parse_since("yesterday").is_err());
    }

    #[test]
    fn cli_parses() {
        let cli = Cli::try_parse_from(["rs-onyx", "sync", "--full", "--progress", "json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Sync {
                full: true,
                progress: Some(ProgressMode::Json),
                ..
            }
        ));
        assert!(Cli::try_parse_from(["rs-onyx", "sync", "--full", "--since", "2024-01-01"]).is_err());
    }
}
