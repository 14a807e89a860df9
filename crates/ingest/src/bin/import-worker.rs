//! import-worker: run streaming imports for a set of sources.
//!
//! Loads source descriptors from a TOML catalog, admits one import job per
//! source through the submission gate, waits for the jobs (or Ctrl-C) and
//! drains the pool before exiting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

use sluice_core::Config;
use sluice_ingest::{ImportCoordinator, MemoryCatalog};
use sluice_pool::{CircuitBreaker, PoolConfig, SubmissionGate, WorkerPool};
use sluice_storage::{BatchSink, MemorySink, ObjectFileStore, PgSink, RowKeyGenerator, Sink, StorageBackend};

// ── CLI ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SinkKind {
    /// Keep rows in memory (dry run).
    Memory,
    /// Write to the configured PostgreSQL database.
    Postgres,
}

/// Streaming delimited-file importer.
#[derive(Parser, Debug)]
#[command(name = "import-worker", version, about)]
struct Cli {
    /// Path to the source catalog (TOML, `[[sources]]` tables).
    #[arg(long, env = "SLUICE_CATALOG", default_value = "config/sources.toml")]
    catalog: PathBuf,

    /// Destination store.
    #[arg(long, env = "SLUICE_SINK", value_enum, default_value_t = SinkKind::Postgres)]
    sink: SinkKind,

    /// Provision destination tables before writing.
    #[arg(long)]
    first_time: bool,

    /// Seconds to wait for all imports to finish.
    #[arg(long, env = "SLUICE_WAIT_TIMEOUT", default_value_t = 3600)]
    wait_timeout: u64,

    /// Seconds each running import gets to stop gracefully on drain.
    #[arg(long, env = "SLUICE_DRAIN_TIMEOUT", default_value_t = 10)]
    drain_timeout: u64,

    /// Source ids to import.
    #[arg(required = true)]
    sources: Vec<String>,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    sluice_core::config::load_dotenv();
    let cli = Cli::parse();

    let config = Config::from_env();
    config.validate()?;
    config.log_summary();

    let catalog = Arc::new(MemoryCatalog::from_toml_file(&cli.catalog)?);

    let backend = StorageBackend::from_config(&config)?;
    info!(backend = %backend.describe(), "file store ready");
    let files = Arc::new(ObjectFileStore::from_backend(&backend));

    let sink: Arc<dyn Sink> = match cli.sink {
        SinkKind::Memory => Arc::new(MemorySink::new()),
        SinkKind::Postgres => Arc::new(PgSink::connect(&config.postgres).await?),
    };
    let keys = RowKeyGenerator::new(config.import.node_id)?;
    let batch = Arc::new(BatchSink::new(sink, keys));

    let pool = WorkerPool::build(PoolConfig::from(&config.import_pool))?;
    let gate = Arc::new(SubmissionGate::new(pool, CircuitBreaker::from(&config.breaker)));

    let coordinator = ImportCoordinator::new(catalog, files, batch, gate)
        .with_chunk_settings(config.chunk.clone())
        .with_import_settings(config.import.clone());

    let mut accepted = 0;
    for source in &cli.sources {
        match coordinator.submit(source, cli.first_time).await {
            Ok(true) => accepted += 1,
            Ok(false) => warn!(source = %source, "import not admitted, retry later"),
            Err(e) => error!(source = %source, error = %e, "import refused"),
        }
    }
    info!(accepted, requested = cli.sources.len(), "imports submitted");

    tokio::select! {
        idle = coordinator.await_idle(Duration::from_secs(cli.wait_timeout)) => {
            if !idle {
                warn!(running = coordinator.in_flight().len(), "imports still running after wait timeout");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, draining");
        }
    }

    if !coordinator.shutdown(Duration::from_secs(cli.drain_timeout)).await {
        anyhow::bail!("import pool did not drain");
    }
    info!("import-worker exited cleanly");
    Ok(())
}
