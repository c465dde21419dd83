use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use reportoor::config::{Config, SourceMode};
use reportoor::export::health::HealthMetrics;
use reportoor::export::ClickHouseWriter;
use reportoor::invalidate::Invalidator;
use reportoor::load::FactLoader;
use reportoor::migrate::ClickHouseMigrator;
use reportoor::runner::{RunLock, Runner};
use reportoor::source::{CrmSource, ReferenceSource, ReplicaSource, TelemetrySource};

/// Prosthesis usage reporting ETL agent.
#[derive(Parser)]
#[command(name = "reportoor", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("reportoor {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the agent run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting reportoor",
    );

    // Build and run the tokio runtime. Worker pool is CPU x 2: tasks
    // are I/O-heavy and the only CPU-bound stage runs on the blocking
    // pool.
    let workers = std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start health metrics server first so probes respond during
    // migrations and source connection setup.
    let health = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    health
        .start()
        .await
        .context("starting health metrics server")?;

    // Run migrations if enabled.
    if cfg.clickhouse.migrations.enabled {
        run_migrations(&cfg).await?;
    }

    // Open the mart write pool.
    let mut writer = ClickHouseWriter::new(cfg.clickhouse.clone());
    writer.start().await.context("starting ClickHouse writer")?;
    health.clickhouse_connected.set(1.0);

    let pool = writer
        .pool()
        .expect("pool should exist after start")
        .clone();

    // Connect sources per the configured mode.
    let reference = match cfg.sources.mode {
        SourceMode::Direct => {
            let crm = CrmSource::connect(&cfg.sources.crm)
                .await
                .context("connecting to CRM source")?;
            tracing::info!("reference source: direct CRM");
            ReferenceSource::Crm(crm)
        }
        SourceMode::Replica => {
            tracing::info!("reference source: CDC replica");
            ReferenceSource::Replica(ReplicaSource::new(
                pool.clone(),
                cfg.clickhouse.database.clone(),
            ))
        }
    };

    let telemetry = TelemetrySource::connect(&cfg.sources.telemetry)
        .await
        .context("connecting to telemetry source")?;

    let loader = FactLoader::new(
        pool.clone(),
        cfg.clickhouse.database.clone(),
        cfg.clickhouse.batch_size,
    );
    let invalidator = Invalidator::new(cfg.invalidator.clone())?;
    let lock = RunLock::new(pool, cfg.clickhouse.database.clone(), cfg.run_timeout);

    let cancel = CancellationToken::new();
    let runner = Runner::new(
        cfg,
        reference,
        telemetry,
        loader,
        invalidator,
        lock,
        Arc::clone(&health),
    );

    let runner_cancel = cancel.child_token();
    let runner_task = tokio::spawn(async move {
        runner.run_forever(runner_cancel).await;
    });

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown: a run in flight stops at its next task boundary.
    cancel.cancel();
    let _ = runner_task.await;

    writer.stop().await?;
    health.clickhouse_connected.set(0.0);
    health.stop().await?;

    tracing::info!("reportoor stopped");

    Ok(())
}

/// Applies ClickHouse migrations and the configured retention TTL.
async fn run_migrations(cfg: &Config) -> Result<()> {
    tracing::info!("running ClickHouse migrations...");

    let ch_cfg = &cfg.clickhouse;

    // Build a TCP DSN for clickhouse-rs.
    let mut dsn = "tcp://".to_string();
    if !ch_cfg.username.is_empty() {
        dsn.push_str(&ch_cfg.username);
        if !ch_cfg.password.is_empty() {
            dsn.push(':');
            dsn.push_str(&ch_cfg.password);
        }
        dsn.push('@');
    }
    dsn.push_str(&ch_cfg.endpoint);
    dsn.push('/');
    dsn.push_str(&ch_cfg.database);

    let pool = clickhouse_rs::Pool::new(dsn);
    let migrator = ClickHouseMigrator::new(pool);

    migrator
        .up()
        .await
        .context("applying ClickHouse migrations")?;

    migrator
        .apply_retention(cfg.retention_days)
        .await
        .context("applying mart retention")?;

    tracing::info!("ClickHouse migrations applied");

    Ok(())
}
