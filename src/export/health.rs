use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for pipeline health and observability.
///
/// All metrics use the "reportoor" namespace. Row-level drop counters
/// (orphans, invalid metrics) are the contract for the transform stage's
/// partial-failure handling; run counters expose the scheduler's state
/// machine outcomes.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Pipeline runs by terminal outcome (success/failed/skipped).
    pub runs_total: CounterVec,
    /// Wall-clock duration of whole runs.
    pub run_duration: Histogram,
    /// Wall-clock duration per task (extract_reference, extract_telemetry,
    /// transform, load, invalidate).
    pub task_duration: HistogramVec,
    /// Task retry attempts beyond the first, by task.
    pub task_retries: CounterVec,
    /// Rows pulled per source (reference/telemetry).
    pub rows_extracted: CounterVec,
    /// Fact rows inserted into the mart.
    pub rows_loaded: Counter,
    /// Telemetry rows dropped for a missing active prosthesis.
    pub orphan_rows: Counter,
    /// Telemetry rows dropped for out-of-range metrics.
    pub invalid_metric_rows: Counter,
    /// Users invalidated in the read cache.
    pub users_invalidated: Counter,
    /// Invalidation requests that failed (best-effort, never fails a run).
    pub invalidation_failures: Counter,
    /// Runs skipped because a previous run held the lock.
    pub lock_contention: Counter,
    /// Unix time of the last run that reached a terminal state.
    pub last_run_timestamp: Gauge,
    /// Whether the mart connection is established (1=yes, 0=no).
    pub clickhouse_connected: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let runs_total = CounterVec::new(
            Opts::new("runs_total", "Pipeline runs by terminal outcome.")
                .namespace("reportoor"),
            &["outcome"],
        )?;
        let run_duration = Histogram::with_opts(
            HistogramOpts::new("run_duration_seconds", "Wall-clock duration of whole runs.")
                .namespace("reportoor")
                .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0]),
        )?;
        let task_duration = HistogramVec::new(
            HistogramOpts::new("task_duration_seconds", "Wall-clock duration per task.")
                .namespace("reportoor")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
            &["task"],
        )?;
        let task_retries = CounterVec::new(
            Opts::new(
                "task_retries_total",
                "Task retry attempts beyond the first, by task.",
            )
            .namespace("reportoor"),
            &["task"],
        )?;
        let rows_extracted = CounterVec::new(
            Opts::new("rows_extracted_total", "Rows pulled per source.").namespace("reportoor"),
            &["source"],
        )?;
        let rows_loaded = Counter::with_opts(
            Opts::new("rows_loaded_total", "Fact rows inserted into the mart.")
                .namespace("reportoor"),
        )?;
        let orphan_rows = Counter::with_opts(
            Opts::new(
                "orphan_rows_total",
                "Telemetry rows dropped for a missing active prosthesis.",
            )
            .namespace("reportoor"),
        )?;
        let invalid_metric_rows = Counter::with_opts(
            Opts::new(
                "invalid_metric_rows_total",
                "Telemetry rows dropped for out-of-range metrics.",
            )
            .namespace("reportoor"),
        )?;
        let users_invalidated = Counter::with_opts(
            Opts::new(
                "users_invalidated_total",
                "Users invalidated in the read cache.",
            )
            .namespace("reportoor"),
        )?;
        let invalidation_failures = Counter::with_opts(
            Opts::new(
                "invalidation_failures_total",
                "Invalidation requests that failed.",
            )
            .namespace("reportoor"),
        )?;
        let lock_contention = Counter::with_opts(
            Opts::new(
                "lock_contention_total",
                "Runs skipped because a previous run held the lock.",
            )
            .namespace("reportoor"),
        )?;
        let last_run_timestamp = Gauge::with_opts(
            Opts::new(
                "last_run_timestamp_seconds",
                "Unix time of the last run that reached a terminal state.",
            )
            .namespace("reportoor"),
        )?;
        let clickhouse_connected = Gauge::with_opts(
            Opts::new(
                "clickhouse_connected",
                "Whether the mart connection is established (1=yes, 0=no).",
            )
            .namespace("reportoor"),
        )?;

        registry.register(Box::new(runs_total.clone()))?;
        registry.register(Box::new(run_duration.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(task_retries.clone()))?;
        registry.register(Box::new(rows_extracted.clone()))?;
        registry.register(Box::new(rows_loaded.clone()))?;
        registry.register(Box::new(orphan_rows.clone()))?;
        registry.register(Box::new(invalid_metric_rows.clone()))?;
        registry.register(Box::new(users_invalidated.clone()))?;
        registry.register(Box::new(invalidation_failures.clone()))?;
        registry.register(Box::new(lock_contention.clone()))?;
        registry.register(Box::new(last_run_timestamp.clone()))?;
        registry.register(Box::new(clickhouse_connected.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            runs_total,
            run_duration,
            task_duration,
            task_retries,
            rows_extracted,
            rows_loaded,
            orphan_rows,
            invalid_metric_rows,
            users_invalidated,
            invalidation_failures,
            lock_contention,
            last_run_timestamp,
            clickhouse_connected,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

struct AppState {
    registry: Registry,
}

/// Serves the Prometheus text exposition format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = state.registry.gather();

    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::error!(error = %e, "encoding metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
    }

    (StatusCode::OK, buf)
}

/// Liveness probe.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
