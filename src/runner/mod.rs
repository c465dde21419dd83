pub mod lock;
pub mod retry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, DurationRound, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::EtlError;
use crate::export::health::HealthMetrics;
use crate::invalidate::{InvalidationOutcome, Invalidator};
use crate::load::FactLoader;
use crate::source::{ReferenceSource, TelemetrySource};
use crate::transform::{run_transform, ReferenceIndex, TransformStats};

pub use lock::RunLock;
pub use retry::retry_with_backoff;

/// Half-open telemetry extraction window [start, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// Computes the window for a run triggered at `now`.
    ///
    /// window_end is `now` truncated to the minute; window_start is
    /// window_end - lookback. Config validation guarantees lookback >=
    /// schedule_period + upstream_delay, so any hour can still be
    /// corrected up to (lookback - period) after its close.
    pub fn at(now: DateTime<Utc>, lookback: Duration) -> Self {
        let end = now
            .duration_trunc(chrono::Duration::minutes(1))
            .unwrap_or(now);
        let start = end - chrono::Duration::seconds(lookback.as_secs() as i64);

        Self { start, end }
    }
}

/// Terminal states of the per-instant run state machine: a pending run
/// becomes running, then exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failed,
    /// A previous run for the interval still held the lock; not retried.
    Skipped,
}

impl RunOutcome {
    /// Label used in run metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Per-run summary carried to the final log line.
#[derive(Debug)]
pub struct RunReport {
    pub reference_rows: usize,
    pub telemetry_rows: usize,
    pub stats: TransformStats,
    pub loaded_rows: usize,
    pub users_touched: usize,
    pub invalidation: InvalidationOutcome,
}

/// The reference extract always rebuilds the full active set: the join
/// index is recreated from scratch each run, so an incremental `since`
/// would orphan telemetry for devices whose reference rows predate the
/// window.
fn reference_since() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// Drives the ETL DAG on a fixed cadence: both extracts in parallel,
/// then transform, load, invalidate in sequence.
///
/// Catch-up is disabled; missed intervals are dropped and only the
/// latest scheduled instant runs. At most one run is in flight at any
/// time, enforced by the advisory lock.
pub struct Runner {
    cfg: Config,
    reference: ReferenceSource,
    telemetry: TelemetrySource,
    loader: FactLoader,
    invalidator: Invalidator,
    lock: RunLock,
    health: Arc<HealthMetrics>,
}

impl Runner {
    /// Wires up a runner over already-connected components.
    pub fn new(
        cfg: Config,
        reference: ReferenceSource,
        telemetry: TelemetrySource,
        loader: FactLoader,
        invalidator: Invalidator,
        lock: RunLock,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            cfg,
            reference,
            telemetry,
            loader,
            invalidator,
            lock,
            health,
        }
    }

    /// Runs the pipeline until cancelled.
    pub async fn run_forever(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.schedule_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            period = ?self.cfg.schedule_period,
            lookback = ?self.cfg.lookback_window,
            source_mode = self.reference.name(),
            "runner started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("runner stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let outcome = self.run_once(Utc::now(), &cancel).await;
                    debug!(outcome = outcome.as_str(), "run reached terminal state");
                }
            }
        }
    }

    /// Executes a single scheduled instant through the state machine.
    pub async fn run_once(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> RunOutcome {
        let window = Window::at(now, self.cfg.lookback_window);
        let run_id = window.end.format("%Y%m%dT%H%MZ").to_string();

        info!(
            run_id = %run_id,
            window_start = %window.start,
            window_end = %window.end,
            "run starting",
        );

        match self.lock.acquire(&run_id, now).await {
            Ok(()) => {}
            Err(EtlError::LockContention) => {
                self.health.lock_contention.inc();
                info!(run_id = %run_id, "previous run still holds the lock, skipping");
                return self.finish(RunOutcome::Skipped, now);
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "lock acquisition failed");
                return self.finish(RunOutcome::Failed, now);
            }
        }

        let started = Instant::now();

        // Cancellation takes effect at the next task boundary; batch
        // commits are atomic so the mart stays consistent.
        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.cfg.run_timeout, self.execute(&run_id, window)) => {
                Some(result)
            }
        };

        if let Err(e) = self.lock.release(&run_id, Utc::now()).await {
            warn!(run_id = %run_id, error = %e, "lock release failed, will expire by TTL");
        }

        let outcome = match result {
            None => {
                info!(run_id = %run_id, "run cancelled");
                RunOutcome::Failed
            }
            Some(Err(_)) => {
                let e = EtlError::RunTimeout(self.cfg.run_timeout);
                error!(run_id = %run_id, error = %e, "run exceeded ceiling");
                RunOutcome::Failed
            }
            Some(Ok(Err(e))) => {
                error!(run_id = %run_id, error = %e, "run failed");
                RunOutcome::Failed
            }
            Some(Ok(Ok(report))) => {
                self.health
                    .run_duration
                    .observe(started.elapsed().as_secs_f64());

                info!(
                    run_id = %run_id,
                    reference_rows = report.reference_rows,
                    telemetry_rows = report.telemetry_rows,
                    facts_loaded = report.loaded_rows,
                    orphans = report.stats.orphans,
                    invalid = report.stats.invalid,
                    users_touched = report.users_touched,
                    invalidation_failed = report.invalidation.failed,
                    "run succeeded",
                );
                RunOutcome::Success
            }
        };

        self.finish(outcome, now)
    }

    /// Records terminal-state metrics.
    fn finish(&self, outcome: RunOutcome, now: DateTime<Utc>) -> RunOutcome {
        self.health
            .runs_total
            .with_label_values(&[outcome.as_str()])
            .inc();
        self.health.last_run_timestamp.set(now.timestamp() as f64);
        outcome
    }

    /// The DAG body: extracts in parallel, then transform, load,
    /// invalidate in sequence.
    async fn execute(&self, run_id: &str, window: Window) -> Result<RunReport, EtlError> {
        let reference = &self.reference;
        let telemetry = &self.telemetry;
        let extract_timeout = self.cfg.timeouts.extract;
        let since = reference_since();

        let ref_retries = self
            .health
            .task_retries
            .with_label_values(&["extract_reference"]);
        let tel_retries = self
            .health
            .task_retries
            .with_label_values(&["extract_telemetry"]);

        let extract_started = Instant::now();

        let reference_task = retry_with_backoff(
            "extract_reference",
            self.cfg.retry,
            Some(&ref_retries),
            move || async move {
                match tokio::time::timeout(extract_timeout, reference.extract_reference(since))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(EtlError::SourceUnavailable(format!(
                        "reference extract timed out after {extract_timeout:?}"
                    ))),
                }
            },
        );

        let telemetry_task = retry_with_backoff(
            "extract_telemetry",
            self.cfg.retry,
            Some(&tel_retries),
            move || async move {
                match tokio::time::timeout(
                    extract_timeout,
                    telemetry.extract_telemetry(window.start, window.end),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(EtlError::SourceUnavailable(format!(
                        "telemetry extract timed out after {extract_timeout:?}"
                    ))),
                }
            },
        );

        let (reference_rows, telemetry_rows) = tokio::try_join!(reference_task, telemetry_task)?;

        self.health
            .task_duration
            .with_label_values(&["extract"])
            .observe(extract_started.elapsed().as_secs_f64());
        self.health
            .rows_extracted
            .with_label_values(&["reference"])
            .inc_by(reference_rows.len() as f64);
        self.health
            .rows_extracted
            .with_label_values(&["telemetry"])
            .inc_by(telemetry_rows.len() as f64);

        let reference_count = reference_rows.len();
        let telemetry_count = telemetry_rows.len();

        // Transform is CPU-bound and never suspends; run it off the
        // scheduler threads.
        let processed_at = Utc::now();
        let transform_started = Instant::now();
        let transform = tokio::task::spawn_blocking(move || {
            let index = ReferenceIndex::build(reference_rows);
            run_transform(&telemetry_rows, &index, processed_at)
        });

        let (facts, stats) = match tokio::time::timeout(self.cfg.timeouts.transform, transform)
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                return Err(EtlError::SourceUnavailable(format!(
                    "transform task failed: {e}"
                )));
            }
            Err(_) => return Err(EtlError::RunTimeout(self.cfg.timeouts.transform)),
        };

        self.health
            .task_duration
            .with_label_values(&["transform"])
            .observe(transform_started.elapsed().as_secs_f64());
        self.health.orphan_rows.inc_by(stats.orphans as f64);
        self.health.invalid_metric_rows.inc_by(stats.invalid as f64);

        // Load, retried wholesale; replayed batches collapse under the
        // version-wins merge.
        let loader = &self.loader;
        let load_timeout = self.cfg.timeouts.load;
        let facts_ref = &facts;
        let load_retries = self.health.task_retries.with_label_values(&["load"]);
        let load_started = Instant::now();

        let load_result = retry_with_backoff(
            "load",
            self.cfg.retry,
            Some(&load_retries),
            move || async move {
                match tokio::time::timeout(load_timeout, loader.load(facts_ref)).await {
                    Ok(result) => result,
                    Err(_) => Err(EtlError::TargetUnavailable(format!(
                        "load timed out after {load_timeout:?}"
                    ))),
                }
            },
        )
        .await?;

        self.health
            .task_duration
            .with_label_values(&["load"])
            .observe(load_started.elapsed().as_secs_f64());
        self.health
            .rows_loaded
            .inc_by(load_result.inserted_rows as f64);

        // Invalidation happens strictly after the load commits and never
        // fails the run.
        let invalidate_started = Instant::now();
        let invalidation = self
            .invalidator
            .invalidate(run_id, &load_result.user_ids)
            .await;

        self.health
            .task_duration
            .with_label_values(&["invalidate"])
            .observe(invalidate_started.elapsed().as_secs_f64());
        self.health
            .users_invalidated
            .inc_by(invalidation.requested.saturating_sub(invalidation.failed) as f64);
        self.health
            .invalidation_failures
            .inc_by(invalidation.failed as f64);

        Ok(RunReport {
            reference_rows: reference_count,
            telemetry_rows: telemetry_count,
            stats,
            loaded_rows: load_result.inserted_rows,
            users_touched: load_result.user_ids.len(),
            invalidation,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_window_truncates_to_minute() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 17, 42).unwrap();
        let window = Window::at(now, Duration::from_secs(2 * 3600));

        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 1, 15, 10, 17, 0).unwrap());
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 1, 15, 8, 17, 0).unwrap());
    }

    #[test]
    fn test_window_already_on_minute_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 15, 0).unwrap();
        let window = Window::at(now, Duration::from_secs(3600));

        assert_eq!(window.end, now);
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 1, 15, 9, 15, 0).unwrap());
    }

    #[test]
    fn test_run_id_is_stable_per_logical_interval() {
        // Two triggers inside the same minute map to the same run id,
        // so invalidation idempotency tokens match across a retry.
        let lookback = Duration::from_secs(7200);
        let a = Window::at(Utc.with_ymd_and_hms(2024, 1, 15, 10, 15, 3).unwrap(), lookback);
        let b = Window::at(Utc.with_ymd_and_hms(2024, 1, 15, 10, 15, 59).unwrap(), lookback);

        assert_eq!(
            a.end.format("%Y%m%dT%H%MZ").to_string(),
            b.end.format("%Y%m%dT%H%MZ").to_string(),
        );
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(RunOutcome::Success.as_str(), "success");
        assert_eq!(RunOutcome::Failed.as_str(), "failed");
        assert_eq!(RunOutcome::Skipped.as_str(), "skipped");
    }

    #[test]
    fn test_reference_since_is_epoch() {
        assert_eq!(reference_since().timestamp(), 0);
    }
}
