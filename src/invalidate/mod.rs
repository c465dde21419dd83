use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::InvalidatorConfig;

/// Cache scopes cleared for a user after their facts change.
const SCOPES: [&str; 3] = ["list", "summary", "daily"];

/// Per-user invalidation request body.
#[derive(Debug, Serialize)]
struct InvalidateRequest<'a> {
    user_id: &'a str,
    invalidate_scopes: &'a [&'a str],
}

/// Endpoint-wide invalidation request body, used above the bulk
/// threshold.
#[derive(Debug, Serialize)]
struct BulkInvalidateRequest {
    invalidate_all: bool,
}

/// Outcome of the invalidation fan-out for one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationOutcome {
    /// Requests issued (users, or 1 for a bulk call).
    pub requested: usize,
    /// Requests that failed; never fails the run.
    pub failed: usize,
    /// Whether the bulk path was taken.
    pub bulk: bool,
}

/// Whether the per-run user set is large enough to collapse the fan-out
/// into a single endpoint-wide invalidation.
pub fn use_bulk(users: usize, bulk_threshold: usize) -> bool {
    bulk_threshold > 0 && users > bulk_threshold
}

/// The idempotency token attached to each request.
pub fn idempotency_key(run_id: &str, user_id: &str) -> String {
    format!("{run_id}:{user_id}")
}

/// Best-effort read-cache invalidator.
///
/// Called strictly after the load commits. Failures are logged and
/// counted; the run's outcome never depends on this stage, stale entries
/// expire by cache TTL anyway.
pub struct Invalidator {
    cfg: InvalidatorConfig,
    http: reqwest::Client,
}

impl Invalidator {
    /// Builds the HTTP client with the per-invalidation timeout.
    pub fn new(cfg: InvalidatorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building invalidation HTTP client")?;

        Ok(Self { cfg, http })
    }

    /// Whether an endpoint is configured at all.
    pub fn enabled(&self) -> bool {
        !self.cfg.endpoint.is_empty()
    }

    /// Fans out invalidations for every user touched by the run.
    pub async fn invalidate(&self, run_id: &str, users: &BTreeSet<String>) -> InvalidationOutcome {
        if !self.enabled() || users.is_empty() {
            return InvalidationOutcome::default();
        }

        if use_bulk(users.len(), self.cfg.bulk_threshold) {
            return self.invalidate_all(run_id, users.len()).await;
        }

        let semaphore = Arc::new(Semaphore::new(self.cfg.parallelism.max(1)));
        let calls = users.iter().map(|user_id| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                // Closed only on semaphore.close(), which we never call.
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                self.invalidate_user(run_id, user_id).await
            }
        });

        let results = futures::future::join_all(calls).await;

        let mut outcome = InvalidationOutcome {
            requested: results.len(),
            ..Default::default()
        };

        for result in results {
            if let Err(e) = result {
                outcome.failed += 1;
                warn!(error = %e, "cache invalidation failed");
            }
        }

        info!(
            users = outcome.requested,
            failed = outcome.failed,
            "cache invalidation fan-out finished",
        );

        outcome
    }

    /// Issues one per-user invalidation request.
    async fn invalidate_user(&self, run_id: &str, user_id: &str) -> Result<()> {
        let body = InvalidateRequest {
            user_id,
            invalidate_scopes: &SCOPES,
        };

        let response = self
            .http
            .post(&self.cfg.endpoint)
            .header("Idempotency-Key", idempotency_key(run_id, user_id))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("invalidating cache for {user_id}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("invalidation for {user_id} returned {status}");
        }

        Ok(())
    }

    /// Issues a single endpoint-wide invalidation.
    async fn invalidate_all(&self, run_id: &str, users: usize) -> InvalidationOutcome {
        info!(users, "user set above bulk threshold, invalidating whole cache");

        let result = async {
            let response = self
                .http
                .post(&self.cfg.endpoint)
                .header("Idempotency-Key", idempotency_key(run_id, "all"))
                .json(&BulkInvalidateRequest {
                    invalidate_all: true,
                })
                .send()
                .await
                .context("bulk cache invalidation")?;

            let status = response.status();
            if !status.is_success() {
                anyhow::bail!("bulk invalidation returned {status}");
            }

            Ok::<_, anyhow::Error>(())
        }
        .await;

        let failed = match result {
            Ok(()) => 0,
            Err(e) => {
                warn!(error = %e, "bulk cache invalidation failed");
                1
            }
        };

        InvalidationOutcome {
            requested: 1,
            failed,
            bulk: true,
        }
    }
}
