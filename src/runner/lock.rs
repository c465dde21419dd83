use std::time::Duration;

use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;
use tracing::{debug, warn};

use crate::error::EtlError;
use crate::export::{escape_sql, format_datetime};

/// Key under which the pipeline's single-instance lock lives.
const LOCK_NAME: &str = "reports_etl";

/// Advisory single-instance lock kept in the mart.
///
/// The lock table is a ReplacingMergeTree keyed by lock_name with
/// acquired_at as the version, so the latest acquisition is the holder.
/// The lock is advisory with a TTL equal to the run ceiling: a crashed
/// run's lock expires on its own and the next scheduled run steals it.
pub struct RunLock {
    pool: Pool,
    database: String,
    ttl: Duration,
}

impl RunLock {
    /// Creates a lock handle over an existing ClickHouse pool.
    pub fn new(pool: Pool, database: String, ttl: Duration) -> Self {
        Self {
            pool,
            database,
            ttl,
        }
    }

    /// Attempts to take the lock for `run_id`.
    ///
    /// Fails with [`EtlError::LockContention`] when a non-expired holder
    /// exists, or when the post-insert read shows another writer won the
    /// race.
    pub async fn acquire(&self, run_id: &str, now: DateTime<Utc>) -> Result<(), EtlError> {
        if let Some((holder, expires_at)) = self.current_holder().await? {
            if expires_at > now && holder != run_id {
                debug!(holder = %holder, %expires_at, "lock held by a live run");
                return Err(EtlError::LockContention);
            }
        }

        let expires_at = now + chrono::Duration::seconds(self.ttl.as_secs() as i64);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .map_err(|e| EtlError::TargetUnavailable(format!("getting lock handle: {e}")))?;

        handle
            .execute(self.insert_sql(run_id, now, expires_at).as_str())
            .await
            .map_err(|e| EtlError::TargetUnavailable(format!("acquiring lock: {e}")))?;

        // Confirm ownership: if another instance inserted concurrently,
        // the latest acquired_at wins and we back off.
        match self.current_holder().await? {
            Some((holder, _)) if holder == run_id => Ok(()),
            Some((holder, _)) => {
                debug!(holder = %holder, "lost lock acquisition race");
                Err(EtlError::LockContention)
            }
            None => Err(EtlError::LockContention),
        }
    }

    /// Releases the lock by superseding it with an already-expired row.
    ///
    /// A release failure is harmless: the TTL bounds how long the stale
    /// lock can block the schedule.
    pub async fn release(&self, run_id: &str, now: DateTime<Utc>) -> Result<(), EtlError> {
        match self.current_holder().await {
            Ok(Some((holder, _))) if holder == run_id => {}
            Ok(_) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "could not read lock holder during release");
                return Ok(());
            }
        }

        let mut handle = self
            .pool
            .get_handle()
            .await
            .map_err(|e| EtlError::TargetUnavailable(format!("getting lock handle: {e}")))?;

        handle
            .execute(self.insert_sql(run_id, now, now).as_str())
            .await
            .map_err(|e| EtlError::TargetUnavailable(format!("releasing lock: {e}")))?;

        Ok(())
    }

    /// Reads the latest lock row, if any.
    async fn current_holder(&self) -> Result<Option<(String, DateTime<Utc>)>, EtlError> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .map_err(|e| EtlError::TargetUnavailable(format!("getting lock handle: {e}")))?;

        let block = handle
            .query(self.holder_sql().as_str())
            .fetch_all()
            .await
            .map_err(|e| EtlError::TargetUnavailable(format!("reading lock: {e}")))?;

        let Some(row) = block.rows().next() else {
            return Ok(None);
        };

        let run_id: String = row
            .get("run_id")
            .map_err(|e| EtlError::TargetUnavailable(format!("lock column run_id: {e}")))?;
        let expires_ms: i64 = row
            .get("expires_ms")
            .map_err(|e| EtlError::TargetUnavailable(format!("lock column expires_ms: {e}")))?;

        Ok(Some((
            run_id,
            DateTime::from_timestamp_millis(expires_ms).unwrap_or_default(),
        )))
    }

    fn holder_sql(&self) -> String {
        format!(
            "SELECT run_id, toInt64(toUnixTimestamp64Milli(expires_at)) AS expires_ms \
             FROM {}.etl_run_lock FINAL WHERE lock_name = '{LOCK_NAME}'",
            escape_sql(&self.database),
        )
    }

    fn insert_sql(&self, run_id: &str, acquired_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> String {
        format!(
            "INSERT INTO {}.etl_run_lock (lock_name, run_id, acquired_at, expires_at) \
             VALUES ('{LOCK_NAME}', '{}', {}, {})",
            escape_sql(&self.database),
            escape_sql(run_id),
            format_datetime(acquired_at),
            format_datetime(expires_at),
        )
    }
}
