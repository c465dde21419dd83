use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;
use tracing::debug;

use crate::error::EtlError;
use crate::export::{escape_sql, format_datetime};
use crate::model::CustomerProsthesis;

/// Reference source backed by the CDC replica in ClickHouse.
///
/// The replica is populated by log-based replication from the CRM and
/// deduplicated by a monotonic version; `FINAL` collapses it to the same
/// logical view the direct adapter produces. The CRM database is never
/// touched in this mode.
pub struct ReplicaSource {
    pool: Pool,
    database: String,
}

impl ReplicaSource {
    /// Creates a replica reader over an existing ClickHouse pool.
    pub fn new(pool: Pool, database: String) -> Self {
        Self { pool, database }
    }

    /// Reads the deduplicated customer-prosthesis view from the replica.
    pub async fn extract_reference(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<CustomerProsthesis>, EtlError> {
        let sql = format!(
            "SELECT \
             user_id, customer_name, customer_email, customer_region, customer_branch, \
             prosthesis_id, prosthesis_serial, chip_id, prosthesis_model, \
             prosthesis_category, firmware_version, \
             toInt64(toUnixTimestamp(last_updated_at)) AS last_updated_ts \
             FROM {}.cdc_customer_data FINAL \
             WHERE chip_id != '' AND last_updated_at >= toDateTime64({}, 3)",
            escape_sql(&self.database),
            format_datetime(since),
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .map_err(|e| EtlError::SourceUnavailable(format!("connecting to replica: {e}")))?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .map_err(|e| EtlError::SourceUnavailable(format!("querying replica: {e}")))?;

        fn column_err(name: &str, e: clickhouse_rs::errors::Error) -> EtlError {
            EtlError::SchemaMismatch(format!("replica column {name}: {e}"))
        }

        let mut rows = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let last_updated_ts: i64 = row
                .get("last_updated_ts")
                .map_err(|e| column_err("last_updated_ts", e))?;

            rows.push(CustomerProsthesis {
                user_id: row.get("user_id").map_err(|e| column_err("user_id", e))?,
                customer_name: row
                    .get("customer_name")
                    .map_err(|e| column_err("customer_name", e))?,
                customer_email: row
                    .get("customer_email")
                    .map_err(|e| column_err("customer_email", e))?,
                customer_region: row
                    .get("customer_region")
                    .map_err(|e| column_err("customer_region", e))?,
                customer_branch: row
                    .get("customer_branch")
                    .map_err(|e| column_err("customer_branch", e))?,
                prosthesis_id: row
                    .get("prosthesis_id")
                    .map_err(|e| column_err("prosthesis_id", e))?,
                prosthesis_serial: row
                    .get("prosthesis_serial")
                    .map_err(|e| column_err("prosthesis_serial", e))?,
                chip_id: row.get("chip_id").map_err(|e| column_err("chip_id", e))?,
                prosthesis_model: row
                    .get("prosthesis_model")
                    .map_err(|e| column_err("prosthesis_model", e))?,
                prosthesis_category: row
                    .get("prosthesis_category")
                    .map_err(|e| column_err("prosthesis_category", e))?,
                firmware_version: row
                    .get("firmware_version")
                    .map_err(|e| column_err("firmware_version", e))?,
                last_updated_at: DateTime::from_timestamp(last_updated_ts, 0).unwrap_or_default(),
            });
        }

        debug!(rows = rows.len(), %since, "extracted replica reference rows");

        Ok(rows)
    }
}
