use std::collections::BTreeSet;
use std::fmt::Write;

use clickhouse_rs::Pool;
use tracing::{debug, info};

use crate::error::EtlError;
use crate::export::{escape_sql, format_date, format_datetime};
use crate::model::UserProsthesisStat;

/// Columns of the user_prosthesis_stats mart, in insert order.
const COLUMNS: &str = "user_id, prosthesis_id, chip_id, report_date, report_hour, \
     customer_name, customer_email, customer_region, customer_branch, \
     prosthesis_model, prosthesis_category, prosthesis_serial, firmware_version, \
     movements_count, successful_movements, success_rate, \
     avg_response_time_ms, min_response_time_ms, max_response_time_ms, \
     avg_battery_level, min_battery_level, max_battery_level, \
     avg_actuator_temp, max_actuator_temp, \
     error_count, warning_count, avg_myo_amplitude, avg_connection_quality, \
     source_updated_at, etl_processed_at";

/// Result of a load: rows pushed and the distinct users they touched.
///
/// The user set feeds the cache invalidation fan-out after the load
/// commits.
#[derive(Debug, Default)]
pub struct LoadResult {
    pub inserted_rows: usize,
    pub user_ids: BTreeSet<String>,
}

/// Batched inserter for the ClickHouse mart.
///
/// The mart is append-only; replayed batches coexist at the storage
/// layer and are collapsed at read time by keeping the maximum
/// etl_processed_at per semantic key, so retrying a failed run wholesale
/// is safe.
pub struct FactLoader {
    pool: Pool,
    database: String,
    batch_size: usize,
}

impl FactLoader {
    /// Creates a loader over an existing ClickHouse pool.
    pub fn new(pool: Pool, database: String, batch_size: usize) -> Self {
        Self {
            pool,
            database,
            batch_size: batch_size.max(1),
        }
    }

    /// Inserts the fact batch, chunked by the configured batch size.
    ///
    /// A failed chunk fails the whole load; partial progress is left in
    /// place and superseded when the run is retried.
    pub async fn load(&self, facts: &[UserProsthesisStat]) -> Result<LoadResult, EtlError> {
        let mut result = LoadResult::default();

        if facts.is_empty() {
            debug!("no fact rows to load");
            return Ok(result);
        }

        for chunk in facts.chunks(self.batch_size) {
            let sql = build_insert_sql(&self.database, chunk);

            let mut handle = self.pool.get_handle().await.map_err(|e| {
                EtlError::TargetUnavailable(format!("getting mart handle: {e}"))
            })?;

            handle.execute(sql.as_str()).await.map_err(|e| {
                EtlError::TargetUnavailable(format!("inserting fact batch: {e}"))
            })?;

            result.inserted_rows += chunk.len();
            debug!(rows = chunk.len(), "inserted fact batch");
        }

        for fact in facts {
            result.user_ids.insert(fact.user_id.clone());
        }

        info!(
            rows = result.inserted_rows,
            users = result.user_ids.len(),
            "fact load committed",
        );

        Ok(result)
    }
}

/// Composes a multi-row VALUES insert for one chunk.
fn build_insert_sql(database: &str, rows: &[UserProsthesisStat]) -> String {
    let mut sql = String::with_capacity(128 + COLUMNS.len() + rows.len() * 512);
    let _ = write!(
        sql,
        "INSERT INTO {database}.user_prosthesis_stats ({COLUMNS}) VALUES ",
    );

    for (idx, r) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let _ = write!(
            sql,
            "('{}', {}, '{}', {}, {}, '{}', '{}', '{}', '{}', '{}', '{}', '{}', '{}', \
             {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
            escape_sql(&r.user_id),
            r.prosthesis_id,
            escape_sql(&r.chip_id),
            format_date(r.report_date),
            r.report_hour,
            escape_sql(&r.customer_name),
            escape_sql(&r.customer_email),
            escape_sql(&r.customer_region),
            escape_sql(&r.customer_branch),
            escape_sql(&r.prosthesis_model),
            escape_sql(&r.prosthesis_category),
            escape_sql(&r.prosthesis_serial),
            escape_sql(&r.firmware_version),
            r.movements_count,
            r.successful_movements,
            r.success_rate,
            r.avg_response_time_ms,
            r.min_response_time_ms,
            r.max_response_time_ms,
            r.avg_battery_level,
            r.min_battery_level,
            r.max_battery_level,
            r.avg_actuator_temp,
            r.max_actuator_temp,
            r.error_count,
            r.warning_count,
            r.avg_myo_amplitude,
            r.avg_connection_quality,
            format_datetime(r.source_updated_at),
            format_datetime(r.etl_processed_at),
        );
    }

    sql
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::*;

    fn fact(user: &str, hour: u8) -> UserProsthesisStat {
        UserProsthesisStat {
            user_id: user.to_string(),
            prosthesis_id: 7,
            chip_id: "CHIP-1".to_string(),
            report_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            report_hour: hour,
            customer_name: "Petrov Ivan".to_string(),
            customer_email: "ivan.petrov@example.com".to_string(),
            customer_region: "europe".to_string(),
            customer_branch: "berlin".to_string(),
            prosthesis_model: "Atlas Mk III".to_string(),
            prosthesis_category: "arm".to_string(),
            prosthesis_serial: "SN-7".to_string(),
            firmware_version: "2.4.1".to_string(),
            movements_count: 100,
            successful_movements: 95,
            success_rate: 95.0,
            avg_response_time_ms: 80.0,
            min_response_time_ms: 40.0,
            max_response_time_ms: 150.0,
            avg_battery_level: 70.0,
            min_battery_level: 65.0,
            max_battery_level: 78.0,
            avg_actuator_temp: 31.5,
            max_actuator_temp: 36.0,
            error_count: 1,
            warning_count: 2,
            avg_myo_amplitude: 0.42,
            avg_connection_quality: 97.0,
            source_updated_at: Utc.with_ymd_and_hms(2024, 1, 15, 11, 5, 0).unwrap(),
            etl_processed_at: Utc.with_ymd_and_hms(2024, 1, 15, 11, 15, 0).unwrap(),
        }
    }

    #[test]
    fn test_build_insert_sql_single_row() {
        let sql = build_insert_sql("reports", &[fact("ivan.petrov", 10)]);

        assert!(sql.starts_with("INSERT INTO reports.user_prosthesis_stats (user_id,"));
        assert!(sql.contains("'ivan.petrov', 7, 'CHIP-1', '2024-01-15', 10,"));
        assert!(sql.contains("'Petrov Ivan'"));
        assert!(sql.contains("'2024-01-15 11:15:00.000'"));
        // One row, one tuple.
        assert_eq!(sql.matches("), (").count(), 0);
    }

    #[test]
    fn test_build_insert_sql_escapes_strings() {
        let mut f = fact("o'brien", 10);
        f.customer_name = "O'Brien Pat".to_string();
        let sql = build_insert_sql("reports", &[f]);

        assert!(sql.contains("'o\\'brien'"));
        assert!(sql.contains("'O\\'Brien Pat'"));
    }

    #[test]
    fn test_build_insert_sql_multiple_rows() {
        let rows = vec![fact("a", 1), fact("b", 2), fact("c", 3)];
        let sql = build_insert_sql("reports", &rows);
        assert_eq!(sql.matches("), (").count(), 2);
    }

    #[test]
    fn test_load_result_default_is_empty() {
        let result = LoadResult::default();
        assert_eq!(result.inserted_rows, 0);
        assert!(result.user_ids.is_empty());
    }
}
