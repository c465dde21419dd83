use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use clickhouse_rs::Pool;

use crate::error::EtlError;
use crate::export::{escape_sql, format_date};
use crate::model::UserProsthesisStat;
use crate::transform::round2;

/// Daily roll-up over the mart for one (user, date).
#[derive(Debug, Clone, PartialEq)]
pub struct DailyReport {
    pub user_id: String,
    pub report_date: NaiveDate,
    pub daily_movements: i64,
    pub daily_successful: i64,
    /// Guarded and clamped to [0, 100]; 0 when daily_movements is 0.
    pub daily_success_rate: f64,
    pub avg_response_time_ms: f64,
    pub avg_battery_percent: f64,
    pub avg_temp_celsius: f64,
    pub avg_connection_quality: f64,
    pub min_battery_percent: f64,
    pub max_temp_celsius: f64,
    pub daily_errors: i64,
    /// Count of distinct report_hour values for the day.
    pub active_hours: u64,
}

/// Lifetime summary over the mart for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSummary {
    pub user_id: String,
    pub first_activity_date: NaiveDate,
    pub last_activity_date: NaiveDate,
    /// last - first + 1, calendar days.
    pub total_days: i64,
    /// Count of distinct report_date values.
    pub active_days: u64,
    pub total_movements: i64,
    pub total_successful: i64,
    pub overall_success_rate: f64,
    pub avg_response_time_ms: f64,
    pub avg_battery_percent: f64,
    pub total_errors: i64,
    pub avg_errors_per_day: f64,
}

/// Collapses duplicate semantic keys, keeping the row with the highest
/// etl_processed_at. This is the read-side half of the version-wins
/// storage discipline.
pub fn latest_versions(rows: &[UserProsthesisStat]) -> Vec<&UserProsthesisStat> {
    let mut latest: HashMap<(&str, i64, NaiveDate, u8), &UserProsthesisStat> =
        HashMap::with_capacity(rows.len());

    for row in rows {
        let key = row.semantic_key();
        match latest.get(&key) {
            Some(current) if current.etl_processed_at >= row.etl_processed_at => {}
            _ => {
                latest.insert(key, row);
            }
        }
    }

    let mut collapsed: Vec<&UserProsthesisStat> = latest.into_values().collect();
    collapsed.sort_by(|a, b| a.semantic_key().cmp(&b.semantic_key()));
    collapsed
}

/// The guarded, clamped success-rate formula shared by both views.
fn guarded_success_rate(successful: i64, movements: i64) -> f64 {
    if movements <= 0 {
        return 0.0;
    }
    round2(successful as f64 / movements as f64 * 100.0).clamp(0.0, 100.0)
}

/// Unweighted mean over hourly values.
fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Computes the daily report for (user, date) from in-memory fact rows.
///
/// Applies version-wins first so the arithmetic matches what the
/// ClickHouse view returns after FINAL. Returns None when the user has
/// no rows for the date.
pub fn daily_rollup(
    rows: &[UserProsthesisStat],
    user_id: &str,
    report_date: NaiveDate,
) -> Option<DailyReport> {
    let day: Vec<&UserProsthesisStat> = latest_versions(rows)
        .into_iter()
        .filter(|r| r.user_id == user_id && r.report_date == report_date)
        .collect();

    if day.is_empty() {
        return None;
    }

    let daily_movements: i64 = day.iter().map(|r| r.movements_count).sum();
    let daily_successful: i64 = day.iter().map(|r| r.successful_movements).sum();
    let active_hours = day
        .iter()
        .map(|r| r.report_hour)
        .collect::<BTreeSet<u8>>()
        .len() as u64;

    Some(DailyReport {
        user_id: user_id.to_string(),
        report_date,
        daily_movements,
        daily_successful,
        daily_success_rate: guarded_success_rate(daily_successful, daily_movements),
        avg_response_time_ms: round2(mean(day.iter().map(|r| r.avg_response_time_ms))),
        avg_battery_percent: round2(mean(day.iter().map(|r| r.avg_battery_level))),
        avg_temp_celsius: round2(mean(day.iter().map(|r| r.avg_actuator_temp))),
        avg_connection_quality: round2(mean(day.iter().map(|r| r.avg_connection_quality))),
        min_battery_percent: day
            .iter()
            .map(|r| r.min_battery_level)
            .fold(f64::INFINITY, f64::min),
        max_temp_celsius: day
            .iter()
            .map(|r| r.max_actuator_temp)
            .fold(f64::NEG_INFINITY, f64::max),
        daily_errors: day.iter().map(|r| r.error_count).sum(),
        active_hours,
    })
}

/// Computes the lifetime summary for a user from in-memory fact rows.
pub fn summary_rollup(rows: &[UserProsthesisStat], user_id: &str) -> Option<UserSummary> {
    let user_rows: Vec<&UserProsthesisStat> = latest_versions(rows)
        .into_iter()
        .filter(|r| r.user_id == user_id)
        .collect();

    if user_rows.is_empty() {
        return None;
    }

    let first = user_rows.iter().map(|r| r.report_date).min()?;
    let last = user_rows.iter().map(|r| r.report_date).max()?;
    let active_days = user_rows
        .iter()
        .map(|r| r.report_date)
        .collect::<BTreeSet<NaiveDate>>()
        .len() as u64;

    let total_movements: i64 = user_rows.iter().map(|r| r.movements_count).sum();
    let total_successful: i64 = user_rows.iter().map(|r| r.successful_movements).sum();
    let total_errors: i64 = user_rows.iter().map(|r| r.error_count).sum();

    Some(UserSummary {
        user_id: user_id.to_string(),
        first_activity_date: first,
        last_activity_date: last,
        total_days: (last - first).num_days() + 1,
        active_days,
        total_movements,
        total_successful,
        overall_success_rate: guarded_success_rate(total_successful, total_movements),
        avg_response_time_ms: round2(mean(user_rows.iter().map(|r| r.avg_response_time_ms))),
        avg_battery_percent: round2(mean(user_rows.iter().map(|r| r.avg_battery_level))),
        total_errors,
        avg_errors_per_day: if active_days == 0 {
            0.0
        } else {
            round2(total_errors as f64 / active_days as f64)
        },
    })
}

/// Read-side client for the mart's report views.
///
/// Queries the SQL views created by the migrations; both apply FINAL so
/// callers always observe a single value per semantic key.
pub struct ReportReader {
    pool: Pool,
    database: String,
}

impl ReportReader {
    /// Creates a reader over an existing ClickHouse pool.
    pub fn new(pool: Pool, database: String) -> Self {
        Self { pool, database }
    }

    /// Fetches the daily report for (user, date), if any rows exist.
    pub async fn daily_report(
        &self,
        user_id: &str,
        report_date: NaiveDate,
    ) -> Result<Option<DailyReport>, EtlError> {
        let sql = format!(
            "SELECT daily_movements, daily_successful, daily_success_rate, \
             avg_response_time_ms, avg_battery_percent, avg_temp_celsius, \
             avg_connection_quality, min_battery_percent, max_temp_celsius, \
             daily_errors, active_hours \
             FROM {}.v_daily_report \
             WHERE user_id = '{}' AND report_date = {}",
            escape_sql(&self.database),
            escape_sql(user_id),
            format_date(report_date),
        );

        let block = self.fetch(&sql).await?;
        let Some(row) = block.rows().next() else {
            return Ok(None);
        };

        Ok(Some(DailyReport {
            user_id: user_id.to_string(),
            report_date,
            daily_movements: get(&row, "daily_movements")?,
            daily_successful: get(&row, "daily_successful")?,
            daily_success_rate: get(&row, "daily_success_rate")?,
            avg_response_time_ms: get(&row, "avg_response_time_ms")?,
            avg_battery_percent: get(&row, "avg_battery_percent")?,
            avg_temp_celsius: get(&row, "avg_temp_celsius")?,
            avg_connection_quality: get(&row, "avg_connection_quality")?,
            min_battery_percent: get(&row, "min_battery_percent")?,
            max_temp_celsius: get(&row, "max_temp_celsius")?,
            daily_errors: get(&row, "daily_errors")?,
            active_hours: get(&row, "active_hours")?,
        }))
    }

    /// Fetches the lifetime summary for a user, if any rows exist.
    pub async fn user_summary(&self, user_id: &str) -> Result<Option<UserSummary>, EtlError> {
        let sql = format!(
            "SELECT first_activity_date, last_activity_date, total_days, active_days, \
             total_movements, total_successful, overall_success_rate, \
             avg_response_time_ms, avg_battery_percent, total_errors, avg_errors_per_day \
             FROM {}.v_user_summary \
             WHERE user_id = '{}'",
            escape_sql(&self.database),
            escape_sql(user_id),
        );

        let block = self.fetch(&sql).await?;
        let Some(row) = block.rows().next() else {
            return Ok(None);
        };

        Ok(Some(UserSummary {
            user_id: user_id.to_string(),
            first_activity_date: get(&row, "first_activity_date")?,
            last_activity_date: get(&row, "last_activity_date")?,
            total_days: get(&row, "total_days")?,
            active_days: get(&row, "active_days")?,
            total_movements: get(&row, "total_movements")?,
            total_successful: get(&row, "total_successful")?,
            overall_success_rate: get(&row, "overall_success_rate")?,
            avg_response_time_ms: get(&row, "avg_response_time_ms")?,
            avg_battery_percent: get(&row, "avg_battery_percent")?,
            total_errors: get(&row, "total_errors")?,
            avg_errors_per_day: get(&row, "avg_errors_per_day")?,
        }))
    }

    async fn fetch(
        &self,
        sql: &str,
    ) -> Result<clickhouse_rs::types::Block<clickhouse_rs::types::Complex>, EtlError> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .map_err(|e| EtlError::TargetUnavailable(format!("getting mart handle: {e}")))?;

        handle
            .query(sql)
            .fetch_all()
            .await
            .map_err(|e| EtlError::TargetUnavailable(format!("querying report view: {e}")))
    }
}

/// Reads a typed view column, classifying failures as schema drift.
fn get<'b, T, K>(row: &'b clickhouse_rs::types::Row<'_, K>, name: &str) -> Result<T, EtlError>
where
    T: clickhouse_rs::types::FromSql<'b>,
    K: clickhouse_rs::types::ColumnType,
{
    row.get(name)
        .map_err(|e| EtlError::SchemaMismatch(format!("view column {name}: {e}")))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn fact(
        user: &str,
        date: (i32, u32, u32),
        hour: u8,
        movements: i64,
        successful: i64,
        processed_minute: u32,
    ) -> UserProsthesisStat {
        UserProsthesisStat {
            user_id: user.to_string(),
            prosthesis_id: 7,
            chip_id: "CHIP-1".to_string(),
            report_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            report_hour: hour,
            customer_name: "Petrov Ivan".to_string(),
            customer_email: "ivan.petrov@example.com".to_string(),
            customer_region: "europe".to_string(),
            customer_branch: "berlin".to_string(),
            prosthesis_model: "Atlas Mk III".to_string(),
            prosthesis_category: "arm".to_string(),
            prosthesis_serial: "SN-7".to_string(),
            firmware_version: "2.4.1".to_string(),
            movements_count: movements,
            successful_movements: successful,
            success_rate: crate::transform::success_rate(successful, movements),
            avg_response_time_ms: 80.0,
            min_response_time_ms: 40.0,
            max_response_time_ms: 150.0,
            avg_battery_level: 70.0,
            min_battery_level: 65.0,
            max_battery_level: 78.0,
            avg_actuator_temp: 31.0,
            max_actuator_temp: 36.0,
            error_count: 1,
            warning_count: 0,
            avg_myo_amplitude: 0.4,
            avg_connection_quality: 96.0,
            source_updated_at: Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap(),
            etl_processed_at: Utc
                .with_ymd_and_hms(2024, 1, 15, 11, processed_minute, 0)
                .unwrap(),
        }
    }

    #[test]
    fn test_daily_rollup_single_hour() {
        let rows = vec![fact("ivan.petrov", (2024, 1, 15), 10, 100, 95, 0)];

        let report = daily_rollup(&rows, "ivan.petrov", rows[0].report_date).expect("report");
        assert_eq!(report.daily_movements, 100);
        assert_eq!(report.daily_successful, 95);
        assert_eq!(report.daily_success_rate, 95.0);
        assert_eq!(report.active_hours, 1);
        assert_eq!(report.daily_errors, 1);
        assert_eq!(report.min_battery_percent, 65.0);
        assert_eq!(report.max_temp_celsius, 36.0);
    }

    #[test]
    fn test_daily_rollup_zero_movements() {
        let rows = vec![fact("ivan.petrov", (2024, 1, 15), 10, 0, 0, 0)];

        let report = daily_rollup(&rows, "ivan.petrov", rows[0].report_date).expect("report");
        assert_eq!(report.daily_success_rate, 0.0);
        assert!(!report.daily_success_rate.is_nan());
        assert_eq!(report.active_hours, 1);
    }

    #[test]
    fn test_daily_rollup_distinct_hours() {
        // Two prostheses reporting in the same hour still count it once.
        let mut second_device = fact("ivan.petrov", (2024, 1, 15), 10, 50, 40, 0);
        second_device.prosthesis_id = 8;

        let rows = vec![
            fact("ivan.petrov", (2024, 1, 15), 10, 100, 95, 0),
            second_device,
            fact("ivan.petrov", (2024, 1, 15), 11, 60, 60, 0),
        ];

        let report = daily_rollup(&rows, "ivan.petrov", rows[0].report_date).expect("report");
        assert_eq!(report.active_hours, 2);
        assert_eq!(report.daily_movements, 210);
    }

    #[test]
    fn test_version_wins_latest_processed_at() {
        // Same semantic key written by two runs: the correction wins.
        let rows = vec![
            fact("ivan.petrov", (2024, 1, 15), 10, 100, 95, 0),
            fact("ivan.petrov", (2024, 1, 15), 10, 120, 110, 30),
        ];

        let collapsed = latest_versions(&rows);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].movements_count, 120);

        let report = daily_rollup(&rows, "ivan.petrov", rows[0].report_date).expect("report");
        assert_eq!(report.daily_movements, 120);
        assert_eq!(report.daily_successful, 110);
    }

    #[test]
    fn test_rollup_is_idempotent_across_replayed_batches() {
        // Two identical runs: duplicated storage rows, identical view.
        let run: Vec<UserProsthesisStat> = vec![
            fact("ivan.petrov", (2024, 1, 15), 10, 100, 95, 5),
            fact("ivan.petrov", (2024, 1, 15), 11, 60, 58, 5),
        ];
        let mut replayed = run.clone();
        replayed.extend(run.iter().cloned());

        let once = daily_rollup(&run, "ivan.petrov", run[0].report_date);
        let twice = daily_rollup(&replayed, "ivan.petrov", run[0].report_date);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_daily_success_rate_matches_direct_formula() {
        let rows = vec![
            fact("ivan.petrov", (2024, 1, 15), 9, 33, 11, 0),
            fact("ivan.petrov", (2024, 1, 15), 10, 67, 21, 0),
        ];

        let report = daily_rollup(&rows, "ivan.petrov", rows[0].report_date).expect("report");
        let direct = round2((11 + 21) as f64 / (33 + 67) as f64 * 100.0);
        assert_eq!(report.daily_success_rate, direct);
    }

    #[test]
    fn test_summary_rollup() {
        let rows = vec![
            fact("ivan.petrov", (2024, 1, 10), 10, 100, 95, 0),
            fact("ivan.petrov", (2024, 1, 12), 9, 80, 70, 0),
            fact("ivan.petrov", (2024, 1, 12), 10, 20, 20, 0),
            fact("someone.else", (2024, 1, 11), 10, 10, 10, 0),
        ];

        let summary = summary_rollup(&rows, "ivan.petrov").expect("summary");
        assert_eq!(
            summary.first_activity_date,
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
        );
        assert_eq!(
            summary.last_activity_date,
            NaiveDate::from_ymd_opt(2024, 1, 12).unwrap()
        );
        assert_eq!(summary.total_days, 3);
        assert_eq!(summary.active_days, 2);
        assert_eq!(summary.total_movements, 200);
        assert_eq!(summary.total_successful, 185);
        assert_eq!(summary.overall_success_rate, 92.5);
        assert_eq!(summary.total_errors, 3);
        assert_eq!(summary.avg_errors_per_day, 1.5);
    }

    #[test]
    fn test_summary_rollup_unknown_user() {
        let rows = vec![fact("ivan.petrov", (2024, 1, 10), 10, 100, 95, 0)];
        assert!(summary_rollup(&rows, "nobody").is_none());
    }
}
