use chrono::{DateTime, NaiveDate, Utc};

/// Flattened active-prosthesis reference row.
///
/// One row per chip: customer × prosthesis × model, pre-joined by the
/// source adapter and filtered to `status = 'active'` with a provisioned
/// chip. `last_updated_at` is `greatest(customer.updated_at,
/// prosthesis.updated_at)` and drives deduplication when a chip appears
/// more than once in an extraction window.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CustomerProsthesis {
    /// Opaque user principal shared with the identity system.
    pub user_id: String,
    /// "Last First [Middle]", single-space separated.
    pub customer_name: String,
    pub customer_email: String,
    pub customer_region: String,
    pub customer_branch: String,
    pub prosthesis_id: i64,
    pub prosthesis_serial: String,
    /// Device identifier; the join key against telemetry.
    pub chip_id: String,
    pub prosthesis_model: String,
    pub prosthesis_category: String,
    pub firmware_version: String,
    pub last_updated_at: DateTime<Utc>,
}

/// Hourly telemetry aggregate keyed by (chip_id, hour_start).
///
/// Produced by the upstream aggregator; `hour_start` is a UTC instant
/// truncated to the hour.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HourlyTelemetry {
    pub chip_id: String,
    pub hour_start: DateTime<Utc>,
    pub movements_count: i64,
    pub successful_movements: i64,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: f64,
    pub max_response_time_ms: f64,
    /// Battery percentage, 0-100.
    pub avg_battery_level: f64,
    pub min_battery_level: f64,
    pub max_battery_level: f64,
    /// Actuator temperature in Celsius.
    pub avg_actuator_temp: f64,
    pub max_actuator_temp: f64,
    pub error_count: i64,
    pub warning_count: i64,
    pub avg_myo_amplitude: f64,
    /// Link quality, 0-100.
    pub avg_connection_quality: f64,
    pub updated_at: DateTime<Utc>,
}

/// Denormalized mart fact row.
///
/// Semantic key is (user_id, prosthesis_id, report_date, report_hour);
/// the storage layer is append-only and collapses duplicate keys at read
/// time by keeping the highest `etl_processed_at`.
#[derive(Debug, Clone)]
pub struct UserProsthesisStat {
    pub user_id: String,
    pub prosthesis_id: i64,
    pub chip_id: String,
    /// UTC date of the telemetry hour.
    pub report_date: NaiveDate,
    /// UTC hour of day, 0-23.
    pub report_hour: u8,

    pub customer_name: String,
    pub customer_email: String,
    pub customer_region: String,
    pub customer_branch: String,
    pub prosthesis_model: String,
    pub prosthesis_category: String,
    pub prosthesis_serial: String,
    pub firmware_version: String,

    pub movements_count: i64,
    pub successful_movements: i64,
    /// successful / movements × 100, rounded to 2 decimals; 0 when
    /// movements_count is 0.
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub avg_battery_level: f64,
    pub min_battery_level: f64,
    pub max_battery_level: f64,
    pub avg_actuator_temp: f64,
    pub max_actuator_temp: f64,
    pub error_count: i64,
    pub warning_count: i64,
    pub avg_myo_amplitude: f64,
    pub avg_connection_quality: f64,

    /// Latest aggregation time reported by the telemetry source.
    pub source_updated_at: DateTime<Utc>,
    /// Version stamp; the version-wins merge keeps the maximum per key.
    pub etl_processed_at: DateTime<Utc>,
}

impl UserProsthesisStat {
    /// The semantic key under which version-wins dedup applies.
    pub fn semantic_key(&self) -> (&str, i64, NaiveDate, u8) {
        (
            self.user_id.as_str(),
            self.prosthesis_id,
            self.report_date,
            self.report_hour,
        )
    }
}
