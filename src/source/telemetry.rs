use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::debug;

use crate::config::PostgresConfig;
use crate::error::EtlError;
use crate::model::HourlyTelemetry;

/// Hourly aggregate extraction over a half-open [start, end) window.
///
/// Averages are cast to double precision so decoding never depends on
/// whether the upstream aggregator stores numerics or floats.
const TELEMETRY_QUERY: &str = r#"
SELECT
    chip_id,
    hour_start,
    movements_count::bigint AS movements_count,
    successful_movements::bigint AS successful_movements,
    avg_response_time::double precision AS avg_response_time_ms,
    min_response_time::double precision AS min_response_time_ms,
    max_response_time::double precision AS max_response_time_ms,
    avg_battery_level::double precision AS avg_battery_level,
    min_battery_level::double precision AS min_battery_level,
    max_battery_level::double precision AS max_battery_level,
    avg_actuator_temp::double precision AS avg_actuator_temp,
    max_actuator_temp::double precision AS max_actuator_temp,
    error_count::bigint AS error_count,
    warning_count::bigint AS warning_count,
    avg_myo_amplitude::double precision AS avg_myo_amplitude,
    avg_connection_quality::double precision AS avg_connection_quality,
    updated_at
FROM telemetry.v_hourly_telemetry
WHERE hour_start >= $1
  AND hour_start < $2
ORDER BY chip_id, hour_start
"#;

/// Telemetry source backed by the upstream aggregator's PostgreSQL.
pub struct TelemetrySource {
    pool: PgPool,
}

impl TelemetrySource {
    /// Opens the read connection pool.
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self, EtlError> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.pool_size)
            .connect(&cfg.url)
            .await
            .map_err(|e| EtlError::SourceUnavailable(format!("connecting to telemetry: {e}")))?;

        Ok(Self { pool })
    }

    /// Streams hourly aggregates with hour_start in [start, end).
    pub async fn extract_telemetry(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<HourlyTelemetry>, EtlError> {
        let mut stream = sqlx::query_as::<_, HourlyTelemetry>(TELEMETRY_QUERY)
            .bind(window_start)
            .bind(window_end)
            .fetch(&self.pool);

        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await.map_err(EtlError::from_source)? {
            rows.push(row);
        }

        debug!(
            rows = rows.len(),
            %window_start,
            %window_end,
            "extracted hourly telemetry rows",
        );

        Ok(rows)
    }
}
