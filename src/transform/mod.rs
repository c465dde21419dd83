use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, warn};

use crate::error::RowError;
use crate::model::{CustomerProsthesis, HourlyTelemetry, UserProsthesisStat};

/// In-memory mapping from chip_id to flattened reference attributes.
///
/// Built once per run from the reference extract; telemetry is then
/// enriched against it in a single pass.
pub struct ReferenceIndex {
    by_chip: HashMap<String, CustomerProsthesis>,
}

impl ReferenceIndex {
    /// Builds the index, keeping at most one row per chip_id.
    ///
    /// Ties are broken by greatest `last_updated_at`, then by lowest
    /// `prosthesis_id`, matching the extraction contract.
    pub fn build(rows: Vec<CustomerProsthesis>) -> Self {
        let mut by_chip: HashMap<String, CustomerProsthesis> = HashMap::with_capacity(rows.len());

        for row in rows {
            match by_chip.get(&row.chip_id) {
                Some(current) if !supersedes(&row, current) => {}
                _ => {
                    by_chip.insert(row.chip_id.clone(), row);
                }
            }
        }

        Self { by_chip }
    }

    /// Looks up the reference row for a chip.
    pub fn get(&self, chip_id: &str) -> Option<&CustomerProsthesis> {
        self.by_chip.get(chip_id)
    }

    /// Number of distinct chips in the index.
    pub fn len(&self) -> usize {
        self.by_chip.len()
    }

    /// Whether the index holds no chips.
    pub fn is_empty(&self) -> bool {
        self.by_chip.is_empty()
    }
}

/// Whether `candidate` replaces `current` for the same chip.
fn supersedes(candidate: &CustomerProsthesis, current: &CustomerProsthesis) -> bool {
    candidate.last_updated_at > current.last_updated_at
        || (candidate.last_updated_at == current.last_updated_at
            && candidate.prosthesis_id < current.prosthesis_id)
}

/// Row-drop accounting for a transform pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransformStats {
    /// Fact rows produced.
    pub produced: u64,
    /// Telemetry rows with no matching active prosthesis.
    pub orphans: u64,
    /// Telemetry rows violating range invariants.
    pub invalid: u64,
}

/// Rounds half-up to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// successful / movements × 100, guarded against a zero denominator.
pub fn success_rate(successful: i64, movements: i64) -> f64 {
    if movements <= 0 {
        return 0.0;
    }
    round2(successful as f64 / movements as f64 * 100.0)
}

/// Validates telemetry range invariants before enrichment.
fn validate(t: &HourlyTelemetry) -> Result<(), RowError> {
    let invalid = |field: &'static str, value: f64| RowError::InvalidMetric {
        chip_id: t.chip_id.clone(),
        field,
        value,
    };

    if t.movements_count < 0 {
        return Err(invalid("movements_count", t.movements_count as f64));
    }
    if t.successful_movements < 0 || t.successful_movements > t.movements_count {
        return Err(invalid(
            "successful_movements",
            t.successful_movements as f64,
        ));
    }
    if t.error_count < 0 {
        return Err(invalid("error_count", t.error_count as f64));
    }

    for (field, value) in [
        ("avg_battery_level", t.avg_battery_level),
        ("min_battery_level", t.min_battery_level),
        ("max_battery_level", t.max_battery_level),
        ("avg_connection_quality", t.avg_connection_quality),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(invalid(field, value));
        }
    }

    Ok(())
}

/// Enriches one telemetry row with its reference attributes.
///
/// report_date and report_hour are derived from `hour_start` in UTC;
/// success_rate is recomputed here rather than trusted from the source.
pub fn enrich(
    t: &HourlyTelemetry,
    index: &ReferenceIndex,
    processed_at: DateTime<Utc>,
) -> Result<UserProsthesisStat, RowError> {
    let reference = index.get(&t.chip_id).ok_or_else(|| RowError::OrphanTelemetry {
        chip_id: t.chip_id.clone(),
    })?;

    validate(t)?;

    Ok(UserProsthesisStat {
        user_id: reference.user_id.clone(),
        prosthesis_id: reference.prosthesis_id,
        chip_id: t.chip_id.clone(),
        report_date: t.hour_start.date_naive(),
        report_hour: t.hour_start.hour() as u8,
        customer_name: reference.customer_name.clone(),
        customer_email: reference.customer_email.clone(),
        customer_region: reference.customer_region.clone(),
        customer_branch: reference.customer_branch.clone(),
        prosthesis_model: reference.prosthesis_model.clone(),
        prosthesis_category: reference.prosthesis_category.clone(),
        prosthesis_serial: reference.prosthesis_serial.clone(),
        firmware_version: reference.firmware_version.clone(),
        movements_count: t.movements_count,
        successful_movements: t.successful_movements,
        success_rate: success_rate(t.successful_movements, t.movements_count),
        avg_response_time_ms: t.avg_response_time_ms,
        min_response_time_ms: t.min_response_time_ms,
        max_response_time_ms: t.max_response_time_ms,
        avg_battery_level: t.avg_battery_level,
        min_battery_level: t.min_battery_level,
        max_battery_level: t.max_battery_level,
        avg_actuator_temp: t.avg_actuator_temp,
        max_actuator_temp: t.max_actuator_temp,
        error_count: t.error_count,
        warning_count: t.warning_count,
        avg_myo_amplitude: t.avg_myo_amplitude,
        avg_connection_quality: t.avg_connection_quality,
        source_updated_at: t.updated_at,
        etl_processed_at: processed_at,
    })
}

/// Runs the full transform pass over an extracted telemetry batch.
///
/// Orphan and invalid rows are dropped and counted; output order is not
/// significant, the loader is idempotent per semantic key.
pub fn run_transform(
    telemetry: &[HourlyTelemetry],
    index: &ReferenceIndex,
    processed_at: DateTime<Utc>,
) -> (Vec<UserProsthesisStat>, TransformStats) {
    let mut stats = TransformStats::default();
    let mut facts = Vec::with_capacity(telemetry.len());

    for row in telemetry {
        match enrich(row, index, processed_at) {
            Ok(fact) => {
                stats.produced += 1;
                facts.push(fact);
            }
            Err(RowError::OrphanTelemetry { chip_id }) => {
                stats.orphans += 1;
                debug!(chip_id = %chip_id, "dropping orphan telemetry row");
            }
            Err(err @ RowError::InvalidMetric { .. }) => {
                stats.invalid += 1;
                warn!(error = %err, "dropping telemetry row with invalid metric");
            }
        }
    }

    (facts, stats)
}
