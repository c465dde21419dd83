use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use reportoor::model::{CustomerProsthesis, HourlyTelemetry, UserProsthesisStat};
use reportoor::transform::{run_transform, ReferenceIndex};
use reportoor::views::{daily_rollup, latest_versions, summary_rollup};

fn reference(chip: &str, user: &str, last: &str, first: &str, middle: Option<&str>) -> CustomerProsthesis {
    let customer_name = match middle {
        Some(m) => format!("{last} {first} {m}"),
        None => format!("{last} {first}"),
    };

    CustomerProsthesis {
        user_id: user.to_string(),
        customer_name,
        customer_email: format!("{user}@example.com"),
        customer_region: "europe".to_string(),
        customer_branch: "berlin".to_string(),
        prosthesis_id: 7,
        prosthesis_serial: "SN-7".to_string(),
        chip_id: chip.to_string(),
        prosthesis_model: "Atlas Mk III".to_string(),
        prosthesis_category: "arm".to_string(),
        firmware_version: "2.4.1".to_string(),
        last_updated_at: Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap(),
    }
}

#[allow(clippy::too_many_arguments)]
fn telemetry(
    chip: &str,
    hour_start: DateTime<Utc>,
    movements: i64,
    successful: i64,
    avg_response: f64,
    avg_battery: f64,
    errors: i64,
) -> HourlyTelemetry {
    HourlyTelemetry {
        chip_id: chip.to_string(),
        hour_start,
        movements_count: movements,
        successful_movements: successful,
        avg_response_time_ms: avg_response,
        min_response_time_ms: avg_response * 0.5,
        max_response_time_ms: avg_response * 2.0,
        avg_battery_level: avg_battery,
        min_battery_level: (avg_battery - 5.0).max(0.0),
        max_battery_level: (avg_battery + 5.0).min(100.0),
        avg_actuator_temp: 31.0,
        max_actuator_temp: 36.5,
        error_count: errors,
        warning_count: 0,
        avg_myo_amplitude: 0.4,
        avg_connection_quality: 96.0,
        updated_at: hour_start + chrono::Duration::minutes(65),
    }
}

fn hour(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
}

fn date(y: i32, mo: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, mo, d).unwrap()
}

fn assert_mart_invariants(rows: &[UserProsthesisStat]) {
    for r in rows {
        assert!(
            0 <= r.successful_movements && r.successful_movements <= r.movements_count,
            "movement counters out of order for {}",
            r.chip_id,
        );
        assert!(
            (0.0..=100.0).contains(&r.avg_battery_level),
            "battery out of range for {}",
            r.chip_id,
        );
        assert!(r.report_hour <= 23, "report_hour out of range");
        assert!(
            (0.0..=100.0).contains(&r.success_rate),
            "success_rate out of range",
        );
    }

    // After version-wins, at most one visible row per semantic key.
    let visible = latest_versions(rows);
    let mut keys: Vec<_> = visible.iter().map(|r| r.semantic_key()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), visible.len(), "duplicate semantic keys visible");
}

#[test]
fn happy_path_one_user_one_hour() {
    let index = ReferenceIndex::build(vec![reference(
        "CHIP-1",
        "ivan.petrov",
        "Petrov",
        "Ivan",
        None,
    )]);
    let rows = vec![telemetry(
        "CHIP-1",
        hour(2024, 1, 15, 10),
        100,
        95,
        80.0,
        70.0,
        1,
    )];

    let processed_at = Utc.with_ymd_and_hms(2024, 1, 15, 11, 15, 0).unwrap();
    let (facts, stats) = run_transform(&rows, &index, processed_at);

    assert_eq!(stats.produced, 1);
    assert_eq!(stats.orphans, 0);
    assert_eq!(stats.invalid, 0);
    assert_mart_invariants(&facts);

    let fact = &facts[0];
    assert_eq!(fact.user_id, "ivan.petrov");
    assert_eq!(fact.customer_name, "Petrov Ivan");
    assert_eq!(fact.success_rate, 95.00);
    assert_eq!(fact.report_date, date(2024, 1, 15));
    assert_eq!(fact.report_hour, 10);

    let report = daily_rollup(&facts, "ivan.petrov", date(2024, 1, 15)).expect("daily report");
    assert_eq!(report.daily_movements, 100);
    assert_eq!(report.daily_successful, 95);
    assert_eq!(report.daily_success_rate, 95.00);
    assert_eq!(report.active_hours, 1);
    assert_eq!(report.daily_errors, 1);
    assert_eq!(report.avg_response_time_ms, 80.0);
}

#[test]
fn zero_movements_row_still_present() {
    let index = ReferenceIndex::build(vec![reference(
        "CHIP-1",
        "ivan.petrov",
        "Petrov",
        "Ivan",
        None,
    )]);
    let rows = vec![telemetry("CHIP-1", hour(2024, 1, 15, 3), 0, 0, 0.0, 50.0, 0)];

    let (facts, stats) = run_transform(&rows, &index, Utc::now());
    assert_eq!(stats.produced, 1);
    assert_mart_invariants(&facts);

    assert_eq!(facts[0].success_rate, 0.00);
    assert!(!facts[0].success_rate.is_nan());

    let report = daily_rollup(&facts, "ivan.petrov", date(2024, 1, 15)).expect("daily report");
    assert_eq!(report.daily_success_rate, 0.00);
    assert_eq!(report.active_hours, 1);
}

#[test]
fn orphan_telemetry_never_reaches_the_mart() {
    let index = ReferenceIndex::build(vec![reference(
        "CHIP-1",
        "ivan.petrov",
        "Petrov",
        "Ivan",
        None,
    )]);

    // Three hourly rows for an unknown chip, one good row.
    let rows = vec![
        telemetry("CHIP-UNKNOWN", hour(2024, 1, 15, 8), 10, 10, 70.0, 60.0, 0),
        telemetry("CHIP-UNKNOWN", hour(2024, 1, 15, 9), 12, 11, 70.0, 60.0, 0),
        telemetry("CHIP-UNKNOWN", hour(2024, 1, 15, 10), 9, 9, 70.0, 60.0, 0),
        telemetry("CHIP-1", hour(2024, 1, 15, 10), 100, 95, 80.0, 70.0, 0),
    ];

    let (facts, stats) = run_transform(&rows, &index, Utc::now());

    // The orphan counter reflects exactly the dropped hourly rows.
    assert_eq!(stats.orphans, 3);
    assert_eq!(facts.len(), 1);
    assert!(facts.iter().all(|f| f.chip_id == "CHIP-1"));
    assert_mart_invariants(&facts);
}

#[test]
fn invalid_metric_rows_never_reach_the_mart() {
    let index = ReferenceIndex::build(vec![reference(
        "CHIP-1",
        "ivan.petrov",
        "Petrov",
        "Ivan",
        None,
    )]);

    let mut corrupted = telemetry("CHIP-1", hour(2024, 1, 15, 11), 50, 40, 80.0, 70.0, 0);
    corrupted.avg_battery_level = 250.0;

    let rows = vec![
        telemetry("CHIP-1", hour(2024, 1, 15, 10), 100, 95, 80.0, 70.0, 0),
        corrupted,
    ];

    let (facts, stats) = run_transform(&rows, &index, Utc::now());
    assert_eq!(stats.invalid, 1);
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].report_hour, 10);
    assert_mart_invariants(&facts);
}

#[test]
fn late_arriving_correction_supersedes_earlier_run() {
    let index = ReferenceIndex::build(vec![reference(
        "CHIP-1",
        "ivan.petrov",
        "Petrov",
        "Ivan",
        None,
    )]);

    // Run A sees hour 10 with 100 movements.
    let run_a_rows = vec![telemetry("CHIP-1", hour(2024, 1, 15, 10), 100, 95, 80.0, 70.0, 1)];
    let (mut mart, _) = run_transform(
        &run_a_rows,
        &index,
        Utc.with_ymd_and_hms(2024, 1, 15, 11, 15, 0).unwrap(),
    );

    // The upstream aggregator rewrites hour 10; run B re-extracts it
    // inside the lookback and loads a higher version.
    let run_b_rows = vec![telemetry("CHIP-1", hour(2024, 1, 15, 10), 120, 110, 78.0, 69.0, 1)];
    let (run_b_facts, _) = run_transform(
        &run_b_rows,
        &index,
        Utc.with_ymd_and_hms(2024, 1, 15, 11, 30, 0).unwrap(),
    );
    mart.extend(run_b_facts);

    assert_mart_invariants(&mart);

    let report = daily_rollup(&mart, "ivan.petrov", date(2024, 1, 15)).expect("daily report");
    assert_eq!(report.daily_movements, 120);
    assert_eq!(report.daily_successful, 110);
    assert_eq!(report.active_hours, 1);
}

#[test]
fn double_run_produces_identical_views() {
    let index = ReferenceIndex::build(vec![reference(
        "CHIP-1",
        "ivan.petrov",
        "Petrov",
        "Ivan",
        Some("Sergeevich"),
    )]);

    let source_rows = vec![
        telemetry("CHIP-1", hour(2024, 1, 15, 9), 40, 36, 82.0, 71.0, 0),
        telemetry("CHIP-1", hour(2024, 1, 15, 10), 100, 95, 80.0, 70.0, 1),
        telemetry("CHIP-1", hour(2024, 1, 16, 7), 55, 54, 75.0, 88.0, 2),
    ];

    // Identical source snapshot and processed_at-inducing inputs.
    let processed_at = Utc.with_ymd_and_hms(2024, 1, 16, 8, 0, 0).unwrap();
    let (run_one, _) = run_transform(&source_rows, &index, processed_at);
    let (run_two, _) = run_transform(&source_rows, &index, processed_at);

    // Both runs land in the mart; the views must not see duplicates.
    let mut mart = run_one.clone();
    mart.extend(run_two);
    assert_mart_invariants(&mart);

    let from_single = daily_rollup(&run_one, "ivan.petrov", date(2024, 1, 15));
    let from_double = daily_rollup(&mart, "ivan.petrov", date(2024, 1, 15));
    assert_eq!(from_single, from_double);

    let summary_single = summary_rollup(&run_one, "ivan.petrov");
    let summary_double = summary_rollup(&mart, "ivan.petrov");
    assert_eq!(summary_single, summary_double);

    let summary = summary_double.expect("summary");
    assert_eq!(summary.first_activity_date, date(2024, 1, 15));
    assert_eq!(summary.last_activity_date, date(2024, 1, 16));
    assert_eq!(summary.total_days, 2);
    assert_eq!(summary.active_days, 2);
    assert_eq!(summary.total_movements, 195);

    // Middle name is folded into the display name without a trailing
    // space.
    assert_eq!(run_one[0].customer_name, "Petrov Ivan Sergeevich");
}

#[test]
fn daily_success_rate_round_trips_with_direct_formula() {
    let index = ReferenceIndex::build(vec![reference(
        "CHIP-1",
        "ivan.petrov",
        "Petrov",
        "Ivan",
        None,
    )]);

    let rows = vec![
        telemetry("CHIP-1", hour(2024, 1, 15, 8), 33, 11, 80.0, 70.0, 0),
        telemetry("CHIP-1", hour(2024, 1, 15, 9), 67, 21, 80.0, 70.0, 0),
    ];

    let (facts, _) = run_transform(&rows, &index, Utc::now());
    let report = daily_rollup(&facts, "ivan.petrov", date(2024, 1, 15)).expect("daily report");

    let direct = ((11 + 21) as f64 / (33 + 67) as f64 * 100.0 * 100.0).round() / 100.0;
    assert_eq!(report.daily_success_rate, direct);
    assert_eq!(report.daily_success_rate, 32.0);
}

#[test]
fn utc_hour_attribution_across_midnight() {
    let index = ReferenceIndex::build(vec![reference(
        "CHIP-1",
        "ivan.petrov",
        "Petrov",
        "Ivan",
        None,
    )]);

    // Hours straddling a UTC midnight land on their own dates.
    let rows = vec![
        telemetry("CHIP-1", hour(2024, 3, 31, 23), 10, 10, 80.0, 70.0, 0),
        telemetry("CHIP-1", hour(2024, 4, 1, 0), 20, 20, 80.0, 70.0, 0),
    ];

    let (facts, _) = run_transform(&rows, &index, Utc::now());
    assert_mart_invariants(&facts);

    let march = daily_rollup(&facts, "ivan.petrov", date(2024, 3, 31)).expect("march report");
    assert_eq!(march.daily_movements, 10);
    assert_eq!(march.active_hours, 1);

    let april = daily_rollup(&facts, "ivan.petrov", date(2024, 4, 1)).expect("april report");
    assert_eq!(april.daily_movements, 20);
    assert_eq!(april.active_hours, 1);
}

#[test]
fn reference_without_telemetry_produces_no_facts() {
    let index = ReferenceIndex::build(vec![
        reference("CHIP-1", "ivan.petrov", "Petrov", "Ivan", None),
        reference("CHIP-2", "anna.sidorova", "Sidorova", "Anna", None),
    ]);

    let rows = vec![telemetry("CHIP-1", hour(2024, 1, 15, 10), 100, 95, 80.0, 70.0, 0)];
    let (facts, stats) = run_transform(&rows, &index, Utc::now());

    // Absence is reported as "no active hours", not as a zero row.
    assert_eq!(stats.produced, 1);
    assert!(daily_rollup(&facts, "anna.sidorova", date(2024, 1, 15)).is_none());
    assert!(summary_rollup(&facts, "anna.sidorova").is_none());
}
