mod common;

use std::time::Duration;

use chrono::NaiveDate;
use common::Harness;
use flights_etl::store::JsonlOutcomeStore;
use flights_etl::tables::{LOAD_ORDER, TRANSFORM_STEPS};
use flights_etl::{EtlError, OutcomeStore, PipelineConfig, ScheduleTrigger, TaskState, Value};
use tokio_util::sync::CancellationToken;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()
}

#[tokio::test]
async fn full_run_stages_loads_and_transforms() {
    let harness = Harness::seeded();
    let pipeline = harness.pipeline(PipelineConfig::default());

    let record = pipeline.run(day()).await.unwrap();
    let report = record.report();
    assert!(report.is_success(), "{report}");
    assert_eq!(report.succeeded.len(), 24);

    let keys = harness.blobs.keys("extracted-data").await;
    assert_eq!(keys.len(), 8);
    assert!(keys.contains(&"temp/ticket_flights.csv".to_string()));

    assert_eq!(harness.warehouse.row_count("stg.tickets"), 2);
    assert_eq!(harness.warehouse.row_count("stg.seats"), 2);
    assert_eq!(harness.warehouse.row_count("stg.flights"), 1);

    let flights = harness.warehouse.table("stg.flights").unwrap();
    let actual_departure = flights.column_index("actual_departure").unwrap();
    assert_eq!(flights.rows()[0][actual_departure], Value::Null);

    let transforms: Vec<String> = harness
        .warehouse
        .committed_statements()
        .into_iter()
        .filter(|s| s.starts_with("INSERT INTO mart."))
        .collect();
    let expected: Vec<String> = TRANSFORM_STEPS
        .iter()
        .map(|s| format!("INSERT INTO mart.{s} SELECT * FROM stg.source_for_{s}"))
        .collect();
    assert_eq!(transforms, expected);
}

#[tokio::test]
async fn execution_order_follows_group_edges() {
    let harness = Harness::seeded();
    let record = harness
        .pipeline(PipelineConfig::default())
        .run(day())
        .await
        .unwrap();

    let order = &record.execution_order;
    assert_eq!(order.len(), 24);
    assert!(order[..8].iter().all(|id| id.starts_with("extract.")));

    let loads: Vec<&str> = order[8..16]
        .iter()
        .map(|id| id.trim_start_matches("load."))
        .collect();
    assert_eq!(loads, LOAD_ORDER);

    let transforms: Vec<&str> = order[16..]
        .iter()
        .map(|id| id.trim_start_matches("transform."))
        .collect();
    assert_eq!(transforms, TRANSFORM_STEPS);
}

#[tokio::test]
async fn rerun_leaves_staging_unchanged() {
    let harness = Harness::seeded();
    let pipeline = harness.pipeline(PipelineConfig::default());

    pipeline.run(day()).await.unwrap();
    let first = harness.warehouse.table("stg.tickets").unwrap();
    pipeline.run(day()).await.unwrap();
    let second = harness.warehouse.table("stg.tickets").unwrap();

    assert_eq!(first, second);
    assert_eq!(harness.warehouse.row_count("stg.ticket_flights"), 1);
}

#[tokio::test]
async fn load_failure_skips_rest_of_chain_and_transform() {
    let harness = Harness::seeded();
    harness
        .warehouse
        .fail_statements_containing("\"stg\".\"bookings\"");
    let record = harness
        .pipeline(PipelineConfig::default())
        .run(day())
        .await
        .unwrap();

    assert_eq!(record.state_of("load.aircrafts_data"), Some(TaskState::Success));
    assert_eq!(record.state_of("load.airports_data"), Some(TaskState::Success));
    assert_eq!(record.state_of("load.bookings"), Some(TaskState::Failed));
    for table in &LOAD_ORDER[3..] {
        assert_eq!(
            record.state_of(&format!("load.{table}")),
            Some(TaskState::UpstreamFailed),
            "load.{table}"
        );
    }
    for step in TRANSFORM_STEPS {
        assert_eq!(record.state_of(&format!("transform.{step}")), Some(TaskState::UpstreamFailed));
    }
    assert!(!record.execution_order.iter().any(|id| id.starts_with("transform.")));

    let report = record.report();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].task_id, "load.bookings");
    assert!(report.failures[0].error.contains("upsert into stg.bookings failed"));
    assert_eq!(report.skipped.len(), 13);

    let skipped = record.outcome("load.tickets").unwrap();
    assert!(skipped.error.as_deref().unwrap().contains("load.bookings"));
    assert!(skipped.started_at.is_none());

    // Earlier steps keep their committed rows.
    assert_eq!(harness.warehouse.row_count("stg.aircrafts_data"), 2);
    assert_eq!(harness.warehouse.row_count("stg.tickets"), 0);
    assert_eq!(harness.warehouse.rollbacks(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_ticket_flights_extract_times_out_and_blocks_load() {
    let harness = Harness::seeded();
    harness
        .source
        .delay_query(&harness.query_for("ticket_flights"), Duration::from_secs(11 * 60));

    let record = harness
        .pipeline(PipelineConfig::default())
        .run(day())
        .await
        .unwrap();

    assert_eq!(record.state_of("extract.ticket_flights"), Some(TaskState::TimedOut));
    for table in LOAD_ORDER.iter().filter(|t| **t != "ticket_flights") {
        assert_eq!(record.state_of(&format!("extract.{table}")), Some(TaskState::Success));
    }
    assert!(record.group_failed("extract"));
    assert!(
        record
            .outcomes
            .values()
            .filter(|o| o.group != "extract")
            .all(|o| o.state == TaskState::UpstreamFailed)
    );
    assert!(!harness.blobs.keys("extracted-data").await.contains(&"temp/ticket_flights.csv".to_string()));
    assert_eq!(harness.warehouse.commits(), 0);
}

#[tokio::test(start_paused = true)]
async fn ticket_flights_within_its_longer_budget_succeeds() {
    let harness = Harness::seeded();
    harness
        .source
        .delay_query(&harness.query_for("ticket_flights"), Duration::from_secs(7 * 60));

    let record = harness
        .pipeline(PipelineConfig::default())
        .run(day())
        .await
        .unwrap();
    assert!(record.report().is_success());
}

#[tokio::test]
async fn blob_store_failure_fails_extract() {
    let harness = Harness::seeded();
    harness.blobs.fail_key("extracted-data", "temp/seats.csv").await;

    let record = harness
        .pipeline(PipelineConfig::default())
        .run(day())
        .await
        .unwrap();

    let outcome = record.outcome("extract.seats").unwrap();
    assert_eq!(outcome.state, TaskState::Failed);
    assert!(outcome.error.as_deref().unwrap().starts_with("extraction of seats failed"));
    assert_eq!(record.state_of("extract.tickets"), Some(TaskState::Success));
    assert_eq!(record.state_of("load.aircrafts_data"), Some(TaskState::UpstreamFailed));
}

#[tokio::test]
async fn outcome_log_answers_task_success() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("outcomes.jsonl");
    let harness = Harness::seeded();
    harness.warehouse.fail_statements_containing("dim_seat");

    let config = PipelineConfig {
        outcome_log: Some(log.clone()),
        ..Default::default()
    };
    let record = harness.pipeline(config).run(day()).await.unwrap();

    let store = JsonlOutcomeStore::new(&log);
    assert!(store.task_succeeded(record.run_id, "load.seats").await.unwrap());
    assert!(!store.task_succeeded(record.run_id, "transform.dim_seat").await.unwrap());
    assert!(!store.task_succeeded(record.run_id, "transform.fct_boarding_pass").await.unwrap());

    let dim_seat = store
        .task_outcome(record.run_id, "transform.dim_seat")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dim_seat.state, TaskState::Failed);
    assert!(dim_seat.finished_at.is_some());
    assert_eq!(store.run_outcomes(record.run_id).await.unwrap().len(), 24);
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_stops_before_load() {
    let harness = Harness::seeded();
    harness
        .source
        .delay_query(&harness.query_for("flights"), Duration::from_secs(120));
    let pipeline = harness.pipeline(PipelineConfig::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.cancel();
    });

    let err = pipeline.run_with(day(), cancel).await.unwrap_err();
    assert!(matches!(err, EtlError::ContextCancelled(_)));
    assert_eq!(harness.warehouse.commits(), 0);
}

#[tokio::test(start_paused = true)]
async fn scheduled_run_covers_the_day_that_ended() {
    use chrono::{TimeDelta, TimeZone, Utc};

    let harness = Harness::seeded();
    let pipeline = harness.pipeline(PipelineConfig::default());

    let base = Utc.with_ymd_and_hms(2024, 1, 5, 23, 0, 0).unwrap();
    let start = tokio::time::Instant::now();
    let trigger = ScheduleTrigger::new(&pipeline.config().schedule)
        .unwrap()
        .with_clock(move || base + TimeDelta::from_std(start.elapsed()).unwrap());

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
        stop.cancel();
    });

    pipeline.run_on(&trigger, cancel).await.unwrap();

    let transforms = harness
        .warehouse
        .committed_statements()
        .into_iter()
        .filter(|s| s.starts_with("INSERT INTO mart."))
        .count();
    assert_eq!(transforms, TRANSFORM_STEPS.len());
    assert_eq!(harness.warehouse.row_count("stg.tickets"), 2);
}
