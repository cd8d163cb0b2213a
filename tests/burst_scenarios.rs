use mergeline::{
    Alert, BackoffPolicy, DedupSettings, MemoryAnalyticalStore, MemoryCheckpointStore, MemoryLog,
    MemoryMergeTable, Pipeline, PipelineConfig, RecordingAlertSink, TriggerConfig,
};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;

const BURST: u64 = 11_000;
const UNIQUE: u64 = 10_000;

fn record(idx: u64) -> Value {
    json!({
        "principal_id": format!("user-{idx}"),
        "event_type": "order.placed",
        "event_timestamp": idx as i64,
        "payload": {"who": format!("user-{idx}")},
    })
}

fn config(record_cap: usize) -> PipelineConfig {
    PipelineConfig {
        trigger: TriggerConfig {
            interval_ms: 100,
            record_cap,
            queue_capacity: 50_000,
        },
        dedup: DedupSettings {
            max_batch_events: 50_000,
            workers: 4,
        },
        merge_backoff: BackoffPolicy {
            base_delay_ms: 0,
            multiplier: 2,
            max_delay_ms: 0,
            max_attempts: 3,
        },
        analytical_backoff: BackoffPolicy {
            base_delay_ms: 0,
            multiplier: 2,
            max_delay_ms: 0,
            max_attempts: 2,
        },
    }
}

type TestPipeline = Pipeline<MemoryLog, MemoryMergeTable, MemoryAnalyticalStore, MemoryCheckpointStore>;

fn pipeline(log: MemoryLog, record_cap: usize) -> (TestPipeline, Rc<RefCell<Vec<Alert>>>) {
    let alerts = RecordingAlertSink::new();
    let handle = alerts.handle();
    let mut pipeline = Pipeline::new(
        config(record_cap),
        log,
        MemoryMergeTable::new(),
        MemoryAnalyticalStore::new(),
        MemoryCheckpointStore::new(),
        Box::new(alerts),
    );
    pipeline.recover().expect("recovery succeeds");
    (pipeline, handle)
}

// 10,000 distinct identities plus 1,000 exact replays of the first thousand.
fn burst_log() -> MemoryLog {
    let mut log = MemoryLog::new();
    for idx in 0..UNIQUE {
        log.append("p0", record(idx));
    }
    for idx in 0..(BURST - UNIQUE) {
        log.append("p0", record(idx));
    }
    log
}

#[test]
fn burst_with_duplicates_collapses_to_unique_rows() {
    let (mut pipeline, _alerts) = pipeline(burst_log(), 20_000);
    let report = pipeline.run_tick(0).expect("tick succeeds");

    assert_eq!(report.batches_committed, 1);
    assert_eq!(report.events_merged, UNIQUE);
    assert_eq!(pipeline.merge_store().row_count(), UNIQUE as usize);
    let last = pipeline.telemetry().last_batch.as_ref().unwrap();
    assert_eq!(last.records, BURST);
    assert_eq!(last.exact_duplicates, BURST - UNIQUE);
    assert_eq!(last.rows_inserted, UNIQUE);
    assert_eq!(last.rows_updated, 0);
}

#[test]
fn replaying_the_burst_changes_nothing_but_versions() {
    let (mut pipeline, _alerts) = pipeline(burst_log(), 20_000);
    pipeline.run_tick(0).expect("tick succeeds");
    let state_before = pipeline.merge_store().logical_state();

    // Upstream redelivers the identical burst at fresh offsets.
    for idx in 0..UNIQUE {
        pipeline.source_mut().append("p0", record(idx));
    }
    for idx in 0..(BURST - UNIQUE) {
        pipeline.source_mut().append("p0", record(idx));
    }
    pipeline.run_tick(100).expect("tick succeeds");

    assert_eq!(pipeline.merge_store().row_count(), UNIQUE as usize);
    assert_eq!(pipeline.merge_store().logical_state(), state_before);
    let last = pipeline.telemetry().last_batch.as_ref().unwrap();
    assert_eq!(last.rows_inserted, 0);
    assert_eq!(last.rows_updated, 0);
    assert_eq!(last.rows_unchanged, UNIQUE);
    // Every row was touched by the second transaction.
    for row in pipeline.merge_store().rows_sorted() {
        assert_eq!(row.merge_version, 2);
    }
}

#[test]
fn burst_over_the_record_cap_splits_into_ordered_batches() {
    let mut log = MemoryLog::new();
    for idx in 0..BURST {
        log.append("p0", record(idx));
    }
    let (mut pipeline, _alerts) = pipeline(log, 10_000);

    let report = pipeline.run_tick(0).expect("tick succeeds");
    assert_eq!(report.batches_committed, 2);
    assert_eq!(pipeline.merge_store().row_count(), BURST as usize);
    assert_eq!(pipeline.merge_store().merges_committed(), 2);
    assert_eq!(pipeline.telemetry().batches_total, 2);

    let checkpoints = pipeline.checkpoint_store().records();
    assert_eq!(checkpoints.len(), 2);
    assert_eq!(checkpoints[0].batch_id, 1);
    assert_eq!(checkpoints[1].batch_id, 2);
    assert_eq!(pipeline.cursor().get("p0"), Some(&BURST));

    // Quiet intervals open no merge transaction.
    pipeline.run_tick(100).expect("tick succeeds");
    pipeline.run_tick(200).expect("tick succeeds");
    assert_eq!(pipeline.telemetry().empty_ticks_total, 2);
    assert_eq!(pipeline.merge_store().merges_committed(), 2);
    assert_eq!(pipeline.telemetry().batches_total, 2);
}

#[test]
fn parallel_dedup_matches_the_single_worker_result() {
    let (mut parallel, _a) = pipeline(burst_log(), 20_000);
    parallel.run_tick(0).expect("tick succeeds");

    let alerts = RecordingAlertSink::new();
    let mut sequential_config = config(20_000);
    sequential_config.dedup.workers = 1;
    let mut sequential = Pipeline::new(
        sequential_config,
        burst_log(),
        MemoryMergeTable::new(),
        MemoryAnalyticalStore::new(),
        MemoryCheckpointStore::new(),
        Box::new(alerts),
    );
    sequential.recover().expect("recovery succeeds");
    sequential.run_tick(0).expect("tick succeeds");

    assert_eq!(
        parallel.merge_store().logical_state(),
        sequential.merge_store().logical_state()
    );
    assert_eq!(
        parallel.telemetry().last_batch.as_ref().unwrap().exact_duplicates,
        sequential.telemetry().last_batch.as_ref().unwrap().exact_duplicates
    );
}
