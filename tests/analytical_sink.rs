use mergeline::{
    AnalyticalError, AnalyticalRow, AnalyticalSink, AnalyticalStore, BackoffPolicy,
    MemoryAnalyticalStore,
};
use serde_json::json;

fn rows(version: u64, count: u64) -> Vec<AnalyticalRow> {
    (0..count)
        .map(|idx| AnalyticalRow {
            dedup_key: format!("key-{idx}"),
            principal_id: format!("user-{idx}"),
            event_type: "order.placed".into(),
            event_timestamp_ms: 1,
            payload: json!({"n": idx}),
            version,
        })
        .collect()
}

fn policy(max_attempts: u32) -> BackoffPolicy {
    BackoffPolicy {
        base_delay_ms: 0,
        multiplier: 2,
        max_delay_ms: 0,
        max_attempts,
    }
}

#[test]
fn compaction_keeps_the_highest_version_per_key() {
    let mut store = MemoryAnalyticalStore::new();
    store.append(&rows(1, 3)).expect("append succeeds");
    store.append(&rows(2, 3)).expect("append succeeds");
    store.append(&rows(1, 3)).expect("append succeeds");
    assert_eq!(store.rows().len(), 9);

    let compacted = store.compacted();
    assert_eq!(compacted.len(), 3);
    for row in compacted.values() {
        assert_eq!(row.version, 2);
    }
}

#[test]
fn failed_appends_are_parked_and_retried() {
    let mut store = MemoryAnalyticalStore::new();
    store.queue_failure(AnalyticalError("backend busy".into()));
    let mut sink = AnalyticalSink::new(store, policy(3));

    sink.append(rows(1, 4));
    assert_eq!(sink.pending_len(), 1);
    assert!(sink.store().rows().is_empty());

    let exhausted = sink.retry_pending();
    assert!(exhausted.is_empty());
    assert_eq!(sink.pending_len(), 0);
    assert_eq!(sink.store().rows().len(), 4);
    assert_eq!(sink.retries_total(), 1);
}

#[test]
fn retry_exhaustion_escalates_and_drops_the_rows() {
    let mut store = MemoryAnalyticalStore::new();
    for _ in 0..10 {
        store.queue_failure(AnalyticalError("backend down".into()));
    }
    let mut sink = AnalyticalSink::new(store, policy(2));

    sink.append(rows(9, 5));
    let mut exhausted = Vec::new();
    for _ in 0..4 {
        exhausted.extend(sink.retry_pending());
    }
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].version, 9);
    assert_eq!(exhausted[0].rows, 5);
    assert_eq!(exhausted[0].attempts, 2);
    assert_eq!(sink.pending_len(), 0);
    assert!(sink.store().rows().is_empty());
}

#[test]
fn empty_appends_are_skipped() {
    let mut sink = AnalyticalSink::new(MemoryAnalyticalStore::new(), policy(1));
    sink.append(Vec::new());
    assert_eq!(sink.pending_len(), 0);
}
