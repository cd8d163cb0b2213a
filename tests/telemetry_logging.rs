use mergeline::{BatchTelemetry, JsonLineLogger, LogLevel, LogRotationPolicy, PipelineTelemetry};

#[test]
fn records_are_serialized_as_json_lines() {
    let mut logger = JsonLineLogger::new(LogRotationPolicy::default());
    logger
        .log(1_000, LogLevel::Info, "merge", 7, "committed batch")
        .expect("log succeeds");
    let lines: Vec<&String> = logger.files().flat_map(|file| file.lines()).collect();
    assert_eq!(lines.len(), 1);
    let parsed: serde_json::Value = serde_json::from_str(lines[0]).expect("line is JSON");
    assert_eq!(parsed["level"], "INFO");
    assert_eq!(parsed["stage"], "merge");
    assert_eq!(parsed["batch_id"], 7);
}

#[test]
fn entries_below_the_level_are_suppressed() {
    let mut logger = JsonLineLogger::new(LogRotationPolicy::default());
    logger.set_level(LogLevel::Warn);
    logger
        .log(1, LogLevel::Info, "ingest", 1, "dropped record")
        .expect("log succeeds");
    logger
        .log(2, LogLevel::Error, "merge", 1, "parked")
        .expect("log succeeds");
    let lines: Vec<&String> = logger.files().flat_map(|file| file.lines()).collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("parked"));
}

#[test]
fn rotation_bounds_segment_size_and_history() {
    let mut logger = JsonLineLogger::new(LogRotationPolicy {
        max_bytes: 120,
        max_files: 2,
    });
    for idx in 0..20 {
        logger
            .log(idx, LogLevel::Info, "merge", idx, "rotating line")
            .expect("log succeeds");
    }
    let files: Vec<_> = logger.files().collect();
    assert!(files.len() <= 3);
    for file in &files {
        assert!(file.bytes_written() <= 240);
    }
}

#[test]
fn pipeline_totals_accumulate_batches() {
    let mut totals = PipelineTelemetry::default();
    totals.record_batch(BatchTelemetry {
        batch_id: 1,
        records: 100,
        exact_duplicates: 10,
        divergent_payloads: 2,
        dropped_events: 1,
        rows_inserted: 80,
        rows_updated: 2,
        rows_unchanged: 5,
        merge_attempts: 1,
        latency_ms: 3,
    });
    totals.record_batch(BatchTelemetry {
        batch_id: 2,
        records: 50,
        exact_duplicates: 5,
        divergent_payloads: 0,
        dropped_events: 0,
        rows_inserted: 40,
        rows_updated: 5,
        rows_unchanged: 0,
        merge_attempts: 2,
        latency_ms: 4,
    });
    assert_eq!(totals.batches_total, 2);
    assert_eq!(totals.events_total, 150);
    assert_eq!(totals.exact_duplicates_total, 15);
    assert_eq!(totals.rows_inserted_total, 120);
    assert_eq!(totals.last_batch.as_ref().map(|b| b.batch_id), Some(2));
}
