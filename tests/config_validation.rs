use mergeline::{ConfigError, PipelineConfig};
use serde_json::json;

#[test]
fn empty_object_yields_defaults() {
    let config = PipelineConfig::from_value(json!({})).expect("defaults are valid");
    assert_eq!(config, PipelineConfig::default());
}

#[test]
fn partial_overrides_keep_remaining_defaults() {
    let config = PipelineConfig::from_value(json!({
        "trigger": { "interval_ms": 250 },
        "merge_backoff": { "max_attempts": 8 },
    }))
    .expect("overrides are valid");
    assert_eq!(config.trigger.interval_ms, 250);
    assert_eq!(
        config.trigger.record_cap,
        PipelineConfig::default().trigger.record_cap
    );
    assert_eq!(config.merge_backoff.max_attempts, 8);
    assert_eq!(
        config.analytical_backoff,
        PipelineConfig::default().analytical_backoff
    );
}

#[test]
fn non_object_blobs_are_rejected() {
    let err = PipelineConfig::from_value(json!([1, 2, 3])).unwrap_err();
    assert!(matches!(err, ConfigError::NotAnObject));
}

#[test]
fn zero_knobs_are_rejected_not_clamped() {
    for blob in [
        json!({"trigger": {"interval_ms": 0}}),
        json!({"trigger": {"record_cap": 0}}),
        json!({"trigger": {"queue_capacity": 0}}),
        json!({"dedup": {"max_batch_events": 0}}),
        json!({"dedup": {"workers": 0}}),
        json!({"merge_backoff": {"max_attempts": 0}}),
        json!({"analytical_backoff": {"max_attempts": 0}}),
    ] {
        let err = PipelineConfig::from_value(blob.clone()).unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid(_)),
            "expected rejection for {blob}"
        );
    }
}
