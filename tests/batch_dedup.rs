use mergeline::{dedupe, derive, DedupConfig, DedupError, Event, EventTimestamp, FingerprintedEvent};
use serde_json::{json, Value};

fn fingerprinted(principal: &str, ts_ms: i64, payload: Value, sequence: u64) -> FingerprintedEvent {
    let event = Event::new(
        "p0",
        sequence,
        principal,
        "session.start",
        EventTimestamp::from_epoch_ms(ts_ms),
        payload,
    );
    let key = derive(&event).expect("identity fields present");
    FingerprintedEvent::new(event, key, sequence)
}

#[test]
fn exact_duplicates_keep_the_first_arrival() {
    let events = vec![
        fingerprinted("user-1", 1, json!({"v": 1}), 0),
        fingerprinted("user-2", 1, json!({"v": 2}), 1),
        fingerprinted("user-1", 1, json!({"v": 1}), 2),
        fingerprinted("user-1", 1, json!({"v": 1}), 3),
    ];
    let result = dedupe(events, &DedupConfig::default()).expect("within bound");
    assert_eq!(result.unique().len(), 2);
    assert_eq!(result.exact_duplicates(), 2);
    assert_eq!(result.divergent_payloads(), 0);
    // Survivor for user-1 is the sequence-0 arrival.
    assert_eq!(result.unique()[0].sequence(), 0);
    assert_eq!(result.unique()[1].sequence(), 1);
}

#[test]
fn divergent_payloads_resolve_last_arrival_wins() {
    let events = vec![
        fingerprinted("user-1", 1, json!({"v": 1}), 0),
        fingerprinted("user-1", 1, json!({"v": 2}), 1),
        fingerprinted("user-1", 1, json!({"v": 3}), 2),
    ];
    let result = dedupe(events, &DedupConfig::default()).expect("within bound");
    assert_eq!(result.unique().len(), 1);
    assert_eq!(result.divergent_payloads(), 2);
    assert_eq!(result.unique()[0].event().payload(), &json!({"v": 3}));
}

#[test]
fn output_is_ordered_by_arrival_sequence() {
    let events = vec![
        fingerprinted("user-3", 3, json!({}), 0),
        fingerprinted("user-1", 1, json!({}), 1),
        fingerprinted("user-2", 2, json!({}), 2),
    ];
    let result = dedupe(events, &DedupConfig::default()).expect("within bound");
    let sequences: Vec<u64> = result.unique().iter().map(|e| e.sequence()).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
}

#[test]
fn parallel_fanout_matches_sequential_exactly() {
    let mut events = Vec::new();
    for idx in 0..600u64 {
        // 200 distinct identities, each delivered three times: twice with
        // the same payload and once divergent.
        let principal = format!("user-{}", idx % 200);
        let payload = if idx >= 400 {
            json!({"divergent": idx})
        } else {
            json!({"stable": idx % 200})
        };
        events.push(fingerprinted(&principal, 7, payload, idx));
    }

    let sequential = dedupe(
        events.clone(),
        &DedupConfig {
            max_batch_events: 10_000,
            workers: 1,
        },
    )
    .expect("within bound");
    let parallel = dedupe(
        events,
        &DedupConfig {
            max_batch_events: 10_000,
            workers: 4,
        },
    )
    .expect("within bound");

    assert_eq!(sequential.unique(), parallel.unique());
    assert_eq!(sequential.exact_duplicates(), parallel.exact_duplicates());
    assert_eq!(
        sequential.divergent_payloads(),
        parallel.divergent_payloads()
    );
}

#[test]
fn oversized_windows_are_rejected() {
    let events = vec![
        fingerprinted("user-1", 1, json!({}), 0),
        fingerprinted("user-2", 2, json!({}), 1),
        fingerprinted("user-3", 3, json!({}), 2),
    ];
    let err = dedupe(
        events,
        &DedupConfig {
            max_batch_events: 2,
            workers: 1,
        },
    )
    .unwrap_err();
    assert_eq!(
        err,
        DedupError::BatchTooLarge {
            events: 3,
            bound: 2
        }
    );
}
