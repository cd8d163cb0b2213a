use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Identity field names required on every ingested record.
pub const REQUIRED_IDENTITY_FIELDS: [&str; 3] =
    ["principal_id", "event_type", "event_timestamp"];

/// Error raised while validating a record at the ingestion boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("required identity field {field} is missing or empty")]
    MissingField { field: &'static str },
    #[error("event_timestamp {raw} is neither epoch milliseconds nor RFC 3339")]
    InvalidTimestamp { raw: String },
}

/// Event timestamp normalized to UTC epoch milliseconds.
///
/// Upstream producers send either an integer epoch-ms value or an RFC 3339
/// string; both collapse to the same canonical representation so the derived
/// fingerprint is independent of the producer's locale and timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventTimestamp(i64);

impl EventTimestamp {
    /// Wraps an already-canonical epoch-ms value.
    pub fn from_epoch_ms(ms: i64) -> Self {
        Self(ms)
    }

    /// Parses the raw JSON form delivered by upstream producers.
    pub fn parse(raw: &Value) -> Result<Self, EventError> {
        match raw {
            Value::Number(num) => num
                .as_i64()
                .map(Self)
                .ok_or_else(|| invalid_timestamp(raw)),
            Value::String(text) => DateTime::parse_from_rfc3339(text)
                .map(|parsed| Self(parsed.with_timezone(&Utc).timestamp_millis()))
                .map_err(|_| invalid_timestamp(raw)),
            _ => Err(invalid_timestamp(raw)),
        }
    }

    /// Canonical epoch-ms value.
    pub fn epoch_ms(self) -> i64 {
        self.0
    }
}

fn invalid_timestamp(raw: &Value) -> EventError {
    EventError::InvalidTimestamp {
        raw: raw.to_string(),
    }
}

/// Immutable record delivered by the upstream partitioned log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    partition_id: String,
    offset: u64,
    principal_id: String,
    event_type: String,
    event_timestamp: EventTimestamp,
    payload: Value,
}

impl Event {
    pub fn new(
        partition_id: impl Into<String>,
        offset: u64,
        principal_id: impl Into<String>,
        event_type: impl Into<String>,
        event_timestamp: EventTimestamp,
        payload: Value,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            offset,
            principal_id: principal_id.into(),
            event_type: event_type.into(),
            event_timestamp,
            payload,
        }
    }

    /// Validates a raw JSON record against the upstream contract and builds
    /// the event. Rejection here is per-record and never fails a batch.
    pub fn from_record(
        partition_id: impl Into<String>,
        offset: u64,
        record: &Value,
    ) -> Result<Self, EventError> {
        let principal_id = required_string(record, "principal_id")?;
        let event_type = required_string(record, "event_type")?;
        let raw_ts = record
            .get("event_timestamp")
            .ok_or(EventError::MissingField {
                field: "event_timestamp",
            })?;
        let event_timestamp = EventTimestamp::parse(raw_ts)?;
        let payload = record.get("payload").cloned().unwrap_or(Value::Null);
        Ok(Self {
            partition_id: partition_id.into(),
            offset,
            principal_id,
            event_type,
            event_timestamp,
            payload,
        })
    }

    /// Partition the upstream log delivered this record on.
    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Offset within the partition; defines arrival order.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_timestamp(&self) -> EventTimestamp {
        self.event_timestamp
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

fn required_string(record: &Value, field: &'static str) -> Result<String, EventError> {
    match record.get(field).and_then(Value::as_str) {
        Some(text) if !text.is_empty() => Ok(text.to_string()),
        _ => Err(EventError::MissingField { field }),
    }
}

/// Event plus its derived fingerprint and arrival sequence.
///
/// The sequence is assigned from upstream partition offsets before any
/// parallel work happens, so tie-breaks stay deterministic under any worker
/// count.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintedEvent {
    event: Event,
    dedup_key: String,
    sequence: u64,
}

impl FingerprintedEvent {
    pub fn new(event: Event, dedup_key: impl Into<String>, sequence: u64) -> Self {
        Self {
            event,
            dedup_key: dedup_key.into(),
            sequence,
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Deterministic surrogate identity; never mutated after derivation.
    pub fn dedup_key(&self) -> &str {
        &self.dedup_key
    }

    /// Arrival sequence stamped from the upstream partition offset order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Bounded window of fingerprinted events cut by the trigger scheduler.
///
/// Owned solely by the pipeline run that created it and discarded once the
/// merge transaction and checkpoint for it have committed.
#[derive(Debug, Clone)]
pub struct MicroBatch {
    batch_id: u64,
    cut_at_ms: u64,
    events: Vec<FingerprintedEvent>,
    high_water_offsets: BTreeMap<String, u64>,
}

impl MicroBatch {
    pub fn new(
        batch_id: u64,
        cut_at_ms: u64,
        events: Vec<FingerprintedEvent>,
        high_water_offsets: BTreeMap<String, u64>,
    ) -> Self {
        Self {
            batch_id,
            cut_at_ms,
            events,
            high_water_offsets,
        }
    }

    /// Monotonically increasing identifier assigned at cut time.
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    /// Wall-clock tick at which the trigger closed the window.
    pub fn cut_at_ms(&self) -> u64 {
        self.cut_at_ms
    }

    pub fn events(&self) -> &[FingerprintedEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Highest offset observed per partition; becomes the checkpoint payload
    /// once the merge for this batch is durable.
    pub fn high_water_offsets(&self) -> &BTreeMap<String, u64> {
        &self.high_water_offsets
    }

    pub fn into_events(self) -> Vec<FingerprintedEvent> {
        self.events
    }
}
