//! Exactly-once micro-batch merge pipeline over at-least-once event delivery.
//!
//! Upstream producers deliver events with retries and replays; this crate
//! guarantees that no re-delivery or crash-and-restart ever changes the
//! logical state of the transactional merge table. The pieces: a pure
//! fingerprint deriver, an intra-batch deduplicator, an atomic merge sink, a
//! best-effort analytical sink, a checkpoint writer that advances only after
//! merges are durable, and a trigger scheduler that cuts micro-batch
//! boundaries on a fixed interval.

pub mod app;
pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod event;
pub mod fingerprint;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod trigger;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, CheckpointWriter, MemoryCheckpointStore,
    PersistedCheckpoint,
};
pub use config::{ConfigError, DedupSettings, PipelineConfig};
pub use dedup::{dedupe, DedupConfig, DedupError, DedupResult};
pub use event::{
    Event, EventError, EventTimestamp, FingerprintedEvent, MicroBatch, REQUIRED_IDENTITY_FIELDS,
};
pub use fingerprint::derive;
pub use pipeline::{Pipeline, PipelineError, PipelineState, ShutdownFlag, TickReport};
pub use retry::{BackoffPolicy, RetrySchedule};
pub use sink::analytical::{
    AnalyticalError, AnalyticalRow, AnalyticalSink, AnalyticalStore, ExhaustedAppend,
    MemoryAnalyticalStore,
};
pub use sink::merge::{MemoryMergeTable, MergeError, MergeOutcome, MergeRow, MergeStore};
pub use source::{EventSource, MemoryLog, Offsets, SourceRecord};
pub use telemetry::{
    Alert, AlertSink, BatchTelemetry, JsonLineLogger, LogFile, LogLevel, LogRotationPolicy,
    LoggingError, PipelineTelemetry, RecordingAlertSink,
};
pub use trigger::{
    TriggerConfig, TriggerError, TriggerScheduler, TriggerState, Window, DEFAULT_INTERVAL_MS,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_RECORD_CAP,
};
