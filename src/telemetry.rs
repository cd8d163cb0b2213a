use serde::Serialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Severity levels for the pipeline's JSON-line log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Canonical uppercase representation.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rotation policy for log segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: usize,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 1 << 30,
            max_files: 10,
        }
    }
}

/// Accumulated log lines for one rotated segment.
#[derive(Debug, Default, Clone)]
pub struct LogFile {
    lines: Vec<String>,
    bytes_written: usize,
}

impl LogFile {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

/// Errors surfaced while serializing JSON-line logs.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to serialize log record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    ts: u64,
    level: &'a str,
    stage: &'a str,
    batch_id: u64,
    message: &'a str,
}

/// JSON-line logger with deterministic rotation semantics.
#[derive(Debug, Clone)]
pub struct JsonLineLogger {
    policy: LogRotationPolicy,
    current_level: LogLevel,
    files: VecDeque<LogFile>,
    active: LogFile,
}

impl JsonLineLogger {
    pub fn new(policy: LogRotationPolicy) -> Self {
        Self {
            policy,
            current_level: LogLevel::Info,
            files: VecDeque::new(),
            active: LogFile::default(),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.current_level
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.current_level = level;
    }

    /// Emits one JSON-line entry tagged with the pipeline stage and batch.
    pub fn log(
        &mut self,
        ts_ms: u64,
        level: LogLevel,
        stage: &str,
        batch_id: u64,
        message: &str,
    ) -> Result<(), LoggingError> {
        if level < self.current_level {
            return Ok(());
        }
        let record = LogRecord {
            ts: ts_ms,
            level: level.as_str(),
            stage,
            batch_id,
            message,
        };
        let line = serde_json::to_string(&record).map_err(LoggingError::Serialize)?;
        self.rotate_if_needed(line.len());
        self.active.bytes_written = self.active.bytes_written.saturating_add(line.len());
        self.active.lines.push(line);
        Ok(())
    }

    /// Rotated history followed by the active segment.
    pub fn files(&self) -> impl Iterator<Item = &LogFile> {
        self.files.iter().chain(std::iter::once(&self.active))
    }

    fn rotate_if_needed(&mut self, next_line_len: usize) {
        if self.active.bytes_written + next_line_len <= self.policy.max_bytes {
            return;
        }
        if !self.active.lines.is_empty() {
            self.files.push_back(std::mem::take(&mut self.active));
            while self.files.len() > self.policy.max_files {
                self.files.pop_front();
            }
        }
        self.active = LogFile::default();
    }
}

impl Default for JsonLineLogger {
    fn default() -> Self {
        Self::new(LogRotationPolicy::default())
    }
}

/// Per-batch observability record consumed by external analysis tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchTelemetry {
    pub batch_id: u64,
    pub records: u64,
    pub exact_duplicates: u64,
    pub divergent_payloads: u64,
    pub dropped_events: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_unchanged: u64,
    pub merge_attempts: u32,
    pub latency_ms: u64,
}

/// Running totals across the pipeline's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineTelemetry {
    pub batches_total: u64,
    pub events_total: u64,
    pub exact_duplicates_total: u64,
    pub divergent_payloads_total: u64,
    pub dropped_events_total: u64,
    pub rows_inserted_total: u64,
    pub rows_updated_total: u64,
    pub rows_unchanged_total: u64,
    pub merge_retries_total: u64,
    pub checkpoint_failures_total: u64,
    pub analytical_retries_total: u64,
    pub analytical_alerts_total: u64,
    pub batches_parked_total: u64,
    pub empty_ticks_total: u64,
    pub last_batch: Option<BatchTelemetry>,
}

impl PipelineTelemetry {
    /// Folds one committed batch into the running totals.
    pub fn record_batch(&mut self, batch: BatchTelemetry) {
        self.batches_total = self.batches_total.saturating_add(1);
        self.events_total = self.events_total.saturating_add(batch.records);
        self.exact_duplicates_total = self
            .exact_duplicates_total
            .saturating_add(batch.exact_duplicates);
        self.divergent_payloads_total = self
            .divergent_payloads_total
            .saturating_add(batch.divergent_payloads);
        self.dropped_events_total = self.dropped_events_total.saturating_add(batch.dropped_events);
        self.rows_inserted_total = self.rows_inserted_total.saturating_add(batch.rows_inserted);
        self.rows_updated_total = self.rows_updated_total.saturating_add(batch.rows_updated);
        self.rows_unchanged_total = self
            .rows_unchanged_total
            .saturating_add(batch.rows_unchanged);
        self.last_batch = Some(batch);
    }
}

/// Operator-facing alerts raised by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Alert {
    /// Invalid events were dropped at the ingestion boundary.
    EventsDropped { batch_id: u64, count: u64 },
    /// A merge batch exhausted its retry budget and is parked for manual
    /// intervention; checkpoint advance is halted.
    MergeParked { batch_id: u64, reason: String },
    /// An analytical append exhausted its independent retry budget.
    AnalyticalRetriesExhausted {
        version: u64,
        rows: usize,
        attempts: u32,
    },
    /// Checkpoint persistence failed after a durable merge; replay on the
    /// next run is a correctness no-op.
    CheckpointFailed { batch_id: u64, reason: String },
}

/// Destination for operator alerts.
pub trait AlertSink {
    fn raise(&mut self, alert: Alert);
}

/// Alert sink that records everything, with a shared handle for assertions.
#[derive(Clone, Default)]
pub struct RecordingAlertSink {
    alerts: Rc<RefCell<Vec<Alert>>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Rc<RefCell<Vec<Alert>>> {
        self.alerts.clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn raise(&mut self, alert: Alert) {
        self.alerts.borrow_mut().push(alert);
    }
}
