use crate::event::FingerprintedEvent;
use crate::retry::{BackoffPolicy, RetrySchedule};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Error surfaced by the analytical store. Always retryable up to the
/// configured attempt cap; never a correctness boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("analytical append failed: {0}")]
pub struct AnalyticalError(pub String);

/// One append-only row of the analytical store. Multiple rows per dedup key
/// may transiently coexist; the store's own last-write-wins compaction keeps
/// the highest version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticalRow {
    pub dedup_key: String,
    pub principal_id: String,
    pub event_type: String,
    pub event_timestamp_ms: i64,
    pub payload: Value,
    pub version: u64,
}

impl AnalyticalRow {
    /// Builds the rows for a deduplicated batch, all tagged with the batch's
    /// monotonically increasing version.
    pub fn from_batch(batch: &[FingerprintedEvent], version: u64) -> Vec<Self> {
        batch
            .iter()
            .map(|event| Self {
                dedup_key: event.dedup_key().to_string(),
                principal_id: event.event().principal_id().to_string(),
                event_type: event.event().event_type().to_string(),
                event_timestamp_ms: event.event().event_timestamp().epoch_ms(),
                payload: event.event().payload().clone(),
                version,
            })
            .collect()
    }
}

/// Contract implemented by analytical append targets.
pub trait AnalyticalStore {
    fn append(&mut self, rows: &[AnalyticalRow]) -> Result<(), AnalyticalError>;
}

/// In-memory analytical store with fault injection and a compaction helper
/// standing in for the real store's background last-write-wins process.
#[derive(Debug, Default)]
pub struct MemoryAnalyticalStore {
    rows: Vec<AnalyticalRow>,
    queued_failures: VecDeque<AnalyticalError>,
}

impl MemoryAnalyticalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure consumed by the next append call.
    pub fn queue_failure(&mut self, error: AnalyticalError) {
        self.queued_failures.push_back(error);
    }

    /// Raw appended rows, duplicates and all.
    pub fn rows(&self) -> &[AnalyticalRow] {
        &self.rows
    }

    /// Collapses rows to the highest version per key, the way the real
    /// store's own compaction would.
    pub fn compacted(&self) -> HashMap<String, AnalyticalRow> {
        let mut latest: HashMap<String, AnalyticalRow> = HashMap::new();
        for row in &self.rows {
            match latest.get(&row.dedup_key) {
                Some(kept) if kept.version >= row.version => {}
                _ => {
                    latest.insert(row.dedup_key.clone(), row.clone());
                }
            }
        }
        latest
    }
}

impl AnalyticalStore for MemoryAnalyticalStore {
    fn append(&mut self, rows: &[AnalyticalRow]) -> Result<(), AnalyticalError> {
        if let Some(failure) = self.queued_failures.pop_front() {
            return Err(failure);
        }
        self.rows.extend_from_slice(rows);
        Ok(())
    }
}

/// A batch whose retries were exhausted; surfaced for operator alerting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExhaustedAppend {
    pub version: u64,
    pub rows: usize,
    pub attempts: u32,
    pub last_error: String,
}

struct PendingAppend {
    rows: Vec<AnalyticalRow>,
    schedule: RetrySchedule,
    last_error: AnalyticalError,
}

/// Retrying wrapper around an analytical store.
///
/// Failed appends are parked and retried on later ticks with their own
/// backoff budget; exhaustion escalates to the caller and drops the rows.
/// This path never blocks the merge/checkpoint cadence.
pub struct AnalyticalSink<S: AnalyticalStore> {
    store: S,
    policy: BackoffPolicy,
    pending: VecDeque<PendingAppend>,
    retries_total: u64,
}

impl<S: AnalyticalStore> AnalyticalSink<S> {
    pub fn new(store: S, policy: BackoffPolicy) -> Self {
        Self {
            store,
            policy,
            pending: VecDeque::new(),
            retries_total: 0,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Appends a batch, parking it for retry on failure.
    pub fn append(&mut self, rows: Vec<AnalyticalRow>) {
        if rows.is_empty() {
            return;
        }
        if let Err(error) = self.store.append(&rows) {
            self.pending.push_back(PendingAppend {
                rows,
                schedule: self.policy.schedule(),
                last_error: error,
            });
        }
    }

    /// Retries every parked batch once; returns the batches whose retry
    /// budget is now exhausted.
    pub fn retry_pending(&mut self) -> Vec<ExhaustedAppend> {
        let mut exhausted = Vec::new();
        let mut still_pending = VecDeque::new();
        while let Some(mut entry) = self.pending.pop_front() {
            self.retries_total = self.retries_total.saturating_add(1);
            match self.store.append(&entry.rows) {
                Ok(()) => {}
                Err(error) => {
                    entry.last_error = error;
                    entry.schedule.next_delay_ms();
                    if entry.schedule.exhausted() {
                        exhausted.push(ExhaustedAppend {
                            version: entry.rows.first().map(|row| row.version).unwrap_or(0),
                            rows: entry.rows.len(),
                            attempts: entry.schedule.attempts_made(),
                            last_error: entry.last_error.to_string(),
                        });
                    } else {
                        still_pending.push_back(entry);
                    }
                }
            }
        }
        self.pending = still_pending;
        exhausted
    }

    /// Batches currently parked for retry.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Retry attempts made across all parked batches.
    pub fn retries_total(&self) -> u64 {
        self.retries_total
    }
}
