use crate::event::FingerprintedEvent;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Error surfaced by a merge transaction. The whole batch rolled back
/// whenever one of these is returned; partial application is never visible.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("merge transaction conflicted: {0}")]
    Conflict(String),
    #[error("merge transaction exceeded its {timeout_ms} ms bound")]
    Timeout { timeout_ms: u64 },
    #[error("transactional store unavailable: {0}")]
    Unavailable(String),
}

impl MergeError {
    /// Conflicts and timeouts are retryable with backoff; an unavailable
    /// store is fatal for the batch and halts checkpoint advance.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MergeError::Conflict(_) | MergeError::Timeout { .. })
    }
}

/// Row counts reported by a committed merge transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_unchanged: u64,
}

/// One row of the transactional table, keyed uniquely by dedup key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeRow {
    pub dedup_key: String,
    pub principal_id: String,
    pub event_type: String,
    pub event_timestamp_ms: i64,
    pub payload: Value,
    pub merge_version: u64,
}

impl MergeRow {
    fn from_event(event: &FingerprintedEvent, merge_version: u64) -> Self {
        Self {
            dedup_key: event.dedup_key().to_string(),
            principal_id: event.event().principal_id().to_string(),
            event_type: event.event().event_type().to_string(),
            event_timestamp_ms: event.event().event_timestamp().epoch_ms(),
            payload: event.event().payload().clone(),
            merge_version,
        }
    }
}

/// Contract implemented by transactional merge targets.
///
/// Implementations must apply the batch atomically: every event lands or none
/// does. Matched keys are updated in place (a logical no-op when the payload
/// is unchanged), unmatched keys are inserted. Callers guarantee the
/// single-writer discipline: no two merge calls overlap.
pub trait MergeStore {
    fn merge(
        &mut self,
        batch: &[FingerprintedEvent],
        merge_version: u64,
    ) -> Result<MergeOutcome, MergeError>;
}

/// In-memory merge table with staged atomic commit and fault injection.
#[derive(Debug, Default)]
pub struct MemoryMergeTable {
    rows: HashMap<String, MergeRow>,
    queued_failures: VecDeque<MergeError>,
    queued_latencies_ms: VecDeque<u64>,
    timeout_ms: u64,
    merges_committed: u64,
}

impl MemoryMergeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the bounded transaction timeout real stores enforce; 0 means
    /// unlimited.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Queues a failure consumed by the next merge call. The table is left
    /// untouched when the failure fires, modelling full rollback.
    pub fn queue_failure(&mut self, error: MergeError) {
        self.queued_failures.push_back(error);
    }

    /// Queues a simulated transaction duration for the next merge call; when
    /// it exceeds the configured timeout the merge rolls back with
    /// `MergeError::Timeout`.
    pub fn queue_latency_ms(&mut self, latency_ms: u64) {
        self.queued_latencies_ms.push_back(latency_ms);
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, dedup_key: &str) -> Option<&MergeRow> {
        self.rows.get(dedup_key)
    }

    /// Rows sorted by dedup key, for deterministic assertions.
    pub fn rows_sorted(&self) -> Vec<&MergeRow> {
        let mut rows: Vec<&MergeRow> = self.rows.values().collect();
        rows.sort_by(|a, b| a.dedup_key.cmp(&b.dedup_key));
        rows
    }

    /// Logical state of the table: key, payload, and event timestamp, with
    /// merge bookkeeping stripped. Two tables with equal logical state are
    /// indistinguishable to readers that ignore merge versions.
    pub fn logical_state(&self) -> Vec<(String, Value, i64)> {
        let mut state: Vec<(String, Value, i64)> = self
            .rows
            .values()
            .map(|row| {
                (
                    row.dedup_key.clone(),
                    row.payload.clone(),
                    row.event_timestamp_ms,
                )
            })
            .collect();
        state.sort_by(|a, b| a.0.cmp(&b.0));
        state
    }

    /// Transactions committed since construction.
    pub fn merges_committed(&self) -> u64 {
        self.merges_committed
    }
}

impl MergeStore for MemoryMergeTable {
    fn merge(
        &mut self,
        batch: &[FingerprintedEvent],
        merge_version: u64,
    ) -> Result<MergeOutcome, MergeError> {
        if let Some(failure) = self.queued_failures.pop_front() {
            return Err(failure);
        }
        if let Some(latency_ms) = self.queued_latencies_ms.pop_front() {
            if self.timeout_ms > 0 && latency_ms > self.timeout_ms {
                return Err(MergeError::Timeout {
                    timeout_ms: self.timeout_ms,
                });
            }
        }
        // Stage the whole batch before touching the live map so a panic or
        // injected failure can never leave a half-applied transaction.
        let mut staged: Vec<(String, MergeRow)> = Vec::with_capacity(batch.len());
        let mut outcome = MergeOutcome::default();
        for event in batch {
            let key = event.dedup_key().to_string();
            match self.rows.get(&key) {
                None => {
                    outcome.rows_inserted += 1;
                    staged.push((key, MergeRow::from_event(event, merge_version)));
                }
                Some(existing) if existing.payload == *event.event().payload() => {
                    outcome.rows_unchanged += 1;
                    let mut row = existing.clone();
                    row.merge_version = merge_version;
                    staged.push((key, row));
                }
                Some(_) => {
                    outcome.rows_updated += 1;
                    staged.push((key, MergeRow::from_event(event, merge_version)));
                }
            }
        }
        for (key, row) in staged {
            self.rows.insert(key, row);
        }
        self.merges_committed += 1;
        Ok(outcome)
    }
}
