use crate::source::SourceRecord;
use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default bound on the ingest queue between producers and the scheduler.
pub const DEFAULT_QUEUE_CAPACITY: usize = 50_000;
/// Default per-trigger record cap before a window is split.
pub const DEFAULT_RECORD_CAP: usize = 10_000;
/// Default trigger interval.
pub const DEFAULT_INTERVAL_MS: u64 = 1_000;

/// Knobs governing window cadence and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub interval_ms: u64,
    pub record_cap: usize,
    pub queue_capacity: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            record_cap: DEFAULT_RECORD_CAP,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Error surfaced on the ingest side of the scheduler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("ingest queue at capacity ({capacity}); producer must back off")]
    Backpressure { capacity: usize },
}

/// Scheduler phases. The machine cycles Idle → Accumulating → Cutting →
/// Dispatching → Idle; an empty window skips straight back to Idle without
/// opening a merge transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Idle,
    Accumulating,
    Cutting,
    Dispatching,
}

/// One dispatchable window of raw records, bounded by the record cap.
#[derive(Debug)]
pub struct Window {
    pub batch_id: u64,
    pub cut_at_ms: u64,
    pub records: Vec<SourceRecord>,
}

/// Cuts micro-batch boundaries on a fixed interval and absorbs bursts.
///
/// Producers push into a bounded queue and see backpressure when it fills; a
/// burst never launches concurrent merges, it just produces one large window
/// that the record cap splits into consecutive dispatches. The scheduler is
/// the only component that assigns batch ids, so they stay monotonic across
/// splits and restarts.
pub struct TriggerScheduler {
    config: TriggerConfig,
    queue: ArrayQueue<SourceRecord>,
    state: TriggerState,
    last_cut_ms: Option<u64>,
    next_batch_id: u64,
}

impl TriggerScheduler {
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            queue: ArrayQueue::new(config.queue_capacity.max(1)),
            config,
            state: TriggerState::Idle,
            last_cut_ms: None,
            next_batch_id: 1,
        }
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// Records buffered and awaiting the next cut.
    pub fn accumulated(&self) -> usize {
        self.queue.len()
    }

    /// Free queue slots; the pipeline polls at most this many records.
    pub fn remaining_capacity(&self) -> usize {
        self.config.queue_capacity.saturating_sub(self.queue.len())
    }

    /// Resumes batch-id assignment after checkpoint recovery.
    pub fn resume_after(&mut self, committed_batch_id: u64) {
        self.next_batch_id = committed_batch_id + 1;
    }

    fn allocate_batch_id(&mut self) -> u64 {
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        id
    }

    /// Accepts one record into the accumulation window.
    pub fn offer(&mut self, record: SourceRecord) -> Result<(), TriggerError> {
        self.queue.push(record).map_err(|_| TriggerError::Backpressure {
            capacity: self.config.queue_capacity,
        })?;
        if self.state == TriggerState::Idle {
            self.state = TriggerState::Accumulating;
        }
        Ok(())
    }

    /// Whether the fixed interval has elapsed since the last cut.
    pub fn due(&self, now_ms: u64) -> bool {
        match self.last_cut_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.config.interval_ms,
        }
    }

    /// Closes the accumulation window and returns the dispatchable windows,
    /// splitting at the record cap. An empty window returns no dispatches and
    /// the machine settles back to Idle.
    pub fn cut(&mut self, now_ms: u64) -> Vec<Window> {
        self.state = TriggerState::Cutting;
        self.last_cut_ms = Some(now_ms);
        let mut drained = Vec::with_capacity(self.queue.len());
        while let Some(record) = self.queue.pop() {
            drained.push(record);
        }
        if drained.is_empty() {
            self.state = TriggerState::Idle;
            return Vec::new();
        }
        let cap = self.config.record_cap.max(1);
        let mut windows = Vec::new();
        let mut chunk = Vec::with_capacity(cap.min(drained.len()));
        for record in drained {
            chunk.push(record);
            if chunk.len() == cap {
                windows.push(self.window(std::mem::take(&mut chunk), now_ms));
            }
        }
        if !chunk.is_empty() {
            windows.push(self.window(chunk, now_ms));
        }
        self.state = TriggerState::Dispatching;
        windows
    }

    /// Marks the dispatched windows as fully processed.
    pub fn dispatch_complete(&mut self) {
        self.state = if self.queue.is_empty() {
            TriggerState::Idle
        } else {
            TriggerState::Accumulating
        };
    }

    fn window(&mut self, records: Vec<SourceRecord>, now_ms: u64) -> Window {
        Window {
            batch_id: self.allocate_batch_id(),
            cut_at_ms: now_ms,
            records,
        }
    }
}
