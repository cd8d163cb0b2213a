use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, CheckpointWriter};
use crate::config::PipelineConfig;
use crate::dedup::{dedupe, DedupConfig, DedupError};
use crate::event::{Event, FingerprintedEvent, MicroBatch};
use crate::fingerprint;
use crate::sink::analytical::{AnalyticalRow, AnalyticalSink, AnalyticalStore};
use crate::sink::merge::{MergeError, MergeOutcome, MergeStore};
use crate::source::{EventSource, Offsets};
use crate::telemetry::{
    Alert, AlertSink, BatchTelemetry, JsonLineLogger, LogLevel, PipelineTelemetry,
};
use crate::trigger::{TriggerScheduler, Window};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error surfaced by the pipeline loop. Either variant means checkpoint
/// advance has stopped and an operator must intervene.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is halted: {reason}")]
    Halted { reason: String },
    #[error("merge batch {batch_id} parked after {attempts} attempts: {source}")]
    MergeParked {
        batch_id: u64,
        attempts: u32,
        source: MergeError,
    },
}

/// Lifecycle of the single active pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Halted,
}

/// Outcome of one trigger boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Whether the interval had elapsed and a cut was attempted.
    pub cut: bool,
    /// Windows merged and checkpointed during this tick.
    pub batches_committed: usize,
    /// Unique events applied to the transactional store.
    pub events_merged: u64,
}

/// Cooperative shutdown flag checked between batches, never mid-transaction.
/// An in-flight merge always finishes (or fully aborts) before the loop
/// observes the flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Batch that exhausted its merge retries, held for manual intervention.
/// `remaining` holds the events whose merge never committed; spans merged
/// before the failure are already durable and not replayed here (though a
/// replay would be harmless).
#[derive(Debug)]
struct ParkedBatch {
    batch_id: u64,
    remaining: Vec<FingerprintedEvent>,
    merged: Vec<FingerprintedEvent>,
    next_offsets: Offsets,
    stats: WindowStats,
    outcome_so_far: MergeOutcome,
    attempts_so_far: u32,
    reason: MergeError,
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowStats {
    records: u64,
    exact_duplicates: u64,
    divergent_payloads: u64,
    dropped_events: u64,
}

/// Single-writer micro-batch pipeline.
///
/// Owns every store handle explicitly: the upstream source, the trigger
/// scheduler, the transactional merge table, the analytical sink, and the
/// checkpoint writer. One `run_tick` call drives one trigger boundary end to
/// end, so no two merge transactions can ever overlap; a merge that outlasts
/// the trigger interval simply delays the next cut instead of racing it.
pub struct Pipeline<Src, M, A, C>
where
    Src: EventSource,
    M: MergeStore,
    A: AnalyticalStore,
    C: CheckpointStore,
{
    config: PipelineConfig,
    dedup_config: DedupConfig,
    source: Src,
    trigger: TriggerScheduler,
    merge_store: M,
    analytical: AnalyticalSink<A>,
    checkpoints: CheckpointWriter<C>,
    alerts: Box<dyn AlertSink>,
    logger: JsonLineLogger,
    telemetry: PipelineTelemetry,
    /// Committed cursor: next offset to read per partition, advanced only
    /// after the merge for a batch is durable.
    cursor: Offsets,
    /// Fetch position ahead of the committed cursor; records between the two
    /// are buffered in the trigger queue and re-fetched after a restart.
    fetch_cursor: Offsets,
    parked: Option<ParkedBatch>,
    /// Windows of a split cut that were still undispatched when an earlier
    /// window parked. Already drained from the trigger queue, so they must be
    /// replayed by `retry_parked`, not re-fetched.
    pending_windows: VecDeque<Window>,
    state: PipelineState,
}

impl<Src, M, A, C> Pipeline<Src, M, A, C>
where
    Src: EventSource,
    M: MergeStore,
    A: AnalyticalStore,
    C: CheckpointStore,
{
    pub fn new(
        config: PipelineConfig,
        source: Src,
        merge_store: M,
        analytical_store: A,
        checkpoint_store: C,
        alerts: Box<dyn AlertSink>,
    ) -> Self {
        let trigger = TriggerScheduler::new(config.trigger);
        let analytical = AnalyticalSink::new(analytical_store, config.analytical_backoff);
        Self {
            dedup_config: config.dedup.into(),
            trigger,
            analytical,
            config,
            source,
            merge_store,
            checkpoints: CheckpointWriter::new(checkpoint_store),
            alerts,
            logger: JsonLineLogger::default(),
            telemetry: PipelineTelemetry::default(),
            cursor: Offsets::new(),
            fetch_cursor: Offsets::new(),
            parked: None,
            pending_windows: VecDeque::new(),
            state: PipelineState::Running,
        }
    }

    pub fn with_logger(mut self, logger: JsonLineLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn telemetry(&self) -> &PipelineTelemetry {
        &self.telemetry
    }

    pub fn logger(&self) -> &JsonLineLogger {
        &self.logger
    }

    pub fn merge_store(&self) -> &M {
        &self.merge_store
    }

    pub fn source_mut(&mut self) -> &mut Src {
        &mut self.source
    }

    /// Mutable store access, e.g. for fault injection in tests.
    pub fn merge_store_mut(&mut self) -> &mut M {
        &mut self.merge_store
    }

    pub fn checkpoint_store_mut(&mut self) -> &mut C {
        self.checkpoints.store_mut()
    }

    pub fn analytical_store(&self) -> &A {
        self.analytical.store()
    }

    pub fn analytical_store_mut(&mut self) -> &mut A {
        self.analytical.store_mut()
    }

    pub fn checkpoint_store(&self) -> &C {
        self.checkpoints.store()
    }

    /// Committed cursor (next offset to read per partition).
    pub fn cursor(&self) -> &Offsets {
        &self.cursor
    }

    /// Batch id of the parked batch, if the pipeline is halted on one.
    pub fn parked_batch_id(&self) -> Option<u64> {
        self.parked.as_ref().map(|parked| parked.batch_id)
    }

    /// Tears the pipeline down into its store handles, e.g. to rebuild a new
    /// instance over the same durable state after a simulated crash.
    pub fn into_parts(self) -> (Src, M, A, C) {
        (
            self.source,
            self.merge_store,
            self.analytical.into_store(),
            self.checkpoints.into_store(),
        )
    }

    /// Restores durable progress on startup. The batch that was in flight
    /// when the previous run stopped is re-fetched and re-applied; the
    /// idempotent merge makes that replay a no-op.
    pub fn recover(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        let recovered = self.checkpoints.recover()?;
        if let Some(checkpoint) = &recovered {
            self.cursor = checkpoint.offsets.clone();
            self.fetch_cursor = checkpoint.offsets.clone();
            self.trigger.resume_after(checkpoint.batch_id);
        }
        Ok(recovered)
    }

    /// Drives one trigger boundary: poll, cut, merge, checkpoint, append.
    pub fn run_tick(&mut self, now_ms: u64) -> Result<TickReport, PipelineError> {
        if self.state == PipelineState::Halted {
            // The analytical path is independent of the merge path; parked
            // appends keep retrying while the merge side waits on an
            // operator.
            self.drain_analytical();
            return Err(PipelineError::Halted {
                reason: self
                    .parked
                    .as_ref()
                    .map(|parked| parked.reason.to_string())
                    .unwrap_or_else(|| "storage unavailable".to_string()),
            });
        }

        self.poll_source();

        if !self.trigger.due(now_ms) {
            self.drain_analytical();
            return Ok(TickReport::default());
        }

        let windows = self.trigger.cut(now_ms);
        let mut report = TickReport {
            cut: true,
            ..TickReport::default()
        };
        if windows.is_empty() {
            // Empty window: no merge transaction is opened.
            self.telemetry.empty_ticks_total = self.telemetry.empty_ticks_total.saturating_add(1);
            self.trigger.dispatch_complete();
            self.drain_analytical();
            return Ok(report);
        }

        let mut windows: VecDeque<Window> = windows.into();
        while let Some(window) = windows.pop_front() {
            match self.process_window(window, now_ms) {
                Ok(merged) => {
                    report.batches_committed += 1;
                    report.events_merged += merged;
                }
                Err(error) => {
                    // The records of the later windows are already out of the
                    // trigger queue and the fetch cursor is past them; hold
                    // the windows so retry_parked replays every one.
                    self.pending_windows = windows;
                    return Err(error);
                }
            }
        }
        self.trigger.dispatch_complete();
        self.drain_analytical();
        Ok(report)
    }

    /// Operator entry point: re-attempts the parked batch after the store
    /// has been repaired, resuming the pipeline on success. Windows of the
    /// same cut that were still undispatched when the batch parked are
    /// processed right after it, so a split cut never loses its tail.
    pub fn retry_parked(&mut self, now_ms: u64) -> Result<TickReport, PipelineError> {
        let Some(parked) = self.parked.take() else {
            return Ok(TickReport::default());
        };
        self.state = PipelineState::Running;
        let merged = self.merge_spans(
            parked.batch_id,
            parked.remaining,
            parked.merged,
            parked.outcome_so_far,
            parked.attempts_so_far,
            parked.next_offsets,
            parked.stats,
            now_ms,
        )?;
        let mut report = TickReport {
            cut: false,
            batches_committed: 1,
            events_merged: merged,
        };
        while let Some(window) = self.pending_windows.pop_front() {
            let merged = self.process_window(window, now_ms)?;
            report.batches_committed += 1;
            report.events_merged += merged;
        }
        self.trigger.dispatch_complete();
        self.drain_analytical();
        Ok(report)
    }

    /// Drives one tick per entry of `ticks`, consulting the shutdown flag
    /// only between ticks: an in-flight merge always finishes or fully
    /// aborts before the loop stops. Returns the aggregated report.
    pub fn run_until<I>(
        &mut self,
        shutdown: &ShutdownFlag,
        ticks: I,
    ) -> Result<TickReport, PipelineError>
    where
        I: IntoIterator<Item = u64>,
    {
        let mut total = TickReport::default();
        for now_ms in ticks {
            if shutdown.is_requested() {
                break;
            }
            let report = self.run_tick(now_ms)?;
            total.cut |= report.cut;
            total.batches_committed += report.batches_committed;
            total.events_merged += report.events_merged;
        }
        Ok(total)
    }

    fn poll_source(&mut self) {
        let budget = self.trigger.remaining_capacity();
        if budget == 0 {
            return;
        }
        let records = self.source.poll(&self.fetch_cursor, budget);
        for record in records {
            let partition = record.partition_id.clone();
            let next = record.offset + 1;
            if self.trigger.offer(record).is_err() {
                // Queue filled mid-poll; the unoffered records stay in the
                // log and are re-fetched next tick.
                break;
            }
            self.fetch_cursor.insert(partition, next);
        }
    }

    fn process_window(&mut self, window: Window, now_ms: u64) -> Result<u64, PipelineError> {
        let batch_id = window.batch_id;
        let cut_at_ms = window.cut_at_ms;
        let mut stats = WindowStats {
            records: window.records.len() as u64,
            ..WindowStats::default()
        };

        // Validation and fingerprinting happen before any store write; a bad
        // record is dropped and counted, never fatal for the window.
        let mut next_offsets = Offsets::new();
        let mut fingerprinted = Vec::with_capacity(window.records.len());
        for (sequence, raw) in window.records.into_iter().enumerate() {
            let next = raw.offset + 1;
            let advance = next_offsets.entry(raw.partition_id.clone()).or_insert(next);
            *advance = (*advance).max(next);
            match Event::from_record(raw.partition_id, raw.offset, &raw.record).and_then(|event| {
                fingerprint::derive(&event)
                    .map(|key| FingerprintedEvent::new(event, key, sequence as u64))
            }) {
                Ok(event) => fingerprinted.push(event),
                Err(error) => {
                    stats.dropped_events += 1;
                    self.log(
                        now_ms,
                        LogLevel::Debug,
                        "ingest",
                        batch_id,
                        &format!("dropped invalid record: {error}"),
                    );
                }
            }
        }
        if stats.dropped_events > 0 {
            self.alerts.raise(Alert::EventsDropped {
                batch_id,
                count: stats.dropped_events,
            });
        }

        let batch = MicroBatch::new(batch_id, cut_at_ms, fingerprinted, next_offsets.clone());
        self.merge_spans(
            batch_id,
            batch.into_events(),
            Vec::new(),
            MergeOutcome::default(),
            0,
            next_offsets,
            stats,
            now_ms,
        )
    }

    /// Dedups and merges a window, splitting it into bounded sub-spans when
    /// it exceeds the dedup memory bound. Each span is one atomic merge
    /// transaction; cross-span duplicates resolve in the store itself, which
    /// the idempotent merge makes safe. The checkpoint commits once, after
    /// every span of the batch is durable.
    #[allow(clippy::too_many_arguments)]
    fn merge_spans(
        &mut self,
        batch_id: u64,
        events: Vec<FingerprintedEvent>,
        mut merged: Vec<FingerprintedEvent>,
        mut outcome_total: MergeOutcome,
        mut attempts_total: u32,
        next_offsets: Offsets,
        mut stats: WindowStats,
        now_ms: u64,
    ) -> Result<u64, PipelineError> {
        let started = Instant::now();
        let mut spans: VecDeque<Vec<FingerprintedEvent>> =
            split_spans(events, self.dedup_config.max_batch_events).into();
        while let Some(span) = spans.pop_front() {
            let deduped = match dedupe(span, &self.dedup_config) {
                Ok(deduped) => deduped,
                Err(DedupError::BatchTooLarge { .. }) => unreachable!("spans are pre-bounded"),
            };
            stats.exact_duplicates += deduped.exact_duplicates();
            stats.divergent_payloads += deduped.divergent_payloads();
            let unique = deduped.into_unique();
            match self.merge_with_retry(&unique, batch_id, now_ms) {
                Ok((outcome, attempts)) => {
                    attempts_total = attempts_total.saturating_add(attempts);
                    outcome_total.rows_inserted += outcome.rows_inserted;
                    outcome_total.rows_updated += outcome.rows_updated;
                    outcome_total.rows_unchanged += outcome.rows_unchanged;
                    merged.extend(unique);
                }
                Err((error, attempts)) => {
                    attempts_total = attempts_total.saturating_add(attempts);
                    // The failed span is parked in deduplicated form; a
                    // second dedup pass over it at retry time is a no-op.
                    let mut remaining = unique;
                    remaining.extend(spans.into_iter().flatten());
                    return Err(self.park(
                        ParkedBatch {
                            batch_id,
                            remaining,
                            merged,
                            next_offsets,
                            stats,
                            outcome_so_far: outcome_total,
                            attempts_so_far: attempts_total,
                            reason: error,
                        },
                        now_ms,
                    ));
                }
            }
        }
        let latency_ms = started.elapsed().as_millis() as u64;
        let merged_count = merged.len() as u64;
        self.finish_batch(
            batch_id,
            next_offsets,
            &merged,
            stats,
            outcome_total,
            attempts_total,
            latency_ms,
            now_ms,
        );
        Ok(merged_count)
    }

    /// Post-merge tail, in strict order: advance the cursor, commit the
    /// checkpoint, then the best-effort analytical append. Never the other
    /// order.
    #[allow(clippy::too_many_arguments)]
    fn finish_batch(
        &mut self,
        batch_id: u64,
        next_offsets: Offsets,
        unique: &[FingerprintedEvent],
        stats: WindowStats,
        outcome: MergeOutcome,
        merge_attempts: u32,
        latency_ms: u64,
        now_ms: u64,
    ) {
        for (partition, next) in next_offsets {
            let entry = self.cursor.entry(partition).or_insert(next);
            *entry = (*entry).max(next);
        }
        match self
            .checkpoints
            .commit(batch_id, self.cursor.clone(), now_ms)
        {
            Ok(_) => {}
            Err(error) => {
                // The merge stayed durable; replaying this batch on the next
                // run is a correctness no-op, so the pipeline keeps going.
                self.telemetry.checkpoint_failures_total =
                    self.telemetry.checkpoint_failures_total.saturating_add(1);
                self.alerts.raise(Alert::CheckpointFailed {
                    batch_id,
                    reason: error.to_string(),
                });
                self.log(
                    now_ms,
                    LogLevel::Warn,
                    "checkpoint",
                    batch_id,
                    &format!("checkpoint commit failed: {error}"),
                );
            }
        }

        self.analytical
            .append(AnalyticalRow::from_batch(unique, batch_id));

        self.log(
            now_ms,
            LogLevel::Info,
            "merge",
            batch_id,
            &format!(
                "committed batch: {} records, {} inserted, {} updated, {} unchanged",
                stats.records, outcome.rows_inserted, outcome.rows_updated, outcome.rows_unchanged
            ),
        );
        self.telemetry.record_batch(BatchTelemetry {
            batch_id,
            records: stats.records,
            exact_duplicates: stats.exact_duplicates,
            divergent_payloads: stats.divergent_payloads,
            dropped_events: stats.dropped_events,
            rows_inserted: outcome.rows_inserted,
            rows_updated: outcome.rows_updated,
            rows_unchanged: outcome.rows_unchanged,
            merge_attempts,
            latency_ms,
        });
    }

    fn merge_with_retry(
        &mut self,
        unique: &[FingerprintedEvent],
        batch_id: u64,
        now_ms: u64,
    ) -> Result<(MergeOutcome, u32), (MergeError, u32)> {
        let mut schedule = self.config.merge_backoff.schedule();
        let mut attempts = 0u32;
        loop {
            attempts = attempts.saturating_add(1);
            match self.merge_store.merge(unique, batch_id) {
                Ok(outcome) => return Ok((outcome, attempts)),
                Err(error) if error.is_retryable() => match schedule.next_delay_ms() {
                    Some(delay_ms) => {
                        self.telemetry.merge_retries_total =
                            self.telemetry.merge_retries_total.saturating_add(1);
                        self.log(
                            now_ms,
                            LogLevel::Warn,
                            "merge",
                            batch_id,
                            &format!("retryable merge failure, backing off {delay_ms} ms: {error}"),
                        );
                        if delay_ms > 0 {
                            thread::sleep(Duration::from_millis(delay_ms));
                        }
                    }
                    None => return Err((error, attempts)),
                },
                Err(error) => return Err((error, attempts)),
            }
        }
    }

    fn park(&mut self, parked: ParkedBatch, now_ms: u64) -> PipelineError {
        self.state = PipelineState::Halted;
        self.telemetry.batches_parked_total =
            self.telemetry.batches_parked_total.saturating_add(1);
        self.alerts.raise(Alert::MergeParked {
            batch_id: parked.batch_id,
            reason: parked.reason.to_string(),
        });
        self.log(
            now_ms,
            LogLevel::Error,
            "merge",
            parked.batch_id,
            &format!(
                "batch parked after {} attempts: {}",
                parked.attempts_so_far, parked.reason
            ),
        );
        let error = PipelineError::MergeParked {
            batch_id: parked.batch_id,
            attempts: parked.attempts_so_far,
            source: parked.reason.clone(),
        };
        self.parked = Some(parked);
        error
    }

    fn drain_analytical(&mut self) {
        if self.analytical.pending_len() > 0 {
            let exhausted = self.analytical.retry_pending();
            for entry in exhausted {
                self.telemetry.analytical_alerts_total =
                    self.telemetry.analytical_alerts_total.saturating_add(1);
                self.alerts.raise(Alert::AnalyticalRetriesExhausted {
                    version: entry.version,
                    rows: entry.rows,
                    attempts: entry.attempts,
                });
            }
        }
        self.telemetry.analytical_retries_total = self.analytical.retries_total();
    }

    fn log(&mut self, now_ms: u64, level: LogLevel, stage: &str, batch_id: u64, message: &str) {
        // Log serialization failures are swallowed; observability must never
        // take down the data path.
        let _ = self.logger.log(now_ms, level, stage, batch_id, message);
    }
}

/// Splits a fingerprinted window into spans no larger than the dedup memory
/// bound, preserving arrival order.
fn split_spans(events: Vec<FingerprintedEvent>, bound: usize) -> Vec<Vec<FingerprintedEvent>> {
    if events.is_empty() {
        return Vec::new();
    }
    let bound = bound.max(1);
    if events.len() <= bound {
        return vec![events];
    }
    let mut spans = Vec::with_capacity(events.len().div_ceil(bound));
    let mut current = Vec::with_capacity(bound);
    for event in events {
        current.push(event);
        if current.len() == bound {
            spans.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        spans.push(current);
    }
    spans
}
