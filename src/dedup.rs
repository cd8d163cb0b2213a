use crate::event::FingerprintedEvent;
use std::collections::HashMap;
use std::thread;
use thiserror::Error;

/// Configures the intra-batch deduplicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupConfig {
    /// Upper bound on events held in memory for one window.
    pub max_batch_events: usize,
    /// Worker count for the parallel fan-out (1 = sequential).
    pub workers: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_batch_events: 1_000_000,
            workers: 1,
        }
    }
}

/// Error raised when a window cannot be deduplicated as-is.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DedupError {
    #[error("window of {events} events exceeds the configured bound of {bound}")]
    BatchTooLarge { events: usize, bound: usize },
}

/// Deduplicated window plus collision accounting.
#[derive(Debug, Clone)]
pub struct DedupResult {
    unique: Vec<FingerprintedEvent>,
    exact_duplicates: u64,
    divergent_payloads: u64,
}

impl DedupResult {
    /// One entry per dedup key, in arrival-sequence order.
    pub fn unique(&self) -> &[FingerprintedEvent] {
        &self.unique
    }

    pub fn into_unique(self) -> Vec<FingerprintedEvent> {
        self.unique
    }

    /// Collisions whose payload matched the kept entry byte-for-byte.
    pub fn exact_duplicates(&self) -> u64 {
        self.exact_duplicates
    }

    /// Collisions that carried a different payload for the same key.
    pub fn divergent_payloads(&self) -> u64 {
        self.divergent_payloads
    }
}

/// Collapses a window to one entry per dedup key.
///
/// Tie-breaks are decided by the arrival sequence stamped from upstream
/// partition offsets, never by processing order: an exact duplicate keeps the
/// first arrival, while a divergent payload for the same key is resolved as
/// last-arrival-wins. The output is sorted by the surviving entry's sequence,
/// so the single-writer merge sees one deterministic ordering regardless of
/// how many workers ran the fan-out.
pub fn dedupe(
    events: Vec<FingerprintedEvent>,
    config: &DedupConfig,
) -> Result<DedupResult, DedupError> {
    if events.len() > config.max_batch_events {
        return Err(DedupError::BatchTooLarge {
            events: events.len(),
            bound: config.max_batch_events,
        });
    }
    if config.workers <= 1 || events.len() < config.workers * 2 {
        return Ok(dedupe_ordered(events));
    }

    let chunk_len = events.len().div_ceil(config.workers);
    let chunks: Vec<Vec<FingerprintedEvent>> = events
        .chunks(chunk_len)
        .map(|chunk| chunk.to_vec())
        .collect();

    // Pure fan-out: each chunk is deduplicated independently, then the chunk
    // results are concatenated in arrival order and reduced once more. The
    // collision rules are associative, so this matches the sequential result
    // exactly.
    let mut partials: Vec<DedupResult> = Vec::with_capacity(chunks.len());
    thread::scope(|scope| {
        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| scope.spawn(move || dedupe_ordered(chunk)))
            .collect();
        for handle in handles {
            partials.push(handle.join().expect("dedup worker panicked"));
        }
    });

    let mut exact_duplicates = 0u64;
    let mut divergent_payloads = 0u64;
    let mut combined = Vec::new();
    for partial in partials {
        exact_duplicates = exact_duplicates.saturating_add(partial.exact_duplicates);
        divergent_payloads = divergent_payloads.saturating_add(partial.divergent_payloads);
        combined.extend(partial.unique);
    }
    combined.sort_by_key(FingerprintedEvent::sequence);
    let merged = dedupe_ordered(combined);
    Ok(DedupResult {
        unique: merged.unique,
        exact_duplicates: exact_duplicates.saturating_add(merged.exact_duplicates),
        divergent_payloads: divergent_payloads.saturating_add(merged.divergent_payloads),
    })
}

fn dedupe_ordered(events: Vec<FingerprintedEvent>) -> DedupResult {
    let mut chosen: HashMap<String, FingerprintedEvent> = HashMap::with_capacity(events.len());
    let mut exact_duplicates = 0u64;
    let mut divergent_payloads = 0u64;
    for event in events {
        match chosen.get(event.dedup_key()) {
            None => {
                chosen.insert(event.dedup_key().to_string(), event);
            }
            Some(kept) if kept.event().payload() == event.event().payload() => {
                exact_duplicates += 1;
            }
            Some(_) => {
                divergent_payloads += 1;
                chosen.insert(event.dedup_key().to_string(), event);
            }
        }
    }
    let mut unique: Vec<FingerprintedEvent> = chosen.into_values().collect();
    unique.sort_by_key(FingerprintedEvent::sequence);
    DedupResult {
        unique,
        exact_duplicates,
        divergent_payloads,
    }
}
