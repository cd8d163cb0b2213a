use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

/// Durable progress marker: highest applied offset per partition plus the
/// batch that produced them. Advanced only after the merge transaction for
/// the same batch has committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub batch_id: u64,
    pub offsets: BTreeMap<String, u64>,
    pub committed_at_ms: u64,
}

/// Checkpoint as persisted: serialized payload plus an integrity checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedCheckpoint {
    pub batch_id: u64,
    pub checksum: String,
    pub payload: Vec<u8>,
}

/// Error surfaced by checkpoint persistence or recovery.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint persistence failed: {0}")]
    Persist(String),
    #[error("checkpoint load failed: {0}")]
    Load(String),
    #[error("checkpoint record is corrupt: {reason}")]
    Corrupt { reason: String },
    #[error("batch {batch_id} does not advance past committed batch {committed}")]
    NonMonotonic { batch_id: u64, committed: u64 },
    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Contract implemented by durable checkpoint targets.
pub trait CheckpointStore {
    fn persist(&mut self, record: PersistedCheckpoint) -> Result<(), CheckpointError>;
    fn load_latest(&self) -> Result<Option<PersistedCheckpoint>, CheckpointError>;
}

/// In-memory checkpoint store with fault injection for crash tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Vec<PersistedCheckpoint>,
    queued_failures: VecDeque<String>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a persist failure consumed by the next call, modelling a crash
    /// between merge commit and checkpoint commit.
    pub fn queue_persist_failure(&mut self, reason: impl Into<String>) {
        self.queued_failures.push_back(reason.into());
    }

    pub fn records(&self) -> &[PersistedCheckpoint] {
        &self.records
    }

    /// Flips one byte of the latest record, for corruption-detection tests.
    pub fn corrupt_latest(&mut self) {
        if let Some(record) = self.records.last_mut() {
            if let Some(byte) = record.payload.first_mut() {
                *byte ^= 0xff;
            }
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn persist(&mut self, record: PersistedCheckpoint) -> Result<(), CheckpointError> {
        if let Some(reason) = self.queued_failures.pop_front() {
            return Err(CheckpointError::Persist(reason));
        }
        self.records.push(record);
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<PersistedCheckpoint>, CheckpointError> {
        Ok(self.records.last().cloned())
    }
}

/// Writer enforcing the commit ordering protocol over a checkpoint store.
///
/// `commit` must be called only after the merge transaction for `batch_id`
/// has committed; the writer cannot verify that ordering itself, but it does
/// enforce that batch ids only move forward.
pub struct CheckpointWriter<S: CheckpointStore> {
    store: S,
    committed_batch_id: Option<u64>,
}

impl<S: CheckpointStore> CheckpointWriter<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            committed_batch_id: None,
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

    /// Last batch id durably committed through this writer, if any.
    pub fn committed_batch_id(&self) -> Option<u64> {
        self.committed_batch_id
    }

    /// Durably persists progress for a merged batch.
    pub fn commit(
        &mut self,
        batch_id: u64,
        offsets: BTreeMap<String, u64>,
        now_ms: u64,
    ) -> Result<Checkpoint, CheckpointError> {
        if let Some(committed) = self.committed_batch_id {
            if batch_id <= committed {
                return Err(CheckpointError::NonMonotonic {
                    batch_id,
                    committed,
                });
            }
        }
        let checkpoint = Checkpoint {
            batch_id,
            offsets,
            committed_at_ms: now_ms,
        };
        let payload = serde_json::to_vec(&checkpoint)?;
        let checksum = compute_checksum(&payload);
        self.store.persist(PersistedCheckpoint {
            batch_id,
            checksum,
            payload,
        })?;
        self.committed_batch_id = Some(batch_id);
        Ok(checkpoint)
    }

    /// Returns the last committed checkpoint, verifying its checksum.
    /// The pipeline resumes from these offsets on startup and may replay the
    /// in-flight batch; the idempotent merge makes that a no-op.
    pub fn recover(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        let Some(record) = self.store.load_latest()? else {
            return Ok(None);
        };
        let checksum = compute_checksum(&record.payload);
        if checksum != record.checksum {
            return Err(CheckpointError::Corrupt {
                reason: format!("checksum mismatch (batch {})", record.batch_id),
            });
        }
        let checkpoint: Checkpoint = serde_json::from_slice(&record.payload)?;
        self.committed_batch_id = Some(checkpoint.batch_id);
        Ok(Some(checkpoint))
    }
}

fn compute_checksum(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    let mut encoded = String::with_capacity(digest.len() * 2);
    for byte in digest {
        encoded.push_str(&format!("{:02x}", byte));
    }
    encoded
}
