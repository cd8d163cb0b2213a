use serde_json::Value;
use std::collections::BTreeMap;

/// Raw record as delivered by the upstream partitioned log, before any
/// validation. Offsets define arrival order within a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub partition_id: String,
    pub offset: u64,
    pub record: Value,
}

/// Cursor into the upstream log: next offset to read per partition.
pub type Offsets = BTreeMap<String, u64>;

/// Contract for the upstream at-least-once log.
///
/// `poll` returns up to `max_records` records at or after the cursor, in
/// partition-id then offset order. Delivery is at-least-once: a caller that
/// re-polls an old cursor receives the same records again, which is exactly
/// what happens when a crash forces replay of an uncheckpointed batch.
pub trait EventSource {
    fn poll(&mut self, cursor: &Offsets, max_records: usize) -> Vec<SourceRecord>;
}

/// In-memory partitioned log used by tests and the demo binary.
#[derive(Debug, Default)]
pub struct MemoryLog {
    partitions: BTreeMap<String, Vec<Value>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record to a partition and returns its offset.
    pub fn append(&mut self, partition_id: impl Into<String>, record: Value) -> u64 {
        let partition = self.partitions.entry(partition_id.into()).or_default();
        partition.push(record);
        (partition.len() - 1) as u64
    }

    /// Total records across all partitions.
    pub fn len(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSource for MemoryLog {
    fn poll(&mut self, cursor: &Offsets, max_records: usize) -> Vec<SourceRecord> {
        let mut out = Vec::new();
        for (partition_id, records) in &self.partitions {
            let start = cursor.get(partition_id).copied().unwrap_or(0) as usize;
            for (idx, record) in records.iter().enumerate().skip(start) {
                if out.len() >= max_records {
                    return out;
                }
                out.push(SourceRecord {
                    partition_id: partition_id.clone(),
                    offset: idx as u64,
                    record: record.clone(),
                });
            }
        }
        out
    }
}
