//! Store sinks: the transactional merge table and the analytical append path.

pub mod analytical;
pub mod merge;

pub use analytical::{
    AnalyticalError, AnalyticalRow, AnalyticalSink, AnalyticalStore, MemoryAnalyticalStore,
};
pub use merge::{MemoryMergeTable, MergeError, MergeOutcome, MergeRow, MergeStore};
