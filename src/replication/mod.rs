//! 复制：协调日志接口、日志条目与副本队列

pub mod coordination;
pub mod log_entry;
pub mod queue;

pub use coordination::{
    log_entry_name, parse_sequence, queue_entry_name, CoordinationLog, InMemoryCoordinationLog,
};
pub use log_entry::{LogEntry, LogEntryType};
pub use queue::{ExecutionGuard, MergeCounts, QueueStatus, ReplicatedMergeQueue, ShouldExecute};
