//! 复制队列驱动 MergeTreeStorage 的端到端测试

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use mergetree_storage::common::{MergeTreeError, Result};
use mergetree_storage::context::EngineContext;
use mergetree_storage::part::PartInfo;
use mergetree_storage::replication::{
    CoordinationLog, InMemoryCoordinationLog, LogEntry, LogEntryType, ReplicatedMergeQueue,
};
use mergetree_storage::storage::{MergeTreeStorage, TableDefinition};

use common::*;

/// 一个副本：本地存储 + 队列
struct Replica {
    storage: MergeTreeStorage,
    queue:   ReplicatedMergeQueue,
}

impl Replica {
    fn open(dir: &std::path::Path, log: Arc<InMemoryCoordinationLog>, ctx: EngineContext) -> Self {
        let storage = MergeTreeStorage::open(dir, TableDefinition::new(scalar_columns(), &["k"]), ctx.clone()).unwrap();
        let queue = ReplicatedMergeQueue::new("r1", log, &ctx);
        queue.initialize(&storage.part_names()).unwrap();
        Self { storage, queue }
    }

    /// 块号 b 的 part 含有 k = 10b .. 10b + 10
    fn execute(&self, entry: &LogEntry) -> Result<bool> {
        match entry.entry_type {
            LogEntryType::GetPart => {
                let info = PartInfo::parse(&entry.new_part_name)?;
                let start = info.min_block as usize * 10;
                let block = sample_block(&scalar_columns(), start..start + 10);
                self.storage.write_part_as(vec![block], info)?;
                Ok(true)
            }
            LogEntryType::MergeParts => {
                self.storage.merge_parts(&entry.parts_to_merge, &entry.new_part_name)?;
                Ok(true)
            }
            LogEntryType::DropRange => {
                self.queue.remove_parts_in_range(&entry.new_part_name)?;
                self.storage.drop_range(&PartInfo::parse(&entry.new_part_name)?);
                Ok(true)
            }
            LogEntryType::AttachPart => Err(MergeTreeError::Logical("attach is not supported here".into())),
        }
    }

    /// 顺序执行直到队列中没有可执行的条目
    fn run_until_idle(&self) -> usize {
        let mut executed = 0;
        while let Some(guard) = self.queue.select_entry_to_process().unwrap() {
            if self.queue.process_entry(guard, |e| self.execute(e)).unwrap() {
                executed += 1;
            }
        }
        executed
    }

    fn keys(&self) -> Vec<i64> {
        self.storage.read_all(&["k"], None).unwrap().iter().flat_map(|b| int_values(b, "k")).collect()
    }
}

fn push(log: &InMemoryCoordinationLog, entry: LogEntry) -> String {
    log.push_log(&entry.with_source_replica("r2").with_create_time(1_700_000_000).to_text())
}

#[test]
fn fetched_parts_are_merged_in_queue_order() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(InMemoryCoordinationLog::new());
    let ctx = small_context(4);
    let replica = Replica::open(dir.path(), Arc::clone(&log), ctx.clone());

    push(&log, LogEntry::get_part("all_1_1_0"));
    push(&log, LogEntry::get_part("all_2_2_0"));
    push(&log, LogEntry::merge_parts(&["all_1_1_0", "all_2_2_0"], "all_1_2_1"));
    assert_eq!(replica.queue.pull_logs_to_queue().unwrap(), 3);
    assert_eq!(log.log_pointer("r1").unwrap(), Some(3));
    assert_eq!(replica.queue.virtual_parts(), vec!["all_1_2_1"]);

    assert_eq!(replica.run_until_idle(), 3);
    assert!(replica.queue.is_empty());
    assert!(log.queue_entries("r1").unwrap().is_empty());
    assert!(replica.queue.future_parts().is_empty());

    assert_eq!(replica.storage.part_names(), vec!["all_1_2_1"]);
    assert_eq!(replica.keys(), (10..30).collect::<Vec<_>>());
    let metrics = ctx.queue_metrics.snapshot();
    assert_eq!((metrics.entries_pulled, metrics.entries_executed, metrics.entries_failed), (3, 3, 0));
}

#[test]
fn merge_with_missing_source_stays_queued() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(InMemoryCoordinationLog::new());
    let replica = Replica::open(dir.path(), Arc::clone(&log), small_context(4));

    push(&log, LogEntry::merge_parts(&["all_1_1_0", "all_2_2_0"], "all_1_2_1"));
    push(&log, LogEntry::get_part("all_1_1_0"));
    replica.queue.pull_logs_to_queue().unwrap();

    // 第一轮：合并因缺源 part 失败，GET 成功
    let guard = replica.queue.select_entry_to_process().unwrap().unwrap();
    assert_eq!(guard.entry().entry_type, LogEntryType::MergeParts);
    assert!(!replica.queue.process_entry(guard, |e| replica.execute(e)).unwrap());
    let merge = replica.queue.entries().into_iter()
        .find(|e| e.entry_type == LogEntryType::MergeParts)
        .unwrap();
    assert_eq!(merge.num_tries, 1);
    assert!(merge.last_exception.as_deref().unwrap_or("").contains("all_1_1_0"));

    let guard = replica.queue.select_entry_to_process().unwrap().unwrap();
    assert!(replica.queue.process_entry(guard, |e| replica.execute(e)).unwrap());
    assert_eq!(replica.queue.len(), 1);

    push(&log, LogEntry::get_part("all_2_2_0"));
    replica.queue.pull_logs_to_queue().unwrap();
    assert_eq!(replica.run_until_idle(), 2);
    assert_eq!(replica.storage.part_names(), vec!["all_1_2_1"]);
}

#[test]
fn drop_range_entry_clears_queue_and_parts() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(InMemoryCoordinationLog::new());
    let replica = Replica::open(dir.path(), Arc::clone(&log), small_context(4));

    push(&log, LogEntry::get_part("all_1_1_0"));
    push(&log, LogEntry::get_part("all_2_2_0"));
    push(&log, LogEntry::get_part("all_3_3_0"));
    let drop_range = PartInfo::drop_range("all", 2).name();
    push(&log, LogEntry::drop_range(&drop_range, false));
    replica.queue.pull_logs_to_queue().unwrap();

    let guard = replica.queue.select_entry_to_process().unwrap().unwrap();
    assert_eq!(guard.entry().new_part_name, "all_1_1_0");
    assert!(replica.queue.process_entry(guard, |e| replica.execute(e)).unwrap());

    let drop_entry = replica.queue.entries().into_iter()
        .find(|e| e.entry_type == LogEntryType::DropRange)
        .unwrap();
    let guard = replica.queue.acquire(&drop_entry.znode_name).unwrap();
    assert!(replica.queue.process_entry(guard, |e| replica.execute(e)).unwrap());

    let left: Vec<String> = replica.queue.entries().into_iter().map(|e| e.new_part_name).collect();
    assert_eq!(left, vec!["all_3_3_0"]);
    assert_eq!(log.queue_entries("r1").unwrap().len(), 1);
    assert!(replica.storage.part_names().is_empty());

    assert_eq!(replica.run_until_idle(), 1);
    assert_eq!(replica.storage.part_names(), vec!["all_3_3_0"]);
    assert_eq!(replica.keys(), (30..40).collect::<Vec<_>>());
}

#[test]
fn concurrent_workers_never_build_the_same_part_twice() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(InMemoryCoordinationLog::new());
    let replica = Replica::open(dir.path(), Arc::clone(&log), small_context(4));

    for b in 1..=8 {
        push(&log, LogEntry::get_part(&format!("all_{b}_{b}_0")));
    }
    push(&log, LogEntry::merge_parts(&["all_1_1_0", "all_2_2_0", "all_3_3_0", "all_4_4_0"], "all_1_4_1"));
    push(&log, LogEntry::merge_parts(&["all_5_5_0", "all_6_6_0", "all_7_7_0", "all_8_8_0"], "all_5_8_1"));
    assert_eq!(replica.queue.pull_logs_to_queue().unwrap(), 10);

    let in_flight: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
    let deadline = Instant::now() + Duration::from_secs(30);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                while !replica.queue.is_empty() {
                    assert!(Instant::now() < deadline, "queue did not drain: {:?}", replica.queue.status());
                    let Some(guard) = replica.queue.select_entry_to_process().unwrap() else {
                        thread::sleep(Duration::from_millis(2));
                        continue;
                    };
                    replica.queue.process_entry(guard, |e| {
                        assert!(in_flight.lock().insert(e.new_part_name.clone()), "{} built twice", e.new_part_name);
                        let result = replica.execute(e);
                        in_flight.lock().remove(&e.new_part_name);
                        result
                    }).unwrap();
                }
            });
        }
    });

    assert!(replica.queue.future_parts().is_empty());
    assert_eq!(replica.storage.part_names(), vec!["all_1_4_1", "all_5_8_1"]);
    assert_eq!(replica.keys(), (10..90).collect::<Vec<_>>());
}

#[test]
fn restarted_replica_resumes_from_persistent_queue() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(InMemoryCoordinationLog::new());
    {
        let replica = Replica::open(dir.path(), Arc::clone(&log), small_context(4));
        push(&log, LogEntry::get_part("all_1_1_0"));
        push(&log, LogEntry::get_part("all_2_2_0"));
        replica.queue.pull_logs_to_queue().unwrap();
        let guard = replica.queue.select_entry_to_process().unwrap().unwrap();
        replica.queue.process_entry(guard, |e| replica.execute(e)).unwrap();
    }

    let replica = Replica::open(dir.path(), Arc::clone(&log), small_context(4));
    assert_eq!(replica.storage.part_names(), vec!["all_1_1_0"]);
    assert_eq!(replica.queue.load().unwrap(), 1);
    assert_eq!(replica.queue.pull_logs_to_queue().unwrap(), 0);
    assert_eq!(replica.queue.virtual_parts(), vec!["all_1_1_0", "all_2_2_0"]);

    assert_eq!(replica.run_until_idle(), 1);
    assert_eq!(replica.keys(), (10..30).collect::<Vec<_>>());
}
