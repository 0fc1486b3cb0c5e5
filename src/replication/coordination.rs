//! 外部持久协调日志的最小接口
//!
//! 共享日志是按序号追加的 `log-0000000000, log-0000000001, ...`；每个副本有自己
//! 的队列 `queue-...` 和一个 `log_pointer`（下一个要拉取的日志序号）。
//! 本 crate 只消费这些接口，不负责它们的持久化。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::common::{MergeTreeError, Result};

pub const LOG_PREFIX:   &str = "log-";
pub const QUEUE_PREFIX: &str = "queue-";

/// `log-0000000042`
pub fn log_entry_name(index: u64) -> String {
    format!("{LOG_PREFIX}{index:010}")
}

pub fn queue_entry_name(index: u64) -> String {
    format!("{QUEUE_PREFIX}{index:010}")
}

/// 从 `log-0000000042` / `queue-0000000042` 取出序号
pub fn parse_sequence(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(LOG_PREFIX).or_else(|| name.strip_prefix(QUEUE_PREFIX))?;
    if digits.len() != 10 {
        return None;
    }
    digits.parse().ok()
}

pub trait CoordinationLog: Send + Sync {
    /// 共享日志中现存条目的名字，按序号升序
    fn log_entries(&self) -> Result<Vec<String>>;

    fn get_log_entry(&self, name: &str) -> Result<Option<String>>;

    /// 副本尚未拉取过时为 `None`
    fn log_pointer(&self, replica: &str) -> Result<Option<u64>>;

    fn set_log_pointer(&self, replica: &str, pointer: u64) -> Result<()>;

    /// 单个原子操作：在副本队列中追加一条记录，同时把 `log_pointer` 设为
    /// `new_pointer`。返回新记录的名字。
    fn append_to_queue_and_advance(&self, replica: &str, data: &str, new_pointer: u64) -> Result<String>;

    /// 直接追加到副本队列（不经过共享日志）
    fn create_queue_entry(&self, replica: &str, data: &str) -> Result<String>;

    /// 副本队列中现存记录的名字，按序号升序
    fn queue_entries(&self, replica: &str) -> Result<Vec<String>>;

    fn get_queue_entry(&self, replica: &str, name: &str) -> Result<Option<String>>;

    /// 记录不存在时返回 `Ok(false)`
    fn remove_queue_entry(&self, replica: &str, name: &str) -> Result<bool>;
}

// ── 内存实现 ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ReplicaState {
    log_pointer: Option<u64>,
    queue:       BTreeMap<u64, String>,
    next_queue:  u64,
}

#[derive(Default)]
struct LogState {
    log:      BTreeMap<u64, String>,
    next_log: u64,
    replicas: HashMap<String, ReplicaState>,
}

/// 单进程嵌入与测试用的协调日志
///
/// `inject_failures(n)` 让接下来 n 次写操作返回 [`MergeTreeError::Coordination`]，
/// 且不产生任何副作用。
#[derive(Default)]
pub struct InMemoryCoordinationLog {
    state:       Mutex<LogState>,
    fail_writes: AtomicUsize,
}

impl InMemoryCoordinationLog {
    pub fn new() -> Self { Self::default() }

    /// 向共享日志追加一条条目（模拟 leader 写日志），返回 `log-...` 名字
    pub fn push_log(&self, data: &str) -> String {
        let mut st = self.state.lock();
        let index = st.next_log;
        st.next_log += 1;
        st.log.insert(index, data.to_string());
        log_entry_name(index)
    }

    /// 丢弃序号小于 `index` 的日志条目
    pub fn truncate_log_before(&self, index: u64) {
        self.state.lock().log.retain(|&i, _| i >= index);
    }

    pub fn inject_failures(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    fn check_failure(&self, op: &str) -> Result<()> {
        let left = self.fail_writes.load(Ordering::SeqCst);
        if left > 0 {
            self.fail_writes.store(left - 1, Ordering::SeqCst);
            return Err(MergeTreeError::Coordination(format!("injected failure in {op}")));
        }
        Ok(())
    }

    fn push_queue(st: &mut LogState, replica: &str, data: &str) -> String {
        let rs = st.replicas.entry(replica.to_string()).or_default();
        let index = rs.next_queue;
        rs.next_queue += 1;
        rs.queue.insert(index, data.to_string());
        queue_entry_name(index)
    }
}

impl CoordinationLog for InMemoryCoordinationLog {
    fn log_entries(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().log.keys().map(|&i| log_entry_name(i)).collect())
    }

    fn get_log_entry(&self, name: &str) -> Result<Option<String>> {
        let Some(index) = parse_sequence(name) else { return Ok(None) };
        Ok(self.state.lock().log.get(&index).cloned())
    }

    fn log_pointer(&self, replica: &str) -> Result<Option<u64>> {
        Ok(self.state.lock().replicas.get(replica).and_then(|r| r.log_pointer))
    }

    fn set_log_pointer(&self, replica: &str, pointer: u64) -> Result<()> {
        self.check_failure("set_log_pointer")?;
        self.state.lock().replicas.entry(replica.to_string()).or_default().log_pointer = Some(pointer);
        Ok(())
    }

    fn append_to_queue_and_advance(&self, replica: &str, data: &str, new_pointer: u64) -> Result<String> {
        self.check_failure("append_to_queue_and_advance")?;
        let mut st = self.state.lock();
        let name = Self::push_queue(&mut st, replica, data);
        st.replicas.entry(replica.to_string()).or_default().log_pointer = Some(new_pointer);
        Ok(name)
    }

    fn create_queue_entry(&self, replica: &str, data: &str) -> Result<String> {
        self.check_failure("create_queue_entry")?;
        Ok(Self::push_queue(&mut self.state.lock(), replica, data))
    }

    fn queue_entries(&self, replica: &str) -> Result<Vec<String>> {
        let st = self.state.lock();
        Ok(st.replicas.get(replica)
            .map(|r| r.queue.keys().map(|&i| queue_entry_name(i)).collect())
            .unwrap_or_default())
    }

    fn get_queue_entry(&self, replica: &str, name: &str) -> Result<Option<String>> {
        let Some(index) = parse_sequence(name) else { return Ok(None) };
        let st = self.state.lock();
        Ok(st.replicas.get(replica).and_then(|r| r.queue.get(&index).cloned()))
    }

    fn remove_queue_entry(&self, replica: &str, name: &str) -> Result<bool> {
        self.check_failure("remove_queue_entry")?;
        let Some(index) = parse_sequence(name) else { return Ok(false) };
        let mut st = self.state.lock();
        Ok(st.replicas.get_mut(replica).map(|r| r.queue.remove(&index).is_some()).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_names_are_zero_padded() {
        assert_eq!(log_entry_name(42), "log-0000000042");
        assert_eq!(queue_entry_name(7), "queue-0000000007");
        assert_eq!(parse_sequence("log-0000000042"), Some(42));
        assert_eq!(parse_sequence("log-42"), None);
        assert_eq!(parse_sequence("block-0000000001"), None);
    }

    #[test]
    fn append_and_advance_is_all_or_nothing() {
        let log = InMemoryCoordinationLog::new();
        log.inject_failures(1);
        assert!(log.append_to_queue_and_advance("r1", "x", 1).is_err());
        assert_eq!(log.log_pointer("r1").unwrap(), None);
        assert!(log.queue_entries("r1").unwrap().is_empty());

        let name = log.append_to_queue_and_advance("r1", "x", 1).unwrap();
        assert_eq!(log.log_pointer("r1").unwrap(), Some(1));
        assert_eq!(log.get_queue_entry("r1", &name).unwrap().as_deref(), Some("x"));
        assert!(log.remove_queue_entry("r1", &name).unwrap());
        assert!(!log.remove_queue_entry("r1", &name).unwrap());
    }
}
