//! 副本的复制队列
//!
//! 内存中的有序队列，镜像协调日志里本副本的 `queue-*` 记录。状态机：
//!
//! ```text
//! Pulled ──select──▶ Selected(currently_executing, new_part_name ∈ future_parts)
//!   ▲  │                 │
//!   │  └─postpone─┐      ├─成功──▶ Completed（从队列与持久日志删除）
//!   └─────────────┘      └─失败──▶ Pulled（记录 last_exception，留待重试）
//! ```
//!
//! 所有内存状态由一把互斥锁保护，临界区内不做持久日志 I/O；真正的拉取 / 合并
//! 在锁外执行，只由 [`ExecutionGuard`] 在 `future_parts` 中的占位保护。

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::common::{unix_now, MergeTreeError, Result};
use crate::context::{EngineContext, QueueMetrics};
use crate::part::{ActivePartSet, PartInfo};

use super::coordination::{log_entry_name, parse_sequence, CoordinationLog};
use super::log_entry::{LogEntry, LogEntryType};

/// 一次调度判断的结果；推迟不是错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShouldExecute {
    Runnable,
    Postponed(String),
}

impl ShouldExecute {
    pub fn is_runnable(&self) -> bool { matches!(self, Self::Runnable) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub future_parts:            usize,
    pub queue_size:              usize,
    pub inserts_in_queue:        usize,
    pub merges_in_queue:         usize,
    pub queue_oldest_time:       u64,
    pub inserts_oldest_time:     u64,
    pub merges_oldest_time:      u64,
    pub oldest_part_to_get:      String,
    pub oldest_part_to_merge_to: String,
    pub last_queue_update:       u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub all: usize,
    pub big: usize,
}

#[derive(Default)]
struct QueueState {
    queue:             VecDeque<LogEntry>,
    /// 正在被产出的 part 名字
    future_parts:      BTreeSet<String>,
    virtual_parts:     ActivePartSet,
    /// 正在执行的条目（按 znode 名），包括执行期间已被移出队列的
    executing:         HashSet<String>,
    last_queue_update: u64,
}

impl QueueState {
    fn position(&self, znode_name: &str) -> Option<usize> {
        self.queue.iter().rposition(|e| e.znode_name == znode_name)
    }

    fn insert_unlocked(&mut self, entry: LogEntry) -> Result<()> {
        self.virtual_parts.add(&entry.new_part_name)?;
        self.queue.push_back(entry);
        Ok(())
    }
}

pub struct ReplicatedMergeQueue {
    replica:            String,
    log:                Arc<dyn CoordinationLog>,
    state:              Mutex<QueueState>,
    /// 任一条目结束执行时唤醒
    execution_complete: Condvar,
    /// 串行化 pull，不阻塞调度
    pull_lock:          Mutex<()>,
    merges_cancelled:   AtomicBool,
    metrics:            Arc<QueueMetrics>,
}

impl ReplicatedMergeQueue {
    pub fn new(replica: &str, log: Arc<dyn CoordinationLog>, ctx: &EngineContext) -> Self {
        Self {
            replica:            replica.into(),
            log,
            state:              Mutex::new(QueueState::default()),
            execution_complete: Condvar::new(),
            pull_lock:          Mutex::new(()),
            merges_cancelled:   AtomicBool::new(false),
            metrics:            Arc::clone(&ctx.queue_metrics),
        }
    }

    pub fn replica(&self) -> &str { &self.replica }

    // ── 初始化 ────────────────────────────────────────────────────────────────

    /// 用本地已有的 part 初始化 virtual parts
    pub fn initialize<S: AsRef<str>>(&self, parts: &[S]) -> Result<()> {
        let mut st = self.state.lock();
        for p in parts {
            st.virtual_parts.add(p.as_ref())?;
        }
        Ok(())
    }

    /// 从持久队列恢复内存队列，按记录名排序；已在内存中的记录跳过
    pub fn load(&self) -> Result<usize> {
        let mut names = self.log.queue_entries(&self.replica)?;
        names.sort();

        let mut loaded = Vec::with_capacity(names.len());
        for name in names {
            let Some(text) = self.log.get_queue_entry(&self.replica, &name)? else { continue };
            let mut entry = LogEntry::parse(&text)?;
            entry.znode_name = name;
            loaded.push(entry);
        }

        let mut st = self.state.lock();
        let mut count = 0;
        for entry in loaded {
            if st.position(&entry.znode_name).is_some() {
                continue;
            }
            st.insert_unlocked(entry)?;
            count += 1;
        }
        debug!(replica = %self.replica, entries = count, "loaded replication queue");
        Ok(count)
    }

    /// 把条目直接放进队列；`znode_name` 为空时先在持久队列中创建记录
    pub fn insert(&self, mut entry: LogEntry) -> Result<String> {
        PartInfo::parse(&entry.new_part_name)?;
        if entry.create_time == 0 {
            entry.create_time = unix_now();
        }
        if entry.znode_name.is_empty() {
            entry.znode_name = self.log.create_queue_entry(&self.replica, &entry.to_text())?;
        }
        let name = entry.znode_name.clone();
        self.state.lock().insert_unlocked(entry)?;
        Ok(name)
    }

    // ── 拉取 ──────────────────────────────────────────────────────────────────

    /// 从共享日志拉取新条目，返回拉到的条数
    ///
    /// 每条日志通过一次原子操作写入副本队列并推进 `log_pointer`，成功后才进入
    /// 内存队列。任何一步失败都直接返回，之前拉到的条目保留。
    pub fn pull_logs_to_queue(&self) -> Result<usize> {
        let _pulling = self.pull_lock.lock();

        let mut index = match self.log.log_pointer(&self.replica)? {
            Some(p) => p,
            None => {
                // 第一次拉取：从日志中现存最小的序号开始
                let first = self.log.log_entries()?
                    .iter()
                    .filter_map(|n| parse_sequence(n))
                    .min()
                    .unwrap_or(0);
                self.log.set_log_pointer(&self.replica, first)?;
                first
            }
        };

        let first_index = index;
        let mut count = 0usize;
        while let Some(text) = self.log.get_log_entry(&log_entry_name(index))? {
            let mut entry = LogEntry::parse(&text)?;
            PartInfo::parse(&entry.new_part_name)?;
            if entry.create_time == 0 {
                entry.create_time = unix_now();
            }

            entry.znode_name = self.log.append_to_queue_and_advance(&self.replica, &entry.to_text(), index + 1)?;
            self.state.lock().insert_unlocked(entry)?;
            QueueMetrics::add(&self.metrics.entries_pulled, 1);

            index += 1;
            count += 1;
        }

        self.state.lock().last_queue_update = unix_now();
        if count > 0 {
            debug!(
                replica = %self.replica,
                entries = count,
                "pulled entries to queue: {} - {}",
                log_entry_name(first_index), log_entry_name(index - 1)
            );
        }
        Ok(count)
    }

    // ── 调度 ──────────────────────────────────────────────────────────────────

    pub fn set_merges_cancelled(&self, cancelled: bool) {
        self.merges_cancelled.store(cancelled, Ordering::Release);
    }

    pub fn merges_cancelled(&self) -> bool { self.merges_cancelled.load(Ordering::Acquire) }

    /// 判断一个条目当前能否执行
    pub fn should_execute(&self, entry: &LogEntry) -> ShouldExecute {
        let st = self.state.lock();
        self.should_execute_locked(&st, entry)
    }

    fn should_execute_locked(&self, st: &QueueState, entry: &LogEntry) -> ShouldExecute {
        if entry.entry_type.produces_part() {
            if st.future_parts.contains(&entry.new_part_name) {
                let reason = format!(
                    "Not executing log entry for part {} because another log entry for the same part \
                     is being processed. This shouldn't happen often.",
                    entry.new_part_name,
                );
                debug!("{reason}");
                return ShouldExecute::Postponed(reason);
            }

            if let Ok(result_part) = PartInfo::parse(&entry.new_part_name) {
                let covering = st.future_parts.iter().find(|name| {
                    PartInfo::parse(name).map(|fp| fp.contains(&result_part)).unwrap_or(false)
                });
                if let Some(covering) = covering {
                    let reason = format!(
                        "Not executing log entry for part {} because another log entry for covering \
                         part {covering} is being processed.",
                        entry.new_part_name,
                    );
                    debug!("{reason}");
                    return ShouldExecute::Postponed(reason);
                }
            }
        }

        if entry.entry_type == LogEntryType::MergeParts {
            if let Some(source) = entry.parts_to_merge.iter().find(|p| st.future_parts.contains(*p)) {
                let reason = format!(
                    "Not merging into part {} because part {source} is not ready yet \
                     (log entry for that part is being processed).",
                    entry.new_part_name,
                );
                trace!("{reason}");
                return ShouldExecute::Postponed(reason);
            }

            if self.merges_cancelled() {
                let reason = format!(
                    "Not executing log entry for part {} because merges are cancelled now.",
                    entry.new_part_name,
                );
                debug!("{reason}");
                return ShouldExecute::Postponed(reason);
            }
        }

        ShouldExecute::Runnable
    }

    /// 选出队列中第一个可执行的条目并占位
    ///
    /// 选中的条目移到队尾；被跳过的条目记录推迟原因与时间。选择与占位在同一个
    /// 临界区内完成，两个调度线程不可能选中同一条目。
    pub fn select_entry_to_process(&self) -> Result<Option<ExecutionGuard<'_>>> {
        let mut st = self.state.lock();
        let now = unix_now();

        let mut selected = None;
        for pos in 0..st.queue.len() {
            if st.queue[pos].currently_executing {
                continue;
            }
            match self.should_execute_locked(&st, &st.queue[pos]) {
                ShouldExecute::Runnable => {
                    selected = Some(pos);
                    break;
                }
                ShouldExecute::Postponed(reason) => {
                    let entry = &mut st.queue[pos];
                    entry.num_postponed     += 1;
                    entry.postpone_reason    = reason;
                    entry.last_postpone_time = now;
                    QueueMetrics::add(&self.metrics.entries_postponed, 1);
                }
            }
        }

        let Some(pos) = selected else { return Ok(None) };
        if let Some(entry) = st.queue.remove(pos) {
            st.queue.push_back(entry);
        }
        let back = st.queue.len() - 1;
        let znode_name = st.queue[back].znode_name.clone();
        self.tag_executing(&mut st, &znode_name).map(Some)
    }

    /// 按记录名直接占位，跳过调度判断
    pub fn acquire(&self, znode_name: &str) -> Result<ExecutionGuard<'_>> {
        let mut st = self.state.lock();
        self.tag_executing(&mut st, znode_name)
    }

    fn tag_executing(&self, st: &mut QueueState, znode_name: &str) -> Result<ExecutionGuard<'_>> {
        let pos = st.position(znode_name)
            .ok_or_else(|| MergeTreeError::NoSuchEntry(znode_name.to_string()))?;
        let part = st.queue[pos].new_part_name.clone();

        if st.queue[pos].currently_executing {
            return Err(MergeTreeError::ExecutionConflict(format!("entry {znode_name} is already executing")));
        }
        if st.future_parts.contains(&part) {
            return Err(MergeTreeError::ExecutionConflict(format!(
                "tagging already tagged future part {part}. This is a bug.",
            )));
        }

        st.future_parts.insert(part);
        st.executing.insert(znode_name.to_string());
        let entry = &mut st.queue[pos];
        entry.currently_executing = true;
        entry.num_tries          += 1;
        entry.last_attempt_time   = unix_now();

        Ok(ExecutionGuard { queue: self, entry: entry.clone() })
    }

    fn untag_executing(&self, entry: &LogEntry) {
        let mut st = self.state.lock();
        st.executing.remove(&entry.znode_name);
        if let Some(pos) = st.position(&entry.znode_name) {
            st.queue[pos].currently_executing = false;
        }
        if !st.future_parts.remove(&entry.new_part_name) {
            error!(part = %entry.new_part_name, "untagging already untagged future part. This is a bug.");
        }
        drop(st);
        self.execution_complete.notify_all();
    }

    /// 在占位保护下执行 `func`
    ///
    /// `func` 返回 `Ok(true)` 时条目从持久队列和内存队列删除；返回 `Ok(false)`
    /// 或出错时条目保留，错误文本记入 `last_exception`。返回值表示条目是否已完成。
    pub fn process_entry<F>(&self, guard: ExecutionGuard<'_>, func: F) -> Result<bool>
    where
        F: FnOnce(&LogEntry) -> Result<bool>,
    {
        match func(guard.entry()) {
            Ok(true) => {
                self.remove_entry(&guard.entry().znode_name)?;
                QueueMetrics::add(&self.metrics.entries_executed, 1);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                warn!(entry = %guard.entry().znode_name, part = %guard.entry().new_part_name, error = %e,
                      "log entry failed");
                let mut st = self.state.lock();
                if let Some(pos) = st.position(&guard.entry().znode_name) {
                    st.queue[pos].last_exception = Some(e.to_string());
                }
                QueueMetrics::add(&self.metrics.entries_failed, 1);
                Ok(false)
            }
        }
    }

    /// 阻塞直到没有正在执行的条目产出 `part_name`
    pub fn wait_for_part(&self, part_name: &str) {
        let mut st = self.state.lock();
        while st.future_parts.contains(part_name) {
            self.execution_complete.wait(&mut st);
        }
    }

    // ── 删除 ──────────────────────────────────────────────────────────────────

    /// 从持久队列和内存队列删除一条记录；持久删除失败时内存中的条目保留
    pub fn remove_entry(&self, znode_name: &str) -> Result<bool> {
        let existed = self.log.remove_queue_entry(&self.replica, znode_name)?;
        let mut st = self.state.lock();
        let removed = match st.position(znode_name) {
            Some(pos) => st.queue.remove(pos).is_some(),
            None      => false,
        };
        if removed {
            QueueMetrics::add(&self.metrics.entries_removed, 1);
        }
        Ok(existed || removed)
    }

    /// 删除第一条产出 `part_name` 的记录
    pub fn remove_part(&self, part_name: &str) -> Result<bool> {
        let znode_name = {
            let st = self.state.lock();
            st.queue.iter().find(|e| e.new_part_name == part_name).map(|e| e.znode_name.clone())
        };
        match znode_name {
            Some(name) => self.remove_entry(&name),
            None       => Ok(false),
        }
    }

    /// 删除结果落在 `drop_range` 内的 GET / MERGE 条目，并等待其中正在执行的完成
    ///
    /// 返回删除的条数。等待没有超时，由调用方控制。
    pub fn remove_parts_in_range(&self, drop_range: &str) -> Result<usize> {
        let range = PartInfo::parse(drop_range)?;

        let (removed, to_wait) = {
            let mut st = self.state.lock();
            let mut removed = Vec::new();
            let mut to_wait = Vec::new();
            st.queue.retain(|e| {
                let inside = e.entry_type.is_get_or_merge()
                    && PartInfo::parse(&e.new_part_name).map(|p| range.contains(&p)).unwrap_or(false);
                if inside {
                    if e.currently_executing {
                        to_wait.push(e.znode_name.clone());
                    }
                    removed.push(e.znode_name.clone());
                }
                !inside
            });
            (removed, to_wait)
        };

        for name in &removed {
            if let Err(e) = self.log.remove_queue_entry(&self.replica, name) {
                warn!(entry = %name, error = %e, "couldn't remove queue entry from coordination log");
            }
        }
        QueueMetrics::add(&self.metrics.entries_removed, removed.len() as u64);
        debug!(
            range = %drop_range,
            removed = removed.len(),
            waiting = to_wait.len(),
            "removed entries from queue, waiting for entries that are currently executing",
        );

        let mut st = self.state.lock();
        while to_wait.iter().any(|name| st.executing.contains(name)) {
            self.execution_complete.wait(&mut st);
        }
        Ok(removed.len())
    }

    // ── virtual parts ─────────────────────────────────────────────────────────

    /// 找到把 `part_name` 作为源的合并，把产出它兄弟 part 的 GET / MERGE 条目
    /// 移到队尾，返回该合并的全部源 part
    pub fn move_sibling_parts_for_merge_to_end_of_queue(&self, part_name: &str) -> Vec<String> {
        let mut st = self.state.lock();

        let Some(merge_pos) = st.queue.iter().position(|e| {
            e.entry_type == LogEntryType::MergeParts && e.parts_to_merge.iter().any(|p| p == part_name)
        }) else {
            return Vec::new();
        };
        let parts_for_merge: BTreeSet<String> = st.queue[merge_pos].parts_to_merge.iter().cloned().collect();

        let mut kept  = VecDeque::with_capacity(st.queue.len());
        let mut moved = Vec::new();
        for (pos, entry) in st.queue.drain(..).enumerate() {
            if pos < merge_pos
                && entry.entry_type.is_get_or_merge()
                && parts_for_merge.contains(&entry.new_part_name)
            {
                moved.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        kept.extend(moved);
        st.queue = kept;

        parts_for_merge.into_iter().collect()
    }

    /// `part_name` 已被某个计划中的合并覆盖，或它所在范围的合并被禁止
    pub fn part_will_be_merged_or_merges_disabled(&self, part_name: &str) -> Result<bool> {
        let st = self.state.lock();
        let containing = st.virtual_parts.containing_part(part_name)?;
        Ok(containing.as_deref() != Some(part_name))
    }

    /// 把 `part_name` 加入 virtual parts，使其覆盖范围内不再选出合并
    pub fn disable_merges_in_range(&self, part_name: &str) -> Result<()> {
        self.state.lock().virtual_parts.add(part_name)?;
        Ok(())
    }

    pub fn virtual_parts(&self) -> Vec<String> { self.state.lock().virtual_parts.parts() }

    // ── 观测 ──────────────────────────────────────────────────────────────────

    pub fn future_parts(&self) -> Vec<String> {
        self.state.lock().future_parts.iter().cloned().collect()
    }

    pub fn len(&self) -> usize { self.state.lock().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// 队列快照，按当前顺序
    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.lock().queue.iter().cloned().collect()
    }

    pub fn status(&self) -> QueueStatus {
        let st = self.state.lock();
        let mut res = QueueStatus {
            future_parts:      st.future_parts.len(),
            queue_size:        st.queue.len(),
            last_queue_update: st.last_queue_update,
            ..QueueStatus::default()
        };

        let older = |t: u64, current: u64| t != 0 && (current == 0 || t < current);
        for entry in &st.queue {
            if older(entry.create_time, res.queue_oldest_time) {
                res.queue_oldest_time = entry.create_time;
            }
            match entry.entry_type {
                LogEntryType::GetPart => {
                    res.inserts_in_queue += 1;
                    if older(entry.create_time, res.inserts_oldest_time) {
                        res.inserts_oldest_time = entry.create_time;
                        res.oldest_part_to_get  = entry.new_part_name.clone();
                    }
                }
                LogEntryType::MergeParts => {
                    res.merges_in_queue += 1;
                    if older(entry.create_time, res.merges_oldest_time) {
                        res.merges_oldest_time      = entry.create_time;
                        res.oldest_part_to_merge_to = entry.new_part_name.clone();
                    }
                }
                _ => {}
            }
        }
        res
    }

    /// 统计队列中的合并；源 part 中有大 part 的算大合并，最多数到 `max_big_merges`
    pub fn count_merges<F>(&self, max_big_merges: usize, is_part_big: F) -> MergeCounts
    where
        F: Fn(&str) -> bool,
    {
        let st = self.state.lock();
        let mut counts = MergeCounts::default();
        for entry in st.queue.iter().filter(|e| e.entry_type == LogEntryType::MergeParts) {
            counts.all += 1;
            if counts.big < max_big_merges && entry.parts_to_merge.iter().any(|p| is_part_big(p.as_str())) {
                counts.big += 1;
            }
        }
        counts
    }
}

// ── ExecutionGuard ────────────────────────────────────────────────────────────

/// 一个条目的执行占位，drop 时（包括 panic 展开）释放
pub struct ExecutionGuard<'a> {
    queue: &'a ReplicatedMergeQueue,
    entry: LogEntry,
}

impl<'a> ExecutionGuard<'a> {
    /// 占位时刻的条目快照
    pub fn entry(&self) -> &LogEntry { &self.entry }
}

impl<'a> Drop for ExecutionGuard<'a> {
    fn drop(&mut self) {
        self.queue.untag_executing(&self.entry);
    }
}
