//! 显式传递的引擎上下文：配置、共享缓存与读指标
//!
//! writer / reader / storage 都通过构造参数拿到 [`EngineContext`]，
//! 进程内不存在全局单例。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::{MarkCache, UncompressedCache};
use crate::config::MergeTreeSettings;

/// 读路径计数器
#[derive(Debug, Default)]
pub struct ReadMetrics {
    pub compressed_blocks_read: AtomicU64,
    pub compressed_bytes_read:  AtomicU64,
    pub uncompressed_cache_hits:   AtomicU64,
    pub uncompressed_cache_misses: AtomicU64,
    pub mark_cache_hits:        AtomicU64,
    pub marks_files_loaded:     AtomicU64,
    pub streams_opened:         AtomicU64,
    pub seeks:                  AtomicU64,
    pub rows_read:              AtomicU64,
}

impl ReadMetrics {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ReadMetricsSnapshot {
        ReadMetricsSnapshot {
            compressed_blocks_read:    Self::get(&self.compressed_blocks_read),
            compressed_bytes_read:     Self::get(&self.compressed_bytes_read),
            uncompressed_cache_hits:   Self::get(&self.uncompressed_cache_hits),
            uncompressed_cache_misses: Self::get(&self.uncompressed_cache_misses),
            mark_cache_hits:           Self::get(&self.mark_cache_hits),
            marks_files_loaded:        Self::get(&self.marks_files_loaded),
            streams_opened:            Self::get(&self.streams_opened),
            seeks:                     Self::get(&self.seeks),
            rows_read:                 Self::get(&self.rows_read),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadMetricsSnapshot {
    pub compressed_blocks_read:    u64,
    pub compressed_bytes_read:     u64,
    pub uncompressed_cache_hits:   u64,
    pub uncompressed_cache_misses: u64,
    pub mark_cache_hits:           u64,
    pub marks_files_loaded:        u64,
    pub streams_opened:            u64,
    pub seeks:                     u64,
    pub rows_read:                 u64,
}

/// 复制队列计数器
#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub entries_pulled:    AtomicU64,
    pub entries_postponed: AtomicU64,
    pub entries_executed:  AtomicU64,
    pub entries_failed:    AtomicU64,
    pub entries_removed:   AtomicU64,
}

impl QueueMetrics {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        QueueMetricsSnapshot {
            entries_pulled:    get(&self.entries_pulled),
            entries_postponed: get(&self.entries_postponed),
            entries_executed:  get(&self.entries_executed),
            entries_failed:    get(&self.entries_failed),
            entries_removed:   get(&self.entries_removed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetricsSnapshot {
    pub entries_pulled:    u64,
    pub entries_postponed: u64,
    pub entries_executed:  u64,
    pub entries_failed:    u64,
    pub entries_removed:   u64,
}

#[derive(Clone)]
pub struct EngineContext {
    pub settings:           Arc<MergeTreeSettings>,
    pub mark_cache:         Arc<MarkCache>,
    pub uncompressed_cache: Arc<UncompressedCache>,
    pub metrics:            Arc<ReadMetrics>,
    pub queue_metrics:      Arc<QueueMetrics>,
}

impl EngineContext {
    pub fn new(settings: MergeTreeSettings) -> Self {
        Self {
            mark_cache:         Arc::new(MarkCache::new(settings.mark_cache_size)),
            uncompressed_cache: Arc::new(UncompressedCache::new(settings.uncompressed_cache_size)),
            metrics:            Arc::new(ReadMetrics::default()),
            queue_metrics:      Arc::new(QueueMetrics::default()),
            settings:           Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &MergeTreeSettings { &self.settings }
}

impl Default for EngineContext {
    fn default() -> Self { Self::new(MergeTreeSettings::default()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_and_queue_counters_are_independent() {
        let ctx = EngineContext::default();
        QueueMetrics::add(&ctx.queue_metrics.entries_pulled, 3);
        QueueMetrics::add(&ctx.queue_metrics.entries_removed, 1);
        ReadMetrics::add(&ctx.metrics.seeks, 2);

        let queue = ctx.queue_metrics.snapshot();
        assert_eq!((queue.entries_pulled, queue.entries_removed, queue.entries_failed), (3, 1, 0));
        assert_eq!(ctx.metrics.snapshot().seeks, 2);
        assert_eq!(ctx.clone().queue_metrics.snapshot(), queue);
    }
}
