//! 进程级读缓存：mark 缓存与解压块缓存
//!
//! part 不可变，所以两个缓存都是只读穿透缓存，不需要失效；容量为 0 时
//! 等同于关闭，调用方无需区分命中与否。

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::part::Mark;

// ── MarkCache ─────────────────────────────────────────────────────────────────

/// 以 `.mrk` 文件路径为键缓存整份 mark 数组
pub struct MarkCache {
    lru: Option<Mutex<LruCache<PathBuf, Arc<Vec<Mark>>>>>,
}

impl MarkCache {
    pub fn new(max_entries: usize) -> Self {
        Self { lru: NonZeroUsize::new(max_entries).map(|cap| Mutex::new(LruCache::new(cap))) }
    }

    pub fn get(&self, path: &Path) -> Option<Arc<Vec<Mark>>> {
        self.lru.as_ref()?.lock().get(path).cloned()
    }

    pub fn set(&self, path: &Path, marks: Arc<Vec<Mark>>) {
        if let Some(lru) = &self.lru {
            lru.lock().put(path.to_path_buf(), marks);
        }
    }

    pub fn len(&self) -> usize {
        self.lru.as_ref().map(|l| l.lock().len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

// ── UncompressedCache ─────────────────────────────────────────────────────────

/// 一个解压后的块及其在文件中占用的字节数（用于定位下一块）
#[derive(Debug)]
pub struct CachedBlock {
    pub data:             Vec<u8>,
    pub compressed_bytes: u64,
}

/// 以 `(文件路径, 块起始偏移)` 为键缓存解压后的块
pub struct UncompressedCache {
    lru: Option<Mutex<LruCache<(PathBuf, u64), Arc<CachedBlock>>>>,
}

impl UncompressedCache {
    pub fn new(max_entries: usize) -> Self {
        Self { lru: NonZeroUsize::new(max_entries).map(|cap| Mutex::new(LruCache::new(cap))) }
    }

    pub fn get(&self, path: &Path, offset: u64) -> Option<Arc<CachedBlock>> {
        self.lru.as_ref()?.lock().get(&(path.to_path_buf(), offset)).cloned()
    }

    pub fn set(&self, path: &Path, offset: u64, block: Arc<CachedBlock>) {
        if let Some(lru) = &self.lru {
            lru.lock().put((path.to_path_buf(), offset), block);
        }
    }

    pub fn is_enabled(&self) -> bool { self.lru.is_some() }

    pub fn len(&self) -> usize {
        self.lru.as_ref().map(|l| l.lock().len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marks(n: u64) -> Arc<Vec<Mark>> {
        Arc::new((0..n).map(|i| Mark::new(i * 10, 0)).collect())
    }

    #[test]
    fn mark_cache_evicts_least_recent() {
        let cache = MarkCache::new(2);
        cache.set(Path::new("a.mrk"), marks(1));
        cache.set(Path::new("b.mrk"), marks(2));
        assert!(cache.get(Path::new("a.mrk")).is_some());
        cache.set(Path::new("c.mrk"), marks(3));
        assert!(cache.get(Path::new("b.mrk")).is_none());
        assert_eq!(cache.get(Path::new("c.mrk")).unwrap().len(), 3);
    }

    #[test]
    fn zero_capacity_disables_cache() {
        let cache = UncompressedCache::new(0);
        cache.set(Path::new("x.bin"), 0, Arc::new(CachedBlock { data: vec![1], compressed_bytes: 14 }));
        assert!(!cache.is_enabled());
        assert!(cache.get(Path::new("x.bin"), 0).is_none());
    }
}
