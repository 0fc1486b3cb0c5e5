//! 存储引擎配置
//!
//! 所有可调参数集中在 [`MergeTreeSettings`]，通过 builder 覆盖默认值。

use crate::compression::CompressionMethod;

/// 默认每 8192 行一个 mark
pub const DEFAULT_INDEX_GRANULARITY: usize = 8192;
/// 读缓冲的默认（也是最大）大小
pub const DEFAULT_BUFFER_SIZE:       usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MergeTreeSettings {
    // ── 写入 ──────────────────────────────────────────────────────────────────
    /// 相邻两个 mark 之间的行数
    pub index_granularity:       usize,
    /// 在 mark 边界处，压缩缓冲超过该大小就先落一个压缩块
    pub min_compress_block_size: usize,
    /// 单个压缩块未压缩内容的上限
    pub max_compress_block_size: usize,
    pub compression:             CompressionMethod,

    // ── 读取 ──────────────────────────────────────────────────────────────────
    /// mark 缓存条目数，0 表示关闭
    pub mark_cache_size:         usize,
    /// 解压块缓存条目数，0 表示关闭
    pub uncompressed_cache_size: usize,
    pub use_uncompressed_cache:  bool,
    pub default_buffer_size:     usize,
    /// 一次 read 最多读取的 mark 数
    pub max_marks_per_read:      usize,
}

impl Default for MergeTreeSettings {
    fn default() -> Self {
        Self {
            index_granularity:       DEFAULT_INDEX_GRANULARITY,
            min_compress_block_size: 64 * 1024,
            max_compress_block_size: 1024 * 1024,
            compression:             CompressionMethod::Lz4,
            mark_cache_size:         5_000,
            uncompressed_cache_size: 1_024,
            use_uncompressed_cache:  false,
            default_buffer_size:     DEFAULT_BUFFER_SIZE,
            max_marks_per_read:      8,
        }
    }
}

impl MergeTreeSettings {
    pub fn builder() -> MergeTreeSettingsBuilder {
        MergeTreeSettingsBuilder::default()
    }
}

#[derive(Default)]
pub struct MergeTreeSettingsBuilder {
    settings: MergeTreeSettings,
}

impl MergeTreeSettingsBuilder {
    pub fn index_granularity(mut self, rows: usize) -> Self {
        self.settings.index_granularity = rows.max(1); self
    }
    pub fn min_compress_block_size(mut self, bytes: usize) -> Self {
        self.settings.min_compress_block_size = bytes; self
    }
    pub fn max_compress_block_size(mut self, bytes: usize) -> Self {
        self.settings.max_compress_block_size = bytes.max(1); self
    }
    pub fn compression(mut self, method: CompressionMethod) -> Self {
        self.settings.compression = method; self
    }
    pub fn mark_cache_size(mut self, entries: usize) -> Self {
        self.settings.mark_cache_size = entries; self
    }
    pub fn uncompressed_cache_size(mut self, entries: usize) -> Self {
        self.settings.uncompressed_cache_size = entries; self
    }
    pub fn use_uncompressed_cache(mut self, enabled: bool) -> Self {
        self.settings.use_uncompressed_cache = enabled; self
    }
    pub fn default_buffer_size(mut self, bytes: usize) -> Self {
        self.settings.default_buffer_size = bytes.max(1); self
    }
    pub fn max_marks_per_read(mut self, marks: usize) -> Self {
        self.settings.max_marks_per_read = marks.max(1); self
    }

    pub fn build(self) -> MergeTreeSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let s = MergeTreeSettings::builder()
            .index_granularity(4)
            .compression(CompressionMethod::None)
            .mark_cache_size(0)
            .build();
        assert_eq!(s.index_granularity, 4);
        assert_eq!(s.compression, CompressionMethod::None);
        assert_eq!(s.mark_cache_size, 0);
        assert_eq!(s.max_compress_block_size, 1024 * 1024);
    }

    #[test]
    fn zero_granularity_is_clamped() {
        let s = MergeTreeSettings::builder().index_granularity(0).build();
        assert_eq!(s.index_granularity, 1);
    }
}
