//! 两阶段（PREWHERE）读取
//!
//! 1. 只读过滤条件需要的列（pre 列），求出过滤结果
//! 2. 结果为逐行布尔向量时，整段全为 false 的 granule 不读取其余列（post 列）
//! 3. 逐行过滤同时作用于 pre 列与 post 列

use std::sync::Arc;

use tracing::trace;

use crate::block::{Block, ColumnDesc, ColumnWithTypeAndName};
use crate::common::{MergeTreeError, Result};
use crate::context::EngineContext;
use crate::field_type::Value;
use crate::part::{MarkRange, PartLayout};

use super::{BrokenPartSink, ColumnDefaults, PartReader, ReaderStats};

/// 过滤表达式的求值结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    /// 对所有行相同
    Const(bool),
    Rows(Vec<bool>),
}

/// 外部提供的过滤表达式
pub trait PrewhereFilter: Send + Sync {
    /// 求值需要读取的列
    fn columns(&self) -> Vec<ColumnDesc>;
    fn evaluate(&self, block: &Block) -> Result<FilterValue>;
}

/// 单列谓词
pub struct ColumnPredicate<F> {
    column:    ColumnDesc,
    predicate: F,
}

impl<F: Fn(&Value) -> bool + Send + Sync> ColumnPredicate<F> {
    pub fn new(column: ColumnDesc, predicate: F) -> Self { Self { column, predicate } }
}

impl<F: Fn(&Value) -> bool + Send + Sync> PrewhereFilter for ColumnPredicate<F> {
    fn columns(&self) -> Vec<ColumnDesc> { vec![self.column.clone()] }

    fn evaluate(&self, block: &Block) -> Result<FilterValue> {
        let column = block.by_name(&self.column.name).ok_or_else(|| {
            MergeTreeError::Logical(format!("filter column {} not in block", self.column.name))
        })?;
        Ok(FilterValue::Rows(column.values.iter().map(|v| (self.predicate)(v)).collect()))
    }
}

/// 每个 granule 是否含有至少一行通过过滤
pub fn granules_to_read(mask: &[bool], granularity: usize, granules: usize) -> Vec<bool> {
    (0..granules)
        .map(|i| {
            let begin = (i * granularity).min(mask.len());
            let end   = ((i + 1) * granularity).min(mask.len());
            mask[begin..end].iter().any(|&b| b)
        })
        .collect()
}

pub struct PrewhereReader {
    pre:              PartReader,
    post:             Option<PartReader>,
    filter:           Arc<dyn PrewhereFilter>,
    requested:        Vec<ColumnDesc>,
    granularity:      usize,
    granules_skipped: u64,
}

impl PrewhereReader {
    pub fn open(
        part:                   Arc<dyn PartLayout>,
        requested:              Vec<ColumnDesc>,
        filter:                 Arc<dyn PrewhereFilter>,
        all_ranges:             &[MarkRange],
        use_uncompressed_cache: bool,
        ctx:                    &EngineContext,
    ) -> Result<Self> {
        let pre_columns  = filter.columns();
        let post_columns: Vec<ColumnDesc> = requested.iter()
            .filter(|c| !pre_columns.iter().any(|p| p.name == c.name))
            .cloned()
            .collect();

        let pre = PartReader::open(Arc::clone(&part), pre_columns, all_ranges, use_uncompressed_cache, ctx)?;
        let post = if post_columns.is_empty() {
            None
        } else {
            Some(PartReader::open(Arc::clone(&part), post_columns, all_ranges, use_uncompressed_cache, ctx)?)
        };
        Ok(Self { pre, post, filter, requested, granularity: part.index_granularity(), granules_skipped: 0 })
    }

    pub fn with_defaults(mut self, defaults: ColumnDefaults) -> Self {
        self.pre = self.pre.with_defaults(defaults.clone());
        self.post = self.post.map(|p| p.with_defaults(defaults));
        self
    }

    pub fn with_broken_part_sink(mut self, sink: Arc<dyn BrokenPartSink>) -> Self {
        self.pre = self.pre.with_broken_part_sink(Arc::clone(&sink));
        self.post = self.post.map(|p| p.with_broken_part_sink(sink));
        self
    }

    pub fn pre_stats(&self) -> ReaderStats { self.pre.stats() }
    pub fn post_stats(&self) -> ReaderStats { self.post.as_ref().map(|p| p.stats()).unwrap_or_default() }
    pub fn granules_skipped(&self) -> u64 { self.granules_skipped }

    /// 读取区间并过滤；结果按请求列顺序排列，已补齐缺失列
    pub fn read_range(&mut self, from_mark: usize, to_mark: usize) -> Result<Block> {
        let range = MarkRange::new(from_mark, to_mark);
        let mut pre_block = self.pre.read_range(from_mark, to_mark)?;
        self.pre.fill_missing_columns(&mut pre_block)?;
        let rows = pre_block.rows();

        let (post_block, mask) = match self.filter.evaluate(&pre_block)? {
            FilterValue::Const(false) => {
                self.granules_skipped += range.len() as u64;
                pre_block.filter(&vec![false; rows])?;
                (Block::new(), None)
            }
            FilterValue::Const(true) => (self.read_post(range)?, None),
            FilterValue::Rows(mask) => {
                if mask.len() != rows {
                    return Err(MergeTreeError::Logical(format!(
                        "filter returned {} rows for a block of {rows}", mask.len(),
                    )));
                }
                let (post_block, post_mask) = self.read_post_filtered(range, &mask)?;
                pre_block.filter(&mask)?;
                (post_block, Some(post_mask))
            }
        };

        let mut result = pre_block;
        if let Some(post) = &self.post {
            let mut post_block = post_block;
            if let Some(post_mask) = &mask {
                post_block.filter(post_mask)?;
            }
            if post_block.num_columns() > 0 || post_block.rows() > 0 {
                if post_block.rows() != result.rows() {
                    return Err(MergeTreeError::Logical(format!(
                        "prewhere read {} rows of filter columns and {} of other columns",
                        result.rows(), post_block.rows(),
                    )));
                }
                for column in post_block.into_columns() {
                    result.insert(column)?;
                }
            }
            post.fill_missing_columns(&mut result)?;
        }

        trace!(range = %range, rows, kept = result.rows(), "prewhere read");
        self.project(result)
    }

    fn read_post(&mut self, range: MarkRange) -> Result<Block> {
        match &mut self.post {
            Some(post) => post.read_range(range.begin, range.end),
            None       => Ok(Block::new()),
        }
    }

    /// 只读取含有通过行的 granule；返回 post 列与对应的行掩码
    fn read_post_filtered(&mut self, range: MarkRange, mask: &[bool]) -> Result<(Block, Vec<bool>)> {
        let g = self.granularity;
        let keep = granules_to_read(mask, g, range.len());
        self.granules_skipped += keep.iter().filter(|&&k| !k).count() as u64;

        let mut block     = Block::new();
        let mut post_mask = Vec::with_capacity(mask.len());
        let mut i = 0;
        while i < keep.len() {
            if !keep[i] {
                i += 1;
                continue;
            }
            let start = i;
            while i < keep.len() && keep[i] {
                i += 1;
            }
            block.append(self.read_post(MarkRange::new(range.begin + start, range.begin + i))?)?;
            post_mask.extend_from_slice(&mask[(start * g).min(mask.len())..(i * g).min(mask.len())]);
        }
        Ok((block, post_mask))
    }

    /// 只保留请求的列，按请求顺序
    fn project(&self, mut block: Block) -> Result<Block> {
        let rows = block.rows();
        let columns: Vec<ColumnWithTypeAndName> = self.requested.iter()
            .map(|c| {
                block.remove(&c.name).ok_or_else(|| {
                    MergeTreeError::Logical(format!("column {} missing after prewhere", c.name))
                })
            })
            .collect::<Result<_>>()?;
        if columns.is_empty() {
            return Ok(Block::with_rows(rows));
        }
        Block::from_columns(columns)
    }
}
