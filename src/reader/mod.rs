//! Part 读取
//!
//! [`PartReader`] 针对一个 part 与一组列，按 mark 区间产出 block：
//!
//! - 每个文件流一个 [`Stream`]：首次使用时打开，mark 经由共享缓存加载，
//!   读缓冲大小由所有待读区间中最大的字节跨度决定
//! - 同一 reader 内的连续区间不会重新 seek
//! - 磁盘上没有文件的列（表结构在 part 写入后变更）被跳过，由
//!   [`PartReader::fill_missing_columns`] 补默认值
//! - 反序列化失败时把 part 标记为 broken，并附上区间与列名重新抛出

pub mod prewhere;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::block::{Block, ColumnDesc, ColumnWithTypeAndName};
use crate::common::{MergeTreeError, Result};
use crate::context::{EngineContext, ReadMetrics};
use crate::field_type::{DataType, Value};
use crate::io::CompressedReader;
use crate::part::{
    column_streams, nested_table_name, read_marks, ColumnStream, Mark, MarkRange, PartLayout, StreamKind,
};

pub use prewhere::{FilterValue, PrewhereFilter, PrewhereReader};

// ── 外部协作者 ────────────────────────────────────────────────────────────────

/// 读路径发现损坏 part 时的通知对象
pub trait BrokenPartSink: Send + Sync {
    fn report_broken_part(&self, part_name: &str);
}

/// 已报告的损坏 part 集合
#[derive(Debug, Default)]
pub struct BrokenParts {
    names: Mutex<BTreeSet<String>>,
}

impl BrokenParts {
    pub fn contains(&self, part_name: &str) -> bool { self.names.lock().contains(part_name) }
    pub fn names(&self) -> Vec<String> { self.names.lock().iter().cloned().collect() }
}

impl BrokenPartSink for BrokenParts {
    fn report_broken_part(&self, part_name: &str) {
        if self.names.lock().insert(part_name.to_string()) {
            warn!(part = part_name, "broken part reported");
        }
    }
}

/// 列的默认表达式，由外部求值
pub trait DefaultExpressionEvaluator: Send + Sync {
    /// 为 `block` 的每一行计算 `column` 的值
    fn evaluate(&self, column: &ColumnDesc, block: &Block) -> Result<Vec<Value>>;
}

impl<F> DefaultExpressionEvaluator for F
where
    F: Fn(&ColumnDesc, &Block) -> Result<Vec<Value>> + Send + Sync,
{
    fn evaluate(&self, column: &ColumnDesc, block: &Block) -> Result<Vec<Value>> { self(column, block) }
}

/// 列名 → 默认表达式；不在表中的列使用类型默认值
pub type ColumnDefaults = HashMap<String, Arc<dyn DefaultExpressionEvaluator>>;

// ── Stream ────────────────────────────────────────────────────────────────────

struct Stream {
    marks:        Arc<Vec<Mark>>,
    reader:       CompressedReader,
    /// 读指针恰好位于的 mark
    current_mark: Option<usize>,
}

impl Stream {
    fn open(
        part:     &dyn PartLayout,
        desc:     &ColumnStream,
        ranges:   &[MarkRange],
        ctx:      &EngineContext,
        use_uncompressed_cache: bool,
    ) -> Result<Self> {
        let marks     = load_marks(part, desc, ctx)?;
        let data_path = part.stream_path(&desc.bin_file());
        let file_size = std::fs::metadata(&data_path)?.len();
        let buffer_size = read_buffer_size(&marks, ranges, file_size, ctx.settings.default_buffer_size);
        let cache = use_uncompressed_cache.then(|| Arc::clone(&ctx.uncompressed_cache));
        let reader = CompressedReader::open(&data_path, buffer_size, cache, Arc::clone(&ctx.metrics))?;
        Ok(Self { marks, reader, current_mark: None })
    }

    /// 已经位于该 mark 时不 seek；返回是否真的 seek 了
    fn seek_to_mark(&mut self, index: usize) -> Result<bool> {
        if self.current_mark == Some(index) {
            return Ok(false);
        }
        let mark = self.marks.get(index).copied().ok_or_else(|| {
            MergeTreeError::format("marks", format!("mark {index} out of range, {} marks", self.marks.len()))
        })?;
        self.reader.seek(mark.offset_in_compressed_file, mark.offset_in_decompressed_block)?;
        self.current_mark = Some(index);
        Ok(true)
    }
}

fn load_marks(part: &dyn PartLayout, desc: &ColumnStream, ctx: &EngineContext) -> Result<Arc<Vec<Mark>>> {
    let path = part.stream_path(&desc.mrk_file());
    if let Some(marks) = ctx.mark_cache.get(&path) {
        ReadMetrics::add(&ctx.metrics.mark_cache_hits, 1);
        return Ok(marks);
    }
    let marks = Arc::new(read_marks(&path, Some(part.marks_count()))?);
    ReadMetrics::add(&ctx.metrics.marks_files_loaded, 1);
    ctx.mark_cache.set(&path, Arc::clone(&marks));
    Ok(marks)
}

/// 覆盖任一区间所需的最大压缩字节跨度；区间读到文件末尾时用默认大小
pub fn read_buffer_size(marks: &[Mark], ranges: &[MarkRange], file_size: u64, default_size: usize) -> usize {
    let mut max_span: u64 = 0;
    for range in ranges.iter().filter(|r| !r.is_empty()) {
        let Some(begin) = marks.get(range.begin) else { continue };
        let mut right = range.end;
        // 与起点同块的 mark 不提供新的边界
        while right < marks.len() && marks[right].offset_in_compressed_file == begin.offset_in_compressed_file {
            right += 1;
        }
        let span = if right < marks.len() {
            marks[right].offset_in_compressed_file - begin.offset_in_compressed_file
        } else {
            file_size.saturating_sub(begin.offset_in_compressed_file).max(default_size as u64)
        };
        max_span = max_span.max(span);
    }
    (max_span as usize).clamp(1, default_size.max(1))
}

// ── PartReader ────────────────────────────────────────────────────────────────

/// 单个 reader 的读取统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub ranges_read:   u64,
    pub granules_read: u64,
    pub rows_read:     u64,
    pub seeks:         u64,
}

pub struct PartReader {
    part:      Arc<dyn PartLayout>,
    ctx:       EngineContext,
    /// 请求的列，按请求顺序
    columns:   Vec<ColumnDesc>,
    /// 磁盘上有文件、实际会读取的列
    to_read:   Vec<ColumnDesc>,
    /// 所有请求列都缺失时，用来得到行数的列
    row_count_column: Option<ColumnDesc>,
    all_ranges:       Vec<MarkRange>,
    use_uncompressed_cache: bool,
    streams:   HashMap<String, Stream>,
    defaults:  ColumnDefaults,
    sink:      Option<Arc<dyn BrokenPartSink>>,
    stats:     ReaderStats,
}

impl fmt::Debug for PartReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartReader")
            .field("part", &self.part.name())
            .field("columns", &self.columns)
            .field("stats", &self.stats)
            .finish()
    }
}

impl PartReader {
    /// `all_ranges` 是此 reader 将要读取的全部区间，用于确定读缓冲大小
    pub fn open(
        part:                   Arc<dyn PartLayout>,
        columns:                Vec<ColumnDesc>,
        all_ranges:             &[MarkRange],
        use_uncompressed_cache: bool,
        ctx:                    &EngineContext,
    ) -> Result<Self> {
        for c in &columns {
            if let Some(on_disk) = part.columns().iter().find(|p| p.name == c.name) {
                if on_disk.data_type != c.data_type {
                    return Err(MergeTreeError::SchemaMismatch(format!(
                        "column {} is {} in part {}, requested as {}",
                        c.name, on_disk.data_type, part.name(), c.data_type,
                    )));
                }
            }
        }

        let to_read: Vec<ColumnDesc> = columns.iter()
            .filter(|c| part.has_column_files(&c.name, &c.data_type))
            .cloned()
            .collect();
        let row_count_column = if to_read.is_empty() {
            Some(minimum_size_column(part.as_ref())?)
        } else {
            None
        };

        Ok(Self {
            ctx:        ctx.clone(),
            columns, to_read, row_count_column,
            all_ranges: all_ranges.to_vec(),
            use_uncompressed_cache,
            streams:    HashMap::new(),
            defaults:   ColumnDefaults::new(),
            sink:       None,
            stats:      ReaderStats::default(),
            part,
        })
    }

    pub fn with_defaults(mut self, defaults: ColumnDefaults) -> Self {
        self.defaults = defaults; self
    }

    pub fn with_broken_part_sink(mut self, sink: Arc<dyn BrokenPartSink>) -> Self {
        self.sink = Some(sink); self
    }

    pub fn part(&self) -> &Arc<dyn PartLayout> { &self.part }
    pub fn columns(&self) -> &[ColumnDesc] { &self.columns }
    pub fn stats(&self) -> ReaderStats { self.stats }

    /// 请求列中磁盘上没有文件的列
    pub fn missing_columns(&self) -> Vec<&ColumnDesc> {
        self.columns.iter().filter(|c| !self.to_read.contains(c)).collect()
    }

    /// 读取 `[from_mark, to_mark)` 内的全部行；缺失列不在结果中
    pub fn read_range(&mut self, from_mark: usize, to_mark: usize) -> Result<Block> {
        let range = MarkRange::new(from_mark, to_mark);
        if to_mark > self.part.granules_count() || from_mark > to_mark {
            return Err(MergeTreeError::Logical(format!(
                "mark range {range} out of part {} with {} granules", self.part.name(), self.part.granules_count(),
            )));
        }

        let max_rows = range.len() * self.part.index_granularity();
        let reading_last_granule = to_mark == self.part.granules_count();

        let mut to_read = self.to_read.clone();
        if let Some(c) = &self.row_count_column {
            to_read.push(c.clone());
        }

        let mut block = Block::new();
        let mut shared_sizes: HashMap<String, Vec<u64>> = HashMap::new();
        for c in &to_read {
            let values = self
                .read_column(c, range, max_rows, reading_last_granule, &mut shared_sizes)
                .map_err(|e| self.on_read_error(e, range, Some(&c.name)))?;
            let column = ColumnWithTypeAndName::new(&c.name, c.data_type.clone(), values);
            block.insert(column).map_err(|e| {
                let e = MergeTreeError::format("column data", e.to_string());
                self.on_read_error(e, range, Some(&c.name))
            })?;
        }

        if let Some(c) = &self.row_count_column {
            let rows = block.rows();
            block.remove(&c.name);
            block = Block::with_rows(rows);
        }

        self.stats.ranges_read   += 1;
        self.stats.granules_read += range.len() as u64;
        self.stats.rows_read     += block.rows() as u64;
        ReadMetrics::add(&self.ctx.metrics.rows_read, block.rows() as u64);
        trace!(part = %self.part.name(), range = %range, rows = block.rows(), "read range");
        Ok(block)
    }

    fn read_column(
        &mut self,
        column:               &ColumnDesc,
        range:                MarkRange,
        max_rows:             usize,
        reading_last_granule: bool,
        shared_sizes:         &mut HashMap<String, Vec<u64>>,
    ) -> Result<Vec<Value>> {
        let streams = column_streams(&column.name, &column.data_type);
        let mut level_sizes: Vec<Vec<u64>> = Vec::new();
        let mut count = max_rows;
        let mut exact = false;

        for desc in &streams {
            match desc.kind {
                StreamKind::ArraySizes { .. } => {
                    let cached = if desc.is_shared_sizes() {
                        shared_sizes.get(&desc.file_base).cloned()
                    } else {
                        None
                    };
                    let sizes = match cached {
                        Some(sizes) => sizes,
                        None => {
                            let values = self.read_stream(desc, range, count)?;
                            let sizes: Vec<u64> = values.iter()
                                .map(|v| match v { Value::UInt64(n) => *n, _ => 0 })
                                .collect();
                            if desc.is_shared_sizes() {
                                shared_sizes.insert(desc.file_base.clone(), sizes.clone());
                            }
                            sizes
                        }
                    };
                    check_row_count(desc, sizes.len(), count, exact, reading_last_granule)?;
                    count = sizes.iter().sum::<u64>() as usize;
                    exact = true;
                    level_sizes.push(sizes);
                }
                StreamKind::Values => {
                    let values = self.read_stream(desc, range, count)?;
                    check_row_count(desc, values.len(), count, exact, reading_last_granule)?;
                    return Ok(assemble_arrays(values, &level_sizes));
                }
            }
        }
        Err(MergeTreeError::Logical(format!("column {} has no value stream", column.name)))
    }

    fn read_stream(&mut self, desc: &ColumnStream, range: MarkRange, limit: usize) -> Result<Vec<Value>> {
        if !self.streams.contains_key(&desc.file_base) {
            let stream = Stream::open(
                self.part.as_ref(), desc, &self.all_ranges, &self.ctx, self.use_uncompressed_cache,
            )?;
            self.streams.insert(desc.file_base.clone(), stream);
        }
        let stream = self.streams.get_mut(&desc.file_base).ok_or_else(|| {
            MergeTreeError::Logical(format!("stream {} disappeared", desc.file_base))
        })?;

        if stream.seek_to_mark(range.begin)? {
            self.stats.seeks += 1;
            ReadMetrics::add(&self.ctx.metrics.seeks, 1);
        }
        stream.current_mark = None;
        let values = desc.data_type.deserialize_bulk(&mut stream.reader, limit)?;
        stream.current_mark = Some(range.end);
        Ok(values)
    }

    /// 标记 part 为 broken 并附上上下文
    fn on_read_error(&self, e: MergeTreeError, range: MarkRange, column: Option<&str>) -> MergeTreeError {
        if !e.marks_part_broken() {
            return e;
        }
        self.part.mark_broken();
        if let Some(sink) = &self.sink {
            sink.report_broken_part(self.part.name());
        }
        let context = match column {
            Some(c) => format!("mark range {range}, column {c}"),
            None    => format!("mark range {range}"),
        };
        MergeTreeError::PartBroken { part: self.part.name().to_string(), context, source: Box::new(e) }
    }

    /// 为请求但缺失的列补值，并按请求顺序排列；对完整的 block 是空操作
    pub fn fill_missing_columns(&self, block: &mut Block) -> Result<()> {
        let rows = block.rows();
        for c in &self.columns {
            if block.has(&c.name) {
                continue;
            }
            let values = match self.defaults.get(&c.name) {
                Some(eval) => eval.evaluate(c, block)?,
                None => match sibling_array_sizes(block, c) {
                    Some(sizes) => default_arrays(&c.data_type, &sizes),
                    None        => vec![c.data_type.default_value(); rows],
                },
            };
            if values.len() != rows {
                return Err(MergeTreeError::SchemaMismatch(format!(
                    "default for {} produced {} rows, block has {rows}", c.name, values.len(),
                )));
            }
            block.insert(ColumnWithTypeAndName::new(&c.name, c.data_type.clone(), values))?;
        }

        // 按请求顺序排列，其余列保持原顺序放在后面
        for (pos, c) in self.columns.iter().enumerate() {
            if block.position(&c.name) != Some(pos) {
                if let Some(column) = block.remove(&c.name) {
                    block.insert_at(pos, column)?;
                }
            }
        }
        Ok(())
    }
}

/// 磁盘占用最小的一列，只用来得到行数
fn minimum_size_column(part: &dyn PartLayout) -> Result<ColumnDesc> {
    part.columns().iter()
        .filter(|c| part.has_column_files(&c.name, &c.data_type))
        .min_by_key(|c| part.column_file_size(&c.name, &c.data_type))
        .cloned()
        .ok_or_else(|| MergeTreeError::AllRequestedColumnsMissing(part.name().to_string()))
}

/// 非最后一个 granule 必须读满；下层流的数量由上层长度精确给出
fn check_row_count(desc: &ColumnStream, got: usize, expected: usize, exact: bool, last: bool) -> Result<()> {
    if got == expected || (!exact && last && got < expected) {
        return Ok(());
    }
    Err(MergeTreeError::format(
        desc.bin_file(),
        format!("read {got} values, expected {}{expected}", if exact { "" } else { "at most " }),
    ))
}

/// 按各层长度把展平的值重新组装为嵌套数组
fn assemble_arrays(values: Vec<Value>, level_sizes: &[Vec<u64>]) -> Vec<Value> {
    let mut current = values;
    for sizes in level_sizes.iter().rev() {
        let mut items = current.into_iter();
        current = sizes.iter()
            .map(|&n| Value::Array(items.by_ref().take(n as usize).collect()))
            .collect();
    }
    current
}

/// 同一 nested 表中已读出的数组列的每行长度
fn sibling_array_sizes(block: &Block, column: &ColumnDesc) -> Option<Vec<usize>> {
    if !column.data_type.is_array() || !column.name.contains('.') {
        return None;
    }
    let table = nested_table_name(&column.name);
    block.columns().iter()
        .find(|c| c.data_type.is_array() && c.name.contains('.') && nested_table_name(&c.name) == table)
        .map(|c| c.values.iter().map(|v| v.as_array().map(|a| a.len()).unwrap_or(0)).collect())
}

fn default_arrays(data_type: &DataType, sizes: &[usize]) -> Vec<Value> {
    let element = data_type.nested_type().map(|t| t.default_value()).unwrap_or(Value::Array(Vec::new()));
    sizes.iter().map(|&n| Value::Array(vec![element.clone(); n])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_size_follows_widest_range() {
        let marks = vec![Mark::new(0, 0), Mark::new(0, 100), Mark::new(500, 0), Mark::new(900, 0)];
        // [0,1) 的右端与起点同块，向后找到 500
        assert_eq!(read_buffer_size(&marks, &[MarkRange::new(0, 1)], 900, 1 << 20), 500);
        assert_eq!(read_buffer_size(&marks, &[MarkRange::new(2, 3)], 900, 1 << 20), 400);
        // 读到文件末尾时使用默认大小
        assert_eq!(read_buffer_size(&marks, &[MarkRange::new(3, 3), MarkRange::new(2, 4)], 900, 4096), 4096);
    }

    #[test]
    fn arrays_are_reassembled_by_level() {
        let values: Vec<Value> = (1..=5).map(Value::Int32).collect();
        // 两行：[[1,2],[3]] 与 [[4,5]]
        let rebuilt = assemble_arrays(values, &[vec![2, 1], vec![2, 1, 2]]);
        assert_eq!(rebuilt, vec![
            Value::Array(vec![
                Value::Array(vec![Value::Int32(1), Value::Int32(2)]),
                Value::Array(vec![Value::Int32(3)]),
            ]),
            Value::Array(vec![Value::Array(vec![Value::Int32(4), Value::Int32(5)])]),
        ]);
    }

    #[test]
    fn short_read_is_only_allowed_at_the_end() {
        let desc = &column_streams("c", &DataType::Int8)[0];
        assert!(check_row_count(desc, 3, 8, false, true).is_ok());
        assert!(check_row_count(desc, 3, 8, false, false).is_err());
        assert!(check_row_count(desc, 3, 8, true, true).is_err());
    }

    #[test]
    fn missing_nested_column_follows_sibling_sizes() {
        let arr = |n: usize| Value::Array(vec![Value::UInt8(7); n]);
        let block = Block::from_columns(vec![ColumnWithTypeAndName::new(
            "n.a", DataType::Array(Box::new(DataType::UInt8)), vec![arr(2), arr(0), arr(1)],
        )]).unwrap();
        let missing = ColumnDesc::new("n.b", DataType::Array(Box::new(DataType::String)));
        let sizes = sibling_array_sizes(&block, &missing).unwrap();
        assert_eq!(sizes, vec![2, 0, 1]);
        let filled = default_arrays(&missing.data_type, &sizes);
        assert_eq!(filled[0], Value::Array(vec![Value::Bytes(vec![]); 2]));
    }
}
