//! Part 写入
//!
//! 把有序的 block 流写成一个 part 目录。写入指针按 `index_granularity`
//! 切成 granule，跨 `write` 调用延续：
//!
//! ```text
//! block 1 (10 行)     block 2 (5 行)          granularity = 4
//! ┌────┬────┬──┐      ┌──┬───┐
//! │ m0 │ m1 │m2│      │  │m3 │                 m = 新 mark
//! └────┴────┴──┘      └──┴───┘
//!                     ↑ 补满 m2 的 2 行
//! ```
//!
//! 每个新 mark 开始时，每个流先在压缩缓冲超过 `min_compress_block_size`
//! 时落块，再记录 mark，保证 mark 不会落在过大的压缩块中间。

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::{debug, info};

use crate::block::{Block, ColumnDesc};
use crate::common::{MergeTreeError, Result};
use crate::compression::CompressionMethod;
use crate::context::EngineContext;
use crate::field_type::Value;
use crate::index::{SkipIndexDesc, SkipIndexWriter};
use crate::io::{CompressedWriter, HashingWriter};
use crate::part::{
    column_streams, columns::write_columns, Checksums, ColumnStream, FileChecksum, Mark, StreamKind,
    CHECKSUMS_FILE, COLUMNS_FILE, PRIMARY_INDEX_FILE,
};

// ── Granule ───────────────────────────────────────────────────────────────────

/// 当前 block 中落在同一个 mark 区间内的一段行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Granule {
    /// 在当前 block 中的起始行
    pub start_row:            usize,
    /// 本 block 写入该 granule 的行数
    pub rows_to_write:        usize,
    /// 该 granule 在本 block 开始时还需要的行数
    pub granularity_rows:     usize,
    pub mark_number:          usize,
    pub is_start_of_new_mark: bool,
    pub is_complete:          bool,
}

/// 只依赖写入位置与粒度计算 granule；`rows_left_in_last_mark` 为上一个
/// block 未写满的 granule 还差的行数
pub fn compute_granules(
    block_rows:             usize,
    rows_left_in_last_mark: usize,
    granularity:            usize,
    marks_written:          usize,
) -> Vec<Granule> {
    let mut granules = Vec::with_capacity(block_rows / granularity.max(1) + 2);
    let mut pos = 0;

    if rows_left_in_last_mark > 0 && block_rows > 0 {
        let rows = rows_left_in_last_mark.min(block_rows);
        granules.push(Granule {
            start_row:            0,
            rows_to_write:        rows,
            granularity_rows:     rows_left_in_last_mark,
            mark_number:          marks_written.saturating_sub(1),
            is_start_of_new_mark: false,
            is_complete:          rows == rows_left_in_last_mark,
        });
        pos = rows;
    }

    let mut mark = marks_written;
    while pos < block_rows {
        let rows = granularity.min(block_rows - pos);
        granules.push(Granule {
            start_row:            pos,
            rows_to_write:        rows,
            granularity_rows:     granularity,
            mark_number:          mark,
            is_start_of_new_mark: true,
            is_complete:          rows == granularity,
        });
        pos  += rows;
        mark += 1;
    }
    granules
}

// ── 单个文件流 ────────────────────────────────────────────────────────────────

/// 一个压缩数据文件及其 `.mrk`
pub(crate) struct StreamWriter {
    data_file: String,
    mrk_file:  String,
    data:      CompressedWriter<BufWriter<File>>,
    marks:     HashingWriter<BufWriter<File>>,
}

impl StreamWriter {
    pub fn create(
        dir:            &Path,
        data_file:      String,
        mrk_file:       String,
        method:         CompressionMethod,
        max_block_size: usize,
    ) -> Result<Self> {
        let data  = BufWriter::new(File::create(dir.join(&data_file))?);
        let marks = BufWriter::new(File::create(dir.join(&mrk_file))?);
        Ok(Self {
            data_file, mrk_file,
            data:  CompressedWriter::new(data, method, max_block_size),
            marks: HashingWriter::new(marks),
        })
    }

    fn for_column(dir: &Path, stream: &ColumnStream, ctx: &EngineContext) -> Result<Self> {
        let s = ctx.settings();
        Self::create(dir, stream.bin_file(), stream.mrk_file(), s.compression, s.max_compress_block_size)
    }

    pub fn data(&mut self) -> &mut CompressedWriter<BufWriter<File>> { &mut self.data }

    pub fn write_mark(&mut self, min_compress_block_size: usize) -> Result<()> {
        if self.data.offset_in_block() >= min_compress_block_size {
            self.data.next()?;
        }
        self.data.mark().write_to(&mut self.marks)
    }

    /// 结束 mark 指向文件末尾
    pub fn write_final_mark(&mut self) -> Result<()> {
        self.data.next()?;
        Mark::new(self.data.compressed_offset(), 0).write_to(&mut self.marks)
    }

    pub fn finish(mut self, checksums: &mut Checksums) -> Result<()> {
        checksums.add(self.data_file, FileChecksum::from(self.data.finish()?));
        self.marks.flush()?;
        checksums.add(self.mrk_file, FileChecksum::plain(self.marks.count(), self.marks.hash()));
        Ok(())
    }
}

// ── PartWriter ────────────────────────────────────────────────────────────────

pub struct PartWriter {
    path:                   PathBuf,
    ctx:                    EngineContext,
    columns:                Vec<ColumnDesc>,
    sort_key:               Vec<ColumnDesc>,
    index_granularity:      usize,
    /// 以文件名（无扩展名）为键；共享的长度流只有一份
    streams:                BTreeMap<String, StreamWriter>,
    skip_indices:           Vec<SkipIndexWriter>,
    index_file:             HashingWriter<BufWriter<File>>,
    rows_left_in_last_mark: usize,
    marks_written:          usize,
    rows_written:           u64,
    last_key:               Option<Vec<Value>>,
}

impl PartWriter {
    /// 创建 part 目录并打开所有列流
    pub fn open(
        path:              &Path,
        columns:           Vec<ColumnDesc>,
        sort_key:          &[String],
        index_granularity: usize,
        ctx:               &EngineContext,
    ) -> Result<Self> {
        let sort_key = sort_key.iter()
            .map(|k| {
                columns.iter().find(|c| &c.name == k).cloned().ok_or_else(|| {
                    MergeTreeError::SchemaMismatch(format!("sort key column {k} is not in the column list"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        fs::create_dir_all(path)?;
        let mut streams = BTreeMap::new();
        for c in &columns {
            for stream in column_streams(&c.name, &c.data_type) {
                if !streams.contains_key(&stream.file_base) {
                    let writer = StreamWriter::for_column(path, &stream, ctx)?;
                    streams.insert(stream.file_base.clone(), writer);
                }
            }
        }
        let index_file = HashingWriter::new(BufWriter::new(File::create(path.join(PRIMARY_INDEX_FILE))?));

        Ok(Self {
            path:                   path.to_path_buf(),
            ctx:                    ctx.clone(),
            columns, sort_key,
            index_granularity:      index_granularity.max(1),
            streams,
            skip_indices:           Vec::new(),
            index_file,
            rows_left_in_last_mark: 0,
            marks_written:          0,
            rows_written:           0,
            last_key:               None,
        })
    }

    pub fn with_skip_indices(mut self, indices: Vec<SkipIndexDesc>) -> Result<Self> {
        for desc in indices {
            let column = self.columns.iter().find(|c| c.name == desc.column).ok_or_else(|| {
                MergeTreeError::SchemaMismatch(format!("skip index {} over unknown column {}", desc.name, desc.column))
            })?;
            if column.data_type != desc.data_type {
                return Err(MergeTreeError::SchemaMismatch(format!(
                    "skip index {} declared as {}, column {} is {}",
                    desc.name, desc.data_type, column.name, column.data_type,
                )));
            }
            let s = self.ctx.settings();
            let stream = StreamWriter::create(
                &self.path, desc.data_file(), desc.mrk_file(), s.compression, s.max_compress_block_size,
            )?;
            self.skip_indices.push(SkipIndexWriter::new(desc, stream));
        }
        Ok(self)
    }

    pub fn path(&self) -> &Path { &self.path }
    pub fn rows_written(&self) -> u64 { self.rows_written }
    pub fn marks_written(&self) -> usize { self.marks_written }

    pub fn write(&mut self, block: &Block) -> Result<()> {
        let rows = block.rows();
        if rows == 0 {
            return Ok(());
        }
        self.check_block(block)?;

        let granules = compute_granules(
            rows, self.rows_left_in_last_mark, self.index_granularity, self.marks_written,
        );
        self.write_primary_index(block, &granules)?;

        let min_compress = self.ctx.settings().min_compress_block_size;
        let mut sizes_written = HashSet::new();
        for c in &self.columns {
            let column = block.by_name(&c.name)
                .ok_or_else(|| MergeTreeError::SchemaMismatch(format!("block has no column {}", c.name)))?;
            let streams = column_streams(&c.name, &c.data_type);
            for g in &granules {
                let values = &column.values[g.start_row..g.start_row + g.rows_to_write];
                write_granule(&mut self.streams, &streams, values, g.is_start_of_new_mark, &sizes_written, min_compress)?;
            }
            sizes_written.extend(streams.into_iter().filter(|s| s.is_shared_sizes()).map(|s| s.file_base));
        }

        for index in &mut self.skip_indices {
            let column = block.by_name(&index.desc().column).ok_or_else(|| {
                MergeTreeError::SchemaMismatch(format!("block has no column {}", index.desc().column))
            })?;
            for g in &granules {
                let values = &column.values[g.start_row..g.start_row + g.rows_to_write];
                index.update(values, g.is_complete, min_compress)?;
            }
        }

        let new_marks = granules.iter().filter(|g| g.is_start_of_new_mark).count();
        if let Some(last) = granules.last() {
            self.rows_left_in_last_mark = last.granularity_rows - last.rows_to_write;
        }
        self.marks_written += new_marks;
        self.rows_written  += rows as u64;
        debug!(part = %self.path.display(), rows, marks = new_marks, "wrote block");
        Ok(())
    }

    /// 写入完成。没有任何行时删除目录并返回空校验和
    pub fn finalize(mut self) -> Result<Checksums> {
        if self.rows_written == 0 {
            drop(self.streams);
            drop(self.skip_indices);
            drop(self.index_file);
            fs::remove_dir_all(&self.path)?;
            info!(part = %self.path.display(), "discarded empty part");
            return Ok(Checksums::new());
        }

        for stream in self.streams.values_mut() {
            stream.write_final_mark()?;
        }
        if let Some(key) = self.last_key.take() {
            for (desc, value) in self.sort_key.iter().zip(&key) {
                desc.data_type.serialize_binary(value, &mut self.index_file)?;
            }
        }

        let mut checksums = Checksums::new();
        let min_compress = self.ctx.settings().min_compress_block_size;
        for index in self.skip_indices {
            index.finish(min_compress, &mut checksums)?;
        }
        for stream in self.streams.into_values() {
            stream.finish(&mut checksums)?;
        }
        self.index_file.flush()?;
        checksums.add(PRIMARY_INDEX_FILE, FileChecksum::plain(self.index_file.count(), self.index_file.hash()));

        let mut columns_out = BufWriter::new(File::create(self.path.join(COLUMNS_FILE))?);
        write_columns(&self.columns, &mut columns_out)?;
        columns_out.flush()?;

        let mut checksums_out = BufWriter::new(File::create(self.path.join(CHECKSUMS_FILE))?);
        checksums.write_text(&mut checksums_out)?;
        checksums_out.flush()?;

        info!(
            part  = %self.path.display(),
            rows  = self.rows_written,
            marks = self.marks_written + 1,
            files = checksums.len(),
            "part written",
        );
        Ok(checksums)
    }

    // ── 内部 ──────────────────────────────────────────────────────────────────

    fn check_block(&self, block: &Block) -> Result<()> {
        for c in &self.columns {
            let column = block.by_name(&c.name)
                .ok_or_else(|| MergeTreeError::SchemaMismatch(format!("block has no column {}", c.name)))?;
            if column.data_type != c.data_type {
                return Err(MergeTreeError::SchemaMismatch(format!(
                    "column {} is {} in block, {} in part", c.name, column.data_type, c.data_type,
                )));
            }
        }
        self.check_nested_sizes(block)
    }

    /// 共享长度流的数组列必须逐行等长
    fn check_nested_sizes(&self, block: &Block) -> Result<()> {
        let mut first: BTreeMap<String, (&str, Vec<usize>)> = BTreeMap::new();
        for c in self.columns.iter().filter(|c| c.data_type.is_array()) {
            let Some(shared) = column_streams(&c.name, &c.data_type).into_iter().next() else { continue };
            let Some(column) = block.by_name(&c.name) else { continue };
            let sizes: Vec<usize> = column.values.iter()
                .map(|v| v.as_array().map(|a| a.len()).unwrap_or(0))
                .collect();
            match first.get(&shared.file_base) {
                Some((other, expected)) if *expected != sizes => {
                    return Err(MergeTreeError::SchemaMismatch(format!(
                        "array sizes of {} differ from {other} in the same nested table", c.name,
                    )));
                }
                Some(_) => {}
                None    => { first.insert(shared.file_base, (&c.name, sizes)); }
            }
        }
        Ok(())
    }

    fn write_primary_index(&mut self, block: &Block, granules: &[Granule]) -> Result<()> {
        if self.sort_key.is_empty() {
            return Ok(());
        }
        let key_columns = self.sort_key.iter()
            .map(|k| {
                block.by_name(&k.name)
                    .ok_or_else(|| MergeTreeError::SchemaMismatch(format!("block has no sort key column {}", k.name)))
            })
            .collect::<Result<Vec<_>>>()?;

        for g in granules.iter().filter(|g| g.is_start_of_new_mark) {
            for (desc, column) in self.sort_key.iter().zip(&key_columns) {
                desc.data_type.serialize_binary(&column.values[g.start_row], &mut self.index_file)?;
            }
        }
        let last = block.rows() - 1;
        self.last_key = Some(key_columns.iter().map(|c| c.values[last].clone()).collect());
        Ok(())
    }
}

/// 把一列在一个 granule 内的行写入它的各个流
fn write_granule(
    writers:       &mut BTreeMap<String, StreamWriter>,
    streams:       &[ColumnStream],
    values:        &[Value],
    new_mark:      bool,
    sizes_written: &HashSet<String>,
    min_compress:  usize,
) -> Result<()> {
    // 每经过一层长度流，数组展开一层
    let mut flattened: Option<Vec<Value>> = None;
    for desc in streams {
        let current: &[Value] = flattened.as_deref().unwrap_or(values);
        let stream = writers.get_mut(&desc.file_base).ok_or_else(|| {
            MergeTreeError::Logical(format!("no stream {} in part writer", desc.file_base))
        })?;
        match desc.kind {
            StreamKind::ArraySizes { .. } => {
                let mut flat  = Vec::new();
                let mut sizes = Vec::with_capacity(current.len());
                for v in current {
                    let items = v.as_array().ok_or_else(|| {
                        MergeTreeError::Encoding(format!("value {v} in array stream {}", desc.file_base))
                    })?;
                    sizes.push(items.len() as u64);
                    flat.extend_from_slice(items);
                }
                if !sizes_written.contains(&desc.file_base) {
                    if new_mark {
                        stream.write_mark(min_compress)?;
                    }
                    for size in sizes {
                        stream.data().write_u64::<LittleEndian>(size)?;
                    }
                }
                flattened = Some(flat);
            }
            StreamKind::Values => {
                if new_mark {
                    stream.write_mark(min_compress)?;
                }
                desc.data_type.serialize_bulk(current, stream.data())?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granules_carry_over_between_blocks() {
        let first = compute_granules(10, 0, 4, 0);
        let shape: Vec<_> = first.iter().map(|g| (g.start_row, g.rows_to_write, g.is_start_of_new_mark, g.is_complete)).collect();
        assert_eq!(shape, vec![(0, 4, true, true), (4, 4, true, true), (8, 2, true, false)]);

        let second = compute_granules(5, 2, 4, 3);
        assert_eq!(second[0], Granule {
            start_row: 0, rows_to_write: 2, granularity_rows: 2, mark_number: 2,
            is_start_of_new_mark: false, is_complete: true,
        });
        assert_eq!((second[1].start_row, second[1].rows_to_write, second[1].mark_number), (2, 3, 3));
    }

    #[test]
    fn short_block_does_not_complete_carried_granule() {
        let g = compute_granules(1, 3, 4, 1);
        assert_eq!(g.len(), 1);
        assert!(!g[0].is_start_of_new_mark && !g[0].is_complete);
        assert_eq!(g[0].granularity_rows - g[0].rows_to_write, 2);
    }

    #[test]
    fn exact_multiple_leaves_nothing_open() {
        let g = compute_granules(8, 0, 4, 0);
        assert_eq!(g.len(), 2);
        assert!(g.iter().all(|g| g.is_complete));
        assert!(compute_granules(0, 0, 4, 0).is_empty());
    }
}
