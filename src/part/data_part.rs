//! 已落盘的不可变 part
//!
//! 以 `Arc<DataPart>` 共享。被合并结果或 drop 取代后标记为 obsolete，
//! 最后一个持有者释放时才删除目录；读者只需持有 `Arc`。

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::block::ColumnDesc;
use crate::common::{MergeTreeError, Result};
use crate::field_type::{DataType, Value};

use super::checksums::Checksums;
use super::columns::{column_streams, load_columns, StreamKind};
use super::mark::MARK_SIZE;
use super::name::PartInfo;

pub const COLUMNS_FILE:   &str = "columns.txt";
pub const CHECKSUMS_FILE: &str = "checksums.txt";
pub const PRIMARY_INDEX_FILE: &str = "primary.idx";

/// writer、reader 与 storage 对 part 布局的共同约定
pub trait PartLayout: Send + Sync {
    fn name(&self) -> &str;
    fn path(&self) -> &Path;
    fn columns(&self) -> &[ColumnDesc];
    fn index_granularity(&self) -> usize;
    /// 含末尾的结束 mark
    fn marks_count(&self) -> usize;
    fn checksums(&self) -> &Checksums;
    fn mark_broken(&self);
    fn is_broken(&self) -> bool;

    fn granules_count(&self) -> usize { self.marks_count().saturating_sub(1) }

    fn stream_path(&self, file_name: &str) -> PathBuf { self.path().join(file_name) }

    /// 列的所有流文件都在磁盘上
    fn has_column_files(&self, name: &str, data_type: &DataType) -> bool {
        column_streams(name, data_type).iter().all(|s| {
            self.stream_path(&s.bin_file()).is_file() && self.stream_path(&s.mrk_file()).is_file()
        })
    }

    /// 列的 `.bin` 文件在磁盘上的总大小；共享的长度流也计入
    fn column_file_size(&self, name: &str, data_type: &DataType) -> u64 {
        column_streams(name, data_type).iter()
            .map(|s| {
                let file = s.bin_file();
                match self.checksums().get(&file) {
                    Some(c) => c.file_size,
                    None    => fs::metadata(self.stream_path(&file)).map(|m| m.len()).unwrap_or(0),
                }
            })
            .sum()
    }
}

#[derive(Debug)]
pub struct DataPart {
    pub info:          PartInfo,
    name:              String,
    path:              PathBuf,
    columns:           Vec<ColumnDesc>,
    checksums:         Checksums,
    index_granularity: usize,
    marks_count:       usize,
    sort_key:          Vec<ColumnDesc>,
    /// 每个 mark 一行排序键值
    index:             Vec<Vec<Value>>,
    broken:            AtomicBool,
    obsolete:          AtomicBool,
}

impl DataPart {
    /// 从 part 目录加载元数据与主键索引
    pub fn load(path: &Path, sort_key: &[ColumnDesc], index_granularity: usize) -> Result<Self> {
        let name = path.file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MergeTreeError::InvalidPartName(path.display().to_string()))?
            .to_string();
        let info      = PartInfo::parse(&name)?;
        let columns   = load_columns(&path.join(COLUMNS_FILE))?;
        let checksums = Checksums::load(&path.join(CHECKSUMS_FILE))?;

        let mut part = Self {
            info, name,
            path:              path.to_path_buf(),
            columns, checksums,
            index_granularity,
            marks_count:       0,
            sort_key:          sort_key.to_vec(),
            index:             Vec::new(),
            broken:            AtomicBool::new(false),
            obsolete:          AtomicBool::new(false),
        };
        part.check_file_sizes()?;
        part.marks_count = part.count_marks()?;
        part.load_index()?;
        debug!(part = %part.name, marks = part.marks_count, columns = part.columns.len(), "loaded part");
        Ok(part)
    }

    pub fn index(&self) -> &[Vec<Value>] { &self.index }
    pub fn sort_key(&self) -> &[ColumnDesc] { &self.sort_key }

    /// 标记为已被取代；最后一个引用释放时删除目录
    pub fn mark_obsolete(&self) { self.obsolete.store(true, Ordering::Release); }
    pub fn is_obsolete(&self) -> bool { self.obsolete.load(Ordering::Acquire) }

    /// 由定长列的解压大小推出行数
    pub fn rows_count(&self) -> Option<u64> {
        self.columns.iter().find_map(|c| {
            let size = c.data_type.fixed_size()? as u64;
            let file = column_streams(&c.name, &c.data_type).pop()?.bin_file();
            let (uncompressed, _) = self.checksums.get(&file)?.uncompressed?;
            Some(uncompressed / size)
        })
    }

    /// checksums.txt 中记录的大小必须与磁盘一致
    fn check_file_sizes(&self) -> Result<()> {
        for (file, checksum) in &self.checksums.files {
            let actual = fs::metadata(self.path.join(file))?.len();
            if actual != checksum.file_size {
                return Err(MergeTreeError::format(
                    format!("part {}", self.name),
                    format!("{file} has size {actual}, checksums say {}", checksum.file_size),
                ));
            }
        }
        Ok(())
    }

    /// 取第一列值流的 `.mrk` 大小；没有任何列文件时为 0
    fn count_marks(&self) -> Result<usize> {
        for c in &self.columns {
            let Some(stream) = column_streams(&c.name, &c.data_type)
                .into_iter()
                .find(|s| s.kind == StreamKind::Values) else { continue };
            let mrk = self.path.join(stream.mrk_file());
            if let Ok(meta) = fs::metadata(&mrk) {
                if meta.len() % MARK_SIZE != 0 {
                    return Err(MergeTreeError::format(mrk.display().to_string(), "truncated marks file"));
                }
                return Ok((meta.len() / MARK_SIZE) as usize);
            }
        }
        Ok(0)
    }

    fn load_index(&mut self) -> Result<()> {
        if self.sort_key.is_empty() || self.marks_count == 0 {
            return Ok(());
        }
        let path = self.path.join(PRIMARY_INDEX_FILE);
        let mut r = BufReader::new(File::open(&path)?);
        let mut index = Vec::with_capacity(self.marks_count);
        for _ in 0..self.marks_count {
            let row = self.sort_key.iter()
                .map(|k| k.data_type.deserialize_binary(&mut r))
                .collect::<Result<Vec<_>>>()?;
            index.push(row);
        }
        if !r.fill_buf()?.is_empty() {
            return Err(MergeTreeError::format(
                path.display().to_string(),
                format!("index has more than {} entries", self.marks_count),
            ));
        }
        self.index = index;
        Ok(())
    }
}

impl PartLayout for DataPart {
    fn name(&self) -> &str { &self.name }
    fn path(&self) -> &Path { &self.path }
    fn columns(&self) -> &[ColumnDesc] { &self.columns }
    fn index_granularity(&self) -> usize { self.index_granularity }
    fn marks_count(&self) -> usize { self.marks_count }
    fn checksums(&self) -> &Checksums { &self.checksums }

    fn mark_broken(&self) {
        if !self.broken.swap(true, Ordering::AcqRel) {
            warn!(part = %self.name, "part marked as broken");
        }
    }

    fn is_broken(&self) -> bool { self.broken.load(Ordering::Acquire) }
}

impl Drop for DataPart {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(())  => debug!(part = %self.name, "removed obsolete part"),
            Err(e)  => warn!(part = %self.name, error = %e, "cannot remove obsolete part"),
        }
    }
}
