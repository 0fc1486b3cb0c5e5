//! 顶层存储协调器
//!
//! 一张 MergeTree 表在一个目录下的全部 part：写入新 part、启动时加载、
//! 按 mark 区间读取、合并与删除分区。损坏的 part 被移出工作集，不会再被读取。

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::block::{Block, ColumnDesc, ColumnWithTypeAndName};
use crate::common::{BlockNumber, MergeTreeError, Result};
use crate::context::EngineContext;
use crate::field_type::Value;
use crate::index::{SkipIndexDesc, SkipIndexReader};
use crate::part::{mark::merge_adjacent, ActivePartSet, Checksums, DataPart, MarkRange, PartInfo, PartLayout};
use crate::reader::{BrokenPartSink, BrokenParts, ColumnDefaults, PrewhereFilter};
use crate::select::{MergeTreeSelect, SelectOptions};
use crate::writer::PartWriter;

const TMP_PREFIX: &str = "tmp_";

/// 表结构
#[derive(Debug, Clone)]
pub struct TableDefinition {
    pub columns:      Vec<ColumnDesc>,
    pub sort_key:     Vec<String>,
    pub skip_indices: Vec<SkipIndexDesc>,
}

impl TableDefinition {
    pub fn new(columns: Vec<ColumnDesc>, sort_key: &[&str]) -> Self {
        Self { columns, sort_key: sort_key.iter().map(|s| s.to_string()).collect(), skip_indices: Vec::new() }
    }

    pub fn with_skip_index(mut self, index: SkipIndexDesc) -> Self {
        self.skip_indices.push(index); self
    }

    pub fn column(&self, name: &str) -> Result<&ColumnDesc> {
        self.columns.iter().find(|c| c.name == name)
            .ok_or_else(|| MergeTreeError::SchemaMismatch(format!("no column {name} in table")))
    }
}

pub struct MergeTreeStorage {
    path:          PathBuf,
    ctx:           EngineContext,
    definition:    TableDefinition,
    sort_key:      Vec<ColumnDesc>,
    defaults:      ColumnDefaults,
    /// 工作集：名字 → part
    parts:         RwLock<BTreeMap<String, Arc<DataPart>>>,
    virtual_parts: Mutex<ActivePartSet>,
    broken:        Arc<BrokenParts>,
    increment:     AtomicI64,
}

impl MergeTreeStorage {
    /// 打开（必要时创建）表目录并加载已有 part
    pub fn open(path: &Path, definition: TableDefinition, ctx: EngineContext) -> Result<Self> {
        let sort_key = definition.sort_key.iter()
            .map(|k| definition.column(k).cloned())
            .collect::<Result<Vec<_>>>()?;
        for index in &definition.skip_indices {
            definition.column(&index.column)?;
        }
        fs::create_dir_all(path)?;

        let storage = Self {
            path:          path.to_path_buf(),
            ctx, definition, sort_key,
            defaults:      ColumnDefaults::new(),
            parts:         RwLock::new(BTreeMap::new()),
            virtual_parts: Mutex::new(ActivePartSet::new()),
            broken:        Arc::new(BrokenParts::default()),
            increment:     AtomicI64::new(1),
        };
        storage.load_parts()?;
        Ok(storage)
    }

    pub fn with_defaults(mut self, defaults: ColumnDefaults) -> Self {
        self.defaults = defaults; self
    }

    pub fn path(&self) -> &Path { &self.path }
    pub fn context(&self) -> &EngineContext { &self.ctx }
    pub fn definition(&self) -> &TableDefinition { &self.definition }

    // ── 加载 ──────────────────────────────────────────────────────────────────

    /// 扫描表目录：清理临时目录，加载 part，丢弃被覆盖的旧 part
    pub fn load_parts(&self) -> Result<usize> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
            if name.starts_with(TMP_PREFIX) {
                warn!(dir = %name, "removing leftover temporary part");
                fs::remove_dir_all(entry.path())?;
                continue;
            }
            names.push(name);
        }
        names.sort();

        let granularity = self.ctx.settings.index_granularity;
        let mut loaded: Vec<Arc<DataPart>> = Vec::new();
        for name in names {
            if PartInfo::parse(&name).is_err() {
                warn!(dir = %name, "skipping directory that is not a part");
                continue;
            }
            match DataPart::load(&self.path.join(&name), &self.sort_key, granularity) {
                Ok(part) => loaded.push(Arc::new(part)),
                Err(e) => {
                    error!(part = %name, error = %e, "cannot load part, treating it as broken");
                    self.broken.report_broken_part(&name);
                }
            }
        }

        let mut parts = self.parts.write();
        let mut virtual_parts = self.virtual_parts.lock();
        for part in &loaded {
            let covered = loaded.iter().any(|other| {
                other.name() != part.name() && other.info.contains(&part.info)
            });
            if covered {
                info!(part = %part.name(), "part is covered by a bigger part, removing");
                part.mark_obsolete();
                continue;
            }
            virtual_parts.add_info(part.info.clone());
            parts.insert(part.name().to_string(), Arc::clone(part));
        }
        let max_block = parts.values().map(|p| p.info.max_block).max().unwrap_or(0);
        self.increment.store(max_block + 1, Ordering::SeqCst);
        info!(path = %self.path.display(), parts = parts.len(), "loaded parts");
        Ok(parts.len())
    }

    // ── 写入 ──────────────────────────────────────────────────────────────────

    pub fn allocate_block_number(&self) -> BlockNumber {
        self.increment.fetch_add(1, Ordering::SeqCst)
    }

    /// 写入一个新 part，块号自动分配；没有行时返回 None
    pub fn write_part<I>(&self, blocks: I, partition_id: &str) -> Result<Option<Arc<DataPart>>>
    where
        I: IntoIterator<Item = Block>,
    {
        let number = self.allocate_block_number();
        self.write_part_as(blocks, PartInfo::new(partition_id, number, number, 0))
    }

    /// 输入按排序键稳定排序后先写入 `tmp_<name>`，finalize 成功后改名并注册
    pub fn write_part_as<I>(&self, blocks: I, info: PartInfo) -> Result<Option<Arc<DataPart>>>
    where
        I: IntoIterator<Item = Block>,
    {
        let mut rows = Block::new();
        for block in blocks {
            if block.rows() > 0 {
                rows.append(block)?;
            }
        }
        let sorted = sort_block(rows, &self.definition.sort_key)?;

        let name = info.to_string();
        let tmp  = self.path.join(format!("{TMP_PREFIX}{name}"));
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }

        let checksums = match self.write_to_dir(&tmp, sorted) {
            Ok(checksums) => checksums,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&tmp) {
                    warn!(dir = %tmp.display(), error = %cleanup, "cannot remove temporary part");
                }
                return Err(e);
            }
        };
        if checksums.is_empty() {
            return Ok(None);
        }

        let dir = self.path.join(&name);
        fs::rename(&tmp, &dir)?;
        let part = Arc::new(DataPart::load(&dir, &self.sort_key, self.ctx.settings.index_granularity)?);
        self.commit_part(Arc::clone(&part))?;
        Ok(Some(part))
    }

    fn write_to_dir(&self, dir: &Path, block: Block) -> Result<Checksums> {
        let mut writer = PartWriter::open(
            dir,
            self.definition.columns.clone(),
            &self.definition.sort_key,
            self.ctx.settings.index_granularity,
            &self.ctx,
        )?.with_skip_indices(self.definition.skip_indices.clone())?;
        writer.write(&block)?;
        writer.finalize()
    }

    /// 加入工作集；被新 part 覆盖的旧 part 标记为 obsolete
    pub fn commit_part(&self, part: Arc<DataPart>) -> Result<()> {
        let mut parts = self.parts.write();
        if let Some(covering) = parts.values().find(|p| p.name() != part.name() && p.info.contains(&part.info)) {
            part.mark_obsolete();
            return Err(MergeTreeError::Logical(format!(
                "part {} is already covered by {}", part.name(), covering.name(),
            )));
        }
        let covered: Vec<String> = parts.values()
            .filter(|p| part.info.contains(&p.info))
            .map(|p| p.name().to_string())
            .collect();
        for name in covered {
            if let Some(old) = parts.remove(&name) {
                old.mark_obsolete();
            }
        }
        self.virtual_parts.lock().add_info(part.info.clone());
        info!(part = %part.name(), rows = ?part.rows_count(), "committed part");
        parts.insert(part.name().to_string(), part);
        Ok(())
    }

    /// 读出源 part 的全部行，写成 `new_name`
    pub fn merge_parts(&self, sources: &[String], new_name: &str) -> Result<Option<Arc<DataPart>>> {
        let target = PartInfo::parse(new_name)?;
        let mut merged = Block::new();
        for name in sources {
            let part = self.get_part(name)?;
            if !target.contains(&part.info) {
                return Err(MergeTreeError::Logical(format!("merged part {new_name} does not cover {name}")));
            }
            let ranges = vec![MarkRange::new(0, part.granules_count())];
            let columns = self.definition.columns.clone();
            let select = MergeTreeSelect::new(part, columns, ranges, self.select_options(None), &self.ctx)?;
            for block in select {
                merged.append(block?)?;
            }
        }
        self.write_part_as(std::iter::once(merged), target)
    }

    /// 删除一个分区内块号不超过 drop range 的所有 part
    pub fn drop_range(&self, drop_range: &PartInfo) -> usize {
        let mut parts = self.parts.write();
        let dropped: Vec<String> = parts.values()
            .filter(|p| drop_range.contains(&p.info))
            .map(|p| p.name().to_string())
            .collect();
        for name in &dropped {
            if let Some(part) = parts.remove(name) {
                part.mark_obsolete();
            }
        }
        self.virtual_parts.lock().add_info(drop_range.clone());
        info!(range = %drop_range, parts = dropped.len(), "dropped range");
        dropped.len()
    }

    // ── 查询 ──────────────────────────────────────────────────────────────────

    /// 工作集中未损坏的 part，按名字排序
    pub fn parts(&self) -> Vec<Arc<DataPart>> {
        self.parts.read().values()
            .filter(|p| !p.is_broken() && !self.broken.contains(p.name()))
            .cloned()
            .collect()
    }

    pub fn part_names(&self) -> Vec<String> {
        self.parts().iter().map(|p| p.name().to_string()).collect()
    }

    pub fn get_part(&self, name: &str) -> Result<Arc<DataPart>> {
        self.parts.read().get(name)
            .filter(|p| !p.is_broken() && !self.broken.contains(name))
            .cloned()
            .ok_or_else(|| MergeTreeError::PartNotFound(name.to_string()))
    }

    pub fn virtual_parts(&self) -> Vec<String> { self.virtual_parts.lock().parts() }

    pub fn broken_parts(&self) -> Vec<String> { self.broken.names() }

    /// 读路径之外发现的损坏：移出工作集，保留目录以便检查
    pub fn report_broken_part(&self, name: &str) {
        self.broken.report_broken_part(name);
        if let Some(part) = self.parts.write().remove(name) {
            part.mark_broken();
            error!(part = %name, "removed broken part from the working set");
        }
    }

    fn select_options(&self, prewhere: Option<Arc<dyn PrewhereFilter>>) -> SelectOptions {
        let sink: Arc<dyn BrokenPartSink> = self.broken.clone();
        SelectOptions {
            prewhere,
            defaults:               self.defaults.clone(),
            broken_part_sink:       Some(sink),
            use_uncompressed_cache: self.ctx.settings.use_uncompressed_cache,
        }
    }

    fn column_descs(&self, columns: &[&str]) -> Result<Vec<ColumnDesc>> {
        columns.iter().map(|c| self.definition.column(c).cloned()).collect()
    }

    /// 从一个 part 读取给定区间
    pub fn read(
        &self,
        part_name: &str,
        columns:   &[&str],
        ranges:    Vec<MarkRange>,
        prewhere:  Option<Arc<dyn PrewhereFilter>>,
    ) -> Result<MergeTreeSelect> {
        let part = self.get_part(part_name)?;
        let columns = self.column_descs(columns)?;
        MergeTreeSelect::new(part, columns, ranges, self.select_options(prewhere), &self.ctx)
    }

    /// 读取所有 part 的全部行
    pub fn read_all(&self, columns: &[&str], prewhere: Option<Arc<dyn PrewhereFilter>>) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        for part in self.parts() {
            let ranges = vec![MarkRange::new(0, part.granules_count())];
            for block in self.read(part.name(), columns, ranges, prewhere.clone())? {
                blocks.push(block?);
            }
        }
        Ok(blocks)
    }

    /// 用跳数索引排除不可能含有 `value` 的区间；part 没有该索引时返回全部区间
    pub fn select_ranges_by_skip_index(&self, part_name: &str, index_name: &str, value: &Value) -> Result<Vec<MarkRange>> {
        let part = self.get_part(part_name)?;
        let all = vec![MarkRange::new(0, part.granules_count())];
        let desc = self.definition.skip_indices.iter()
            .find(|i| i.name == index_name)
            .ok_or_else(|| MergeTreeError::SchemaMismatch(format!("no skip index {index_name}")))?;
        match SkipIndexReader::open(part.as_ref(), desc, &self.ctx)? {
            Some(mut reader) => reader.filter_ranges(&all, value),
            None             => Ok(all),
        }
    }

    /// 按主键首列的闭区间 `[lo, hi]` 选出可能命中的 granule
    pub fn select_ranges_by_primary_key(&self, part_name: &str, lo: &Value, hi: &Value) -> Result<Vec<MarkRange>> {
        let part = self.get_part(part_name)?;
        let index = part.index();
        if index.len() < 2 {
            return Ok(vec![MarkRange::new(0, part.granules_count())]);
        }
        let ranges: Vec<MarkRange> = (0..index.len() - 1)
            .filter(|&i| {
                let (first, next) = (&index[i][0], &index[i + 1][0]);
                !(next < lo || first > hi)
            })
            .map(|i| MarkRange::new(i, i + 1))
            .collect();
        Ok(merge_adjacent(&ranges))
    }
}

/// 按排序键稳定排序
fn sort_block(block: Block, sort_key: &[String]) -> Result<Block> {
    if sort_key.is_empty() || block.rows() < 2 {
        return Ok(block);
    }
    let keys = sort_key.iter()
        .map(|k| {
            block.by_name(k).map(|c| c.values.clone())
                .ok_or_else(|| MergeTreeError::SchemaMismatch(format!("block has no sort key column {k}")))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut perm: Vec<usize> = (0..block.rows()).collect();
    perm.sort_by(|&a, &b| {
        keys.iter()
            .map(|k| k[a].partial_cmp(&k[b]).unwrap_or(CmpOrdering::Equal))
            .find(|o| o.is_ne())
            .unwrap_or(CmpOrdering::Equal)
    });

    let columns = block.into_columns().into_iter()
        .map(|c| {
            let values = perm.iter().map(|&i| c.values[i].clone()).collect();
            ColumnWithTypeAndName { values, ..c }
        })
        .collect();
    Block::from_columns(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_type::DataType;

    #[test]
    fn sort_block_orders_by_key_then_keeps_input_order() {
        let block = Block::from_columns(vec![
            ColumnWithTypeAndName::new("k", DataType::Int64, vec![Value::Int64(2), Value::Int64(1), Value::Int64(2)]),
            ColumnWithTypeAndName::new("v", DataType::String, vec!["a".into(), "b".into(), "c".into()]),
        ]).unwrap();
        let sorted = sort_block(block, &["k".to_string()]).unwrap();
        assert_eq!(sorted.by_name("v").unwrap().values, vec![Value::from("b"), Value::from("a"), Value::from("c")]);
    }
}
