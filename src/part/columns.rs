//! `columns.txt` 与列到文件流的映射

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::block::ColumnDesc;
use crate::common::{escape_for_file_name, MergeTreeError, Result};
use crate::field_type::DataType;

use super::checksums::TextLines;

// ── columns.txt ───────────────────────────────────────────────────────────────

pub fn write_columns<W: Write>(columns: &[ColumnDesc], out: &mut W) -> Result<()> {
    writeln!(out, "columns format version: 1")?;
    writeln!(out, "{} columns:", columns.len())?;
    for c in columns {
        writeln!(out, "{} {}", quote_name(&c.name), c.data_type)?;
    }
    Ok(())
}

pub fn read_columns<R: BufRead>(r: R) -> Result<Vec<ColumnDesc>> {
    let mut lines = TextLines { inner: r.lines(), what: "columns.txt" };
    lines.expect_exact("columns format version: 1")?;
    let count: usize = lines.field_before(" columns:")?;
    let mut columns = Vec::with_capacity(count);
    for _ in 0..count {
        let line = lines.next_line()?;
        let (name, rest) = unquote_name(&line)
            .ok_or_else(|| MergeTreeError::format("columns.txt", format!("bad column line '{line}'")))?;
        let data_type: DataType = rest.trim_start().parse()?;
        columns.push(ColumnDesc { name, data_type });
    }
    Ok(columns)
}

pub fn load_columns(path: &Path) -> Result<Vec<ColumnDesc>> {
    read_columns(BufReader::new(File::open(path)?))
}

fn quote_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('`');
    for ch in name.chars() {
        if ch == '`' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('`');
    out
}

/// 解析行首的反引号名字，返回 (名字, 剩余部分)
fn unquote_name(line: &str) -> Option<(String, &str)> {
    let rest = line.strip_prefix('`')?;
    let mut name = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '\\' => name.push(chars.next()?.1),
            '`'  => return Some((name, &rest[i + 1..])),
            c    => name.push(c),
        }
    }
    None
}

// ── 列 → 文件流 ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// 第 level 层数组的每行长度（u64 LE）
    ArraySizes { level: usize },
    /// 展平后的标量值
    Values,
}

/// 一列在磁盘上的一个 `.bin` + `.mrk` 文件对
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnStream {
    /// 文件名去掉扩展名
    pub file_base: String,
    pub kind:      StreamKind,
    /// 该流中每个值的类型（长度流为 UInt64）
    pub data_type: DataType,
}

impl ColumnStream {
    pub fn bin_file(&self) -> String { format!("{}.bin", self.file_base) }
    pub fn mrk_file(&self) -> String { format!("{}.mrk", self.file_base) }

    /// 第 0 层长度流可以被同一 nested 表的多列共享
    pub fn is_shared_sizes(&self) -> bool {
        matches!(self.kind, StreamKind::ArraySizes { level: 0 })
    }
}

/// `n.a` → `n`；不含点的名字原样返回
pub fn nested_table_name(column: &str) -> &str {
    column.split_once('.').map(|(table, _)| table).unwrap_or(column)
}

/// 一列按写入顺序展开的全部文件流：外层长度流在前，值流最后
pub fn column_streams(name: &str, data_type: &DataType) -> Vec<ColumnStream> {
    let mut streams = Vec::new();
    let mut level = 0;
    let mut current = data_type;
    while let DataType::Array(nested) = current {
        let file_base = if level == 0 {
            format!("{}.size0", escape_for_file_name(nested_table_name(name)))
        } else {
            format!("{}.size{level}", escape_for_file_name(name))
        };
        streams.push(ColumnStream { file_base, kind: StreamKind::ArraySizes { level }, data_type: DataType::UInt64 });
        current = nested;
        level += 1;
    }
    streams.push(ColumnStream {
        file_base: escape_for_file_name(name),
        kind:      StreamKind::Values,
        data_type: current.clone(),
    });
    streams
}
