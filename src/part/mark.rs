//! Mark 与 MarkRange
//!
//! `.mrk` 文件是定长 16 字节条目的平铺数组：
//!
//! ```text
//! ┌───────────────────────────────┬────────────────────────────────┐
//! │ offset_in_compressed_file u64 │ offset_in_decompressed_block u64│  × marks_count
//! └───────────────────────────────┴────────────────────────────────┘
//! ```

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::common::{MergeTreeError, Result};

/// 单个 mark 的字节数
pub const MARK_SIZE: u64 = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Mark {
    pub offset_in_compressed_file:    u64,
    pub offset_in_decompressed_block: u64,
}

impl Mark {
    pub fn new(offset_in_compressed_file: u64, offset_in_decompressed_block: u64) -> Self {
        Self { offset_in_compressed_file, offset_in_decompressed_block }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_u64::<LittleEndian>(self.offset_in_compressed_file)?;
        out.write_u64::<LittleEndian>(self.offset_in_decompressed_block)?;
        Ok(())
    }
}

/// 以 mark（granule）为单位的半开区间 `[begin, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkRange {
    pub begin: usize,
    pub end:   usize,
}

impl MarkRange {
    pub fn new(begin: usize, end: usize) -> Self { Self { begin, end } }
    pub fn len(&self) -> usize { self.end.saturating_sub(self.begin) }
    pub fn is_empty(&self) -> bool { self.end <= self.begin }
}

impl std::fmt::Display for MarkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// 相邻区间合并成一个
pub fn merge_adjacent(ranges: &[MarkRange]) -> Vec<MarkRange> {
    let mut out: Vec<MarkRange> = Vec::with_capacity(ranges.len());
    for r in ranges.iter().filter(|r| !r.is_empty()) {
        match out.last_mut() {
            Some(last) if last.end == r.begin => last.end = r.end,
            _ => out.push(*r),
        }
    }
    out
}

/// 读取整份 `.mrk` 文件；`expected` 给出时校验条目数
pub fn read_marks(path: &Path, expected: Option<usize>) -> Result<Vec<Mark>> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    if size % MARK_SIZE != 0 {
        return Err(MergeTreeError::format(
            path.display().to_string(),
            format!("file size {size} is not a multiple of {MARK_SIZE}"),
        ));
    }
    let count = (size / MARK_SIZE) as usize;
    if let Some(expected) = expected {
        if expected != count {
            return Err(MergeTreeError::format(
                path.display().to_string(),
                format!("expected {expected} marks, file has {count}"),
            ));
        }
    }

    let mut r = BufReader::new(file);
    let mut marks = Vec::with_capacity(count);
    for _ in 0..count {
        let compressed   = r.read_u64::<LittleEndian>()?;
        let decompressed = r.read_u64::<LittleEndian>()?;
        marks.push(Mark::new(compressed, decompressed));
    }
    let mut rest = Vec::new();
    r.read_to_end(&mut rest)?;
    if !rest.is_empty() {
        return Err(MergeTreeError::format(path.display().to_string(), "trailing bytes after marks"));
    }
    Ok(marks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_ranges_are_merged() {
        let merged = merge_adjacent(&[
            MarkRange::new(0, 2), MarkRange::new(2, 3), MarkRange::new(5, 5), MarkRange::new(5, 7),
        ]);
        assert_eq!(merged, vec![MarkRange::new(0, 3), MarkRange::new(5, 7)]);
    }

    #[test]
    fn marks_file_round_trip_and_size_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.mrk");
        let mut f = File::create(&path).unwrap();
        Mark::new(0, 0).write_to(&mut f).unwrap();
        Mark::new(120, 16).write_to(&mut f).unwrap();
        drop(f);

        let marks = read_marks(&path, Some(2)).unwrap();
        assert_eq!(marks[1], Mark::new(120, 16));
        assert!(read_marks(&path, Some(3)).is_err());

        std::fs::OpenOptions::new().append(true).open(&path).unwrap().write_all(&[1, 2, 3]).unwrap();
        assert!(matches!(read_marks(&path, None), Err(MergeTreeError::Format { .. })));
    }
}
