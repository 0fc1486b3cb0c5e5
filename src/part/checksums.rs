//! `checksums.txt`：part 内每个文件的大小与哈希
//!
//! ```text
//! checksums format version: 1
//! 2 files:
//! a.bin
//! 	size: 120
//! 	hash: 5e1f...                       (xxh3-128，32 位十六进制)
//! 	compressed: 1
//! 	uncompressed size: 400
//! 	uncompressed hash: 9ab0...
//! a.mrk
//! 	size: 32
//! 	hash: 77c2...
//! 	compressed: 0
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

use crate::common::{MergeTreeError, Result};
use crate::compression;
use crate::io::{RunningHash, StreamChecksums};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChecksum {
    pub file_size:    u64,
    pub file_hash:    u128,
    /// 压缩文件的 (解压后大小, 解压后哈希)
    pub uncompressed: Option<(u64, u128)>,
}

impl FileChecksum {
    pub fn plain(file_size: u64, file_hash: u128) -> Self {
        Self { file_size, file_hash, uncompressed: None }
    }

    pub fn is_compressed(&self) -> bool { self.uncompressed.is_some() }

    /// 两份校验和是否一致；都带解压信息时只比较解压内容
    pub fn check_equal(&self, rhs: &FileChecksum, have_uncompressed: bool, name: &str) -> Result<()> {
        if have_uncompressed {
            if let (Some(l), Some(r)) = (self.uncompressed, rhs.uncompressed) {
                if l.0 != r.0 {
                    return Err(MergeTreeError::ChecksumMismatch(format!(
                        "{name}: uncompressed size {} vs {}", l.0, r.0,
                    )));
                }
                if l.1 != r.1 {
                    return Err(MergeTreeError::ChecksumMismatch(format!("{name}: uncompressed hash differs")));
                }
                return Ok(());
            }
        }
        if self.file_size != rhs.file_size {
            return Err(MergeTreeError::ChecksumMismatch(format!(
                "{name}: size {} vs {}", self.file_size, rhs.file_size,
            )));
        }
        if self.file_hash != rhs.file_hash {
            return Err(MergeTreeError::ChecksumMismatch(format!("{name}: hash differs")));
        }
        Ok(())
    }
}

impl From<StreamChecksums> for FileChecksum {
    fn from(s: StreamChecksums) -> Self {
        Self {
            file_size:    s.file_size,
            file_hash:    s.file_hash,
            uncompressed: Some((s.uncompressed_size, s.uncompressed_hash)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checksums {
    pub files: BTreeMap<String, FileChecksum>,
}

impl Checksums {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, file_name: impl Into<String>, checksum: FileChecksum) {
        self.files.insert(file_name.into(), checksum);
    }

    pub fn get(&self, file_name: &str) -> Option<&FileChecksum> { self.files.get(file_name) }
    pub fn len(&self) -> usize { self.files.len() }
    pub fn is_empty(&self) -> bool { self.files.is_empty() }

    /// 所有文件的总大小
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|c| c.file_size).sum()
    }

    /// 报告第一个不一致的文件
    pub fn check_equal(&self, rhs: &Checksums, have_uncompressed: bool) -> Result<()> {
        if let Some(missing) = rhs.files.keys().find(|k| !self.files.contains_key(*k)) {
            return Err(MergeTreeError::ChecksumMismatch(format!("unexpected file {missing}")));
        }
        for (name, checksum) in &self.files {
            let other = rhs.files.get(name)
                .ok_or_else(|| MergeTreeError::ChecksumMismatch(format!("no file {name}")))?;
            checksum.check_equal(other, have_uncompressed, name)?;
        }
        Ok(())
    }

    /// 重新计算磁盘上每个文件的校验和并与记录比较
    pub fn verify_files(&self, dir: &Path) -> Result<()> {
        let mut actual = Checksums::new();
        for (name, expected) in &self.files {
            let path = dir.join(name);
            let checksum = if expected.is_compressed() {
                hash_compressed_file(&path)?
            } else {
                hash_file(&path)?
            };
            actual.add(name.clone(), checksum);
        }
        // 物理字节与解压内容都要一致
        self.check_equal(&actual, false)?;
        self.check_equal(&actual, true)
    }

    // ── 文本格式 ──────────────────────────────────────────────────────────────

    pub fn write_text<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "checksums format version: 1")?;
        writeln!(out, "{} files:", self.files.len())?;
        for (name, c) in &self.files {
            writeln!(out, "{name}")?;
            writeln!(out, "\tsize: {}", c.file_size)?;
            writeln!(out, "\thash: {:032x}", c.file_hash)?;
            writeln!(out, "\tcompressed: {}", c.is_compressed() as u8)?;
            if let Some((size, hash)) = c.uncompressed {
                writeln!(out, "\tuncompressed size: {size}")?;
                writeln!(out, "\tuncompressed hash: {hash:032x}")?;
            }
        }
        Ok(())
    }

    pub fn read_text<R: BufRead>(r: R) -> Result<Self> {
        let mut lines = TextLines { inner: r.lines(), what: "checksums.txt" };
        lines.expect_exact("checksums format version: 1")?;
        let count: usize = lines.field_before(" files:")?;

        let mut checksums = Checksums::new();
        for _ in 0..count {
            let name      = lines.next_line()?;
            let file_size = lines.field("\tsize: ")?;
            let file_hash = lines.hex_field("\thash: ")?;
            let compressed: u8 = lines.field("\tcompressed: ")?;
            let uncompressed = if compressed != 0 {
                Some((lines.field("\tuncompressed size: ")?, lines.hex_field("\tuncompressed hash: ")?))
            } else {
                None
            };
            checksums.add(name, FileChecksum { file_size, file_hash, uncompressed });
        }
        Ok(checksums)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::read_text(BufReader::new(File::open(path)?))
    }
}

/// 逐行读取 `key: value` 形式的文本元数据
pub(crate) struct TextLines<R: BufRead> {
    pub inner: io::Lines<R>,
    pub what:  &'static str,
}

impl<R: BufRead> TextLines<R> {
    fn error(&self, detail: impl Into<String>) -> MergeTreeError {
        MergeTreeError::format(self.what, detail)
    }

    pub fn next_line(&mut self) -> Result<String> {
        match self.inner.next() {
            Some(line) => Ok(line?),
            None       => Err(self.error("unexpected end of file")),
        }
    }

    pub fn expect_exact(&mut self, expected: &str) -> Result<()> {
        let line = self.next_line()?;
        if line != expected {
            return Err(self.error(format!("expected '{expected}', got '{line}'")));
        }
        Ok(())
    }

    pub fn field<T: std::str::FromStr>(&mut self, prefix: &str) -> Result<T> {
        let line = self.next_line()?;
        line.strip_prefix(prefix)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| self.error(format!("expected '{}<value>', got '{line}'", prefix.trim_start())))
    }

    pub fn field_before<T: std::str::FromStr>(&mut self, suffix: &str) -> Result<T> {
        let line = self.next_line()?;
        line.strip_suffix(suffix)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| self.error(format!("expected '<value>{suffix}', got '{line}'")))
    }

    fn hex_field(&mut self, prefix: &str) -> Result<u128> {
        let line = self.next_line()?;
        line.strip_prefix(prefix)
            .and_then(|v| u128::from_str_radix(v, 16).ok())
            .ok_or_else(|| self.error(format!("bad hash line '{line}'")))
    }
}

pub fn hash_file(path: &Path) -> Result<FileChecksum> {
    let mut r = BufReader::new(File::open(path)?);
    let mut hash = RunningHash::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hash.update(&buf[..n]);
    }
    Ok(FileChecksum::plain(hash.count(), hash.digest()))
}

/// 逐块解压，同时计算物理与逻辑两个哈希
pub fn hash_compressed_file(path: &Path) -> Result<FileChecksum> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut r = BufReader::new(file);
    let mut physical = RunningHash::new();
    let mut logical  = RunningHash::new();
    let mut pos = 0u64;
    while pos < size {
        let header = compression::BlockHeader::read(&mut r)?;
        let mut payload = vec![0u8; header.payload_len()];
        r.read_exact(&mut payload)?;
        let data = header.decode(&payload)?;
        physical.update(header.raw_bytes());
        physical.update(&payload);
        logical.update(&data);
        pos += header.block_len();
    }
    Ok(FileChecksum {
        file_size:    physical.count(),
        file_hash:    physical.digest(),
        uncompressed: Some((logical.count(), logical.digest())),
    })
}
