//! 压缩流读写
//!
//! 写入链：`CompressedWriter → HashingWriter → BufWriter<File>`，两个哈希分别
//! 覆盖压缩前的逻辑字节与物理落盘字节。
//!
//! 读取端按 mark `(offset_in_compressed_file, offset_in_decompressed_block)`
//! 定位；目标块就是当前块时只移动块内指针，不重新读盘。

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{CachedBlock, UncompressedCache};
use crate::common::{MergeTreeError, Result};
use crate::compression::{self, CompressionMethod};
use crate::context::ReadMetrics;
use crate::part::Mark;

use super::hashing::{HashingWriter, RunningHash};
use super::to_io_error;

// ── CompressedWriter ──────────────────────────────────────────────────────────

/// 一个压缩流结束时的大小与哈希
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamChecksums {
    pub file_size:         u64,
    pub file_hash:         u128,
    pub uncompressed_size: u64,
    pub uncompressed_hash: u128,
}

pub struct CompressedWriter<W: Write> {
    out:            HashingWriter<W>,
    buf:            Vec<u8>,
    method:         CompressionMethod,
    max_block_size: usize,
    logical:        RunningHash,
}

impl<W: Write> CompressedWriter<W> {
    pub fn new(out: W, method: CompressionMethod, max_block_size: usize) -> Self {
        let max_block_size = max_block_size.max(1);
        Self {
            out: HashingWriter::new(out),
            buf: Vec::with_capacity(max_block_size.min(1 << 20)),
            method, max_block_size,
            logical: RunningHash::new(),
        }
    }

    /// 当前未压缩块内已缓冲的字节数
    pub fn offset_in_block(&self) -> usize { self.buf.len() }

    /// 已经写出的压缩字节数，即下一个块的起始偏移
    pub fn compressed_offset(&self) -> u64 { self.out.count() }

    /// 当前写入位置对应的 mark
    pub fn mark(&self) -> Mark {
        Mark::new(self.compressed_offset(), self.offset_in_block() as u64)
    }

    /// 把缓冲压缩成一个块写出；缓冲为空时什么也不做
    pub fn next(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let block = compression::encode_block(&self.buf, self.method)?;
        self.out.write_all(&block)?;
        self.buf.clear();
        Ok(())
    }

    pub fn finish(mut self) -> Result<StreamChecksums> {
        self.next()?;
        self.out.flush()?;
        Ok(StreamChecksums {
            file_size:         self.out.count(),
            file_hash:         self.out.hash(),
            uncompressed_size: self.logical.count(),
            uncompressed_hash: self.logical.digest(),
        })
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < data.len() {
            let room  = self.max_block_size - self.buf.len();
            let n     = room.min(data.len() - written);
            let chunk = &data[written..written + n];
            self.buf.extend_from_slice(chunk);
            self.logical.update(chunk);
            written += n;
            // 写满立即落块，mark 不会指向块尾
            if self.buf.len() >= self.max_block_size {
                self.next().map_err(to_io_error)?;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.next().map_err(to_io_error)?;
        self.out.flush()
    }
}

// ── CompressedReader ──────────────────────────────────────────────────────────

pub struct CompressedReader {
    path:         PathBuf,
    file:         BufReader<File>,
    file_size:    u64,
    /// `file` 的逻辑读位置
    file_pos:     u64,
    cache:        Option<Arc<UncompressedCache>>,
    metrics:      Arc<ReadMetrics>,
    block:        Arc<CachedBlock>,
    block_offset: Option<u64>,
    pos:          usize,
}

impl CompressedReader {
    /// `buffer_size` 为物理读缓冲大小；传入 `cache` 时经由解压块缓存读取
    pub fn open(
        path:        &Path,
        buffer_size: usize,
        cache:       Option<Arc<UncompressedCache>>,
        metrics:     Arc<ReadMetrics>,
    ) -> Result<Self> {
        let file      = File::open(path)?;
        let file_size = file.metadata()?.len();
        ReadMetrics::add(&metrics.streams_opened, 1);
        Ok(Self {
            path:         path.to_path_buf(),
            file:         BufReader::with_capacity(buffer_size.max(1), file),
            file_size,
            file_pos:     0,
            cache:        cache.filter(|c| c.is_enabled()),
            metrics,
            block:        empty_block(),
            block_offset: None,
            pos:          0,
        })
    }

    pub fn path(&self) -> &Path { &self.path }
    pub fn file_size(&self) -> u64 { self.file_size }
    pub fn buffer_capacity(&self) -> usize { self.file.capacity() }

    /// 当前读位置（块偏移、块内偏移）
    pub fn position(&self) -> Mark {
        Mark::new(self.block_offset.unwrap_or(0), self.pos as u64)
    }

    pub fn seek(&mut self, offset_in_compressed_file: u64, offset_in_decompressed_block: u64) -> Result<()> {
        if self.block_offset != Some(offset_in_compressed_file) {
            self.load_block(offset_in_compressed_file)?;
        }
        if offset_in_decompressed_block as usize > self.block.data.len() {
            return Err(MergeTreeError::format(
                self.path.display().to_string(),
                format!(
                    "seek to offset {offset_in_decompressed_block} in block at {offset_in_compressed_file}, \
                     block has {} bytes",
                    self.block.data.len(),
                ),
            ));
        }
        self.pos = offset_in_decompressed_block as usize;
        Ok(())
    }

    fn load_block(&mut self, offset: u64) -> Result<()> {
        if offset >= self.file_size {
            self.block        = empty_block();
            self.block_offset = Some(self.file_size);
            self.pos          = 0;
            return Ok(());
        }

        if let Some(cache) = &self.cache {
            if let Some(block) = cache.get(&self.path, offset) {
                ReadMetrics::add(&self.metrics.uncompressed_cache_hits, 1);
                self.block        = block;
                self.block_offset = Some(offset);
                self.pos          = 0;
                return Ok(());
            }
            ReadMetrics::add(&self.metrics.uncompressed_cache_misses, 1);
        }

        if self.file_pos != offset {
            self.file.seek_relative(offset as i64 - self.file_pos as i64)?;
            self.file_pos = offset;
        }
        let (header, data) = compression::read_block(&mut self.file)?;
        self.file_pos += header.block_len();
        ReadMetrics::add(&self.metrics.compressed_blocks_read, 1);
        ReadMetrics::add(&self.metrics.compressed_bytes_read, header.block_len());

        let block = Arc::new(CachedBlock { data, compressed_bytes: header.block_len() });
        if let Some(cache) = &self.cache {
            cache.set(&self.path, offset, Arc::clone(&block));
        }
        self.block        = block;
        self.block_offset = Some(offset);
        self.pos          = 0;
        Ok(())
    }
}

fn empty_block() -> Arc<CachedBlock> {
    Arc::new(CachedBlock { data: Vec::new(), compressed_bytes: 0 })
}

impl BufRead for CompressedReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        while self.pos >= self.block.data.len() {
            let next = match self.block_offset {
                Some(off) => off + self.block.compressed_bytes,
                None      => 0,
            };
            if next >= self.file_size {
                return Ok(&[]);
            }
            self.load_block(next).map_err(to_io_error)?;
        }
        Ok(&self.block.data[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.block.data.len());
    }
}

impl Read for CompressedReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let avail = self.fill_buf()?;
        let n = avail.len().min(out.len());
        out[..n].copy_from_slice(&avail[..n]);
        self.consume(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufWriter;

    fn write_stream(path: &Path, chunks: &[&[u8]], max_block: usize) -> (Vec<Mark>, StreamChecksums) {
        let file = BufWriter::new(File::create(path).unwrap());
        let mut w = CompressedWriter::new(file, CompressionMethod::Lz4, max_block);
        let mut marks = Vec::new();
        for chunk in chunks {
            marks.push(w.mark());
            w.write_all(chunk).unwrap();
        }
        (marks, w.finish().unwrap())
    }

    #[test]
    fn seek_to_each_mark_reads_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");
        let chunks: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 7]).collect();
        let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
        let (marks, sums) = write_stream(&path, &refs, 16);
        assert_eq!(sums.uncompressed_size, 140);

        let metrics = Arc::new(ReadMetrics::default());
        let mut r = CompressedReader::open(&path, 64, None, metrics).unwrap();
        for (i, mark) in marks.iter().enumerate().rev() {
            r.seek(mark.offset_in_compressed_file, mark.offset_in_decompressed_block).unwrap();
            let mut buf = [0u8; 7];
            r.read_exact(&mut buf).unwrap();
            assert_eq!(buf, [i as u8; 7]);
        }
    }

    #[test]
    fn sequential_read_spans_blocks_and_ends_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        write_stream(&path, &[&data], 100);

        let metrics = Arc::new(ReadMetrics::default());
        let mut r = CompressedReader::open(&path, 32, None, Arc::clone(&metrics)).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(ReadMetrics::get(&metrics.compressed_blocks_read), 10);
    }

    #[test]
    fn cached_reads_skip_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");
        write_stream(&path, &[b"abcdef"], 1024);

        let cache = Arc::new(UncompressedCache::new(8));
        let metrics = Arc::new(ReadMetrics::default());
        for _ in 0..3 {
            let mut r = CompressedReader::open(&path, 64, Some(Arc::clone(&cache)), Arc::clone(&metrics)).unwrap();
            let mut out = Vec::new();
            r.read_to_end(&mut out).unwrap();
            assert_eq!(out, b"abcdef");
        }
        assert_eq!(ReadMetrics::get(&metrics.compressed_blocks_read), 1);
        assert_eq!(ReadMetrics::get(&metrics.uncompressed_cache_hits), 2);
    }

    #[test]
    fn seek_past_block_end_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");
        write_stream(&path, &[b"abc"], 1024);
        let mut r = CompressedReader::open(&path, 64, None, Arc::new(ReadMetrics::default())).unwrap();
        assert!(r.seek(0, 4).is_err());
        assert!(r.seek(0, 3).is_ok());
    }
}
