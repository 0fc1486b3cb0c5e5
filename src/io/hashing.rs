//! 边写边算哈希的 writer
//!
//! 哈希使用 128 位 xxh3；同时累计写入字节数，`count()` 即当前文件大小。

use std::io::{self, Write};

use xxhash_rust::xxh3::Xxh3;

/// 增量哈希 + 字节计数
pub struct RunningHash {
    hasher: Xxh3,
    count:  u64,
}

impl RunningHash {
    pub fn new() -> Self {
        Self { hasher: Xxh3::new(), count: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.count += data.len() as u64;
    }

    pub fn count(&self) -> u64 { self.count }
    pub fn digest(&self) -> u128 { self.hasher.digest128() }
}

impl Default for RunningHash {
    fn default() -> Self { Self::new() }
}

pub struct HashingWriter<W: Write> {
    inner: W,
    hash:  RunningHash,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, hash: RunningHash::new() }
    }

    /// 已写入的字节数
    pub fn count(&self) -> u64 { self.hash.count() }
    pub fn hash(&self) -> u128 { self.hash.digest() }

    pub fn get_ref(&self) -> &W { &self.inner }
    pub fn into_inner(self) -> W { self.inner }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hash.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// 一次性计算整段数据的哈希
pub fn hash_bytes(data: &[u8]) -> u128 {
    xxhash_rust::xxh3::xxh3_128(data)
}
