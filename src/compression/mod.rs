//! 压缩块（LZ4 / None）
//!
//! `.bin` 文件是若干个可独立解压的压缩块首尾相接：
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ CRC32            (u32 LE)                │  覆盖下面所有字节
//! │ method           (u8)   0x02=None 0x82=LZ4│
//! │ compressed_size  (u32 LE) 含 9 字节头     │
//! │ uncompressed_size(u32 LE)                │
//! │ payload                                  │
//! └──────────────────────────────────────────┘
//! ```

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};

use crate::common::{MergeTreeError, Result};

/// CRC + 9 字节头
pub const BLOCK_HEADER_SIZE:  usize = 13;
const CHECKSUMMED_HEADER_SIZE: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    None,
    Lz4,
}

impl CompressionMethod {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::None => 0x02,
            Self::Lz4  => 0x82,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x02 => Ok(Self::None),
            0x82 => Ok(Self::Lz4),
            other => Err(MergeTreeError::Compression(format!("unknown compression method 0x{other:02x}"))),
        }
    }
}

pub fn compress(data: &[u8], codec: CompressionMethod) -> Result<Vec<u8>> {
    match codec {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Lz4  =>
            lz4::block::compress(data, None, false)
                .map_err(|e| MergeTreeError::Compression(e.to_string())),
    }
}

pub fn decompress(
    data:             &[u8],
    codec:            CompressionMethod,
    uncompressed_len: usize,
) -> Result<Vec<u8>> {
    let out = match codec {
        CompressionMethod::None => data.to_vec(),
        CompressionMethod::Lz4  => {
            if uncompressed_len == 0 {
                return Ok(Vec::new());
            }
            lz4::block::decompress(data, Some(uncompressed_len as i32))
                .map_err(|e| MergeTreeError::Compression(e.to_string()))?
        }
    };
    if out.len() != uncompressed_len {
        return Err(MergeTreeError::Compression(format!(
            "decompressed {} bytes, header says {uncompressed_len}", out.len(),
        )));
    }
    Ok(out)
}

// ── 块编解码 ──────────────────────────────────────────────────────────────────

/// 把一段未压缩数据封装为完整的压缩块
pub fn encode_block(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    let payload = compress(data, method)?;
    let mut block = vec![0u8; BLOCK_HEADER_SIZE];
    block[4] = method.to_byte();
    LittleEndian::write_u32(&mut block[5..9], (payload.len() + CHECKSUMMED_HEADER_SIZE) as u32);
    LittleEndian::write_u32(&mut block[9..13], data.len() as u32);
    block.extend_from_slice(&payload);

    let crc = crc32fast::hash(&block[4..]);
    LittleEndian::write_u32(&mut block[0..4], crc);
    Ok(block)
}

#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    raw:                   [u8; BLOCK_HEADER_SIZE],
    pub checksum:          u32,
    pub method:            CompressionMethod,
    /// 含 9 字节头
    pub compressed_size:   u32,
    pub uncompressed_size: u32,
}

impl BlockHeader {
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let mut raw = [0u8; BLOCK_HEADER_SIZE];
        r.read_exact(&mut raw)?;
        let compressed_size = LittleEndian::read_u32(&raw[5..9]);
        if (compressed_size as usize) < CHECKSUMMED_HEADER_SIZE {
            return Err(MergeTreeError::Compression(format!("bad compressed block size {compressed_size}")));
        }
        Ok(Self {
            raw,
            checksum:          LittleEndian::read_u32(&raw[0..4]),
            method:            CompressionMethod::from_byte(raw[4])?,
            compressed_size,
            uncompressed_size: LittleEndian::read_u32(&raw[9..13]),
        })
    }

    pub fn raw_bytes(&self) -> &[u8] { &self.raw }

    pub fn payload_len(&self) -> usize {
        self.compressed_size as usize - CHECKSUMMED_HEADER_SIZE
    }

    /// 整个块在文件中占用的字节数
    pub fn block_len(&self) -> u64 {
        (BLOCK_HEADER_SIZE + self.payload_len()) as u64
    }

    /// 校验并解压 payload
    pub fn decode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.raw[4..]);
        hasher.update(payload);
        if hasher.finalize() != self.checksum {
            return Err(MergeTreeError::ChecksumMismatch("compressed block".into()));
        }
        decompress(payload, self.method, self.uncompressed_size as usize)
    }
}

/// 从流中读出一个完整块并解压
pub fn read_block<R: Read>(r: &mut R) -> Result<(BlockHeader, Vec<u8>)> {
    let header = BlockHeader::read(r)?;
    let mut payload = vec![0u8; header.payload_len()];
    r.read_exact(&mut payload)?;
    let data = header.decode(&payload)?;
    Ok((header, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn block_survives_both_codecs() {
        let data: Vec<u8> = (0..10_000u32).flat_map(|i| (i % 97).to_le_bytes()).collect();
        for method in [CompressionMethod::None, CompressionMethod::Lz4] {
            let block = encode_block(&data, method).unwrap();
            let (header, out) = read_block(&mut Cursor::new(&block)).unwrap();
            assert_eq!(header.method, method);
            assert_eq!(header.block_len(), block.len() as u64);
            assert_eq!(out, data);
        }
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let mut block = encode_block(b"hello world", CompressionMethod::None).unwrap();
        let last = block.len() - 1;
        block[last] ^= 0xff;
        let err = read_block(&mut Cursor::new(&block)).unwrap_err();
        assert!(matches!(err, MergeTreeError::ChecksumMismatch(_)));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let mut block = encode_block(b"x", CompressionMethod::None).unwrap();
        block[4] = 0x99;
        assert!(read_block(&mut Cursor::new(&block)).is_err());
    }
}
