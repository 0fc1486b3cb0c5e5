//! 列流 I/O：哈希 writer 与压缩块读写

pub mod compressed;
pub mod hashing;

pub use compressed::{CompressedReader, CompressedWriter, StreamChecksums};
pub use hashing::{hash_bytes, HashingWriter, RunningHash};

use crate::common::MergeTreeError;

/// 在 `std::io` trait 实现里携带引擎错误
pub(crate) fn to_io_error(e: MergeTreeError) -> std::io::Error {
    match e {
        MergeTreeError::Io(io) => io,
        other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
    }
}
