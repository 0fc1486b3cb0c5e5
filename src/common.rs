//! 全局基础类型与错误定义

use thiserror::Error;

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

/// 块号：写入时单调分配，part 名字中的 min/max 即块号区间
pub type BlockNumber = i64;

/// 合并层级：0 表示直接写入，每合并一次 +1
pub type MergeLevel  = u32;

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MergeTreeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// mark / checksums / columns.txt / 日志条目文本损坏
    #[error("format error in {what}: {detail}")]
    Format { what: String, detail: String },

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// 读取 part 失败；part 已被标记为 broken
    #[error("{source} (while reading from part {part}: {context})")]
    PartBroken {
        part:    String,
        context: String,
        source:  Box<MergeTreeError>,
    },

    #[error("all requested columns are missing in part {0}")]
    AllRequestedColumnsMissing(String),

    #[error("part not found: {0}")]
    PartNotFound(String),

    #[error("invalid part name: {0}")]
    InvalidPartName(String),

    /// 重复占用同一个 future part，说明调度逻辑有 bug
    #[error("execution conflict: {0}")]
    ExecutionConflict(String),

    /// 协调日志（外部持久存储）读写失败
    #[error("coordination log error: {0}")]
    Coordination(String),

    #[error("no such queue entry: {0}")]
    NoSuchEntry(String),

    #[error("logical error: {0}")]
    Logical(String),
}

impl MergeTreeError {
    pub fn format(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Format { what: what.into(), detail: detail.into() }
    }

    /// 读路径上是否应当把 part 标记为 broken
    pub fn marks_part_broken(&self) -> bool {
        !matches!(self, Self::AllRequestedColumnsMissing(_) | Self::PartBroken { .. })
    }
}

pub type Result<T> = std::result::Result<T, MergeTreeError>;

// ── 文件名转义 ────────────────────────────────────────────────────────────────

/// `[A-Za-z0-9_]` 以外的字节写成 `%XX`
pub fn escape_for_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for &b in name.as_bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

pub fn unescape_for_file_name(name: &str) -> Result<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == b'%' {
            let hex = name.get(pos + 1..pos + 3)
                .ok_or_else(|| MergeTreeError::format("file name", name))?;
            let b = u8::from_str_radix(hex, 16)
                .map_err(|_| MergeTreeError::format("file name", name))?;
            out.push(b);
            pos += 3;
        } else {
            out.push(bytes[pos]);
            pos += 1;
        }
    }
    String::from_utf8(out).map_err(|_| MergeTreeError::format("file name", name))
}

/// 当前 Unix 时间（秒）
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_keeps_identifiers() {
        assert_eq!(escape_for_file_name("user_id"), "user_id");
        assert_eq!(escape_for_file_name("n.a"), "n%2Ea");
        assert_eq!(unescape_for_file_name("n%2Ea").unwrap(), "n.a");
    }

    #[test]
    fn unescape_rejects_truncated_sequence() {
        assert!(unescape_for_file_name("abc%2").is_err());
    }
}
