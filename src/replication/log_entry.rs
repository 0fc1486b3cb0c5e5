//! 复制日志条目与其文本格式
//!
//! ```text
//! format version: 1
//! create_time: 1700000000
//! source replica: r1
//! merge
//! 201401_1_1_0
//! 201401_2_2_0
//! into
//! 201401_1_2_1
//! ```

use std::fmt;

use crate::common::{MergeTreeError, Result};

const FORMAT_HEADER: &str = "format version: 1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogEntryType {
    /// 从其他副本拉取 part
    GetPart,
    MergeParts,
    /// 从 detached 目录挂回 part
    AttachPart,
    /// 删除（或 detach）被 `new_part_name` 覆盖的所有 part
    DropRange,
}

impl LogEntryType {
    pub fn is_get_or_merge(self) -> bool {
        matches!(self, Self::GetPart | Self::MergeParts)
    }

    /// 这类条目执行完会产出 `new_part_name`
    pub fn produces_part(self) -> bool {
        !matches!(self, Self::DropRange)
    }
}

impl fmt::Display for LogEntryType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::GetPart    => "GET_PART",
            Self::MergeParts => "MERGE_PARTS",
            Self::AttachPart => "ATTACH_PART",
            Self::DropRange  => "DROP_RANGE",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// 在副本队列中的记录名（`queue-0000000007`）；未落盘前为空
    pub znode_name:       String,
    pub entry_type:       LogEntryType,
    /// 空字符串表示条目直接放进了队列，而不是从共享日志复制来的
    pub source_replica:   String,
    pub new_part_name:    String,
    pub parts_to_merge:   Vec<String>,
    /// ATTACH_PART 的来源 part
    pub source_part_name: String,
    /// DROP_RANGE 时移到 detached 而不是删除
    pub detach:           bool,
    pub create_time:      u64,

    // 以下字段只在内存里，由队列锁保护
    pub currently_executing: bool,
    pub num_tries:           u32,
    pub last_attempt_time:   u64,
    pub last_exception:      Option<String>,
    pub num_postponed:       u32,
    pub postpone_reason:     String,
    pub last_postpone_time:  u64,
}

impl LogEntry {
    fn with_type(entry_type: LogEntryType, new_part_name: &str) -> Self {
        Self {
            znode_name:          String::new(),
            entry_type,
            source_replica:      String::new(),
            new_part_name:       new_part_name.into(),
            parts_to_merge:      Vec::new(),
            source_part_name:    String::new(),
            detach:              false,
            create_time:         0,
            currently_executing: false,
            num_tries:           0,
            last_attempt_time:   0,
            last_exception:      None,
            num_postponed:       0,
            postpone_reason:     String::new(),
            last_postpone_time:  0,
        }
    }

    pub fn get_part(new_part_name: &str) -> Self {
        Self::with_type(LogEntryType::GetPart, new_part_name)
    }

    pub fn merge_parts(sources: &[&str], new_part_name: &str) -> Self {
        let mut e = Self::with_type(LogEntryType::MergeParts, new_part_name);
        e.parts_to_merge = sources.iter().map(|s| s.to_string()).collect();
        e
    }

    pub fn attach_part(source_part_name: &str, new_part_name: &str) -> Self {
        let mut e = Self::with_type(LogEntryType::AttachPart, new_part_name);
        e.source_part_name = source_part_name.into();
        e
    }

    pub fn drop_range(range_name: &str, detach: bool) -> Self {
        let mut e = Self::with_type(LogEntryType::DropRange, range_name);
        e.detach = detach;
        e
    }

    pub fn with_source_replica(mut self, replica: &str) -> Self {
        self.source_replica = replica.into();
        self
    }

    pub fn with_create_time(mut self, create_time: u64) -> Self {
        self.create_time = create_time;
        self
    }

    // ── 文本格式 ──────────────────────────────────────────────────────────────

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(FORMAT_HEADER);
        out.push('\n');
        out.push_str(&format!("create_time: {}\n", self.create_time));
        out.push_str(&format!("source replica: {}\n", self.source_replica));
        match self.entry_type {
            LogEntryType::GetPart => {
                out.push_str("get\n");
            }
            LogEntryType::MergeParts => {
                out.push_str("merge\n");
                for p in &self.parts_to_merge {
                    out.push_str(p);
                    out.push('\n');
                }
                out.push_str("into\n");
            }
            LogEntryType::AttachPart => {
                out.push_str("attach\n");
                out.push_str(&self.source_part_name);
                out.push_str("\ninto\n");
            }
            LogEntryType::DropRange => {
                out.push_str(if self.detach { "detach\n" } else { "drop\n" });
            }
        }
        out.push_str(&self.new_part_name);
        out.push('\n');
        out
    }

    /// 解析文本；`znode_name` 由调用方填
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let mut next = |what: &'static str| {
            lines.next().ok_or_else(|| bad(format!("unexpected end of entry, expected {what}")))
        };

        let header = next("format header")?;
        if header != FORMAT_HEADER {
            return Err(bad(format!("unknown format header '{header}'")));
        }
        let create_time = field(next("create_time")?, "create_time: ")?
            .parse::<u64>()
            .map_err(|e| bad(format!("bad create_time: {e}")))?;
        let source_replica = field(next("source replica")?, "source replica: ")?.to_string();

        let kind = next("entry type")?;
        let mut entry = match kind {
            "get" => LogEntry::get_part(next("part name")?),
            "merge" => {
                let mut sources = Vec::new();
                loop {
                    let s = next("source part or 'into'")?;
                    if s == "into" {
                        break;
                    }
                    sources.push(s);
                }
                LogEntry::merge_parts(&sources, next("part name")?)
            }
            "attach" => {
                let source = next("source part")?;
                if next("'into'")? != "into" {
                    return Err(bad("attach entry without 'into'"));
                }
                LogEntry::attach_part(source, next("part name")?)
            }
            "drop"   => LogEntry::drop_range(next("part name")?, false),
            "detach" => LogEntry::drop_range(next("part name")?, true),
            other    => return Err(bad(format!("unknown entry type '{other}'"))),
        };
        entry.create_time    = create_time;
        entry.source_replica = source_replica;
        Ok(entry)
    }
}

fn bad(detail: impl Into<String>) -> MergeTreeError {
    MergeTreeError::format("replication log entry", detail)
}

fn field<'a>(line: &'a str, prefix: &str) -> Result<&'a str> {
    line.strip_prefix(prefix)
        .ok_or_else(|| bad(format!("expected '{prefix}', got '{line}'")))
}
