//! # mergetree-storage
//!
//! MergeTree 存储核心：不可变的有序 part、按 mark 寻址的列读写，以及副本
//! 复制队列。
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     MergeTreeStorage                          │
//! │   active parts (Arc<DataPart>)   virtual parts   broken parts │
//! │        │                              ▲                       │
//! │   write_part ─▶ PartWriter ───────────┘ 仅 finalize 成功后注册 │
//! │        │          ├─ granule 切分 (index_granularity)          │
//! │        │          ├─ <col>.bin / <col>.mrk  (CompressedWriter) │
//! │        │          ├─ primary.idx / skp_idx_*                   │
//! │        │          └─ checksums.txt / columns.txt               │
//! │   read ──▶ MergeTreeSelect (MarkRange 栈)                      │
//! │               ├─ PrewhereReader  (pre 列 → granule 掩码)       │
//! │               └─ PartReader      (mark 定位、缺失列补默认值)   │
//! │                    └─ MarkCache / UncompressedCache            │
//! └──────────────────────────────────────────────────────────────┘
//!
//! CoordinationLog ──pull──▶ ReplicatedMergeQueue ──select──▶ ExecutionGuard
//!   (log-*, queue-*)        queue / future_parts / virtual_parts
//! ```

// ── 基础 ──────────────────────────────────────────────────────────────────────
pub mod common;
pub mod config;
pub mod context;
pub mod cache;
pub mod field_type;
pub mod block;

// ── part 文件层 ───────────────────────────────────────────────────────────────
pub mod compression;
pub mod io;
pub mod part;
pub mod index;
pub mod writer;
pub mod reader;

// ── 编排与复制 ────────────────────────────────────────────────────────────────
pub mod select;
pub mod storage;
pub mod replication;

pub use block::{Block, ColumnDesc, ColumnWithTypeAndName};
pub use common::{MergeTreeError, Result};
pub use config::MergeTreeSettings;
pub use context::EngineContext;
pub use field_type::{DataType, Value};
pub use part::{DataPart, MarkRange, PartInfo, PartLayout};
pub use reader::{PartReader, PrewhereReader};
pub use storage::{MergeTreeStorage, TableDefinition};
pub use writer::PartWriter;
