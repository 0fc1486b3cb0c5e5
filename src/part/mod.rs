//! Part 布局模型
//!
//! 一个 part 目录：
//!
//! ```text
//! 202401_1_1_0/
//! ├── columns.txt          列名与类型
//! ├── checksums.txt        每个文件的大小与哈希
//! ├── primary.idx          每个 mark 处的排序键值（无压缩，无分帧）
//! ├── <col>.bin / .mrk     列的压缩数据与 mark
//! ├── <nested>.size0.*     数组列的每行长度
//! └── skp_idx_<name>.*     跳数索引
//! ```

pub mod active_set;
pub mod checksums;
pub mod columns;
pub mod data_part;
pub mod mark;
pub mod name;

pub use active_set::ActivePartSet;
pub use checksums::{Checksums, FileChecksum};
pub use columns::{column_streams, nested_table_name, ColumnStream, StreamKind};
pub use data_part::{DataPart, PartLayout, CHECKSUMS_FILE, COLUMNS_FILE, PRIMARY_INDEX_FILE};
pub use mark::{read_marks, Mark, MarkRange, MARK_SIZE};
pub use name::PartInfo;
