//! 集成测试共用的构造与读取辅助函数

#![allow(dead_code)]

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use mergetree_storage::block::{Block, ColumnDesc, ColumnWithTypeAndName};
use mergetree_storage::config::MergeTreeSettings;
use mergetree_storage::context::EngineContext;
use mergetree_storage::field_type::{DataType, Value};
use mergetree_storage::part::{Checksums, DataPart, MarkRange, PartLayout};
use mergetree_storage::reader::PartReader;
use mergetree_storage::writer::PartWriter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 小 granule、小压缩块，方便覆盖边界
pub fn small_context(granularity: usize) -> EngineContext {
    EngineContext::new(
        MergeTreeSettings::builder()
            .index_granularity(granularity)
            .min_compress_block_size(32)
            .max_compress_block_size(64)
            .build(),
    )
}

pub fn array_of(t: DataType) -> DataType { DataType::Array(Box::new(t)) }

pub fn scalar_columns() -> Vec<ColumnDesc> {
    vec![
        ColumnDesc::new("k", DataType::Int64),
        ColumnDesc::new("s", DataType::String),
        ColumnDesc::new("d", DataType::Date),
        ColumnDesc::new("f", DataType::Float64),
    ]
}

pub fn all_columns() -> Vec<ColumnDesc> {
    let mut columns = scalar_columns();
    columns.push(ColumnDesc::new("arr", array_of(DataType::UInt32)));
    columns.push(ColumnDesc::new("n.a", array_of(DataType::UInt8)));
    columns.push(ColumnDesc::new("n.b", array_of(DataType::String)));
    columns
}

fn value_for(column: &str, i: usize) -> Value {
    match column {
        "k"   => Value::Int64(i as i64),
        "s"   => Value::from(format!("row-{i}").as_str()),
        "d"   => Value::Date((i % 1000) as u16),
        "f"   => Value::Float64(i as f64 * 0.5),
        "arr" => Value::Array((0..i % 4).map(|j| Value::UInt32((i * 10 + j) as u32)).collect()),
        "n.a" => Value::Array((0..i % 3).map(|j| Value::UInt8((i + j) as u8)).collect()),
        "n.b" => Value::Array((0..i % 3).map(|j| Value::from(format!("{i}.{j}").as_str())).collect()),
        other => panic!("no generator for column {other}"),
    }
}

/// 行 `rows` 的样例数据
pub fn sample_block(columns: &[ColumnDesc], rows: Range<usize>) -> Block {
    let columns = columns.iter()
        .map(|c| {
            let values = rows.clone().map(|i| value_for(&c.name, i)).collect();
            ColumnWithTypeAndName::new(&c.name, c.data_type.clone(), values)
        })
        .collect();
    Block::from_columns(columns).unwrap()
}

/// 把 `0..rows` 切成每块 `chunk` 行
pub fn sample_blocks(columns: &[ColumnDesc], rows: usize, chunk: usize) -> Vec<Block> {
    (0..rows).step_by(chunk.max(1))
        .map(|start| sample_block(columns, start..(start + chunk).min(rows)))
        .collect()
}

pub fn write_part(dir: &Path, columns: &[ColumnDesc], sort_key: &[&str], blocks: &[Block], ctx: &EngineContext) -> Checksums {
    let sort_key: Vec<String> = sort_key.iter().map(|s| s.to_string()).collect();
    let mut writer = PartWriter::open(dir, columns.to_vec(), &sort_key, ctx.settings.index_granularity, ctx).unwrap();
    for block in blocks {
        writer.write(block).unwrap();
    }
    writer.finalize().unwrap()
}

pub fn load_part(dir: &Path, sort_key: &[ColumnDesc], ctx: &EngineContext) -> Arc<DataPart> {
    Arc::new(DataPart::load(dir, sort_key, ctx.settings.index_granularity).unwrap())
}

/// 读取 part 的全部 mark 并补齐缺失列
pub fn read_whole_part(part: &Arc<DataPart>, columns: &[ColumnDesc], ctx: &EngineContext) -> Block {
    let granules = part.granules_count();
    let ranges = [MarkRange::new(0, granules)];
    let mut reader = PartReader::open(part.clone(), columns.to_vec(), &ranges, false, ctx).unwrap();
    let mut block = reader.read_range(0, granules).unwrap();
    reader.fill_missing_columns(&mut block).unwrap();
    block
}

pub fn int_values(block: &Block, column: &str) -> Vec<i64> {
    block.by_name(column).unwrap().values.iter().map(|v| v.as_i64().unwrap()).collect()
}
