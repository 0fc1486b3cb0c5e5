//! # mergetree-storage 使用案例
//!
//! 1. 打开表目录，写入若干 part
//! 2. 按主键 / 跳数索引挑选 mark 区间
//! 3. PREWHERE 读取
//! 4. 复制队列：拉取日志、调度、合并
//!
//! 运行：`RUST_LOG=mergetree_storage=debug cargo run --example basic_usage`

use std::sync::Arc;

use mergetree_storage::{
    block::{Block, ColumnDesc, ColumnWithTypeAndName},
    common::Result,
    config::MergeTreeSettings,
    context::EngineContext,
    field_type::{DataType, Value},
    index::{SkipIndexDesc, SkipIndexKind},
    part::{PartInfo, PartLayout},
    reader::{prewhere::ColumnPredicate, PrewhereFilter},
    replication::{InMemoryCoordinationLog, LogEntry, LogEntryType, ReplicatedMergeQueue},
    storage::{MergeTreeStorage, TableDefinition},
};

fn hits_block(rows: std::ops::Range<i64>) -> Result<Block> {
    let ids:    Vec<Value> = rows.clone().map(Value::Int64).collect();
    let dates:  Vec<Value> = rows.clone().map(|i| Value::Date(19_000 + (i / 100) as u16)).collect();
    let urls:   Vec<Value> = rows.clone().map(|i| Value::from(format!("/page/{}", i % 17).as_str())).collect();
    let tags:   Vec<Value> = rows.map(|i| Value::Array((0..i % 3).map(|t| Value::UInt32(t as u32)).collect())).collect();
    Block::from_columns(vec![
        ColumnWithTypeAndName::new("id",   DataType::Int64, ids),
        ColumnWithTypeAndName::new("date", DataType::Date, dates),
        ColumnWithTypeAndName::new("url",  DataType::String, urls),
        ColumnWithTypeAndName::new("tags", DataType::Array(Box::new(DataType::UInt32)), tags),
    ])
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("═══════════════════════════════════════════════════════════");
    println!("   mergetree-storage 演示");
    println!("═══════════════════════════════════════════════════════════\n");

    // =========================================================================
    // 1. 打开表并写入
    // =========================================================================
    let dir = std::env::temp_dir().join("mergetree-demo");
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    let ctx = EngineContext::new(
        MergeTreeSettings::builder()
            .index_granularity(128)
            .use_uncompressed_cache(true)
            .build(),
    );
    let definition = TableDefinition::new(
        vec![
            ColumnDesc::new("id",   DataType::Int64),
            ColumnDesc::new("date", DataType::Date),
            ColumnDesc::new("url",  DataType::String),
            ColumnDesc::new("tags", DataType::Array(Box::new(DataType::UInt32))),
        ],
        &["id"],
    )
    .with_skip_index(SkipIndexDesc::new("url_bloom", "url", DataType::String,
                                        SkipIndexKind::BloomFilter { bits: 1024, hashes: 3 }, 1)?);

    println!("【1】打开 {} 并写入两个 part ...", dir.display());
    let storage = MergeTreeStorage::open(&dir, definition, ctx.clone())?;
    for chunk in [0..1_000, 1_000..2_500] {
        if let Some(part) = storage.write_part(vec![hits_block(chunk)?], "all")? {
            println!("    ✓ {} rows={:?} marks={}", part.name(), part.rows_count(), part.index().len());
        }
    }

    // =========================================================================
    // 2. 挑选区间
    // =========================================================================
    println!("\n【2】挑选 mark 区间 ...");
    let ranges = storage.select_ranges_by_primary_key("all_2_2_0", &Value::Int64(1_300), &Value::Int64(1_400))?;
    println!("    id ∈ [1300, 1400] → {ranges:?}");
    let by_bloom = storage.select_ranges_by_skip_index("all_1_1_0", "url_bloom", &Value::from("/page/3"))?;
    println!("    url = '/page/3' → {} 个区间", by_bloom.len());

    // =========================================================================
    // 3. PREWHERE
    // =========================================================================
    println!("\n【3】PREWHERE id % 500 = 0 ...");
    let filter: Arc<dyn PrewhereFilter> = Arc::new(ColumnPredicate::new(
        ColumnDesc::new("id", DataType::Int64),
        |v: &Value| v.as_i64().map(|id| id % 500 == 0).unwrap_or(false),
    ));
    for block in storage.read_all(&["id", "url"], Some(filter))? {
        for row in 0..block.rows() {
            let id  = &block.columns()[0].values[row];
            let url = &block.columns()[1].values[row];
            println!("    {id:?} {url:?}");
        }
    }

    // =========================================================================
    // 4. 复制队列
    // =========================================================================
    println!("\n【4】复制队列 ...");
    let log = Arc::new(InMemoryCoordinationLog::new());
    let queue = ReplicatedMergeQueue::new("replica-1", log.clone(), &ctx);
    queue.initialize(&storage.part_names())?;
    log.push_log(&LogEntry::merge_parts(&["all_1_1_0", "all_2_2_0"], "all_1_2_1").to_text());
    println!("    pulled {} entries", queue.pull_logs_to_queue()?);

    while let Some(guard) = queue.select_entry_to_process()? {
        let done = queue.process_entry(guard, |entry| match entry.entry_type {
            LogEntryType::MergeParts => {
                storage.merge_parts(&entry.parts_to_merge, &entry.new_part_name)?;
                Ok(true)
            }
            LogEntryType::DropRange => {
                storage.drop_range(&PartInfo::parse(&entry.new_part_name)?);
                Ok(true)
            }
            _ => Ok(false),
        })?;
        println!("    entry done = {done}");
        if !done {
            break;
        }
    }
    println!("    parts = {:?}", storage.part_names());
    println!("    status = {:?}", queue.status());

    let metrics = ctx.metrics.snapshot();
    println!("\n    compressed blocks read = {}, uncompressed cache hits = {}",
             metrics.compressed_blocks_read, metrics.uncompressed_cache_hits);
    Ok(())
}
