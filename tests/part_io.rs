//! Part writer / reader / prewhere integration tests

mod common;

use std::fs;
use std::sync::Arc;

use mergetree_storage::block::{Block, ColumnDesc};
use mergetree_storage::common::MergeTreeError;
use mergetree_storage::context::EngineContext;
use mergetree_storage::field_type::{DataType, Value};
use mergetree_storage::part::{MarkRange, PartLayout, MARK_SIZE};
use mergetree_storage::reader::prewhere::ColumnPredicate;
use mergetree_storage::reader::{BrokenParts, FilterValue, PartReader, PrewhereFilter, PrewhereReader};

use common::*;

#[test]
fn round_trip_across_granule_and_block_boundaries() {
    init_tracing();
    let g = 4;
    let ctx = small_context(g);
    let columns = all_columns();

    for rows in [1, g - 1, g, g + 1, g * 25 + 3] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("all_1_1_0");
        let checksums = write_part(&path, &columns, &["k"], &sample_blocks(&columns, rows, 7), &ctx);
        assert!(!checksums.is_empty());

        let part = load_part(&path, &columns[..1], &ctx);
        assert_eq!(part.granules_count(), rows.div_ceil(g), "rows = {rows}");
        assert_eq!(part.index().len(), part.marks_count());

        let block = read_whole_part(&part, &columns, &ctx);
        assert_eq!(block, sample_block(&columns, 0..rows), "rows = {rows}");
        checksums.verify_files(&path).unwrap();
    }
}

#[test]
fn empty_part_is_discarded() {
    let ctx = small_context(4);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all_1_1_0");
    let checksums = write_part(&path, &scalar_columns(), &["k"], &[], &ctx);
    assert!(checksums.is_empty());
    assert!(!path.exists());
}

#[test]
fn marks_files_hold_one_entry_per_granule_boundary() {
    let g = 8;
    let ctx = small_context(g);
    let columns = scalar_columns();
    let rows = 8 * 13 + 5;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all_1_1_0");
    write_part(&path, &columns, &["k"], &sample_blocks(&columns, rows, 10), &ctx);

    let part = load_part(&path, &columns[..1], &ctx);
    let mut total = 0;
    for c in &columns {
        let size = fs::metadata(path.join(format!("{}.mrk", c.name))).unwrap().len();
        assert_eq!(size / MARK_SIZE, part.marks_count() as u64);
        total += size;
    }
    assert_eq!(total % (columns.len() as u64 * MARK_SIZE), 0);
    assert_eq!(part.marks_count(), 14 + 1);
}

#[test]
fn sequential_ranges_do_not_reseek() {
    let ctx = small_context(4);
    let columns = vec![ColumnDesc::new("k", DataType::Int64)];
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all_1_1_0");
    write_part(&path, &columns, &["k"], &sample_blocks(&columns, 40, 40), &ctx);
    let part = load_part(&path, &columns, &ctx);

    let ranges = [MarkRange::new(0, 10)];
    let mut reader = PartReader::open(part.clone(), columns.clone(), &ranges, false, &ctx).unwrap();
    let first  = reader.read_range(0, 3).unwrap();
    let second = reader.read_range(3, 7).unwrap();
    assert_eq!(int_values(&first, "k"), (0..12).collect::<Vec<_>>());
    assert_eq!(int_values(&second, "k"), (12..28).collect::<Vec<_>>());
    assert_eq!(reader.stats().seeks, 1);

    let again = reader.read_range(1, 2).unwrap();
    assert_eq!(int_values(&again, "k"), vec![4, 5, 6, 7]);
    assert_eq!(reader.stats().seeks, 2);
}

#[test]
fn missing_columns_are_filled_and_idempotent() {
    let ctx = small_context(4);
    let written = vec![ColumnDesc::new("k", DataType::Int64), ColumnDesc::new("n.a", array_of(DataType::UInt8))];
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all_1_1_0");
    write_part(&path, &written, &["k"], &sample_blocks(&written, 10, 10), &ctx);
    let part = load_part(&path, &written[..1], &ctx);

    // 表结构在 part 写入后新增了两列
    let requested = vec![
        ColumnDesc::new("n.b", array_of(DataType::String)),
        ColumnDesc::new("k", DataType::Int64),
        ColumnDesc::new("extra", DataType::Int32),
        ColumnDesc::new("n.a", array_of(DataType::UInt8)),
    ];
    let mut reader = PartReader::open(part.clone(), requested.clone(), &[MarkRange::new(0, 3)], false, &ctx).unwrap();
    assert_eq!(reader.missing_columns().len(), 2);

    let mut block = reader.read_range(0, 3).unwrap();
    reader.fill_missing_columns(&mut block).unwrap();
    let names: Vec<&str> = block.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["n.b", "k", "extra", "n.a"]);
    assert!(block.by_name("extra").unwrap().values.iter().all(|v| *v == Value::Int32(0)));

    let lens = |name: &str| -> Vec<usize> {
        block.by_name(name).unwrap().values.iter().map(|v| v.as_array().unwrap().len()).collect()
    };
    assert_eq!(lens("n.b"), lens("n.a"));

    let once = block.clone();
    reader.fill_missing_columns(&mut block).unwrap();
    assert_eq!(block, once);
}

#[test]
fn all_missing_columns_still_report_rows() {
    let ctx = small_context(4);
    let columns = scalar_columns();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all_1_1_0");
    write_part(&path, &columns, &["k"], &sample_blocks(&columns, 9, 9), &ctx);
    let part = load_part(&path, &columns[..1], &ctx);

    let requested = vec![ColumnDesc::new("added", DataType::UInt16)];
    let block = read_whole_part(&part, &requested, &ctx);
    assert_eq!(block.rows(), 9);
    assert_eq!(block.num_columns(), 1);
    assert_eq!(block.by_name("added").unwrap().values, vec![Value::UInt16(0); 9]);
}

fn prewhere_part(ctx: &EngineContext, rows: usize) -> (tempfile::TempDir, Arc<mergetree_storage::part::DataPart>) {
    let columns = scalar_columns();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all_1_1_0");
    write_part(&path, &columns, &["k"], &sample_blocks(&columns, rows, rows), ctx);
    let part = load_part(&path, &columns[..1], ctx);
    (dir, part)
}

#[test]
fn prewhere_skips_granules_without_matches() {
    let ctx = small_context(4);
    let (_dir, part) = prewhere_part(&ctx, 16);
    let filter: Arc<dyn PrewhereFilter> = Arc::new(ColumnPredicate::new(
        ColumnDesc::new("k", DataType::Int64),
        |v: &Value| v.as_i64().map(|k| k >= 8 && k != 13).unwrap_or(false),
    ));
    let requested = vec![ColumnDesc::new("s", DataType::String), ColumnDesc::new("k", DataType::Int64)];

    let mut reader = PrewhereReader::open(part.clone(), requested, filter, &[MarkRange::new(0, 4)], false, &ctx).unwrap();
    let block = reader.read_range(0, 4).unwrap();

    let expected: Vec<i64> = (8..16).filter(|&k| k != 13).collect();
    assert_eq!(int_values(&block, "k"), expected);
    assert_eq!(block.columns()[0].name, "s");
    assert_eq!(block.by_name("s").unwrap().values[0], Value::from("row-8"));

    // 前两个 granule 全部为 false，post 列只读了后两个
    assert_eq!(reader.granules_skipped(), 2);
    assert_eq!(reader.post_stats().granules_read, 2);
    assert_eq!(reader.post_stats().rows_read, 8);
}

#[test]
fn prewhere_all_true_matches_plain_read() {
    let ctx = small_context(4);
    let (_dir, part) = prewhere_part(&ctx, 18);
    let columns = scalar_columns();
    let filter: Arc<dyn PrewhereFilter> = Arc::new(ColumnPredicate::new(
        ColumnDesc::new("k", DataType::Int64),
        |_: &Value| true,
    ));
    let granules = part.granules_count();
    let mut reader = PrewhereReader::open(
        part.clone(), columns.clone(), filter, &[MarkRange::new(0, granules)], false, &ctx,
    ).unwrap();
    let filtered = reader.read_range(0, granules).unwrap();
    assert_eq!(filtered, read_whole_part(&part, &columns, &ctx));
    assert_eq!(reader.granules_skipped(), 0);
}

struct Never;

impl PrewhereFilter for Never {
    fn columns(&self) -> Vec<ColumnDesc> { vec![ColumnDesc::new("d", DataType::Date)] }
    fn evaluate(&self, _: &Block) -> mergetree_storage::common::Result<FilterValue> { Ok(FilterValue::Const(false)) }
}

#[test]
fn constant_false_filter_reads_no_other_columns() {
    let ctx = small_context(4);
    let (_dir, part) = prewhere_part(&ctx, 12);
    let requested = vec![ColumnDesc::new("k", DataType::Int64), ColumnDesc::new("d", DataType::Date)];
    let mut reader = PrewhereReader::open(
        part.clone(), requested, Arc::new(Never), &[MarkRange::new(0, 3)], false, &ctx,
    ).unwrap();
    let block = reader.read_range(0, 3).unwrap();
    assert_eq!(block.rows(), 0);
    assert_eq!(block.num_columns(), 2);
    assert_eq!(reader.post_stats().ranges_read, 0);
    assert_eq!(reader.granules_skipped(), 3);
}

#[test]
fn repeated_reads_hit_caches() {
    let ctx = EngineContext::new(
        mergetree_storage::config::MergeTreeSettings::builder()
            .index_granularity(4)
            .min_compress_block_size(32)
            .max_compress_block_size(64)
            .use_uncompressed_cache(true)
            .build(),
    );
    let columns = scalar_columns();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all_1_1_0");
    write_part(&path, &columns, &["k"], &sample_blocks(&columns, 50, 50), &ctx);
    let part = load_part(&path, &columns[..1], &ctx);
    let granules = part.granules_count();

    let read = || {
        let mut r = PartReader::open(part.clone(), columns.clone(), &[MarkRange::new(0, granules)], true, &ctx).unwrap();
        r.read_range(0, granules).unwrap()
    };
    let first = read();
    let after_first = ctx.metrics.snapshot();
    let second = read();
    let after_second = ctx.metrics.snapshot();

    assert_eq!(first, second);
    assert_eq!(after_second.compressed_blocks_read, after_first.compressed_blocks_read);
    assert_eq!(after_second.marks_files_loaded, after_first.marks_files_loaded);
    assert!(after_second.uncompressed_cache_hits > after_first.uncompressed_cache_hits);
    assert_eq!(after_second.mark_cache_hits - after_first.mark_cache_hits, columns.len() as u64);
}

#[test]
fn corrupt_column_marks_part_broken() {
    init_tracing();
    let ctx = small_context(4);
    let columns = scalar_columns();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all_1_1_0");
    write_part(&path, &columns, &["k"], &sample_blocks(&columns, 20, 20), &ctx);
    let part = load_part(&path, &columns[..1], &ctx);

    let bin = path.join("s.bin");
    let mut bytes = fs::read(&bin).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&bin, bytes).unwrap();

    let sink = Arc::new(BrokenParts::default());
    let granules = part.granules_count();
    let mut reader = PartReader::open(part.clone(), columns.clone(), &[MarkRange::new(0, granules)], false, &ctx)
        .unwrap()
        .with_broken_part_sink(sink.clone());
    match reader.read_range(0, granules) {
        Err(MergeTreeError::PartBroken { part: name, context, .. }) => {
            assert_eq!(name, "all_1_1_0");
            assert!(context.contains("column s"), "{context}");
            assert!(context.contains("[0, 5)"), "{context}");
        }
        other => panic!("expected a broken part error, got {other:?}"),
    }
    assert!(part.is_broken());
    assert!(sink.contains("all_1_1_0"));
    assert!(path.exists());
}
