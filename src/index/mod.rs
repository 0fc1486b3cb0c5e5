//! 跳数索引（skip index）
//!
//! 每个索引覆盖一列，以 `granularity` 个数据 granule 为一个索引 granule：
//! - **MinMax**     : 索引 granule 内的最小/最大值，等值或范围条件不相交时跳过
//! - **BloomFilter**: 双哈希位数组（xxh3），等值条件快速排除
//!
//! 文件：`skp_idx_<name>.idx`（压缩流）+ `skp_idx_<name>.mrk`，第 i 个 mark
//! 指向第 i 个索引 granule。

use std::io::{BufRead, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::common::{MergeTreeError, Result};
use crate::context::EngineContext;
use crate::field_type::{DataType, Value};
use crate::io::CompressedReader;
use crate::part::{mark::merge_adjacent, read_marks, Checksums, Mark, MarkRange, PartLayout};
use crate::writer::StreamWriter;

// ── 索引定义 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipIndexKind {
    MinMax,
    BloomFilter { bits: usize, hashes: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipIndexDesc {
    pub name:        String,
    pub column:      String,
    pub data_type:   DataType,
    pub kind:        SkipIndexKind,
    /// 每个索引 granule 覆盖的数据 granule 数
    pub granularity: usize,
}

impl SkipIndexDesc {
    pub fn new(name: &str, column: &str, data_type: DataType, kind: SkipIndexKind, granularity: usize) -> Result<Self> {
        if kind == SkipIndexKind::MinMax && data_type.is_array() {
            return Err(MergeTreeError::SchemaMismatch(format!("minmax index {name} over array column {column}")));
        }
        if let SkipIndexKind::BloomFilter { bits, hashes } = kind {
            if bits == 0 || hashes == 0 {
                return Err(MergeTreeError::SchemaMismatch(format!("bloom filter index {name} has no bits")));
            }
        }
        Ok(Self { name: name.into(), column: column.into(), data_type, kind, granularity: granularity.max(1) })
    }

    pub fn data_file(&self) -> String { format!("skp_idx_{}.idx", self.name) }
    pub fn mrk_file(&self) -> String { format!("skp_idx_{}.mrk", self.name) }
}

// ── Bloom Filter ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits:     Vec<u8>,
    num_bits: usize,
    hashes:   u32,
}

impl BloomFilter {
    pub fn new(num_bits: usize, hashes: u32) -> Self {
        let num_bits = num_bits.max(8);
        Self { bits: vec![0u8; num_bits.div_ceil(8)], num_bits, hashes }
    }

    fn probe_bits(&self, key: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let h1 = xxh3_64_with_seed(key, 0);
        let h2 = xxh3_64_with_seed(key, 0x9e37_79b9_7f4a_7c15) | 1;
        (0..self.hashes as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits as u64) as usize)
    }

    pub fn add(&mut self, key: &[u8]) {
        let bits: Vec<usize> = self.probe_bits(key).collect();
        for bit in bits {
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.probe_bits(key).all(|bit| self.bits[bit / 8] & (1 << (bit % 8)) != 0)
    }

    pub fn is_empty(&self) -> bool { self.bits.iter().all(|&b| b == 0) }
}

// ── 索引 granule ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SkipIndexGranule {
    MinMax(Option<(Value, Value)>),
    Bloom(BloomFilter),
}

impl SkipIndexGranule {
    pub fn empty(desc: &SkipIndexDesc) -> Self {
        match desc.kind {
            SkipIndexKind::MinMax                      => Self::MinMax(None),
            SkipIndexKind::BloomFilter { bits, hashes } => Self::Bloom(BloomFilter::new(bits, hashes)),
        }
    }

    pub fn update(&mut self, values: &[Value]) {
        match self {
            Self::MinMax(range) => {
                for v in values {
                    match range {
                        None => *range = Some((v.clone(), v.clone())),
                        Some((min, max)) => {
                            if v < min { *min = v.clone(); }
                            if v > max { *max = v.clone(); }
                        }
                    }
                }
            }
            Self::Bloom(filter) => {
                for v in values {
                    add_to_bloom(filter, v);
                }
            }
        }
    }

    /// 索引 granule 是否可能含有 `value`
    pub fn may_match(&self, value: &Value) -> bool {
        match self {
            Self::MinMax(None)             => false,
            Self::MinMax(Some((min, max))) => {
                // 不可比较的值（类型不同）不能排除
                match (value.partial_cmp(min), value.partial_cmp(max)) {
                    (Some(lo), Some(hi)) => lo.is_ge() && hi.is_le(),
                    _ => true,
                }
            }
            Self::Bloom(filter) => filter.may_contain(&value.hash_key()),
        }
    }

    fn serialize<W: Write>(&self, desc: &SkipIndexDesc, out: &mut W) -> Result<()> {
        match self {
            Self::MinMax(None) => out.write_u8(0)?,
            Self::MinMax(Some((min, max))) => {
                out.write_u8(1)?;
                desc.data_type.serialize_binary(min, out)?;
                desc.data_type.serialize_binary(max, out)?;
            }
            Self::Bloom(filter) => {
                out.write_u32::<LittleEndian>(filter.bits.len() as u32)?;
                out.write_all(&filter.bits)?;
            }
        }
        Ok(())
    }

    fn deserialize<R: BufRead>(desc: &SkipIndexDesc, r: &mut R) -> Result<Self> {
        match desc.kind {
            SkipIndexKind::MinMax => match r.read_u8()? {
                0 => Ok(Self::MinMax(None)),
                _ => {
                    let min = desc.data_type.deserialize_binary(r)?;
                    let max = desc.data_type.deserialize_binary(r)?;
                    Ok(Self::MinMax(Some((min, max))))
                }
            },
            SkipIndexKind::BloomFilter { bits, hashes } => {
                let mut filter = BloomFilter::new(bits, hashes);
                let len = r.read_u32::<LittleEndian>()? as usize;
                if len != filter.bits.len() {
                    return Err(MergeTreeError::format(
                        desc.data_file(),
                        format!("bloom filter has {len} bytes, expected {}", filter.bits.len()),
                    ));
                }
                r.read_exact(&mut filter.bits)?;
                Ok(Self::Bloom(filter))
            }
        }
    }
}

fn add_to_bloom(filter: &mut BloomFilter, value: &Value) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| add_to_bloom(filter, v)),
        scalar              => filter.add(&scalar.hash_key()),
    }
}

// ── 写入 ──────────────────────────────────────────────────────────────────────

/// 跟随数据 granule 累积，每满 `granularity` 个 granule 落一个索引 granule
pub(crate) struct SkipIndexWriter {
    desc:       SkipIndexDesc,
    stream:     StreamWriter,
    aggregator: SkipIndexGranule,
    /// 当前聚合器已完整覆盖的数据 granule 数
    granules:   usize,
    has_rows:   bool,
}

impl SkipIndexWriter {
    pub fn new(desc: SkipIndexDesc, stream: StreamWriter) -> Self {
        let aggregator = SkipIndexGranule::empty(&desc);
        Self { desc, stream, aggregator, granules: 0, has_rows: false }
    }

    pub fn desc(&self) -> &SkipIndexDesc { &self.desc }

    /// 喂入一个数据 granule 的（部分）行；`completes_granule` 表示该 granule 至此写满
    pub fn update(&mut self, values: &[Value], completes_granule: bool, min_compress_block_size: usize) -> Result<()> {
        self.aggregator.update(values);
        self.has_rows |= !values.is_empty();
        if completes_granule {
            self.granules += 1;
            if self.granules == self.desc.granularity {
                self.flush(min_compress_block_size)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self, min_compress_block_size: usize) -> Result<()> {
        self.stream.write_mark(min_compress_block_size)?;
        let granule = std::mem::replace(&mut self.aggregator, SkipIndexGranule::empty(&self.desc));
        granule.serialize(&self.desc, self.stream.data())?;
        self.granules = 0;
        self.has_rows = false;
        Ok(())
    }

    pub fn finish(mut self, min_compress_block_size: usize, checksums: &mut Checksums) -> Result<()> {
        if self.has_rows {
            self.flush(min_compress_block_size)?;
        }
        self.stream.finish(checksums)
    }
}

// ── 读取 ──────────────────────────────────────────────────────────────────────

pub struct SkipIndexReader {
    desc:   SkipIndexDesc,
    marks:  Vec<Mark>,
    stream: CompressedReader,
}

impl SkipIndexReader {
    /// part 中没有该索引文件时返回 None
    pub fn open(part: &dyn PartLayout, desc: &SkipIndexDesc, ctx: &EngineContext) -> Result<Option<Self>> {
        let data_path = part.stream_path(&desc.data_file());
        let mrk_path  = part.stream_path(&desc.mrk_file());
        if !data_path.is_file() || !mrk_path.is_file() {
            return Ok(None);
        }
        let marks  = read_marks(&mrk_path, None)?;
        let stream = CompressedReader::open(
            &data_path,
            ctx.settings.default_buffer_size,
            None,
            Arc::clone(&ctx.metrics),
        )?;
        Ok(Some(Self { desc: desc.clone(), marks, stream }))
    }

    pub fn granules_count(&self) -> usize { self.marks.len() }

    pub fn read_granule(&mut self, index_granule: usize) -> Result<SkipIndexGranule> {
        let mark = self.marks.get(index_granule).copied().ok_or_else(|| {
            MergeTreeError::Logical(format!("skip index {} has no granule {index_granule}", self.desc.name))
        })?;
        self.stream.seek(mark.offset_in_compressed_file, mark.offset_in_decompressed_block)?;
        SkipIndexGranule::deserialize(&self.desc, &mut self.stream)
    }

    /// 去掉索引判定不可能含有 `value` 的 granule
    pub fn filter_ranges(&mut self, ranges: &[MarkRange], value: &Value) -> Result<Vec<MarkRange>> {
        let k = self.desc.granularity;
        let mut kept = Vec::new();
        for range in ranges {
            let mut begin = range.begin;
            while begin < range.end {
                let index_granule = begin / k;
                let end = ((index_granule + 1) * k).min(range.end);
                let may_match = index_granule >= self.granules_count()
                    || self.read_granule(index_granule)?.may_match(value);
                if may_match {
                    kept.push(MarkRange::new(begin, end));
                }
                begin = end;
            }
        }
        Ok(merge_adjacent(&kept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(kind: SkipIndexKind) -> SkipIndexDesc {
        SkipIndexDesc::new("idx", "c", DataType::Int64, kind, 2).unwrap()
    }

    #[test]
    fn minmax_granule_bounds() {
        let mut g = SkipIndexGranule::empty(&desc(SkipIndexKind::MinMax));
        assert!(!g.may_match(&Value::Int64(0)));
        g.update(&[Value::Int64(5), Value::Int64(-3), Value::Int64(9)]);
        assert!(g.may_match(&Value::Int64(-3)));
        assert!(g.may_match(&Value::Int64(7)));
        assert!(!g.may_match(&Value::Int64(10)));
    }

    #[test]
    fn bloom_filter_has_no_false_negatives() {
        let mut bf = BloomFilter::new(2048, 3);
        for i in 0..100u32 {
            bf.add(&i.to_le_bytes());
        }
        assert!((0..100u32).all(|i| bf.may_contain(&i.to_le_bytes())));
        let false_positives = (1000..2000u32).filter(|i| bf.may_contain(&i.to_le_bytes())).count();
        assert!(false_positives < 100, "{false_positives}");
    }

    #[test]
    fn granule_serialization_round_trip() {
        let d = desc(SkipIndexKind::BloomFilter { bits: 256, hashes: 2 });
        let mut g = SkipIndexGranule::empty(&d);
        g.update(&[Value::Int64(42)]);
        let mut buf = Vec::new();
        g.serialize(&d, &mut buf).unwrap();
        let back = SkipIndexGranule::deserialize(&d, &mut buf.as_slice()).unwrap();
        assert_eq!(back, g);
        assert!(back.may_match(&Value::Int64(42)));
    }

    #[test]
    fn bloom_over_arrays_indexes_elements() {
        let ty = DataType::Array(Box::new(DataType::String));
        let d = SkipIndexDesc::new("tags", "c", ty, SkipIndexKind::BloomFilter { bits: 512, hashes: 3 }, 1).unwrap();
        let mut g = SkipIndexGranule::empty(&d);
        g.update(&[Value::Array(vec![Value::from("red"), Value::from("blue")]), Value::Array(vec![])]);
        assert!(g.may_match(&Value::from("red")));
        assert!(g.may_match(&Value::from("blue")));
    }

    #[test]
    fn minmax_over_arrays_is_rejected() {
        let ty = DataType::Array(Box::new(DataType::Int64));
        assert!(SkipIndexDesc::new("i", "c", ty, SkipIndexKind::MinMax, 1).is_err());
    }
}
