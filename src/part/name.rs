//! Part 名字：`<partition_id>_<min_block>_<max_block>_<level>`

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::common::{BlockNumber, MergeLevel, MergeTreeError, Result};

/// 删除整个区间时用作 drop range 的层级，保证覆盖区间内所有 part
pub const MAX_LEVEL: MergeLevel = 999_999_999;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartInfo {
    pub partition_id: String,
    pub min_block:    BlockNumber,
    pub max_block:    BlockNumber,
    pub level:        MergeLevel,
}

impl PartInfo {
    pub fn new(partition_id: &str, min_block: BlockNumber, max_block: BlockNumber, level: MergeLevel) -> Self {
        Self { partition_id: partition_id.into(), min_block, max_block, level }
    }

    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || MergeTreeError::InvalidPartName(name.to_string());
        let mut fields = name.rsplitn(4, '_');
        let level        = fields.next().ok_or_else(invalid)?;
        let max_block    = fields.next().ok_or_else(invalid)?;
        let min_block    = fields.next().ok_or_else(invalid)?;
        let partition_id = fields.next().ok_or_else(invalid)?;
        if partition_id.is_empty() {
            return Err(invalid());
        }
        let info = Self {
            partition_id: partition_id.to_string(),
            min_block:    min_block.parse().map_err(|_| invalid())?,
            max_block:    max_block.parse().map_err(|_| invalid())?,
            level:        level.parse().map_err(|_| invalid())?,
        };
        if info.min_block > info.max_block {
            return Err(invalid());
        }
        Ok(info)
    }

    pub fn name(&self) -> String { self.to_string() }

    /// 本 part 是否覆盖 `other`（含相等）
    pub fn contains(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.min_block
            && self.max_block >= other.max_block
            && self.level >= other.level
    }

    /// 块号区间是否相交
    pub fn intersects(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.max_block
            && other.min_block <= self.max_block
    }

    /// 覆盖整个分区的 drop range
    pub fn drop_range(partition_id: &str, max_block: BlockNumber) -> Self {
        Self::new(partition_id, 0, max_block, MAX_LEVEL)
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}_{}", self.partition_id, self.min_block, self.max_block, self.level)
    }
}

impl FromStr for PartInfo {
    type Err = MergeTreeError;
    fn from_str(s: &str) -> Result<Self> { Self::parse(s) }
}

/// 同一分区内按 (min_block, max_block, level) 排序
impl Ord for PartInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.partition_id.cmp(&other.partition_id)
            .then(self.min_block.cmp(&other.min_block))
            .then(self.max_block.cmp(&other.max_block))
            .then(self.level.cmp(&other.level))
    }
}

impl PartialOrd for PartInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

/// 合并后新 part 的名字：区间取并集，层级取最大值 + 1
pub fn merged_part_name(sources: &[PartInfo]) -> Result<PartInfo> {
    let first = sources.first()
        .ok_or_else(|| MergeTreeError::Logical("merge without source parts".into()))?;
    if sources.iter().any(|p| p.partition_id != first.partition_id) {
        return Err(MergeTreeError::Logical("merging parts of different partitions".into()));
    }
    Ok(PartInfo {
        partition_id: first.partition_id.clone(),
        min_block:    sources.iter().map(|p| p.min_block).min().unwrap_or(first.min_block),
        max_block:    sources.iter().map(|p| p.max_block).max().unwrap_or(first.max_block),
        level:        sources.iter().map(|p| p.level).max().unwrap_or(0) + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_print() {
        let p = PartInfo::parse("202401_3_7_2").unwrap();
        assert_eq!(p, PartInfo::new("202401", 3, 7, 2));
        assert_eq!(p.to_string(), "202401_3_7_2");

        let underscored = PartInfo::parse("eu_west_1_1_0").unwrap();
        assert_eq!(underscored.partition_id, "eu_west");
    }

    #[test]
    fn invalid_names_are_rejected() {
        for bad in ["", "1_2_3", "p_a_2_0", "p_5_2_0", "_1_2_0"] {
            assert!(PartInfo::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn contains_requires_range_and_level() {
        let big   = PartInfo::parse("p_1_10_3").unwrap();
        let small = PartInfo::parse("p_2_5_1").unwrap();
        assert!(big.contains(&small));
        assert!(!small.contains(&big));
        assert!(big.contains(&big));
        assert!(!PartInfo::parse("p_1_10_0").unwrap().contains(&small));
        assert!(!PartInfo::parse("q_1_10_3").unwrap().contains(&small));
    }

    #[test]
    fn merged_name_spans_sources() {
        let merged = merged_part_name(&[
            PartInfo::parse("p_1_1_0").unwrap(),
            PartInfo::parse("p_2_4_1").unwrap(),
        ]).unwrap();
        assert_eq!(merged.to_string(), "p_1_4_2");
    }
}
