//! 从一个 part 按 mark 区间流式读取 block
//!
//! 待读区间保存为栈（逆序，从尾部弹出即升序）。每次最多读取
//! `max_marks_per_read` 个 mark；剩余部分压回栈顶。

use std::sync::Arc;

use crate::block::{Block, ColumnDesc};
use crate::common::Result;
use crate::context::EngineContext;
use crate::part::{MarkRange, PartLayout};
use crate::reader::{BrokenPartSink, ColumnDefaults, PartReader, PrewhereFilter, PrewhereReader, ReaderStats};

#[derive(Default)]
pub struct SelectOptions {
    pub prewhere:               Option<Arc<dyn PrewhereFilter>>,
    pub defaults:               ColumnDefaults,
    pub broken_part_sink:       Option<Arc<dyn BrokenPartSink>>,
    pub use_uncompressed_cache: bool,
}

enum RangeReader {
    Plain(PartReader),
    Prewhere(PrewhereReader),
}

pub struct MergeTreeSelect {
    part:               Arc<dyn PartLayout>,
    reader:             RangeReader,
    remaining:          Vec<MarkRange>,
    max_marks_per_read: usize,
    finished:           bool,
}

impl MergeTreeSelect {
    pub fn new(
        part:    Arc<dyn PartLayout>,
        columns: Vec<ColumnDesc>,
        ranges:  Vec<MarkRange>,
        options: SelectOptions,
        ctx:     &EngineContext,
    ) -> Result<Self> {
        let SelectOptions { prewhere, defaults, broken_part_sink, use_uncompressed_cache } = options;
        let reader = match prewhere {
            Some(filter) => {
                let mut r = PrewhereReader::open(
                    Arc::clone(&part), columns, filter, &ranges, use_uncompressed_cache, ctx,
                )?.with_defaults(defaults);
                if let Some(sink) = broken_part_sink {
                    r = r.with_broken_part_sink(sink);
                }
                RangeReader::Prewhere(r)
            }
            None => {
                let mut r = PartReader::open(Arc::clone(&part), columns, &ranges, use_uncompressed_cache, ctx)?
                    .with_defaults(defaults);
                if let Some(sink) = broken_part_sink {
                    r = r.with_broken_part_sink(sink);
                }
                RangeReader::Plain(r)
            }
        };

        let mut remaining: Vec<MarkRange> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
        remaining.reverse();
        Ok(Self {
            part, reader, remaining,
            max_marks_per_read: ctx.settings.max_marks_per_read.max(1),
            finished:           false,
        })
    }

    pub fn part_name(&self) -> &str { self.part.name() }

    /// 尚未读取的 mark 数
    pub fn remaining_marks(&self) -> usize {
        self.remaining.iter().map(|r| r.len()).sum()
    }

    /// plain 读取时为该 reader 的统计；prewhere 时为 post 列的统计
    pub fn stats(&self) -> ReaderStats {
        match &self.reader {
            RangeReader::Plain(r)    => r.stats(),
            RangeReader::Prewhere(r) => r.post_stats(),
        }
    }

    fn read_next(&mut self) -> Result<Option<Block>> {
        while let Some(range) = self.remaining.pop() {
            let end = range.end.min(range.begin + self.max_marks_per_read);
            if end < range.end {
                self.remaining.push(MarkRange::new(end, range.end));
            }
            let block = match &mut self.reader {
                RangeReader::Plain(r) => {
                    let mut block = r.read_range(range.begin, end)?;
                    r.fill_missing_columns(&mut block)?;
                    block
                }
                RangeReader::Prewhere(r) => r.read_range(range.begin, end)?,
            };
            if block.rows() > 0 {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }
}

impl Iterator for MergeTreeSelect {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None)        => { self.finished = true; None }
            Err(e)          => { self.finished = true; Some(Err(e)) }
        }
    }
}
