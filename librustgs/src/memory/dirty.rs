/*
    Coalesced set of local memory ranges written since the last reconciliation
*/

use super::ByteRange;

#[derive(Debug, Default, Clone)]
pub struct DirtyRangeSet {
    ranges: Vec<ByteRange>,
}

impl DirtyRangeSet {
    pub fn new() -> Self {
        DirtyRangeSet::default()
    }

    /// Record `[start, end)`, merging every interval it touches or abuts.
    pub fn insert(&mut self, start: u32, end: u32) {
        if end <= start {
            return;
        }

        let lo = self.ranges.partition_point(|r| r.end < start);
        let hi = self.ranges.partition_point(|r| r.start <= end);

        if lo == hi {
            self.ranges.insert(lo, ByteRange::new(start, end));
        } else {
            let merged = ByteRange::new(
                start.min(self.ranges[lo].start),
                end.max(self.ranges[hi - 1].end),
            );
            self.ranges.splice(lo..hi, std::iter::once(merged));
        }

        debug_assert!(self.is_coalesced(), "dirty ranges out of order: {:?}", self.ranges);
    }

    pub fn insert_range(&mut self, range: ByteRange) {
        self.insert(range.start, range.end);
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Drain every interval in ascending order.
    pub fn take(&mut self) -> Vec<ByteRange> {
        std::mem::take(&mut self.ranges)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn intersects(&self, range: ByteRange) -> bool {
        let first = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges.get(first).is_some_and(|r| r.intersects(range))
    }

    pub fn as_slice(&self) -> &[ByteRange] {
        &self.ranges
    }

    fn is_coalesced(&self) -> bool {
        self.ranges.windows(2).all(|pair| pair[0].end < pair[1].start)
            && self.ranges.iter().all(|r| r.start < r.end)
    }
}
