//! Contiguous offset ranges for a single partition.

use serde::{Deserialize, Serialize};

/// Half-open range of offsets `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRange {
    pub lower: i64,
    pub upper: i64,
}

impl OffsetRange {
    pub fn contains(&self, offset: i64) -> bool {
        offset >= self.lower && offset < self.upper
    }

    pub fn len(&self) -> u64 {
        (self.upper - self.lower) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.upper <= self.lower
    }
}

/// Sorted set of offsets stored as ranges.
///
/// Ranges never overlap and never touch: inserting an offset adjacent to an
/// existing range extends it, and inserting the offset that closes a gap
/// between two ranges merges them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRanges {
    ranges: Vec<OffsetRange>,
}

impl OffsetRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a single offset. Inserting an offset that is already covered
    /// is a no-op.
    pub fn insert(&mut self, offset: i64) {
        // Index of the first range whose lower bound is above `offset`.
        let idx = self.ranges.partition_point(|r| r.lower <= offset);

        if idx > 0 && self.ranges[idx - 1].contains(offset) {
            return;
        }

        let joins_prev = idx > 0 && self.ranges[idx - 1].upper == offset;
        let joins_next = idx < self.ranges.len() && self.ranges[idx].lower == offset + 1;

        match (joins_prev, joins_next) {
            (true, true) => {
                self.ranges[idx - 1].upper = self.ranges[idx].upper;
                self.ranges.remove(idx);
            }
            (true, false) => self.ranges[idx - 1].upper = offset + 1,
            (false, true) => self.ranges[idx].lower = offset,
            (false, false) => self.ranges.insert(
                idx,
                OffsetRange {
                    lower: offset,
                    upper: offset + 1,
                },
            ),
        }
    }

    pub fn contains(&self, offset: i64) -> bool {
        let idx = self.ranges.partition_point(|r| r.lower <= offset);
        idx > 0 && self.ranges[idx - 1].contains(offset)
    }

    /// Number of offsets covered by all ranges.
    pub fn len(&self) -> u64 {
        self.ranges.iter().map(OffsetRange::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[OffsetRange] {
        &self.ranges
    }
}
