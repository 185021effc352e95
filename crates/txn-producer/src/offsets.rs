//! Expected-offset prediction.
//!
//! Transaction markers are written into the partition log like ordinary
//! records, so every begin/commit/abort consumes offset space the producer
//! never sees acknowledged. The worker predicts the offset of every record it
//! sends; an acknowledgement at any other offset is a bad offset.

use crate::client::TransactionOutcome;

/// Offsets consumed by control records around transaction boundaries.
///
/// Deltas apply to every partition of the topic.
pub trait ControlRecordPolicy: Send + Sync {
    /// Control records left in each partition by beginning a transaction.
    fn on_begin(&self) -> i64;

    /// Control records left in each partition by ending a transaction.
    fn on_end(&self, outcome: TransactionOutcome) -> i64;

    /// Total advance at a batch boundary: the end of one transaction plus
    /// the begin of the next.
    fn at_boundary(&self, outcome: TransactionOutcome) -> i64 {
        self.on_end(outcome) + self.on_begin()
    }
}

/// Known broker behaviours for control records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlRecordMode {
    /// Begin and commit each leave one control record; abort leaves none.
    #[default]
    AbortWithoutMarker,
    /// Begin, commit and abort each leave one control record.
    AbortWithMarker,
}

impl ControlRecordPolicy for ControlRecordMode {
    fn on_begin(&self) -> i64 {
        1
    }

    fn on_end(&self, outcome: TransactionOutcome) -> i64 {
        match (self, outcome) {
            (_, TransactionOutcome::Commit) => 1,
            (ControlRecordMode::AbortWithoutMarker, TransactionOutcome::Abort) => 0,
            (ControlRecordMode::AbortWithMarker, TransactionOutcome::Abort) => 1,
        }
    }
}

/// Next offset this epoch expects each partition to assign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedOffsets {
    next: Vec<i64>,
}

impl ExpectedOffsets {
    /// Start from the partitions' current high-water marks.
    pub fn new(high_water_marks: Vec<i64>) -> Self {
        Self {
            next: high_water_marks,
        }
    }

    /// Reserve the next offset on `partition` for a record about to be sent.
    /// Returns `None` for a partition the cursor was not created with.
    pub fn reserve(&mut self, partition: i32) -> Option<i64> {
        let slot = self.slot_mut(partition)?;
        let offset = *slot;
        *slot += 1;
        Some(offset)
    }

    /// Account for `delta` control records on every partition.
    pub fn skip_all(&mut self, delta: i64) {
        for next in &mut self.next {
            *next += delta;
        }
    }

    pub fn after_begin(&mut self, policy: &dyn ControlRecordPolicy) {
        self.skip_all(policy.on_begin());
    }

    pub fn after_boundary(&mut self, policy: &dyn ControlRecordPolicy, outcome: TransactionOutcome) {
        self.skip_all(policy.at_boundary(outcome));
    }

    pub fn get(&self, partition: i32) -> Option<i64> {
        let index = usize::try_from(partition).ok()?;
        self.next.get(index).copied()
    }

    fn slot_mut(&mut self, partition: i32) -> Option<&mut i64> {
        let index = usize::try_from(partition).ok()?;
        self.next.get_mut(index)
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_boundary_advances_by_two() {
        let mut offsets = ExpectedOffsets::new(vec![0, 10, 20]);
        offsets.after_boundary(&ControlRecordMode::default(), TransactionOutcome::Commit);
        assert_eq!(offsets.as_slice(), &[2, 12, 22]);
    }

    #[test]
    fn test_abort_boundary_without_marker_advances_by_one() {
        let mut offsets = ExpectedOffsets::new(vec![5, 5]);
        offsets.after_boundary(&ControlRecordMode::AbortWithoutMarker, TransactionOutcome::Abort);
        assert_eq!(offsets.as_slice(), &[6, 6]);
    }

    #[test]
    fn test_abort_boundary_with_marker_advances_by_two() {
        let mut offsets = ExpectedOffsets::new(vec![5, 5]);
        offsets.after_boundary(&ControlRecordMode::AbortWithMarker, TransactionOutcome::Abort);
        assert_eq!(offsets.as_slice(), &[7, 7]);
    }

    #[test]
    fn test_reserve_is_per_partition() {
        let mut offsets = ExpectedOffsets::new(vec![0, 100]);
        offsets.after_begin(&ControlRecordMode::default());

        assert_eq!(offsets.reserve(0), Some(1));
        assert_eq!(offsets.reserve(0), Some(2));
        assert_eq!(offsets.reserve(1), Some(101));
        assert_eq!(offsets.get(0), Some(3));
        assert_eq!(offsets.get(1), Some(102));
    }

    #[test]
    fn test_unknown_partition_has_no_offset() {
        let mut offsets = ExpectedOffsets::new(vec![0, 100]);

        assert_eq!(offsets.reserve(2), None);
        assert_eq!(offsets.reserve(-1), None);
        assert_eq!(offsets.get(2), None);
        assert_eq!(offsets.get(-1), None);
        assert_eq!(offsets.as_slice(), &[0, 100]);
    }

    struct FixedPolicy;

    impl ControlRecordPolicy for FixedPolicy {
        fn on_begin(&self) -> i64 {
            0
        }

        fn on_end(&self, _outcome: TransactionOutcome) -> i64 {
            3
        }
    }

    #[test]
    fn test_custom_policy_overrides_deltas() {
        let mut offsets = ExpectedOffsets::new(vec![0]);
        offsets.after_begin(&FixedPolicy);
        assert_eq!(offsets.get(0), Some(0));
        offsets.after_boundary(&FixedPolicy, TransactionOutcome::Abort);
        assert_eq!(offsets.get(0), Some(3));
    }
}
