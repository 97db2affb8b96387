//! Offset-Commit Coordinator - Tracks acknowledged offsets per partition
//!
//! Acknowledgments may complete in any order (merge dispatch, several
//! partitions in one batch), while Kafka only understands "everything before
//! this offset is done". The coordinator keeps, per partition, the offsets
//! still waiting for an acknowledgment and the sparse set of offsets acked
//! ahead of them, and only ever reports a committable offset when every
//! offset before it has been acknowledged.

use std::collections::{BTreeSet, HashMap};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::metrics_consts::PENDING_ACKS;
use crate::types::Partition;

/// State tracked per partition
#[derive(Debug, Default)]
struct PartitionOffsetState {
    /// The next offset to consume as last committed to the broker
    last_committed: i64,
    /// Highest acknowledged offset, never decreases
    highest_acked: Option<i64>,
    /// Offsets acked while an earlier offset is still outstanding
    pending_acks: BTreeSet<i64>,
    /// Offsets received from the broker and not yet acknowledged
    outstanding: BTreeSet<i64>,
}

impl PartitionOffsetState {
    fn starting_at(offset: i64) -> Self {
        Self {
            last_committed: offset,
            ..Default::default()
        }
    }

    /// The next offset to consume such that every offset before it is acked.
    fn watermark(&self) -> i64 {
        let candidate = match (self.outstanding.first(), self.highest_acked) {
            (Some(lowest), _) => *lowest,
            (None, Some(highest)) => highest + 1,
            (None, None) => self.last_committed,
        };
        candidate.max(self.last_committed)
    }

    fn committable(&self) -> Option<i64> {
        let watermark = self.watermark();
        (watermark > self.last_committed).then_some(watermark)
    }
}

/// Thread-safe tracker of acknowledged offsets for one channel.
#[derive(Default)]
pub struct OffsetCommitCoordinator {
    partitions: DashMap<Partition, PartitionOffsetState>,
}

impl OffsetCommitCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an offset delivered by the broker. It blocks commits past it
    /// until it is acknowledged.
    pub fn received(&self, partition: &Partition, offset: i64) {
        let mut state = self
            .partitions
            .entry(partition.clone())
            .or_insert_with(|| {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset,
                    "Initializing partition offset state"
                );
                PartitionOffsetState::starting_at(offset)
            });
        if offset < state.last_committed {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset,
                last_committed = state.last_committed,
                "Ignoring redelivered offset behind the committed position"
            );
            return;
        }
        state.outstanding.insert(offset);
    }

    /// Records an acknowledgment. Returns the new committable offset when this
    /// acknowledgment advanced the partition watermark.
    pub fn acknowledge(&self, partition: &Partition, offset: i64) -> Option<i64> {
        let Some(mut state) = self.partitions.get_mut(partition) else {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset,
                "Acknowledgment for an untracked partition"
            );
            return None;
        };
        let before = state.watermark();
        if !state.outstanding.remove(&offset) {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset,
                "Acknowledgment for an offset that is not outstanding"
            );
            return None;
        }

        state.highest_acked = Some(state.highest_acked.map_or(offset, |h| h.max(offset)));
        let after = state.watermark();
        state.pending_acks.insert(offset);
        state.pending_acks = state.pending_acks.split_off(&after);

        metrics::gauge!(
            PENDING_ACKS,
            "topic" => partition.topic().to_string(),
            "partition" => partition.partition_number().to_string()
        )
        .set(state.pending_acks.len() as f64);

        (after > before).then_some(after)
    }

    /// Snapshot of the partitions whose watermark is ahead of the last commit.
    pub fn committable_offsets(&self) -> HashMap<Partition, i64> {
        self.partitions
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .committable()
                    .map(|offset| (entry.key().clone(), offset))
            })
            .collect()
    }

    /// Records offsets confirmed by the broker. Never moves a partition back.
    pub fn mark_committed(&self, offsets: &HashMap<Partition, i64>) {
        for (partition, offset) in offsets {
            if let Some(mut state) = self.partitions.get_mut(partition) {
                if *offset > state.last_committed {
                    state.last_committed = *offset;
                }
            }
        }
    }

    pub fn last_committed(&self, partition: &Partition) -> Option<i64> {
        self.partitions.get(partition).map(|s| s.last_committed)
    }

    pub fn highest_acked(&self, partition: &Partition) -> Option<i64> {
        self.partitions.get(partition).and_then(|s| s.highest_acked)
    }

    /// Number of offsets acked ahead of an outstanding one.
    pub fn pending_acks(&self, partition: &Partition) -> usize {
        self.partitions
            .get(partition)
            .map_or(0, |s| s.pending_acks.len())
    }

    pub fn outstanding(&self, partition: &Partition) -> usize {
        self.partitions
            .get(partition)
            .map_or(0, |s| s.outstanding.len())
    }

    /// Forgets a partition, e.g. once the channel stops consuming it.
    pub fn clear_partition(&self, partition: &Partition) {
        self.partitions.remove(partition);
    }

    pub fn clear(&self) {
        self.partitions.clear();
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn coordinator_with(
        partition: &Partition,
        offsets: std::ops::Range<i64>,
    ) -> OffsetCommitCoordinator {
        let coordinator = OffsetCommitCoordinator::new();
        for offset in offsets {
            coordinator.received(partition, offset);
        }
        coordinator
    }

    #[test]
    fn in_order_acks_advance_one_by_one() {
        let p = Partition::new("numbers", 0);
        let coordinator = coordinator_with(&p, 0..3);

        assert_eq!(coordinator.acknowledge(&p, 0), Some(1));
        assert_eq!(coordinator.acknowledge(&p, 1), Some(2));
        assert_eq!(coordinator.acknowledge(&p, 2), Some(3));
        assert_eq!(coordinator.committable_offsets(), HashMap::from([(p, 3)]));
    }

    #[test]
    fn gaps_block_the_watermark() {
        let p = Partition::new("numbers", 0);
        let coordinator = coordinator_with(&p, 0..5);

        assert_eq!(coordinator.acknowledge(&p, 3), None);
        assert_eq!(coordinator.acknowledge(&p, 1), None);
        assert_eq!(coordinator.pending_acks(&p), 2);
        assert!(coordinator.committable_offsets().is_empty());

        assert_eq!(coordinator.acknowledge(&p, 0), Some(2));
        assert_eq!(coordinator.pending_acks(&p), 1);
        assert_eq!(coordinator.acknowledge(&p, 2), Some(4));
        assert_eq!(coordinator.pending_acks(&p), 0);
        assert_eq!(coordinator.highest_acked(&p), Some(3));
    }

    #[rstest]
    #[case(vec![4, 3, 2, 1, 0])]
    #[case(vec![0, 2, 4, 1, 3])]
    #[case(vec![2, 0, 1, 4, 3])]
    fn any_completion_order_ends_fully_committable(#[case] order: Vec<i64>) {
        let p = Partition::new("numbers", 0);
        let coordinator = coordinator_with(&p, 0..5);

        let mut acked = BTreeSet::new();
        for offset in order {
            acked.insert(offset);
            coordinator.acknowledge(&p, offset);

            let contiguous = (0..5).take_while(|o| acked.contains(o)).count() as i64;
            let committable = coordinator
                .committable_offsets()
                .get(&p)
                .copied()
                .unwrap_or(0);
            assert_eq!(committable, contiguous);
        }
        assert_eq!(coordinator.committable_offsets().get(&p), Some(&5));
    }

    #[test]
    fn duplicate_and_unknown_acks_are_ignored() {
        let p = Partition::new("numbers", 0);
        let coordinator = coordinator_with(&p, 10..12);

        assert_eq!(coordinator.acknowledge(&p, 10), Some(11));
        assert_eq!(coordinator.acknowledge(&p, 10), None);
        assert_eq!(coordinator.acknowledge(&p, 99), None);
        assert_eq!(coordinator.acknowledge(&Partition::new("other", 0), 10), None);
        assert_eq!(coordinator.committable_offsets().get(&p), Some(&11));
    }

    #[test]
    fn mark_committed_never_moves_back() {
        let p = Partition::new("numbers", 1);
        let coordinator = coordinator_with(&p, 0..4);
        for offset in 0..4 {
            coordinator.acknowledge(&p, offset);
        }

        coordinator.mark_committed(&HashMap::from([(p.clone(), 4)]));
        coordinator.mark_committed(&HashMap::from([(p.clone(), 2)]));

        assert_eq!(coordinator.last_committed(&p), Some(4));
        assert!(coordinator.committable_offsets().is_empty());
    }

    #[test]
    fn partitions_are_independent() {
        let p0 = Partition::new("numbers", 0);
        let p1 = Partition::new("numbers", 1);
        let coordinator = OffsetCommitCoordinator::new();
        coordinator.received(&p0, 0);
        coordinator.received(&p0, 1);
        coordinator.received(&p1, 7);

        coordinator.acknowledge(&p0, 1);
        coordinator.acknowledge(&p1, 7);

        assert_eq!(coordinator.committable_offsets(), HashMap::from([(p1, 8)]));
    }
}
