//! Commit cursors for assigned partitions.

use crate::record::{PartitionOffset, TopicPartition};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

const UNSET: i64 = -1;

struct Cursor {
    /// Next offset safe to commit
    next: AtomicI64,
    /// Last next-offset acknowledged by the broker
    committed: AtomicI64,
}

impl Cursor {
    fn new(offset: Option<i64>) -> Self {
        let value = offset.filter(|o| *o >= 0).unwrap_or(UNSET);
        Self {
            next: AtomicI64::new(value),
            committed: AtomicI64::new(value),
        }
    }
}

fn as_offset(value: i64) -> Option<i64> {
    (value != UNSET).then_some(value)
}

/// Per-partition commit cursors.
///
/// A cursor only moves forward while its partition stays assigned. Updates
/// for partitions that are not tracked are ignored, so a late completion from
/// a drained worker cannot resurrect a revoked partition.
pub struct CommitCursors {
    cursors: DashMap<TopicPartition, Cursor>,
}

impl CommitCursors {
    /// Create an empty cursor table.
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }

    /// Start (or restart) tracking a partition at the broker-reported offset.
    pub fn reset(&self, tp: &TopicPartition, broker_offset: Option<i64>) {
        self.cursors.insert(tp.clone(), Cursor::new(broker_offset));
    }

    /// Advance the cursor to `next`. Returns whether it moved.
    pub fn advance(&self, tp: &TopicPartition, next: i64) -> bool {
        match self.cursors.get(tp) {
            Some(cursor) => cursor.next.fetch_max(next, Ordering::SeqCst) < next,
            None => false,
        }
    }

    /// Next offset safe to commit for a partition.
    pub fn get(&self, tp: &TopicPartition) -> Option<i64> {
        self.cursors
            .get(tp)
            .and_then(|c| as_offset(c.next.load(Ordering::SeqCst)))
    }

    /// Last committed next-offset for a partition.
    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.cursors
            .get(tp)
            .and_then(|c| as_offset(c.committed.load(Ordering::SeqCst)))
    }

    /// Record a successful commit.
    pub fn mark_committed(&self, tp: &TopicPartition, next: i64) {
        if let Some(cursor) = self.cursors.get(tp) {
            cursor.committed.fetch_max(next, Ordering::SeqCst);
        }
    }

    /// Cursors that moved past their last commit.
    pub fn pending(&self) -> Vec<PartitionOffset> {
        self.cursors
            .iter()
            .filter_map(|entry| Self::pending_entry(entry.key(), entry.value()))
            .collect()
    }

    /// Pending cursors restricted to `partitions`.
    pub fn pending_for(&self, partitions: &[TopicPartition]) -> Vec<PartitionOffset> {
        partitions
            .iter()
            .filter_map(|tp| {
                self.cursors
                    .get(tp)
                    .and_then(|cursor| Self::pending_entry(tp, cursor.value()))
            })
            .collect()
    }

    fn pending_entry(tp: &TopicPartition, cursor: &Cursor) -> Option<PartitionOffset> {
        let next = cursor.next.load(Ordering::SeqCst);
        let committed = cursor.committed.load(Ordering::SeqCst);
        (next != UNSET && next > committed).then(|| PartitionOffset {
            tp: tp.clone(),
            next_offset: next,
        })
    }

    /// Stop tracking a partition, returning its last cursor.
    pub fn remove(&self, tp: &TopicPartition) -> Option<i64> {
        self.cursors
            .remove(tp)
            .and_then(|(_, c)| as_offset(c.next.load(Ordering::SeqCst)))
    }

    /// Whether a partition is tracked.
    pub fn contains(&self, tp: &TopicPartition) -> bool {
        self.cursors.contains_key(tp)
    }
}

impl Default for CommitCursors {
    fn default() -> Self {
        Self::new()
    }
}
