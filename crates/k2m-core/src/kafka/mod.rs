//! Broker client abstraction with an rdkafka implementation and an
//! in-memory implementation for tests and dry runs.
//!
//! Rebalance notifications travel over a channel separate from record
//! batches. A revocation carries a [`RevocationAck`]; the broker must not
//! complete the revocation until the consumer acknowledges it (or the
//! bounded wait expires), which is what keeps revoked partitions from being
//! dispatched after they have been handed to another member.

mod consumer;
mod memory;
mod offset;

pub use consumer::{KafkaBroker, KafkaBrokerBuilder};
pub use memory::MemoryBroker;
pub use offset::CommitCursors;

use crate::record::{PartitionOffset, Record, TopicPartition};
use crate::Result;
use async_trait::async_trait;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Operations the group consumer needs from a broker client.
///
/// Implementations must be safe for concurrent use: per-record commits are
/// issued from several partition workers at once.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Poll one bounded batch. An empty batch means the timeout elapsed.
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Vec<Record>>;

    /// Commit next-offsets-to-read for the given partitions.
    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<()>;

    /// Committed offsets as known to the broker.
    async fn committed_offsets(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<Vec<(TopicPartition, Option<i64>)>>;

    /// Stop fetching for the given partitions.
    fn pause(&self, partitions: &[TopicPartition]) -> Result<()>;

    /// Resume fetching for the given partitions.
    fn resume(&self, partitions: &[TopicPartition]) -> Result<()>;

    /// Release the handle. Called exactly once by the group consumer.
    async fn close(&self) -> Result<()>;
}

/// A partition handed to this member, with the offset the broker reports for
/// it (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedPartition {
    /// Partition
    pub tp: TopicPartition,
    /// Committed next offset reported with the assignment
    pub committed: Option<i64>,
}

/// Rebalance notification emitted by a broker client.
#[derive(Debug)]
pub enum RebalanceEvent {
    /// Partitions added to this member.
    Assigned(Vec<AssignedPartition>),
    /// Partitions being taken away; acknowledge once they are drained.
    Revoked {
        /// Revoked partitions
        partitions: Vec<TopicPartition>,
        /// Acknowledgement the broker is waiting on
        ack: RevocationAck,
    },
}

/// Receiving side of a broker's rebalance notifications.
#[derive(Debug)]
pub struct RebalanceEvents {
    rx: mpsc::UnboundedReceiver<RebalanceEvent>,
}

impl RebalanceEvents {
    /// Create a linked sender/receiver pair.
    pub fn channel() -> (mpsc::UnboundedSender<RebalanceEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Next event, or `None` once the broker side is gone.
    pub async fn recv(&mut self) -> Option<RebalanceEvent> {
        self.rx.recv().await
    }
}

/// Acknowledgement for a revocation.
///
/// Dropping it without acknowledging releases the broker immediately.
#[derive(Debug)]
pub struct RevocationAck {
    tx: std_mpsc::SyncSender<()>,
}

/// Broker-side wait for a [`RevocationAck`].
#[derive(Debug)]
pub struct RevocationWaiter {
    rx: std_mpsc::Receiver<()>,
}

/// How a revocation wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationOutcome {
    /// Consumer drained and acknowledged
    Acknowledged,
    /// Consumer dropped the acknowledgement (shutting down)
    Released,
    /// Bounded wait expired
    TimedOut,
}

impl RevocationAck {
    /// Create a linked acknowledgement/waiter pair.
    pub fn pair() -> (RevocationAck, RevocationWaiter) {
        let (tx, rx) = std_mpsc::sync_channel(1);
        (RevocationAck { tx }, RevocationWaiter { rx })
    }

    /// Tell the broker the revoked partitions are no longer dispatched.
    pub fn acknowledge(self) {
        let _ = self.tx.try_send(());
    }
}

impl RevocationWaiter {
    /// Block the calling thread until acknowledged or `timeout` elapses.
    ///
    /// Used from synchronous client callbacks.
    pub fn wait_blocking(self, timeout: Duration) -> RevocationOutcome {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => RevocationOutcome::Acknowledged,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => RevocationOutcome::Released,
            Err(std_mpsc::RecvTimeoutError::Timeout) => RevocationOutcome::TimedOut,
        }
    }

    /// Async variant of [`wait_blocking`](Self::wait_blocking).
    pub async fn wait(self, timeout: Duration) -> RevocationOutcome {
        tokio::task::spawn_blocking(move || self.wait_blocking(timeout))
            .await
            .unwrap_or(RevocationOutcome::Released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_revocation_acknowledged() {
        let (ack, waiter) = RevocationAck::pair();
        let wait = tokio::spawn(waiter.wait(Duration::from_secs(1)));
        ack.acknowledge();
        assert_eq!(wait.await.unwrap(), RevocationOutcome::Acknowledged);
    }

    #[tokio::test]
    async fn test_revocation_released_on_drop() {
        let (ack, waiter) = RevocationAck::pair();
        drop(ack);
        assert_eq!(
            waiter.wait(Duration::from_secs(1)).await,
            RevocationOutcome::Released
        );
    }

    #[test]
    fn test_revocation_times_out() {
        let (_ack, waiter) = RevocationAck::pair();
        assert_eq!(
            waiter.wait_blocking(Duration::from_millis(10)),
            RevocationOutcome::TimedOut
        );
    }
}
