//! Metrics side channel.
//!
//! Recording never fails and never gates control flow.

mod prometheus;

pub use self::prometheus::ConsumerMetrics;

use crate::record::TopicPartition;
use std::time::Duration;

/// Why a record counted as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Retries exhausted and the record was skipped
    Exhausted,
    /// Retries exhausted and the record was dead-lettered
    DeadLettered,
    /// Processor returned a fatal outcome
    Fatal,
}

impl FailureReason {
    /// Get the label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            FailureReason::Exhausted => "exhausted",
            FailureReason::DeadLettered => "dead_lettered",
            FailureReason::Fatal => "fatal",
        }
    }
}

/// Kind of rebalance notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebalanceKind {
    /// Partitions assigned
    Assign,
    /// Partitions revoked
    Revoke,
}

impl RebalanceKind {
    /// Get the label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            RebalanceKind::Assign => "assign",
            RebalanceKind::Revoke => "revoke",
        }
    }
}

/// Receiver of consumer counters and timers.
pub trait MetricsRecorder: Send + Sync + 'static {
    /// A record completed successfully.
    fn record_processed(&self, tp: &TopicPartition, latency: Duration);

    /// A record failed for good.
    fn record_failed(&self, tp: &TopicPartition, reason: FailureReason);

    /// A record is about to be re-dispatched.
    fn record_retry(&self, tp: &TopicPartition);

    /// A record was written to the dead-letter sink.
    fn record_dead_lettered(&self, tp: &TopicPartition);

    /// An offset commit finished.
    fn record_commit(&self, success: bool);

    /// A rebalance notification was handled.
    fn record_rebalance(&self, kind: RebalanceKind);

    /// Number of partitions currently assigned.
    fn set_assigned_partitions(&self, count: usize);
}

/// Recorder that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record_processed(&self, _tp: &TopicPartition, _latency: Duration) {}
    fn record_failed(&self, _tp: &TopicPartition, _reason: FailureReason) {}
    fn record_retry(&self, _tp: &TopicPartition) {}
    fn record_dead_lettered(&self, _tp: &TopicPartition) {}
    fn record_commit(&self, _success: bool) {}
    fn record_rebalance(&self, _kind: RebalanceKind) {}
    fn set_assigned_partitions(&self, _count: usize) {}
}
