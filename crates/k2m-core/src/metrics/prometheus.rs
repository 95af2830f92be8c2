//! Prometheus metrics export.

use super::{FailureReason, MetricsRecorder, RebalanceKind};
use crate::record::TopicPartition;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tracing::warn;

/// Histogram bucket boundaries in seconds for record processing latency.
const LATENCY_BUCKETS: [f64; 10] = [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0];

/// Consumer metrics backed by a Prometheus registry.
pub struct ConsumerMetrics {
    registry: Registry,

    // === COUNTERS ===
    records_processed: IntCounterVec,
    records_failed: IntCounterVec,
    records_retried: IntCounterVec,
    records_dead_lettered: IntCounterVec,
    commits: IntCounter,
    commit_failures: IntCounter,
    rebalances: IntCounterVec,

    // === GAUGES ===
    partitions_assigned: IntGauge,

    // === HISTOGRAMS ===
    processing_latency: HistogramVec,
}

impl ConsumerMetrics {
    /// Create metrics registered in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered in `registry`.
    ///
    /// Registration conflicts are logged; the metric still records but is not
    /// exported.
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let partition_labels = ["topic", "partition"];

        let metrics = Self {
            records_processed: IntCounterVec::new(
                Opts::new("k2m_records_processed_total", "Records processed successfully"),
                &partition_labels,
            )?,
            records_failed: IntCounterVec::new(
                Opts::new("k2m_records_failed_total", "Records that failed permanently"),
                &["topic", "partition", "reason"],
            )?,
            records_retried: IntCounterVec::new(
                Opts::new("k2m_records_retried_total", "Record re-dispatches after a retryable failure"),
                &partition_labels,
            )?,
            records_dead_lettered: IntCounterVec::new(
                Opts::new("k2m_records_dead_lettered_total", "Records written to the dead-letter sink"),
                &partition_labels,
            )?,
            commits: IntCounter::new("k2m_commits_total", "Successful offset commits")?,
            commit_failures: IntCounter::new(
                "k2m_commit_failures_total",
                "Offset commits that failed after retries",
            )?,
            rebalances: IntCounterVec::new(
                Opts::new("k2m_rebalances_total", "Rebalance notifications handled"),
                &["kind"],
            )?,
            partitions_assigned: IntGauge::new(
                "k2m_partitions_assigned",
                "Partitions currently assigned to this member",
            )?,
            processing_latency: HistogramVec::new(
                HistogramOpts::new(
                    "k2m_processing_latency_seconds",
                    "Time from first dispatch to completion of a record",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
                &partition_labels,
            )?,
            registry,
        };

        metrics.register_all();
        Ok(metrics)
    }

    fn register_all(&self) {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(self.records_processed.clone()),
            Box::new(self.records_failed.clone()),
            Box::new(self.records_retried.clone()),
            Box::new(self.records_dead_lettered.clone()),
            Box::new(self.commits.clone()),
            Box::new(self.commit_failures.clone()),
            Box::new(self.rebalances.clone()),
            Box::new(self.partitions_assigned.clone()),
            Box::new(self.processing_latency.clone()),
        ];
        for collector in collectors {
            if let Err(e) = self.registry.register(collector) {
                warn!(error = %e, "Failed to register metric");
            }
        }
    }

    /// The backing registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export all metrics in Prometheus text format.
    pub fn export_prometheus_text(&self) -> String {
        let mut buffer = Vec::with_capacity(4096);
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    // === GETTERS ===

    /// Get records processed for a partition.
    pub fn records_processed(&self, tp: &TopicPartition) -> u64 {
        let partition = tp.partition.to_string();
        self.records_processed
            .with_label_values(&[tp.topic.as_str(), partition.as_str()])
            .get()
    }

    /// Get records failed for a partition and reason.
    pub fn records_failed(&self, tp: &TopicPartition, reason: FailureReason) -> u64 {
        let partition = tp.partition.to_string();
        self.records_failed
            .with_label_values(&[tp.topic.as_str(), partition.as_str(), reason.as_label()])
            .get()
    }

    /// Get retries for a partition.
    pub fn records_retried(&self, tp: &TopicPartition) -> u64 {
        let partition = tp.partition.to_string();
        self.records_retried
            .with_label_values(&[tp.topic.as_str(), partition.as_str()])
            .get()
    }

    /// Get total successful commits.
    pub fn commits_total(&self) -> u64 {
        self.commits.get()
    }

    /// Get currently assigned partitions.
    pub fn partitions_assigned(&self) -> i64 {
        self.partitions_assigned.get()
    }
}

impl MetricsRecorder for ConsumerMetrics {
    fn record_processed(&self, tp: &TopicPartition, latency: Duration) {
        let partition = tp.partition.to_string();
        let labels = [tp.topic.as_str(), partition.as_str()];
        self.records_processed.with_label_values(&labels).inc();
        self.processing_latency
            .with_label_values(&labels)
            .observe(latency.as_secs_f64());
    }

    fn record_failed(&self, tp: &TopicPartition, reason: FailureReason) {
        let partition = tp.partition.to_string();
        self.records_failed
            .with_label_values(&[tp.topic.as_str(), partition.as_str(), reason.as_label()])
            .inc();
    }

    fn record_retry(&self, tp: &TopicPartition) {
        let partition = tp.partition.to_string();
        self.records_retried
            .with_label_values(&[tp.topic.as_str(), partition.as_str()])
            .inc();
    }

    fn record_dead_lettered(&self, tp: &TopicPartition) {
        let partition = tp.partition.to_string();
        self.records_dead_lettered
            .with_label_values(&[tp.topic.as_str(), partition.as_str()])
            .inc();
    }

    fn record_commit(&self, success: bool) {
        if success {
            self.commits.inc();
        } else {
            self.commit_failures.inc();
        }
    }

    fn record_rebalance(&self, kind: RebalanceKind) {
        self.rebalances.with_label_values(&[kind.as_label()]).inc();
    }

    fn set_assigned_partitions(&self, count: usize) {
        self.partitions_assigned.set(count as i64);
    }
}
