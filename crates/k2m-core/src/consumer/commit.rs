//! Offset commits with exponential backoff.

use crate::kafka::{BrokerClient, CommitCursors};
use crate::metrics::MetricsRecorder;
use crate::record::{PartitionOffset, TopicPartition};
use crate::retry::RetryConfig;
use crate::shutdown::Shutdown;
use crate::{Error, KafkaError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Commits pending commit cursors to the broker.
///
/// Only cursors that moved past their last commit are sent, and a cursor is
/// marked committed only after the broker accepted it. Every commit takes a
/// cancellation signal; once it fires the commit gives up with
/// [`Error::Shutdown`] and the cursors stay pending.
pub struct Committer {
    broker: Arc<dyn BrokerClient>,
    cursors: Arc<CommitCursors>,
    metrics: Arc<dyn MetricsRecorder>,
    retry: RetryConfig,
}

impl Committer {
    /// Create a committer with the default commit backoff.
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        cursors: Arc<CommitCursors>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            broker,
            cursors,
            metrics,
            retry: RetryConfig::new(Duration::from_millis(100), Duration::from_secs(5), 5),
        }
    }

    /// Set custom retry configuration.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Commit every pending cursor. Returns how many partitions were committed.
    pub async fn commit_pending(&self, cancel: &Shutdown) -> Result<usize> {
        self.commit(self.cursors.pending(), cancel).await
    }

    /// Commit pending cursors of `partitions` only.
    pub async fn commit_partitions(
        &self,
        partitions: &[TopicPartition],
        cancel: &Shutdown,
    ) -> Result<usize> {
        self.commit(self.cursors.pending_for(partitions), cancel)
            .await
    }

    /// Commit a snapshot of cursors taken by the caller.
    pub async fn commit(&self, offsets: Vec<PartitionOffset>, cancel: &Shutdown) -> Result<usize> {
        if offsets.is_empty() {
            return Ok(0);
        }

        let mut retries = 0u32;
        loop {
            let committed = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(count = offsets.len(), "Offset commit cancelled");
                    return Err(Error::Shutdown);
                }
                committed = self.broker.commit(&offsets) => committed,
            };

            match committed {
                Ok(()) => {
                    for po in &offsets {
                        self.cursors.mark_committed(&po.tp, po.next_offset);
                    }
                    self.metrics.record_commit(true);
                    debug!(count = offsets.len(), offsets = ?offsets, "Offsets committed");
                    return Ok(offsets.len());
                }
                Err(e) if e.is_fatal() => {
                    self.metrics.record_commit(false);
                    return Err(e);
                }
                Err(e) => {
                    let attempt = retries + 1;
                    if !self.retry.allows_retry(retries) {
                        warn!(
                            attempt = attempt,
                            max_retries = self.retry.max_retries,
                            error = %e,
                            "Offset commit failed after max retries"
                        );
                        self.metrics.record_commit(false);
                        return Err(Error::Kafka(KafkaError::RetriesExhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        }));
                    }

                    let delay = self.retry.calculate_delay(retries);
                    warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Offset commit failed, retrying with backoff"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!(attempt = attempt, "Offset commit abandoned during backoff");
                            return Err(Error::Shutdown);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    retries += 1;
                }
            }
        }
    }
}
