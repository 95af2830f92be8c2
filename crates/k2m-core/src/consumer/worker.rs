//! Per-partition dispatch worker.
//!
//! Each assigned partition gets one worker task fed by a bounded queue. The
//! worker handles one record at a time, so records of a partition are never
//! in flight concurrently and are observed in offset order.

use super::commit::Committer;
use crate::config::FailurePolicy;
use crate::error::ProcessingError;
use crate::kafka::CommitCursors;
use crate::metrics::{FailureReason, MetricsRecorder};
use crate::processor::{ProcessContext, ProcessingOutcome, Processor};
use crate::record::{Record, TopicPartition};
use crate::retry::RetryConfig;
use crate::shutdown::{self, Shutdown, ShutdownTrigger, TaskGuard};
use crate::sink::{DeadLetter, DeadLetterSink};
use crate::Error;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info_span, warn, Instrument, Span};

/// Event sent from a worker back to the control loop.
#[derive(Debug)]
pub(crate) enum WorkerReport {
    /// A record finished and its cursor advanced.
    Completed {
        tp: TopicPartition,
        next_offset: i64,
    },
    /// A fatal outcome stopped the partition.
    Halted {
        tp: TopicPartition,
        offset: i64,
        error: ProcessingError,
    },
    /// A synchronous per-record commit failed for good.
    CommitFailed { tp: TopicPartition, error: Error },
}

/// Dependencies shared by all partition workers.
#[derive(Clone)]
pub(crate) struct WorkerShared {
    pub processor: Arc<dyn Processor>,
    pub metrics: Arc<dyn MetricsRecorder>,
    pub cursors: Arc<CommitCursors>,
    /// Set when every record is committed synchronously.
    pub committer: Option<Arc<Committer>>,
    pub dead_letter: Option<Arc<dyn DeadLetterSink>>,
    pub failure_policy: FailurePolicy,
    pub retry: RetryConfig,
    pub processing_timeout: Duration,
    pub reports: mpsc::UnboundedSender<WorkerReport>,
}

/// What to do with a record once handling ended.
enum Disposition {
    /// Done; move the cursor past it.
    Advance,
    /// Stop the partition without moving the cursor.
    Halt(ProcessingError),
    /// Stop requested before the record completed.
    Interrupted,
}

/// How a worker ended when drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrainOutcome {
    /// Finished its in-flight record and exited
    Drained,
    /// Grace period expired; in-flight work abandoned
    Abandoned,
    /// Task panicked or was cancelled
    Failed,
}

/// Control-loop side of a partition worker.
pub(crate) struct WorkerHandle {
    queue: mpsc::Sender<Record>,
    stop: ShutdownTrigger,
    abandon: ShutdownTrigger,
    task: TaskGuard<()>,
}

impl WorkerHandle {
    /// Spawn a worker for `tp` with a queue of `depth` records.
    pub fn spawn(tp: TopicPartition, shared: WorkerShared, depth: usize) -> Self {
        let (queue, rx) = mpsc::channel(depth.max(1));
        let (stop, stop_signal) = shutdown::channel();
        let (abandon, abandon_signal) = shutdown::channel();
        let worker = PartitionWorker {
            tp,
            shared,
            stop: stop_signal,
            abandon: abandon_signal,
        };
        Self {
            queue,
            stop,
            abandon,
            task: TaskGuard::spawn(worker.run(rx)),
        }
    }

    /// Queue a record without waiting. Gives the record back when the queue
    /// is full or the worker is gone.
    pub fn try_enqueue(&self, record: Record) -> Result<(), mpsc::error::TrySendError<Record>> {
        self.queue.try_send(record)
    }

    /// Ask the worker to exit after its in-flight record.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    /// Wait for the worker to exit, abandoning it at `deadline`.
    pub async fn join_until(mut self, tp: &TopicPartition, deadline: Instant) -> DrainOutcome {
        self.stop.trigger();
        match tokio::time::timeout_at(deadline, self.task.join()).await {
            Ok(Ok(())) => DrainOutcome::Drained,
            Ok(Err(e)) => {
                error!(partition = %tp, error = %e, "Partition worker failed");
                DrainOutcome::Failed
            }
            Err(_) => {
                self.abandon.trigger();
                self.task.abort();
                warn!(partition = %tp, "Grace period expired, abandoning in-flight record");
                DrainOutcome::Abandoned
            }
        }
    }
}

struct PartitionWorker {
    tp: TopicPartition,
    shared: WorkerShared,
    /// Finish the in-flight record, then exit
    stop: Shutdown,
    /// In-flight work is being abandoned
    abandon: Shutdown,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl PartitionWorker {
    async fn run(self, mut rx: mpsc::Receiver<Record>) {
        debug!(partition = %self.tp, "Partition worker started");

        loop {
            let record = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                next = rx.recv() => match next {
                    Some(record) => record,
                    None => break,
                },
            };

            let span = info_span!(
                "record",
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset
            );
            let disposition = self
                .process(&record, span.clone())
                .instrument(span.clone())
                .await;

            match disposition {
                Disposition::Advance => {
                    let next_offset = record.offset + 1;
                    self.shared.cursors.advance(&self.tp, next_offset);

                    if let Some(committer) = &self.shared.committer {
                        match committer
                            .commit_partitions(std::slice::from_ref(&self.tp), &self.abandon)
                            .instrument(span)
                            .await
                        {
                            Ok(_) => {}
                            Err(Error::Shutdown) => {
                                debug!(partition = %self.tp, offset = record.offset, "Per-record commit abandoned");
                                break;
                            }
                            Err(error) => {
                                error!(partition = %self.tp, error = %error, "Per-record commit failed");
                                let _ = self.shared.reports.send(WorkerReport::CommitFailed {
                                    tp: self.tp.clone(),
                                    error,
                                });
                                break;
                            }
                        }
                    }

                    let _ = self.shared.reports.send(WorkerReport::Completed {
                        tp: self.tp.clone(),
                        next_offset,
                    });
                }
                Disposition::Halt(error) => {
                    let _ = self.shared.reports.send(WorkerReport::Halted {
                        tp: self.tp.clone(),
                        offset: record.offset,
                        error,
                    });
                    break;
                }
                Disposition::Interrupted => break,
            }
        }

        debug!(partition = %self.tp, "Partition worker stopped");
    }

    async fn process(&self, record: &Record, span: Span) -> Disposition {
        let started = Instant::now();
        let mut retries = 0u32;

        loop {
            let attempt = retries + 1;
            let ctx = ProcessContext::new(
                self.abandon.clone(),
                self.shared.processing_timeout,
                attempt,
                span.clone(),
            );

            let error = match self.invoke(&ctx, record).await {
                ProcessingOutcome::Success => {
                    self.shared
                        .metrics
                        .record_processed(&self.tp, started.elapsed());
                    debug!(attempt = attempt, "Record processed");
                    return Disposition::Advance;
                }
                ProcessingOutcome::Fatal(error) => {
                    error!(attempt = attempt, error = %error, "Fatal processing error, halting partition");
                    self.shared
                        .metrics
                        .record_failed(&self.tp, FailureReason::Fatal);
                    return Disposition::Halt(error);
                }
                ProcessingOutcome::Retryable(error) => error,
            };

            if !self.shared.retry.allows_retry(retries) {
                return self.exhausted(record, error, attempt, &span).await;
            }

            let delay = self.shared.retry.calculate_delay(retries);
            warn!(
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retryable processing error, retrying with backoff"
            );
            self.shared.metrics.record_retry(&self.tp);

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    warn!(attempt = attempt, "Record abandoned during retry backoff");
                    return Disposition::Interrupted;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            retries += 1;
        }
    }

    /// Run `handle` bounded by the processing timeout, containing panics.
    async fn invoke(&self, ctx: &ProcessContext, record: &Record) -> ProcessingOutcome {
        let timeout = self.shared.processing_timeout;
        let handle = AssertUnwindSafe(self.shared.processor.handle(ctx, record)).catch_unwind();

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                ProcessingOutcome::Fatal(ProcessingError::Panicked(panic_message(panic.as_ref())))
            }
            Err(_) => ProcessingOutcome::Retryable(ProcessingError::Timeout(
                timeout.as_millis() as u64,
            )),
        }
    }

    /// Resolve a record whose retries ran out according to the failure policy.
    async fn exhausted(
        &self,
        record: &Record,
        error: ProcessingError,
        attempts: u32,
        span: &Span,
    ) -> Disposition {
        let sink = match (self.shared.failure_policy, &self.shared.dead_letter) {
            (FailurePolicy::DeadLetter, Some(sink)) => sink,
            (policy, _) => {
                if policy == FailurePolicy::DeadLetter {
                    warn!("No dead-letter sink configured, skipping instead");
                }
                error!(attempts = attempts, error = %error, "Retries exhausted, skipping record");
                self.shared
                    .metrics
                    .record_failed(&self.tp, FailureReason::Exhausted);
                return Disposition::Advance;
            }
        };

        let ctx = ProcessContext::new(
            self.abandon.clone(),
            self.shared.processing_timeout,
            attempts,
            span.clone(),
        );
        let letter = DeadLetter {
            record,
            reason: error.to_string(),
            attempts,
        };

        match sink.send(&ctx, letter).await {
            Ok(()) => {
                warn!(attempts = attempts, error = %error, "Retries exhausted, record dead-lettered");
                self.shared.metrics.record_dead_lettered(&self.tp);
                self.shared
                    .metrics
                    .record_failed(&self.tp, FailureReason::DeadLettered);
                Disposition::Advance
            }
            Err(e) => {
                error!(error = %e, "Dead-letter write failed, halting partition");
                self.shared
                    .metrics
                    .record_failed(&self.tp, FailureReason::Fatal);
                Disposition::Halt(ProcessingError::DeadLetter(e.to_string()))
            }
        }
    }
}
