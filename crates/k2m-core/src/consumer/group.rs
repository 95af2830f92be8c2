//! Group consumer: poll loop, per-partition dispatch, rebalance handling and
//! commit cadence.

use super::commit::Committer;
use super::state::{ConsumerState, StateMachine};
use super::worker::{DrainOutcome, WorkerHandle, WorkerReport, WorkerShared};
use crate::config::{CommitPolicy, ConsumerConfig, FailurePolicy};
use crate::health::{HealthCheck, COMPONENT_CONSUMER, COMPONENT_KAFKA};
use crate::kafka::{
    AssignedPartition, BrokerClient, CommitCursors, RebalanceEvent, RebalanceEvents,
    RevocationAck,
};
use crate::metrics::{MetricsRecorder, NoopMetrics, RebalanceKind};
use crate::processor::Processor;
use crate::record::{Record, TopicPartition};
use crate::retry::RetryConfig;
use crate::shutdown::{self, Shutdown, TaskGuard};
use crate::sink::DeadLetterSink;
use crate::{Error, KafkaError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Housekeeping tick when commits are not interval driven.
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Least time left for committing revoked partitions after they drained.
const REVOCATION_COMMIT_BUDGET: Duration = Duration::from_secs(1);

/// Builder for [`GroupConsumer`].
pub struct GroupConsumerBuilder {
    config: ConsumerConfig,
    batch_size: usize,
    poll_timeout: Duration,
    poll_retry: RetryConfig,
    commit_retry: Option<RetryConfig>,
    broker: Option<(Arc<dyn BrokerClient>, RebalanceEvents)>,
    processor: Option<Arc<dyn Processor>>,
    metrics: Arc<dyn MetricsRecorder>,
    health: Arc<HealthCheck>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
}

impl GroupConsumerBuilder {
    fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            batch_size: 500,
            poll_timeout: Duration::from_secs(1),
            poll_retry: RetryConfig::for_kafka(),
            commit_retry: None,
            broker: None,
            processor: None,
            metrics: Arc::new(NoopMetrics),
            health: Arc::new(HealthCheck::for_consumer()),
            dead_letter: None,
        }
    }

    /// Broker client and its rebalance notifications.
    pub fn broker(mut self, broker: Arc<dyn BrokerClient>, events: RebalanceEvents) -> Self {
        self.broker = Some((broker, events));
        self
    }

    /// Record handler.
    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Metrics sink. Defaults to [`NoopMetrics`].
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Shared health tracker.
    pub fn health(mut self, health: Arc<HealthCheck>) -> Self {
        self.health = health;
        self
    }

    /// Destination for exhausted records under [`FailurePolicy::DeadLetter`].
    pub fn dead_letter(mut self, sink: Option<Arc<dyn DeadLetterSink>>) -> Self {
        self.dead_letter = sink;
        self
    }

    /// Batch bound and timeout for each poll.
    pub fn poll(mut self, batch_size: usize, timeout: Duration) -> Self {
        self.batch_size = batch_size;
        self.poll_timeout = timeout;
        self
    }

    /// Backoff for transient poll failures.
    pub fn poll_retry(mut self, retry: RetryConfig) -> Self {
        self.poll_retry = retry;
        self
    }

    /// Backoff for transient commit failures.
    pub fn commit_retry(mut self, retry: RetryConfig) -> Self {
        self.commit_retry = Some(retry);
        self
    }

    /// Validate and build the consumer.
    pub fn build(self) -> Result<GroupConsumer> {
        let (broker, events) = self
            .broker
            .ok_or_else(|| Error::Config("Group consumer requires a broker client".into()))?;
        let processor = self
            .processor
            .ok_or_else(|| Error::Config("Group consumer requires a processor".into()))?;

        if self.batch_size == 0 {
            return Err(Error::Config("Batch size must be positive".into()));
        }
        if self.config.failure_policy == FailurePolicy::DeadLetter && self.dead_letter.is_none() {
            return Err(Error::Config(
                "Dead-letter failure policy requires a dead-letter sink".into(),
            ));
        }

        let cursors = Arc::new(CommitCursors::new());
        let mut committer = Committer::new(
            Arc::clone(&broker),
            Arc::clone(&cursors),
            Arc::clone(&self.metrics),
        );
        if let Some(retry) = self.commit_retry {
            committer = committer.with_retry_config(retry);
        }

        Ok(GroupConsumer {
            config: self.config,
            batch_size: self.batch_size,
            poll_timeout: self.poll_timeout,
            poll_retry: self.poll_retry,
            broker,
            events,
            processor,
            metrics: self.metrics,
            health: self.health,
            dead_letter: self.dead_letter,
            state: Arc::new(StateMachine::new()),
            cursors,
            committer: Arc::new(committer),
        })
    }
}

/// Consumes a set of topics as a member of a consumer group and delivers
/// every record to a [`Processor`] at least once.
///
/// Records of one partition are handled strictly in offset order, one at a
/// time. Different partitions progress independently. An offset is committed
/// only after every record before it in the same partition completed.
pub struct GroupConsumer {
    config: ConsumerConfig,
    batch_size: usize,
    poll_timeout: Duration,
    poll_retry: RetryConfig,
    broker: Arc<dyn BrokerClient>,
    events: RebalanceEvents,
    processor: Arc<dyn Processor>,
    metrics: Arc<dyn MetricsRecorder>,
    health: Arc<HealthCheck>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    state: Arc<StateMachine>,
    cursors: Arc<CommitCursors>,
    committer: Arc<Committer>,
}

impl GroupConsumer {
    /// Start building a consumer.
    pub fn builder(config: ConsumerConfig) -> GroupConsumerBuilder {
        GroupConsumerBuilder::new(config)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        self.state.current()
    }

    /// Observe lifecycle changes. Stays valid after `run` consumed the consumer.
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Commit cursors, shared with the running consumer.
    pub fn cursors(&self) -> Arc<CommitCursors> {
        Arc::clone(&self.cursors)
    }

    /// Health tracker.
    pub fn health(&self) -> Arc<HealthCheck> {
        Arc::clone(&self.health)
    }

    /// Run until `shutdown` fires or a fatal error occurs.
    ///
    /// On return every worker has stopped, a final commit was attempted and
    /// the broker and processor have been closed.
    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        let broker = Arc::clone(&self.broker);
        let processor = Arc::clone(&self.processor);
        let state = Arc::clone(&self.state);
        let health = Arc::clone(&self.health);

        state.transition(ConsumerState::Joining);
        info!(
            batch_size = self.batch_size,
            commit = ?self.config.commit,
            failure_policy = ?self.config.failure_policy,
            "Group consumer started"
        );

        let mut task = TaskGuard::spawn(ConsumerLoop::new(self, shutdown).drive());
        let result = match task.join().await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Consumer loop panicked");
                health.consumer_stopped();
                Err(Error::from(e))
            }
        };

        state.transition(ConsumerState::Closing);
        if let Err(e) = broker.close().await {
            warn!(error = %e, "Error closing broker client");
        }
        if let Err(e) = processor.close().await {
            warn!(error = %e, "Error closing processor");
        }
        state.transition(ConsumerState::Closed);

        match &result {
            Ok(()) => info!("Group consumer stopped"),
            Err(e) => error!(error = %e, "Group consumer stopped with error"),
        }
        result
    }
}

/// Dispatch state of one assigned partition.
struct PartitionSlot {
    worker: WorkerHandle,
    /// Records that did not fit the worker queue, in offset order
    backlog: VecDeque<Record>,
    /// Lowest offset not yet handed to the worker
    next_dispatch: Option<i64>,
    paused: bool,
    halted: bool,
}

impl PartitionSlot {
    fn new(worker: WorkerHandle, committed: Option<i64>) -> Self {
        Self {
            worker,
            backlog: VecDeque::new(),
            next_dispatch: committed,
            paused: false,
            halted: false,
        }
    }

    /// Hand a record to the worker, spilling to the backlog when the queue
    /// is full. Returns true when the backlog is in use.
    fn enqueue(&mut self, record: Record) -> bool {
        if !self.backlog.is_empty() {
            self.backlog.push_back(record);
            return true;
        }
        match self.worker.try_enqueue(record) {
            Ok(()) => false,
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.backlog.push_back(record);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Move backlog records into the worker queue while it has room.
    /// Returns true once the backlog is empty.
    fn flush(&mut self) -> bool {
        while let Some(record) = self.backlog.pop_front() {
            match self.worker.try_enqueue(record) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(record)) => {
                    self.backlog.push_front(record);
                    return false;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.backlog.clear();
                }
            }
        }
        true
    }
}

struct ConsumerLoop {
    config: ConsumerConfig,
    batch_size: usize,
    poll_timeout: Duration,
    poll_retry: RetryConfig,
    broker: Arc<dyn BrokerClient>,
    events: RebalanceEvents,
    events_open: bool,
    metrics: Arc<dyn MetricsRecorder>,
    health: Arc<HealthCheck>,
    state: Arc<StateMachine>,
    cursors: Arc<CommitCursors>,
    committer: Arc<Committer>,
    shared: WorkerShared,
    reports: mpsc::UnboundedReceiver<WorkerReport>,
    partitions: HashMap<TopicPartition, PartitionSlot>,
    completed_since_commit: u64,
    /// Interval or count driven commit running in the background
    commit: Option<TaskGuard<Result<usize>>>,
    shutdown: Shutdown,
}

impl ConsumerLoop {
    fn new(consumer: GroupConsumer, shutdown: Shutdown) -> Self {
        let (report_tx, reports) = mpsc::unbounded_channel();
        let per_record = matches!(consumer.config.commit, CommitPolicy::PerRecord);

        let shared = WorkerShared {
            processor: Arc::clone(&consumer.processor),
            metrics: Arc::clone(&consumer.metrics),
            cursors: Arc::clone(&consumer.cursors),
            committer: per_record.then(|| Arc::clone(&consumer.committer)),
            dead_letter: consumer.dead_letter.clone(),
            failure_policy: consumer.config.failure_policy,
            retry: RetryConfig::from(&consumer.config.retry),
            processing_timeout: consumer.config.processing_timeout(),
            reports: report_tx,
        };

        Self {
            config: consumer.config,
            batch_size: consumer.batch_size,
            poll_timeout: consumer.poll_timeout,
            poll_retry: consumer.poll_retry,
            broker: consumer.broker,
            events: consumer.events,
            events_open: true,
            metrics: consumer.metrics,
            health: consumer.health,
            state: consumer.state,
            cursors: consumer.cursors,
            committer: consumer.committer,
            shared,
            reports,
            partitions: HashMap::new(),
            completed_since_commit: 0,
            commit: None,
            shutdown,
        }
    }

    fn tick_period(&self) -> Duration {
        match self.config.commit {
            CommitPolicy::Interval { interval_ms } => Duration::from_millis(interval_ms.max(1)),
            _ => IDLE_TICK,
        }
    }

    async fn drive(mut self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        let (poll_stop, poll_signal) = shutdown::channel();
        let (batch_tx, mut batches) = mpsc::channel(1);
        let mut poller = TaskGuard::spawn(poll_loop(
            Arc::clone(&self.broker),
            Arc::clone(&self.health),
            self.batch_size,
            self.poll_timeout,
            self.poll_retry.clone(),
            batch_tx,
            poll_signal,
        ));

        let period = self.tick_period();
        let mut commit_tick = tokio::time::interval_at(Instant::now() + period, period);
        commit_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.health.consumer_started();
        self.health.mark_healthy(COMPONENT_CONSUMER);

        let result = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break Ok(());
                }

                event = self.events.recv(), if self.events_open => match event {
                    Some(event) => self.on_rebalance(event).await,
                    None => {
                        debug!("Rebalance notifications closed");
                        self.events_open = false;
                    }
                },

                Some(report) = self.reports.recv() => {
                    if let Err(e) = self.on_report(report) {
                        break Err(e);
                    }
                }

                batch = batches.recv() => match batch {
                    Some(Ok(records)) => self.dispatch(records),
                    Some(Err(e)) => {
                        error!(error = %e, "Fatal broker error, stopping consumer");
                        self.health.mark_unhealthy(COMPONENT_KAFKA, &e.to_string());
                        break Err(e);
                    }
                    None => break Err(Error::Task("Poll task exited unexpectedly".into())),
                },

                committed = join_commit(&mut self.commit) => {
                    self.commit = None;
                    if let Err(e) = self.on_commit_finished(committed) {
                        break Err(e);
                    }
                }

                _ = commit_tick.tick() => self.on_tick(),
            }
        };

        if self.commit.take().is_some() {
            debug!("Background offset commit aborted");
        }

        self.health.consumer_stopped();
        self.state.transition(ConsumerState::Closing);

        poll_stop.trigger();
        let grace = self.config.shutdown_grace();
        if tokio::time::timeout(grace, poller.join()).await.is_err() {
            warn!("Poll task did not stop within grace period");
            poller.abort();
        }

        self.stop_all(Instant::now() + grace).await;

        let never = Shutdown::never();
        let final_commit = self.committer.commit_pending(&never);
        match tokio::time::timeout(grace, final_commit).await {
            Ok(Ok(count)) => info!(partitions = count, "Final offset commit complete"),
            Ok(Err(e)) => warn!(error = %e, "Final offset commit failed"),
            Err(_) => warn!("Final offset commit timed out"),
        }

        result
    }

    fn dispatch(&mut self, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        if self.state.current() == ConsumerState::Assigned {
            self.state.transition(ConsumerState::Polling);
        }

        let mut to_pause = Vec::new();
        for record in records {
            let tp = record.topic_partition();
            let Some(slot) = self.partitions.get_mut(&tp) else {
                debug!(partition = %tp, offset = record.offset, "Dropping record for unassigned partition");
                continue;
            };
            if slot.halted {
                continue;
            }
            if slot.next_dispatch.is_some_and(|next| record.offset < next) {
                debug!(partition = %tp, offset = record.offset, "Dropping already dispatched record");
                continue;
            }

            slot.next_dispatch = Some(record.offset + 1);
            if slot.enqueue(record) && !slot.paused {
                slot.paused = true;
                to_pause.push(tp);
            }
        }

        if !to_pause.is_empty() {
            match self.broker.pause(&to_pause) {
                Ok(()) => debug!(partitions = ?to_pause, "Partition queue full, fetch paused"),
                Err(e) => warn!(error = %e, "Failed to pause partitions"),
            }
        }
    }

    /// Refill the queue of a partition whose worker just finished a record.
    fn catch_up(&mut self, tp: &TopicPartition) {
        let Some(slot) = self.partitions.get_mut(tp) else {
            return;
        };
        if slot.halted || !slot.paused || !slot.flush() {
            return;
        }
        slot.paused = false;
        match self.broker.resume(std::slice::from_ref(tp)) {
            Ok(()) => debug!(partition = %tp, "Fetch resumed"),
            Err(e) => warn!(partition = %tp, error = %e, "Failed to resume partition"),
        }
    }

    /// Drain backlogs into worker queues and resume partitions that caught up.
    fn flush_backlogs(&mut self) {
        let mut to_resume = Vec::new();
        for (tp, slot) in self.partitions.iter_mut() {
            if slot.halted || !slot.paused {
                continue;
            }
            if slot.flush() {
                slot.paused = false;
                to_resume.push(tp.clone());
            }
        }

        if !to_resume.is_empty() {
            match self.broker.resume(&to_resume) {
                Ok(()) => debug!(partitions = ?to_resume, "Fetch resumed"),
                Err(e) => warn!(error = %e, "Failed to resume partitions"),
            }
        }
    }

    fn on_report(&mut self, report: WorkerReport) -> Result<()> {
        match report {
            WorkerReport::Completed { tp, next_offset } => {
                debug!(partition = %tp, next_offset = next_offset, "Cursor advanced");
                self.completed_since_commit += 1;
                self.catch_up(&tp);
                if self.commit_due() {
                    self.start_commit();
                }
            }
            WorkerReport::Halted { tp, offset, error } => {
                error!(partition = %tp, offset = offset, error = %error, "Partition halted");
                if let Some(slot) = self.partitions.get_mut(&tp) {
                    slot.halted = true;
                    slot.backlog.clear();
                    if !slot.paused {
                        slot.paused = true;
                        if let Err(e) = self.broker.pause(std::slice::from_ref(&tp)) {
                            warn!(partition = %tp, error = %e, "Failed to pause halted partition");
                        }
                    }
                }
                self.health.partition_halted(&tp, offset, &error.to_string());
            }
            WorkerReport::CommitFailed { tp, error } => {
                error!(partition = %tp, error = %error, "Offset commit failed");
                return Err(error);
            }
        }
        Ok(())
    }

    fn on_tick(&mut self) {
        self.flush_backlogs();
        if matches!(self.config.commit, CommitPolicy::Interval { .. }) {
            self.start_commit();
        }
    }

    fn commit_due(&self) -> bool {
        match self.config.commit {
            CommitPolicy::EveryRecords { count } => self.completed_since_commit >= count,
            _ => false,
        }
    }

    /// Commit a snapshot of the cursors in the background. At most one
    /// commit runs at a time; shutdown cancels it.
    fn start_commit(&mut self) {
        if self.commit.is_some() {
            return;
        }
        let offsets = self.cursors.pending();
        if offsets.is_empty() {
            return;
        }
        self.completed_since_commit = 0;

        let committer = Arc::clone(&self.committer);
        let cancel = self.shutdown.clone();
        self.commit = Some(TaskGuard::spawn(async move {
            committer.commit(offsets, &cancel).await
        }));
    }

    fn on_commit_finished(
        &mut self,
        joined: std::result::Result<Result<usize>, JoinError>,
    ) -> Result<()> {
        match joined {
            Ok(Ok(_)) => {}
            Ok(Err(Error::Shutdown)) => {
                debug!("Offset commit cancelled by shutdown");
                return Ok(());
            }
            Ok(Err(e)) => {
                error!(error = %e, "Offset commit failed");
                return Err(e);
            }
            Err(e) => return Err(Error::from(e)),
        }
        if self.commit_due() {
            self.start_commit();
        }
        Ok(())
    }

    async fn on_rebalance(&mut self, event: RebalanceEvent) {
        match event {
            RebalanceEvent::Assigned(partitions) => self.on_assigned(partitions).await,
            RebalanceEvent::Revoked { partitions, ack } => self.on_revoked(partitions, ack).await,
        }
    }

    async fn on_assigned(&mut self, partitions: Vec<AssignedPartition>) {
        if self.state.current() != ConsumerState::Joining {
            self.state.transition(ConsumerState::Rebalancing);
        }
        self.metrics.record_rebalance(RebalanceKind::Assign);

        let unknown: Vec<TopicPartition> = partitions
            .iter()
            .filter(|p| p.committed.is_none())
            .map(|p| p.tp.clone())
            .collect();
        let mut offsets: HashMap<TopicPartition, Option<i64>> = partitions
            .into_iter()
            .map(|p| (p.tp, p.committed))
            .collect();

        if !unknown.is_empty() {
            match self.broker.committed_offsets(&unknown).await {
                Ok(found) => {
                    for (tp, committed) in found {
                        if committed.is_some() {
                            offsets.insert(tp, committed);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to fetch committed offsets, starting from broker position"),
            }
        }

        for (tp, committed) in offsets {
            if self.partitions.contains_key(&tp) {
                debug!(partition = %tp, "Partition already assigned");
                continue;
            }
            self.cursors.reset(&tp, committed);
            let worker = WorkerHandle::spawn(
                tp.clone(),
                self.shared.clone(),
                self.config.partition_queue_depth,
            );
            info!(partition = %tp, committed = ?committed, "Partition assigned");
            self.partitions
                .insert(tp, PartitionSlot::new(worker, committed));
        }

        self.metrics.set_assigned_partitions(self.partitions.len());
        self.health.mark_healthy(COMPONENT_KAFKA);
        self.state.transition(ConsumerState::Assigned);
    }

    async fn on_revoked(&mut self, partitions: Vec<TopicPartition>, ack: RevocationAck) {
        let rebalancing = matches!(
            self.state.current(),
            ConsumerState::Assigned | ConsumerState::Polling
        );
        if rebalancing {
            self.state.transition(ConsumerState::Rebalancing);
        }
        self.metrics.record_rebalance(RebalanceKind::Revoke);

        if self.commit.take().is_some() {
            debug!("Background offset commit aborted for revocation");
        }

        let slots: Vec<(TopicPartition, PartitionSlot)> = partitions
            .iter()
            .filter_map(|tp| self.partitions.remove_entry(tp))
            .collect();

        let deadline = Instant::now() + self.config.revocation_grace();
        for (_, slot) in &slots {
            slot.worker.stop();
        }
        for (tp, slot) in slots {
            if !slot.backlog.is_empty() {
                debug!(partition = %tp, dropped = slot.backlog.len(), "Discarding undispatched records");
            }
            if slot.worker.join_until(&tp, deadline).await == DrainOutcome::Abandoned {
                warn!(partition = %tp, "Revoked partition did not drain in time");
            }
        }

        let commit_deadline = deadline.max(Instant::now() + REVOCATION_COMMIT_BUDGET);
        let never = Shutdown::never();
        let commit = self.committer.commit_partitions(&partitions, &never);
        match tokio::time::timeout_at(commit_deadline, commit).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Commit of revoked partitions failed"),
            Err(_) => warn!("Commit of revoked partitions timed out"),
        }
        for tp in &partitions {
            self.cursors.remove(tp);
            self.health.partition_released(tp);
        }
        ack.acknowledge();
        info!(partitions = ?partitions, "Partitions revoked");

        self.metrics.set_assigned_partitions(self.partitions.len());
        if rebalancing {
            self.state.transition(ConsumerState::Assigned);
        }
    }

    /// Stop every worker, waiting until `deadline` for in-flight records.
    async fn stop_all(&mut self, deadline: Instant) {
        let slots: Vec<(TopicPartition, PartitionSlot)> = self.partitions.drain().collect();
        for (_, slot) in &slots {
            slot.worker.stop();
        }

        let mut abandoned = 0usize;
        for (tp, slot) in slots {
            if slot.worker.join_until(&tp, deadline).await == DrainOutcome::Abandoned {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            warn!(partitions = abandoned, "In-flight records abandoned at shutdown");
        }
        self.metrics.set_assigned_partitions(0);
    }
}

/// Wait for the background commit, or forever when none runs.
async fn join_commit(
    commit: &mut Option<TaskGuard<Result<usize>>>,
) -> std::result::Result<Result<usize>, JoinError> {
    match commit {
        Some(task) => task.join().await,
        None => std::future::pending().await,
    }
}

/// Poll batches until stopped, backing off on transient failures.
async fn poll_loop(
    broker: Arc<dyn BrokerClient>,
    health: Arc<HealthCheck>,
    batch_size: usize,
    timeout: Duration,
    retry: RetryConfig,
    tx: mpsc::Sender<Result<Vec<Record>>>,
    stop: Shutdown,
) {
    let mut failures = 0u32;

    loop {
        let polled = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            polled = broker.poll(batch_size, timeout) => polled,
        };

        match polled {
            Ok(records) => {
                if failures > 0 {
                    info!(failures = failures, "Poll recovered");
                    health.mark_healthy(COMPONENT_KAFKA);
                    failures = 0;
                }
                if records.is_empty() {
                    continue;
                }
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return,
                    sent = tx.send(Ok(records)) => if sent.is_err() { return },
                }
            }
            Err(e) if e.is_fatal() => {
                let _ = tx.send(Err(e)).await;
                return;
            }
            Err(e) => {
                if !retry.allows_retry(failures) {
                    error!(attempts = failures + 1, error = %e, "Poll failed after max retries");
                    let _ = tx
                        .send(Err(Error::Kafka(KafkaError::RetriesExhausted {
                            attempts: failures + 1,
                            last_error: e.to_string(),
                        })))
                        .await;
                    return;
                }

                let delay = retry.calculate_delay(failures);
                failures += 1;
                warn!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Poll failed, retrying with backoff"
                );
                health.mark_degraded(COMPONENT_KAFKA, &e.to_string());

                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::MemoryBroker;
    use crate::processor::{ProcessContext, ProcessingOutcome};
    use async_trait::async_trait;

    struct Accept;

    #[async_trait]
    impl Processor for Accept {
        async fn handle(&self, _ctx: &ProcessContext, _record: &Record) -> ProcessingOutcome {
            ProcessingOutcome::Success
        }
    }

    #[test]
    fn test_build_requires_broker_and_processor() {
        let err = GroupConsumer::builder(ConsumerConfig::default())
            .processor(Arc::new(Accept))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));

        let (broker, events) = MemoryBroker::new();
        let err = GroupConsumer::builder(ConsumerConfig::default())
            .broker(broker, events)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_dead_letter_policy_requires_sink() {
        let config = ConsumerConfig {
            failure_policy: FailurePolicy::DeadLetter,
            ..Default::default()
        };
        let (broker, events) = MemoryBroker::new();
        let result = GroupConsumer::builder(config)
            .broker(broker, events)
            .processor(Arc::new(Accept))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_run_without_assignment_stops_cleanly() {
        let (broker, events) = MemoryBroker::new();
        let consumer = GroupConsumer::builder(ConsumerConfig::default())
            .broker(broker.clone(), events)
            .processor(Arc::new(Accept))
            .poll(10, Duration::from_millis(10))
            .build()
            .unwrap();
        let states = consumer.subscribe_state();
        assert_eq!(*states.borrow(), ConsumerState::Created);

        let (trigger, shutdown) = shutdown::channel();
        let handle = tokio::spawn(consumer.run(shutdown));
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.trigger();

        handle.await.unwrap().unwrap();
        assert_eq!(*states.borrow(), ConsumerState::Closed);
        assert_eq!(broker.close_count(), 1);
    }
}
