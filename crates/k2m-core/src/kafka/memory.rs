//! In-memory broker for tests and dry runs.
//!
//! Partitions are append-only logs. Assignment, revocation and failures are
//! driven explicitly by the caller, so consumer behavior can be exercised
//! deterministically without a cluster.

use super::{
    AssignedPartition, BrokerClient, RebalanceEvent, RebalanceEvents, RevocationAck,
    RevocationOutcome,
};
use crate::record::{PartitionOffset, Record, TopicPartition};
use crate::{Error, KafkaError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

#[derive(Default)]
struct PartitionLog {
    records: Vec<Record>,
    /// Index of the next record to deliver
    position: usize,
}

#[derive(Default)]
struct MemoryState {
    logs: BTreeMap<TopicPartition, PartitionLog>,
    assigned: HashSet<TopicPartition>,
    paused: HashSet<TopicPartition>,
    committed: HashMap<TopicPartition, i64>,
    commit_log: Vec<Vec<PartitionOffset>>,
    poll_errors: VecDeque<KafkaError>,
    commit_errors: VecDeque<KafkaError>,
    closed: bool,
}

impl MemoryState {
    fn rewind_to_committed(&mut self, tp: &TopicPartition) -> Option<i64> {
        let committed = self.committed.get(tp).copied();
        let log = self.logs.entry(tp.clone()).or_default();
        log.position = match committed {
            Some(next) => log.records.partition_point(|r| r.offset < next),
            None => 0,
        };
        committed
    }
}

/// Scriptable in-memory broker.
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    events: Mutex<mpsc::UnboundedSender<RebalanceEvent>>,
    notify: Notify,
    polls: AtomicUsize,
    closes: AtomicUsize,
}

impl MemoryBroker {
    /// Create an empty broker and its rebalance event stream.
    pub fn new() -> (Arc<Self>, RebalanceEvents) {
        let (tx, events) = RebalanceEvents::channel();
        let broker = Arc::new(Self {
            state: Mutex::new(MemoryState::default()),
            events: Mutex::new(tx),
            notify: Notify::new(),
            polls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        (broker, events)
    }

    /// Append a record with the next offset of its partition.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> i64 {
        let mut state = self.state.lock();
        let log = state
            .logs
            .entry(TopicPartition::new(topic, partition))
            .or_default();
        let offset = log.records.last().map(|r| r.offset + 1).unwrap_or(0);
        log.records.push(Record {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.into(),
            value: value.into(),
            headers: Vec::new(),
            timestamp: Utc::now(),
        });
        drop(state);
        self.notify.notify_one();
        offset
    }

    /// Append a fully specified record. Offsets must increase per partition.
    pub fn produce_record(&self, record: Record) {
        let mut state = self.state.lock();
        state
            .logs
            .entry(record.topic_partition())
            .or_default()
            .records
            .push(record);
        drop(state);
        self.notify.notify_one();
    }

    /// Set the committed offset the broker reports on assignment.
    pub fn set_committed(&self, tp: &TopicPartition, next_offset: i64) {
        self.state.lock().committed.insert(tp.clone(), next_offset);
    }

    /// Assign partitions to the consumer, rewinding each to its committed
    /// offset.
    pub fn assign(&self, partitions: &[TopicPartition]) {
        let mut assigned = Vec::with_capacity(partitions.len());
        {
            let mut state = self.state.lock();
            for tp in partitions {
                if !state.assigned.insert(tp.clone()) {
                    continue;
                }
                state.paused.remove(tp);
                let committed = state.rewind_to_committed(tp);
                assigned.push(AssignedPartition {
                    tp: tp.clone(),
                    committed,
                });
            }
        }
        if assigned.is_empty() {
            return;
        }
        debug!(partitions = ?assigned, "Memory broker assigning partitions");
        let _ = self.events.lock().send(RebalanceEvent::Assigned(assigned));
        self.notify.notify_one();
    }

    /// Revoke partitions and wait for the consumer to acknowledge.
    ///
    /// Revoked partitions stop delivering immediately, the way a real client
    /// does not fetch while its rebalance callback runs.
    pub async fn revoke(&self, partitions: &[TopicPartition], wait: Duration) -> RevocationOutcome {
        {
            let mut state = self.state.lock();
            for tp in partitions {
                state.assigned.remove(tp);
                state.paused.remove(tp);
            }
        }

        let (ack, waiter) = RevocationAck::pair();
        let event = RebalanceEvent::Revoked {
            partitions: partitions.to_vec(),
            ack,
        };
        if self.events.lock().send(event).is_err() {
            return RevocationOutcome::Released;
        }
        waiter.wait(wait).await
    }

    /// Forget the previous member: unassign everything, rewind to committed
    /// offsets and open a fresh event stream. Simulates a process restart.
    pub fn restart(&self) -> RebalanceEvents {
        let (tx, events) = RebalanceEvents::channel();
        let mut state = self.state.lock();
        let tps: Vec<TopicPartition> = state.logs.keys().cloned().collect();
        for tp in &tps {
            state.rewind_to_committed(tp);
        }
        state.assigned.clear();
        state.paused.clear();
        state.closed = false;
        *self.events.lock() = tx;
        events
    }

    /// Fail the next poll with `error`.
    pub fn fail_next_poll(&self, error: KafkaError) {
        self.state.lock().poll_errors.push_back(error);
        self.notify.notify_one();
    }

    /// Fail the next commit with `error`.
    pub fn fail_next_commit(&self, error: KafkaError) {
        self.state.lock().commit_errors.push_back(error);
    }

    /// Committed next-offset for a partition.
    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.state.lock().committed.get(tp).copied()
    }

    /// Every successful commit call, in order.
    pub fn commit_history(&self) -> Vec<Vec<PartitionOffset>> {
        self.state.lock().commit_log.clone()
    }

    /// Whether fetching is paused for a partition.
    pub fn is_paused(&self, tp: &TopicPartition) -> bool {
        self.state.lock().paused.contains(tp)
    }

    /// Whether a partition is currently assigned.
    pub fn is_assigned(&self, tp: &TopicPartition) -> bool {
        self.state.lock().assigned.contains(tp)
    }

    /// Number of poll calls so far.
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Number of close calls so far.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn take_batch(&self, max_records: usize) -> Result<Vec<Record>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Kafka(KafkaError::ConsumerClosed));
        }
        if let Some(err) = state.poll_errors.pop_front() {
            return Err(Error::Kafka(err));
        }

        let MemoryState {
            logs,
            assigned,
            paused,
            ..
        } = &mut *state;

        let mut batch = Vec::new();
        for (tp, log) in logs.iter_mut() {
            if !assigned.contains(tp) || paused.contains(tp) {
                continue;
            }
            while batch.len() < max_records && log.position < log.records.len() {
                batch.push(log.records[log.position].clone());
                log.position += 1;
            }
            if batch.len() >= max_records {
                break;
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Vec<Record>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            let batch = self.take_batch(max_records)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.commit_errors.pop_front() {
            return Err(Error::Kafka(err));
        }
        for po in offsets {
            let entry = state.committed.entry(po.tp.clone()).or_insert(po.next_offset);
            *entry = (*entry).max(po.next_offset);
        }
        state.commit_log.push(offsets.to_vec());
        Ok(())
    }

    async fn committed_offsets(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<Vec<(TopicPartition, Option<i64>)>> {
        let state = self.state.lock();
        Ok(partitions
            .iter()
            .map(|tp| (tp.clone(), state.committed.get(tp).copied()))
            .collect())
    }

    fn pause(&self, partitions: &[TopicPartition]) -> Result<()> {
        let mut state = self.state.lock();
        for tp in partitions {
            state.paused.insert(tp.clone());
        }
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<()> {
        let mut state = self.state.lock();
        for tp in partitions {
            state.paused.remove(tp);
        }
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.state.lock().closed = true;
        self.notify.notify_one();
        Ok(())
    }
}
