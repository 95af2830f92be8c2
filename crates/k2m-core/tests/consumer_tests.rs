//! End-to-end tests of the group consumer against the in-memory broker and
//! store.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use k2m_core::config::{CommitPolicy, ConsumerConfig, FailurePolicy, RetryPolicyConfig};
use k2m_core::consumer::ConsumerState;
use k2m_core::health::{ComponentStatus, HealthCheck, COMPONENT_CONSUMER};
use k2m_core::kafka::{CommitCursors, MemoryBroker, RebalanceEvents, RevocationOutcome};
use k2m_core::metrics::{ConsumerMetrics, FailureReason};
use k2m_core::processor::{ChatArchiveProcessor, ProcessContext, ProcessingOutcome, Processor};
use k2m_core::retry::RetryConfig;
use k2m_core::shutdown::{self, ShutdownTrigger};
use k2m_core::sink::{DeadLetterSink, DocumentStore, MemoryStore, StoreDeadLetterSink, StoreSink};
use k2m_core::{
    Error, GroupConsumer, KafkaError, ProcessingError, Record, StoreError, TopicPartition,
};
use mongodb::bson::DateTime as BsonDateTime;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

const COLLECTION: &str = "messages";
const DEAD_LETTERS: &str = "messages_dead_letter";

fn tp(partition: i32) -> TopicPartition {
    TopicPartition::new("t", partition)
}

fn config() -> ConsumerConfig {
    ConsumerConfig {
        commit: CommitPolicy::Interval { interval_ms: 20 },
        retry: RetryPolicyConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: false,
        },
        failure_policy: FailurePolicy::LogAndSkip,
        processing_timeout_ms: 2_000,
        shutdown_grace_ms: 500,
        revocation_grace_ms: 500,
        partition_queue_depth: 4,
    }
}

async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

struct Harness {
    metrics: Arc<ConsumerMetrics>,
    health: Arc<HealthCheck>,
    cursors: Arc<CommitCursors>,
    states: watch::Receiver<ConsumerState>,
    trigger: ShutdownTrigger,
    handle: JoinHandle<k2m_core::Result<()>>,
}

fn quick_retry() -> RetryConfig {
    RetryConfig::new(Duration::from_millis(1), Duration::from_millis(5), 5).without_jitter()
}

impl Harness {
    fn start(
        broker: Arc<MemoryBroker>,
        events: RebalanceEvents,
        config: ConsumerConfig,
        processor: Arc<dyn Processor>,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
    ) -> Self {
        Self::start_with_commit_retry(broker, events, config, processor, dead_letter, quick_retry())
    }

    fn start_with_commit_retry(
        broker: Arc<MemoryBroker>,
        events: RebalanceEvents,
        config: ConsumerConfig,
        processor: Arc<dyn Processor>,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
        commit_retry: RetryConfig,
    ) -> Self {
        let metrics = Arc::new(ConsumerMetrics::new().unwrap());
        let health = Arc::new(HealthCheck::for_consumer());
        let consumer = GroupConsumer::builder(config)
            .broker(broker, events)
            .processor(processor)
            .metrics(metrics.clone())
            .health(health.clone())
            .dead_letter(dead_letter)
            .poll(16, Duration::from_millis(10))
            .poll_retry(quick_retry())
            .commit_retry(commit_retry)
            .build()
            .unwrap();

        let cursors = consumer.cursors();
        let states = consumer.subscribe_state();
        let (trigger, shutdown) = shutdown::channel();
        let handle = tokio::spawn(consumer.run(shutdown));

        Self {
            metrics,
            health,
            cursors,
            states,
            trigger,
            handle,
        }
    }

    async fn stop(self) -> k2m_core::Result<()> {
        self.trigger.trigger();
        self.join().await
    }

    async fn join(self) -> k2m_core::Result<()> {
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("consumer did not stop")
            .expect("consumer task panicked")
    }

    fn state(&self) -> ConsumerState {
        *self.states.borrow()
    }
}

fn archive(store: &Arc<MemoryStore>) -> Arc<dyn Processor> {
    let sink = StoreSink::new(store.clone(), COLLECTION, Duration::from_millis(200));
    Arc::new(ChatArchiveProcessor::new(Arc::new(sink)))
}

/// Records every dispatch and flags concurrent dispatch within a partition.
#[derive(Default)]
struct Recorder {
    started: Mutex<Vec<(i32, i64)>>,
    finished: Mutex<Vec<(i32, i64)>>,
    in_flight: Mutex<HashSet<i32>>,
    overlaps: AtomicUsize,
}

impl Recorder {
    fn enter(&self, record: &Record) {
        if !self.in_flight.lock().insert(record.partition) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.started.lock().push((record.partition, record.offset));
    }

    fn exit(&self, record: &Record, succeeded: bool) {
        self.in_flight.lock().remove(&record.partition);
        if succeeded {
            self.finished.lock().push((record.partition, record.offset));
        }
    }

    fn started_on(&self, partition: i32) -> Vec<i64> {
        offsets_on(&self.started.lock(), partition)
    }

    fn finished_on(&self, partition: i32) -> Vec<i64> {
        offsets_on(&self.finished.lock(), partition)
    }

    fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

fn offsets_on(seen: &[(i32, i64)], partition: i32) -> Vec<i64> {
    seen.iter()
        .filter(|(p, _)| *p == partition)
        .map(|(_, o)| *o)
        .collect()
}

type Behavior = Box<dyn Fn(&Record, u32) -> Option<ProcessingOutcome> + Send + Sync>;

/// Processor whose per-record behavior is scripted by the test.
struct Scripted {
    recorder: Arc<Recorder>,
    gate: Arc<Semaphore>,
    gated: HashSet<(i32, i64)>,
    delay: Duration,
    behavior: Behavior,
    store: Option<Arc<MemoryStore>>,
}

impl Scripted {
    fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            gate: Arc::new(Semaphore::new(0)),
            gated: HashSet::new(),
            delay: Duration::ZERO,
            behavior: Box::new(|_, _| None),
            store: None,
        }
    }

    fn gate_on(mut self, partition: i32, offset: i64) -> Self {
        self.gated.insert((partition, offset));
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn behavior<F>(mut self, behavior: F) -> Self
    where
        F: Fn(&Record, u32) -> Option<ProcessingOutcome> + Send + Sync + 'static,
    {
        self.behavior = Box::new(behavior);
        self
    }

    fn closing(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }
}

#[async_trait]
impl Processor for Scripted {
    async fn handle(&self, ctx: &ProcessContext, record: &Record) -> ProcessingOutcome {
        self.recorder.enter(record);

        if self.gated.contains(&(record.partition, record.offset)) {
            tokio::select! {
                permit = self.gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = ctx.cancelled() => {
                    self.recorder.exit(record, false);
                    return ProcessingOutcome::Retryable(ProcessingError::Transform("abandoned".into()));
                }
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = (self.behavior)(record, ctx.attempt()).unwrap_or(ProcessingOutcome::Success);
        self.recorder.exit(record, outcome.is_success());
        outcome
    }

    async fn close(&self) -> k2m_core::Result<()> {
        if let Some(store) = &self.store {
            store.close().await?;
        }
        Ok(())
    }
}

// === Archiving and commit ===

#[tokio::test]
async fn test_record_is_archived_and_committed() {
    let (broker, events) = MemoryBroker::new();
    let store = Arc::new(MemoryStore::new());
    let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

    broker.produce_record(Record {
        topic: "t".into(),
        partition: 0,
        offset: 5,
        key: Bytes::from_static(b"alice"),
        value: Bytes::from_static(b"hi"),
        headers: vec![("trace-id".into(), Bytes::from_static(b"abc"))],
        timestamp,
    });
    broker.set_committed(&tp(0), 5);

    let harness = Harness::start(broker.clone(), events, config(), archive(&store), None);
    broker.assign(&[tp(0)]);

    eventually("document written", || store.count(COLLECTION) == 1).await;
    eventually("offset committed", || broker.committed(&tp(0)) == Some(6)).await;

    let doc = &store.documents(COLLECTION)[0];
    assert_eq!(doc.get_str("_id").unwrap(), "t:0:5");
    assert_eq!(doc.get_str("author").unwrap(), "alice");
    assert_eq!(doc.get_str("message").unwrap(), "hi");
    assert_eq!(
        doc.get_datetime("timestamp").unwrap(),
        &BsonDateTime::from_millis(timestamp.timestamp_millis())
    );
    assert_eq!(doc.get_array("headers").unwrap().len(), 1);
    assert_eq!(harness.cursors.get(&tp(0)), Some(6));
    assert_eq!(harness.metrics.records_processed(&tp(0)), 1);

    harness.stop().await.unwrap();
}

// === Exhausted retries ===

#[tokio::test]
async fn test_exhausted_sink_timeout_is_skipped() {
    let (broker, events) = MemoryBroker::new();
    let store = Arc::new(MemoryStore::new());
    store.fail_when(|doc| matches!(doc.get_i64("offset"), Ok(7)).then_some(StoreError::Timeout(200)));
    for i in 0..8 {
        broker.produce("t", 0, format!("user-{}", i), "hello");
    }

    let harness = Harness::start(broker.clone(), events, config(), archive(&store), None);
    broker.assign(&[tp(0)]);

    eventually("cursor past skipped record", || broker.committed(&tp(0)) == Some(8)).await;

    assert_eq!(store.count(COLLECTION), 7);
    assert!(store
        .documents(COLLECTION)
        .iter()
        .all(|d| !matches!(d.get_i64("offset"), Ok(7))));
    assert_eq!(store.insert_attempts(), 7 + 4);
    assert_eq!(harness.metrics.records_failed(&tp(0), FailureReason::Exhausted), 1);
    assert_eq!(harness.metrics.records_retried(&tp(0)), 3);

    harness.stop().await.unwrap();
}

// === Revocation ===

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_revocation_drains_in_flight_record_first() {
    let (broker, events) = MemoryBroker::new();
    let recorder = Arc::new(Recorder::default());
    for partition in [0, 2] {
        for _ in 0..4 {
            broker.produce("t", partition, "k", "v");
        }
    }

    let processor = Scripted::new(recorder.clone()).gate_on(2, 1);
    let gate = processor.gate.clone();
    let harness = Harness::start(broker.clone(), events, config(), Arc::new(processor), None);
    broker.assign(&[tp(0), tp(2)]);

    eventually("partition 2 offset 1 in flight", || {
        recorder.started_on(2).contains(&1)
    })
    .await;

    let revoke = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.revoke(&[tp(2)], Duration::from_secs(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!revoke.is_finished(), "revocation acknowledged before drain");
    gate.add_permits(1);

    assert_eq!(revoke.await.unwrap(), RevocationOutcome::Acknowledged);
    assert_eq!(recorder.finished_on(2), vec![0, 1]);
    assert_eq!(broker.committed(&tp(2)), Some(2));
    assert!(!harness.cursors.contains(&tp(2)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.started_on(2), vec![0, 1], "revoked partition dispatched");
    eventually("partition 0 unaffected", || broker.committed(&tp(0)) == Some(4)).await;

    broker.assign(&[tp(2)]);
    eventually("reassigned partition resumes", || {
        broker.committed(&tp(2)) == Some(4)
    })
    .await;
    assert_eq!(recorder.started_on(2), vec![0, 1, 2, 3]);
    assert_eq!(harness.state(), ConsumerState::Polling);

    harness.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_revocation_abandons_stuck_record_after_grace() {
    let (broker, events) = MemoryBroker::new();
    let recorder = Arc::new(Recorder::default());
    broker.produce("t", 0, "k", "v");
    broker.produce("t", 0, "k", "v");

    let mut config = config();
    config.revocation_grace_ms = 50;
    let processor = Scripted::new(recorder.clone()).gate_on(0, 1);
    let harness = Harness::start(broker.clone(), events, config, Arc::new(processor), None);
    broker.assign(&[tp(0)]);

    eventually("offset 1 in flight", || recorder.started_on(0).contains(&1)).await;

    let outcome = broker.revoke(&[tp(0)], Duration::from_secs(2)).await;
    assert_eq!(outcome, RevocationOutcome::Acknowledged);
    assert_eq!(broker.committed(&tp(0)), Some(1));
    assert_eq!(recorder.finished_on(0), vec![0]);

    harness.stop().await.unwrap();
}

// === Shutdown ===

#[tokio::test]
async fn test_shutdown_finishes_or_abandons_in_flight_work() {
    let (broker, events) = MemoryBroker::new();
    let recorder = Arc::new(Recorder::default());
    let store = Arc::new(MemoryStore::new());
    for partition in 0..3 {
        broker.produce("t", partition, "k", "v");
    }

    let processor = Scripted::new(recorder.clone())
        .gate_on(2, 0)
        .delay(Duration::from_millis(200))
        .closing(store.clone());
    let harness = Harness::start(broker.clone(), events, config(), Arc::new(processor), None);
    broker.assign(&[tp(0), tp(1), tp(2)]);

    eventually("three records in flight", || recorder.in_flight() == 3).await;
    let states = harness.states.clone();
    harness.stop().await.unwrap();

    assert_eq!(broker.committed(&tp(0)), Some(1));
    assert_eq!(broker.committed(&tp(1)), Some(1));
    assert_eq!(broker.committed(&tp(2)), None);
    assert_eq!(recorder.finished_on(2), Vec::<i64>::new());
    assert_eq!(broker.close_count(), 1);
    assert_eq!(store.close_count(), 1);
    assert_eq!(*states.borrow(), ConsumerState::Closed);

    let polls = broker.poll_count();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(broker.poll_count(), polls);
}

// === Ordering, redelivery, commit safety, isolation ===

#[tokio::test]
async fn test_partition_order_and_single_dispatch() {
    let (broker, events) = MemoryBroker::new();
    let recorder = Arc::new(Recorder::default());
    for i in 0..40 {
        broker.produce("t", 0, "k", format!("a-{}", i));
        broker.produce("t", 1, "k", format!("b-{}", i));
    }

    let processor = Scripted::new(recorder.clone()).behavior(|record, attempt| {
        // Every fifth record succeeds only on its second attempt.
        (record.offset % 5 == 0 && attempt == 1).then(|| {
            ProcessingOutcome::Retryable(ProcessingError::Sink(StoreError::Network("blip".into())))
        })
    });
    let harness = Harness::start(broker.clone(), events, config(), Arc::new(processor), None);
    broker.assign(&[tp(0), tp(1)]);

    eventually("both partitions committed", || {
        broker.committed(&tp(0)) == Some(40) && broker.committed(&tp(1)) == Some(40)
    })
    .await;

    let expected: Vec<i64> = (0..40).collect();
    for partition in [0, 1] {
        assert_eq!(recorder.finished_on(partition), expected);
        let started = recorder.started_on(partition);
        assert!(started.windows(2).all(|w| w[0] <= w[1]), "out of order: {:?}", started);
    }
    assert_eq!(recorder.overlaps.load(Ordering::SeqCst), 0);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_redelivery_after_crash_converges() {
    let (broker, events) = MemoryBroker::new();
    let store = Arc::new(MemoryStore::new());
    for i in 0..6 {
        broker.produce("t", 0, "bob", format!("message {}", i));
    }

    let mut config = config();
    config.commit = CommitPolicy::EveryRecords { count: 1_000 };

    let first = Harness::start(broker.clone(), events, config.clone(), archive(&store), None);
    broker.assign(&[tp(0)]);
    eventually("first run wrote everything", || store.count(COLLECTION) == 6).await;

    // Crash: no final commit, no cleanup.
    first.handle.abort();
    let _ = first.handle.await;
    // Inner tasks are torn down asynchronously after the outer abort.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.committed(&tp(0)), None);

    let events = broker.restart();
    let second = Harness::start(broker.clone(), events, config, archive(&store), None);
    broker.assign(&[tp(0)]);

    eventually("redelivered records handled", || {
        second.metrics.records_processed(&tp(0)) == 6
    })
    .await;
    assert_eq!(store.count(COLLECTION), 6);
    assert_eq!(store.insert_attempts(), 12);

    second.stop().await.unwrap();
    assert_eq!(broker.committed(&tp(0)), Some(6));
}

#[tokio::test]
async fn test_commit_never_passes_unfinished_record() {
    let (broker, events) = MemoryBroker::new();
    let recorder = Arc::new(Recorder::default());
    for _ in 0..6 {
        broker.produce("t", 0, "k", "v");
    }

    let processor = Scripted::new(recorder.clone()).gate_on(0, 3);
    let gate = processor.gate.clone();
    let harness = Harness::start(broker.clone(), events, config(), Arc::new(processor), None);
    broker.assign(&[tp(0)]);

    eventually("offset 3 in flight", || recorder.started_on(0).contains(&3)).await;
    eventually("completed prefix committed", || broker.committed(&tp(0)) == Some(3)).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(broker.committed(&tp(0)), Some(3));
    assert_eq!(harness.cursors.get(&tp(0)), Some(3));

    gate.add_permits(1);
    eventually("remaining records committed", || broker.committed(&tp(0)) == Some(6)).await;

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_fatal_record_halts_only_its_partition() {
    let (broker, events) = MemoryBroker::new();
    let recorder = Arc::new(Recorder::default());
    for _ in 0..5 {
        broker.produce("t", 0, "k", "v");
        broker.produce("t", 1, "k", "v");
    }

    let processor = Scripted::new(recorder.clone()).behavior(|record, _| {
        (record.partition == 0 && record.offset == 2)
            .then(|| ProcessingOutcome::Fatal(ProcessingError::Transform("unparseable".into())))
    });
    let harness = Harness::start(broker.clone(), events, config(), Arc::new(processor), None);
    broker.assign(&[tp(0), tp(1)]);

    eventually("healthy partition committed", || broker.committed(&tp(1)) == Some(5)).await;
    eventually("failed partition halted", || broker.is_paused(&tp(0))).await;

    assert_eq!(recorder.started_on(0), vec![0, 1, 2]);
    eventually("halted prefix committed", || broker.committed(&tp(0)) == Some(2)).await;
    assert_eq!(harness.metrics.records_failed(&tp(0), FailureReason::Fatal), 1);
    assert!(matches!(
        harness.health.get_component_status(COMPONENT_CONSUMER),
        Some(ComponentStatus::Degraded(_))
    ));

    harness.stop().await.unwrap();
}

// === Failure policy, commit cadence, backpressure, broker errors ===

#[tokio::test]
async fn test_exhausted_record_is_dead_lettered() {
    let (broker, events) = MemoryBroker::new();
    let store = Arc::new(MemoryStore::new());
    store.fail_when(|doc| {
        (matches!(doc.get_i64("offset"), Ok(1)) && !doc.contains_key("reason"))
            .then(|| StoreError::Network("connection reset".into()))
    });
    for _ in 0..3 {
        broker.produce("t", 0, "carol", "hey");
    }

    let mut config = config();
    config.failure_policy = FailurePolicy::DeadLetter;
    let dead_letter: Arc<dyn DeadLetterSink> = Arc::new(StoreDeadLetterSink::new(
        store.clone(),
        DEAD_LETTERS,
        Duration::from_millis(200),
    ));
    let harness = Harness::start(broker.clone(), events, config, archive(&store), Some(dead_letter));
    broker.assign(&[tp(0)]);

    eventually("all offsets committed", || broker.committed(&tp(0)) == Some(3)).await;

    assert_eq!(store.count(COLLECTION), 2);
    let letters = store.documents(DEAD_LETTERS);
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].get_str("_id").unwrap(), "t:0:1");
    assert_eq!(letters[0].get_i64("attempts").unwrap(), 4);
    assert!(letters[0].get_str("reason").unwrap().contains("connection reset"));
    assert_eq!(harness.metrics.records_failed(&tp(0), FailureReason::DeadLettered), 1);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_per_record_commit_policy() {
    let (broker, events) = MemoryBroker::new();
    let recorder = Arc::new(Recorder::default());
    for _ in 0..3 {
        broker.produce("t", 0, "k", "v");
    }

    let mut config = config();
    config.commit = CommitPolicy::PerRecord;
    let harness = Harness::start(
        broker.clone(),
        events,
        config,
        Arc::new(Scripted::new(recorder)),
        None,
    );
    broker.assign(&[tp(0)]);

    eventually("all committed", || broker.committed(&tp(0)) == Some(3)).await;
    let history: Vec<i64> = broker
        .commit_history()
        .iter()
        .flat_map(|commit| commit.iter().map(|po| po.next_offset))
        .collect();
    assert_eq!(history, vec![1, 2, 3]);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_every_records_commit_policy() {
    let (broker, events) = MemoryBroker::new();
    let recorder = Arc::new(Recorder::default());
    for _ in 0..5 {
        broker.produce("t", 0, "k", "v");
    }

    let mut config = config();
    config.commit = CommitPolicy::EveryRecords { count: 2 };
    let harness = Harness::start(
        broker.clone(),
        events,
        config,
        Arc::new(Scripted::new(recorder.clone())),
        None,
    );
    broker.assign(&[tp(0)]);

    eventually("all processed", || recorder.finished_on(0).len() == 5).await;
    eventually("threshold commit", || broker.committed(&tp(0)) >= Some(4)).await;
    harness.stop().await.unwrap();

    assert_eq!(broker.committed(&tp(0)), Some(5));
    let commits = broker.commit_history().len();
    assert!((1..=3).contains(&commits), "unexpected commit count {}", commits);
}

#[tokio::test]
async fn test_full_partition_queue_pauses_fetch() {
    let (broker, events) = MemoryBroker::new();
    let recorder = Arc::new(Recorder::default());
    for _ in 0..12 {
        broker.produce("t", 0, "k", "v");
    }

    let mut config = config();
    config.partition_queue_depth = 1;
    let processor = Scripted::new(recorder.clone()).gate_on(0, 0);
    let gate = processor.gate.clone();
    let harness = Harness::start(broker.clone(), events, config, Arc::new(processor), None);
    broker.assign(&[tp(0)]);

    eventually("partition paused", || broker.is_paused(&tp(0))).await;
    gate.add_permits(1);

    eventually("all committed", || broker.committed(&tp(0)) == Some(12)).await;
    assert!(!broker.is_paused(&tp(0)));
    assert_eq!(recorder.finished_on(0), (0..12).collect::<Vec<_>>());

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_processing_timeout_is_retried() {
    let (broker, events) = MemoryBroker::new();
    broker.produce("t", 0, "k", "v");

    struct SlowFirstAttempt;

    #[async_trait]
    impl Processor for SlowFirstAttempt {
        async fn handle(&self, ctx: &ProcessContext, _record: &Record) -> ProcessingOutcome {
            if ctx.attempt() == 1 {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            ProcessingOutcome::Success
        }
    }

    let mut config = config();
    config.processing_timeout_ms = 50;
    let harness = Harness::start(broker.clone(), events, config, Arc::new(SlowFirstAttempt), None);
    broker.assign(&[tp(0)]);

    eventually("record committed", || broker.committed(&tp(0)) == Some(1)).await;
    assert_eq!(harness.metrics.records_retried(&tp(0)), 1);
    assert_eq!(harness.metrics.records_processed(&tp(0)), 1);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_transient_poll_errors_are_retried() {
    let (broker, events) = MemoryBroker::new();
    let recorder = Arc::new(Recorder::default());
    broker.produce("t", 0, "k", "v");
    broker.fail_next_poll(KafkaError::Poll("broker transport failure".into()));
    broker.fail_next_poll(KafkaError::Poll("broker transport failure".into()));

    let harness = Harness::start(
        broker.clone(),
        events,
        config(),
        Arc::new(Scripted::new(recorder.clone())),
        None,
    );
    broker.assign(&[tp(0)]);

    eventually("record committed", || broker.committed(&tp(0)) == Some(1)).await;
    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_fatal_broker_error_stops_consumer() {
    let (broker, events) = MemoryBroker::new();
    let recorder = Arc::new(Recorder::default());
    let store = Arc::new(MemoryStore::new());
    broker.fail_next_poll(KafkaError::Authentication("SASL authentication failed".into()));

    let harness = Harness::start(
        broker.clone(),
        events,
        config(),
        Arc::new(Scripted::new(recorder).closing(store.clone())),
        None,
    );
    let states = harness.states.clone();

    let err = harness.join().await.unwrap_err();
    assert!(matches!(err, Error::Kafka(KafkaError::Authentication(_))));
    assert!(err.is_fatal());
    assert_eq!(*states.borrow(), ConsumerState::Closed);
    assert_eq!(broker.close_count(), 1);
    assert_eq!(store.close_count(), 1);
}

// === Commits stuck in backoff ===

/// Commit retry slow enough that a failing commit is still backing off
/// when the test acts.
fn slow_commit_retry() -> RetryConfig {
    RetryConfig::new(Duration::from_millis(200), Duration::from_secs(2), 10).without_jitter()
}

fn failing_commits(broker: &MemoryBroker, count: usize) {
    for _ in 0..count {
        broker.fail_next_commit(KafkaError::OffsetCommit("coordinator loading".into()));
    }
}

#[tokio::test]
async fn test_shutdown_during_commit_backoff_stops_cleanly() {
    let (broker, events) = MemoryBroker::new();
    let recorder = Arc::new(Recorder::default());
    broker.produce("t", 0, "k", "v");
    failing_commits(&broker, 20);

    let harness = Harness::start_with_commit_retry(
        broker.clone(),
        events,
        config(),
        Arc::new(Scripted::new(recorder.clone())),
        None,
        slow_commit_retry(),
    );
    broker.assign(&[tp(0)]);

    eventually("record handled", || recorder.finished_on(0) == vec![0]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.committed(&tp(0)), None);

    let started = tokio::time::Instant::now();
    let states = harness.states.clone();
    let result = harness.stop().await;
    assert!(result.is_ok(), "stop mid-retry returned {:?}", result);
    assert!(
        started.elapsed() < Duration::from_millis(1_500),
        "stop took {:?}",
        started.elapsed()
    );
    assert_eq!(*states.borrow(), ConsumerState::Closed);
    assert_eq!(broker.close_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_revocation_during_commit_backoff_is_acknowledged() {
    let (broker, events) = MemoryBroker::new();
    let recorder = Arc::new(Recorder::default());
    broker.produce("t", 0, "k", "v");
    broker.produce("t", 1, "k", "v");
    failing_commits(&broker, 20);

    let harness = Harness::start_with_commit_retry(
        broker.clone(),
        events,
        config(),
        Arc::new(Scripted::new(recorder.clone())),
        None,
        slow_commit_retry(),
    );
    broker.assign(&[tp(0), tp(1)]);

    eventually("records handled", || {
        recorder.finished_on(0) == vec![0] && recorder.finished_on(1) == vec![0]
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = tokio::time::Instant::now();
    let outcome = broker.revoke(&[tp(0)], Duration::from_secs(3)).await;
    assert_eq!(outcome, RevocationOutcome::Acknowledged);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "revocation took {:?}",
        started.elapsed()
    );
    assert!(!harness.cursors.contains(&tp(0)));
    assert!(harness.cursors.contains(&tp(1)));

    harness.stop().await.unwrap();
}
