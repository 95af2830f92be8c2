//! rdkafka-backed broker client.
//!
//! Uses the CooperativeSticky assignor for minimal rebalance disruption and
//! manual offset commits, so an offset is only committed once the record has
//! been handled.
//!
//! Revocations are announced from librdkafka's rebalance callback, which then
//! blocks until the group consumer acknowledges that the revoked partitions
//! are drained. The callback runs on the task that polls the stream, so the
//! runtime must be multi-threaded.

use super::{AssignedPartition, BrokerClient, RebalanceEvent, RebalanceEvents, RevocationAck, RevocationOutcome};
use crate::config::{KafkaConfig, OffsetReset};
use crate::record::{PartitionOffset, Record, TopicPartition};
use crate::{Error, KafkaError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError as RdKafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Extra time the rebalance callback waits beyond the revocation grace period.
const REVOCATION_WAIT_MARGIN: Duration = Duration::from_secs(2);

/// Consumer context that forwards rebalances to the group consumer.
struct RebalanceContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
    revocation_wait: Duration,
    closing: Arc<AtomicBool>,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                if self.closing.load(Ordering::SeqCst) {
                    return;
                }
                let partitions = partitions_of(tpl);
                if partitions.is_empty() {
                    return;
                }
                info!(partitions = ?partitions, "Partition revocation requested");

                let (ack, waiter) = RevocationAck::pair();
                if self
                    .events
                    .send(RebalanceEvent::Revoked { partitions, ack })
                    .is_err()
                {
                    return;
                }

                match waiter.wait_blocking(self.revocation_wait) {
                    RevocationOutcome::Acknowledged => debug!("Revocation acknowledged"),
                    RevocationOutcome::Released => debug!("Revocation released without drain"),
                    RevocationOutcome::TimedOut => warn!(
                        wait_ms = self.revocation_wait.as_millis() as u64,
                        "Revocation not acknowledged in time, completing rebalance"
                    ),
                }
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(err) => {
                error!(error = %err, "Rebalance error");
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let assigned: Vec<AssignedPartition> = tpl
                    .elements()
                    .iter()
                    .map(|elem| AssignedPartition {
                        tp: TopicPartition::new(elem.topic(), elem.partition()),
                        committed: match elem.offset() {
                            Offset::Offset(n) => Some(n),
                            _ => None,
                        },
                    })
                    .collect();
                if assigned.is_empty() {
                    return;
                }
                info!(count = assigned.len(), "Partitions assigned");
                let _ = self.events.send(RebalanceEvent::Assigned(assigned));
            }
            Rebalance::Revoke(_) => {
                debug!("Partitions revoked");
            }
            Rebalance::Error(err) => {
                error!(error = %err, "Post-rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(err) = result {
            warn!(error = %err, "Commit callback error");
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

fn partition_list(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for tp in partitions {
        tpl.add_partition(&tp.topic, tp.partition);
    }
    tpl
}

/// Map an rdkafka error onto the fatal/transient split.
fn classify(err: RdKafkaError, wrap: impl FnOnce(String) -> KafkaError) -> Error {
    let kafka_error = match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed,
        ) => KafkaError::Authentication(err.to_string()),
        Some(RDKafkaErrorCode::Fatal) => KafkaError::Fatal(err.to_string()),
        _ => wrap(err.to_string()),
    };
    Error::Kafka(kafka_error)
}

/// Fatal poll error held back so a partial batch can be delivered first.
#[derive(Default)]
struct DeferredError {
    slot: Mutex<Option<Error>>,
}

impl DeferredError {
    /// Keep `err` for the next poll if it is fatal. Returns whether it was kept.
    fn defer(&self, err: Error) -> bool {
        if !err.is_fatal() {
            return false;
        }
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        true
    }

    fn take(&self) -> Option<Error> {
        self.slot.lock().take()
    }
}

/// Builder for creating a Kafka broker client.
pub struct KafkaBrokerBuilder {
    config: KafkaConfig,
    revocation_grace: Duration,
}

impl KafkaBrokerBuilder {
    /// Create a new builder.
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            revocation_grace: Duration::from_secs(5),
        }
    }

    /// How long the consumer may take to drain revoked partitions.
    pub fn with_revocation_grace(mut self, grace: Duration) -> Self {
        self.revocation_grace = grace;
        self
    }

    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", self.config.bootstrap_servers.join(","))
            .set("group.id", &self.config.consumer_group)
            .set("enable.auto.commit", "false")
            .set(
                "auto.offset.reset",
                match self.config.auto_offset_reset {
                    OffsetReset::Earliest => "earliest",
                    OffsetReset::Latest => "latest",
                },
            )
            .set(
                "session.timeout.ms",
                self.config.session_timeout_ms.to_string(),
            )
            .set(
                "heartbeat.interval.ms",
                self.config.heartbeat_interval_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                self.config.max_poll_interval_ms.to_string(),
            )
            .set("partition.assignment.strategy", "cooperative-sticky")
            .set("enable.auto.offset.store", "false");

        let security = &self.config.security;
        if let Some(ref protocol) = security.protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = security.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = security.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(ref password) = security.sasl_password {
            client_config.set("sasl.password", password);
        }
        if let Some(ref path) = security.ssl_ca_location {
            client_config.set("ssl.ca.location", path.to_string_lossy().as_ref());
        }
        if let Some(ref path) = security.ssl_cert_location {
            client_config.set("ssl.certificate.location", path.to_string_lossy().as_ref());
        }
        if let Some(ref path) = security.ssl_key_location {
            client_config.set("ssl.key.location", path.to_string_lossy().as_ref());
        }

        client_config
    }

    /// Create the client and subscribe to the configured topics.
    pub fn build(self) -> Result<(KafkaBroker, RebalanceEvents)> {
        let brokers = self.config.bootstrap_servers.join(",");
        let (events_tx, events) = RebalanceEvents::channel();
        let closing = Arc::new(AtomicBool::new(false));
        let context = RebalanceContext {
            events: events_tx,
            revocation_wait: self.revocation_grace + REVOCATION_WAIT_MARGIN,
            closing: Arc::clone(&closing),
        };

        let consumer: StreamConsumer<RebalanceContext> = self
            .client_config()
            .create_with_context(context)
            .map_err(|e| {
                Error::Kafka(KafkaError::ConnectionFailed {
                    broker: brokers.clone(),
                    message: e.to_string(),
                })
            })?;

        let topics: Vec<&str> = self.config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| classify(e, KafkaError::ConsumerGroup))?;

        info!(
            topics = ?self.config.topics,
            group = %self.config.consumer_group,
            servers = %brokers,
            "Kafka consumer subscribed"
        );

        Ok((
            KafkaBroker {
                consumer: Arc::new(consumer),
                brokers,
                metadata_timeout: Duration::from_millis(u64::from(self.config.session_timeout_ms)),
                closing,
                deferred: DeferredError::default(),
            },
            events,
        ))
    }

    /// Build the client and verify the cluster is reachable.
    pub async fn connect(self) -> Result<(KafkaBroker, RebalanceEvents)> {
        let (broker, events) = self.build()?;
        broker.verify_connection().await?;
        Ok((broker, events))
    }
}

/// Kafka broker client.
pub struct KafkaBroker {
    consumer: Arc<StreamConsumer<RebalanceContext>>,
    brokers: String,
    metadata_timeout: Duration,
    closing: Arc<AtomicBool>,
    deferred: DeferredError,
}

impl KafkaBroker {
    /// Fetch cluster metadata, failing if no broker answers.
    pub async fn verify_connection(&self) -> Result<()> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.metadata_timeout;
        let metadata = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(None, timeout)
                .map(|m| m.brokers().len())
        })
        .await?;

        match metadata {
            Ok(count) => {
                info!(brokers = count, "Kafka cluster reachable");
                Ok(())
            }
            Err(e) => Err(Error::Kafka(KafkaError::ConnectionFailed {
                broker: self.brokers.clone(),
                message: e.to_string(),
            })),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::Kafka(KafkaError::ConsumerClosed));
        }
        Ok(())
    }

    /// Convert a borrowed message to an owned record.
    fn convert_message(msg: &BorrowedMessage<'_>) -> Record {
        let timestamp = msg
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Record {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(Bytes::copy_from_slice).unwrap_or_default(),
            value: msg.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
            headers: Self::extract_headers(msg),
            timestamp,
        }
    }

    fn extract_headers(msg: &BorrowedMessage<'_>) -> Vec<(String, Bytes)> {
        msg.headers()
            .map(|headers| {
                (0..headers.count())
                    .map(|i| {
                        let header = headers.get(i);
                        (
                            header.key.to_string(),
                            Bytes::copy_from_slice(header.value.unwrap_or(&[])),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Vec<Record>> {
        use futures::StreamExt;

        self.ensure_open()?;
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }

        let mut batch = Vec::with_capacity(max_records);
        let deadline = tokio::time::Instant::now() + timeout;
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        while batch.len() < max_records {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(Ok(msg))) => batch.push(Self::convert_message(&msg)),
                Ok(Some(Err(e))) => {
                    let err = classify(e, KafkaError::Poll);
                    if batch.is_empty() {
                        return Err(err);
                    }
                    let message = err.to_string();
                    if self.deferred.defer(err) {
                        warn!(error = %message, records = batch.len(), "Fatal poll error after partial batch, reporting on next poll");
                    } else {
                        warn!(error = %message, records = batch.len(), "Poll error after partial batch");
                    }
                    break;
                }
                Ok(None) | Err(_) => break,
            }
        }

        Ok(batch)
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for po in offsets {
            tpl.add_partition_offset(&po.tp.topic, po.tp.partition, Offset::Offset(po.next_offset))
                .map_err(|e| classify(e, KafkaError::OffsetCommit))?;
        }

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await?
            .map_err(|e| classify(e, KafkaError::OffsetCommit))?;

        debug!(offsets = ?offsets, "Offsets committed");
        Ok(())
    }

    async fn committed_offsets(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<Vec<(TopicPartition, Option<i64>)>> {
        let tpl = partition_list(partitions);
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.metadata_timeout;

        let committed = tokio::task::spawn_blocking(move || consumer.committed_offsets(tpl, timeout))
            .await?
            .map_err(|e| classify(e, KafkaError::PartitionAssignment))?;

        Ok(committed
            .elements()
            .iter()
            .map(|elem| {
                let offset = match elem.offset() {
                    Offset::Offset(n) => Some(n),
                    _ => None,
                };
                (TopicPartition::new(elem.topic(), elem.partition()), offset)
            })
            .collect())
    }

    fn pause(&self, partitions: &[TopicPartition]) -> Result<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer
            .pause(&partition_list(partitions))
            .map_err(|e| classify(e, KafkaError::PartitionAssignment))?;
        debug!(partitions = ?partitions, "Partitions paused");
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer
            .resume(&partition_list(partitions))
            .map_err(|e| classify(e, KafkaError::PartitionAssignment))?;
        debug!(partitions = ?partitions, "Partitions resumed");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.consumer.unsubscribe();
        info!(servers = %self.brokers, "Kafka consumer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_list_roundtrip() {
        let partitions = vec![TopicPartition::new("a", 0), TopicPartition::new("b", 3)];
        let tpl = partition_list(&partitions);
        assert_eq!(tpl.count(), 2);
        assert_eq!(partitions_of(&tpl), partitions);
    }

    #[test]
    fn test_classify_authentication_is_fatal() {
        let err = classify(
            RdKafkaError::MessageConsumption(RDKafkaErrorCode::SaslAuthenticationFailed),
            KafkaError::Poll,
        );
        assert!(matches!(err, Error::Kafka(KafkaError::Authentication(_))));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_classify_transient_uses_wrapper() {
        let err = classify(
            RdKafkaError::MessageConsumption(RDKafkaErrorCode::BrokerTransportFailure),
            KafkaError::Poll,
        );
        assert!(matches!(err, Error::Kafka(KafkaError::Poll(_))));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_error_is_deferred_once() {
        let deferred = DeferredError::default();
        assert!(!deferred.defer(Error::Kafka(KafkaError::Poll("broker transport".into()))));
        assert!(deferred.take().is_none());

        assert!(deferred.defer(Error::Kafka(KafkaError::Authentication("denied".into()))));
        assert!(deferred.defer(Error::Kafka(KafkaError::Fatal("fenced".into()))));
        assert!(matches!(
            deferred.take(),
            Some(Error::Kafka(KafkaError::Authentication(_)))
        ));
        assert!(deferred.take().is_none());
    }

    #[tokio::test]
    async fn test_build_with_unreachable_broker_does_not_fail_eagerly() {
        let config = KafkaConfig {
            bootstrap_servers: vec!["127.0.0.1:1".to_string()],
            ..KafkaConfig::default()
        };
        let built = KafkaBrokerBuilder::new(config)
            .with_revocation_grace(Duration::from_millis(100))
            .build();
        assert!(built.is_ok());
    }
}
