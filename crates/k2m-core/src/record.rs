//! Record model shared by the broker, processor and consumer layers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;

/// A topic/partition pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new topic/partition pair.
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Next offset to consume for a partition, as committed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOffset {
    /// Partition
    pub tp: TopicPartition,
    /// Next offset to read (Kafka commit convention)
    pub next_offset: i64,
}

/// Immutable unit of stream data.
///
/// Byte buffers are reference counted so retries and dead-lettering can hold
/// the record without copying.
#[derive(Debug, Clone)]
pub struct Record {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Message key (empty when the producer sent none)
    pub key: Bytes,
    /// Message value (empty for tombstones)
    pub value: Bytes,
    /// Headers in wire order
    pub headers: Vec<(String, Bytes)>,
    /// Producer or log-append timestamp
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// The partition this record belongs to.
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Stable id for idempotent writes: `topic:partition:offset`.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.topic, self.partition, self.offset)
    }

    /// Key as UTF-8, replacing invalid sequences.
    pub fn key_lossy(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    /// Value as UTF-8, replacing invalid sequences.
    pub fn value_lossy(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}
