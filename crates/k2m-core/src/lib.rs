//! K2M Core - Kafka to MongoDB record delivery
//!
//! This library consumes records from Kafka topics as a member of a consumer
//! group and hands each one to a processor that writes it to a document
//! store, with:
//!
//! - At-least-once delivery with idempotent writes
//! - Strict per-partition ordering, independent progress across partitions
//! - Cooperative rebalance handling that drains revoked partitions first
//! - Bounded retries, dead-lettering and graceful shutdown

pub mod config;
pub mod consumer;
pub mod error;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod processor;
pub mod record;
pub mod retry;
pub mod shutdown;
pub mod sink;

// Re-export commonly used types
pub use config::Config;
pub use consumer::{ConsumerState, GroupConsumer};
pub use error::{Error, Result};
pub use error::{KafkaError, ProcessingError, StoreError};
pub use record::{Record, TopicPartition};
