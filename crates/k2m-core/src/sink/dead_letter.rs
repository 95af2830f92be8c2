//! Dead-letter handling for records whose retries are exhausted.

use super::{binary, DocumentSink, DocumentStore, StoreSink};
use crate::error::StoreError;
use crate::processor::ProcessContext;
use crate::record::Record;
use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::{doc, Bson, DateTime as BsonDateTime, Document};
use std::sync::Arc;
use std::time::Duration;

/// A record that could not be processed.
#[derive(Debug)]
pub struct DeadLetter<'a> {
    /// The original record
    pub record: &'a Record,
    /// Last error seen
    pub reason: String,
    /// Attempts made before giving up
    pub attempts: u32,
}

impl DeadLetter<'_> {
    /// Document stored in the dead-letter collection.
    ///
    /// Shares the record's dedup id, so a redelivered failure is stored once.
    pub fn to_document(&self) -> Document {
        let record = self.record;
        let headers: Vec<Bson> = record
            .headers
            .iter()
            .map(|(key, value)| Bson::Document(doc! { "key": key.as_str(), "value": binary(value) }))
            .collect();

        doc! {
            "_id": record.dedup_key(),
            "topic": record.topic.as_str(),
            "partition": record.partition,
            "offset": record.offset,
            "key": binary(&record.key),
            "value": binary(&record.value),
            "headers": headers,
            "timestamp": BsonDateTime::from_millis(record.timestamp.timestamp_millis()),
            "reason": self.reason.as_str(),
            "attempts": i64::from(self.attempts),
            "failed_at": BsonDateTime::from_millis(Utc::now().timestamp_millis()),
        }
    }
}

/// Destination for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    /// Persist a dead letter.
    async fn send(&self, ctx: &ProcessContext, letter: DeadLetter<'_>) -> Result<(), StoreError>;
}

/// Dead-letter sink writing into a store collection.
pub struct StoreDeadLetterSink {
    sink: StoreSink,
}

impl StoreDeadLetterSink {
    /// Create a sink writing into `collection`.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            sink: StoreSink::new(store, collection, write_timeout),
        }
    }
}

#[async_trait]
impl DeadLetterSink for StoreDeadLetterSink {
    async fn send(&self, ctx: &ProcessContext, letter: DeadLetter<'_>) -> Result<(), StoreError> {
        self.sink.write(ctx, letter.to_document()).await
    }
}
