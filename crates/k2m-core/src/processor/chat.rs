//! Chat archive processor: one document per message.

use super::{ProcessContext, ProcessingOutcome, Processor};
use crate::error::{ProcessingError, StoreError};
use crate::record::Record;
use crate::sink::{binary, DocumentSink};
use async_trait::async_trait;
use mongodb::bson::{doc, Bson, DateTime as BsonDateTime, Document};
use std::sync::Arc;
use tracing::{debug, warn};

/// Archives each record as a chat message document.
///
/// The key is the author and the value the message body. Documents are keyed
/// by `topic:partition:offset` so a redelivered record overwrites nothing and
/// is stored once.
pub struct ChatArchiveProcessor {
    sink: Arc<dyn DocumentSink>,
}

impl ChatArchiveProcessor {
    /// Create a processor writing through `sink`.
    pub fn new(sink: Arc<dyn DocumentSink>) -> Self {
        Self { sink }
    }

    /// Build the archived document for a record.
    pub fn to_document(record: &Record) -> Document {
        let headers: Vec<Bson> = record
            .headers
            .iter()
            .map(|(key, value)| {
                Bson::Document(doc! {
                    "key": key.as_str(),
                    "value": binary(value),
                })
            })
            .collect();

        doc! {
            "_id": record.dedup_key(),
            "author": record.key_lossy(),
            "message": record.value_lossy(),
            "timestamp": BsonDateTime::from_millis(record.timestamp.timestamp_millis()),
            "topic": record.topic.as_str(),
            "partition": record.partition,
            "offset": record.offset,
            "headers": headers,
        }
    }
}

fn outcome_for(err: StoreError) -> ProcessingOutcome {
    if err.is_retryable() {
        ProcessingOutcome::Retryable(ProcessingError::Sink(err))
    } else {
        ProcessingOutcome::Fatal(ProcessingError::Sink(err))
    }
}

#[async_trait]
impl Processor for ChatArchiveProcessor {
    async fn handle(&self, ctx: &ProcessContext, record: &Record) -> ProcessingOutcome {
        debug!(
            author = %record.key_lossy(),
            bytes = record.value.len(),
            "Incoming message"
        );
        for (key, value) in &record.headers {
            debug!(header = %key, value = %String::from_utf8_lossy(value), "Message header");
        }

        match self.sink.write(ctx, Self::to_document(record)).await {
            Ok(()) => ProcessingOutcome::Success,
            Err(err) => {
                warn!(attempt = ctx.attempt(), error = %err, "Archive write failed");
                outcome_for(err)
            }
        }
    }

    async fn close(&self) -> crate::Result<()> {
        self.sink.close().await?;
        Ok(())
    }
}
