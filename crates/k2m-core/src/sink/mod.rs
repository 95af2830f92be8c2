//! Sink adapter over a document store.
//!
//! The adapter performs a single write per call. Retry decisions belong to
//! the group consumer; the adapter only bounds each write by the store
//! timeout, the caller's deadline and its cancellation signal.

mod dead_letter;
mod memory;
mod mongo;

pub use dead_letter::{DeadLetter, DeadLetterSink, StoreDeadLetterSink};
pub use memory::MemoryStore;
pub use mongo::MongoStore;

use crate::error::StoreError;
use crate::processor::ProcessContext;
use async_trait::async_trait;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{Binary, Bson, Document};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Document store client.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Insert one document, returning its id.
    async fn insert_one(&self, collection: &str, document: Document) -> Result<String, StoreError>;

    /// Release the client.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Write side used by processors.
#[async_trait]
pub trait DocumentSink: Send + Sync + 'static {
    /// Persist one document.
    async fn write(&self, ctx: &ProcessContext, document: Document) -> Result<(), StoreError>;

    /// Release the underlying store.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Sink writing into one collection of a [`DocumentStore`].
#[derive(Clone)]
pub struct StoreSink {
    store: Arc<dyn DocumentStore>,
    collection: String,
    write_timeout: Duration,
}

impl StoreSink {
    /// Create a sink for `collection`.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            write_timeout,
        }
    }
}

pub(crate) fn binary(bytes: &[u8]) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    })
}

pub(crate) fn id_string(id: &Bson) -> String {
    match id {
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl DocumentSink for StoreSink {
    async fn write(&self, ctx: &ProcessContext, document: Document) -> Result<(), StoreError> {
        let budget = self.write_timeout.min(ctx.remaining());
        if budget.is_zero() {
            return Err(StoreError::Timeout(0));
        }

        let insert = self.store.insert_one(&self.collection, document);
        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(StoreError::Cancelled),
            result = tokio::time::timeout(budget, insert) => result,
        };

        match result {
            Err(_) => Err(StoreError::Timeout(budget.as_millis() as u64)),
            Ok(Ok(id)) => {
                debug!(collection = %self.collection, id = %id, "Document written");
                Ok(())
            }
            Ok(Err(StoreError::DuplicateKey(id))) => {
                debug!(collection = %self.collection, id = %id, "Document already present");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    fn sink(store: Arc<MemoryStore>, timeout: Duration) -> StoreSink {
        StoreSink::new(store, "messages", timeout)
    }

    #[tokio::test]
    async fn test_write_is_idempotent_on_id() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink(store.clone(), Duration::from_secs(1));
        let ctx = ProcessContext::background(Duration::from_secs(5));

        sink.write(&ctx, doc! { "_id": "t:0:1", "message": "a" })
            .await
            .unwrap();
        sink.write(&ctx, doc! { "_id": "t:0:1", "message": "a" })
            .await
            .unwrap();

        assert_eq!(store.count("messages"), 1);
        assert_eq!(store.insert_attempts(), 2);
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let store = Arc::new(MemoryStore::new());
        store.set_write_delay(Duration::from_millis(200));
        let sink = sink(store.clone(), Duration::from_millis(20));
        let ctx = ProcessContext::background(Duration::from_secs(5));

        let err = sink.write(&ctx, doc! { "_id": "x" }).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(20)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_write_honors_cancellation() {
        let store = Arc::new(MemoryStore::new());
        store.set_write_delay(Duration::from_secs(5));
        let sink = sink(store, Duration::from_secs(10));
        let (trigger, cancel) = crate::shutdown::channel();
        let ctx = ProcessContext::new(cancel, Duration::from_secs(10), 1, tracing::Span::none());

        let write = tokio::spawn(async move { sink.write(&ctx, doc! { "_id": "x" }).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();

        let result = tokio::time::timeout(Duration::from_secs(1), write)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[tokio::test]
    async fn test_rejected_passes_through() {
        let store = Arc::new(MemoryStore::new());
        store.fail_when(|_| Some(StoreError::Rejected("too large".into())));
        let sink = sink(store, Duration::from_secs(1));
        let ctx = ProcessContext::background(Duration::from_secs(5));

        let err = sink.write(&ctx, doc! { "_id": "x" }).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }
}
