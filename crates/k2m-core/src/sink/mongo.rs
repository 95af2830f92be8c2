//! MongoDB document store.

use super::{id_string, DocumentStore};
use crate::config::{redact_uri, StoreConfig};
use crate::error::StoreError;
use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Server error code for a unique index violation.
const DUPLICATE_KEY_CODE: i32 = 11000;

/// MongoDB-backed store. The client is shared and safe for concurrent use.
pub struct MongoStore {
    client: Client,
    database: Database,
    closed: AtomicBool,
}

impl MongoStore {
    /// Connect and verify the deployment answers a ping.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let target = redact_uri(&config.connection_string);
        let connect_error = |e: MongoError| StoreError::ConnectionFailed {
            target: target.clone(),
            message: e.to_string(),
        };

        let mut options = ClientOptions::parse(&config.connection_string)
            .await
            .map_err(connect_error)?;
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        options.app_name = Some(config.app_name.clone());
        options.connect_timeout = Some(connect_timeout);
        options.server_selection_timeout = Some(connect_timeout);

        let client = Client::with_options(options).map_err(connect_error)?;
        let database = client.database(&config.database);
        database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(connect_error)?;

        info!(
            uri = %target,
            database = %config.database,
            collection = %config.collection,
            "Connected to document store"
        );

        Ok(Self {
            client,
            database,
            closed: AtomicBool::new(false),
        })
    }
}

/// Map a driver error onto the retryable/permanent split.
fn classify(err: MongoError) -> StoreError {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error))
            if write_error.code == DUPLICATE_KEY_CODE =>
        {
            StoreError::DuplicateKey(write_error.message.clone())
        }
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => StoreError::Network(err.to_string()),
        ErrorKind::Write(_) | ErrorKind::InvalidArgument { .. } | ErrorKind::BsonSerialization(_) => {
            StoreError::Rejected(err.to_string())
        }
        _ if err.contains_label("RetryableWriteError") => StoreError::Network(err.to_string()),
        _ => StoreError::Rejected(err.to_string()),
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn insert_one(&self, collection: &str, document: Document) -> Result<String, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let result = self
            .database
            .collection::<Document>(collection)
            .insert_one(document, None)
            .await
            .map_err(classify)?;
        Ok(id_string(&result.inserted_id))
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!("Document store already closed");
            return Ok(());
        }
        self.client.clone().shutdown().await;
        info!(database = %self.database.name(), "Document store closed");
        Ok(())
    }
}
