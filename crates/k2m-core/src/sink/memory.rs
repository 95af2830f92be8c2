//! In-memory document store.

use super::{id_string, DocumentStore};
use crate::error::StoreError;
use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::Document;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

type Fault = Box<dyn Fn(&Document) -> Option<StoreError> + Send + Sync>;

/// Document store kept in process memory.
///
/// Enforces `_id` uniqueness per collection like a real store, and can be
/// slowed down or made to fail for specific documents.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    fault: Mutex<Option<Fault>>,
    write_delay: Mutex<Duration>,
    inserts: AtomicUsize,
    closes: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail inserts for which `fault` returns an error.
    pub fn fail_when<F>(&self, fault: F)
    where
        F: Fn(&Document) -> Option<StoreError> + Send + Sync + 'static,
    {
        *self.fault.lock() = Some(Box::new(fault));
    }

    /// Remove the injected fault.
    pub fn clear_fault(&self) {
        *self.fault.lock() = None;
    }

    /// Delay every insert by `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    /// Documents stored in `collection`, in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of documents in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Insert calls so far, including failed ones.
    pub fn insert_attempts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    /// Close calls so far.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_one(
        &self,
        collection: &str,
        mut document: Document,
    ) -> Result<String, StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if let Some(err) = self.fault.lock().as_ref().and_then(|fault| fault(&document)) {
            return Err(err);
        }

        if !document.contains_key("_id") {
            document.insert("_id", ObjectId::new());
        }
        let id = document.get("_id").map(id_string).unwrap_or_default();

        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();
        if docs
            .iter()
            .any(|d| d.get("_id").map(id_string).as_deref() == Some(id.as_str()))
        {
            return Err(StoreError::DuplicateKey(id));
        }
        docs.push(document);
        Ok(id)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
