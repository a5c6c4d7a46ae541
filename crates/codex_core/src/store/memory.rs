//! In-process document store.
//!
//! Backs tests and ephemeral sessions. Each call yields to the scheduler
//! before touching state so concurrent callers interleave the way they would
//! against a real asynchronous backend.

use super::{Document, DocumentStore, Revision, StoreError, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct StoredRecord {
    sequence: u64,
    rev: Revision,
    body: Value,
}

/// Ordered in-memory map with compare-and-swap revisions.
#[derive(Debug)]
pub struct MemoryDocumentStore {
    docs: Mutex<BTreeMap<String, StoredRecord>>,
    ready: AtomicBool,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    /// Creates an empty store that is immediately ready.
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(BTreeMap::new()),
            ready: AtomicBool::new(true),
        }
    }

    /// Creates an empty store that reports not-ready until `set_ready(true)`.
    pub fn offline() -> Self {
        let store = Self::new();
        store.set_ready(false);
        store
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, BTreeMap<String, StoredRecord>>> {
        self.docs
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn ensure_ready(&self) -> StoreResult<()> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn get(&self, id: &str) -> StoreResult<Document> {
        tokio::task::yield_now().await;
        self.ensure_ready()?;
        let docs = self.lock()?;
        let record = docs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(Document::new(id, Some(record.rev.clone()), record.body.clone()))
    }

    async fn put(&self, doc: Document) -> StoreResult<Revision> {
        tokio::task::yield_now().await;
        self.ensure_ready()?;
        let mut docs = self.lock()?;
        let sequence = match (docs.get(&doc.id), doc.rev.as_ref()) {
            (None, None) => 1,
            (Some(current), Some(rev)) if current.rev == *rev => current.sequence + 1,
            _ => return Err(StoreError::Conflict(doc.id)),
        };

        let rev = Revision::new(sequence);
        docs.insert(
            doc.id,
            StoredRecord {
                sequence,
                rev: rev.clone(),
                body: doc.body,
            },
        );
        Ok(rev)
    }

    async fn remove(&self, doc: &Document) -> StoreResult<()> {
        tokio::task::yield_now().await;
        self.ensure_ready()?;
        let mut docs = self.lock()?;
        match docs.get(&doc.id) {
            None => Err(StoreError::NotFound(doc.id.clone())),
            Some(current) if Some(&current.rev) != doc.rev.as_ref() => {
                Err(StoreError::Conflict(doc.id.clone()))
            }
            Some(_) => {
                docs.remove(&doc.id);
                Ok(())
            }
        }
    }

    async fn range_query(
        &self,
        start: &str,
        end: &str,
        include_body: bool,
    ) -> StoreResult<Vec<Document>> {
        tokio::task::yield_now().await;
        self.ensure_ready()?;
        if start >= end {
            return Ok(Vec::new());
        }
        let docs = self.lock()?;
        let found = docs
            .range::<str, _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(id, record)| {
                let body = if include_body {
                    record.body.clone()
                } else {
                    Value::Null
                };
                Document::new(id.as_str(), Some(record.rev.clone()), body)
            })
            .collect();
        Ok(found)
    }
}
