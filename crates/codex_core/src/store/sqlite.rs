//! SQLite-backed document store.
//!
//! # Responsibility
//! - Persist documents in the `documents` table created by `db::migrations`.
//! - Enforce revision compare-and-swap inside an immediate transaction.
//!
//! # Invariants
//! - `sequence` grows by one on every successful write to a key.
//! - The JSON `type` discriminator is mirrored to `doc_type` for diagnostics.
//! - rusqlite calls block, so every call runs on tokio's blocking pool and
//!   never on an executor thread.

use super::{Document, DocumentStore, Revision, StoreError, StoreResult};
use crate::db::{open_db, open_db_in_memory};
use async_trait::async_trait;
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Document store over a single SQLite connection.
pub struct SqliteDocumentStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDocumentStore {
    /// Opens (or creates) the database file and applies migrations.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Ok(Self::from_connection(open_db(path)?))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?))
    }

    /// Wraps a connection that already went through `db::open_db*`.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Runs `op` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_string()))?;
            op(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Backend(format!("sqlite task failed: {err}")))?
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn is_ready(&self) -> bool {
        !self.conn.is_poisoned()
    }

    async fn get(&self, id: &str) -> StoreResult<Document> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT rev, body FROM documents WHERE id = ?1;",
                    [id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (rev, body) = row.ok_or_else(|| StoreError::NotFound(id.clone()))?;
            Ok(Document::new(
                id,
                Some(Revision::from(rev)),
                serde_json::from_str(&body)?,
            ))
        })
        .await
    }

    async fn put(&self, doc: Document) -> StoreResult<Revision> {
        self.with_conn(move |conn| {
            let body = serde_json::to_string(&doc.body)?;
            let doc_type = doc.body.get("type").and_then(Value::as_str);

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<(i64, String)> = tx
                .query_row(
                    "SELECT sequence, rev FROM documents WHERE id = ?1;",
                    [doc.id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let sequence = match (current, doc.rev.as_ref()) {
                (None, None) => 1,
                (Some((sequence, stored)), Some(rev)) if stored == rev.as_str() => sequence + 1,
                _ => {
                    debug!(
                        "event=document_put module=store status=conflict backend=sqlite key={}",
                        doc.id
                    );
                    return Err(StoreError::Conflict(doc.id.clone()));
                }
            };

            let rev = Revision::new(u64::try_from(sequence).unwrap_or(u64::MAX));
            tx.execute(
                "INSERT INTO documents (id, sequence, rev, doc_type, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, (strftime('%s', 'now') * 1000))
                 ON CONFLICT(id) DO UPDATE SET
                    sequence = excluded.sequence,
                    rev = excluded.rev,
                    doc_type = excluded.doc_type,
                    body = excluded.body,
                    updated_at = excluded.updated_at;",
                params![doc.id.as_str(), sequence, rev.as_str(), doc_type, body],
            )?;
            tx.commit()?;
            Ok(rev)
        })
        .await
    }

    async fn remove(&self, doc: &Document) -> StoreResult<()> {
        let id = doc.id.clone();
        let rev = doc.rev.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stored: Option<String> = tx
                .query_row(
                    "SELECT rev FROM documents WHERE id = ?1;",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            match stored {
                None => Err(StoreError::NotFound(id)),
                Some(stored) if Some(stored.as_str()) != rev.as_ref().map(Revision::as_str) => {
                    Err(StoreError::Conflict(id))
                }
                Some(_) => {
                    tx.execute("DELETE FROM documents WHERE id = ?1;", [id.as_str()])?;
                    tx.commit()?;
                    Ok(())
                }
            }
        })
        .await
    }

    async fn range_query(
        &self,
        start: &str,
        end: &str,
        include_body: bool,
    ) -> StoreResult<Vec<Document>> {
        let (start, end) = (start.to_string(), end.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, rev, body
                 FROM documents
                 WHERE id >= ?1 AND id < ?2
                 ORDER BY id ASC;",
            )?;
            let mut rows = stmt.query([start.as_str(), end.as_str()])?;
            let mut docs = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row.get("id")?;
                let rev: String = row.get("rev")?;
                let body = if include_body {
                    let raw: String = row.get("body")?;
                    serde_json::from_str(&raw)?
                } else {
                    Value::Null
                };
                docs.push(Document::new(id, Some(Revision::from(rev)), body));
            }
            Ok(docs)
        })
        .await
    }
}
