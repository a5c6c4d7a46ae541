//! Revisioned document store capability.
//!
//! # Responsibility
//! - Define the storage contract consumed by the codex repository.
//! - Provide in-memory and SQLite implementations of that contract.
//!
//! # Invariants
//! - Every stored document carries an opaque revision assigned by the store.
//! - A write or remove carrying a stale revision fails with `Conflict`; it
//!   never overwrites silently.
//! - `range_query` returns documents in ascending key order over `[start, end)`.

use crate::db::DbError;
use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryDocumentStore;
pub use sqlite::SqliteDocumentStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage-level failure.
#[derive(Debug)]
pub enum StoreError {
    /// No document stored under the key.
    NotFound(String),
    /// Supplied revision does not match the stored one (or the key already
    /// exists on create).
    Conflict(String),
    /// Store is not ready or not reachable.
    Unavailable(String),
    Backend(String),
    Db(DbError),
    Json(serde_json::Error),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "document not found: {key}"),
            Self::Conflict(key) => write!(f, "document update conflict: {key}"),
            Self::Unavailable(message) => write!(f, "document store unavailable: {message}"),
            Self::Backend(message) => write!(f, "document store failure: {message}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "invalid document body: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Opaque revision token, shaped `<sequence>-<random>`.
///
/// Only equality is meaningful outside the store that minted it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    /// Mints a fresh token for the given write sequence.
    pub fn new(sequence: u64) -> Self {
        Self(format!("{sequence}-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<String> for Revision {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored unit: key, revision and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    /// `None` on create; the revision read earlier on update/remove.
    pub rev: Option<Revision>,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, rev: Option<Revision>, body: Value) -> Self {
        Self {
            id: id.into(),
            rev,
            body,
        }
    }
}

/// Capability contract of a revisioned key/value document store.
///
/// Every method is a suspension point; other callers may interleave while one
/// awaits.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Whether the store finished its startup and accepts calls.
    async fn is_ready(&self) -> bool;

    /// Loads one document with its current revision.
    async fn get(&self, id: &str) -> StoreResult<Document>;

    /// Writes `doc` if `doc.rev` matches the stored revision (or the key is
    /// new and `doc.rev` is `None`). Returns the new revision.
    async fn put(&self, doc: Document) -> StoreResult<Revision>;

    /// Removes the document if `doc.rev` is still current.
    async fn remove(&self, doc: &Document) -> StoreResult<()>;

    /// Lists documents with `start <= id < end`, ordered by key. Bodies are
    /// `Value::Null` unless `include_body` is set.
    async fn range_query(
        &self,
        start: &str,
        end: &str,
        include_body: bool,
    ) -> StoreResult<Vec<Document>>;
}
