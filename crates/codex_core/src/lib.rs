//! Local-first reference store for narrative codex entries.
//! This crate is the single source of truth for codex persistence invariants.

pub mod channel;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod search;
pub mod store;
pub mod wire;

pub use channel::{ChangeChannel, CodexSnapshot};
pub use config::{default_category_templates, ConfigError, RepositoryConfig};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::codex::{
    Category, CategoryId, CategoryTemplate, CategoryUpdate, Codex, CodexId, Entry, EntryId,
    EntryMetadata, EntryUpdate, NewCategory, NewEntry,
};
pub use repo::codex_repo::{CodexRepository, RepoError, RepoResult};
pub use search::entries::EntryGroup;
pub use store::{
    Document, DocumentStore, MemoryDocumentStore, Revision, SqliteDocumentStore, StoreError,
    StoreResult,
};
pub use wire::{codex_key, WireError};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
