//! Codex repository: optimistic read-modify-write over the document store.
//!
//! # Responsibility
//! - Own the per-story codex cache and keep it equal to the last confirmed
//!   persisted version.
//! - Run every mutation through one read-apply-retry loop keyed on the
//!   document revision.
//! - Expose read-only query helpers over the cache.
//!
//! # Invariants
//! - Mutations always start from the latest persisted document, never from
//!   the cache.
//! - The cache is updated only after `put` succeeded; a failed attempt leaves
//!   it untouched. A confirmed write always replaces the cached codex.
//! - A mutation is attempted at most `max_attempts` times.
//! - A missing parent (codex, target category) is an error; a missing target
//!   on update/delete is a logged no-op without write or emission.

use crate::channel::{ChangeChannel, CodexSnapshot};
use crate::config::RepositoryConfig;
use crate::model::codex::{
    Category, CategoryId, CategoryUpdate, Codex, Entry, EntryId, EntryUpdate, NewCategory,
    NewEntry,
};
use crate::search::entries::{group_entries, search_entries, EntryGroup};
use crate::store::{Document, DocumentStore, Revision, StoreError};
use crate::wire::{self, codex_key, WireError, CODEX_KEY_PREFIX, CODEX_KEY_RANGE_END};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, OnceCell};

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error surfaced to callers.
#[derive(Debug)]
pub enum RepoError {
    /// No codex document exists for the story.
    CodexNotFound(String),
    CategoryNotFound(CategoryId),
    /// Every attempt lost the revision race.
    ConflictExhausted { story_id: String, attempts: u32 },
    /// Store never became ready within the configured wait.
    StoreUnavailable(String),
    Store(StoreError),
    Wire(WireError),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CodexNotFound(story_id) => write!(f, "codex not found for story: {story_id}"),
            Self::CategoryNotFound(id) => write!(f, "category not found: {id}"),
            Self::ConflictExhausted { story_id, attempts } => write!(
                f,
                "codex for story {story_id} kept changing; gave up after {attempts} attempts"
            ),
            Self::StoreUnavailable(message) => write!(f, "document store unavailable: {message}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Wire(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Wire(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for RepoError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Unavailable(message) => Self::StoreUnavailable(message),
            other => Self::Store(other),
        }
    }
}

impl From<WireError> for RepoError {
    fn from(value: WireError) -> Self {
        Self::Wire(value)
    }
}

/// Result of applying a transform to the latest persisted codex.
enum Mutation<T> {
    /// Persist `Codex`, then hand `T` to the caller.
    Changed(Codex, T),
    /// Nothing to write.
    Unchanged(T),
}

/// Single authority for reading and mutating codex aggregates.
pub struct CodexRepository {
    store: Arc<dyn DocumentStore>,
    channel: ChangeChannel,
    config: RepositoryConfig,
    ready: OnceCell<()>,
}

impl CodexRepository {
    pub fn new(store: Arc<dyn DocumentStore>, config: RepositoryConfig) -> Self {
        let channel = ChangeChannel::new(config.channel_capacity);
        Self {
            store,
            channel,
            config,
            ready: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Change channel carrying the full cache after every committed change.
    pub fn channel(&self) -> &ChangeChannel {
        &self.channel
    }

    /// Shorthand for `channel().subscribe()`.
    pub fn subscribe(&self) -> broadcast::Receiver<CodexSnapshot> {
        self.channel.subscribe()
    }

    /// Waits, bounded by `ready_timeout_ms`, for the store to report ready.
    ///
    /// Succeeds immediately once a previous wait succeeded. A failed wait is
    /// not remembered; the next call waits again.
    ///
    /// # Errors
    /// - `StoreUnavailable` when the timeout elapses first.
    pub async fn wait_until_ready(&self) -> RepoResult<()> {
        self.ready
            .get_or_try_init(|| async {
                let started_at = Instant::now();
                let interval = self.config.ready_poll_interval();
                let poll = async {
                    while !self.store.is_ready().await {
                        tokio::time::sleep(interval).await;
                    }
                };
                match tokio::time::timeout(self.config.ready_timeout(), poll).await {
                    Ok(()) => {
                        info!(
                            "event=store_ready module=repo status=ok duration_ms={}",
                            started_at.elapsed().as_millis()
                        );
                        Ok(())
                    }
                    Err(_) => {
                        error!(
                            "event=store_ready module=repo status=error duration_ms={} error_code=ready_timeout",
                            started_at.elapsed().as_millis()
                        );
                        Err(RepoError::StoreUnavailable(format!(
                            "store not ready after {} ms",
                            self.config.ready_timeout_ms
                        )))
                    }
                }
            })
            .await
            .map(|_| ())
    }

    /// Returns the story's codex, creating it with default categories on
    /// first use.
    ///
    /// Concurrent first calls for the same story converge on one codex: the
    /// losing creator adopts the winner's document.
    pub async fn get_or_create_codex(&self, story_id: &str) -> RepoResult<Codex> {
        self.wait_until_ready().await?;
        if let Some(cached) = self.channel.get(story_id) {
            return Ok(cached);
        }

        let key = codex_key(story_id);
        match self.store.get(&key).await {
            Ok(doc) => {
                let codex = wire::deserialize(doc.body)?;
                debug!("event=codex_load module=repo status=ok story_id={story_id}");
                return Ok(self.adopt(codex));
            }
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let codex = Codex::seeded(story_id, &self.config.default_categories, Utc::now());
        let body = wire::serialize(&codex)?;
        match self.store.put(Document::new(key, None, body)).await {
            Ok(_) => {
                self.channel.commit(codex.clone());
                info!(
                    "event=codex_create module=repo status=ok story_id={story_id} categories={}",
                    codex.categories.len()
                );
                Ok(codex)
            }
            Err(StoreError::Conflict(_)) => {
                let (existing, _) = self.fetch_latest(story_id).await?;
                info!("event=codex_create module=repo status=adopted story_id={story_id}");
                Ok(self.adopt(existing))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Populates the cache with every stored codex via one range scan.
    ///
    /// Documents of other kinds are skipped; malformed codex documents are
    /// logged and skipped. Returns the story ids loaded.
    pub async fn load_all(&self) -> RepoResult<Vec<String>> {
        self.wait_until_ready().await?;
        let docs = self
            .store
            .range_query(CODEX_KEY_PREFIX, CODEX_KEY_RANGE_END, true)
            .await?;

        let mut loaded = Vec::new();
        for doc in docs {
            match wire::decode_stored(doc.body) {
                Ok(Some(codex)) => loaded.push(codex),
                Ok(None) => {}
                Err(err) => warn!(
                    "event=codex_load module=repo status=skipped key={} error={err}",
                    doc.id
                ),
            }
        }

        let story_ids: Vec<String> = loaded.iter().map(|codex| codex.story_id.clone()).collect();
        let accepted = self.channel.refresh(loaded);
        info!("event=codex_load_all module=repo status=ok loaded={accepted}");
        Ok(story_ids)
    }

    /// Cached copy of the story's codex, if loaded.
    pub fn get_codex(&self, story_id: &str) -> Option<Codex> {
        self.channel.get(story_id)
    }

    /// Removes the persisted codex and evicts it from the cache.
    ///
    /// Deleting a codex that does not exist is a no-op.
    pub async fn delete_codex(&self, story_id: &str) -> RepoResult<()> {
        self.wait_until_ready().await?;
        let key = codex_key(story_id);
        let mut attempt = 0;
        loop {
            let doc = match self.store.get(&key).await {
                Ok(doc) => doc,
                Err(StoreError::NotFound(_)) => {
                    self.channel.evict(story_id);
                    debug!("event=codex_delete module=repo status=noop story_id={story_id}");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            match self.store.remove(&doc).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {
                    self.channel.evict(story_id);
                    info!("event=codex_delete module=repo status=ok story_id={story_id}");
                    return Ok(());
                }
                Err(StoreError::Conflict(_)) => {
                    attempt += 1;
                    self.back_off(story_id, "delete_codex", attempt).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Appends a category with `order` equal to the current category count.
    pub async fn add_category(&self, story_id: &str, input: NewCategory) -> RepoResult<Category> {
        self.mutate(story_id, "add_category", |current| {
            let mut next = current.clone();
            let category = next.push_category(input.clone(), Utc::now());
            Ok(Mutation::Changed(next, category))
        })
        .await
    }

    pub async fn update_category(
        &self,
        story_id: &str,
        category_id: &CategoryId,
        update: CategoryUpdate,
    ) -> RepoResult<()> {
        self.mutate(story_id, "update_category", |current| {
            if current.category(category_id).is_none() {
                return Ok(Mutation::Unchanged(()));
            }
            let mut next = current.clone();
            let now = Utc::now();
            if let Some(category) = next.category_mut(category_id) {
                category.apply_update(&update, now);
            }
            next.updated_at = now;
            Ok(Mutation::Changed(next, ()))
        })
        .await
    }

    /// Removes a category and every entry it holds.
    pub async fn delete_category(
        &self,
        story_id: &str,
        category_id: &CategoryId,
    ) -> RepoResult<()> {
        self.mutate(story_id, "delete_category", |current| {
            let mut next = current.clone();
            match next.remove_category(category_id, Utc::now()) {
                Some(_) => Ok(Mutation::Changed(next, ())),
                None => Ok(Mutation::Unchanged(())),
            }
        })
        .await
    }

    /// Appends an entry to a category of the latest persisted codex.
    ///
    /// # Errors
    /// - `CategoryNotFound` when the category does not exist.
    pub async fn add_entry(
        &self,
        story_id: &str,
        category_id: &CategoryId,
        input: NewEntry,
    ) -> RepoResult<Entry> {
        let now = Utc::now();
        let draft = Entry::new(story_id, category_id.clone(), input, now);
        self.mutate(story_id, "add_entry", |current| {
            let mut next = current.clone();
            let category = next
                .category_mut(category_id)
                .ok_or_else(|| RepoError::CategoryNotFound(category_id.clone()))?;
            let entry = category.push_entry(draft.clone(), now);
            next.updated_at = now;
            Ok(Mutation::Changed(next, entry))
        })
        .await
    }

    pub async fn update_entry(
        &self,
        story_id: &str,
        category_id: &CategoryId,
        entry_id: &EntryId,
        update: EntryUpdate,
    ) -> RepoResult<()> {
        self.mutate(story_id, "update_entry", |current| {
            let mut next = current.clone();
            let now = Utc::now();
            let Some(entry) = next
                .category_mut(category_id)
                .and_then(|category| category.entry_mut(entry_id))
            else {
                return Ok(Mutation::Unchanged(()));
            };
            entry.apply_update(&update, now);
            if let Some(category) = next.category_mut(category_id) {
                category.updated_at = now;
            }
            next.updated_at = now;
            Ok(Mutation::Changed(next, ()))
        })
        .await
    }

    pub async fn delete_entry(
        &self,
        story_id: &str,
        category_id: &CategoryId,
        entry_id: &EntryId,
    ) -> RepoResult<()> {
        self.mutate(story_id, "delete_entry", |current| {
            let mut next = current.clone();
            let now = Utc::now();
            let removed = next
                .category_mut(category_id)
                .and_then(|category| category.remove_entry(entry_id, now));
            if removed.is_none() {
                return Ok(Mutation::Unchanged(()));
            }
            next.updated_at = now;
            Ok(Mutation::Changed(next, ()))
        })
        .await
    }

    /// Moves an entry to the end of another category.
    ///
    /// Returns `None` (no write) when the entry does not exist.
    ///
    /// # Errors
    /// - `CategoryNotFound` when the target category does not exist.
    pub async fn move_entry(
        &self,
        story_id: &str,
        entry_id: &EntryId,
        target_category_id: &CategoryId,
    ) -> RepoResult<Option<Entry>> {
        self.mutate(story_id, "move_entry", |current| {
            if current.category(target_category_id).is_none() {
                return Err(RepoError::CategoryNotFound(target_category_id.clone()));
            }
            let mut next = current.clone();
            let now = Utc::now();
            let Some(mut entry) = next.take_entry(entry_id) else {
                return Ok(Mutation::Unchanged(None));
            };
            entry.updated_at = now;
            let moved = next
                .category_mut(target_category_id)
                .map(|category| category.push_entry(entry, now));
            next.updated_at = now;
            Ok(Mutation::Changed(next, moved))
        })
        .await
    }

    /// Assigns category `order` 0..n-1 following `ordered_ids`.
    pub async fn reorder_categories(
        &self,
        story_id: &str,
        ordered_ids: &[CategoryId],
    ) -> RepoResult<()> {
        self.mutate(story_id, "reorder_categories", |current| {
            let mut next = current.clone();
            next.reorder_categories(ordered_ids, Utc::now());
            Ok(Mutation::Changed(next, ()))
        })
        .await
    }

    /// Assigns entry `order` 0..n-1 within one category following
    /// `ordered_ids`.
    pub async fn reorder_entries(
        &self,
        story_id: &str,
        category_id: &CategoryId,
        ordered_ids: &[EntryId],
    ) -> RepoResult<()> {
        self.mutate(story_id, "reorder_entries", |current| {
            let mut next = current.clone();
            let now = Utc::now();
            let Some(category) = next.category_mut(category_id) else {
                return Ok(Mutation::Unchanged(()));
            };
            category.reorder_entries(ordered_ids, now);
            next.updated_at = now;
            Ok(Mutation::Changed(next, ()))
        })
        .await
    }

    /// Cached copy of one entry.
    pub fn get_entry(&self, story_id: &str, entry_id: &EntryId) -> Option<Entry> {
        self.channel
            .get(story_id)
            .and_then(|codex| codex.find_entry(entry_id).cloned())
    }

    /// Case-insensitive substring search over the cached codex.
    ///
    /// Reads the cache only; writes committed by other processes since the
    /// last load are not visible.
    pub fn search_entries(&self, story_id: &str, query: &str) -> Vec<Entry> {
        self.channel
            .get(story_id)
            .map(|codex| search_entries(&codex, query))
            .unwrap_or_default()
    }

    /// Non-empty categories of the cached codex with their ordered entries.
    pub fn get_all_codex_entries(&self, story_id: &str) -> Vec<EntryGroup> {
        self.channel
            .get(story_id)
            .map(|codex| group_entries(&codex))
            .unwrap_or_default()
    }

    /// Caches a codex read from the store and returns the cached copy, which
    /// stays the newer one when this read lost a race with a local write.
    fn adopt(&self, codex: Codex) -> Codex {
        if self.channel.refresh(vec![codex.clone()]) > 0 {
            return codex;
        }
        self.channel.get(&codex.story_id).unwrap_or(codex)
    }

    async fn fetch_latest(&self, story_id: &str) -> RepoResult<(Codex, Revision)> {
        let key = codex_key(story_id);
        let doc = match self.store.get(&key).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound(_)) => {
                return Err(RepoError::CodexNotFound(story_id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let rev = doc
            .rev
            .ok_or_else(|| StoreError::Backend(format!("document `{key}` has no revision")))?;
        Ok((wire::deserialize(doc.body)?, rev))
    }

    /// Read-apply-retry loop shared by every mutation.
    ///
    /// `transform` runs once per attempt against the latest persisted codex
    /// and must not have side effects outside its return value.
    async fn mutate<T, F>(&self, story_id: &str, op: &'static str, mut transform: F) -> RepoResult<T>
    where
        F: FnMut(&Codex) -> RepoResult<Mutation<T>>,
    {
        self.wait_until_ready().await?;
        let started_at = Instant::now();
        let key = codex_key(story_id);
        let mut attempt = 0;

        loop {
            let (current, rev) = self.fetch_latest(story_id).await?;
            let (next, output) = match transform(&current)? {
                Mutation::Changed(next, output) => (next, output),
                Mutation::Unchanged(output) => {
                    info!("event=codex_write module=repo status=noop op={op} story_id={story_id}");
                    return Ok(output);
                }
            };

            let body = wire::serialize(&next)?;
            match self.store.put(Document::new(key.as_str(), Some(rev), body)).await {
                Ok(_) => {
                    self.channel.commit(next);
                    info!(
                        "event=codex_write module=repo status=ok op={op} story_id={story_id} attempts={} duration_ms={}",
                        attempt + 1,
                        started_at.elapsed().as_millis()
                    );
                    return Ok(output);
                }
                Err(StoreError::Conflict(_)) => {
                    attempt += 1;
                    self.back_off(story_id, op, attempt).await?;
                }
                Err(err) => {
                    error!(
                        "event=codex_write module=repo status=error op={op} story_id={story_id} error={err}"
                    );
                    return Err(err.into());
                }
            }
        }
    }

    /// Sleeps before retry after `failed_attempts` conflicts, or gives up.
    async fn back_off(&self, story_id: &str, op: &'static str, failed_attempts: u32) -> RepoResult<()> {
        let max_attempts = self.config.max_attempts.max(1);
        if failed_attempts >= max_attempts {
            warn!(
                "event=codex_write module=repo status=error op={op} story_id={story_id} attempts={failed_attempts} error_code=conflict_exhausted"
            );
            return Err(RepoError::ConflictExhausted {
                story_id: story_id.to_string(),
                attempts: failed_attempts,
            });
        }

        let delay = self.config.backoff_for(failed_attempts - 1);
        warn!(
            "event=codex_write module=repo status=retry op={op} story_id={story_id} attempt={} backoff_ms={}",
            failed_attempts + 1,
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}
