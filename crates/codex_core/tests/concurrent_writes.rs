use async_trait::async_trait;
use chrono::Utc;
use codex_core::wire;
use codex_core::{
    CodexRepository, Document, DocumentStore, MemoryDocumentStore, NewCategory, NewEntry,
    RepoError, RepositoryConfig, Revision, StoreResult,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn test_config() -> RepositoryConfig {
    RepositoryConfig {
        base_backoff_ms: 1,
        max_backoff_ms: 5,
        ..RepositoryConfig::default()
    }
}

fn entry(title: &str) -> NewEntry {
    NewEntry {
        title: title.to_string(),
        ..NewEntry::default()
    }
}

/// Lands a competing write (a new "Factions" category) right before each of
/// the next `remaining` revisioned puts, so those puts carry a stale revision.
struct InterferingStore {
    inner: MemoryDocumentStore,
    remaining: AtomicU32,
    interfered: AtomicU32,
}

impl InterferingStore {
    fn new(remaining: u32) -> Self {
        Self {
            inner: MemoryDocumentStore::new(),
            remaining: AtomicU32::new(remaining),
            interfered: AtomicU32::new(0),
        }
    }

    async fn competing_write(&self, id: &str) -> StoreResult<()> {
        let current = self.inner.get(id).await?;
        let mut codex = wire::deserialize(current.body).unwrap();
        codex.push_category(
            NewCategory {
                title: format!("Factions {}", self.interfered.load(Ordering::SeqCst)),
                ..NewCategory::default()
            },
            Utc::now(),
        );
        self.inner
            .put(Document::new(id, current.rev, wire::serialize(&codex).unwrap()))
            .await?;
        self.interfered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InterferingStore {
    async fn is_ready(&self) -> bool {
        self.inner.is_ready().await
    }

    async fn get(&self, id: &str) -> StoreResult<Document> {
        self.inner.get(id).await
    }

    async fn put(&self, doc: Document) -> StoreResult<Revision> {
        let interfere = doc.rev.is_some()
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if interfere {
            self.competing_write(&doc.id).await?;
        }
        self.inner.put(doc).await
    }

    async fn remove(&self, doc: &Document) -> StoreResult<()> {
        self.inner.remove(doc).await
    }

    async fn range_query(
        &self,
        start: &str,
        end: &str,
        include_body: bool,
    ) -> StoreResult<Vec<Document>> {
        self.inner.range_query(start, end, include_body).await
    }
}

#[tokio::test]
async fn two_concurrent_adds_both_land_with_distinct_orders() {
    let repo = CodexRepository::new(Arc::new(MemoryDocumentStore::new()), test_config());
    let codex = repo.get_or_create_codex("s1").await.unwrap();
    let locations = &codex.categories[1].id;

    let (harbor, tower) = tokio::join!(
        repo.add_entry("s1", locations, entry("Harbor")),
        repo.add_entry("s1", locations, entry("Tower"))
    );
    let harbor = harbor.unwrap();
    let tower = tower.unwrap();

    let codex = repo.get_codex("s1").unwrap();
    let category = codex.category(locations).unwrap();
    assert_eq!(category.entries.len(), 2);
    let orders: HashSet<i64> = category.entries.iter().map(|e| e.order).collect();
    assert_eq!(orders, HashSet::from([0, 1]));
    assert!(codex.find_entry(&harbor.id).is_some());
    assert!(codex.find_entry(&tower.id).is_some());
}

#[tokio::test]
async fn three_concurrent_adds_land_within_the_attempt_limit() {
    let repo = CodexRepository::new(Arc::new(MemoryDocumentStore::new()), test_config());
    let codex = repo.get_or_create_codex("s1").await.unwrap();
    let characters = &codex.categories[0].id;

    let (a, b, c) = tokio::join!(
        repo.add_entry("s1", characters, entry("Aria")),
        repo.add_entry("s1", characters, entry("Bran")),
        repo.add_entry("s1", characters, entry("Cass"))
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let codex = repo.get_codex("s1").unwrap();
    let mut orders: Vec<i64> = codex
        .category(characters)
        .unwrap()
        .entries
        .iter()
        .map(|e| e.order)
        .collect();
    orders.sort_unstable();
    assert_eq!(orders, vec![0, 1, 2]);
}

#[tokio::test]
async fn concurrent_changes_to_different_categories_are_both_kept() {
    let repo = CodexRepository::new(Arc::new(MemoryDocumentStore::new()), test_config());
    let codex = repo.get_or_create_codex("s1").await.unwrap();
    let characters = &codex.categories[0].id;
    let objects = &codex.categories[2].id;

    let (added, deleted) = tokio::join!(
        repo.add_entry("s1", characters, entry("Aria")),
        repo.delete_category("s1", objects)
    );
    let aria = added.unwrap();
    deleted.unwrap();

    let codex = repo.get_codex("s1").unwrap();
    assert!(codex.find_entry(&aria.id).is_some());
    assert!(codex.category(objects).is_none());
}

#[tokio::test]
async fn stale_revision_is_retried_against_the_latest_document() {
    let store = Arc::new(InterferingStore::new(2));
    let repo = CodexRepository::new(store.clone(), test_config());
    let codex = repo.get_or_create_codex("s1").await.unwrap();

    let aria = repo
        .add_entry("s1", &codex.categories[0].id, entry("Aria"))
        .await
        .unwrap();

    let cached = repo.get_codex("s1").unwrap();
    assert!(cached.find_entry(&aria.id).is_some());
    // Both competing categories survived the retries.
    assert_eq!(cached.categories.len(), 6);
    assert_eq!(store.interfered.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exhausted_retries_fail_without_touching_the_cache() {
    let store = Arc::new(InterferingStore::new(3));
    let repo = CodexRepository::new(store.clone(), test_config());
    let codex = repo.get_or_create_codex("s1").await.unwrap();
    let mut rx = repo.subscribe();

    let err = repo
        .add_entry("s1", &codex.categories[0].id, entry("Aria"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RepoError::ConflictExhausted { ref story_id, attempts: 3 } if story_id == "s1"
    ));
    assert_eq!(repo.get_codex("s1").unwrap(), codex);
    assert!(rx.try_recv().is_err());
    assert_eq!(store.interfered.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn store_that_never_becomes_ready_is_reported_unavailable() {
    let store = Arc::new(MemoryDocumentStore::offline());
    let repo = CodexRepository::new(
        store.clone(),
        RepositoryConfig {
            ready_timeout_ms: 30,
            ready_poll_interval_ms: 5,
            ..test_config()
        },
    );

    let err = repo.get_or_create_codex("s1").await.unwrap_err();
    assert!(matches!(err, RepoError::StoreUnavailable(_)));
    assert!(repo.get_codex("s1").is_none());

    store.set_ready(true);
    let codex = repo.get_or_create_codex("s1").await.unwrap();
    assert_eq!(codex.categories.len(), 4);
}

#[tokio::test]
async fn store_going_offline_mid_session_surfaces_unavailable() {
    let store = Arc::new(MemoryDocumentStore::new());
    let repo = CodexRepository::new(store.clone(), test_config());
    let codex = repo.get_or_create_codex("s1").await.unwrap();

    store.set_ready(false);
    let err = repo
        .add_entry("s1", &codex.categories[0].id, entry("Aria"))
        .await
        .unwrap_err();

    assert!(matches!(err, RepoError::StoreUnavailable(_)));
    assert_eq!(repo.get_codex("s1").unwrap(), codex);
}
