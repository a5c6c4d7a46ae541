//! Codex cache and change channel.
//!
//! # Responsibility
//! - Hold the last confirmed codex per story.
//! - Republish the whole mapping to subscribers on every committed change.
//!
//! # Invariants
//! - Only the repository writes here, and only with codices the store
//!   returned or confirmed (`commit` / `refresh` / `evict` are crate-private).
//! - Each accepted change produces exactly one emission carrying the full
//!   mapping.
//! - A confirmed write always replaces the cached codex.
//! - A plain store read never replaces a newer copy of the same codex
//!   (same `id`, later `updated_at`). A different `id` means the codex was
//!   recreated and the read wins.
//! - Subscribers get shared read-only snapshots; a lagging subscriber loses
//!   old snapshots, it never slows the repository down.

use crate::model::codex::Codex;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Full story id -> codex mapping, shared read-only.
pub type CodexSnapshot = Arc<BTreeMap<String, Codex>>;

pub struct ChangeChannel {
    codices: RwLock<CodexSnapshot>,
    sender: broadcast::Sender<CodexSnapshot>,
}

impl ChangeChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            codices: RwLock::new(CodexSnapshot::default()),
            sender,
        }
    }

    /// Receives one snapshot per committed change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CodexSnapshot> {
        self.sender.subscribe()
    }

    /// Current full mapping.
    pub fn snapshot(&self) -> CodexSnapshot {
        self.codices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Owned copy of one story's cached codex.
    pub fn get(&self, story_id: &str) -> Option<Codex> {
        self.codices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(story_id)
            .cloned()
    }

    /// Stores a codex the store just confirmed writing, and publishes.
    pub(crate) fn commit(&self, codex: Codex) {
        let mut codices = self.codices.write().unwrap_or_else(PoisonError::into_inner);
        Arc::make_mut(&mut *codices).insert(codex.story_id.clone(), codex);
        self.publish(&codices);
    }

    /// Stores codices read from the store and publishes once.
    ///
    /// Returns how many were accepted.
    pub(crate) fn refresh(&self, loaded: Vec<Codex>) -> usize {
        let mut codices = self.codices.write().unwrap_or_else(PoisonError::into_inner);
        let mut accepted = 0;
        for codex in loaded {
            if let Some(cached) = codices.get(&codex.story_id) {
                if cached.id == codex.id && cached.updated_at > codex.updated_at {
                    continue;
                }
            }
            Arc::make_mut(&mut *codices).insert(codex.story_id.clone(), codex);
            accepted += 1;
        }
        if accepted > 0 {
            self.publish(&codices);
        }
        accepted
    }

    /// Drops a story from the cache and publishes if it was present.
    pub(crate) fn evict(&self, story_id: &str) -> bool {
        let mut codices = self.codices.write().unwrap_or_else(PoisonError::into_inner);
        let removed = Arc::make_mut(&mut *codices).remove(story_id).is_some();
        if removed {
            self.publish(&codices);
        }
        removed
    }

    fn publish(&self, codices: &CodexSnapshot) {
        // No receivers is fine; the snapshot is still readable via `snapshot`.
        let _ = self.sender.send(codices.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::ChangeChannel;
    use crate::config::default_category_templates;
    use crate::model::codex::Codex;
    use chrono::{Duration, Utc};

    fn codex(story_id: &str) -> Codex {
        Codex::seeded(story_id, &default_category_templates(), Utc::now())
    }

    #[test]
    fn every_commit_emits_full_mapping() {
        let channel = ChangeChannel::new(8);
        let mut rx = channel.subscribe();

        channel.commit(codex("a"));
        channel.commit(codex("b"));

        assert_eq!(rx.try_recv().unwrap().len(), 1);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.len(), 2);
        assert!(second.contains_key("a") && second.contains_key("b"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn commit_replaces_even_an_older_looking_codex() {
        let channel = ChangeChannel::new(8);
        let newer = codex("a");
        let mut recreated = codex("a");
        recreated.updated_at = newer.updated_at - Duration::hours(1);
        channel.commit(newer);

        channel.commit(recreated.clone());

        assert_eq!(channel.get("a").unwrap(), recreated);
    }

    #[test]
    fn stale_read_does_not_replace_newer_copy() {
        let channel = ChangeChannel::new(8);
        let stale = codex("a");
        let mut newer = stale.clone();
        newer.updated_at = stale.updated_at + Duration::seconds(5);
        channel.commit(newer.clone());

        let mut rx = channel.subscribe();
        assert_eq!(channel.refresh(vec![stale]), 0);
        assert_eq!(channel.get("a").unwrap(), newer);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn read_of_recreated_codex_replaces_cache() {
        let channel = ChangeChannel::new(8);
        let old = codex("a");
        let mut recreated = codex("a");
        recreated.updated_at = old.updated_at - Duration::hours(1);
        channel.commit(old);

        assert_eq!(channel.refresh(vec![recreated.clone(), codex("b")]), 2);
        assert_eq!(channel.get("a").unwrap().id, recreated.id);
        assert_eq!(channel.snapshot().len(), 2);
    }

    #[test]
    fn snapshots_are_isolated_from_later_commits() {
        let channel = ChangeChannel::new(8);
        channel.commit(codex("a"));
        let before = channel.snapshot();
        channel.commit(codex("b"));
        assert_eq!(before.len(), 1);
        assert_eq!(channel.snapshot().len(), 2);
    }

    #[test]
    fn evict_publishes_only_when_present() {
        let channel = ChangeChannel::new(8);
        channel.commit(codex("a"));
        let mut rx = channel.subscribe();

        assert!(channel.evict("a"));
        assert!(rx.try_recv().unwrap().is_empty());
        assert!(!channel.evict("a"));
        assert!(rx.try_recv().is_err());
    }
}
