//! Entry search and grouping.
//!
//! # Invariants
//! - Pure functions over a codex value; no store access.
//! - Results follow display order: category `order`, then entry `order`.

use crate::model::codex::{Category, CategoryId, Codex, Entry};

/// Entries of one non-empty category, as returned by
/// [`crate::CodexRepository::get_all_codex_entries`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntryGroup {
    pub category_id: CategoryId,
    /// Category title.
    pub category: String,
    pub icon: Option<String>,
    pub entries: Vec<Entry>,
}

/// Case-insensitive substring match over title, content and tags.
///
/// Returns an empty list for blank queries.
pub fn search_entries(codex: &Codex, query: &str) -> Vec<Entry> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }

    ordered_categories(codex)
        .into_iter()
        .flat_map(ordered_entries)
        .filter(|entry| entry_matches(entry, &needle))
        .cloned()
        .collect()
}

/// Groups entries by category, skipping empty categories.
pub fn group_entries(codex: &Codex) -> Vec<EntryGroup> {
    ordered_categories(codex)
        .into_iter()
        .filter(|category| !category.entries.is_empty())
        .map(|category| EntryGroup {
            category_id: category.id.clone(),
            category: category.title.clone(),
            icon: category.icon.clone(),
            entries: ordered_entries(category).into_iter().cloned().collect(),
        })
        .collect()
}

fn entry_matches(entry: &Entry, needle: &str) -> bool {
    entry.title.to_lowercase().contains(needle)
        || entry.content.to_lowercase().contains(needle)
        || entry
            .tags
            .iter()
            .any(|tag| tag.to_lowercase().contains(needle))
}

fn ordered_categories(codex: &Codex) -> Vec<&Category> {
    let mut categories: Vec<&Category> = codex.categories.iter().collect();
    categories.sort_by_key(|category| category.order);
    categories
}

fn ordered_entries(category: &Category) -> Vec<&Entry> {
    let mut entries: Vec<&Entry> = category.entries.iter().collect();
    entries.sort_by_key(|entry| entry.order);
    entries
}
