//! Codex aggregate model.
//!
//! # Responsibility
//! - Define the per-story reference aggregate: codex -> categories -> entries.
//! - Provide in-place transforms used by the repository on a private copy of
//!   the latest persisted aggregate.
//!
//! # Invariants
//! - Every entry's `category_id` equals the id of the category holding it.
//! - `order` is contiguous `0..n-1` after an explicit reorder; appends use the
//!   current length and are not re-validated.
//! - Ids are opaque strings. New ids are random UUIDs, but ids written by
//!   other producers are accepted as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mints a fresh random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Stable identifier of a codex root.
    CodexId
);
opaque_id!(
    /// Stable identifier of a category.
    CategoryId
);
opaque_id!(
    /// Stable identifier of an entry.
    EntryId
);

/// Title substituted for blank category titles.
pub const DEFAULT_CATEGORY_TITLE: &str = "New Category";
/// Title substituted for blank entry titles.
pub const DEFAULT_ENTRY_TITLE: &str = "New Entry";

/// Root aggregate. Exactly one exists per story.
#[derive(Debug, Clone, PartialEq)]
pub struct Codex {
    pub id: CodexId,
    pub story_id: String,
    pub title: String,
    /// Kept sorted by `order` after reorders.
    pub categories: Vec<Category>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Named group of entries, e.g. "Characters".
#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub id: CategoryId,
    pub story_id: String,
    pub title: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub order: i64,
    pub entries: Vec<Entry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One reference record: a character, a location, an object or a note.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    pub category_id: CategoryId,
    pub story_id: String,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub image_url: Option<String>,
    pub metadata: Option<EntryMetadata>,
    pub custom_fields: BTreeMap<String, String>,
    pub order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Open extension map attached to an entry.
///
/// Known keys are typed; anything else written by other producers (for example
/// an archive importer) survives a round-trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    /// Always feed this entry into generated context, regardless of matching.
    #[serde(default)]
    pub always_include: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Template used to seed the categories of a freshly created codex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTemplate {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Input for `add_category`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewCategory {
    pub title: String,
    pub description: Option<String>,
    pub icon: Option<String>,
}

/// Partial update for a category. `None` leaves a field untouched.
///
/// `Some(None)` clears `description` or `icon`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryUpdate {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub icon: Option<Option<String>>,
}

/// Input for `add_entry`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewEntry {
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub image_url: Option<String>,
    pub metadata: Option<EntryMetadata>,
    pub custom_fields: BTreeMap<String, String>,
}

/// Partial update for an entry. `None` leaves a field untouched.
///
/// `image_url: Some(None)` clears the image reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub image_url: Option<Option<String>>,
    pub metadata: Option<EntryMetadata>,
    pub custom_fields: Option<BTreeMap<String, String>>,
}

impl Codex {
    /// Builds a new codex for `story_id` with one category per template.
    pub fn seeded(story_id: &str, templates: &[CategoryTemplate], now: DateTime<Utc>) -> Self {
        let categories = templates
            .iter()
            .enumerate()
            .map(|(index, template)| {
                Category::new(
                    story_id,
                    NewCategory {
                        title: template.title.clone(),
                        description: template.description.clone(),
                        icon: template.icon.clone(),
                    },
                    index as i64,
                    now,
                )
            })
            .collect();

        Self {
            id: CodexId::generate(),
            story_id: story_id.to_string(),
            title: format!("Codex for {story_id}"),
            categories,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn category(&self, category_id: &CategoryId) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == *category_id)
    }

    pub fn category_mut(&mut self, category_id: &CategoryId) -> Option<&mut Category> {
        self.categories.iter_mut().find(|c| c.id == *category_id)
    }

    /// Finds an entry anywhere in the codex.
    pub fn find_entry(&self, entry_id: &EntryId) -> Option<&Entry> {
        self.categories
            .iter()
            .flat_map(|category| category.entries.iter())
            .find(|entry| entry.id == *entry_id)
    }

    /// Total number of entries across all categories.
    pub fn entry_count(&self) -> usize {
        self.categories.iter().map(|c| c.entries.len()).sum()
    }

    /// Appends a category with `order` equal to the current category count.
    pub fn push_category(&mut self, input: NewCategory, now: DateTime<Utc>) -> Category {
        let category = Category::new(&self.story_id, input, self.categories.len() as i64, now);
        self.categories.push(category.clone());
        self.updated_at = now;
        category
    }

    /// Removes a category together with its entry subtree.
    ///
    /// Returns `None` when the category does not exist.
    pub fn remove_category(
        &mut self,
        category_id: &CategoryId,
        now: DateTime<Utc>,
    ) -> Option<Category> {
        let index = self.categories.iter().position(|c| c.id == *category_id)?;
        let removed = self.categories.remove(index);
        self.updated_at = now;
        Some(removed)
    }

    /// Assigns category `order` following `ordered_ids`.
    ///
    /// Ids absent from the codex are skipped; categories absent from
    /// `ordered_ids` keep their previous order.
    pub fn reorder_categories(&mut self, ordered_ids: &[CategoryId], now: DateTime<Utc>) {
        apply_order(
            &mut self.categories,
            ordered_ids,
            |c, id| c.id == *id,
            |c, order| {
                c.order = order;
                c.updated_at = now;
            },
        );
        self.categories.sort_by_key(|c| c.order);
        self.updated_at = now;
    }

    /// Detaches an entry from whichever category holds it.
    pub fn take_entry(&mut self, entry_id: &EntryId) -> Option<Entry> {
        self.categories.iter_mut().find_map(|category| {
            let index = category.entries.iter().position(|e| e.id == *entry_id)?;
            Some(category.entries.remove(index))
        })
    }
}

impl Category {
    pub fn new(story_id: &str, input: NewCategory, order: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: CategoryId::generate(),
            story_id: story_id.to_string(),
            title: normalize_title(&input.title, DEFAULT_CATEGORY_TITLE),
            description: input.description,
            icon: input.icon,
            order,
            entries: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply_update(&mut self, update: &CategoryUpdate, now: DateTime<Utc>) {
        if let Some(title) = update.title.as_deref() {
            self.title = normalize_title(title, DEFAULT_CATEGORY_TITLE);
        }
        if let Some(description) = update.description.as_ref() {
            self.description = description.clone();
        }
        if let Some(icon) = update.icon.as_ref() {
            self.icon = icon.clone();
        }
        self.updated_at = now;
    }

    pub fn entry_mut(&mut self, entry_id: &EntryId) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id == *entry_id)
    }

    /// Appends an entry, re-homing it to this category with the next order.
    pub fn push_entry(&mut self, mut entry: Entry, now: DateTime<Utc>) -> Entry {
        entry.category_id = self.id.clone();
        entry.story_id = self.story_id.clone();
        entry.order = self.entries.len() as i64;
        self.entries.push(entry.clone());
        self.updated_at = now;
        entry
    }

    pub fn remove_entry(&mut self, entry_id: &EntryId, now: DateTime<Utc>) -> Option<Entry> {
        let index = self.entries.iter().position(|e| e.id == *entry_id)?;
        self.updated_at = now;
        Some(self.entries.remove(index))
    }

    /// Assigns entry `order` following `ordered_ids`; see
    /// [`Codex::reorder_categories`] for the best-effort rules.
    pub fn reorder_entries(&mut self, ordered_ids: &[EntryId], now: DateTime<Utc>) {
        apply_order(
            &mut self.entries,
            ordered_ids,
            |e, id| e.id == *id,
            |e, order| {
                e.order = order;
                e.updated_at = now;
            },
        );
        self.entries.sort_by_key(|e| e.order);
        self.updated_at = now;
    }
}

impl Entry {
    /// Builds a detached entry. `order` is assigned when it is pushed into a
    /// category.
    pub fn new(
        story_id: &str,
        category_id: CategoryId,
        input: NewEntry,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntryId::generate(),
            category_id,
            story_id: story_id.to_string(),
            title: normalize_title(&input.title, DEFAULT_ENTRY_TITLE),
            content: input.content,
            tags: normalize_tags(&input.tags),
            image_url: input.image_url,
            metadata: input.metadata,
            custom_fields: input.custom_fields,
            order: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply_update(&mut self, update: &EntryUpdate, now: DateTime<Utc>) {
        if let Some(title) = update.title.as_deref() {
            self.title = normalize_title(title, DEFAULT_ENTRY_TITLE);
        }
        if let Some(content) = update.content.as_ref() {
            self.content = content.clone();
        }
        if let Some(tags) = update.tags.as_ref() {
            self.tags = normalize_tags(tags);
        }
        if let Some(image_url) = update.image_url.as_ref() {
            self.image_url = image_url.clone();
        }
        if let Some(metadata) = update.metadata.as_ref() {
            self.metadata = Some(metadata.clone());
        }
        if let Some(custom_fields) = update.custom_fields.as_ref() {
            self.custom_fields = custom_fields.clone();
        }
        self.updated_at = now;
    }
}

/// Trims a title, substituting `fallback` when nothing is left.
pub fn normalize_title(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Trims tags, drops empties and case-insensitive duplicates.
///
/// First occurrence wins, so display casing and order are preserved.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .filter(|tag| seen.insert(tag.to_lowercase()))
        .map(str::to_string)
        .collect()
}

fn apply_order<T, I>(
    items: &mut [T],
    ordered_ids: &[I],
    has_id: impl Fn(&T, &I) -> bool,
    mut set_order: impl FnMut(&mut T, i64),
) {
    let mut position = 0_i64;
    for id in ordered_ids {
        if let Some(item) = items.iter_mut().find(|item| has_id(&**item, id)) {
            set_order(item, position);
            position += 1;
        }
    }
}
