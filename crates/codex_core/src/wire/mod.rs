//! Wire codec between stored JSON documents and the typed codex aggregate.
//!
//! # Responsibility
//! - Map the flat wire shape (camelCase keys, ISO-8601 strings, `type`
//!   discriminator) to typed values and back.
//! - Own the document key scheme for codex roots.
//!
//! # Invariants
//! - Decoding converts timestamps at codex, category and entry level; a
//!   decoded aggregate never carries raw wire strings.
//! - Encoding emits enough sub-second precision that decode(encode(x)) == x.
//! - Documents whose discriminator is not `codex` are reported, not decoded.

use crate::model::codex::{
    Category, CategoryId, Codex, CodexId, Entry, EntryId, EntryMetadata,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Key prefix shared by every codex root document.
pub const CODEX_KEY_PREFIX: &str = "codex_";
/// Exclusive upper bound for a prefix range scan over codex documents.
pub const CODEX_KEY_RANGE_END: &str = "codex_\u{fff0}";

pub type WireResult<T> = Result<T, WireError>;

/// Encode/decode failure for stored codex documents.
#[derive(Debug)]
pub enum WireError {
    Json(serde_json::Error),
    InvalidTimestamp { field: &'static str, value: String },
    /// Discriminator names some other document kind.
    UnexpectedDocumentType,
}

impl Display for WireError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(err) => write!(f, "malformed codex document: {err}"),
            Self::InvalidTimestamp { field, value } => {
                write!(f, "invalid timestamp `{value}` in `{field}`")
            }
            Self::UnexpectedDocumentType => write!(f, "document is not a codex"),
        }
    }
}

impl Error for WireError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            Self::InvalidTimestamp { .. } | Self::UnexpectedDocumentType => None,
        }
    }
}

impl From<serde_json::Error> for WireError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Every document kind that may live next to codex roots in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoredDocument {
    Codex(WireCodex),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCodex {
    pub id: CodexId,
    pub story_id: String,
    pub title: String,
    #[serde(default)]
    pub categories: Vec<WireCategory>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCategory {
    pub id: CategoryId,
    pub story_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub entries: Vec<WireEntry>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEntry {
    pub id: EntryId,
    pub category_id: CategoryId,
    pub story_id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EntryMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_fields: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub order: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Stable store key of the codex belonging to `story_id`.
pub fn codex_key(story_id: &str) -> String {
    format!("{CODEX_KEY_PREFIX}{story_id}")
}

/// Encodes a codex into a store body carrying the `codex` discriminator.
pub fn serialize(codex: &Codex) -> WireResult<Value> {
    Ok(serde_json::to_value(StoredDocument::Codex(to_wire(codex)))?)
}

/// Decodes a store body into a typed codex.
///
/// # Errors
/// - `UnexpectedDocumentType` when the discriminator is not `codex`.
/// - `Json` / `InvalidTimestamp` for malformed codex documents.
pub fn deserialize(body: Value) -> WireResult<Codex> {
    decode_stored(body)?.ok_or(WireError::UnexpectedDocumentType)
}

/// Like [`deserialize`], but reports foreign document kinds as `Ok(None)`.
///
/// Used by range scans, where foreign kinds are filtered out silently.
pub fn decode_stored(body: Value) -> WireResult<Option<Codex>> {
    match serde_json::from_value::<StoredDocument>(body)? {
        StoredDocument::Codex(wire) => from_wire(wire).map(Some),
        StoredDocument::Other => Ok(None),
    }
}

pub fn to_wire(codex: &Codex) -> WireCodex {
    WireCodex {
        id: codex.id.clone(),
        story_id: codex.story_id.clone(),
        title: codex.title.clone(),
        categories: codex.categories.iter().map(category_to_wire).collect(),
        created_at: format_instant(&codex.created_at),
        updated_at: format_instant(&codex.updated_at),
    }
}

pub fn from_wire(wire: WireCodex) -> WireResult<Codex> {
    let categories = wire
        .categories
        .into_iter()
        .map(category_from_wire)
        .collect::<WireResult<Vec<_>>>()?;

    Ok(Codex {
        id: wire.id,
        story_id: wire.story_id,
        title: wire.title,
        categories,
        created_at: parse_instant("codex.createdAt", &wire.created_at)?,
        updated_at: parse_instant("codex.updatedAt", &wire.updated_at)?,
    })
}

fn category_to_wire(category: &Category) -> WireCategory {
    WireCategory {
        id: category.id.clone(),
        story_id: category.story_id.clone(),
        title: category.title.clone(),
        description: category.description.clone(),
        icon: category.icon.clone(),
        order: category.order,
        entries: category.entries.iter().map(entry_to_wire).collect(),
        created_at: format_instant(&category.created_at),
        updated_at: format_instant(&category.updated_at),
    }
}

fn category_from_wire(wire: WireCategory) -> WireResult<Category> {
    let entries = wire
        .entries
        .into_iter()
        .map(entry_from_wire)
        .collect::<WireResult<Vec<_>>>()?;

    Ok(Category {
        id: wire.id,
        story_id: wire.story_id,
        title: wire.title,
        description: wire.description,
        icon: wire.icon,
        order: wire.order,
        entries,
        created_at: parse_instant("category.createdAt", &wire.created_at)?,
        updated_at: parse_instant("category.updatedAt", &wire.updated_at)?,
    })
}

fn entry_to_wire(entry: &Entry) -> WireEntry {
    WireEntry {
        id: entry.id.clone(),
        category_id: entry.category_id.clone(),
        story_id: entry.story_id.clone(),
        title: entry.title.clone(),
        content: entry.content.clone(),
        tags: Some(entry.tags.clone()),
        image_url: entry.image_url.clone(),
        metadata: entry.metadata.clone(),
        custom_fields: if entry.custom_fields.is_empty() {
            None
        } else {
            Some(entry.custom_fields.clone())
        },
        order: entry.order,
        created_at: format_instant(&entry.created_at),
        updated_at: format_instant(&entry.updated_at),
    }
}

fn entry_from_wire(wire: WireEntry) -> WireResult<Entry> {
    Ok(Entry {
        id: wire.id,
        category_id: wire.category_id,
        story_id: wire.story_id,
        title: wire.title,
        content: wire.content,
        tags: wire.tags.unwrap_or_default(),
        image_url: wire.image_url,
        metadata: wire.metadata,
        custom_fields: wire.custom_fields.unwrap_or_default(),
        order: wire.order,
        created_at: parse_instant("entry.createdAt", &wire.created_at)?,
        updated_at: parse_instant("entry.updatedAt", &wire.updated_at)?,
    })
}

fn format_instant(value: &DateTime<Utc>) -> String {
    // AutoSi keeps exactly the sub-second digits present, so nothing is lost.
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_instant(field: &'static str, value: &str) -> WireResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|_| WireError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}
