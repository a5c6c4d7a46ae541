//! Read-only query helpers over a cached codex.
//!
//! # Responsibility
//! - Substring search across entries.
//! - Category grouping consumed by highlighting and listing views.

pub mod entries;
