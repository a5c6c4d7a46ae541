//! Domain model for the per-story codex aggregate.
//!
//! # Responsibility
//! - Define the typed aggregate held in memory and handed to callers.
//! - Keep transforms pure with respect to storage: nothing here performs I/O.
//!
//! # Invariants
//! - Timestamps are typed instants; wire strings never reach this layer.
//! - One codex per story identifier.

pub mod codex;
