//! Repository layer over the revisioned document store.
//!
//! # Responsibility
//! - Orchestrate read-modify-write cycles for the codex aggregate.
//! - Translate storage conflicts into bounded retries and semantic errors.
//!
//! # Invariants
//! - The cache only ever reflects confirmed writes.
//! - Repository APIs return semantic errors (`CodexNotFound`,
//!   `ConflictExhausted`) in addition to store transport errors.

pub mod codex_repo;
