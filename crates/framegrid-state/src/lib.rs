//! framegrid-state: data model and embedded state store for framegrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for clusters (with their nodes), render jobs and render tasks.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by their identifiers. Tasks are additionally listable per job via
//! the `job_id` they carry.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is the repository injected into the scheduler and autoscaler.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

/// Current Unix time in milliseconds, the unit of every stored timestamp.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
