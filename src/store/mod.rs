// src/store/mod.rs

//! In-memory asset storage used by the local backend.
//!
//! - [`memory`] holds the keyed store itself and the shared handle type.
//! - [`filters`] implements list filtering and ordering.
//! - [`denormalize`] resolves task inputs at read time.

pub mod denormalize;
pub mod filters;
pub mod memory;

pub use filters::{Filters, filters};
pub use memory::{InMemoryAssetStore, SharedStore, lock_store};
