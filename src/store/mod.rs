//! Graph store collaborator.
//!
//! The traits define what the deduplicator needs from the storage engine; the
//! in-memory graph is a reference implementation used by tests and embedders.

mod memory;
mod traits;

pub use memory::{MemoryGraph, MemoryTransaction};
pub use traits::{
    Edge, EdgeId, EdgeLabel, EdgeProperties, SessionFactory, WriteTransaction, ROLE_PROPERTY,
};
