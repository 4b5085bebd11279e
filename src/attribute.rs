//! Attribute records and grouping keys.
//!
//! An [`Attribute`] is the unit of work carried by the queue: "this vertex may
//! duplicate another attribute with the same value". The daemon groups records
//! by [`KeyspaceIndexPair`] so a burst of events for one value costs one merge.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix of every attribute value index.
pub const ATTRIBUTE_INDEX_PREFIX: &str = "ATTRIBUTE";

/// Opaque identifier of a vertex in the graph store.
///
/// Ids are totally ordered; the merge keeps the lowest id among duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VertexId(pub u64);

impl VertexId {
    /// Returns the raw id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.0)
    }
}

impl From<u64> for VertexId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Builds the canonical value index for `value` of attribute type `label`.
///
/// Two attribute vertices are duplicates exactly when they share this index.
#[must_use]
pub fn attribute_index(label: &str, value: &str) -> String {
    format!("{ATTRIBUTE_INDEX_PREFIX}-{label}-{value}")
}

/// A candidate-duplicate event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    /// Keyspace the vertex lives in.
    pub keyspace: String,
    /// Canonical value index (the uniqueness key).
    pub value_index: String,
    /// The vertex whose commit produced this event. Informational only.
    pub vertex_id: VertexId,
}

impl Attribute {
    /// Creates a new record.
    pub fn new(
        keyspace: impl Into<String>,
        value_index: impl Into<String>,
        vertex_id: VertexId,
    ) -> Self {
        Self {
            keyspace: keyspace.into(),
            value_index: value_index.into(),
            vertex_id,
        }
    }

    /// The grouping key of this record.
    #[must_use]
    pub fn pair(&self) -> KeyspaceIndexPair {
        KeyspaceIndexPair::new(self.keyspace.clone(), self.value_index.clone())
    }
}

/// Grouping key: one merge runs per distinct pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyspaceIndexPair {
    keyspace: String,
    value_index: String,
}

impl KeyspaceIndexPair {
    /// Pair for `value_index` inside `keyspace`.
    pub fn new(keyspace: impl Into<String>, value_index: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            value_index: value_index.into(),
        }
    }

    /// The keyspace.
    #[must_use]
    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    /// The attribute index.
    #[must_use]
    pub fn value_index(&self) -> &str {
        &self.value_index
    }
}

impl fmt::Display for KeyspaceIndexPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.value_index)
    }
}
