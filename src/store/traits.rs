//! Graph store collaborator contract.
//!
//! The deduplicator never talks to a concrete storage engine. It opens write
//! transactions through a [`SessionFactory`] and performs all graph surgery via
//! [`WriteTransaction`]. Implementations must provide:
//! - Isolation: uncommitted changes are invisible to other transactions
//! - Atomicity: `commit` applies all changes or none
//! - Conflict detection: concurrent writers touching the same data fail with
//!   [`StoreError::Conflict`] rather than silently overwriting each other
//! - Cascading vertex removal: removing a vertex removes every incident edge

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attribute::VertexId;
use crate::error::StoreError;

/// Identifier of an edge within a keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub u64);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// Edge labels relevant to attribute ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeLabel {
    /// `owner -> attribute`: the owner has this attribute.
    Has,
    /// `relation -> player`: the player takes part in the relation.
    RolePlayer,
    /// Any other label; the merge leaves these alone.
    Other(String),
}

impl fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Has => f.write_str("has"),
            Self::RolePlayer => f.write_str("role-player"),
            Self::Other(label) => f.write_str(label),
        }
    }
}

/// Edge properties, copied verbatim when an edge is redirected.
pub type EdgeProperties = BTreeMap<String, serde_json::Value>;

/// Property key carrying the role name on role-player edges.
pub const ROLE_PROPERTY: &str = "role";

/// A directed edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Store-assigned id.
    pub id: EdgeId,
    /// Source vertex.
    pub from: VertexId,
    /// Target vertex.
    pub to: VertexId,
    /// Edge kind.
    pub label: EdgeLabel,
    /// Properties, such as the role of a role-player edge.
    pub properties: EdgeProperties,
}

/// Opens write transactions against the store.
pub trait SessionFactory: Send + Sync {
    /// Open one write transaction scoped to `keyspace`.
    fn open_write(&self, keyspace: &str) -> Result<Box<dyn WriteTransaction>, StoreError>;
}

/// One isolated write transaction.
///
/// Dropping a transaction without calling `commit` discards its changes.
pub trait WriteTransaction: Send {
    /// All attribute vertices whose value index equals `value_index`.
    fn attributes_by_index(&mut self, value_index: &str) -> Result<Vec<VertexId>, StoreError>;

    /// Edges with `label` pointing into `vertex`.
    ///
    /// # Errors
    /// - `VertexRemoved` if the vertex existed but is gone
    fn inbound_edges(
        &mut self,
        vertex: VertexId,
        label: &EdgeLabel,
    ) -> Result<Vec<Edge>, StoreError>;

    /// Add an edge and return its id.
    fn add_edge(
        &mut self,
        from: VertexId,
        to: VertexId,
        label: EdgeLabel,
        properties: EdgeProperties,
    ) -> Result<EdgeId, StoreError>;

    /// Remove a single edge.
    fn remove_edge(&mut self, edge: EdgeId) -> Result<(), StoreError>;

    /// Remove a vertex together with all of its incident edges.
    fn remove_vertex(&mut self, vertex: VertexId) -> Result<(), StoreError>;

    /// Atomically apply every change made in this transaction.
    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard every change made in this transaction.
    fn rollback(self: Box<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_session_factory_object_safe(_: &dyn SessionFactory) {}
    fn _assert_write_transaction_object_safe(_: &dyn WriteTransaction) {}

    #[test]
    fn test_edge_label_display() {
        assert_eq!(EdgeLabel::Has.to_string(), "has");
        assert_eq!(EdgeLabel::RolePlayer.to_string(), "role-player");
        assert_eq!(EdgeLabel::Other("isa".to_string()).to_string(), "isa");
    }
}
