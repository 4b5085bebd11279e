//! Merge of attribute vertices that share one value index.
//!
//! Given a [`KeyspaceIndexPair`], every attribute vertex carrying that index
//! is folded into a single survivor inside one write transaction:
//!
//! ```text
//!   owner1 ─has─▶ V3          owner1 ─has─┐
//!   owner2 ─has─▶ V7    ==>   owner2 ─has─┼─▶ V3
//!   rel    ─rp──▶ V9          rel    ─rp──┘
//! ```
//!
//! The survivor is the lowest [`VertexId`], so concurrent or repeated merges
//! of the same pair always converge on the same vertex. Running the merge
//! again once it has converged finds a single vertex and changes nothing.

use tracing::{debug, info, warn};

use crate::attribute::{KeyspaceIndexPair, VertexId};
use crate::error::{DedupError, StoreError};
use crate::store::{EdgeLabel, SessionFactory, WriteTransaction};

/// Labels whose inbound edges move from a duplicate to the survivor.
const REDIRECTED_LABELS: [EdgeLabel; 2] = [EdgeLabel::Has, EdgeLabel::RolePlayer];

/// What a single merge did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Surviving vertex; `None` when no vertex carries the index.
    pub target: Option<VertexId>,
    /// Duplicates removed, ascending.
    pub removed: Vec<VertexId>,
    /// Duplicates skipped because they were already gone.
    pub skipped: Vec<VertexId>,
    /// Inbound edges moved onto the survivor.
    pub edges_redirected: usize,
}

impl MergeOutcome {
    /// True when the merge left the store untouched.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty()
    }
}

/// Merge every attribute vertex indexed by `pair` into the lowest id.
///
/// All changes happen in one transaction. Fewer than two matching vertices is
/// a no-op and the transaction is rolled back.
///
/// # Errors
/// - `Store` if the transaction cannot be opened, a store call fails with
///   anything other than the duplicate having been removed, or commit fails
///   (including `Conflict`, which callers may retry)
pub fn deduplicate(
    sessions: &dyn SessionFactory,
    pair: &KeyspaceIndexPair,
) -> Result<MergeOutcome, DedupError> {
    let mut tx = sessions.open_write(pair.keyspace())?;

    let mut ids = match tx.attributes_by_index(pair.value_index()) {
        Ok(ids) => ids,
        Err(e) => {
            tx.rollback();
            return Err(e.into());
        }
    };
    ids.sort_unstable();
    ids.dedup();

    let Some((&target, duplicates)) = ids.split_first() else {
        tx.rollback();
        debug!(
            keyspace = pair.keyspace(),
            value_index = pair.value_index(),
            "no attribute to merge"
        );
        return Ok(MergeOutcome::default());
    };

    let mut outcome = MergeOutcome {
        target: Some(target),
        ..MergeOutcome::default()
    };

    if duplicates.is_empty() {
        tx.rollback();
        debug!(
            keyspace = pair.keyspace(),
            value_index = pair.value_index(),
            %target,
            "attribute already unique"
        );
        return Ok(outcome);
    }

    for &duplicate in duplicates {
        match merge_into(tx.as_mut(), target, duplicate) {
            Ok(redirected) => {
                outcome.edges_redirected += redirected;
                outcome.removed.push(duplicate);
            }
            Err(StoreError::VertexRemoved(gone)) if gone == duplicate => {
                warn!(
                    keyspace = pair.keyspace(),
                    value_index = pair.value_index(),
                    %duplicate,
                    "duplicate already removed, skipping"
                );
                outcome.skipped.push(duplicate);
            }
            Err(e) => {
                tx.rollback();
                return Err(e.into());
            }
        }
    }

    tx.commit()?;

    if outcome.removed.is_empty() {
        debug!(
            keyspace = pair.keyspace(),
            value_index = pair.value_index(),
            %target,
            "nothing merged"
        );
    } else {
        info!(
            keyspace = pair.keyspace(),
            value_index = pair.value_index(),
            %target,
            removed = outcome.removed.len(),
            edges = outcome.edges_redirected,
            "merged duplicate attributes"
        );
    }
    Ok(outcome)
}

/// Move the inbound edges of `duplicate` onto `target`, then drop it.
fn merge_into(
    tx: &mut dyn WriteTransaction,
    target: VertexId,
    duplicate: VertexId,
) -> Result<usize, StoreError> {
    let mut redirected = 0;
    for label in &REDIRECTED_LABELS {
        for edge in tx.inbound_edges(duplicate, label)? {
            tx.add_edge(edge.from, target, edge.label, edge.properties)?;
            tx.remove_edge(edge.id)?;
            redirected += 1;
        }
    }
    tx.remove_vertex(duplicate)?;
    debug!(%duplicate, %target, redirected, "redirected duplicate");
    Ok(redirected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EdgeProperties, MemoryGraph, ROLE_PROPERTY};

    fn pair() -> KeyspaceIndexPair {
        KeyspaceIndexPair::new("k", "ATTRIBUTE-name-v")
    }

    #[test]
    fn merges_into_lowest_id() {
        let graph = MemoryGraph::new();
        let a = graph.insert_attribute("k", "ATTRIBUTE-name-v").unwrap();
        let b = graph.insert_attribute("k", "ATTRIBUTE-name-v").unwrap();
        let owner = graph.insert_vertex("k", "person").unwrap();
        graph
            .add_edge("k", owner, b, EdgeLabel::Has, EdgeProperties::new())
            .unwrap();

        let outcome = deduplicate(&graph, &pair()).unwrap();
        assert_eq!(outcome.target, Some(a.min(b)));
        assert_eq!(outcome.removed, vec![a.max(b)]);
        assert_eq!(outcome.edges_redirected, 1);
        assert_eq!(graph.attributes("k", "ATTRIBUTE-name-v").unwrap(), vec![a]);
        assert_eq!(graph.inbound_edges("k", a, &EdgeLabel::Has).unwrap().len(), 1);
    }

    #[test]
    fn role_property_survives_redirect() {
        let graph = MemoryGraph::new();
        let a = graph.insert_attribute("k", "ATTRIBUTE-name-v").unwrap();
        let b = graph.insert_attribute("k", "ATTRIBUTE-name-v").unwrap();
        let rel = graph.insert_vertex("k", "marriage").unwrap();
        let mut props = EdgeProperties::new();
        props.insert(ROLE_PROPERTY.to_string(), serde_json::json!("spouse"));
        graph.add_edge("k", rel, b, EdgeLabel::RolePlayer, props).unwrap();

        deduplicate(&graph, &pair()).unwrap();

        let edges = graph.inbound_edges("k", a, &EdgeLabel::RolePlayer).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].from, rel);
        assert_eq!(edges[0].properties[ROLE_PROPERTY], "spouse");
    }

    #[test]
    fn other_labels_are_dropped_with_duplicate() {
        let graph = MemoryGraph::new();
        let a = graph.insert_attribute("k", "ATTRIBUTE-name-v").unwrap();
        let b = graph.insert_attribute("k", "ATTRIBUTE-name-v").unwrap();
        let t = graph.insert_vertex("k", "type").unwrap();
        graph
            .add_edge("k", t, b, EdgeLabel::Other("isa".to_string()), EdgeProperties::new())
            .unwrap();
        let edges_before = graph.edge_count("k").unwrap();

        let outcome = deduplicate(&graph, &pair()).unwrap();
        assert_eq!(outcome.edges_redirected, 0);
        assert_eq!(graph.edge_count("k").unwrap(), edges_before - 1);
        assert!(graph.vertex_exists("k", a).unwrap());
        assert!(!graph.vertex_exists("k", b).unwrap());
    }

    #[test]
    fn unknown_index_is_noop() {
        let graph = MemoryGraph::new();
        graph.create_keyspace("k").unwrap();
        let version = graph.version("k").unwrap();

        let outcome = deduplicate(&graph, &pair()).unwrap();
        assert_eq!(outcome, MergeOutcome::default());
        assert!(outcome.is_noop());
        assert_eq!(graph.version("k").unwrap(), version);
    }

    #[test]
    fn unknown_keyspace_is_error() {
        let graph = MemoryGraph::new();
        let err = deduplicate(&graph, &pair()).unwrap_err();
        assert!(matches!(err, DedupError::Store(StoreError::KeyspaceNotFound(_))));
    }
}
