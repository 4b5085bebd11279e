//! In-memory graph store.
//!
//! A small, thread-safe reference implementation of the store contract. It is
//! intended for tests, embedded use, and as the executable definition of what
//! the deduplicator expects from a real storage engine.
//!
//! Transactions take a private snapshot of their keyspace and validate at
//! commit that the keyspace version has not moved; any concurrent commit or
//! direct write to the same keyspace makes the later commit fail with
//! [`StoreError::Conflict`]. Conflict detection is therefore keyspace-wide,
//! which is coarser than a real engine but never lets a lost update through.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::attribute::VertexId;
use crate::error::StoreError;
use crate::store::traits::{
    Edge, EdgeId, EdgeLabel, EdgeProperties, SessionFactory, WriteTransaction,
};

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Backend(format!("poisoned lock: {context}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum VertexKind {
    Attribute { value_index: String },
    Thing { label: String },
}

#[derive(Debug, Clone, Default)]
struct KeyspaceGraph {
    version: u64,
    vertices: HashMap<VertexId, VertexKind>,
    edges: BTreeMap<EdgeId, Edge>,
    by_index: HashMap<String, BTreeSet<VertexId>>,
    removed: HashSet<VertexId>,
}

impl KeyspaceGraph {
    fn check_vertex(&self, vertex: VertexId) -> Result<(), StoreError> {
        if self.vertices.contains_key(&vertex) {
            Ok(())
        } else if self.removed.contains(&vertex) {
            Err(StoreError::VertexRemoved(vertex))
        } else {
            Err(StoreError::VertexNotFound(vertex))
        }
    }

    fn insert_vertex(&mut self, id: VertexId, kind: VertexKind) {
        if let VertexKind::Attribute { value_index } = &kind {
            self.by_index.entry(value_index.clone()).or_default().insert(id);
        }
        self.vertices.insert(id, kind);
    }

    fn attributes(&self, value_index: &str) -> Vec<VertexId> {
        self.by_index
            .get(value_index)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn inbound_edges(&self, vertex: VertexId, label: &EdgeLabel) -> Result<Vec<Edge>, StoreError> {
        self.check_vertex(vertex)?;
        Ok(self
            .edges
            .values()
            .filter(|e| e.to == vertex && &e.label == label)
            .cloned()
            .collect())
    }

    fn add_edge(
        &mut self,
        id: EdgeId,
        from: VertexId,
        to: VertexId,
        label: EdgeLabel,
        properties: EdgeProperties,
    ) -> Result<EdgeId, StoreError> {
        self.check_vertex(from)?;
        self.check_vertex(to)?;
        self.edges.insert(
            id,
            Edge {
                id,
                from,
                to,
                label,
                properties,
            },
        );
        Ok(id)
    }

    fn remove_edge(&mut self, edge: EdgeId) -> Result<(), StoreError> {
        self.edges
            .remove(&edge)
            .map(|_| ())
            .ok_or(StoreError::EdgeNotFound(edge.0))
    }

    fn remove_vertex(&mut self, vertex: VertexId) -> Result<(), StoreError> {
        self.check_vertex(vertex)?;
        if let Some(VertexKind::Attribute { value_index }) = self.vertices.remove(&vertex) {
            if let Some(ids) = self.by_index.get_mut(&value_index) {
                ids.remove(&vertex);
                if ids.is_empty() {
                    self.by_index.remove(&value_index);
                }
            }
        }
        self.edges.retain(|_, e| e.from != vertex && e.to != vertex);
        self.removed.insert(vertex);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GraphInner {
    keyspaces: RwLock<HashMap<String, KeyspaceGraph>>,
    next_vertex: AtomicU64,
    next_edge: AtomicU64,
}

impl GraphInner {
    fn vertex_id(&self) -> VertexId {
        VertexId(self.next_vertex.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn edge_id(&self) -> EdgeId {
        EdgeId(self.next_edge.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Run `f` against a keyspace as a single auto-committed write.
    fn write<T>(
        &self,
        keyspace: &str,
        f: impl FnOnce(&mut KeyspaceGraph) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut keyspaces = self.keyspaces.write().map_err(|_| lock_err("graph write"))?;
        let graph = keyspaces.entry(keyspace.to_string()).or_default();
        let out = f(graph)?;
        graph.version += 1;
        Ok(out)
    }

    fn read<T>(
        &self,
        keyspace: &str,
        f: impl FnOnce(&KeyspaceGraph) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let keyspaces = self.keyspaces.read().map_err(|_| lock_err("graph read"))?;
        let graph = keyspaces
            .get(keyspace)
            .ok_or_else(|| StoreError::KeyspaceNotFound(keyspace.to_string()))?;
        f(graph)
    }
}

/// Thread-safe in-memory graph; cheap to clone (shared state).
#[derive(Debug, Clone, Default)]
pub struct MemoryGraph {
    inner: Arc<GraphInner>,
}

impl MemoryGraph {
    /// An empty graph without keyspaces.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty keyspace if it does not exist yet.
    pub fn create_keyspace(&self, keyspace: &str) -> Result<(), StoreError> {
        self.inner.write(keyspace, |_| Ok(()))
    }

    /// Insert an attribute vertex without any uniqueness check, the way an
    /// optimistic writer does.
    pub fn insert_attribute(
        &self,
        keyspace: &str,
        value_index: &str,
    ) -> Result<VertexId, StoreError> {
        let id = self.inner.vertex_id();
        self.inner.write(keyspace, |g| {
            g.insert_vertex(
                id,
                VertexKind::Attribute {
                    value_index: value_index.to_string(),
                },
            );
            Ok(id)
        })
    }

    /// Insert a non-attribute vertex (entity, relation, ...).
    pub fn insert_vertex(&self, keyspace: &str, label: &str) -> Result<VertexId, StoreError> {
        let id = self.inner.vertex_id();
        self.inner.write(keyspace, |g| {
            g.insert_vertex(
                id,
                VertexKind::Thing {
                    label: label.to_string(),
                },
            );
            Ok(id)
        })
    }

    /// Add an edge outside any transaction.
    pub fn add_edge(
        &self,
        keyspace: &str,
        from: VertexId,
        to: VertexId,
        label: EdgeLabel,
        properties: EdgeProperties,
    ) -> Result<EdgeId, StoreError> {
        let id = self.inner.edge_id();
        self.inner
            .write(keyspace, |g| g.add_edge(id, from, to, label, properties))
    }

    /// Remove `vertex` and every edge touching it.
    pub fn remove_vertex(&self, keyspace: &str, vertex: VertexId) -> Result<(), StoreError> {
        self.inner.write(keyspace, |g| g.remove_vertex(vertex))
    }

    /// Attribute vertices currently holding `value_index`, ascending by id.
    pub fn attributes(
        &self,
        keyspace: &str,
        value_index: &str,
    ) -> Result<Vec<VertexId>, StoreError> {
        self.inner.read(keyspace, |g| Ok(g.attributes(value_index)))
    }

    /// Inbound edges of `vertex` with `label`.
    pub fn inbound_edges(
        &self,
        keyspace: &str,
        vertex: VertexId,
        label: &EdgeLabel,
    ) -> Result<Vec<Edge>, StoreError> {
        self.inner.read(keyspace, |g| g.inbound_edges(vertex, label))
    }

    /// Outbound edges of `vertex` with `label`.
    pub fn outbound_edges(
        &self,
        keyspace: &str,
        vertex: VertexId,
        label: &EdgeLabel,
    ) -> Result<Vec<Edge>, StoreError> {
        self.inner.read(keyspace, |g| {
            g.check_vertex(vertex)?;
            Ok(g.edges
                .values()
                .filter(|e| e.from == vertex && &e.label == label)
                .cloned()
                .collect())
        })
    }

    /// Whether `vertex` is live in the keyspace.
    pub fn vertex_exists(&self, keyspace: &str, vertex: VertexId) -> Result<bool, StoreError> {
        self.inner.read(keyspace, |g| Ok(g.vertices.contains_key(&vertex)))
    }

    /// Live vertices in the keyspace.
    pub fn vertex_count(&self, keyspace: &str) -> Result<usize, StoreError> {
        self.inner.read(keyspace, |g| Ok(g.vertices.len()))
    }

    /// Edges in the keyspace.
    pub fn edge_count(&self, keyspace: &str) -> Result<usize, StoreError> {
        self.inner.read(keyspace, |g| Ok(g.edges.len()))
    }

    /// Number of commits (transactional or direct) applied to the keyspace.
    pub fn version(&self, keyspace: &str) -> Result<u64, StoreError> {
        self.inner.read(keyspace, |g| Ok(g.version))
    }
}

impl SessionFactory for MemoryGraph {
    fn open_write(&self, keyspace: &str) -> Result<Box<dyn WriteTransaction>, StoreError> {
        let snapshot = self.inner.read(keyspace, |g| Ok(g.clone()))?;
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            keyspace: keyspace.to_string(),
            base_version: snapshot.version,
            working: snapshot,
            dirty: false,
        }))
    }
}

/// Snapshot-isolated transaction over one keyspace of a [`MemoryGraph`].
#[derive(Debug)]
pub struct MemoryTransaction {
    inner: Arc<GraphInner>,
    keyspace: String,
    base_version: u64,
    working: KeyspaceGraph,
    dirty: bool,
}

impl WriteTransaction for MemoryTransaction {
    fn attributes_by_index(&mut self, value_index: &str) -> Result<Vec<VertexId>, StoreError> {
        Ok(self.working.attributes(value_index))
    }

    fn inbound_edges(
        &mut self,
        vertex: VertexId,
        label: &EdgeLabel,
    ) -> Result<Vec<Edge>, StoreError> {
        self.working.inbound_edges(vertex, label)
    }

    fn add_edge(
        &mut self,
        from: VertexId,
        to: VertexId,
        label: EdgeLabel,
        properties: EdgeProperties,
    ) -> Result<EdgeId, StoreError> {
        let id = self.inner.edge_id();
        let out = self.working.add_edge(id, from, to, label, properties)?;
        self.dirty = true;
        Ok(out)
    }

    fn remove_edge(&mut self, edge: EdgeId) -> Result<(), StoreError> {
        self.working.remove_edge(edge)?;
        self.dirty = true;
        Ok(())
    }

    fn remove_vertex(&mut self, vertex: VertexId) -> Result<(), StoreError> {
        self.working.remove_vertex(vertex)?;
        self.dirty = true;
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        if !this.dirty {
            return Ok(());
        }

        let mut keyspaces = this.inner.keyspaces.write().map_err(|_| lock_err("graph commit"))?;
        let current = keyspaces
            .get_mut(&this.keyspace)
            .ok_or_else(|| StoreError::KeyspaceNotFound(this.keyspace.clone()))?;

        if current.version != this.base_version {
            return Err(StoreError::Conflict(format!(
                "keyspace '{}' moved from version {} to {} during transaction",
                this.keyspace, this.base_version, current.version
            )));
        }

        let mut working = this.working;
        working.version = this.base_version + 1;
        *current = working;
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}
