//! # attrdedup - Attribute Deduplication for Graph Stores
//!
//! Attribute vertices are meant to be unique per value, but optimistic
//! writers may create several vertices for the same value concurrently. This
//! crate repairs that after the fact: writers record candidate duplicates in a
//! durable queue, and a background daemon merges them into one survivor.
//!
//! ## Core Concepts
//!
//! - **Value index**: deterministic key `ATTRIBUTE-<label>-<value>` shared by
//!   every vertex that stores the same attribute value
//! - **Queue**: durable at-least-once log of candidate duplicates, in memory or
//!   on disk
//! - **Daemon**: single background worker that drains the queue in batches
//! - **Deduplicator**: merges all vertices of one (keyspace, value index) pair
//!   into the lowest vertex id, redirecting ownership and role-player edges
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use attrdedup::{attribute_index, DaemonConfig, DedupDaemon, MemoryGraph, MemoryQueue};
//!
//! let graph = MemoryGraph::new();
//! let index = attribute_index("name", "alice");
//! let a = graph.insert_attribute("people", &index)?;
//! let b = graph.insert_attribute("people", &index)?;
//!
//! let daemon = DedupDaemon::new(
//!     Arc::new(MemoryQueue::new()),
//!     Arc::new(graph.clone()),
//!     DaemonConfig::default(),
//! )?;
//! daemon.start()?;
//! daemon.mark_for_deduplication("people", index.as_str(), a)?;
//! daemon.mark_for_deduplication("people", index.as_str(), b)?;
//! # while graph.attributes("people", &index)?.len() > 1 {
//! #     std::thread::sleep(std::time::Duration::from_millis(5));
//! # }
//! daemon.stop()?;
//!
//! assert_eq!(graph.attributes("people", &index)?, vec![a]);
//! # Ok::<(), attrdedup::DedupError>(())
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, deny(missing_docs))]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod attribute;
pub mod config;
pub mod daemon;
pub mod deduplicator;
pub mod error;
pub mod logging;
pub mod queue;
pub mod retry;
pub mod store;

pub use attribute::{
    attribute_index, Attribute, KeyspaceIndexPair, VertexId, ATTRIBUTE_INDEX_PREFIX,
};
pub use config::DedupConfig;
pub use daemon::{AckPolicy, DaemonConfig, DaemonHandle, DaemonStatsSnapshot, DedupDaemon};
pub use deduplicator::{deduplicate, MergeOutcome};
pub use error::{ConfigError, DedupError, DedupResult, QueueError, StoreError};
pub use logging::init_logging;
pub use queue::{
    open_queue, AttributeQueue, CancelToken, MemoryQueue, QueueBackend, QueueConfig,
    QueuedAttribute,
};
pub use retry::RetryPolicy;
pub use store::{
    Edge, EdgeId, EdgeLabel, EdgeProperties, MemoryGraph, SessionFactory, WriteTransaction,
    ROLE_PROPERTY,
};

#[cfg(feature = "persistent")]
pub use queue::{DiskQueue, DiskQueueOptions};
