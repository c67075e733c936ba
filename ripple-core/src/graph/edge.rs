//! Dependency Edges
//!
//! An edge records that `target` read `source` during its last evaluation.
//! Each edge sits in two intrusive lists at once, linked by id:
//!
//! - the target's dependency list (`prev_source` / `next_source`), ordered by
//!   discovery in the latest run
//! - the source's dependent list (`prev_target` / `next_target`), unordered,
//!   and only while the target is tracking

use std::sync::atomic::{AtomicU64, Ordering};

use super::node::NodeId;

/// Unique identifier for an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(u64);

impl EdgeId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub(crate) source: NodeId,
    pub(crate) target: NodeId,

    /// Source version at the last validated read. `None` while a
    /// re-evaluation of the target has not re-observed this edge yet.
    pub(crate) observed: Option<u64>,

    pub(crate) prev_source: Option<EdgeId>,
    pub(crate) next_source: Option<EdgeId>,
    pub(crate) prev_target: Option<EdgeId>,
    pub(crate) next_target: Option<EdgeId>,

    /// Whether the edge is linked into the source's dependent list.
    pub(crate) linked: bool,

    /// The source's previous `slot`, restored once the target's run ends.
    pub(crate) rollback: Option<EdgeId>,
}

impl Edge {
    pub fn new(source: NodeId, target: NodeId) -> Self {
        Self {
            source,
            target,
            observed: Some(0),
            prev_source: None,
            next_source: None,
            prev_target: None,
            next_target: None,
            linked: false,
            rollback: None,
        }
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// True when the edge was observed at exactly `version`.
    pub fn observed_at(&self, version: u64) -> bool {
        self.observed == Some(version)
    }
}
