//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.

use std::cell::RefCell;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::edge::EdgeId;
use crate::error::Error;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A versioned mutable cell. Has dependents, never dependencies.
    Source,

    /// A lazily recomputed cell. Has both dependencies and dependents.
    Derived,

    /// An eager side-effecting leaf. Has dependencies but no dependents.
    Subscriber,
}

/// Status bits of a node.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Currently evaluating (on the evaluation stack).
    pub const RUNNING: Flags = Flags(1 << 0);
    /// A push notification reached this node and has not been consumed.
    pub const NOTIFIED: Flags = Flags(1 << 1);
    /// Something upstream may have changed since the last validation.
    pub const OUTDATED: Flags = Flags(1 << 2);
    /// Subscriber was disposed. Terminal.
    pub const DISPOSED: Flags = Flags(1 << 3);
    /// The cached value of a derived node is an error.
    pub const HAS_ERROR: Flags = Flags(1 << 4);
    /// Subscribed to its own dependencies, so pushes reach it.
    pub const TRACKING: Flags = Flags(1 << 5);
    /// The last run unwound before completing. Recompute on next read.
    pub const ABORTED: Flags = Flags(1 << 6);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Flags, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }

    /// Keep only the bits in `mask`.
    pub fn masked(self, mask: Flags) -> Flags {
        Flags(self.0 & mask.0)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 7] = [
            (Flags::RUNNING, "RUNNING"),
            (Flags::NOTIFIED, "NOTIFIED"),
            (Flags::OUTDATED, "OUTDATED"),
            (Flags::DISPOSED, "DISPOSED"),
            (Flags::HAS_ERROR, "HAS_ERROR"),
            (Flags::TRACKING, "TRACKING"),
            (Flags::ABORTED, "ABORTED"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{}", name));
            }
        }
        set.finish()
    }
}

/// Result of evaluating a node's computation.
#[derive(Debug, Clone)]
pub enum Evaluation {
    /// Ran, and the observable value did not change.
    Unchanged,
    /// Ran, and the observable value changed.
    Changed,
    /// The computation returned an error.
    Failed(Error),
}

/// The type-erased computation attached to a derived or subscriber node.
///
/// The graph never holds typed values; the handle side implements this
/// trait over its own state so the runtime can re-evaluate a node by id.
pub trait Computation {
    fn evaluate(&self) -> Evaluation;
}

pub type Cleanup = Box<dyn FnOnce()>;

/// Watch lifecycle hooks of a source or derived node.
#[derive(Default)]
pub struct WatchHooks {
    pub(crate) on_read: Option<Box<dyn Fn()>>,
    pub(crate) on_watch: Option<Box<dyn Fn() -> Option<Cleanup>>>,
    pub(crate) on_unwatch: RefCell<Option<Cleanup>>,
}

impl WatchHooks {
    pub fn is_empty(&self) -> bool {
        self.on_read.is_none() && self.on_watch.is_none()
    }
}

/// A queued watch hook invocation, run once the graph is released.
pub enum HookCall {
    Watch(Rc<WatchHooks>),
    Unwatch(Rc<WatchHooks>),
}

/// A node in the dependency graph.
pub struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) flags: Flags,

    /// Bumped every time the observable value changes.
    pub(crate) version: u64,

    /// Global version seen by the last validity check (derived only).
    pub(crate) global_version: Option<u64>,

    /// Edge currently standing for this node in the innermost evaluation
    /// that reads it.
    pub(crate) slot: Option<EdgeId>,

    /// Head of the dependent-edge list.
    pub(crate) targets: Option<EdgeId>,

    /// Dependency-edge list, in discovery order.
    pub(crate) sources_head: Option<EdgeId>,
    pub(crate) sources_tail: Option<EdgeId>,

    pub(crate) computation: Option<Rc<dyn Computation>>,
    pub(crate) hooks: Option<Rc<WatchHooks>>,
}

impl Node {
    /// Create a new node with the given kind.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            flags: match kind {
                NodeKind::Source => Flags::NONE,
                // Start outdated to ensure first computation
                NodeKind::Derived => Flags::OUTDATED,
                NodeKind::Subscriber => Flags::TRACKING,
            },
            version: 0,
            global_version: None,
            slot: None,
            targets: None,
            sources_head: None,
            sources_tail: None,
            computation: None,
            hooks: None,
        }
    }

    /// Create a new source node.
    pub fn source() -> Self {
        Self::new(NodeKind::Source)
    }

    /// Create a new derived node.
    pub fn derived(computation: Rc<dyn Computation>) -> Self {
        let mut node = Self::new(NodeKind::Derived);
        node.computation = Some(computation);
        node
    }

    /// Create a new subscriber node.
    pub fn subscriber(computation: Rc<dyn Computation>) -> Self {
        let mut node = Self::new(NodeKind::Subscriber);
        node.computation = Some(computation);
        node
    }

    pub fn with_hooks(mut self, hooks: Option<Rc<WatchHooks>>) -> Self {
        self.hooks = hooks.filter(|h| !h.is_empty());
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_watched(&self) -> bool {
        self.targets.is_some()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("version", &self.version)
            .field("watched", &self.is_watched())
            .finish()
    }
}
