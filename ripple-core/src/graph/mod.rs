//! Dependency Graph
//!
//! This module implements the data structure that records which reactive
//! computations read which cells, and the bookkeeping needed to keep that
//! record correct across re-evaluations.
//!
//! # Overview
//!
//! - Nodes represent sources, derived values or subscribers
//! - Edges represent dependencies: if A read B, there is an edge from B to A
//!
//! Each edge is threaded through two intrusive lists: the target's ordered
//! dependency list and the source's dependent list. Lists link edges by id,
//! so the whole graph lives in two maps owned by the runtime.
//!
//! # Design Decisions
//!
//! 1. Edges are reused across runs. Before a target re-evaluates, its edges
//!    are marked unvisited; reads re-mark them; whatever is still unvisited
//!    afterwards is retired. Conditional dependencies drop out on their own.
//!
//! 2. A source's `slot` points at the edge of the innermost evaluation that
//!    reads it, which makes "did this target already read me" O(1). Nested
//!    evaluations of the same source save and restore the slot through the
//!    edge's `rollback` field.
//!
//! 3. A target only sits in its sources' dependent lists while it is
//!    tracking (a subscriber, or a derived value someone subscribes to).
//!    Unwatched derived values are purely pull-based.
//!
//! 4. Nothing here calls user code. Watch hooks fired by list transitions
//!    are returned as [`HookCall`]s for the runtime to run later.

mod edge;
mod node;
mod scheduler;

use std::collections::HashMap;

pub use edge::{Edge, EdgeId};
pub use node::{Cleanup, Computation, Evaluation, Flags, HookCall, Node, NodeId, NodeKind, WatchHooks};
pub use scheduler::BatchScheduler;

/// Arena of nodes and edges.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: HashMap<NodeId, Node>,
    edges: HashMap<EdgeId, Edge>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the graph.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = NodeId::new();
        self.nodes.insert(id, node);
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn version(&self, id: NodeId) -> Option<u64> {
        self.nodes.get(&id).map(|node| node.version)
    }

    pub fn first_dependency(&self, target: NodeId) -> Option<EdgeId> {
        self.nodes.get(&target).and_then(|node| node.sources_head)
    }

    pub fn next_dependency(&self, edge: EdgeId) -> Option<EdgeId> {
        self.edges.get(&edge).and_then(|edge| edge.next_source)
    }

    /// Dependency edges of `target`, in discovery order.
    pub fn dependencies(&self, target: NodeId) -> Vec<EdgeId> {
        let mut out = Vec::new();
        let mut cursor = self.first_dependency(target);
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.next_dependency(id);
        }
        out
    }

    /// Dependent edges of `source`.
    pub fn dependents(&self, source: NodeId) -> Vec<EdgeId> {
        let mut out = Vec::new();
        let mut cursor = self.nodes.get(&source).and_then(|node| node.targets);
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.edges.get(&id).and_then(|edge| edge.next_target);
        }
        out
    }

    pub fn dependency_count(&self, target: NodeId) -> usize {
        self.dependencies(target).len()
    }

    pub fn dependent_count(&self, source: NodeId) -> usize {
        self.dependents(source).len()
    }

    /// Record that `target` (the active evaluation) read `source`.
    ///
    /// Returns the edge whose observed version the caller should stamp, or
    /// `None` when the read collapses into an edge already visited this run.
    pub fn discover(
        &mut self,
        source: NodeId,
        target: NodeId,
        hooks: &mut Vec<HookCall>,
    ) -> Option<EdgeId> {
        let slot = self.nodes.get(&source)?.slot;
        let current = slot.filter(|id| {
            self.edges
                .get(id)
                .map_or(false, |edge| edge.target == target)
        });

        match current {
            None => {
                let tracking = self.nodes.get(&target)?.flags.contains(Flags::TRACKING);
                let id = EdgeId::new();
                let mut edge = Edge::new(source, target);
                edge.rollback = slot;
                self.edges.insert(id, edge);
                self.push_dependency(target, id);

                if let Some(node) = self.nodes.get_mut(&source) {
                    node.slot = Some(id);
                }
                if tracking {
                    self.subscribe(source, id, hooks);
                }
                Some(id)
            }
            Some(id) => {
                let edge = self.edges.get_mut(&id)?;
                if edge.observed.is_some() {
                    return None;
                }
                edge.observed = Some(0);

                // Most recently used goes last
                if edge.next_source.is_some() {
                    self.detach_dependency(target, id);
                    self.push_dependency(target, id);
                }
                Some(id)
            }
        }
    }

    /// Stamp the version `edge` observed its source at.
    pub fn set_observed(&mut self, edge: EdgeId, version: u64) {
        if let Some(edge) = self.edges.get_mut(&edge) {
            edge.observed = Some(version);
        }
    }

    /// Mark every dependency of `target` unvisited and point each source's
    /// slot at the corresponding edge, saving the old slot for rollback.
    pub fn prepare_sources(&mut self, target: NodeId) {
        for id in self.dependencies(target) {
            let Some(source) = self.edges.get(&id).map(|edge| edge.source) else {
                continue;
            };
            let previous = self
                .nodes
                .get_mut(&source)
                .and_then(|node| node.slot.replace(id));

            if let Some(edge) = self.edges.get_mut(&id) {
                if previous.is_some() {
                    edge.rollback = previous;
                }
                edge.observed = None;
            }
        }
    }

    /// Retire every dependency of `target` that the last run did not
    /// re-observe, and restore every source's slot.
    pub fn cleanup_sources(&mut self, target: NodeId, hooks: &mut Vec<HookCall>) {
        let mut cursor = self.nodes.get(&target).and_then(|node| node.sources_tail);

        while let Some(id) = cursor {
            let Some(edge) = self.edges.get(&id) else {
                break;
            };
            let prev = edge.prev_source;
            let source = edge.source;
            let unvisited = edge.observed.is_none();

            if unvisited {
                self.unsubscribe(source, id, hooks);
                self.detach_dependency(target, id);
            }

            let rollback = self.edges.get_mut(&id).and_then(|edge| edge.rollback.take());
            if let Some(node) = self.nodes.get_mut(&source) {
                node.slot = rollback;
            }

            if unvisited {
                self.edges.remove(&id);
            }
            cursor = prev;
        }
    }

    /// Link `edge` into `source`'s dependent list. A derived source that
    /// gains its first dependent starts tracking its own dependencies.
    pub fn subscribe(&mut self, source: NodeId, edge: EdgeId, hooks: &mut Vec<HookCall>) {
        let Some(node) = self.nodes.get_mut(&source) else {
            return;
        };

        if node.kind == NodeKind::Derived && node.targets.is_none() {
            node.flags.insert(Flags::OUTDATED | Flags::TRACKING);
            for id in self.dependencies(source) {
                if let Some(upstream) = self.edges.get(&id).map(|edge| edge.source) {
                    self.subscribe(upstream, id, hooks);
                }
            }
        }

        self.link_dependent(source, edge, hooks);
    }

    /// Unlink `edge` from `source`'s dependent list. A derived source that
    /// loses its last dependent stops tracking and returns to pull mode.
    pub fn unsubscribe(&mut self, source: NodeId, edge: EdgeId, hooks: &mut Vec<HookCall>) {
        if !self.unlink_dependent(source, edge, hooks) {
            return;
        }

        let Some(node) = self.nodes.get_mut(&source) else {
            return;
        };
        if node.kind == NodeKind::Derived
            && node.targets.is_none()
            && node.flags.contains(Flags::TRACKING)
        {
            node.flags.remove(Flags::TRACKING);
            for id in self.dependencies(source) {
                if let Some(upstream) = self.edges.get(&id).map(|edge| edge.source) {
                    self.unsubscribe(upstream, id, hooks);
                }
            }
        }
    }

    /// Push-phase notification of `target`.
    ///
    /// Derived nodes mark themselves outdated and forward to their own
    /// dependents; subscribers queue themselves. Already notified nodes stop
    /// the walk.
    pub fn notify(&mut self, target: NodeId, scheduler: &mut BatchScheduler) {
        let Some(node) = self.nodes.get_mut(&target) else {
            return;
        };
        if node.flags.contains(Flags::NOTIFIED) {
            return;
        }

        let kind = node.kind;
        match kind {
            NodeKind::Derived => {
                node.flags.insert(Flags::OUTDATED | Flags::NOTIFIED);
                self.notify_dependents(target, scheduler);
            }
            NodeKind::Subscriber => {
                node.flags.insert(Flags::NOTIFIED);
                scheduler.enqueue(target);
            }
            NodeKind::Source => {}
        }
    }

    /// Notify every dependent of `source`.
    pub fn notify_dependents(&mut self, source: NodeId, scheduler: &mut BatchScheduler) {
        let mut cursor = self.nodes.get(&source).and_then(|node| node.targets);
        while let Some(id) = cursor {
            let Some(edge) = self.edges.get(&id) else {
                break;
            };
            let (target, next) = (edge.target, edge.next_target);
            self.notify(target, scheduler);
            cursor = next;
        }
    }

    /// Unsubscribe every dependency of `target` but keep the edges in its
    /// list. Used when a running subscriber is disposed: the list is still
    /// in use by the run and is retired once it completes.
    pub fn unsubscribe_dependencies(&mut self, target: NodeId, hooks: &mut Vec<HookCall>) {
        for id in self.dependencies(target) {
            if let Some(source) = self.edges.get(&id).map(|edge| edge.source) {
                self.unsubscribe(source, id, hooks);
            }
        }
    }

    /// Unsubscribe and delete every dependency edge of `target`.
    pub fn retire_dependencies(&mut self, target: NodeId, hooks: &mut Vec<HookCall>) {
        self.unsubscribe_dependencies(target, hooks);
        for id in self.dependencies(target) {
            self.edges.remove(&id);
        }
        if let Some(node) = self.nodes.get_mut(&target) {
            node.sources_head = None;
            node.sources_tail = None;
        }
    }

    /// Remove a node and every edge touching it.
    ///
    /// The node is returned so the caller can drop its computation and hooks
    /// once it no longer borrows the graph.
    pub fn remove_node(&mut self, id: NodeId, hooks: &mut Vec<HookCall>) -> Option<Node> {
        if !self.nodes.contains_key(&id) {
            return None;
        }

        self.retire_dependencies(id, hooks);

        let dependents = self.dependents(id);
        if !dependents.is_empty() {
            if let Some(watch) = self.nodes.get(&id).and_then(|node| node.hooks.clone()) {
                if watch.on_watch.is_some() {
                    hooks.push(HookCall::Unwatch(watch));
                }
            }
        }
        for edge in dependents {
            if let Some(target) = self.edges.get(&edge).map(|edge| edge.target) {
                self.detach_dependency(target, edge);
            }
            self.edges.remove(&edge);
        }

        self.nodes.remove(&id)
    }

    /// Append `edge` at the tail of `target`'s dependency list.
    fn push_dependency(&mut self, target: NodeId, edge: EdgeId) {
        let Some(node) = self.nodes.get_mut(&target) else {
            return;
        };
        let tail = node.sources_tail.replace(edge);
        if tail.is_none() {
            node.sources_head = Some(edge);
        }

        if let Some(prev) = tail.and_then(|id| self.edges.get_mut(&id)) {
            prev.next_source = Some(edge);
        }
        if let Some(edge) = self.edges.get_mut(&edge) {
            edge.prev_source = tail;
            edge.next_source = None;
        }
    }

    /// Unlink `edge` from `target`'s dependency list.
    fn detach_dependency(&mut self, target: NodeId, edge: EdgeId) {
        let Some(link) = self.edges.get_mut(&edge) else {
            return;
        };
        let prev = link.prev_source.take();
        let next = link.next_source.take();

        match prev.and_then(|id| self.edges.get_mut(&id)) {
            Some(prev_edge) => prev_edge.next_source = next,
            None => {
                if let Some(node) = self.nodes.get_mut(&target) {
                    if node.sources_head == Some(edge) {
                        node.sources_head = next;
                    }
                }
            }
        }
        match next.and_then(|id| self.edges.get_mut(&id)) {
            Some(next_edge) => next_edge.prev_source = prev,
            None => {
                if let Some(node) = self.nodes.get_mut(&target) {
                    if node.sources_tail == Some(edge) {
                        node.sources_tail = prev;
                    }
                }
            }
        }
    }

    fn link_dependent(&mut self, source: NodeId, edge: EdgeId, hooks: &mut Vec<HookCall>) {
        if self.edges.get(&edge).map_or(true, |edge| edge.linked) {
            return;
        }
        let Some(node) = self.nodes.get_mut(&source) else {
            return;
        };

        let head = node.targets.replace(edge);
        if head.is_none() {
            if let Some(watch) = node.hooks.as_ref().filter(|h| h.on_watch.is_some()) {
                hooks.push(HookCall::Watch(watch.clone()));
            }
        }

        if let Some(head_edge) = head.and_then(|id| self.edges.get_mut(&id)) {
            head_edge.prev_target = Some(edge);
        }
        if let Some(link) = self.edges.get_mut(&edge) {
            link.prev_target = None;
            link.next_target = head;
            link.linked = true;
        }
    }

    /// Returns true if the edge was linked.
    fn unlink_dependent(&mut self, source: NodeId, edge: EdgeId, hooks: &mut Vec<HookCall>) -> bool {
        let Some(link) = self.edges.get_mut(&edge) else {
            return false;
        };
        if !link.linked {
            return false;
        }
        link.linked = false;
        let prev = link.prev_target.take();
        let next = link.next_target.take();

        if let Some(prev_edge) = prev.and_then(|id| self.edges.get_mut(&id)) {
            prev_edge.next_target = next;
        }
        if let Some(next_edge) = next.and_then(|id| self.edges.get_mut(&id)) {
            next_edge.prev_target = prev;
        }

        if let Some(node) = self.nodes.get_mut(&source) {
            if node.targets == Some(edge) {
                node.targets = next;
                if next.is_none() {
                    if let Some(watch) = node.hooks.as_ref().filter(|h| h.on_watch.is_some()) {
                        hooks.push(HookCall::Unwatch(watch.clone()));
                    }
                }
            }
        }
        true
    }
}
