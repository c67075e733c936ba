//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects sources, derived
//! values and subscribers. It owns the dependency graph and the batch
//! scheduler, and implements the two halves of propagation.
//!
//! # How It Works
//!
//! 1. Reads inside a running computation discover dependency edges against
//!    the innermost frame of the [`ReactiveContext`].
//!
//! 2. Writing a source bumps its version and the global version, then
//!    pushes a notification down the dependent lists:
//!    a. Derived values mark themselves outdated and forward the push
//!    b. Subscribers queue themselves
//!    c. Nothing is recomputed during the push
//!
//! 3. When the outermost batch closes, queued subscribers that are still
//!    stale re-run. Staleness is a pull: each dependency is validated in
//!    order, refreshing derived values on the way, so every derived value
//!    recomputes at most once no matter how many paths lead to it.
//!
//! # Thread Model
//!
//! There is one runtime per thread. Handles are `Rc` based and cannot leave
//! the thread that created them. User code is never called while the graph
//! or the scheduler is borrowed.
//!
//! A panic in user code that the host catches leaves the runtime usable:
//! open batches close, running nodes are released and a derived value whose
//! computation unwound recomputes on its next read. Nothing user-supplied
//! runs during the unwind; deferred hooks fire at the next operation.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use super::context::{pause_tracking, ReactiveContext};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::graph::{BatchScheduler, EdgeId, Evaluation, Flags, Graph, HookCall, Node, NodeId, NodeKind};

thread_local! {
    static RUNTIME: Runtime = Runtime::new();
}

/// Batch lifecycle event delivered to [`observe_batches`] listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    /// The outermost batch opened.
    Started,
    /// The outermost batch closed and every queued subscriber has run.
    Ended,
}

/// Snapshot of the current thread's graph size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
}

type Observer = Rc<dyn Fn(BatchEvent)>;

/// The per-thread reactive runtime.
pub(crate) struct Runtime {
    graph: RefCell<Graph>,
    scheduler: RefCell<BatchScheduler>,
    global_version: Cell<u64>,
    config: Cell<RuntimeConfig>,
    hooks: RefCell<VecDeque<HookCall>>,
    observers: RefCell<Vec<(u64, Observer)>>,
}

impl Runtime {
    fn new() -> Self {
        Self {
            graph: RefCell::new(Graph::new()),
            scheduler: RefCell::new(BatchScheduler::new()),
            global_version: Cell::new(0),
            config: Cell::new(RuntimeConfig::default()),
            hooks: RefCell::new(VecDeque::new()),
            observers: RefCell::new(Vec::new()),
        }
    }

    /// Run `f` against this thread's runtime.
    pub(crate) fn with<R>(f: impl FnOnce(&Runtime) -> R) -> R {
        RUNTIME.with(f)
    }

    /// Like [`Runtime::with`], but returns `None` once the runtime has been
    /// torn down at thread exit. Used from `Drop` impls.
    pub(crate) fn try_with<R>(f: impl FnOnce(&Runtime) -> R) -> Option<R> {
        RUNTIME.try_with(f).ok()
    }

    pub(crate) fn add_node(&self, node: Node) -> NodeId {
        self.graph.borrow_mut().add_node(node)
    }

    /// Remove a node and every edge touching it.
    pub(crate) fn remove_node(&self, id: NodeId) {
        let mut hooks = Vec::new();
        let removed = self.graph.borrow_mut().remove_node(id, &mut hooks);
        if removed.is_some() {
            trace!(node = id.raw(), "removed node");
        }
        // Computation and hooks may own handles; drop them unborrowed
        drop(removed);
        self.fire_hooks(hooks);
    }

    pub(crate) fn flags(&self, id: NodeId) -> Option<Flags> {
        self.graph.borrow().node(id).map(|node| node.flags())
    }

    pub(crate) fn version(&self, id: NodeId) -> Option<u64> {
        self.graph.borrow().version(id)
    }

    pub(crate) fn dependency_count(&self, id: NodeId) -> usize {
        self.graph.borrow().dependency_count(id)
    }

    pub(crate) fn dependent_count(&self, id: NodeId) -> usize {
        self.graph.borrow().dependent_count(id)
    }

    fn stats(&self) -> GraphStats {
        let graph = self.graph.borrow();
        GraphStats {
            nodes: graph.node_count(),
            edges: graph.edge_count(),
        }
    }

    /// Discover a dependency of the innermost active frame on `source`.
    pub(crate) fn track_read(&self, source: NodeId) -> Option<EdgeId> {
        let target = ReactiveContext::current()?;
        let mut hooks = Vec::new();
        let edge = self.graph.borrow_mut().discover(source, target, &mut hooks);
        self.fire_hooks(hooks);
        edge
    }

    /// Record that `edge` has now seen the current version of `source`.
    pub(crate) fn stamp(&self, edge: EdgeId, source: NodeId) {
        let mut graph = self.graph.borrow_mut();
        if let Some(version) = graph.version(source) {
            graph.set_observed(edge, version);
        }
    }

    /// Write protocol of a source. `store` replaces the value; it runs only
    /// after the cycle guard passed.
    pub(crate) fn write(&self, id: NodeId, store: impl FnOnce()) -> Result<()> {
        let limit = self.config.get().max_flush_iterations;
        if self.scheduler.borrow().exceeded(limit) {
            debug!(node = id.raw(), limit, "cycle detected: flush pass limit exceeded");
            return Err(Error::CycleDetected);
        }

        store();

        if let Some(node) = self.graph.borrow_mut().node_mut(id) {
            node.version += 1;
        }
        self.global_version.set(self.global_version.get() + 1);

        let batch = self.open_batch();
        {
            let mut graph = self.graph.borrow_mut();
            let mut scheduler = self.scheduler.borrow_mut();
            graph.notify_dependents(id, &mut scheduler);
        }
        batch.close(self)
    }

    /// Read protocol of a derived value, up to the point where the caller
    /// reads the cached value.
    pub(crate) fn read_derived(&self, id: NodeId) -> Result<()> {
        if self.flags(id).map_or(false, |flags| flags.contains(Flags::RUNNING)) {
            debug!(node = id.raw(), "cycle detected: derived value read while computing");
            return Err(Error::CycleDetected);
        }

        let edge = self.track_read(id);
        self.refresh(id);
        if let Some(edge) = edge {
            self.stamp(edge, id);
        }
        Ok(())
    }

    /// Bring a derived value up to date. Returns false if it is already
    /// being computed further up the stack.
    pub(crate) fn refresh(&self, id: NodeId) -> bool {
        let forced = {
            let global = self.global_version.get();
            let mut graph = self.graph.borrow_mut();
            let Some(node) = graph.node_mut(id) else {
                return true;
            };
            if node.kind() != NodeKind::Derived {
                return true;
            }

            node.flags.remove(Flags::NOTIFIED);
            if node.flags.contains(Flags::RUNNING) {
                return false;
            }
            // Watched and not pushed since the last validation
            if node.flags.masked(Flags::OUTDATED | Flags::TRACKING) == Flags::TRACKING {
                return true;
            }
            node.flags.remove(Flags::OUTDATED);

            if node.global_version == Some(global) {
                return true;
            }
            node.global_version = Some(global);
            node.flags.insert(Flags::RUNNING);
            // First run, or the previous one unwound
            node.version == 0 || node.flags.contains(Flags::ABORTED)
        };

        let run = RunGuard::new(self, id);
        if !forced && !self.needs_to_recompute(id) {
            run.disarm();
            if let Some(node) = self.graph.borrow_mut().node_mut(id) {
                node.flags.remove(Flags::RUNNING);
            }
            return true;
        }

        let computation = {
            let mut graph = self.graph.borrow_mut();
            graph.prepare_sources(id);
            graph.node(id).and_then(|node| node.computation.clone())
        };
        run.mark_prepared();

        trace!(node = id.raw(), "recomputing derived value");
        let evaluation = {
            let _ctx = ReactiveContext::enter(id);
            match &computation {
                Some(computation) => computation.evaluate(),
                None => Evaluation::Unchanged,
            }
        };

        run.disarm();
        let mut hooks = Vec::new();
        {
            let mut graph = self.graph.borrow_mut();
            if let Some(node) = graph.node_mut(id) {
                node.flags.remove(Flags::ABORTED);
                if !matches!(evaluation, Evaluation::Unchanged) {
                    node.version += 1;
                    let failed = matches!(evaluation, Evaluation::Failed(_));
                    node.flags.set(Flags::HAS_ERROR, failed);
                }
            }
            graph.cleanup_sources(id, &mut hooks);
            if let Some(node) = graph.node_mut(id) {
                node.flags.remove(Flags::RUNNING);
            }
        }
        self.fire_hooks(hooks);
        true
    }

    /// True if any dependency of `target` changed since `target` last saw
    /// it. Derived dependencies are refreshed on the way, in order.
    pub(crate) fn needs_to_recompute(&self, target: NodeId) -> bool {
        let mut cursor = self.graph.borrow().first_dependency(target);

        while let Some(edge) = cursor {
            let source = self.graph.borrow().edge(edge).map(|edge| edge.source());
            let Some(source) = source else {
                return true;
            };

            // A dropped source can never change again
            if let Some(version) = self.version(source) {
                if !self.observed_at(edge, version) || !self.refresh(source) {
                    return true;
                }
                if let Some(version) = self.version(source) {
                    if !self.observed_at(edge, version) {
                        return true;
                    }
                }
            }

            cursor = self.graph.borrow().next_dependency(edge);
        }
        false
    }

    fn observed_at(&self, edge: EdgeId, version: u64) -> bool {
        self.graph
            .borrow()
            .edge(edge)
            .map_or(false, |edge| edge.observed_at(version))
    }

    /// Run a subscriber's computation with dependency discovery.
    pub(crate) fn run_subscriber(&self, id: NodeId) -> Result<()> {
        let computation = {
            let mut graph = self.graph.borrow_mut();
            let Some(node) = graph.node_mut(id) else {
                return Ok(());
            };
            if node.flags.contains(Flags::RUNNING) {
                debug!(node = id.raw(), "cycle detected: subscriber re-entered while running");
                return Err(Error::CycleDetected);
            }
            node.flags.insert(Flags::RUNNING);
            let computation = if node.flags.contains(Flags::DISPOSED) {
                None
            } else {
                node.computation.clone()
            };
            graph.prepare_sources(id);
            computation
        };

        let batch = self.open_batch();
        let run = RunGuard::new(self, id);
        run.mark_prepared();
        trace!(node = id.raw(), "running subscriber");
        let ctx = ReactiveContext::enter(id);
        let evaluation = computation.as_ref().map(|computation| computation.evaluate());
        let in_order = ctx.exit();
        run.disarm();

        let mut hooks = Vec::new();
        let removed = {
            let mut graph = self.graph.borrow_mut();
            graph.cleanup_sources(id, &mut hooks);
            let disposed = match graph.node_mut(id) {
                Some(node) => {
                    node.flags.remove(Flags::RUNNING);
                    node.flags.contains(Flags::DISPOSED)
                }
                None => false,
            };
            if disposed {
                graph.remove_node(id, &mut hooks)
            } else {
                None
            }
        };
        drop(removed);
        drop(computation);
        self.fire_hooks(hooks);

        let flushed = batch.close(self);
        if !in_order {
            debug!(node = id.raw(), "subscriber completed out of order");
            return Err(Error::OutOfOrderCompletion);
        }
        if let Some(Evaluation::Failed(error)) = evaluation {
            return Err(error);
        }
        flushed
    }

    /// Mark a subscriber disposed and sever its edges. Returns false if it
    /// was already disposed.
    pub(crate) fn dispose_subscriber(&self, id: NodeId) -> bool {
        let mut hooks = Vec::new();
        let removed = {
            let mut graph = self.graph.borrow_mut();
            let Some(node) = graph.node_mut(id) else {
                return false;
            };
            if node.flags.contains(Flags::DISPOSED) {
                return false;
            }
            node.flags.insert(Flags::DISPOSED);
            node.flags.remove(Flags::TRACKING);

            if node.flags.contains(Flags::RUNNING) {
                // The run still owns the list; it is retired when the run ends
                graph.unsubscribe_dependencies(id, &mut hooks);
                None
            } else {
                graph.remove_node(id, &mut hooks)
            }
        };
        trace!(node = id.raw(), "disposed subscriber");
        drop(removed);
        self.fire_hooks(hooks);
        true
    }

    pub(crate) fn is_batching(&self) -> bool {
        self.scheduler.borrow().is_batching()
    }

    /// Open a batch. Close it with [`BatchGuard::close`]; a guard dropped
    /// by an unwind abandons the batch without flushing.
    pub(crate) fn open_batch(&self) -> BatchGuard {
        let outermost = self.scheduler.borrow_mut().begin();
        if outermost {
            trace!("batch started");
            self.emit(BatchEvent::Started);
        }
        BatchGuard { closed: false }
    }

    /// Close a batch. The outermost close drains the subscriber queue,
    /// giving every queued subscriber its chance to run, and then reports
    /// the first error raised along the way.
    pub(crate) fn end_batch(&self) -> Result<()> {
        if !self.scheduler.borrow().is_batching() {
            return Ok(());
        }
        if self.scheduler.borrow_mut().end_nested() {
            return Ok(());
        }

        let mut first_error: Option<Error> = None;
        let mut flush = FlushGuard {
            pass: Vec::new(),
            next: 0,
            done: false,
        };
        loop {
            let pass = self.scheduler.borrow_mut().next_pass();
            let Some(pass) = pass else {
                break;
            };
            trace!(
                iteration = self.scheduler.borrow().iteration(),
                queued = pass.len(),
                "flushing subscribers"
            );
            flush.pass = pass;
            flush.next = 0;

            while let Some(&id) = flush.pass.get(flush.next) {
                flush.next += 1;
                let skip = match self.graph.borrow_mut().node_mut(id) {
                    Some(node) => {
                        node.flags.remove(Flags::NOTIFIED);
                        node.flags.contains(Flags::DISPOSED)
                    }
                    None => true,
                };
                if skip || !self.needs_to_recompute(id) {
                    continue;
                }
                if let Err(error) = self.run_subscriber(id) {
                    first_error.get_or_insert(error);
                }
            }
        }

        flush.done = true;
        self.scheduler.borrow_mut().finish();
        trace!("batch ended");
        self.emit(BatchEvent::Ended);

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Release a node whose computation unwound: retire what the partial run
    /// did not re-observe, clear `RUNNING` and force the next read to
    /// recompute. Hooks are queued for the next operation.
    fn abort_run(&self, id: NodeId, prepared: bool) {
        let Ok(mut graph) = self.graph.try_borrow_mut() else {
            return;
        };
        let mut hooks = Vec::new();
        if prepared {
            graph.cleanup_sources(id, &mut hooks);
        }

        let disposed = match graph.node_mut(id) {
            Some(node) => {
                node.flags.remove(Flags::RUNNING);
                if node.kind() == NodeKind::Derived {
                    node.flags.insert(Flags::ABORTED | Flags::OUTDATED);
                    node.global_version = None;
                }
                node.flags.contains(Flags::DISPOSED)
            }
            None => false,
        };
        let removed = if disposed {
            graph.remove_node(id, &mut hooks)
        } else {
            None
        };
        drop(graph);
        debug!(node = id.raw(), "computation unwound");

        drop(removed);
        if let Ok(mut queue) = self.hooks.try_borrow_mut() {
            queue.extend(hooks);
        }
    }

    /// Close a batch whose owner unwound, keeping the rest of an interrupted
    /// pass queued.
    fn abandon_batch(&self, rest: &[NodeId]) {
        if let Ok(mut scheduler) = self.scheduler.try_borrow_mut() {
            scheduler.requeue(rest);
            scheduler.abandon();
        }
    }

    /// Queue hook calls produced by a graph operation and run everything
    /// queued so far. Callers must not hold a graph borrow.
    fn fire_hooks(&self, hooks: Vec<HookCall>) {
        if !hooks.is_empty() {
            self.hooks.borrow_mut().extend(hooks);
        }
        loop {
            let call = self.hooks.borrow_mut().pop_front();
            let Some(call) = call else {
                break;
            };

            let _paused = pause_tracking();
            match call {
                HookCall::Watch(hooks) => {
                    if let Some(on_watch) = &hooks.on_watch {
                        let cleanup = on_watch();
                        *hooks.on_unwatch.borrow_mut() = cleanup;
                    }
                }
                HookCall::Unwatch(hooks) => {
                    let cleanup = hooks.on_unwatch.borrow_mut().take();
                    if let Some(cleanup) = cleanup {
                        cleanup();
                    }
                }
            }
        }
    }

    fn emit(&self, event: BatchEvent) {
        let observers: Vec<Observer> = self
            .observers
            .borrow()
            .iter()
            .map(|(_, observer)| Rc::clone(observer))
            .collect();
        for observer in observers {
            observer(event);
        }
    }
}

/// An open batch. Close it with [`BatchGuard::close`].
#[must_use = "a batch must be closed to flush its subscribers"]
pub(crate) struct BatchGuard {
    closed: bool,
}

impl BatchGuard {
    /// Close the batch, flushing if it is the outermost one.
    pub(crate) fn close(mut self, rt: &Runtime) -> Result<()> {
        self.closed = true;
        rt.end_batch()
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if !self.closed {
            Runtime::try_with(|rt| rt.abandon_batch(&[]));
        }
    }
}

/// Progress through the current flush pass.
struct FlushGuard {
    pass: Vec<NodeId>,
    next: usize,
    done: bool,
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        if !self.done {
            let rest = self.pass.get(self.next..).unwrap_or_default();
            Runtime::try_with(|rt| rt.abandon_batch(rest));
        }
    }
}

/// Releases a running node if its computation unwinds.
struct RunGuard<'a> {
    rt: &'a Runtime,
    id: NodeId,
    armed: Cell<bool>,
    prepared: Cell<bool>,
}

impl<'a> RunGuard<'a> {
    fn new(rt: &'a Runtime, id: NodeId) -> Self {
        Self {
            rt,
            id,
            armed: Cell::new(true),
            prepared: Cell::new(false),
        }
    }

    /// The dependency list is now mid-rediscovery.
    fn mark_prepared(&self) {
        self.prepared.set(true);
    }

    fn disarm(&self) {
        self.armed.set(false);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed.get() {
            self.rt.abort_run(self.id, self.prepared.get());
        }
    }
}

/// Registration returned by [`observe_batches`]. Dropping it unregisters
/// the listener.
pub struct BatchObserver {
    id: u64,
}

impl Drop for BatchObserver {
    fn drop(&mut self) {
        let id = self.id;
        Runtime::try_with(|rt| rt.observers.borrow_mut().retain(|(other, _)| *other != id));
    }
}

/// Listen for the outermost batch opening and closing on this thread.
pub fn observe_batches(listener: impl Fn(BatchEvent) + 'static) -> BatchObserver {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let listener: Observer = Rc::new(listener);
    Runtime::with(|rt| rt.observers.borrow_mut().push((id, listener)));
    BatchObserver { id }
}

/// Run `f` inside a batch: subscriber re-runs are deferred until the
/// outermost batch closes, so each runs at most once and sees only settled
/// values.
///
/// Returns the first error raised by a subscriber during the final flush.
pub fn batch<R>(f: impl FnOnce() -> R) -> Result<R> {
    let guard = Runtime::with(|rt| rt.open_batch());
    let out = f();
    Runtime::with(|rt| guard.close(rt))?;
    Ok(out)
}

/// Check if a batch is open on this thread.
pub fn is_batching() -> bool {
    Runtime::with(|rt| rt.is_batching())
}

/// Install a configuration for this thread's runtime.
pub fn configure(config: RuntimeConfig) {
    Runtime::with(|rt| rt.config.set(config));
}

/// The configuration of this thread's runtime.
pub fn current_config() -> RuntimeConfig {
    Runtime::with(|rt| rt.config.get())
}

/// Number of live nodes and edges on this thread.
pub fn graph_stats() -> GraphStats {
    Runtime::with(|rt| rt.stats())
}
