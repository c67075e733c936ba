//! Source Implementation
//!
//! A Source is the fundamental reactive primitive: a versioned mutable cell.
//! It holds a value and knows, through the graph, which computations depend
//! on it.
//!
//! # How Sources Work
//!
//! 1. When a source is read within a reactive context (derived/subscriber),
//!    the read discovers a dependency edge for that context.
//!
//! 2. When a source is written, its version and the global version are
//!    bumped and every dependent is notified.
//!
//! 3. Notifications are coalesced by the batch scheduler; subscribers re-run
//!    once the outermost batch ends.
//!
//! Writes never compare values unless the source was created with
//! [`SourceOptions::equals`]; a write that the comparison calls equal is
//! dropped before it reaches the graph.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::context::untrack;
use super::runtime::Runtime;
use crate::error::Result;
use crate::graph::{Cleanup, Node, NodeId, WatchHooks};

type Equals<T> = Box<dyn Fn(&T, &T) -> bool>;

/// Optional hooks and write comparison for a [`Source`].
pub struct SourceOptions<T> {
    hooks: WatchHooks,
    equals: Option<Equals<T>>,
}

impl<T> Default for SourceOptions<T> {
    fn default() -> Self {
        Self {
            hooks: WatchHooks::default(),
            equals: None,
        }
    }
}

impl<T> SourceOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip writes for which `equals(current, next)` returns true.
    pub fn equals(mut self, equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.equals = Some(Box::new(equals));
        self
    }

    /// Run `f` (untracked) on every tracked or untracked [`Source::get`].
    pub fn on_read(mut self, f: impl Fn() + 'static) -> Self {
        self.hooks.on_read = Some(Box::new(f));
        self
    }

    /// Run `f` when the source gains its first dependent. The returned
    /// cleanup, if any, runs when it loses its last one.
    pub fn on_watch<F, C>(mut self, f: F) -> Self
    where
        F: Fn() -> Option<C> + 'static,
        C: FnOnce() + 'static,
    {
        self.hooks.on_watch = Some(Box::new(move || f().map(|c| Box::new(c) as Cleanup)));
        self
    }
}

struct SourceInner<T> {
    id: NodeId,
    value: RefCell<T>,
    hooks: Option<Rc<WatchHooks>>,
    equals: Option<Equals<T>>,
}

impl<T> Drop for SourceInner<T> {
    fn drop(&mut self) {
        let id = self.id;
        Runtime::try_with(|rt| rt.remove_node(id));
    }
}

/// A reactive source holding a value of type `T`.
///
/// Cloning a `Source` creates another handle to the same cell. The cell's
/// graph node is removed when the last handle is dropped.
///
/// # Example
///
/// ```rust
/// use ripple_core::Source;
///
/// let count = Source::new(0);
/// count.set(5).unwrap();
/// assert_eq!(count.get(), 5);
/// ```
pub struct Source<T> {
    inner: Rc<SourceInner<T>>,
}

impl<T: Clone + 'static> Source<T> {
    /// Create a new source with the given initial value.
    pub fn new(value: T) -> Self {
        Self::with_options(value, SourceOptions::default())
    }

    pub fn with_options(value: T, options: SourceOptions<T>) -> Self {
        let hooks = Some(Rc::new(options.hooks)).filter(|h| !h.is_empty());
        let id = Runtime::with(|rt| rt.add_node(Node::source().with_hooks(hooks.clone())));
        Self {
            inner: Rc::new(SourceInner {
                id,
                value: RefCell::new(value),
                hooks,
                equals: options.equals,
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// If called within a reactive context, this also records the source as
    /// a dependency of the current computation.
    pub fn get(&self) -> T {
        self.run_read_hook();
        let id = self.inner.id;
        Runtime::with(|rt| {
            if let Some(edge) = rt.track_read(id) {
                rt.stamp(edge, id);
            }
        });
        self.inner.value.borrow().clone()
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T {
        self.run_read_hook();
        self.inner.value.borrow().clone()
    }

    /// Store a new value and notify dependents.
    ///
    /// With [`SourceOptions::equals`], a value equal to the current one is
    /// dropped: nothing is stored and nobody is notified.
    ///
    /// Fails with [`Error::CycleDetected`] if the current flush has already
    /// run past the configured pass limit; the value is not stored in that
    /// case. Otherwise returns the first error raised by a subscriber that
    /// re-ran because of this write.
    ///
    /// [`Error::CycleDetected`]: crate::Error::CycleDetected
    pub fn set(&self, value: T) -> Result<()> {
        let inner = &self.inner;
        if let Some(equals) = &inner.equals {
            if equals(&inner.value.borrow(), &value) {
                return Ok(());
            }
        }
        Runtime::with(|rt| rt.write(inner.id, || *inner.value.borrow_mut() = value))
    }

    /// Write a value computed from the current one.
    ///
    /// `f` sees a snapshot, so it may itself read or write this source.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<()> {
        let current = self.inner.value.borrow().clone();
        self.set(f(&current))
    }

    /// Number of tracking computations that depend on this source.
    pub fn dependent_count(&self) -> usize {
        Runtime::with(|rt| rt.dependent_count(self.inner.id))
    }

    fn run_read_hook(&self) {
        if let Some(on_read) = self.inner.hooks.as_ref().and_then(|h| h.on_read.as_ref()) {
            untrack(|| on_read());
        }
    }
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.borrow())
            .finish()
    }
}
