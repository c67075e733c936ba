//! Derived Implementation
//!
//! A Derived is a cached computed value that re-evaluates only when its
//! dependencies change, and only when somebody asks for it.
//!
//! # How Derived Values Work
//!
//! 1. Creating a derived value runs nothing. The first `get` computes and
//!    caches the result.
//!
//! 2. A write upstream marks tracked derived values outdated; unwatched
//!    ones are not touched at all.
//!
//! 3. The next `get` validates dependencies in discovery order. If none of
//!    them actually changed, the cache is returned as is.
//!
//! 4. Otherwise the computation re-runs. If the new value equals the cached
//!    one (by `PartialEq`, or by [`DerivedOptions::equals`]), the cached
//!    value is kept, the version is not bumped and dependents stay valid.
//!
//! Errors are values too: a failed computation caches its error, and every
//! `get` re-raises it until a dependency changes.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::context::untrack;
use super::runtime::Runtime;
use crate::error::{Error, Result};
use crate::graph::{Cleanup, Computation, Evaluation, Flags, Node, NodeId, WatchHooks};

type Equals<T> = Box<dyn Fn(&T, &T) -> bool>;

/// Optional hooks and change comparison for a [`Derived`].
pub struct DerivedOptions<T> {
    hooks: WatchHooks,
    equals: Option<Equals<T>>,
}

impl<T> Default for DerivedOptions<T> {
    fn default() -> Self {
        Self {
            hooks: WatchHooks::default(),
            equals: None,
        }
    }
}

impl<T> DerivedOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat a recomputed value as unchanged when `equals(cached, next)`
    /// returns true, in addition to `PartialEq` equality.
    pub fn equals(mut self, equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.equals = Some(Box::new(equals));
        self
    }

    /// Run `f` when the derived value gains its first dependent. The
    /// returned cleanup, if any, runs when it loses its last one.
    pub fn on_watch<F, C>(mut self, f: F) -> Self
    where
        F: Fn() -> Option<C> + 'static,
        C: FnOnce() + 'static,
    {
        self.hooks.on_watch = Some(Box::new(move || f().map(|c| Box::new(c) as Cleanup)));
        self
    }
}

/// Cached value and computation of a derived node.
pub(crate) struct DerivedState<T> {
    compute: Box<dyn Fn() -> Result<T>>,
    equals: Option<Equals<T>>,
    value: RefCell<Option<Result<T>>>,
}

impl<T: PartialEq> DerivedState<T> {
    fn same(&self, previous: &T, next: &T) -> bool {
        previous == next || self.equals.as_ref().map_or(false, |equals| equals(previous, next))
    }
}

impl<T: Clone + PartialEq> Computation for DerivedState<T> {
    fn evaluate(&self) -> Evaluation {
        let result = (self.compute)();

        match result {
            Ok(value) => {
                let changed = match &*self.value.borrow() {
                    Some(Ok(previous)) => !self.same(previous, &value),
                    // First run, or recovering from an error
                    _ => true,
                };
                if changed {
                    *self.value.borrow_mut() = Some(Ok(value));
                    Evaluation::Changed
                } else {
                    Evaluation::Unchanged
                }
            }
            Err(error) => {
                *self.value.borrow_mut() = Some(Err(error.clone()));
                Evaluation::Failed(error)
            }
        }
    }
}

struct DerivedInner<T> {
    id: NodeId,
    state: Rc<DerivedState<T>>,
}

impl<T> Drop for DerivedInner<T> {
    fn drop(&mut self) {
        let id = self.id;
        Runtime::try_with(|rt| rt.remove_node(id));
    }
}

/// A lazily computed, cached value derived from other reactive cells.
///
/// # Example
///
/// ```rust
/// use ripple_core::{Derived, Source};
///
/// let count = Source::new(2);
/// let c = count.clone();
/// let doubled = Derived::new(move || Ok(c.get() * 2));
///
/// assert_eq!(doubled.get().unwrap(), 4);
/// count.set(5).unwrap();
/// assert_eq!(doubled.get().unwrap(), 10);
/// ```
pub struct Derived<T> {
    inner: Rc<DerivedInner<T>>,
}

impl<T: Clone + PartialEq + 'static> Derived<T> {
    /// Create a new derived value. The computation does not run until the
    /// first read.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> Result<T> + 'static,
    {
        Self::with_options(compute, DerivedOptions::default())
    }

    pub fn with_options<F>(compute: F, options: DerivedOptions<T>) -> Self
    where
        F: Fn() -> Result<T> + 'static,
    {
        let state = Rc::new(DerivedState {
            compute: Box::new(compute),
            equals: options.equals,
            value: RefCell::new(None),
        });
        let hooks = Some(Rc::new(options.hooks));
        let computation: Rc<dyn Computation> = state.clone();
        let node = Node::derived(computation).with_hooks(hooks);
        let id = Runtime::with(|rt| rt.add_node(node));

        Self {
            inner: Rc::new(DerivedInner { id, state }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// Re-raises the cached error if the last evaluation failed, and fails
    /// with [`Error::CycleDetected`] if the value is read while it is being
    /// computed.
    pub fn get(&self) -> Result<T> {
        let id = self.inner.id;
        Runtime::with(|rt| rt.read_derived(id))?;
        self.cached()
    }

    /// Get the current value without tracking dependencies.
    ///
    /// The value is still brought up to date first.
    pub fn get_untracked(&self) -> Result<T> {
        untrack(|| self.get())
    }

    /// Check if any tracking computation depends on this value.
    pub fn is_watched(&self) -> bool {
        self.dependent_count() > 0
    }

    /// Check if the cached value is an error.
    pub fn has_error(&self) -> bool {
        Runtime::with(|rt| rt.flags(self.inner.id))
            .map_or(false, |flags| flags.contains(Flags::HAS_ERROR))
    }

    pub fn dependency_count(&self) -> usize {
        Runtime::with(|rt| rt.dependency_count(self.inner.id))
    }

    pub fn dependent_count(&self) -> usize {
        Runtime::with(|rt| rt.dependent_count(self.inner.id))
    }

    fn cached(&self) -> Result<T> {
        match &*self.inner.state.value.borrow() {
            Some(result) => result.clone(),
            // Only while the first evaluation is still on the stack
            None => Err(Error::CycleDetected),
        }
    }
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derived")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.state.value.borrow())
            .finish()
    }
}
