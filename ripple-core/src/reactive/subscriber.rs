//! Subscriber Implementation
//!
//! A Subscriber is a side-effecting computation that re-runs whenever its
//! dependencies change.
//!
//! # How Subscribers Work
//!
//! 1. When created with [`Subscriber::new`], the subscriber runs once
//!    immediately to discover its initial dependencies.
//!
//! 2. When any dependency changes, the subscriber is queued. It re-runs when
//!    the outermost batch ends, and only if a dependency really changed.
//!
//! 3. Each run rediscovers dependencies; whatever it no longer reads is
//!    dropped.
//!
//! # Differences from Derived
//!
//! - Derived values return a value; subscribers do not.
//! - Derived values are lazy; subscribers are eager and always tracking.
//! - Subscribers never have dependents.
//!
//! # Cleanup
//!
//! A run may register cleanups with [`on_cleanup`]. They are called before
//! the subscriber re-runs and when it is disposed.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use super::runtime::Runtime;
use crate::disposer::Disposer;
use crate::error::Result;
use crate::graph::{Computation, Evaluation, Node, NodeId};

type Effect = Box<dyn FnMut() -> Result<()>>;

thread_local! {
    static CLEANUP_SCOPES: RefCell<Vec<Disposer>> = RefCell::new(Vec::new());
}

/// Pops the cleanup scope of a run when dropped.
struct CleanupScope;

impl CleanupScope {
    fn enter(scope: Disposer) -> Self {
        CLEANUP_SCOPES.with(|scopes| scopes.borrow_mut().push(scope));
        CleanupScope
    }
}

impl Drop for CleanupScope {
    fn drop(&mut self) {
        let popped = CLEANUP_SCOPES
            .try_with(|scopes| scopes.borrow_mut().pop())
            .ok()
            .flatten();
        drop(popped);
    }
}

/// Register a cleanup for the subscriber that is currently running.
///
/// The cleanup runs before that subscriber's next run, or when it is
/// disposed. Outside a subscriber run this does nothing.
pub fn on_cleanup(cleanup: impl FnOnce() + 'static) -> Result<()> {
    let scope = CLEANUP_SCOPES.with(|scopes| scopes.borrow().last().cloned());
    match scope {
        Some(scope) => scope.add(cleanup),
        None => Ok(()),
    }
}

struct SubscriberBody {
    effect: RefCell<Option<Effect>>,
    cleanups: RefCell<Disposer>,
    disposed: Cell<bool>,
    runs: Cell<u64>,
}

impl Computation for SubscriberBody {
    fn evaluate(&self) -> Evaluation {
        let previous = self.cleanups.replace(Disposer::new());
        if let Err(error) = previous.dispose() {
            return Evaluation::Failed(error);
        }
        drop(previous);

        // A cleanup may have disposed us
        if self.disposed.get() {
            return Evaluation::Unchanged;
        }
        let Some(effect) = self.effect.borrow_mut().take() else {
            return Evaluation::Unchanged;
        };

        self.runs.set(self.runs.get() + 1);
        let result = {
            let mut running = RunningEffect {
                body: self,
                effect: Some(effect),
            };
            let _scope = CleanupScope::enter(self.cleanups.borrow().clone());
            match running.effect.as_mut() {
                Some(effect) => effect(),
                None => Ok(()),
            }
        };

        match result {
            Ok(()) => Evaluation::Changed,
            Err(error) => Evaluation::Failed(error),
        }
    }
}

/// Puts the effect back after a run, including one that unwinds, unless
/// the run disposed the subscriber.
struct RunningEffect<'a> {
    body: &'a SubscriberBody,
    effect: Option<Effect>,
}

impl Drop for RunningEffect<'_> {
    fn drop(&mut self) {
        if !self.body.disposed.get() {
            if let Ok(mut slot) = self.body.effect.try_borrow_mut() {
                *slot = self.effect.take();
            }
        }
    }
}

/// A side-effecting computation that runs when its dependencies change.
///
/// The subscriber is owned by the runtime once created; handles are cheap
/// clones. It keeps running until [`Subscriber::dispose`] is called.
///
/// # Example
///
/// ```rust
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use ripple_core::{Source, Subscriber};
///
/// let count = Source::new(0);
/// let seen = Rc::new(Cell::new(0));
///
/// let (c, s) = (count.clone(), seen.clone());
/// let subscriber = Subscriber::new(move || {
///     s.set(c.get());
///     Ok(())
/// })
/// .unwrap();
///
/// count.set(5).unwrap();
/// assert_eq!(seen.get(), 5);
/// subscriber.dispose().unwrap();
/// ```
#[derive(Clone)]
pub struct Subscriber {
    id: NodeId,
    body: Rc<SubscriberBody>,
}

impl Subscriber {
    /// Create a subscriber and run it once.
    ///
    /// If the first run fails, the subscriber is disposed and the error is
    /// returned.
    pub fn new<F>(effect: F) -> Result<Self>
    where
        F: FnMut() -> Result<()> + 'static,
    {
        let subscriber = Self::new_lazy(effect);
        if let Err(error) = subscriber.run() {
            // The run error wins over anything disposal reports
            let _ = subscriber.dispose();
            return Err(error);
        }
        Ok(subscriber)
    }

    /// Create a subscriber without running it. It has no dependencies, and
    /// therefore does nothing, until [`Subscriber::run`] is called.
    pub fn new_lazy<F>(effect: F) -> Self
    where
        F: FnMut() -> Result<()> + 'static,
    {
        let body = Rc::new(SubscriberBody {
            effect: RefCell::new(Some(Box::new(effect))),
            cleanups: RefCell::new(Disposer::new()),
            disposed: Cell::new(false),
            runs: Cell::new(0),
        });
        let computation: Rc<dyn Computation> = body.clone();
        let id = Runtime::with(|rt| rt.add_node(Node::subscriber(computation)));
        Self { id, body }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Run the effect now, rediscovering dependencies.
    ///
    /// Fails with [`Error::CycleDetected`] if the subscriber is already
    /// running. Does nothing once disposed.
    ///
    /// [`Error::CycleDetected`]: crate::Error::CycleDetected
    pub fn run(&self) -> Result<()> {
        if self.body.disposed.get() {
            return Ok(());
        }
        Runtime::with(|rt| rt.run_subscriber(self.id))
    }

    /// Stop the subscriber for good.
    ///
    /// Every dependency edge is severed immediately, the effect is dropped
    /// and the cleanups of the last run are called. Disposing twice is a
    /// no-op. Disposing from inside the subscriber's own run lets the run
    /// finish, but nothing it reads afterwards is kept.
    pub fn dispose(&self) -> Result<()> {
        if self.body.disposed.replace(true) {
            return Ok(());
        }
        Runtime::with(|rt| rt.dispose_subscriber(self.id));

        let effect = self.body.effect.borrow_mut().take();
        drop(effect);

        let cleanups = self.body.cleanups.borrow().clone();
        cleanups.dispose()
    }

    pub fn is_disposed(&self) -> bool {
        self.body.disposed.get()
    }

    /// Number of times the effect has been called.
    pub fn run_count(&self) -> u64 {
        self.body.runs.get()
    }

    pub fn dependency_count(&self) -> usize {
        Runtime::with(|rt| rt.dependency_count(self.id))
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("runs", &self.run_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
