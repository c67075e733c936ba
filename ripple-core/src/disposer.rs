//! Disposal Scopes
//!
//! A [`Disposer`] collects cleanups and child disposers and runs them all
//! exactly once when it is disposed. Scopes form a tree: disposing a parent
//! disposes every adopted child, in the order they were added.
//!
//! # Implementation
//!
//! Scopes live in a per-thread arena keyed by [`ScopeId`]. Each scope keeps
//! an ordered list of entries, each either a cleanup closure or the id of a
//! child scope. A disposed scope is simply gone from the arena, so late
//! additions can be detected and run on the spot.
//!
//! Cleanups are collected while the arena is borrowed and run after it is
//! released, so a cleanup may freely create or dispose other scopes.
//!
//! Dropping the last handle of a scope that was never disposed and has no
//! parent discards it without running its cleanups. Adopted scopes stay
//! alive with their parent.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::error::Result;
use crate::graph::Cleanup;
use crate::reactive::{batch, pause_tracking};

/// Unique identifier for a disposal scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

enum Entry {
    Cleanup(Cleanup),
    Child(ScopeId),
}

#[derive(Default)]
struct Scope {
    parent: Option<ScopeId>,
    entries: Vec<Entry>,
    handles: usize,
}

#[derive(Default)]
struct ScopeArena {
    scopes: HashMap<ScopeId, Scope>,
}

impl ScopeArena {
    /// Remove `id` and its subtree, appending cleanups in run order.
    fn take_subtree(&mut self, id: ScopeId, out: &mut Vec<Cleanup>) {
        let Some(scope) = self.scopes.remove(&id) else {
            return;
        };
        for entry in scope.entries {
            match entry {
                Entry::Cleanup(cleanup) => out.push(cleanup),
                Entry::Child(child) => self.take_subtree(child, out),
            }
        }
    }

    /// Remove `id` without running anything. Children that still have live
    /// handles become roots; the rest are discarded too.
    fn discard(&mut self, id: ScopeId, out: &mut Vec<Cleanup>) {
        let Some(scope) = self.scopes.remove(&id) else {
            return;
        };
        for entry in scope.entries {
            match entry {
                Entry::Cleanup(cleanup) => out.push(cleanup),
                Entry::Child(child) => {
                    let orphaned = match self.scopes.get_mut(&child) {
                        Some(scope) => {
                            scope.parent = None;
                            scope.handles == 0
                        }
                        None => false,
                    };
                    if orphaned {
                        self.discard(child, out);
                    }
                }
            }
        }
    }

    /// Check if `ancestor` is `id` or one of its parents.
    fn is_ancestor(&self, ancestor: ScopeId, id: ScopeId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.scopes.get(&current).and_then(|scope| scope.parent);
        }
        false
    }
}

thread_local! {
    static SCOPES: RefCell<ScopeArena> = RefCell::new(ScopeArena::default());
}

fn run_cleanups(cleanups: Vec<Cleanup>) -> Result<()> {
    if cleanups.is_empty() {
        return Ok(());
    }
    batch(|| {
        let _paused = pause_tracking();
        for cleanup in cleanups {
            cleanup();
        }
    })
}

/// Handle to a disposal scope.
///
/// # Example
///
/// ```rust
/// use ripple_core::Disposer;
///
/// let parent = Disposer::new();
/// let child = Disposer::new();
/// parent.adopt(&child).unwrap();
/// child.add(|| println!("released")).unwrap();
///
/// parent.dispose().unwrap();
/// assert!(child.is_disposed());
/// ```
pub struct Disposer {
    id: ScopeId,
}

impl Disposer {
    /// Create a new, empty root scope.
    pub fn new() -> Self {
        let id = ScopeId::new();
        SCOPES.with(|arena| {
            arena.borrow_mut().scopes.insert(
                id,
                Scope {
                    handles: 1,
                    ..Scope::default()
                },
            )
        });
        Self { id }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn is_disposed(&self) -> bool {
        SCOPES.with(|arena| !arena.borrow().scopes.contains_key(&self.id))
    }

    /// Register a cleanup. If the scope is already disposed, the cleanup
    /// runs immediately.
    pub fn add(&self, cleanup: impl FnOnce() + 'static) -> Result<()> {
        let cleanup: Cleanup = Box::new(cleanup);
        let rejected = SCOPES.with(|arena| match arena.borrow_mut().scopes.get_mut(&self.id) {
            Some(scope) => {
                scope.entries.push(Entry::Cleanup(cleanup));
                None
            }
            None => Some(cleanup),
        });
        match rejected {
            Some(cleanup) => run_cleanups(vec![cleanup]),
            None => Ok(()),
        }
    }

    /// Make `child` part of this scope, moving it out of any previous
    /// parent. If this scope is already disposed, `child` is disposed now.
    pub fn adopt(&self, child: &Disposer) -> Result<()> {
        enum Outcome {
            Adopted,
            Ignored,
            DisposeChild,
        }

        let outcome = SCOPES.with(|arena| {
            let mut arena = arena.borrow_mut();
            if !arena.scopes.contains_key(&self.id) {
                return Outcome::DisposeChild;
            }
            if !arena.scopes.contains_key(&child.id) || arena.is_ancestor(child.id, self.id) {
                return Outcome::Ignored;
            }

            let previous = arena
                .scopes
                .get_mut(&child.id)
                .and_then(|scope| scope.parent.replace(self.id));
            if let Some(old) = previous.and_then(|p| arena.scopes.get_mut(&p)) {
                old.entries
                    .retain(|entry| !matches!(entry, Entry::Child(id) if *id == child.id));
            }
            if let Some(scope) = arena.scopes.get_mut(&self.id) {
                scope.entries.push(Entry::Child(child.id));
            }
            Outcome::Adopted
        });

        match outcome {
            Outcome::Adopted => Ok(()),
            Outcome::Ignored => {
                debug!(parent = self.id.0, child = child.id.0, "ignored adoption");
                Ok(())
            }
            Outcome::DisposeChild => child.dispose(),
        }
    }

    /// Run every owned cleanup, children included, exactly once.
    ///
    /// Disposing twice is a no-op. Cleanups run inside a batch with tracking
    /// paused; the result is the outcome of that batch.
    pub fn dispose(&self) -> Result<()> {
        let mut cleanups = Vec::new();
        SCOPES.with(|arena| {
            let mut arena = arena.borrow_mut();
            let parent = arena.scopes.get(&self.id).and_then(|scope| scope.parent);
            if let Some(parent) = parent.and_then(|p| arena.scopes.get_mut(&p)) {
                parent
                    .entries
                    .retain(|entry| !matches!(entry, Entry::Child(id) if *id == self.id));
            }
            arena.take_subtree(self.id, &mut cleanups);
        });
        trace!(scope = self.id.0, cleanups = cleanups.len(), "disposing scope");
        run_cleanups(cleanups)
    }
}

impl Default for Disposer {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Disposer {
    fn clone(&self) -> Self {
        SCOPES.with(|arena| {
            if let Some(scope) = arena.borrow_mut().scopes.get_mut(&self.id) {
                scope.handles += 1;
            }
        });
        Self { id: self.id }
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        let id = self.id;
        let mut dropped = Vec::new();
        let _ = SCOPES.try_with(|arena| {
            let mut arena = arena.borrow_mut();
            let Some(scope) = arena.scopes.get_mut(&id) else {
                return;
            };
            scope.handles = scope.handles.saturating_sub(1);
            if scope.handles == 0 && scope.parent.is_none() {
                arena.discard(id, &mut dropped);
            }
        });
        // Closures may own handles; release them outside the arena borrow
        drop(dropped);
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn log_into(log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str) -> impl FnOnce() {
        let log = log.clone();
        move || log.borrow_mut().push(name)
    }

    #[test]
    fn cleanups_run_once_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let disposer = Disposer::new();
        disposer.add(log_into(&log, "a")).unwrap();
        disposer.add(log_into(&log, "b")).unwrap();

        disposer.dispose().unwrap();
        disposer.dispose().unwrap();

        assert_eq!(*log.borrow(), vec!["a", "b"]);
        assert!(disposer.is_disposed());
    }

    #[test]
    fn late_cleanup_runs_immediately() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let disposer = Disposer::new();
        disposer.dispose().unwrap();

        disposer.add(move || flag.set(true)).unwrap();
        assert!(ran.get());
    }

    #[test]
    fn children_dispose_with_parent_in_position() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let parent = Disposer::new();
        let child = Disposer::new();
        let grandchild = Disposer::new();

        parent.add(log_into(&log, "first")).unwrap();
        parent.adopt(&child).unwrap();
        child.adopt(&grandchild).unwrap();
        grandchild.add(log_into(&log, "grandchild")).unwrap();
        child.add(log_into(&log, "child")).unwrap();
        parent.add(log_into(&log, "last")).unwrap();

        parent.dispose().unwrap();
        assert_eq!(*log.borrow(), vec!["first", "grandchild", "child", "last"]);
        assert!(child.is_disposed());
        assert!(grandchild.is_disposed());
    }

    #[test]
    fn disposing_a_child_detaches_it() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let parent = Disposer::new();
        let child = Disposer::new();
        parent.adopt(&child).unwrap();
        child.add(log_into(&log, "child")).unwrap();

        child.dispose().unwrap();
        parent.dispose().unwrap();
        assert_eq!(*log.borrow(), vec!["child"]);
    }

    #[test]
    fn adopting_into_disposed_scope_disposes_child() {
        let parent = Disposer::new();
        parent.dispose().unwrap();

        let child = Disposer::new();
        parent.adopt(&child).unwrap();
        assert!(child.is_disposed());
    }

    #[test]
    fn adoption_cycles_are_ignored() {
        let a = Disposer::new();
        let b = Disposer::new();
        a.adopt(&b).unwrap();
        b.adopt(&a).unwrap();
        a.adopt(&a).unwrap();

        a.dispose().unwrap();
        assert!(b.is_disposed());
    }

    #[test]
    fn adopted_scope_outlives_its_handle() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let parent = Disposer::new();
        {
            let child = Disposer::new();
            child.add(log_into(&log, "child")).unwrap();
            parent.adopt(&child).unwrap();
        }
        parent.dispose().unwrap();
        assert_eq!(*log.borrow(), vec!["child"]);
    }

    #[test]
    fn dropped_root_is_discarded_without_running() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let disposer = Disposer::new();
        let id = disposer.id();
        disposer.add(move || flag.set(true)).unwrap();
        drop(disposer);

        assert!(!ran.get());
        assert!(SCOPES.with(|arena| !arena.borrow().scopes.contains_key(&id)));
    }
}
