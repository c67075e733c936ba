//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a source is read,
//! the innermost running computation becomes its dependent.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. Evaluating a derived value or
//! running a subscriber pushes an active frame; [`pause_tracking`] pushes a
//! paused marker that hides every frame below it. Frames are owned by guards
//! that pop on drop, so an early return or a panic cannot leave the stack
//! unbalanced.
//!
//! This design supports nested reactive contexts (e.g., a derived value that
//! reads another derived value, or a subscriber created inside another
//! subscriber).

use std::cell::RefCell;

use smallvec::SmallVec;

use crate::graph::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Active(NodeId),
    Paused,
}

thread_local! {
    static CONTEXT_STACK: RefCell<SmallVec<[Frame; 16]>> = RefCell::new(SmallVec::new());
}

fn push(frame: Frame) -> usize {
    CONTEXT_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push(frame);
        stack.len() - 1
    })
}

fn truncate(depth: usize) {
    // The stack may already be gone during thread teardown
    let _ = CONTEXT_STACK.try_with(|stack| stack.borrow_mut().truncate(depth));
}

/// Guard for an active evaluation frame.
///
/// While the guard is alive, reads discover dependencies for `node`.
pub struct ReactiveContext {
    node: NodeId,
    depth: usize,
    exited: bool,
}

impl ReactiveContext {
    /// Push `node` as the innermost active frame.
    pub(crate) fn enter(node: NodeId) -> Self {
        let depth = push(Frame::Active(node));
        Self {
            node,
            depth,
            exited: false,
        }
    }

    /// Pop this frame, and anything left above it.
    ///
    /// Returns false if the frame was not the innermost one, which means
    /// something nested inside it never completed.
    pub(crate) fn exit(mut self) -> bool {
        self.exited = true;
        let in_order = CONTEXT_STACK.with(|stack| {
            let stack = stack.borrow();
            stack.len() == self.depth + 1 && stack.last() == Some(&Frame::Active(self.node))
        });
        truncate(self.depth);
        in_order
    }

    /// The node whose dependencies are currently being discovered, if any.
    ///
    /// Returns `None` when the stack is empty or tracking is paused.
    pub fn current() -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| match stack.borrow().last() {
            Some(Frame::Active(node)) => Some(*node),
            _ => None,
        })
    }

    /// Check if reads currently create dependency edges.
    pub fn is_active() -> bool {
        Self::current().is_some()
    }

    /// Number of frames on the stack, paused markers included.
    pub fn depth() -> usize {
        CONTEXT_STACK.with(|stack| stack.borrow().len())
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        if !self.exited {
            truncate(self.depth);
        }
    }
}

/// Guard returned by [`pause_tracking`]. Tracking resumes when it drops.
#[must_use = "tracking resumes as soon as the guard is dropped"]
pub struct TrackingPaused {
    depth: usize,
}

impl Drop for TrackingPaused {
    fn drop(&mut self) {
        truncate(self.depth);
    }
}

/// Suspend dependency discovery until the returned guard is dropped.
pub fn pause_tracking() -> TrackingPaused {
    TrackingPaused {
        depth: push(Frame::Paused),
    }
}

/// Run `f` without discovering dependencies.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    let _paused = pause_tracking();
    f()
}

/// Check if a read right now would create a dependency edge.
pub fn is_tracking() -> bool {
    ReactiveContext::is_active()
}
