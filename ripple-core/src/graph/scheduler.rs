//! Batch Scheduler
//!
//! Tracks batch depth and the queue of subscribers waiting to re-run.
//!
//! # Algorithm
//!
//! 1. Every write opens an implicit batch; explicit batches nest.
//! 2. While a batch is open, notified subscribers are queued, not run.
//! 3. When the outermost batch closes, the runtime drains the queue in
//!    passes: each pass snapshots and clears the queue, then runs every
//!    subscriber that is still stale.
//! 4. Subscribers that write during a pass queue more subscribers, so the
//!    loop repeats until a pass queues nothing.
//! 5. The pass counter doubles as the runaway-cycle guard: writes fail once
//!    it exceeds the configured limit.
//!
//! The scheduler itself is plain state; running subscribers is the
//! runtime's job because it calls back into user code.

use std::mem;

use super::node::NodeId;

/// Batch depth, pass counter and pending subscriber queue.
#[derive(Debug, Default)]
pub struct BatchScheduler {
    depth: u32,
    iteration: u32,
    pending: Vec<NodeId>,
}

impl BatchScheduler {
    /// Create a new idle scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a batch. Returns true when this is the outermost one.
    pub fn begin(&mut self) -> bool {
        self.depth += 1;
        self.depth == 1
    }

    /// Close a nested batch. Returns false when the caller holds the
    /// outermost batch and must flush before calling [`finish`].
    ///
    /// [`finish`]: BatchScheduler::finish
    pub fn end_nested(&mut self) -> bool {
        if self.depth > 1 {
            self.depth -= 1;
            true
        } else {
            false
        }
    }

    /// Close the outermost batch after the queue has drained.
    pub fn finish(&mut self) {
        self.iteration = 0;
        self.depth = self.depth.saturating_sub(1);
    }

    /// Close a batch whose owner unwound. Queued subscribers stay queued
    /// and run at the next flush.
    pub fn abandon(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            self.iteration = 0;
        }
    }

    /// Put back the unrun tail of a pass, keeping its run order.
    pub fn requeue(&mut self, rest: &[NodeId]) {
        self.pending.extend(rest.iter().rev());
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_batching(&self) -> bool {
        self.depth > 0
    }

    /// Number of passes taken by the current flush.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// True once the current flush has taken more than `limit` passes.
    pub fn exceeded(&self, limit: u32) -> bool {
        self.iteration > limit
    }

    /// Queue a subscriber for the next pass.
    pub fn enqueue(&mut self, id: NodeId) {
        self.pending.push(id);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Start a new pass: take a snapshot of the queue, most recently queued
    /// first, and bump the pass counter. Returns `None` when nothing is
    /// queued.
    pub fn next_pass(&mut self) -> Option<Vec<NodeId>> {
        if self.pending.is_empty() {
            return None;
        }
        let mut pass = mem::take(&mut self.pending);
        pass.reverse();
        self.iteration += 1;
        Some(pass)
    }
}
