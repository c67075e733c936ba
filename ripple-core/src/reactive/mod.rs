//! Reactive Primitives
//!
//! This module implements the public surface of the engine: sources, derived
//! values and subscribers, plus the scoping helpers around batching and
//! tracking.
//!
//! # Concepts
//!
//! ## Sources
//!
//! A Source is a container for mutable state. When a source is read within
//! a tracking context (a derived value or a subscriber), the read records a
//! dependency. When the source is written, every dependent is notified.
//!
//! ## Derived Values
//!
//! A Derived is a cached computed value. It re-evaluates only when it is
//! read and one of its dependencies really changed. Derived values that
//! nobody subscribes to are never touched by writes.
//!
//! ## Subscribers
//!
//! A Subscriber is a side-effecting computation that re-runs whenever its
//! dependencies change. Subscribers are the only eager part of the graph.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local evaluation stack to detect
//! dependencies automatically. When a cell is read, the innermost active
//! frame of the stack becomes its dependent.
//!
//! Notifications are pushed eagerly but recomputation is pulled lazily, so
//! a subscriber only ever observes a settled, consistent snapshot of the
//! graph.

mod context;
mod derived;
mod runtime;
mod source;
mod subscriber;

pub use context::{is_tracking, pause_tracking, untrack, ReactiveContext, TrackingPaused};
pub use derived::{Derived, DerivedOptions};
pub use runtime::{
    batch, configure, current_config, graph_stats, is_batching, observe_batches, BatchEvent,
    BatchObserver, GraphStats,
};
pub use source::{Source, SourceOptions};
pub use subscriber::{on_cleanup, Subscriber};
