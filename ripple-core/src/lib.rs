//! Ripple Core
//!
//! This crate provides a fine-grained reactive dependency-graph engine.
//! It implements:
//!
//! - Reactive primitives (sources, derived values, subscribers)
//! - Automatic dependency discovery with edge reuse across runs
//! - Push notification with lazy, glitch-free pull recomputation
//! - Batching, cycle detection and composable disposal
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Public primitives and the per-thread runtime
//! - `graph`: Dependency graph, node status and batch scheduler
//! - `disposer`: Cleanup scopes that dispose together
//! - `config`: Runtime configuration
//! - `error`: Error type shared by every operation
//!
//! # Example
//!
//! ```rust
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use ripple_core::{batch, Derived, Source, Subscriber};
//!
//! // Create sources
//! let width = Source::new(2);
//! let height = Source::new(3);
//!
//! // Create a derived value
//! let (w, h) = (width.clone(), height.clone());
//! let area = Derived::new(move || Ok(w.get() * h.get()));
//!
//! // Create a subscriber
//! let seen = Rc::new(Cell::new(0));
//! let (a, s) = (area.clone(), seen.clone());
//! let subscriber = Subscriber::new(move || {
//!     s.set(a.get()?);
//!     Ok(())
//! })
//! .unwrap();
//!
//! // Update both sources; the subscriber runs once, with the final values
//! batch(|| {
//!     width.set(4).unwrap();
//!     height.set(5).unwrap();
//! })
//! .unwrap();
//! assert_eq!(seen.get(), 20);
//! assert_eq!(subscriber.run_count(), 2);
//! ```

pub mod config;
pub mod disposer;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::RuntimeConfig;
pub use disposer::{Disposer, ScopeId};
pub use error::{Error, Result};
pub use reactive::{
    batch, configure, current_config, is_batching, is_tracking, observe_batches, on_cleanup,
    pause_tracking, untrack, BatchEvent, BatchObserver, Derived, DerivedOptions, Source,
    SourceOptions, Subscriber,
};
