//! Error types for the reactive engine.

use std::fmt::Display;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised by reads, writes, subscriber runs and batch flushes.
///
/// The type is `Clone` because a derived node caches a failed evaluation and
/// hands the same error to every reader until a dependency changes.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A node was re-entered while already on the evaluation stack, or a
    /// flush kept re-triggering itself past the configured pass limit.
    #[error("cycle detected")]
    CycleDetected,

    /// A subscriber finished while something else was still nested inside it.
    #[error("subscriber completed out of order")]
    OutOfOrderCompletion,

    /// An error returned by a user-supplied computation, carried unmodified.
    #[error("{0}")]
    Computation(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary error raised by a computation.
    pub fn computation<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Computation(Arc::from(error.into()))
    }

    /// Build a computation error from a plain message.
    pub fn msg(message: impl Display) -> Self {
        Self::computation(message.to_string())
    }

    /// Returns true for [`Error::CycleDetected`].
    pub fn is_cycle(&self) -> bool {
        matches!(self, Error::CycleDetected)
    }

    /// Access the original computation error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Error::Computation(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// True when both errors are the same kind and, for computation errors,
    /// share the same underlying allocation.
    pub fn same_as(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::CycleDetected, Error::CycleDetected) => true,
            (Error::OutOfOrderCompletion, Error::OutOfOrderCompletion) => true,
            (Error::Computation(a), Error::Computation(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
