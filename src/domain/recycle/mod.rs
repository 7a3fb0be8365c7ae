//! Reference-counted object pools for the tuple hot path.
//!
//! Every pooled object starts with one reference. Whoever forwards the object to
//! another holder calls [`Pooled::share`] first, and every holder calls
//! [`Pooled::release`] when done. The holder whose release brings the count to
//! zero clears the object and hands it back to its pool.

pub mod pool;
pub mod station;

pub use pool::{PoolStats, Pooled, RecyclePool};
pub use station::RecycleStation;

use thiserror::Error;

/// Implemented by anything that can live in a [`RecyclePool`].
pub trait Recyclable: Send + Sync + 'static {
    /// Drops all contents so a recycled instance holds no stale references.
    fn recycle(&mut self);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecycleError {
    #[error("Cannot share {shape} object: it was already returned to its pool")]
    Reclaimed { shape: String },

    #[error("Releasing {requested} references of {shape} object holding only {held}")]
    Underflow { shape: String, requested: usize, held: usize },
}
