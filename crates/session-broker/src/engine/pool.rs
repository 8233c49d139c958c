//! Engine pool with round-robin room placement.
//!
//! The pool owns the fixed set of media engine instances created at startup
//! and hands out the next instance for each new room. The cursor is a plain
//! atomic: room placement is the only cross-room operation in the broker and
//! needs no heavier coordination.

use super::{EngineError, MediaEngine};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Fixed set of media engine instances with a round-robin cursor.
pub struct EnginePool {
    engines: Vec<Arc<dyn MediaEngine>>,
    first: Arc<dyn MediaEngine>,
    cursor: AtomicUsize,
}

impl EnginePool {
    /// Build a pool from at least one engine instance.
    pub fn new(engines: Vec<Arc<dyn MediaEngine>>) -> Result<Self, EngineError> {
        let first = engines.first().cloned().ok_or_else(|| {
            EngineError::Failure("engine pool requires at least one instance".to_string())
        })?;

        Ok(Self {
            engines,
            first,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Number of engine instances in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// The pool is constructed non-empty; kept for API completeness.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Return the next engine instance in round-robin order, together with
    /// its index (recorded on the room for observability).
    #[must_use]
    pub fn next(&self) -> (usize, Arc<dyn MediaEngine>) {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.engines.len();
        match self.engines.get(index) {
            Some(engine) => (index, Arc::clone(engine)),
            // Unreachable given the modulo above; satisfies the no-panic policy.
            None => (0, Arc::clone(&self.first)),
        }
    }
}
