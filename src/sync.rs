//! The per-operator synchronization gate.
//!
//! Every operator owns exactly one [`Gate`], a mutually exclusive critical section guarding
//! that operator's private state (its shadow cache, pending group membership, sort index, ...).
//! When two upstream emissions feed the same operator — the two sides of a join, the source and
//! the re-group signal of a dynamic grouper — they share one `Gate` rather than each getting
//! their own, per the composition rule of the concurrency contract: wrap the `Gate` in an `Arc`
//! and clone it into both upstream handlers.
//!
//! A `Gate` intentionally wraps a plain [`std::sync::Mutex`] rather than an async lock: the work
//! done while holding it (cache mutation, shadow-cache bookkeeping) is always synchronous.
//! Suspension only ever happens after the gate has been released — on a timer, on upstream
//! back-pressure, or while delivering a change set to a downstream subscriber — which is what
//! lets an expire-after operator call back into its source's `edit` lock without deadlocking
//! against its own management lock.

use std::sync::Mutex;

/// The critical section owned by one operator, carrying the state it serializes access to.
pub(crate) struct Gate<T> {
    inner: Mutex<T>,
}

impl<T> Gate<T> {
    pub(crate) fn new(state: T) -> Self {
        Self { inner: Mutex::new(state) }
    }

    /// Acquires the gate, runs `f` against the guarded state, and releases it before returning.
    /// `f` must not itself try to deliver a change set to a downstream operator that could call
    /// back upstream through the same gate — see the module docs.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl<T: Default> Default for Gate<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
