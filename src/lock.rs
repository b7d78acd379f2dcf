//! The client lock abstraction.
//!
//! The daemon is parametric over the mutual-exclusion primitive that guards
//! the client's state, not tied to a concrete mutex type. In safe Rust,
//! access to lock-protected data flows through the lock's guard, so the
//! capability is expressed as a closure run under the lock: the daemon
//! acquires the lock and hands the callback a `&mut` to the protected
//! state.

/// A mutual-exclusion primitive guarding some client state.
///
/// The daemon acquires this lock before invoking any timeout callback, and
/// clients must hold it while calling [`Timeout::cancel`](crate::Timeout::cancel).
pub trait Lockable: Send + Sync {
    /// The state protected by this lock.
    type State: ?Sized;

    /// Runs `f` with the lock held, passing the protected state.
    fn with_lock<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut Self::State) -> R;
}

impl<T: Send> Lockable for std::sync::Mutex<T> {
    type State = T;

    fn with_lock<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        // Poisoning is a std-only concept; a poisoned client lock is
        // treated as locked data, matching the parking_lot impl.
        let mut guard = self
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}

impl<T: Send> Lockable for parking_lot::Mutex<T> {
    type State = T;

    fn with_lock<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        f(&mut self.lock())
    }
}
