//! Timeout records and cancellation.
//!
//! [`Daemon::add_timeout`](crate::Daemon::add_timeout) returns an
//! `Arc<Timeout>`: the caller's share of the scheduled timeout, usable only
//! for cancellation and observation. The callback itself stays with the
//! daemon and is consumed at most once.

use crate::clock::Time;
use std::sync::atomic::{AtomicBool, Ordering};

/// A handle on a scheduled timeout which allows it to be cancelled.
///
/// Cancellation is a single atomic store: it acquires none of the daemon's
/// locks and so never blocks on the daemon's critical section. The flag is
/// write-once; once cancelled, a timeout never becomes uncancelled.
#[derive(Debug)]
pub struct Timeout {
    deadline: Time,
    cancelled: AtomicBool,
}

impl Timeout {
    pub(crate) fn new(deadline: Time) -> Self {
        Self {
            deadline,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Cancels this timeout. Idempotent.
    ///
    /// The caller must hold the client lock the daemon was constructed
    /// with. That is what serializes cancellation against the daemon's own
    /// acquisition of the client lock just before it fires the callback:
    /// a cancel performed under the client lock before the callback's first
    /// statement guarantees the callback never runs. Cancelling without the
    /// client lock leaves it unspecified whether a due callback still runs.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true if [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns the deadline this timeout was scheduled for.
    #[must_use]
    pub fn deadline(&self) -> Time {
        self.deadline
    }
}
