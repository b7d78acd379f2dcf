//! The scheduler daemon: a worker thread that fires deadline callbacks.
//!
//! A [`Daemon`] owns a single long-running worker. The worker checks when
//! the next timeout will occur, sleeps until that instant, then runs the
//! associated callback under the client lock. While sleeping it also
//! listens on a one-slot wake channel, written to whenever a timeout is
//! added or the daemon is stopped; a newly added timeout that is sooner
//! than the current soonest is therefore handled on time rather than after
//! the old deadline, and a stop is observed immediately rather than after
//! a deadline arbitrarily far in the future.
//!
//! # Cancellation protocol
//!
//! Cancelling only flips an atomic flag on the [`Timeout`] record, so the
//! daemon can skip acquiring the client lock for work it would immediately
//! discard. After popping a due record the worker reads the flag once: if
//! set, the record is thrown away without touching the client lock. If
//! clear, the worker takes the client lock. But between that first read
//! and the acquisition, another thread may have taken the client lock, done
//! work, and cancelled the timeout. The worker therefore re-reads the flag
//! after acquiring the client lock, and only then fires. This is why
//! [`Timeout::cancel`] requires the client lock: it is the serialization
//! point that makes the second read authoritative.
//!
//! # Lock order
//!
//! The global order is client lock → daemon lock. Clients holding their own
//! lock may call [`Daemon::add_timeout`], which takes the daemon lock. The
//! worker, which holds the daemon lock while managing the heap, must never
//! acquire the client lock on top of it: it releases the daemon lock,
//! acquires the client lock, then reacquires the daemon lock. The callback
//! runs with both held; the daemon lock is released first afterwards, so
//! the established order is intact for the next iteration. A consequence is
//! that a callback must not call `add_timeout` or `stop` on its own daemon:
//! the worker already holds the daemon lock while firing.
//!
//! # Wake channel discipline
//!
//! The channel is buffered at one and every send is non-blocking. Each send
//! thus leaves at least one token queued, so any future receive observes a
//! token; and the worker, immediately after receiving, reacquires the
//! daemon lock and re-peeks the heap. The channel can only drain at a point
//! where the worker is about to learn the latest soonest deadline, so a
//! single slot suffices.

use crate::clock::{MonotonicClock, Time, TimeSource};
use crate::heap::DeadlineHeap;
use crate::lock::Lockable;
use crate::record::Timeout;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::thread;

/// Error returned by [`Daemon::add_timeout`] after [`Daemon::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonStopped;

impl fmt::Display for DaemonStopped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timeout daemon already stopped")
    }
}

impl std::error::Error for DaemonStopped {}

type Callback<L> = Box<dyn FnOnce(&mut <L as Lockable>::State) + Send>;

/// The daemon's share of a scheduled timeout: the caller-visible record
/// plus the callback, which popping transfers out of the heap.
struct Pending<L: Lockable> {
    handle: Arc<Timeout>,
    callback: Callback<L>,
}

struct Inner<L: Lockable> {
    heap: DeadlineHeap<Pending<L>>,
    /// Monotonic false→true; checked after every acquisition of the
    /// daemon lock.
    stopped: bool,
}

struct Shared<L: Lockable, C: TimeSource> {
    client: Arc<L>,
    clock: Arc<C>,
    inner: Mutex<Inner<L>>,
    /// Signalled when the heap transitions from empty to non-empty, and on
    /// stop; the worker only waits on it while the heap is empty.
    nonempty: Condvar,
    wake: Sender<()>,
}

/// A handle on a scheduler daemon.
///
/// The daemon runs one dedicated worker thread which sleeps until the
/// earliest registered deadline and then invokes the callback under the
/// client lock the daemon was constructed with. Dropping the handle stops
/// the daemon (equivalent to [`stop`](Self::stop); the worker is never
/// joined).
///
/// # Callback panics
///
/// A panicking callback unwinds through the worker: both locks are
/// released as their guards drop, the worker thread terminates, and the
/// daemon silently stops delivering callbacks. Callbacks should not panic.
pub struct Daemon<L: Lockable, C: TimeSource = MonotonicClock> {
    shared: Arc<Shared<L, C>>,
}

impl<L: Lockable + 'static> Daemon<L> {
    /// Starts a new daemon against the process monotonic clock.
    ///
    /// The client lock will be acquired before any timeout callback is
    /// executed; it must be the same lock callers hold when cancelling.
    #[must_use]
    pub fn new(client: Arc<L>) -> Self {
        Self::with_clock(client, Arc::new(MonotonicClock::new()))
    }
}

impl<L: Lockable + 'static, C: TimeSource + 'static> Daemon<L, C> {
    /// Starts a new daemon reading time from `clock`.
    ///
    /// Deadlines passed to [`add_timeout`](Self::add_timeout) must come
    /// from the same clock.
    #[must_use]
    pub fn with_clock(client: Arc<L>, clock: Arc<C>) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        let shared = Arc::new(Shared {
            client,
            clock,
            inner: Mutex::new(Inner {
                heap: DeadlineHeap::new(),
                stopped: false,
            }),
            nonempty: Condvar::new(),
            wake: wake_tx,
        });
        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name("timeout-daemon".to_string())
            .spawn(move || run_worker(&worker, &wake_rx))
            .expect("failed to spawn timeout daemon worker");
        Self { shared }
    }
}

impl<L: Lockable, C: TimeSource> Daemon<L, C> {
    /// Schedules `callback` to run at or after `deadline`.
    ///
    /// The callback receives the client-lock-protected state and is
    /// guaranteed not to run before `deadline`; a deadline already in the
    /// past fires as soon as the worker reaches it. Timeouts with equal
    /// deadlines fire in the order they were added. The returned record
    /// can be used to cancel the timeout, in which case the callback will
    /// not be called.
    ///
    /// Must not be called from inside a timeout callback of this same
    /// daemon (see the module docs on lock order).
    ///
    /// # Errors
    ///
    /// Returns [`DaemonStopped`] if [`stop`](Self::stop) has already been
    /// called; the callback is dropped without running.
    pub fn add_timeout<F>(&self, callback: F, deadline: Time) -> Result<Arc<Timeout>, DaemonStopped>
    where
        F: FnOnce(&mut L::State) + Send + 'static,
    {
        let handle = Arc::new(Timeout::new(deadline));
        let mut inner = self.shared.inner.lock();
        if inner.stopped {
            return Err(DaemonStopped);
        }
        inner.heap.push(
            deadline,
            Pending {
                handle: Arc::clone(&handle),
                callback: Box::new(callback),
            },
        );
        if inner.heap.len() == 1 {
            // The heap was empty, so the worker may be parked on the
            // condvar rather than in the timed sleep.
            self.shared.nonempty.notify_all();
        }
        self.notify_wake();
        drop(inner);
        tracing::trace!(deadline = %deadline, "timeout scheduled");
        Ok(handle)
    }

    /// Stops the daemon. Idempotent; only the first call does work.
    ///
    /// Returns immediately without joining the worker. The worker may
    /// still be unwinding, but after this returns it will never again
    /// acquire the client lock or invoke a callback; in-flight callbacks
    /// that began before the stop are allowed to complete. Callers needing
    /// quiescence must arrange it externally.
    pub fn stop(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.stopped {
            return;
        }
        inner.stopped = true;
        self.shared.nonempty.notify_all();
        self.notify_wake();
        drop(inner);
        tracing::debug!("timeout daemon stopped");
    }

    /// Returns true if [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.inner.lock().stopped
    }

    fn notify_wake(&self) {
        // Capacity-1 channel: a failed send means a token is already
        // queued, which serves the same purpose as the one we tried to
        // send.
        let _ = self.shared.wake.try_send(());
    }
}

impl<L: Lockable, C: TimeSource> Drop for Daemon<L, C> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<L: Lockable, C: TimeSource>(shared: &Shared<L, C>, wake: &Receiver<()>) {
    tracing::debug!("timeout daemon worker running");
    'run: loop {
        let mut inner = shared.inner.lock();
        if inner.stopped {
            break 'run;
        }

        while inner.heap.is_empty() {
            shared.nonempty.wait(&mut inner);
            if inner.stopped {
                break 'run;
            }
        }

        // Sleep until the earliest deadline is due. Re-peek on every pass:
        // a concurrent add_timeout may have queued a sooner deadline than
        // the one we went to sleep on.
        loop {
            let deadline = inner.heap.peek_deadline().expect("heap is non-empty");
            let now = shared.clock.now();
            if !deadline.after(now) {
                break;
            }
            let wait = deadline.saturating_duration_since(now);
            drop(inner);
            let _ = wake.recv_timeout(wait);
            inner = shared.inner.lock();
            if inner.stopped {
                break 'run;
            }
        }

        let (deadline, pending) = inner.heap.pop().expect("heap is non-empty");
        let cancelled = pending.handle.is_cancelled();
        drop(inner);
        if cancelled {
            // Cancelled while queued: discard without touching the client
            // lock.
            tracing::trace!(deadline = %deadline, "discarding cancelled timeout");
            continue;
        }

        // Lock-order dance: the client lock comes before the daemon lock,
        // and the daemon lock was dropped above, so taking the client lock
        // here cannot deadlock with a client calling add_timeout under its
        // own lock.
        let mut stopped = false;
        shared.client.with_lock(|state| {
            let guard = shared.inner.lock();
            if guard.stopped {
                stopped = true;
                return;
            }
            if pending.handle.is_cancelled() {
                // Cancelled between the first flag read and our
                // acquisition of the client lock; the canceller held the
                // client lock, so this read is authoritative.
                return;
            }
            tracing::trace!(deadline = %deadline, "firing timeout callback");
            (pending.callback)(state);
            // Daemon lock released before the client lock, keeping the
            // client → daemon order intact for the next iteration.
            drop(guard);
        });
        if stopped {
            break 'run;
        }
    }
    tracing::debug!("timeout daemon worker exiting");
}
