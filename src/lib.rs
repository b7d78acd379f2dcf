//! Timeoutd: deadline-callback scheduler for userspace transport protocols.
//!
//! # Overview
//!
//! A transport-protocol connection needs callbacks that fire at precise
//! future monotonic instants: retransmission, keep-alive, TIME_WAIT. This
//! crate provides the scheduler for them. A [`Daemon`] runs one dedicated
//! worker thread that sleeps until the earliest registered deadline and
//! invokes the callback under a caller-supplied lock, the same lock that
//! protects the connection state the callback mutates.
//!
//! # Core Guarantees
//!
//! - **Never early**: a callback never runs before its deadline
//! - **At most once**: each callback is consumed zero or one times
//! - **Cancel without contention**: cancellation is one atomic store and
//!   never blocks on the daemon's critical section
//! - **Responsive reordering**: a newly added sooner deadline wakes the
//!   worker immediately instead of waiting out the old deadline
//! - **Prompt shutdown**: after [`Daemon::stop`] returns, no callback
//!   fires and the client lock is never touched again
//!
//! # Module Structure
//!
//! - [`clock`]: monotonic [`Time`], the [`TimeSource`] seam, and the
//!   process-wide [`monotonic_now`] clock
//! - [`lock`]: the [`Lockable`] abstraction over the client's mutex
//! - [`record`]: the [`Timeout`] record returned for cancellation
//! - [`daemon`]: the [`Daemon`] handle and its worker
//!
//! # Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//! use timeoutd::{monotonic_now, Daemon};
//!
//! struct Conn {
//!     retransmits: u32,
//! }
//!
//! let conn = Arc::new(Mutex::new(Conn { retransmits: 0 }));
//! let daemon = Daemon::new(Arc::clone(&conn));
//!
//! daemon
//!     .add_timeout(|conn: &mut Conn| conn.retransmits += 1, monotonic_now())
//!     .unwrap();
//!
//! while conn.lock().unwrap().retransmits == 0 {
//!     std::thread::sleep(Duration::from_millis(1));
//! }
//! daemon.stop();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod clock;
pub mod daemon;
mod heap;
pub mod lock;
pub mod record;

pub use clock::{monotonic_now, MonotonicClock, Time, TimeSource, VirtualClock};
pub use daemon::{Daemon, DaemonStopped};
pub use lock::Lockable;
pub use record::Timeout;
