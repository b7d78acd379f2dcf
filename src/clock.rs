//! Monotonic time for deadline scheduling.
//!
//! All deadlines handed to the daemon are absolute [`Time`] values drawn
//! from a process-wide monotonic clock. The clock is bound to the OS
//! monotonic source (CLOCK_MONOTONIC semantics, via [`std::time::Instant`])
//! and is unaffected by wall-clock adjustment: for any two reads in program
//! order, the second is never earlier than the first.
//!
//! [`TimeSource`] is the seam that lets the daemon run against
//! [`VirtualClock`] in tests instead of the real [`MonotonicClock`].

use std::fmt;
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

#[inline]
fn duration_to_nanos_saturating(duration: Duration) -> u64 {
    duration.as_nanos().min(u128::from(u64::MAX)) as u64
}

/// The instant all process-wide [`Time`] values are measured from.
///
/// Lazily pinned on first use so that every `MonotonicClock` and every
/// `monotonic_now` call share one epoch and their readings are mutually
/// comparable.
fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// A monotonic instant, in nanoseconds since the process clock epoch.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(u64);

impl Time {
    /// The zero instant (epoch).
    pub const ZERO: Self = Self(0);

    /// The maximum representable instant.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a time from nanoseconds since the epoch.
    #[inline]
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a time from milliseconds since the epoch.
    #[inline]
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Creates a time from seconds since the epoch.
    #[inline]
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Returns the time as nanoseconds since the epoch.
    #[inline]
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the time as milliseconds since the epoch (truncated).
    #[inline]
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Adds a duration in nanoseconds, saturating on overflow.
    #[inline]
    #[must_use]
    pub const fn saturating_add_nanos(self, nanos: u64) -> Self {
        Self(self.0.saturating_add(nanos))
    }

    /// Returns true if `self` is strictly later than `other`.
    #[inline]
    #[must_use]
    pub const fn after(self, other: Self) -> bool {
        self.0 > other.0
    }

    /// Returns the duration since `earlier`, or zero if `self` precedes it.
    #[inline]
    #[must_use]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        self.saturating_add_nanos(duration_to_nanos_saturating(rhs))
    }
}

impl fmt::Debug for Time {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ns)", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000_000 {
            write!(
                f,
                "{}.{:03}s",
                self.0 / 1_000_000_000,
                (self.0 / 1_000_000) % 1000
            )
        } else if self.0 >= 1_000_000 {
            write!(f, "{}ms", self.0 / 1_000_000)
        } else if self.0 >= 1_000 {
            write!(f, "{}us", self.0 / 1_000)
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

/// Time source abstraction for reading the current instant.
///
/// Implementations must be monotonic: successive `now` calls never go
/// backwards. The daemon is generic over this trait so tests can drive it
/// with a [`VirtualClock`].
pub trait TimeSource: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// Returns the current process-wide monotonic time.
///
/// Deadlines passed to the daemon's default clock must be computed
/// relative to this function, not to wall time.
#[must_use]
pub fn monotonic_now() -> Time {
    Time::from_nanos(duration_to_nanos_saturating(process_epoch().elapsed()))
}

/// The OS monotonic clock, for production use.
///
/// Reads CLOCK_MONOTONIC (through [`std::time::Instant`]) against the
/// process-wide epoch, so every instance and [`monotonic_now`] agree.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    /// Creates a new monotonic clock.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> Time {
        monotonic_now()
    }
}

/// Virtual time source for deterministic tests.
///
/// Time only advances when explicitly told to do so.
///
/// # Example
///
/// ```
/// use timeoutd::{Time, TimeSource, VirtualClock};
///
/// let clock = VirtualClock::new();
/// assert_eq!(clock.now(), Time::ZERO);
///
/// clock.advance(1_000_000_000); // 1 second
/// assert_eq!(clock.now(), Time::from_secs(1));
/// ```
#[derive(Debug, Default)]
pub struct VirtualClock {
    /// Current time in nanoseconds.
    now: AtomicU64,
}

impl VirtualClock {
    /// Creates a new virtual clock starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances time by the given number of nanoseconds.
    pub fn advance(&self, nanos: u64) {
        self.now.fetch_add(nanos, Ordering::Release);
    }

    /// Sets the current time.
    pub fn set(&self, time: Time) {
        self.now.store(time.as_nanos(), Ordering::Release);
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Time {
        Time::from_nanos(self.now.load(Ordering::Acquire))
    }
}
