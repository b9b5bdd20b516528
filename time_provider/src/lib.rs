//! Time source abstraction used by retention clipping, chunk sealing and
//! eviction, and tier boundary computation.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_docs, missing_debug_implementations, clippy::clone_on_ref_ptr)]

use std::{
    fmt::Debug,
    sync::Arc,
    time::{Duration, SystemTime},
};

use parking_lot::RwLock;

/// A point in time, represented as milliseconds since the Unix epoch.
///
/// All timestamps in the query core (sample timestamps, retention
/// boundaries, query `startMs`/`endMs`) are `i64` millisecond values; `Time`
/// exists only at the planner/store boundary, where "now" needs to be
/// injectable for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(i64);

impl Time {
    /// Construct a `Time` from a millisecond timestamp.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// The millisecond timestamp this `Time` represents.
    pub fn timestamp_millis(&self) -> i64 {
        self.0
    }

    /// `self` minus `other`, saturating rather than panicking on overflow.
    pub fn checked_duration_since(&self, other: Self) -> Option<Duration> {
        let delta = self.0.checked_sub(other.0)?;
        if delta < 0 {
            None
        } else {
            Some(Duration::from_millis(delta as u64))
        }
    }
}

impl std::ops::Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_sub(rhs.as_millis() as i64))
    }
}

impl std::ops::Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(rhs.as_millis() as i64))
    }
}

/// Abstraction over "what time is it", injected into planners and the chunk
/// store so tests can control retention and eviction boundaries
/// deterministically.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Current wall-clock time.
    fn now(&self) -> Time;
}

/// [`TimeProvider`] backed by the OS clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a new [`SystemProvider`].
    pub fn new() -> Self {
        Self {}
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_millis() as i64;
        Time::from_timestamp_millis(millis)
    }
}

/// [`TimeProvider`] with a settable clock, for deterministic tests of
/// retention clipping, chunk sealing and eviction LRU ordering.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a new [`MockProvider`] set to `now`.
    pub fn new(now: Time) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Overwrite the current time.
    pub fn set(&self, now: Time) {
        *self.now.write() = now;
    }

    /// Advance the current time by `delta`.
    pub fn inc(&self, delta: Duration) {
        let mut guard = self.now.write();
        *guard = *guard + delta;
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

/// Convenience for embedders that want a shared, cloneable handle.
pub type TimeProviderRef = Arc<dyn TimeProvider>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_set_and_inc() {
        let p = MockProvider::new(Time::from_timestamp_millis(1_000));
        assert_eq!(p.now().timestamp_millis(), 1_000);
        p.inc(Duration::from_millis(500));
        assert_eq!(p.now().timestamp_millis(), 1_500);
        p.set(Time::from_timestamp_millis(42));
        assert_eq!(p.now().timestamp_millis(), 42);
    }

    #[test]
    fn time_arithmetic_allows_negative_timestamps() {
        let t = Time::from_timestamp_millis(100);
        assert_eq!((t - Duration::from_millis(1000)).timestamp_millis(), -900);
    }

    #[test]
    fn checked_duration_since_none_when_negative() {
        let a = Time::from_timestamp_millis(10);
        let b = Time::from_timestamp_millis(20);
        assert!(a.checked_duration_since(b).is_none());
        assert_eq!(b.checked_duration_since(a), Some(Duration::from_millis(10)));
    }
}
