//! Hybrid time: a hybrid logical clock value.
//!
//! A [`HybridTime`] packs a physical microsecond timestamp and a logical
//! counter into a single u64 (12 bits of logical component). The
//! [`HybridClock`] hands out monotonically increasing values and absorbs
//! timestamps observed from remote peers, so causally-related events are
//! ordered even across nodes with skewed wall clocks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of low bits reserved for the logical component.
const LOGICAL_BITS: u32 = 12;

const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// A hybrid logical clock value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct HybridTime(u64);

impl HybridTime {
    /// The minimum hybrid time.
    pub const MIN: Self = Self(0);

    /// The maximum hybrid time.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a hybrid time from a raw packed value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Creates a hybrid time from a physical microsecond timestamp with a
    /// zero logical component.
    #[inline]
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros << LOGICAL_BITS)
    }

    /// Returns the raw packed value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the physical component in microseconds.
    #[inline]
    #[must_use]
    pub const fn physical_micros(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    /// Returns the logical component.
    #[inline]
    #[must_use]
    pub const fn logical(self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    /// Returns the immediately following hybrid time.
    ///
    /// # Panics
    /// Panics if the value would overflow.
    #[inline]
    #[must_use]
    pub const fn incremented(self) -> Self {
        assert!(self.0 < u64::MAX, "hybrid time overflow");
        Self(self.0 + 1)
    }
}

impl fmt::Debug for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ht{{ p: {}, l: {} }}", self.physical_micros(), self.logical())
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical_micros(), self.logical())
    }
}

/// A monotonic hybrid logical clock.
///
/// `now()` never returns the same or a smaller value twice, and `observe()`
/// pulls the clock forward past any remotely-observed timestamp.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: AtomicU64,
}

impl HybridClock {
    /// Creates a clock starting at the current wall time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(Self::physical_now().raw()),
        }
    }

    /// Returns the next hybrid time: the maximum of wall time and the last
    /// value handed out, incremented in the logical component on ties.
    pub fn now(&self) -> HybridTime {
        let physical = Self::physical_now().raw();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = if physical > last { physical } else { last + 1 };
            match self.last.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return HybridTime::from_raw(next),
                Err(actual) => last = actual,
            }
        }
    }

    /// Absorbs a timestamp observed from a remote peer, so that subsequent
    /// `now()` calls are strictly greater than it.
    pub fn observe(&self, observed: HybridTime) {
        let mut last = self.last.load(Ordering::Acquire);
        while observed.raw() > last {
            match self.last.compare_exchange_weak(
                last,
                observed.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => last = actual,
            }
        }
    }

    fn physical_now() -> HybridTime {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros() as u64);
        HybridTime::from_micros(micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let ht = HybridTime::from_micros(1_000_000);
        assert_eq!(ht.physical_micros(), 1_000_000);
        assert_eq!(ht.logical(), 0);
        assert_eq!(ht.incremented().logical(), 1);
    }

    #[test]
    fn test_now_is_strictly_monotonic() {
        let clock = HybridClock::new();
        let mut prev = clock.now();
        for _ in 0..1_000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_observe_pulls_clock_forward() {
        let clock = HybridClock::new();
        let future = HybridTime::from_raw(clock.now().raw() + 1_000_000);
        clock.observe(future);
        assert!(clock.now() > future);
    }

    #[test]
    fn test_observe_of_past_is_noop() {
        let clock = HybridClock::new();
        let now = clock.now();
        clock.observe(HybridTime::MIN);
        assert!(clock.now() > now);
    }
}
