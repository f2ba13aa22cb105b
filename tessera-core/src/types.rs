//! Strongly-typed identifiers for Tessera entities.
//!
//! Explicit id types prevent bugs from mixing up raw integers. All ids are
//! 64-bit so they survive large deployments and long-lived tablets.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Macro to generate strongly-typed id wrappers.
///
/// Each id type wraps a u64 and provides:
/// - Type safety (a `PeerId` cannot stand in for a `TermId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same representation as a raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new id from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next id in sequence.
            ///
            /// # Panics
            /// Panics if the id would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "id overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(TermId, "term", "Raft term number for leader election.");
define_id!(LogIndex, "idx", "Index into the replicated log.");
define_id!(PeerId, "peer", "Permanent identifier for a replica peer.");
define_id!(TabletId, "tablet", "Identifier for a tablet (replica group).");

impl LogIndex {
    /// Returns the previous index, saturating at zero.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

/// Identifier of a replicated log entry: `(term, index)`.
///
/// Op ids are totally ordered lexicographically, term first. The minimum
/// sentinel `(0, 0)` means "nothing received yet".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OpId {
    /// Term under which the entry was created.
    pub term: TermId,
    /// Position of the entry in the log.
    pub index: LogIndex,
}

impl OpId {
    /// The minimum sentinel: `(term 0, index 0)`.
    pub const MIN: Self = Self {
        term: TermId::new(0),
        index: LogIndex::new(0),
    };

    /// Creates a new op id.
    #[inline]
    #[must_use]
    pub const fn new(term: TermId, index: LogIndex) -> Self {
        Self { term, index }
    }

    /// Returns true if this is the minimum sentinel.
    #[inline]
    #[must_use]
    pub fn is_min(self) -> bool {
        self == Self::MIN
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term.get(), self.index.get())
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term.get(), self.index.get())
    }
}

/// A lock-free snapshot cell for an [`OpId`].
///
/// Readers never block writers and vice versa: the cell is a seqlock over
/// two `AtomicU64`s. Writers must be externally serialized (there is one
/// writer per cell in practice: the log appender or the replica state).
#[derive(Debug, Default)]
pub struct AtomicOpId {
    seq: AtomicU64,
    term: AtomicU64,
    index: AtomicU64,
}

impl AtomicOpId {
    /// Creates a cell holding the given op id.
    #[must_use]
    pub fn new(op_id: OpId) -> Self {
        Self {
            seq: AtomicU64::new(0),
            term: AtomicU64::new(op_id.term.get()),
            index: AtomicU64::new(op_id.index.get()),
        }
    }

    /// Stores a new op id. Callers must serialize stores externally.
    pub fn store(&self, op_id: OpId) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Release);
        self.term.store(op_id.term.get(), Ordering::Release);
        self.index.store(op_id.index.get(), Ordering::Release);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Loads a consistent snapshot of the op id.
    #[must_use]
    pub fn load(&self) -> OpId {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before % 2 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let term = self.term.load(Ordering::Acquire);
            let index = self.index.load(Ordering::Acquire);
            let after = self.seq.load(Ordering::Acquire);
            if before == after {
                return OpId::new(TermId::new(term), LogIndex::new(index));
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_type_safety() {
        let peer = PeerId::new(1);
        let term = TermId::new(1);

        // Same raw value, different types; they cannot be compared directly.
        assert_eq!(peer.get(), term.get());
    }

    #[test]
    fn test_id_display() {
        let peer = PeerId::new(42);
        assert_eq!(format!("{peer}"), "peer-42");
        assert_eq!(format!("{peer:?}"), "peer(42)");
    }

    #[test]
    fn test_log_index_prev_saturates() {
        assert_eq!(LogIndex::new(0).prev(), LogIndex::new(0));
        assert_eq!(LogIndex::new(5).prev(), LogIndex::new(4));
    }

    #[test]
    fn test_op_id_ordering_is_lexicographic() {
        let a = OpId::new(TermId::new(1), LogIndex::new(9));
        let b = OpId::new(TermId::new(2), LogIndex::new(1));
        let c = OpId::new(TermId::new(2), LogIndex::new(2));

        assert!(a < b, "higher term wins regardless of index");
        assert!(b < c, "same term compares by index");
        assert!(OpId::MIN < a);
        assert!(OpId::MIN.is_min());
    }

    #[test]
    fn test_atomic_op_id_roundtrip() {
        let cell = AtomicOpId::new(OpId::MIN);
        assert_eq!(cell.load(), OpId::MIN);

        let id = OpId::new(TermId::new(3), LogIndex::new(17));
        cell.store(id);
        assert_eq!(cell.load(), id);
    }
}
