//! Log anchors: named pins that hold back log GC.
//!
//! Subsystems that still need a log prefix (compactions, snapshot
//! transfers) register an anchor at an index; GC never reclaims past the
//! earliest registered anchor. Anchors unregister themselves on drop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tessera_core::LogIndex;

/// Registry of active anchors.
#[derive(Debug, Default)]
pub struct LogAnchorRegistry {
    inner: Mutex<BTreeMap<u64, (LogIndex, String)>>,
    next_key: AtomicU64,
}

impl LogAnchorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an anchor holding the log at `index`.
    #[must_use]
    pub fn register(self: &Arc<Self>, index: LogIndex, owner: impl Into<String>) -> LogAnchor {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(key, (index, owner.into()));
        LogAnchor {
            registry: Arc::downgrade(self),
            key,
        }
    }

    /// The earliest anchored index, if any anchors are registered.
    #[must_use]
    pub fn earliest_anchored_index(&self) -> Option<LogIndex> {
        self.lock().values().map(|(index, _)| *index).min()
    }

    /// Number of registered anchors.
    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn unregister(&self, key: u64) {
        self.lock().remove(&key);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, (LogIndex, String)>> {
        self.inner.lock().expect("anchor registry lock poisoned")
    }
}

/// A registered anchor; unregisters on drop.
#[derive(Debug)]
pub struct LogAnchor {
    registry: Weak<LogAnchorRegistry>,
    key: u64,
}

impl Drop for LogAnchor {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_earliest_tracks_registered_anchors() {
        let registry = LogAnchorRegistry::new();
        assert_eq!(registry.earliest_anchored_index(), None);

        let _a = registry.register(LogIndex::new(10), "compaction");
        let b = registry.register(LogIndex::new(4), "snapshot");
        assert_eq!(registry.earliest_anchored_index(), Some(LogIndex::new(4)));
        assert_eq!(registry.count(), 2);

        drop(b);
        assert_eq!(registry.earliest_anchored_index(), Some(LogIndex::new(10)));
    }
}
