//! The storage-engine seam.
//!
//! The [`Tablet`] trait is what the replication core needs from the
//! engine: apply hooks per operation kind, the flush fronts used by the
//! log-GC policy, a flush filter, and the memory-pressure check behind
//! replica-side backpressure. [`MemTablet`] is the in-memory
//! implementation used by tests and by tooling that replays a log.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use bytes::Bytes;
use tessera_core::{Error, HybridTime, LogIndex, OpId, Result};
use tracing::{debug, info};

use crate::operation::{
    AlterSchemaOperation, SnapshotOperation, TxnStatus, UpdateTxnOperation, WriteOperation,
};

/// Decides whether an immutable memtable (identified by the largest op id
/// written into it) may flush.
pub type FlushFilter = Box<dyn Fn(OpId) -> bool + Send + Sync>;

/// What the replication core requires of the storage engine.
pub trait Tablet: Send + Sync {
    /// Applies a committed write batch at the given hybrid time.
    ///
    /// # Errors
    /// Engine-level failures surface to the operation's submitter.
    fn apply_write(&self, op: &WriteOperation, op_id: OpId, hybrid_time: HybridTime) -> Result<()>;

    /// Applies a committed schema change.
    ///
    /// # Errors
    /// Engine-level failures surface to the operation's submitter.
    fn apply_alter_schema(&self, op: &AlterSchemaOperation, op_id: OpId) -> Result<()>;

    /// Applies a committed transaction status update.
    ///
    /// # Errors
    /// Engine-level failures surface to the operation's submitter.
    fn apply_update_txn(&self, op: &UpdateTxnOperation, op_id: OpId) -> Result<()>;

    /// Applies a committed snapshot marker.
    ///
    /// # Errors
    /// Engine-level failures surface to the operation's submitter.
    fn apply_snapshot(&self, op: &SnapshotOperation, op_id: OpId) -> Result<()>;

    /// Applies a committed truncation.
    ///
    /// # Errors
    /// Engine-level failures surface to the operation's submitter.
    fn apply_truncate(&self, op_id: OpId) -> Result<()>;

    /// Index of the last committed write applied to the engine.
    fn last_committed_write_index(&self) -> LogIndex;

    /// The largest op id that is durable in the engine's persistent
    /// layer (everything at or below it can be recovered without the
    /// log).
    ///
    /// # Errors
    /// Engine-level failures.
    fn max_persistent_op_id(&self) -> Result<OpId>;

    /// Flushes immutable memtables permitted by the flush filter.
    /// Returns how many flushed.
    ///
    /// # Errors
    /// Engine-level failures.
    fn flush(&self) -> Result<usize>;

    /// Installs the flush filter.
    fn set_flush_filter(&self, filter: FlushFilter);

    /// Checks the engine's memory soft limit.
    ///
    /// # Errors
    /// `ServiceUnavailable` above the soft limit.
    fn check_memory_pressure(&self) -> Result<()>;

    /// Current schema version.
    fn schema_version(&self) -> u32;
}

struct Memtable {
    rows: BTreeMap<Bytes, (HybridTime, Option<Bytes>)>,
    max_op_id: OpId,
    bytes: usize,
}

impl Memtable {
    fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            max_op_id: OpId::MIN,
            bytes: 0,
        }
    }
}

struct MemTabletInner {
    active: Memtable,
    immutables: VecDeque<Memtable>,
    persistent: BTreeMap<Bytes, (HybridTime, Option<Bytes>)>,
    max_persistent_op_id: OpId,
    last_committed_write_index: LogIndex,
    schema_version: u32,
    txns: HashMap<u64, TxnStatus>,
    snapshots: Vec<u64>,
}

/// In-memory MVCC-flavored storage engine.
pub struct MemTablet {
    inner: Mutex<MemTabletInner>,
    flush_filter: Mutex<Option<FlushFilter>>,
    memory_soft_limit_bytes: usize,
}

impl MemTablet {
    /// Creates an empty tablet with the given memory soft limit.
    #[must_use]
    pub fn new(memory_soft_limit_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(MemTabletInner {
                active: Memtable::new(),
                immutables: VecDeque::new(),
                persistent: BTreeMap::new(),
                max_persistent_op_id: OpId::MIN,
                last_committed_write_index: LogIndex::new(0),
                schema_version: 0,
                txns: HashMap::new(),
                snapshots: Vec::new(),
            }),
            flush_filter: Mutex::new(None),
            memory_soft_limit_bytes,
        }
    }

    /// Reads a row, newest layer first. `None` if absent or deleted.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let inner = self.lock();
        if let Some((_, value)) = inner.active.rows.get(key) {
            return value.clone();
        }
        for memtable in inner.immutables.iter().rev() {
            if let Some((_, value)) = memtable.rows.get(key) {
                return value.clone();
            }
        }
        inner.persistent.get(key).and_then(|(_, v)| v.clone())
    }

    /// Last known status of a transaction.
    #[must_use]
    pub fn txn_status(&self, txn_id: u64) -> Option<TxnStatus> {
        self.lock().txns.get(&txn_id).copied()
    }

    /// Approximate bytes held in memtables.
    #[must_use]
    pub fn memtable_bytes(&self) -> usize {
        let inner = self.lock();
        inner.active.bytes + inner.immutables.iter().map(|m| m.bytes).sum::<usize>()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemTabletInner> {
        self.inner.lock().expect("tablet lock poisoned")
    }
}

impl Tablet for MemTablet {
    fn apply_write(&self, op: &WriteOperation, op_id: OpId, hybrid_time: HybridTime) -> Result<()> {
        let mut inner = self.lock();
        debug_assert!(
            op_id.index > inner.last_committed_write_index,
            "writes apply in index order"
        );
        for row in &op.rows {
            let delta = row.key.len() + row.value.as_ref().map_or(0, Bytes::len);
            inner.active.bytes += delta;
            inner
                .active
                .rows
                .insert(row.key.clone(), (hybrid_time, row.value.clone()));
        }
        inner.active.max_op_id = inner.active.max_op_id.max(op_id);
        inner.last_committed_write_index = op_id.index;
        Ok(())
    }

    fn apply_alter_schema(&self, op: &AlterSchemaOperation, op_id: OpId) -> Result<()> {
        let mut inner = self.lock();
        info!(
            op_id = %op_id,
            schema_version = op.schema_version,
            "applying schema change"
        );
        inner.schema_version = op.schema_version;
        Ok(())
    }

    fn apply_update_txn(&self, op: &UpdateTxnOperation, _op_id: OpId) -> Result<()> {
        self.lock().txns.insert(op.txn_id, op.status);
        Ok(())
    }

    fn apply_snapshot(&self, op: &SnapshotOperation, _op_id: OpId) -> Result<()> {
        self.lock().snapshots.push(op.snapshot_id);
        Ok(())
    }

    fn apply_truncate(&self, op_id: OpId) -> Result<()> {
        let mut inner = self.lock();
        info!(op_id = %op_id, "truncating tablet");
        inner.active = Memtable::new();
        inner.immutables.clear();
        inner.persistent.clear();
        Ok(())
    }

    fn last_committed_write_index(&self) -> LogIndex {
        self.lock().last_committed_write_index
    }

    fn max_persistent_op_id(&self) -> Result<OpId> {
        Ok(self.lock().max_persistent_op_id)
    }

    fn flush(&self) -> Result<usize> {
        let filter = self.flush_filter.lock().expect("flush filter lock poisoned");
        let mut inner = self.lock();

        // Rotate the active memtable so its contents become flushable.
        if !inner.active.rows.is_empty() {
            let rotated = std::mem::replace(&mut inner.active, Memtable::new());
            inner.immutables.push_back(rotated);
        }

        let mut flushed = 0;
        loop {
            let Some(front_max) = inner.immutables.front().map(|m| m.max_op_id) else {
                break;
            };
            let permitted = filter.as_ref().map_or(true, |f| f(front_max));
            if !permitted {
                debug!(max_op_id = %front_max, "flush filter held back a memtable");
                break;
            }
            let memtable = inner.immutables.pop_front().expect("front exists");
            for (key, versioned) in memtable.rows {
                inner.persistent.insert(key, versioned);
            }
            inner.max_persistent_op_id = inner.max_persistent_op_id.max(memtable.max_op_id);
            flushed += 1;
        }
        Ok(flushed)
    }

    fn set_flush_filter(&self, filter: FlushFilter) {
        *self.flush_filter.lock().expect("flush filter lock poisoned") = Some(filter);
    }

    fn check_memory_pressure(&self) -> Result<()> {
        let used = self.memtable_bytes();
        if used > self.memory_soft_limit_bytes {
            return Err(Error::service_unavailable(format!(
                "memtables hold {used} bytes, over the soft limit {}",
                self.memory_soft_limit_bytes
            )));
        }
        Ok(())
    }

    fn schema_version(&self) -> u32 {
        self.lock().schema_version
    }
}

#[cfg(test)]
mod tests {
    use tessera_core::TermId;

    use crate::operation::RowOp;

    use super::*;

    fn write(rows: Vec<RowOp>) -> WriteOperation {
        WriteOperation::new(rows)
    }

    fn op_id(index: u64) -> OpId {
        OpId::new(TermId::new(1), LogIndex::new(index))
    }

    #[test]
    fn test_write_and_read_back() {
        let tablet = MemTablet::new(1 << 20);
        tablet
            .apply_write(
                &write(vec![RowOp::put(&b"k"[..], &b"v"[..])]),
                op_id(1),
                HybridTime::from_micros(1),
            )
            .unwrap();
        assert_eq!(tablet.get(b"k"), Some(Bytes::from_static(b"v")));
        assert_eq!(tablet.last_committed_write_index(), LogIndex::new(1));
    }

    #[test]
    fn test_delete_shadows_older_layers() {
        let tablet = MemTablet::new(1 << 20);
        tablet
            .apply_write(
                &write(vec![RowOp::put(&b"k"[..], &b"v"[..])]),
                op_id(1),
                HybridTime::from_micros(1),
            )
            .unwrap();
        tablet.flush().unwrap();
        tablet
            .apply_write(
                &write(vec![RowOp::delete(&b"k"[..])]),
                op_id(2),
                HybridTime::from_micros(2),
            )
            .unwrap();
        assert_eq!(tablet.get(b"k"), None);
    }

    #[test]
    fn test_flush_filter_holds_back_unlogged_memtable() {
        let tablet = MemTablet::new(1 << 20);
        // Only ops at or below index 1 are "logged".
        tablet.set_flush_filter(Box::new(|max_op| max_op.index <= LogIndex::new(1)));

        tablet
            .apply_write(
                &write(vec![RowOp::put(&b"a"[..], &b"1"[..])]),
                op_id(1),
                HybridTime::from_micros(1),
            )
            .unwrap();
        assert_eq!(tablet.flush().unwrap(), 1);
        assert_eq!(tablet.max_persistent_op_id().unwrap(), op_id(1));

        tablet
            .apply_write(
                &write(vec![RowOp::put(&b"b"[..], &b"2"[..])]),
                op_id(2),
                HybridTime::from_micros(2),
            )
            .unwrap();
        // Index 2 is not yet logged, so the filter refuses it.
        assert_eq!(tablet.flush().unwrap(), 0);
        assert_eq!(tablet.max_persistent_op_id().unwrap(), op_id(1));
        // The data is still readable from the immutable memtable.
        assert_eq!(tablet.get(b"b"), Some(Bytes::from_static(b"2")));
    }

    #[test]
    fn test_memory_pressure() {
        let tablet = MemTablet::new(8);
        tablet
            .apply_write(
                &write(vec![RowOp::put(&b"key"[..], &b"0123456789"[..])]),
                op_id(1),
                HybridTime::from_micros(1),
            )
            .unwrap();
        assert!(tablet.check_memory_pressure().unwrap_err().is_service_unavailable());
    }
}
