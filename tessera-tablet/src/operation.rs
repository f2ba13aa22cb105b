//! Tablet operations.
//!
//! One tagged sum covers every replicated operation kind; the lifecycle
//! hooks (`prepare`, `apply`, `aborted`) are dispatched uniformly by the
//! operation driver. Payloads encode to the opaque bytes carried by the
//! replicate message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tessera_core::{Error, HybridTime, OpId, OpType, Result};

use crate::tablet::Tablet;

/// Transaction status carried by an update-transaction operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// The transaction committed.
    Committed,
    /// The transaction aborted.
    Aborted,
}

impl TxnStatus {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Committed => 0,
            Self::Aborted => 1,
        }
    }

    const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Committed),
            1 => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// One row mutation: a put (`value` set) or a delete (`value` empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowOp {
    /// Row key.
    pub key: Bytes,
    /// New value, or `None` to delete the row.
    pub value: Option<Bytes>,
}

impl RowOp {
    /// A put.
    #[must_use]
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// A delete.
    #[must_use]
    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

/// Lifecycle hooks shared by all operation kinds, dispatched by the
/// driver.
pub trait OperationLifecycle {
    /// Pre-replication work (validation, locking). Runs on the preparer.
    ///
    /// # Errors
    /// A failing prepare drops the operation before replication.
    fn prepare(&mut self, tablet: &dyn Tablet) -> Result<()>;

    /// Applies the committed operation to the storage engine. Runs on the
    /// apply executor, in index order.
    ///
    /// # Errors
    /// Apply failures surface to the submitter.
    fn apply(&mut self, tablet: &dyn Tablet, op_id: OpId, hybrid_time: HybridTime) -> Result<()>;

    /// Called when the operation is aborted instead of applied.
    fn aborted(&mut self, _reason: &Error) {}
}

/// A batch of row writes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteOperation {
    /// Row mutations, applied atomically.
    pub rows: Vec<RowOp>,
    /// Hybrid time materialized at append (leader side).
    hybrid_time: Option<HybridTime>,
}

impl WriteOperation {
    /// Creates a write of the given rows.
    #[must_use]
    pub fn new(rows: Vec<RowOp>) -> Self {
        Self {
            rows,
            hybrid_time: None,
        }
    }

    /// Records the hybrid time assigned at append.
    pub fn set_hybrid_time(&mut self, hybrid_time: HybridTime) {
        self.hybrid_time = Some(hybrid_time);
    }
}

impl OperationLifecycle for WriteOperation {
    fn prepare(&mut self, _tablet: &dyn Tablet) -> Result<()> {
        if self.rows.is_empty() {
            return Err(Error::invalid_argument("write with no rows"));
        }
        Ok(())
    }

    fn apply(&mut self, tablet: &dyn Tablet, op_id: OpId, hybrid_time: HybridTime) -> Result<()> {
        let ht = self.hybrid_time.unwrap_or(hybrid_time);
        tablet.apply_write(self, op_id, ht)
    }
}

/// A schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterSchemaOperation {
    /// New schema version; must advance.
    pub schema_version: u32,
    /// Opaque schema descriptor.
    pub schema: Bytes,
}

impl OperationLifecycle for AlterSchemaOperation {
    fn prepare(&mut self, tablet: &dyn Tablet) -> Result<()> {
        // Schema changes take the engine's schema latch; the preparer
        // never batches two of these together.
        if self.schema_version <= tablet.schema_version() {
            return Err(Error::invalid_argument(format!(
                "schema version {} does not advance {}",
                self.schema_version,
                tablet.schema_version()
            )));
        }
        Ok(())
    }

    fn apply(&mut self, tablet: &dyn Tablet, op_id: OpId, _hybrid_time: HybridTime) -> Result<()> {
        tablet.apply_alter_schema(self, op_id)
    }
}

/// A transaction status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTxnOperation {
    /// Transaction id.
    pub txn_id: u64,
    /// New status.
    pub status: TxnStatus,
}

impl OperationLifecycle for UpdateTxnOperation {
    fn prepare(&mut self, _tablet: &dyn Tablet) -> Result<()> {
        Ok(())
    }

    fn apply(&mut self, tablet: &dyn Tablet, op_id: OpId, _hybrid_time: HybridTime) -> Result<()> {
        tablet.apply_update_txn(self, op_id)
    }
}

/// A snapshot marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOperation {
    /// Snapshot id.
    pub snapshot_id: u64,
}

impl OperationLifecycle for SnapshotOperation {
    fn prepare(&mut self, _tablet: &dyn Tablet) -> Result<()> {
        Ok(())
    }

    fn apply(&mut self, tablet: &dyn Tablet, op_id: OpId, _hybrid_time: HybridTime) -> Result<()> {
        tablet.apply_snapshot(self, op_id)
    }
}

/// Truncate the tablet's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TruncateOperation;

impl OperationLifecycle for TruncateOperation {
    fn prepare(&mut self, _tablet: &dyn Tablet) -> Result<()> {
        Ok(())
    }

    fn apply(&mut self, tablet: &dyn Tablet, op_id: OpId, _hybrid_time: HybridTime) -> Result<()> {
        tablet.apply_truncate(op_id)
    }
}

/// The in-memory-only operation used to propagate safe time; applies to
/// nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmptyOperation;

impl OperationLifecycle for EmptyOperation {
    fn prepare(&mut self, _tablet: &dyn Tablet) -> Result<()> {
        Ok(())
    }

    fn apply(&mut self, _tablet: &dyn Tablet, _op_id: OpId, _hybrid_time: HybridTime) -> Result<()> {
        Ok(())
    }
}

/// Every replicated tablet operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Row writes.
    Write(WriteOperation),
    /// Schema change.
    AlterSchema(AlterSchemaOperation),
    /// Transaction status update.
    UpdateTxn(UpdateTxnOperation),
    /// Snapshot marker.
    Snapshot(SnapshotOperation),
    /// Tablet truncation.
    Truncate(TruncateOperation),
    /// Safe-time propagation.
    Empty(EmptyOperation),
}

impl Operation {
    /// The wire-level operation type.
    #[must_use]
    pub const fn op_type(&self) -> OpType {
        match self {
            Self::Write(_) => OpType::Write,
            Self::AlterSchema(_) => OpType::AlterSchema,
            Self::UpdateTxn(_) => OpType::UpdateTransaction,
            Self::Snapshot(_) => OpType::Snapshot,
            Self::Truncate(_) => OpType::Truncate,
            Self::Empty(_) => OpType::Empty,
        }
    }

    /// Encodes the operation payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Write(write) => {
                // Row count bounded by the engine's batch limits.
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u32_le(write.rows.len() as u32);
                for row in &write.rows {
                    #[allow(clippy::cast_possible_truncation)]
                    buf.put_u32_le(row.key.len() as u32);
                    buf.put_slice(&row.key);
                    match &row.value {
                        Some(value) => {
                            buf.put_u8(1);
                            #[allow(clippy::cast_possible_truncation)]
                            buf.put_u32_le(value.len() as u32);
                            buf.put_slice(value);
                        }
                        None => {
                            buf.put_u8(0);
                            buf.put_u32_le(0);
                        }
                    }
                }
            }
            Self::AlterSchema(alter) => {
                buf.put_u32_le(alter.schema_version);
                buf.put_slice(&alter.schema);
            }
            Self::UpdateTxn(txn) => {
                buf.put_u64_le(txn.txn_id);
                buf.put_u8(txn.status.as_u8());
            }
            Self::Snapshot(snapshot) => {
                buf.put_u64_le(snapshot.snapshot_id);
            }
            Self::Truncate(_) | Self::Empty(_) => {}
        }
        buf.freeze()
    }

    /// Decodes an operation from its type tag and payload.
    ///
    /// # Errors
    /// `Corruption` on a malformed payload, `InvalidArgument` for op types
    /// the tablet does not own (no-ops and config changes never reach the
    /// operation layer).
    pub fn decode(op_type: OpType, payload: Bytes) -> Result<Self> {
        let mut buf = &payload[..];
        match op_type {
            OpType::Write => {
                if buf.remaining() < 4 {
                    return Err(Error::corruption("write payload truncated"));
                }
                let count = buf.get_u32_le() as usize;
                let mut rows = Vec::with_capacity(count);
                for _ in 0..count {
                    if buf.remaining() < 4 {
                        return Err(Error::corruption("row key truncated"));
                    }
                    let key_len = buf.get_u32_le() as usize;
                    if buf.remaining() < key_len + 5 {
                        return Err(Error::corruption("row truncated"));
                    }
                    let key = buf.copy_to_bytes(key_len);
                    let has_value = buf.get_u8() == 1;
                    let value_len = buf.get_u32_le() as usize;
                    if buf.remaining() < value_len {
                        return Err(Error::corruption("row value truncated"));
                    }
                    let value = has_value.then(|| buf.copy_to_bytes(value_len));
                    if !has_value && value_len > 0 {
                        return Err(Error::corruption("delete row carries a value"));
                    }
                    rows.push(RowOp { key, value });
                }
                Ok(Self::Write(WriteOperation::new(rows)))
            }
            OpType::AlterSchema => {
                if buf.remaining() < 4 {
                    return Err(Error::corruption("alter-schema payload truncated"));
                }
                let schema_version = buf.get_u32_le();
                let schema = buf.copy_to_bytes(buf.remaining());
                Ok(Self::AlterSchema(AlterSchemaOperation {
                    schema_version,
                    schema,
                }))
            }
            OpType::UpdateTransaction => {
                if buf.remaining() < 9 {
                    return Err(Error::corruption("update-txn payload truncated"));
                }
                let txn_id = buf.get_u64_le();
                let tag = buf.get_u8();
                let status = TxnStatus::from_u8(tag)
                    .ok_or_else(|| Error::corruption(format!("unknown txn status {tag}")))?;
                Ok(Self::UpdateTxn(UpdateTxnOperation { txn_id, status }))
            }
            OpType::Snapshot => {
                if buf.remaining() < 8 {
                    return Err(Error::corruption("snapshot payload truncated"));
                }
                Ok(Self::Snapshot(SnapshotOperation {
                    snapshot_id: buf.get_u64_le(),
                }))
            }
            OpType::Truncate => Ok(Self::Truncate(TruncateOperation)),
            OpType::Empty => Ok(Self::Empty(EmptyOperation)),
            OpType::NoOp | OpType::ChangeConfig => Err(Error::invalid_argument(format!(
                "{op_type:?} is not a tablet operation"
            ))),
        }
    }

    /// Records the assigned hybrid time (write operations only).
    pub fn set_hybrid_time(&mut self, hybrid_time: HybridTime) {
        if let Self::Write(write) = self {
            write.set_hybrid_time(hybrid_time);
        }
    }

    fn lifecycle_mut(&mut self) -> &mut dyn OperationLifecycle {
        match self {
            Self::Write(op) => op,
            Self::AlterSchema(op) => op,
            Self::UpdateTxn(op) => op,
            Self::Snapshot(op) => op,
            Self::Truncate(op) => op,
            Self::Empty(op) => op,
        }
    }

    /// Dispatches `prepare`.
    ///
    /// # Errors
    /// See [`OperationLifecycle::prepare`].
    pub fn prepare(&mut self, tablet: &dyn Tablet) -> Result<()> {
        self.lifecycle_mut().prepare(tablet)
    }

    /// Dispatches `apply`.
    ///
    /// # Errors
    /// See [`OperationLifecycle::apply`].
    pub fn apply(&mut self, tablet: &dyn Tablet, op_id: OpId, hybrid_time: HybridTime) -> Result<()> {
        self.lifecycle_mut().apply(tablet, op_id, hybrid_time)
    }

    /// Dispatches `aborted`.
    pub fn aborted(&mut self, reason: &Error) {
        self.lifecycle_mut().aborted(reason);
    }
}
