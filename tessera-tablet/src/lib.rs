//! Tablet-side glue around the replication core.
//!
//! A [`TabletPeer`] owns one tablet replica's moving parts: the
//! write-ahead log, the consensus instance, the serial [`Preparer`]
//! pipeline, the apply executor, and the storage engine behind the
//! [`Tablet`] trait. It also owns the log-GC policy: the earliest log
//! index that must be retained is the minimum over the log anchors, the
//! in-flight operations, the engine's flush fronts, and the committed op
//! id.

mod anchor;
mod driver;
mod operation;
mod preparer;
mod tablet;
mod tablet_peer;

pub use anchor::{LogAnchor, LogAnchorRegistry};
pub use driver::{ApplyTask, ClientCallback, OperationDriver, OperationStatusInfo, OperationTracker};
pub use operation::{
    AlterSchemaOperation, EmptyOperation, Operation, OperationLifecycle, RowOp,
    SnapshotOperation, TruncateOperation, TxnStatus, UpdateTxnOperation, WriteOperation,
};
pub use preparer::Preparer;
pub use tablet::{FlushFilter, MemTablet, Tablet};
pub use tablet_peer::{GcHorizonSource, TabletPeer, TabletPeerOptions};
