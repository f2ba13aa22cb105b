//! Operation drivers.
//!
//! One driver shepherds one operation through prepare → replicate →
//! apply. The consensus round's replication-finished callback routes back
//! into the driver: success enqueues the apply on the serial apply
//! executor, failure (abort, term change) fails the submitter. The
//! tracker holds every in-flight driver so the log-GC policy can see the
//! lowest op index still in use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tessera_consensus::{ConsensusRound, ConsensusRoundRef};
use tessera_core::{Error, HybridTime, OpId, OpType, ReplicateMsgRef, Result, TermId};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::operation::Operation;
use crate::tablet::Tablet;

/// Callback completing the client's submission.
pub type ClientCallback = Box<dyn FnOnce(Result<OpId>) + Send>;

/// A task queued to the serial apply executor.
pub struct ApplyTask {
    pub(crate) driver: Arc<OperationDriver>,
    pub(crate) op_id: OpId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Created,
    Prepared,
    Applied,
    Failed,
}

struct DriverInner {
    operation: Option<Operation>,
    client_callback: Option<ClientCallback>,
    state: DriverState,
}

/// Status snapshot of one in-flight operation.
#[derive(Debug, Clone)]
pub struct OperationStatusInfo {
    /// Assigned op id, if replication has started.
    pub op_id: Option<OpId>,
    /// Operation kind.
    pub op_type: OpType,
    /// Leader-side or replica-side.
    pub is_leader_side: bool,
    /// How long the operation has been running.
    pub running_for: Duration,
}

/// Drives one operation through its lifecycle.
pub struct OperationDriver {
    tablet: Arc<dyn Tablet>,
    tracker: Arc<OperationTracker>,
    round: ConsensusRoundRef,
    inner: Mutex<DriverInner>,
    is_leader_side: bool,
    start_time: Instant,
}

impl OperationDriver {
    /// Creates a leader-side driver: the round carries the encoded
    /// operation and is bound to the submission term.
    #[must_use]
    pub fn new_leader(
        operation: Operation,
        term: TermId,
        tablet: Arc<dyn Tablet>,
        tracker: Arc<OperationTracker>,
        apply_tx: mpsc::UnboundedSender<ApplyTask>,
        client_callback: Option<ClientCallback>,
    ) -> Arc<Self> {
        let round = ConsensusRound::leader(operation.op_type(), operation.encode());
        round.bind_term(term);
        let driver = Arc::new(Self {
            tablet,
            tracker,
            round,
            inner: Mutex::new(DriverInner {
                operation: Some(operation),
                client_callback,
                state: DriverState::Created,
            }),
            is_leader_side: true,
            start_time: Instant::now(),
        });
        driver.wire_round(&apply_tx);
        // Writes materialize their assigned hybrid time into the batch.
        let hook_driver = Arc::clone(&driver);
        driver.round.set_pre_append_hook(Box::new(move |ht| {
            hook_driver.set_hybrid_time(ht);
        }));
        driver
    }

    /// Creates a replica-side driver from a received message.
    ///
    /// # Errors
    /// `Corruption` if the payload cannot be decoded.
    pub fn new_replica(
        msg: ReplicateMsgRef,
        tablet: Arc<dyn Tablet>,
        tracker: Arc<OperationTracker>,
        apply_tx: mpsc::UnboundedSender<ApplyTask>,
    ) -> Result<Arc<Self>> {
        let operation = Operation::decode(msg.op_type, msg.payload.clone())?;
        let round = ConsensusRound::replica(msg);
        let driver = Arc::new(Self {
            tablet,
            tracker,
            round,
            inner: Mutex::new(DriverInner {
                operation: Some(operation),
                client_callback: None,
                state: DriverState::Created,
            }),
            is_leader_side: false,
            start_time: Instant::now(),
        });
        driver.wire_round(&apply_tx);
        Ok(driver)
    }

    fn wire_round(self: &Arc<Self>, apply_tx: &mpsc::UnboundedSender<ApplyTask>) {
        let callback_driver = Arc::clone(self);
        let apply_tx = apply_tx.clone();
        self.round
            .set_replicated_callback(Box::new(move |result| match result {
                Ok(op_id) => {
                    let _ = apply_tx.send(ApplyTask {
                        driver: callback_driver,
                        op_id,
                    });
                }
                Err(e) => callback_driver.handle_failure(e),
            }));
    }

    /// The driver's consensus round.
    #[must_use]
    pub fn round(&self) -> ConsensusRoundRef {
        Arc::clone(&self.round)
    }

    /// The assigned op id, once replication has started.
    #[must_use]
    pub fn op_id(&self) -> Option<OpId> {
        self.round.id()
    }

    /// Whether this driver was submitted on the leader.
    #[must_use]
    pub const fn is_leader_side(&self) -> bool {
        self.is_leader_side
    }

    /// The operation kind.
    #[must_use]
    pub fn op_type(&self) -> OpType {
        self.round.op_type()
    }

    /// Status snapshot.
    #[must_use]
    pub fn status(&self) -> OperationStatusInfo {
        OperationStatusInfo {
            op_id: self.op_id(),
            op_type: self.op_type(),
            is_leader_side: self.is_leader_side,
            running_for: self.start_time.elapsed(),
        }
    }

    /// Runs `prepare` and registers with the tracker.
    ///
    /// # Errors
    /// The prepare error; the driver is not tracked on failure.
    pub fn prepare_and_start(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.lock();
            debug_assert_eq!(inner.state, DriverState::Created);
            let operation = inner
                .operation
                .as_mut()
                .ok_or_else(|| Error::illegal_state("operation already consumed"))?;
            operation.prepare(self.tablet.as_ref())?;
            inner.state = DriverState::Prepared;
        }
        self.tracker.add(self);
        Ok(())
    }

    /// Fails the operation: the submitter hears the error, the tracker
    /// forgets the driver.
    pub fn handle_failure(&self, error: Error) {
        let callback = {
            let mut inner = self.lock();
            if inner.state == DriverState::Failed || inner.state == DriverState::Applied {
                return;
            }
            inner.state = DriverState::Failed;
            if let Some(operation) = inner.operation.as_mut() {
                operation.aborted(&error);
            }
            inner.client_callback.take()
        };
        self.tracker.remove(self);
        // Consume the round's callback as well; it holds the reference
        // back to this driver. Re-entry is cut off by the Failed state.
        self.round
            .notify_replication_finished(Err(error.clone()));
        debug!(op_id = ?self.op_id(), error = %error, "operation failed");
        if let Some(callback) = callback {
            callback(Err(error));
        }
    }

    /// Applies the committed operation. Runs on the serial apply
    /// executor.
    pub(crate) fn apply(&self, op_id: OpId) {
        let hybrid_time = self
            .round
            .msg()
            .map_or(HybridTime::MIN, |m| m.hybrid_time);
        let (result, callback) = {
            let mut inner = self.lock();
            let Some(mut operation) = inner.operation.take() else {
                return;
            };
            let result = operation.apply(self.tablet.as_ref(), op_id, hybrid_time);
            inner.state = if result.is_ok() {
                DriverState::Applied
            } else {
                DriverState::Failed
            };
            (result, inner.client_callback.take())
        };
        self.tracker.remove(self);
        match result {
            Ok(()) => {
                if let Some(callback) = callback {
                    callback(Ok(op_id));
                }
            }
            Err(e) => {
                error!(op_id = %op_id, error = %e, "apply failed");
                if let Some(callback) = callback {
                    callback(Err(e));
                }
            }
        }
    }

    fn set_hybrid_time(&self, hybrid_time: HybridTime) {
        let mut inner = self.lock();
        if let Some(operation) = inner.operation.as_mut() {
            operation.set_hybrid_time(hybrid_time);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DriverInner> {
        self.inner.lock().expect("driver lock poisoned")
    }
}

impl std::fmt::Debug for OperationDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationDriver")
            .field("op_type", &self.op_type())
            .field("op_id", &self.op_id())
            .field("leader_side", &self.is_leader_side)
            .finish()
    }
}

/// Tracks in-flight drivers for introspection and the log-GC policy.
#[derive(Default)]
pub struct OperationTracker {
    inner: Mutex<HashMap<usize, Arc<OperationDriver>>>,
}

impl OperationTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn add(&self, driver: &Arc<OperationDriver>) {
        let key = Arc::as_ptr(driver) as usize;
        self.lock().insert(key, Arc::clone(driver));
    }

    fn remove(&self, driver: &OperationDriver) {
        let key = driver as *const OperationDriver as usize;
        self.lock().remove(&key);
    }

    /// Number of tracked drivers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The lowest op index among in-flight operations that have one.
    #[must_use]
    pub fn min_pending_op_index(&self) -> Option<tessera_core::LogIndex> {
        self.lock()
            .values()
            .filter_map(|d| d.op_id())
            .map(|id| id.index)
            .min()
    }

    /// Status of every in-flight operation.
    #[must_use]
    pub fn statuses(&self) -> Vec<OperationStatusInfo> {
        self.lock().values().map(|d| d.status()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Arc<OperationDriver>>> {
        self.inner.lock().expect("tracker lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tessera_core::LogIndex;

    use crate::operation::{RowOp, WriteOperation};
    use crate::tablet::MemTablet;

    use super::*;

    fn setup() -> (
        Arc<MemTablet>,
        Arc<OperationTracker>,
        mpsc::UnboundedSender<ApplyTask>,
        mpsc::UnboundedReceiver<ApplyTask>,
    ) {
        let tablet = Arc::new(MemTablet::new(1 << 20));
        let tracker = OperationTracker::new();
        let (tx, rx) = mpsc::unbounded_channel();
        (tablet, tracker, tx, rx)
    }

    fn write_op() -> Operation {
        Operation::Write(WriteOperation::new(vec![RowOp::put(
            &b"k"[..],
            &b"v"[..],
        )]))
    }

    #[tokio::test]
    async fn test_leader_driver_applies_after_replication() {
        let (tablet, tracker, tx, mut rx) = setup();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let driver = OperationDriver::new_leader(
            write_op(),
            TermId::new(1),
            Arc::clone(&tablet) as Arc<dyn Tablet>,
            Arc::clone(&tracker),
            tx,
            Some(Box::new(move |result| {
                let _ = done_tx.send(result);
            })),
        );

        driver.prepare_and_start().unwrap();
        assert_eq!(tracker.len(), 1);

        // Simulate consensus finishing replication at (1, 1).
        let op_id = OpId::new(TermId::new(1), LogIndex::new(1));
        assert!(driver.round().msg().is_none());
        driver.round().notify_replication_finished(Ok(op_id));

        let task = rx.recv().await.unwrap();
        assert_eq!(task.op_id, op_id);
        task.driver.apply(task.op_id);

        assert_eq!(done_rx.await.unwrap().unwrap(), op_id);
        assert_eq!(tablet.get(b"k"), Some(Bytes::from_static(b"v")));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_failure_reaches_client_and_untracks() {
        let (tablet, tracker, tx, _rx) = setup();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let driver = OperationDriver::new_leader(
            write_op(),
            TermId::new(1),
            tablet as Arc<dyn Tablet>,
            Arc::clone(&tracker),
            tx,
            Some(Box::new(move |result| {
                let _ = done_tx.send(result);
            })),
        );
        driver.prepare_and_start().unwrap();

        driver
            .round()
            .notify_replication_finished(Err(Error::aborted("term changed")));
        let err = done_rx.await.unwrap().unwrap_err();
        assert!(err.is_aborted());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_replica_driver_decodes_payload() {
        let (tablet, tracker, tx, _rx) = setup();
        let op = write_op();
        let msg = ReplicateMsgRef::new(tessera_core::ReplicateMsg::new(
            OpId::new(TermId::new(1), LogIndex::new(3)),
            op.op_type(),
            HybridTime::from_micros(5),
            OpId::MIN,
            op.encode(),
        ));
        let driver =
            OperationDriver::new_replica(msg, tablet as Arc<dyn Tablet>, tracker, tx).unwrap();
        assert!(!driver.is_leader_side());
        assert_eq!(driver.op_id(), Some(OpId::new(TermId::new(1), LogIndex::new(3))));
        driver.prepare_and_start().unwrap();
    }
}
