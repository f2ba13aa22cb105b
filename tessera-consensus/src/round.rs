//! Consensus rounds.
//!
//! A round is one operation's trip through replication: created on the
//! leader when an operation is submitted (or on a follower when a leader
//! message arrives), tracked in the pending map until committed, and
//! finished exactly once, with the committed op id on success or with an
//! `Aborted` status on term change or shutdown.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tessera_core::{HybridTime, OpId, OpType, ReplicateMsg, ReplicateMsgRef, Result, TermId};

/// Callback invoked exactly once when replication finishes.
pub type ReplicatedCallback = Box<dyn FnOnce(Result<OpId>) + Send>;

/// Hook run when the leader assigns a hybrid time to the round, letting
/// the operation materialize the time into its own state before append.
pub type PreAppendHook = Box<dyn FnOnce(HybridTime) + Send>;

/// Shared consensus round.
pub type ConsensusRoundRef = Arc<ConsensusRound>;

struct RoundInner {
    /// Leader-side: the term this round was submitted under.
    bound_term: Option<TermId>,
    /// Set once the round has a message (immediately for replica rounds,
    /// at id assignment for leader rounds).
    msg: Option<ReplicateMsgRef>,
    /// Leader-side payload pieces, consumed at id assignment.
    op_type: OpType,
    payload: Bytes,
    pre_append: Option<PreAppendHook>,
    callback: Option<ReplicatedCallback>,
}

/// One operation's replication round.
pub struct ConsensusRound {
    inner: Mutex<RoundInner>,
}

impl ConsensusRound {
    /// Creates a leader-side round. The message is built later, when the
    /// leader assigns an op id.
    #[must_use]
    pub fn leader(op_type: OpType, payload: Bytes) -> ConsensusRoundRef {
        Arc::new(Self {
            inner: Mutex::new(RoundInner {
                bound_term: None,
                msg: None,
                op_type,
                payload,
                pre_append: None,
                callback: None,
            }),
        })
    }

    /// Creates a replica-side round from a received message.
    #[must_use]
    pub fn replica(msg: ReplicateMsgRef) -> ConsensusRoundRef {
        Arc::new(Self {
            inner: Mutex::new(RoundInner {
                bound_term: None,
                op_type: msg.op_type,
                payload: msg.payload.clone(),
                msg: Some(msg),
                pre_append: None,
                callback: None,
            }),
        })
    }

    /// Binds the round to the term it was submitted under (leader side).
    pub fn bind_term(&self, term: TermId) {
        self.lock().bound_term = Some(term);
    }

    /// The bound term, if any.
    #[must_use]
    pub fn bound_term(&self) -> Option<TermId> {
        self.lock().bound_term
    }

    /// The operation type.
    #[must_use]
    pub fn op_type(&self) -> OpType {
        self.lock().op_type
    }

    /// Sets the replication-finished callback. Replaces any previous one.
    pub fn set_replicated_callback(&self, callback: ReplicatedCallback) {
        self.lock().callback = Some(callback);
    }

    /// Sets the pre-append hook run at id assignment.
    pub fn set_pre_append_hook(&self, hook: PreAppendHook) {
        self.lock().pre_append = Some(hook);
    }

    /// The round's message, once assigned.
    #[must_use]
    pub fn msg(&self) -> Option<ReplicateMsgRef> {
        self.lock().msg.clone()
    }

    /// The round's op id, once assigned.
    #[must_use]
    pub fn id(&self) -> Option<OpId> {
        self.lock().msg.as_ref().map(|m| m.id)
    }

    /// Leader-side: builds the immutable message with the assigned id,
    /// hybrid time, and committed op id, running the pre-append hook.
    pub(crate) fn assign(&self, id: OpId, hybrid_time: HybridTime, committed_op_id: OpId) {
        let mut inner = self.lock();
        debug_assert!(inner.msg.is_none(), "round already assigned");
        if let Some(hook) = inner.pre_append.take() {
            hook(hybrid_time);
        }
        inner.msg = Some(Arc::new(ReplicateMsg::new(
            id,
            inner.op_type,
            hybrid_time,
            committed_op_id,
            inner.payload.clone(),
        )));
    }

    /// Leader-side rollback when the queue rejects the batch: clears the
    /// assigned message so the id generator can be rewound.
    pub(crate) fn clear_assignment(&self) {
        self.lock().msg = None;
    }

    /// Invokes the replication-finished callback. Safe to call more than
    /// once; only the first call observes the callback.
    pub fn notify_replication_finished(&self, result: Result<OpId>) {
        let callback = self.lock().callback.take();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RoundInner> {
        self.inner.lock().expect("round lock poisoned")
    }
}

impl std::fmt::Debug for ConsensusRound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ConsensusRound")
            .field("op_type", &inner.op_type)
            .field("id", &inner.msg.as_ref().map(|m| m.id))
            .field("bound_term", &inner.bound_term)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tessera_core::{Error, LogIndex};

    use super::*;

    #[test]
    fn test_leader_round_assignment() {
        let round = ConsensusRound::leader(OpType::Write, Bytes::from_static(b"w"));
        assert!(round.id().is_none());

        let id = OpId::new(TermId::new(2), LogIndex::new(5));
        round.assign(id, HybridTime::from_micros(10), OpId::MIN);

        let msg = round.msg().unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.op_type, OpType::Write);
        assert_eq!(msg.payload, Bytes::from_static(b"w"));
    }

    #[test]
    fn test_pre_append_hook_sees_assigned_time() {
        let round = ConsensusRound::leader(OpType::Write, Bytes::new());
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        round.set_pre_append_hook(Box::new(move |ht| {
            *seen_clone.lock().unwrap() = Some(ht);
        }));

        let ht = HybridTime::from_micros(42);
        round.assign(OpId::new(TermId::new(1), LogIndex::new(1)), ht, OpId::MIN);
        assert_eq!(*seen.lock().unwrap(), Some(ht));
    }

    #[test]
    fn test_callback_fires_once() {
        let round = ConsensusRound::leader(OpType::Write, Bytes::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        round.set_replicated_callback(Box::new(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        round.notify_replication_finished(Err(Error::aborted("shutdown")));
        round.notify_replication_finished(Err(Error::aborted("shutdown")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
