//! The consensus orchestrator.
//!
//! `RaftConsensus` ties the pieces together: the leader-side replicate
//! path, the 12-step follower update path, vote handling, config changes,
//! stepdown, and the role transitions driven by elections and term
//! advances. Queue events (watermark advances, failed followers, observed
//! higher terms) arrive on a channel drained by a serial observer task, so
//! the queue lock is never held when consensus is re-entered.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tessera_core::{
    Error, HybridClock, LogIndex, OpId, OpType, PeerId, ReplicateMsgRef, Result, TabletId, TermId,
};
use tessera_log::LogStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConsensusOptions;
use crate::failure_detector::{FailureDetector, FailureMonitor};
use crate::leader_election::{
    ElectionDecision, ElectionResult, LeaderElection, VoteCounter,
};
use crate::metadata::{
    decode_config_change, encode_config_change, ConsensusMetadata, MemberType, MetadataStore,
    RaftConfig, RaftPeer,
};
use crate::peer::{RequestTriggerMode, RoleChangeDelegate};
use crate::peer_manager::PeerManager;
use crate::proxy::PeerProxyFactory;
use crate::queue::{MajorityReplicatedData, PeerMessageQueue, QueueEvent};
use crate::replica_state::{LeaderLeaseStatus, ReplicaState, Role, StateGuard};
use crate::round::{ConsensusRound, ConsensusRoundRef, ReplicatedCallback};
use crate::rpc::{
    ConsensusErrorCode, ConsensusRequest, ConsensusResponse, ConsensusStatus,
    LeaderElectionLostRequest, RunLeaderElectionRequest, TabletServerError,
    TabletServerErrorCode, VoteRequest, VoteResponse,
};

/// Creates replica-side operations from received replicate messages, and
/// owns the storage engine's backpressure policy.
pub trait ReplicaOperationFactory: Send + Sync {
    /// Starts a replica operation for `msg`: creates its round, kicks off
    /// the (asynchronous) prepare, and returns the round to track.
    ///
    /// # Errors
    /// Returns an error if the operation cannot be started; the caller
    /// drops this and all later messages of the request.
    fn start_replica_operation(&self, msg: ReplicateMsgRef) -> Result<ConsensusRoundRef>;

    /// Checks the storage engine's memory soft limit.
    ///
    /// # Errors
    /// `ServiceUnavailable` when above the soft limit.
    fn check_memory_pressure(&self) -> Result<()> {
        Ok(())
    }
}

/// How an election is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionMode {
    /// Ordinary election after a leader failure.
    NormalElection,
    /// Leadership transfer: run even if a leader seems alive.
    ElectLeaderNow,
}

/// Kinds of single-server config changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeConfigType {
    /// Add a PRE_VOTER or PRE_OBSERVER.
    AddServer,
    /// Remove a peer (never self).
    RemoveServer,
    /// Promote PRE_VOTER→VOTER or PRE_OBSERVER→OBSERVER.
    ChangeRole,
}

/// A config-change request.
#[derive(Debug, Clone)]
pub struct ChangeConfigRequest {
    /// What to do.
    pub change_type: ChangeConfigType,
    /// The peer in question. For `AddServer` the address and (transient)
    /// member type are required; for `ChangeRole` the member type is the
    /// target type; for `RemoveServer` only the id matters.
    pub server: RaftPeer,
    /// Optional compare-and-swap on the committed config's opid index.
    pub cas_config_opid_index: Option<LogIndex>,
}

/// The per-tablet Raft consensus instance.
pub struct RaftConsensus {
    tablet_id: TabletId,
    local_peer_id: PeerId,
    options: Arc<ConsensusOptions>,
    state: ReplicaState,
    queue: Arc<PeerMessageQueue>,
    peer_manager: PeerManager,
    log: Arc<LogStore>,
    clock: Arc<HybridClock>,
    failure_detector: Arc<FailureDetector>,
    proxy_factory: Arc<dyn PeerProxyFactory>,
    operation_factory: Arc<dyn ReplicaOperationFactory>,
    /// Coarse lock serializing `update` and `request_vote`.
    update_mutex: tokio::sync::Mutex<()>,
    withhold_votes_until: Mutex<Instant>,
    withhold_election_start_until: Mutex<Instant>,
    election_lost_by_protege_at: Mutex<Option<(PeerId, Instant)>>,
    election_originator: Mutex<Option<PeerId>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<QueueEvent>>>,
    observer_task: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<FailureMonitor>>,
}

struct RoleChanger {
    consensus: std::sync::Weak<RaftConsensus>,
}

impl RoleChangeDelegate for RoleChanger {
    fn request_role_change(&self, peer: PeerId) {
        let Some(consensus) = self.consensus.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            consensus.promote_bootstrapped_peer(peer);
        });
    }
}

impl RaftConsensus {
    /// Builds the consensus instance. Call [`start`](Self::start) before
    /// using it.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn create(
        tablet_id: TabletId,
        local_peer_id: PeerId,
        options: Arc<ConsensusOptions>,
        meta: ConsensusMetadata,
        store: Arc<dyn MetadataStore>,
        log: Arc<LogStore>,
        clock: Arc<HybridClock>,
        proxy_factory: Arc<dyn PeerProxyFactory>,
        operation_factory: Arc<dyn ReplicaOperationFactory>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|weak| {
            let queue = PeerMessageQueue::new(
                tablet_id,
                local_peer_id,
                Arc::clone(&options),
                Arc::clone(&log),
                Arc::clone(&clock),
                events_tx,
            );
            let delegate: Arc<dyn RoleChangeDelegate> = Arc::new(RoleChanger {
                consensus: weak.clone(),
            });
            let peer_manager = PeerManager::new(
                tablet_id,
                local_peer_id,
                Arc::clone(&options),
                Arc::clone(&queue),
                Arc::clone(&proxy_factory),
                delegate,
            );
            let state = ReplicaState::new(
                tablet_id,
                local_peer_id,
                Arc::clone(&options),
                meta,
                store,
            );
            Self {
                tablet_id,
                local_peer_id,
                options,
                state,
                queue,
                peer_manager,
                log,
                clock,
                failure_detector: Arc::new(FailureDetector::new()),
                proxy_factory,
                operation_factory,
                update_mutex: tokio::sync::Mutex::new(()),
                withhold_votes_until: Mutex::new(Instant::now()),
                withhold_election_start_until: Mutex::new(Instant::now()),
                election_lost_by_protege_at: Mutex::new(None),
                election_originator: Mutex::new(None),
                events_rx: Mutex::new(Some(events_rx)),
                observer_task: Mutex::new(None),
                monitor: Mutex::new(None),
            }
        })
    }

    /// Starts the replica: primes watermarks from the recovered WAL state,
    /// rebuilds the pending map from entries above the committed index,
    /// spawns the queue observer and the failure monitor, and begins as a
    /// follower.
    ///
    /// # Errors
    /// `IllegalState` unless the replica is freshly initialized.
    pub fn start(self: &Arc<Self>, last_in_wal: OpId, committed: OpId) -> Result<()> {
        self.start_with_recovered(last_in_wal, committed, Vec::new())
    }

    /// Like [`start`](Self::start), re-registering recovered uncommitted
    /// entries as pending rounds (the tablet bootstrap path).
    ///
    /// # Errors
    /// `IllegalState` unless freshly initialized; factory errors from
    /// restarting recovered operations.
    pub fn start_with_recovered(
        self: &Arc<Self>,
        last_in_wal: OpId,
        committed: OpId,
        recovered: Vec<ReplicateMsgRef>,
    ) -> Result<()> {
        {
            let mut guard = self.state.lock_for_start()?;
            guard.start(last_in_wal, committed);
            for msg in recovered {
                if msg.id.index <= committed.index {
                    continue;
                }
                let round = match msg.op_type {
                    OpType::NoOp => ConsensusRound::replica(msg),
                    OpType::ChangeConfig => self.start_replica_config_change(&mut guard, &msg)?,
                    _ => self.operation_factory.start_replica_operation(msg)?,
                };
                guard.add_pending_operation(round)?;
            }
        }
        self.queue.init(last_in_wal);

        let events = self
            .events_rx
            .lock()
            .expect("events lock poisoned")
            .take()
            .ok_or_else(|| Error::illegal_state("consensus already started"))?;
        let weak = Arc::downgrade(self);
        let observer = tokio::spawn(Self::run_observer(weak, events));
        *self.observer_task.lock().expect("observer lock poisoned") = Some(observer);

        if self.options.enable_leader_failure_detection {
            self.failure_detector
                .enable(self.election_timeout_with_jitter());
            let weak = Arc::downgrade(self);
            let monitor = FailureMonitor::spawn(
                Arc::clone(&self.failure_detector),
                self.options.leader_failure_monitor_check_mean,
                self.options.leader_failure_monitor_check_stddev,
                move || {
                    if let Some(consensus) = weak.upgrade() {
                        consensus.report_failure_detected();
                    }
                },
            );
            *self.monitor.lock().expect("monitor lock poisoned") = Some(monitor);
        }
        info!(tablet = %self.tablet_id, peer = %self.local_peer_id, "consensus started");
        Ok(())
    }

    /// The tablet this instance replicates.
    #[must_use]
    pub const fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    /// This replica's permanent id.
    #[must_use]
    pub const fn peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Lock-free role + term snapshot.
    #[must_use]
    pub fn role_and_term(&self) -> (Role, TermId) {
        self.state.role_and_term()
    }

    /// The current term the leader serves in, if we are leader.
    #[must_use]
    pub fn leader_term(&self) -> Option<TermId> {
        match self.state.role_and_term() {
            (Role::Leader, term) => Some(term),
            _ => None,
        }
    }

    /// The known leader, for client redirection hints.
    #[must_use]
    pub fn leader_hint(&self) -> Option<PeerId> {
        self.state.lock_for_read().ok().and_then(|g| g.leader_id())
    }

    /// The committed op id.
    #[must_use]
    pub fn committed_op_id(&self) -> OpId {
        self.state
            .lock_for_read()
            .map(|g| g.committed_op_id())
            .unwrap_or(OpId::MIN)
    }

    /// The last received op id.
    #[must_use]
    pub fn last_received_op_id(&self) -> OpId {
        self.state
            .lock_for_read()
            .map(|g| g.last_received())
            .unwrap_or(OpId::MIN)
    }

    /// The committed Raft config.
    #[must_use]
    pub fn committed_config(&self) -> RaftConfig {
        self.state
            .lock_for_read()
            .map(|g| g.committed_config().clone())
            .unwrap_or_default()
    }

    /// On-disk size of the consensus metadata.
    #[must_use]
    pub fn metadata_on_disk_size(&self) -> u64 {
        self.state
            .lock_for_read()
            .map(|g| g.metadata_on_disk_size())
            .unwrap_or(0)
    }

    /// Blocks until this leader holds a majority-replicated lease.
    ///
    /// # Errors
    /// See [`ReplicaState::wait_for_leader_lease`].
    pub fn wait_for_leader_lease(&self, deadline: Instant) -> Result<()> {
        self.state.wait_for_leader_lease(deadline)
    }

    // ---------------------------------------------------------------------
    // Leader path

    /// Replicates a batch of leader-side rounds: assigns ids, stamps the
    /// committed op id, appends to the local log, and signals the peers.
    ///
    /// # Errors
    /// `IllegalState` if not leader, `Aborted` on a bound-term mismatch,
    /// `ServiceUnavailable` on backpressure (allocated ids are rolled
    /// back).
    pub fn replicate_batch(self: &Arc<Self>, rounds: &[ConsensusRoundRef]) -> Result<()> {
        if rounds.is_empty() {
            return Ok(());
        }
        {
            let mut guard = self.state.lock_for_replicate()?;
            if let (LeaderLeaseStatus::OldLeaderMayHaveLease, Some(remaining)) =
                guard.leader_lease_status()
            {
                return Err(Error::service_unavailable(format!(
                    "old leader may still hold a lease for {remaining:?}"
                )));
            }
            self.replicate_rounds_unlocked(&mut guard, rounds)?;
        }
        self.peer_manager
            .signal_request(RequestTriggerMode::NonEmptyOnly);
        Ok(())
    }

    fn replicate_rounds_unlocked(
        self: &Arc<Self>,
        guard: &mut StateGuard<'_>,
        rounds: &[ConsensusRoundRef],
    ) -> Result<()> {
        let current_term = guard.current_term();
        for round in rounds {
            if let Some(bound) = round.bound_term() {
                if bound != current_term {
                    return Err(Error::aborted(format!(
                        "round bound to term {bound}, current term is {current_term}"
                    )));
                }
            }
        }

        let committed = guard.committed_op_id();
        let mut assigned: Vec<(OpId, ConsensusRoundRef)> = Vec::with_capacity(rounds.len());
        for round in rounds {
            let id = guard.new_id();
            round.assign(id, self.clock.now(), committed);
            if let Err(e) = guard.add_pending_operation(Arc::clone(round)) {
                round.clear_assignment();
                guard.cancel_pending_operation(id, false);
                Self::rollback_assigned(guard, &mut assigned);
                return Err(e);
            }
            assigned.push((id, Arc::clone(round)));
        }

        let msgs: Vec<ReplicateMsgRef> = assigned
            .iter()
            .map(|(_, round)| round.msg().expect("assigned round has a message"))
            .collect();
        let tablet_id = self.tablet_id;
        if let Err(e) = self.queue.append_operations(
            msgs,
            Box::new(move |result| {
                if let Err(e) = result {
                    warn!(tablet = %tablet_id, error = %e, "local append failed");
                }
            }),
        ) {
            Self::rollback_assigned(guard, &mut assigned);
            return Err(e);
        }

        let last = assigned
            .last()
            .map(|(id, _)| *id)
            .expect("assigned batch is non-empty");
        guard.update_last_received(last, true);
        Ok(())
    }

    fn rollback_assigned(guard: &mut StateGuard<'_>, assigned: &mut Vec<(OpId, ConsensusRoundRef)>) {
        // Ids are rewound newest-first so the generator stays contiguous.
        while let Some((id, round)) = assigned.pop() {
            guard.cancel_pending_operation(id, true);
            round.clear_assignment();
        }
    }

    // ---------------------------------------------------------------------
    // Follower path

    /// Handles an `UpdateConsensus` request: dedup, term and log-matching
    /// checks, early commit, replica prepares, log append, commit, and the
    /// synchronous wait for local durability.
    ///
    /// # Errors
    /// Protocol-level denials travel inside the response; hard errors
    /// (corruption, shutdown) surface as `Err`.
    pub async fn update(self: &Arc<Self>, request: ConsensusRequest) -> Result<ConsensusResponse> {
        let _update_guard = self.update_mutex.lock().await;

        if request.dest_id != self.local_peer_id {
            return Ok(self.server_error_response(
                TabletServerErrorCode::WrongServerId,
                format!(
                    "request for {} arrived at {}",
                    request.dest_id, self.local_peer_id
                ),
            ));
        }
        if request.tablet_id != self.tablet_id {
            return Ok(self.server_error_response(
                TabletServerErrorCode::TabletNotFound,
                format!("tablet {} is not hosted here", request.tablet_id),
            ));
        }

        if let Some(ht) = request.propagated_hybrid_time {
            self.clock.observe(ht);
        }
        if let Some(ht) = request.propagated_safe_time {
            self.clock.observe(ht);
        }

        let (response, durable_rx) = {
            let mut guard = self.state.lock_for_update()?;

            // Step 2: deduplicate against committed and pending state.
            let mut preceding = request.preceding_id;
            let mut first_new = 0usize;
            while first_new < request.ops.len() {
                let msg = &request.ops[first_new];
                let (known, term_mismatch) = guard.is_op_committed_or_pending(msg.id);
                if known {
                    preceding = msg.id;
                    first_new += 1;
                    continue;
                }
                if term_mismatch {
                    // A conflicting entry: everything from here on is
                    // replaced by the leader's version.
                    let keep_to = msg.id.index.prev();
                    guard.abort_ops_after(keep_to)?;
                    self.truncate_log_after(keep_to);
                }
                break;
            }
            let new_msgs = &request.ops[first_new..];

            // Step 3: the surviving messages must be sequential.
            let mut prev = preceding;
            for msg in new_msgs {
                crate::replica_state::StateInner::check_op_in_sequence(prev, msg.id)?;
                prev = msg.id;
            }

            // Step 4: term check.
            if request.caller_term < guard.current_term() {
                let response = self.build_response(
                    &guard,
                    Some((
                        ConsensusErrorCode::InvalidTerm,
                        format!(
                            "caller term {} is behind local term {}",
                            request.caller_term,
                            guard.current_term()
                        ),
                    )),
                );
                return Ok(response);
            }
            if request.caller_term > guard.current_term() {
                self.handle_term_advance_unlocked(&mut guard, request.caller_term)?;
            } else if guard.active_role() == Role::Leader {
                return Err(Error::illegal_state(
                    "two leaders cannot share a term; rejecting update",
                ));
            }

            // Step 5: log-matching property.
            let (matched, mismatch) = guard.is_op_committed_or_pending(preceding);
            if !(matched || preceding.is_min()) {
                if mismatch {
                    let keep_to = preceding.index.prev();
                    guard.abort_ops_after(keep_to)?;
                    self.truncate_log_after(keep_to);
                }
                let response = self.build_response(
                    &guard,
                    Some((
                        ConsensusErrorCode::PrecedingEntryDidntMatch,
                        format!("no local entry matching preceding op {preceding}"),
                    )),
                );
                return Ok(response);
            }

            // Step 6: accept the leader, refresh liveness and leases.
            if guard.leader_id() != Some(request.caller_id) {
                guard.set_leader(Some(request.caller_id));
            }
            guard.update_old_leader_lease(
                request.leader_lease_duration_ms.map(Duration::from_millis),
                request.ht_lease_expiration,
            );
            self.snooze_failure_detector(None);
            *self
                .withhold_votes_until
                .lock()
                .expect("withhold lock poisoned") = Instant::now() + self.options.election_timeout();

            // Step 7: early commit of already-pending ops.
            let early_target = guard
                .last_pending_index()
                .min(preceding.index)
                .min(request.committed_index);
            guard.advance_committed_index(early_target)?;

            // Step 8: start replica operations (prepare is async).
            let mut started: Vec<ReplicateMsgRef> = Vec::with_capacity(new_msgs.len());
            let mut prepare_error: Option<Error> = None;
            for msg in new_msgs {
                if let Err(e) = self.operation_factory.check_memory_pressure() {
                    if started.is_empty() && first_new == 0 {
                        return Err(e);
                    }
                    prepare_error = Some(e);
                    break;
                }
                let round = match msg.op_type {
                    // Consensus-internal entries never reach the storage
                    // engine's operation layer.
                    OpType::NoOp => ConsensusRound::replica(Arc::clone(msg)),
                    OpType::ChangeConfig => {
                        match self.start_replica_config_change(&mut guard, msg) {
                            Ok(round) => round,
                            Err(e) => {
                                prepare_error = Some(e);
                                break;
                            }
                        }
                    }
                    _ => match self.operation_factory.start_replica_operation(Arc::clone(msg)) {
                        Ok(round) => round,
                        Err(e) => {
                            prepare_error = Some(e);
                            break;
                        }
                    },
                };
                guard.add_pending_operation(round)?;
                started.push(Arc::clone(msg));
            }

            // Step 9: append the started messages to the local log.
            let durable_rx = if started.is_empty() {
                None
            } else {
                let (tx, rx) = tokio::sync::oneshot::channel();
                let append_result = self.log.append_replicates(
                    started.clone(),
                    Box::new(move |result| {
                        let _ = tx.send(result);
                    }),
                );
                if let Err(e) = append_result {
                    // Roll the started rounds back out of the pending map.
                    guard.abort_ops_after(preceding.index)?;
                    return Err(e.into());
                }
                let last = started.last().map(|m| m.id).expect("started is non-empty");
                guard.update_last_received(last, true);
                Some(rx)
            };

            // Step 10: commit up to what we actually hold.
            let commit_target = guard
                .last_received_current_leader()
                .index
                .min(request.committed_index);
            guard.advance_committed_index(commit_target)?;

            // Step 11: fill the response.
            let response = self.build_response(
                &guard,
                prepare_error.map(|e| (ConsensusErrorCode::CannotPrepare, e.to_string())),
            );
            (response, durable_rx)
        };

        // Step 12: wait for local durability, keeping the failure detector
        // snoozed while the disk catches up.
        if let Some(mut rx) = durable_rx {
            loop {
                match tokio::time::timeout(Duration::from_millis(100), &mut rx).await {
                    Ok(Ok(Ok(()))) => break,
                    Ok(Ok(Err(e))) => return Err(e),
                    Ok(Err(_recv_gone)) => break,
                    Err(_elapsed) => self.snooze_failure_detector(None),
                }
            }
        }
        self.snooze_failure_detector(None);
        Ok(response)
    }

    fn start_replica_config_change(
        &self,
        guard: &mut StateGuard<'_>,
        msg: &ReplicateMsgRef,
    ) -> Result<ConsensusRoundRef> {
        let (_, new_config) = decode_config_change(&msg.payload)?;
        info!(
            tablet = %self.tablet_id,
            peer = %self.local_peer_id,
            op_id = %msg.id,
            peers = new_config.peers.len(),
            "received config change from leader"
        );
        if guard.has_pending_config() {
            // A replayed or replacing change: the previous proposal lost.
            guard.clear_pending_config();
        }
        guard.set_pending_config(new_config)?;
        Ok(ConsensusRound::replica(Arc::clone(msg)))
    }

    fn build_response(
        &self,
        guard: &StateGuard<'_>,
        error: Option<(ConsensusErrorCode, String)>,
    ) -> ConsensusResponse {
        let mut status = ConsensusStatus::ok(
            guard.last_received(),
            guard.last_received_current_leader(),
            guard.committed_op_id().index,
        );
        if let Some((code, message)) = error {
            status = status.with_error(code, message);
        }
        ConsensusResponse {
            responder_id: self.local_peer_id,
            responder_term: guard.current_term(),
            status,
            error: None,
        }
    }

    fn server_error_response(
        &self,
        code: TabletServerErrorCode,
        message: String,
    ) -> ConsensusResponse {
        let (_, term) = self.state.role_and_term();
        ConsensusResponse {
            responder_id: self.local_peer_id,
            responder_term: term,
            status: ConsensusStatus::ok(OpId::MIN, OpId::MIN, LogIndex::new(0)),
            error: Some(TabletServerError { code, message }),
        }
    }

    fn truncate_log_after(&self, index: LogIndex) {
        match self.log.truncate_after(index) {
            Ok(_ack) => {}
            Err(e) => warn!(
                tablet = %self.tablet_id,
                index = index.get(),
                error = %e,
                "failed to enqueue log truncation"
            ),
        }
    }

    // ---------------------------------------------------------------------
    // Votes and elections

    /// Handles a `RequestVote` request.
    ///
    /// # Errors
    /// `IllegalState` if the replica is not running; denials travel in the
    /// response.
    pub async fn request_vote(self: &Arc<Self>, request: &VoteRequest) -> Result<VoteResponse> {
        let _update_guard = self.update_mutex.lock().await;
        let mut guard = self.state.lock_for_update()?;

        // A vote request from an older term is refused outright.
        if request.candidate_term < guard.current_term() {
            return Ok(self.deny_vote(
                &guard,
                ConsensusErrorCode::InvalidTerm,
            ));
        }

        // We recently heard from a live leader; don't destabilize it.
        let withhold = *self
            .withhold_votes_until
            .lock()
            .expect("withhold lock poisoned");
        if !request.ignore_live_leader && Instant::now() < withhold {
            return Ok(self.deny_vote(&guard, ConsensusErrorCode::LeaderIsAlive));
        }

        if request.candidate_term > guard.current_term() {
            self.handle_term_advance_unlocked(&mut guard, request.candidate_term)?;
        }

        if guard.has_voted_current_term() && guard.voted_for() != Some(request.candidate_id) {
            return Ok(self.deny_vote(&guard, ConsensusErrorCode::AlreadyVoted));
        }

        if request.last_received < guard.last_received() {
            return Ok(self.deny_vote(&guard, ConsensusErrorCode::LastOpIdTooOld));
        }

        // Grant: the vote is durable before the reply leaves.
        guard.set_voted_for(request.candidate_id)?;
        self.snooze_failure_detector(None);
        info!(
            tablet = %self.tablet_id,
            peer = %self.local_peer_id,
            candidate = %request.candidate_id,
            term = request.candidate_term.get(),
            "granted vote"
        );

        let lease_remaining = guard.remaining_old_leader_lease();
        Ok(VoteResponse {
            responder_id: self.local_peer_id,
            responder_term: guard.current_term(),
            vote_granted: true,
            error_code: None,
            remaining_leader_lease_duration_ms: lease_remaining
                .map(|d| d.as_millis() as u64),
            leader_ht_lease_expiration: Some(guard.old_leader_ht_lease_expiration()),
        })
    }

    fn deny_vote(&self, guard: &StateGuard<'_>, code: ConsensusErrorCode) -> VoteResponse {
        debug!(
            tablet = %self.tablet_id,
            peer = %self.local_peer_id,
            ?code,
            "denying vote"
        );
        VoteResponse {
            responder_id: self.local_peer_id,
            responder_term: guard.current_term(),
            vote_granted: false,
            error_code: Some(code),
            remaining_leader_lease_duration_ms: None,
            leader_ht_lease_expiration: None,
        }
    }

    /// Starts a leader election: advances the term, votes for self
    /// (durably), and fans out vote requests.
    ///
    /// # Errors
    /// `IllegalState` if not a voter, already leader, or shut down.
    pub fn start_election(self: &Arc<Self>, mode: ElectionMode) -> Result<()> {
        let (vote_request, election, voters) = {
            let mut guard = self.state.lock_for_config_change()?;
            if guard.active_role() == Role::Leader {
                return Ok(());
            }
            let is_voter = guard
                .active_config()
                .peer(self.local_peer_id)
                .map_or(false, |p| p.member_type == MemberType::Voter);
            if !is_voter {
                return Err(Error::illegal_state(
                    "only voting members may start elections",
                ));
            }

            let new_term = TermId::new(guard.current_term().get() + 1);
            guard.set_current_term(new_term)?;
            guard.set_voted_for(self.local_peer_id)?;
            guard.set_leader(None);

            let config = guard.active_config().clone();
            let mut counter = VoteCounter::new(config.voter_count());
            counter.register_vote(self.local_peer_id, true)?;

            let vote_request = VoteRequest {
                candidate_id: self.local_peer_id,
                candidate_term: new_term,
                tablet_id: self.tablet_id,
                dest_id: self.local_peer_id,
                last_received: guard.last_received(),
                ignore_live_leader: mode == ElectionMode::ElectLeaderNow,
            };

            let mut voters = Vec::new();
            for peer in config.voters() {
                if peer.id == self.local_peer_id {
                    continue;
                }
                voters.push((peer.id, self.proxy_factory.new_proxy(peer)?));
            }

            let this = Arc::clone(self);
            let election = LeaderElection::new(
                new_term,
                self.local_peer_id,
                counter,
                Box::new(move |result| {
                    tokio::spawn(async move {
                        this.do_election_callback(result);
                    });
                }),
            );
            (vote_request, election, voters)
        };

        self.snooze_failure_detector(None);
        election.run(&vote_request, voters, self.options.consensus_rpc_timeout);
        Ok(())
    }

    fn do_election_callback(self: &Arc<Self>, result: ElectionResult) {
        if result.highest_responder_term > result.election_term {
            if let Err(e) = self.handle_term_advance(result.highest_responder_term) {
                debug!(tablet = %self.tablet_id, error = %e, "term advance after election");
            }
        }
        match result.decision {
            ElectionDecision::Lost => {
                info!(
                    tablet = %self.tablet_id,
                    peer = %self.local_peer_id,
                    term = result.election_term.get(),
                    "lost election"
                );
                self.notify_originator_of_loss();
                self.snooze_failure_detector(Some(self.election_backoff()));
            }
            ElectionDecision::Won => {
                let became_leader = {
                    let Ok(mut guard) = self.state.lock_for_config_change() else {
                        return;
                    };
                    if guard.current_term() != result.election_term {
                        info!(
                            tablet = %self.tablet_id,
                            election_term = result.election_term.get(),
                            current_term = guard.current_term().get(),
                            "ignoring stale election win"
                        );
                        return;
                    }
                    guard.update_old_leader_lease(
                        result.old_leader_lease_remaining,
                        Some(result.old_leader_ht_lease_expiration),
                    );
                    self.become_leader_unlocked(&mut guard)
                };
                if became_leader {
                    self.peer_manager
                        .signal_request(RequestTriggerMode::AlwaysSend);
                }
            }
        }
    }

    fn notify_originator_of_loss(&self) {
        let originator = self
            .election_originator
            .lock()
            .expect("originator lock poisoned")
            .take();
        let Some(originator_id) = originator else {
            return;
        };
        let Ok(guard) = self.state.lock_for_read() else {
            return;
        };
        let Some(peer) = guard.active_config().peer(originator_id).cloned() else {
            return;
        };
        drop(guard);
        let Ok(proxy) = self.proxy_factory.new_proxy(&peer) else {
            return;
        };
        let request = LeaderElectionLostRequest {
            election_lost_by_id: self.local_peer_id,
            dest_id: originator_id,
            tablet_id: self.tablet_id,
        };
        tokio::spawn(async move {
            if let Err(e) = proxy.leader_election_lost(request).await {
                debug!(error = %e, "failed to report lost election to originator");
            }
        });
    }

    fn become_leader_unlocked(self: &Arc<Self>, guard: &mut StateGuard<'_>) -> bool {
        let term = guard.current_term();
        info!(
            tablet = %self.tablet_id,
            peer = %self.local_peer_id,
            term = term.get(),
            "becoming leader"
        );
        guard.set_leader(Some(self.local_peer_id));
        self.failure_detector.disable();

        let committed = guard.committed_op_id();
        let config = guard.active_config().clone();
        self.queue.set_leader_mode(committed, term, &config);
        if let Err(e) = self.peer_manager.update_raft_config(&config) {
            warn!(tablet = %self.tablet_id, error = %e, "failed to open peers");
        }

        // The term's first entry: a NO_OP that establishes the commit
        // point for this term.
        let round = ConsensusRound::leader(OpType::NoOp, Bytes::new());
        round.bind_term(term);
        let tablet_id = self.tablet_id;
        round.set_replicated_callback(Box::new(move |result| match result {
            Ok(id) => debug!(tablet = %tablet_id, op_id = %id, "no-op committed"),
            Err(e) => debug!(tablet = %tablet_id, error = %e, "no-op aborted"),
        }));
        if let Err(e) = self.replicate_rounds_unlocked(guard, std::slice::from_ref(&round)) {
            warn!(tablet = %self.tablet_id, error = %e, "failed to append leader no-op");
        }
        true
    }

    fn become_replica_unlocked(self: &Arc<Self>, guard: &mut StateGuard<'_>) {
        info!(
            tablet = %self.tablet_id,
            peer = %self.local_peer_id,
            term = guard.current_term().get(),
            "becoming replica"
        );
        guard.set_leader(None);
        self.queue.set_non_leader_mode();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.peer_manager.close_all().await;
        });
        if self.options.enable_leader_failure_detection {
            self.failure_detector
                .enable(self.election_timeout_with_jitter());
        }
    }

    /// Advances the local term (stepping down if leader). Public entry for
    /// responses carrying a higher term.
    ///
    /// # Errors
    /// `IllegalState` if the term would not increase.
    pub fn handle_term_advance(self: &Arc<Self>, new_term: TermId) -> Result<()> {
        let mut guard = self.state.lock_for_update()?;
        self.handle_term_advance_unlocked(&mut guard, new_term)
    }

    fn handle_term_advance_unlocked(
        self: &Arc<Self>,
        guard: &mut StateGuard<'_>,
        new_term: TermId,
    ) -> Result<()> {
        if new_term <= guard.current_term() {
            return Err(Error::illegal_state(format!(
                "term {new_term} is not ahead of {}",
                guard.current_term()
            )));
        }
        if guard.active_role() == Role::Leader {
            self.become_replica_unlocked(guard);
        } else {
            guard.set_leader(None);
        }
        guard.set_current_term(new_term)
    }

    fn report_failure_detected(self: &Arc<Self>) {
        let withhold = *self
            .withhold_election_start_until
            .lock()
            .expect("withhold lock poisoned");
        let now = Instant::now();
        if now < withhold {
            self.failure_detector.snooze(withhold - now);
            return;
        }
        info!(
            tablet = %self.tablet_id,
            peer = %self.local_peer_id,
            "leader considered failed; starting election"
        );
        self.snooze_failure_detector(Some(self.election_backoff()));
        if let Err(e) = self.start_election(ElectionMode::NormalElection) {
            debug!(tablet = %self.tablet_id, error = %e, "failure-triggered election not started");
        }
    }

    /// `RunLeaderElection` entry point: start an election right away,
    /// remembering the originator for loss reporting.
    ///
    /// # Errors
    /// See [`start_election`](Self::start_election).
    pub fn run_leader_election(self: &Arc<Self>, request: &RunLeaderElectionRequest) -> Result<()> {
        *self
            .election_originator
            .lock()
            .expect("originator lock poisoned") = Some(request.originator_id);
        self.start_election(ElectionMode::ElectLeaderNow)
    }

    /// `LeaderElectionLost` entry point: a protégé reports its loss.
    pub fn leader_election_lost(&self, request: &LeaderElectionLostRequest) {
        info!(
            tablet = %self.tablet_id,
            protege = %request.election_lost_by_id,
            "protege lost its election"
        );
        *self
            .election_lost_by_protege_at
            .lock()
            .expect("protege lock poisoned") = Some((request.election_lost_by_id, Instant::now()));
    }

    // ---------------------------------------------------------------------
    // Config changes and stepdown

    /// Submits a single-server config change.
    ///
    /// # Errors
    /// `IllegalState`/`ServiceUnavailable` when the leader is not ready
    /// (uncommitted term, pending config, transition in progress, CAS
    /// mismatch), `InvalidArgument` on malformed requests.
    pub fn change_config(
        self: &Arc<Self>,
        request: ChangeConfigRequest,
        done: Option<ReplicatedCallback>,
    ) -> Result<()> {
        {
            let mut guard = self.state.lock_for_config_change()?;
            if guard.active_role() != Role::Leader {
                return Err(Error::illegal_state("config changes go through the leader"));
            }
            if !guard.are_committed_and_current_terms_same() {
                return Err(Error::service_unavailable(
                    "leader has not committed an entry in its term yet",
                ));
            }
            if guard.has_pending_config() {
                return Err(Error::service_unavailable(
                    "a config change is already pending",
                ));
            }
            let committed_config = guard.committed_config().clone();
            if let Some(cas_index) = request.cas_config_opid_index {
                if committed_config.opid_index != Some(cas_index) {
                    return Err(Error::illegal_state(format!(
                        "config CAS failed: committed config is at {:?}, requested {cas_index}",
                        committed_config.opid_index
                    )));
                }
            }
            let except = matches!(
                request.change_type,
                ChangeConfigType::RemoveServer | ChangeConfigType::ChangeRole
            )
            .then_some(request.server.id);
            if committed_config.has_transitioning_peer_except(except) {
                return Err(Error::service_unavailable(
                    "another peer is still being bootstrapped",
                ));
            }

            let new_config = self.build_new_config(&committed_config, &request)?;
            let payload = encode_config_change(&committed_config, &new_config);
            let round = ConsensusRound::leader(OpType::ChangeConfig, payload);
            round.bind_term(guard.current_term());
            if let Some(done) = done {
                round.set_replicated_callback(done);
            }

            guard.set_pending_config(new_config)?;
            if let Err(e) = self.replicate_rounds_unlocked(&mut guard, std::slice::from_ref(&round))
            {
                guard.clear_pending_config();
                return Err(e);
            }

            let active = guard.active_config().clone();
            self.queue.update_active_config(&active);
            if let Err(e) = self.peer_manager.update_raft_config(&active) {
                warn!(tablet = %self.tablet_id, error = %e, "failed to refresh peers for pending config");
            }
        }
        self.peer_manager
            .signal_request(RequestTriggerMode::AlwaysSend);
        Ok(())
    }

    fn build_new_config(
        &self,
        committed: &RaftConfig,
        request: &ChangeConfigRequest,
    ) -> Result<RaftConfig> {
        let mut new_config = committed.clone();
        new_config.opid_index = None;
        let server = &request.server;
        match request.change_type {
            ChangeConfigType::AddServer => {
                if !server.member_type.is_transition() {
                    return Err(Error::invalid_argument(
                        "new servers must join as PRE_VOTER or PRE_OBSERVER",
                    ));
                }
                if server.addr.is_empty() {
                    return Err(Error::invalid_argument("new server needs an address"));
                }
                if committed.contains(server.id) {
                    return Err(Error::invalid_argument(format!(
                        "{} is already in the config",
                        server.id
                    )));
                }
                new_config.peers.push(server.clone());
            }
            ChangeConfigType::RemoveServer => {
                if server.id == self.local_peer_id {
                    return Err(Error::invalid_argument(
                        "the leader cannot remove itself",
                    ));
                }
                if !committed.contains(server.id) {
                    return Err(Error::not_found(format!(
                        "{} is not in the config",
                        server.id
                    )));
                }
                new_config.peers.retain(|p| p.id != server.id);
            }
            ChangeConfigType::ChangeRole => {
                if server.id == self.local_peer_id {
                    return Err(Error::invalid_argument("cannot change own role"));
                }
                let current = committed
                    .peer(server.id)
                    .ok_or_else(|| {
                        Error::not_found(format!("{} is not in the config", server.id))
                    })?
                    .member_type;
                let valid = matches!(
                    (current, server.member_type),
                    (MemberType::PreVoter, MemberType::Voter)
                        | (MemberType::PreObserver, MemberType::Observer)
                );
                if !valid {
                    return Err(Error::invalid_argument(format!(
                        "role change {current:?} -> {:?} is not allowed",
                        server.member_type
                    )));
                }
                for peer in &mut new_config.peers {
                    if peer.id == server.id {
                        peer.member_type = server.member_type;
                    }
                }
            }
        }
        Ok(new_config)
    }

    fn promote_bootstrapped_peer(self: &Arc<Self>, peer_id: PeerId) {
        let target = {
            let Ok(guard) = self.state.lock_for_read() else {
                return;
            };
            match guard.committed_config().peer(peer_id) {
                Some(peer) if peer.member_type == MemberType::PreVoter => {
                    RaftPeer::new(peer_id, peer.addr.clone(), MemberType::Voter)
                }
                Some(peer) if peer.member_type == MemberType::PreObserver => {
                    RaftPeer::new(peer_id, peer.addr.clone(), MemberType::Observer)
                }
                _ => return,
            }
        };
        let request = ChangeConfigRequest {
            change_type: ChangeConfigType::ChangeRole,
            server: target,
            cas_config_opid_index: None,
        };
        if let Err(e) = self.change_config(request, None) {
            debug!(
                tablet = %self.tablet_id,
                peer = %peer_id,
                error = %e,
                "deferred role promotion"
            );
        }
    }

    /// Steps down, optionally transferring leadership to `new_leader`.
    ///
    /// # Errors
    /// `IllegalState` if not leader or the nominee is not ready,
    /// `ServiceUnavailable` while the nominee's recent loss cools off.
    pub fn step_down(self: &Arc<Self>, new_leader: Option<PeerId>) -> Result<()> {
        let mut guard = self.state.lock_for_config_change()?;
        if guard.active_role() != Role::Leader {
            return Err(Error::illegal_state("only a leader can step down"));
        }

        if let Some(nominee_id) = new_leader {
            if nominee_id == self.local_peer_id {
                return Err(Error::invalid_argument("cannot transfer to self"));
            }
            let nominee = guard
                .active_config()
                .peer(nominee_id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("{nominee_id} is not in the config")))?;
            if nominee.member_type != MemberType::Voter {
                return Err(Error::invalid_argument("nominee must be a voter"));
            }
            if !self.queue.peer_caught_up(nominee_id) {
                return Err(Error::illegal_state(
                    "leader is not ready to step down: nominee has not caught up",
                ));
            }
            let recent_loss = self
                .election_lost_by_protege_at
                .lock()
                .expect("protege lock poisoned")
                .map_or(false, |(id, at)| {
                    id == nominee_id
                        && at.elapsed() < self.options.min_leader_stepdown_retry_interval
                });
            if recent_loss {
                return Err(Error::service_unavailable(
                    "nominee recently lost an election; retry later",
                ));
            }

            let request = RunLeaderElectionRequest {
                originator_id: self.local_peer_id,
                dest_id: nominee_id,
                tablet_id: self.tablet_id,
                committed_op_id: guard.committed_op_id(),
            };
            let proxy = self.proxy_factory.new_proxy(&nominee)?;
            tokio::spawn(async move {
                if let Err(e) = proxy.run_leader_election(request).await {
                    warn!(error = %e, "failed to ask nominee to run an election");
                }
            });
        }

        *self
            .withhold_election_start_until
            .lock()
            .expect("withhold lock poisoned") = Instant::now()
            + self.options.election_timeout()
                * self.options.after_stepdown_delay_election_multiplier;
        self.become_replica_unlocked(&mut guard);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Queue observer

    async fn run_observer(
        weak: std::sync::Weak<Self>,
        mut events: mpsc::UnboundedReceiver<QueueEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(consensus) = weak.upgrade() else {
                return;
            };
            match event {
                QueueEvent::MajorityReplicated(data) => {
                    consensus.update_majority_replicated(&data);
                }
                QueueEvent::TermAdvanced(term) => {
                    if let Err(e) = consensus.handle_term_advance(term) {
                        debug!(error = %e, "observed term not ahead; ignoring");
                    }
                }
                QueueEvent::FailedFollower { peer, reason } => {
                    consensus.maybe_evict_failed_follower(peer, &reason);
                }
            }
        }
    }

    /// Advances the committed index from a majority-replicated watermark
    /// of the current term.
    fn update_majority_replicated(self: &Arc<Self>, data: &MajorityReplicatedData) {
        let (applied_config, fire_pending_election) = {
            let mut guard = match self.state.lock_for_majority_replicated_index_update() {
                Ok(guard) => guard,
                Err(e) => {
                    debug!(tablet = %self.tablet_id, error = %e, "dropping watermark update");
                    return;
                }
            };
            if data.op_id.term != guard.current_term() {
                return;
            }
            let advance = match guard.advance_committed_index(data.op_id.index) {
                Ok(advance) => advance,
                Err(e) => {
                    warn!(tablet = %self.tablet_id, error = %e, "failed to advance committed index");
                    return;
                }
            };
            guard.set_majority_replicated_lease_expiration(data);
            self.queue
                .update_committed_index(guard.committed_op_id().index);

            let fire = guard
                .pending_election_op_id()
                .is_some_and(|op| op.index <= guard.committed_op_id().index);
            if fire {
                guard.set_pending_election_op_id(None);
            }
            (advance.applied_config, fire)
        };
        self.state.notify_lease_observers();
        if let Some(config) = applied_config {
            self.on_config_committed(&config);
        }
        if fire_pending_election {
            let _ = self.start_election(ElectionMode::ElectLeaderNow);
        }
    }

    fn on_config_committed(self: &Arc<Self>, config: &RaftConfig) {
        if !config.contains(self.local_peer_id) {
            info!(
                tablet = %self.tablet_id,
                peer = %self.local_peer_id,
                "removed from config; stepping aside"
            );
            if let Ok(mut guard) = self.state.lock_for_update() {
                self.become_replica_unlocked(&mut guard);
            }
            return;
        }
        self.queue.update_active_config(config);
        if let Err(e) = self.peer_manager.update_raft_config(config) {
            warn!(tablet = %self.tablet_id, error = %e, "failed to refresh peers for committed config");
        }
    }

    fn maybe_evict_failed_follower(self: &Arc<Self>, peer_id: PeerId, reason: &str) {
        if !self.options.evict_failed_followers {
            return;
        }
        if peer_id == self.local_peer_id {
            return;
        }
        {
            let Ok(guard) = self.state.lock_for_read() else {
                return;
            };
            if guard.active_role() != Role::Leader
                || guard.has_pending_config()
                || !guard.committed_config().contains(peer_id)
            {
                return;
            }
        }
        info!(
            tablet = %self.tablet_id,
            peer = %peer_id,
            reason,
            "evicting failed follower"
        );
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let request = ChangeConfigRequest {
                change_type: ChangeConfigType::RemoveServer,
                server: RaftPeer::new(peer_id, "", MemberType::NonParticipant),
                cas_config_opid_index: None,
            };
            if let Err(e) = this.change_config(request, None) {
                warn!(tablet = %this.tablet_id, peer = %peer_id, error = %e, "eviction failed");
            }
        });
    }

    // ---------------------------------------------------------------------
    // Shutdown and helpers

    /// Shuts the replica down: aborts pending rounds, closes peers, stops
    /// background tasks.
    pub async fn shutdown(&self) {
        if let Ok(mut guard) = self.state.lock_for_shutdown() {
            guard.shutdown();
        }
        self.queue.set_non_leader_mode();
        self.peer_manager.close_all().await;
        if let Some(monitor) = self.monitor.lock().expect("monitor lock poisoned").take() {
            monitor.shutdown();
        }
        if let Some(task) = self
            .observer_task
            .lock()
            .expect("observer lock poisoned")
            .take()
        {
            task.abort();
        }
        self.failure_detector.disable();
        info!(tablet = %self.tablet_id, peer = %self.local_peer_id, "consensus shut down");
    }

    fn snooze_failure_detector(&self, additional: Option<Duration>) {
        let delta = self.options.election_timeout() + additional.unwrap_or(Duration::ZERO);
        self.failure_detector.snooze(delta);
    }

    fn election_timeout_with_jitter(&self) -> Duration {
        let timeout = self.options.election_timeout();
        let jitter_ms = rand::thread_rng().gen_range(0..=timeout.as_millis().max(1) as u64 / 2);
        timeout + Duration::from_millis(jitter_ms)
    }

    /// Randomized exponential back-off scaled by how many terms have
    /// passed without a commit (a proxy for consecutive failed
    /// elections).
    fn election_backoff(&self) -> Duration {
        let (_, current_term) = self.state.role_and_term();
        let committed_term = self.committed_op_id().term;
        let failed_rounds = current_term.get().saturating_sub(committed_term.get()).min(10);
        let base = Duration::from_millis(100) * 2u32.pow(failed_rounds as u32);
        let capped = base.min(self.options.leader_failure_exp_backoff_max_delta);
        capped.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }
}

impl std::fmt::Debug for RaftConsensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (role, term) = self.state.role_and_term();
        f.debug_struct("RaftConsensus")
            .field("tablet", &self.tablet_id)
            .field("peer", &self.local_peer_id)
            .field("role", &role)
            .field("term", &term)
            .finish()
    }
}
