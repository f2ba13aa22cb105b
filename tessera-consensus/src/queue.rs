//! The leader's shared view of follower progress.
//!
//! In leader mode the queue tracks a cursor per peer, assembles the next
//! `UpdateConsensus` payload for each, and advances the
//! majority-replicated watermark as acks arrive. Consensus is never
//! re-entered while the queue lock is held: watermark advances and
//! failed-follower verdicts are published on an event channel drained by a
//! serial observer task.
//!
//! Invariants: the majority-replicated op id is monotone non-decreasing
//! within a leader term, and the committed index only ever advances via a
//! majority-replicated op id whose term equals the leader's current term.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tessera_core::{Error, HybridClock, HybridTime, LogIndex, OpId, PeerId, Result, TabletId, TermId};
use tessera_log::{DurableCallback, LogStore};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ConsensusOptions;
use crate::metadata::{MemberType, RaftConfig};
use crate::rpc::{
    ConsensusErrorCode, ConsensusRequest, ConsensusResponse, StartRemoteBootstrapRequest,
};

/// Watermark data delivered to consensus when the majority advances.
#[derive(Debug, Clone)]
pub struct MajorityReplicatedData {
    /// The new majority-replicated op id.
    pub op_id: OpId,
    /// Wall-clock leader-lease deadline acknowledged by a majority.
    pub leader_lease_expiration: Option<Instant>,
    /// Hybrid-time lease deadline acknowledged by a majority.
    pub ht_lease_expiration: HybridTime,
}

/// Events the queue publishes to the consensus observer task.
#[derive(Debug)]
pub enum QueueEvent {
    /// The majority-replicated watermark advanced in the current term.
    MajorityReplicated(MajorityReplicatedData),
    /// A response carried a higher term than ours.
    TermAdvanced(TermId),
    /// A follower is considered failed and should be evicted.
    FailedFollower {
        /// The failed peer.
        peer: PeerId,
        /// Why it is considered failed.
        reason: String,
    },
}

/// Read-only view of one tracked peer, for tests and introspection.
#[derive(Debug, Clone)]
pub struct TrackedPeerInfo {
    /// The peer's id.
    pub id: PeerId,
    /// Its membership role.
    pub member_type: MemberType,
    /// Last op id the peer acknowledged.
    pub last_received: OpId,
    /// Next index the queue will send it.
    pub next_index: LogIndex,
    /// Last committed index the peer reported.
    pub last_known_committed_index: LogIndex,
    /// Whether the last exchange succeeded.
    pub last_exchange_successful: bool,
    /// Whether the peer needs remote bootstrap.
    pub needs_remote_bootstrap: bool,
}

/// Everything a [`Peer`](crate::peer::Peer) needs to send one request.
#[derive(Debug)]
pub struct PeerRequestData {
    /// The assembled request (ops may be empty: heartbeat).
    pub request: ConsensusRequest,
    /// Set when normal catch-up is impossible; send this instead.
    pub remote_bootstrap: Option<StartRemoteBootstrapRequest>,
    /// The peer's membership role.
    pub member_type: MemberType,
    /// Whether the previous exchange with this peer succeeded.
    pub last_exchange_successful: bool,
    /// True when the peer's log has caught up to the leader's.
    pub peer_caught_up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    NonLeader,
    Leader,
}

struct TrackedPeer {
    id: PeerId,
    member_type: MemberType,
    /// No successful exchange yet: send a status-only negotiation round.
    is_new: bool,
    last_received: OpId,
    next_index: LogIndex,
    last_known_committed_index: LogIndex,
    last_responsive: Instant,
    last_exchange_successful: bool,
    needs_remote_bootstrap: bool,
    failure_reported: bool,
    /// Lease deadlines proposed by the in-flight request.
    inflight_lease_grant: Option<(Instant, HybridTime)>,
    /// Lease deadlines the peer has acknowledged.
    leader_lease_expiration: Option<Instant>,
    ht_lease_expiration: HybridTime,
}

impl TrackedPeer {
    fn new(id: PeerId, member_type: MemberType, next_index: LogIndex) -> Self {
        Self {
            id,
            member_type,
            is_new: true,
            last_received: OpId::MIN,
            next_index,
            last_known_committed_index: LogIndex::new(0),
            last_responsive: Instant::now(),
            last_exchange_successful: false,
            needs_remote_bootstrap: false,
            failure_reported: false,
            inflight_lease_grant: None,
            leader_lease_expiration: None,
            ht_lease_expiration: HybridTime::MIN,
        }
    }
}

struct QueueInner {
    mode: Mode,
    term: TermId,
    committed_index: LogIndex,
    majority_replicated: OpId,
    active_config: Option<RaftConfig>,
    peers: HashMap<PeerId, TrackedPeer>,
    /// The leader's own appended cursor (everything enqueued to the log).
    local_last_enqueued: OpId,
    /// The leader's own durable cursor.
    local_last_durable: OpId,
}

/// The per-tablet message queue shared by all peer senders.
pub struct PeerMessageQueue {
    tablet_id: TabletId,
    local_peer_id: PeerId,
    options: Arc<ConsensusOptions>,
    log: Arc<LogStore>,
    clock: Arc<HybridClock>,
    inner: Mutex<QueueInner>,
    events: mpsc::UnboundedSender<QueueEvent>,
}

impl PeerMessageQueue {
    /// Creates a queue in non-leader mode.
    #[must_use]
    pub fn new(
        tablet_id: TabletId,
        local_peer_id: PeerId,
        options: Arc<ConsensusOptions>,
        log: Arc<LogStore>,
        clock: Arc<HybridClock>,
        events: mpsc::UnboundedSender<QueueEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tablet_id,
            local_peer_id,
            options,
            log,
            clock,
            inner: Mutex::new(QueueInner {
                mode: Mode::NonLeader,
                term: TermId::new(0),
                committed_index: LogIndex::new(0),
                majority_replicated: OpId::MIN,
                active_config: None,
                peers: HashMap::new(),
                local_last_enqueued: OpId::MIN,
                local_last_durable: OpId::MIN,
            }),
            events,
        })
    }

    /// Primes the local cursors from the last op in the local log.
    pub fn init(&self, last_local_op: OpId) {
        let mut inner = self.lock();
        inner.local_last_enqueued = last_local_op;
        inner.local_last_durable = last_local_op;
    }

    /// Switches to leader mode for `term` over `active_config`.
    pub fn set_leader_mode(&self, committed: OpId, term: TermId, active_config: &RaftConfig) {
        let mut inner = self.lock();
        if inner.mode != Mode::Leader || inner.term != term {
            info!(
                tablet = %self.tablet_id,
                term = term.get(),
                "queue entering leader mode"
            );
            inner.majority_replicated = committed;
        }
        inner.mode = Mode::Leader;
        inner.term = term;
        inner.committed_index = committed.index;
        self.refresh_config_locked(&mut inner, active_config);
    }

    /// Updates the tracked config without changing mode or term (e.g. a
    /// pending config was installed).
    pub fn update_active_config(&self, active_config: &RaftConfig) {
        let mut inner = self.lock();
        if inner.mode == Mode::Leader {
            self.refresh_config_locked(&mut inner, active_config);
        }
    }

    fn refresh_config_locked(&self, inner: &mut QueueInner, active_config: &RaftConfig) {
        let next_index = LogIndex::new(inner.local_last_enqueued.index.get() + 1);
        inner
            .peers
            .retain(|id, _| active_config.contains(*id) || *id == self.local_peer_id);
        for peer in &active_config.peers {
            let entry = inner
                .peers
                .entry(peer.id)
                .or_insert_with(|| TrackedPeer::new(peer.id, peer.member_type, next_index));
            entry.member_type = peer.member_type;
        }
        // The leader tracks itself; its cursor advances on local
        // durability.
        let local_last = inner.local_last_durable;
        let local = inner
            .peers
            .entry(self.local_peer_id)
            .or_insert_with(|| TrackedPeer::new(self.local_peer_id, MemberType::Voter, next_index));
        local.is_new = false;
        local.last_received = local_last;
        local.last_exchange_successful = true;
        inner.active_config = Some(active_config.clone());
    }

    /// Switches to passive (non-leader) mode; peers are forgotten.
    pub fn set_non_leader_mode(&self) {
        let mut inner = self.lock();
        if inner.mode != Mode::NonLeader {
            info!(tablet = %self.tablet_id, "queue entering non-leader mode");
        }
        inner.mode = Mode::NonLeader;
        inner.active_config = None;
        inner.peers.clear();
    }

    /// Starts tracking a peer (idempotent).
    pub fn track_peer(&self, id: PeerId, member_type: MemberType) {
        let mut inner = self.lock();
        let next_index = LogIndex::new(inner.local_last_enqueued.index.get() + 1);
        inner
            .peers
            .entry(id)
            .or_insert_with(|| TrackedPeer::new(id, member_type, next_index));
    }

    /// Stops tracking a peer.
    pub fn untrack_peer(&self, id: PeerId) {
        self.lock().peers.remove(&id);
    }

    /// Appends operations to the local log and advances the local cursor.
    /// `on_durable` runs from the log's completion path after the queue
    /// has observed local durability.
    ///
    /// May be called while the replica-state lock is held; never calls
    /// back into consensus synchronously.
    ///
    /// # Errors
    /// `ServiceUnavailable` when the log's append queue is full.
    pub fn append_operations(
        self: &Arc<Self>,
        msgs: Vec<tessera_core::ReplicateMsgRef>,
        on_durable: DurableCallback,
    ) -> Result<()> {
        let Some(last) = msgs.last().map(|m| m.id) else {
            return Ok(());
        };
        let mut inner = self.lock();
        let this = Arc::downgrade(self);
        let wrapped: DurableCallback = Box::new(move |result| {
            if result.is_ok() {
                if let Some(queue) = this.upgrade() {
                    queue.local_peer_appended(last);
                }
            }
            on_durable(result);
        });
        self.log
            .append_replicates(msgs, wrapped)
            .map_err(tessera_core::Error::from)?;
        inner.local_last_enqueued = last;
        Ok(())
    }

    /// Called from the log's completion path when the local append
    /// becomes durable.
    fn local_peer_appended(&self, last: OpId) {
        let data = {
            let mut inner = self.lock();
            inner.local_last_durable = inner.local_last_durable.max(last);
            let local_last = inner.local_last_durable;
            let local_id = self.local_peer_id;
            if let Some(local) = inner.peers.get_mut(&local_id) {
                local.last_received = local.last_received.max(last);
                local.next_index = LogIndex::new(local_last.index.get() + 1);
            }
            self.recompute_watermarks_locked(&mut inner)
        };
        self.publish_majority(data);
    }

    /// Builds the next request for `peer_id`.
    ///
    /// # Errors
    /// `IllegalState` in non-leader mode, `NotFound` for untracked peers.
    pub fn request_for_peer(&self, peer_id: PeerId) -> Result<PeerRequestData> {
        let mut inner = self.lock();
        if inner.mode != Mode::Leader {
            return Err(Error::illegal_state("queue is not in leader mode"));
        }
        let term = inner.term;
        let committed_index = inner.committed_index;
        let local_last = inner.local_last_enqueued;
        let leader_addr = inner
            .active_config
            .as_ref()
            .and_then(|c| c.peer(self.local_peer_id))
            .map(|p| p.addr.clone())
            .unwrap_or_default();

        let unresponsive_for = self.options.follower_unavailable_considered_failed;
        let peer = inner
            .peers
            .get_mut(&peer_id)
            .ok_or_else(|| Error::not_found(format!("peer {peer_id} is not tracked")))?;

        // Liveness policy: report (once) a follower that has been silent
        // past the configured threshold.
        let silent_for = peer.last_responsive.elapsed();
        if silent_for > unresponsive_for && !peer.failure_reported {
            peer.failure_reported = true;
            let _ = self.events.send(QueueEvent::FailedFollower {
                peer: peer_id,
                reason: format!("unresponsive for {silent_for:?}"),
            });
        }

        // Can the peer catch up from our log at all? Entries it needs may
        // have been garbage-collected, or the entry proving the
        // log-matching precondition may be gone.
        let earliest = self.log.reader().first_retained_index();
        let preceding_index = peer.next_index.prev();
        let preceding_known = preceding_index.get() == 0
            || preceding_index == local_last.index
            || peer.last_received.index == preceding_index
            || earliest.map_or(false, |first| preceding_index >= first);
        let needs_bootstrap = match earliest {
            Some(first) => peer.next_index < first || !preceding_known,
            None => false,
        };
        if needs_bootstrap {
            peer.needs_remote_bootstrap = true;
            let bootstrap = StartRemoteBootstrapRequest {
                dest_id: peer_id,
                tablet_id: self.tablet_id,
                bootstrap_source_peer_id: self.local_peer_id,
                bootstrap_source_addr: leader_addr,
                caller_term: term,
            };
            return Ok(PeerRequestData {
                request: self.heartbeat_request(peer_id, term, OpId::MIN, committed_index),
                remote_bootstrap: Some(bootstrap),
                member_type: peer.member_type,
                last_exchange_successful: peer.last_exchange_successful,
                peer_caught_up: false,
            });
        }
        peer.needs_remote_bootstrap = false;

        let preceding_id = if preceding_index.get() == 0 {
            OpId::MIN
        } else if preceding_index == local_last.index {
            local_last
        } else if let Ok(op_id) = self.log.reader().lookup_op_id(preceding_index) {
            op_id
        } else {
            // The peer acked this entry previously; its report is as good
            // as our (garbage-collected) copy.
            peer.last_received
        };

        // New peers get a status-only round first so we learn their log
        // position before shipping entries.
        let ops = if peer.is_new || peer.next_index > local_last.index {
            Vec::new()
        } else {
            self.log
                .reader()
                .read_replicates_in_range(
                    peer.next_index,
                    local_last.index,
                    self.options.max_batch_size_bytes,
                )
                .map_err(tessera_core::Error::from)?
        };

        let now = Instant::now();
        let ht_lease_expiration = HybridTime::from_micros(
            self.clock.now().physical_micros()
                + self.options.ht_lease_duration.as_micros() as u64,
        );
        peer.inflight_lease_grant = Some((
            now + self.options.leader_lease_duration,
            ht_lease_expiration,
        ));

        let request = ConsensusRequest {
            caller_id: self.local_peer_id,
            caller_term: term,
            tablet_id: self.tablet_id,
            dest_id: peer_id,
            preceding_id,
            ops,
            committed_index,
            propagated_hybrid_time: Some(self.clock.now()),
            propagated_safe_time: None,
            leader_lease_duration_ms: Some(self.options.leader_lease_duration.as_millis() as u64),
            ht_lease_expiration: Some(ht_lease_expiration),
        };

        Ok(PeerRequestData {
            request,
            remote_bootstrap: None,
            member_type: peer.member_type,
            last_exchange_successful: peer.last_exchange_successful,
            peer_caught_up: !peer.is_new && peer.last_received >= local_last,
        })
    }

    fn heartbeat_request(
        &self,
        dest_id: PeerId,
        term: TermId,
        preceding_id: OpId,
        committed_index: LogIndex,
    ) -> ConsensusRequest {
        ConsensusRequest {
            caller_id: self.local_peer_id,
            caller_term: term,
            tablet_id: self.tablet_id,
            dest_id,
            preceding_id,
            ops: Vec::new(),
            committed_index,
            propagated_hybrid_time: Some(self.clock.now()),
            propagated_safe_time: None,
            leader_lease_duration_ms: None,
            ht_lease_expiration: None,
        }
    }

    /// Applies a peer's response. Returns true if the peer is still
    /// behind (more to send immediately).
    pub fn response_from_peer(&self, peer_id: PeerId, response: &ConsensusResponse) -> bool {
        let (majority, more_pending) = {
            let mut inner = self.lock();
            if inner.mode != Mode::Leader {
                return false;
            }
            let term = inner.term;
            let local_last = inner.local_last_enqueued;
            let Some(peer) = inner.peers.get_mut(&peer_id) else {
                return false;
            };
            peer.last_responsive = Instant::now();
            peer.failure_reported = false;

            if response.responder_term > term {
                peer.last_exchange_successful = false;
                peer.inflight_lease_grant = None;
                let _ = self
                    .events
                    .send(QueueEvent::TermAdvanced(response.responder_term));
                return false;
            }

            let status = &response.status;
            match status.error.as_ref().map(|e| e.code) {
                Some(ConsensusErrorCode::PrecedingEntryDidntMatch) => {
                    peer.last_exchange_successful = false;
                    peer.inflight_lease_grant = None;
                    peer.is_new = false;
                    // Log-matching back-off: jump to the peer's last op
                    // from us when known, else decrement (bounded by 1).
                    if !status.last_received_current_leader.is_min() {
                        peer.next_index =
                            LogIndex::new(status.last_received_current_leader.index.get() + 1);
                    } else {
                        peer.next_index = LogIndex::new(peer.next_index.get().saturating_sub(1).max(1));
                    }
                    debug!(
                        tablet = %self.tablet_id,
                        peer = %peer_id,
                        next_index = peer.next_index.get(),
                        "log-matching mismatch; backing off peer cursor"
                    );
                    (None, true)
                }
                Some(code) => {
                    peer.last_exchange_successful = false;
                    peer.inflight_lease_grant = None;
                    debug!(tablet = %self.tablet_id, peer = %peer_id, ?code, "peer returned status error");
                    (None, false)
                }
                None => {
                    peer.is_new = false;
                    peer.last_exchange_successful = true;
                    peer.last_received = status.last_received;
                    peer.last_known_committed_index = status.last_committed_index;
                    // Never point past our own log: a peer ahead of us
                    // (stale leader's orphans) gets truncated by the next
                    // exchange.
                    peer.next_index = LogIndex::new(
                        status
                            .last_received
                            .index
                            .min(local_last.index)
                            .get()
                            + 1,
                    );
                    if let Some((wall, ht)) = peer.inflight_lease_grant.take() {
                        peer.leader_lease_expiration = Some(
                            peer.leader_lease_expiration
                                .map_or(wall, |current| current.max(wall)),
                        );
                        if ht > peer.ht_lease_expiration {
                            peer.ht_lease_expiration = ht;
                        }
                    }
                    let more = peer.last_received < local_last;
                    let majority = self.recompute_watermarks_locked(&mut inner);
                    (majority, more)
                }
            }
        };
        self.publish_majority(majority);
        more_pending
    }

    /// Resets a peer's liveness even though the response carried an
    /// application-level error.
    pub fn notify_peer_is_responsive_despite_error(&self, peer_id: PeerId) {
        let mut inner = self.lock();
        if let Some(peer) = inner.peers.get_mut(&peer_id) {
            peer.last_responsive = Instant::now();
            peer.failure_reported = false;
        }
    }

    /// Reports a follower as failed (e.g. `WRONG_SERVER_UUID`), triggering
    /// the eviction path.
    pub fn notify_observers_of_failed_follower(&self, peer_id: PeerId, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(tablet = %self.tablet_id, peer = %peer_id, reason = %reason, "follower considered failed");
        let _ = self.events.send(QueueEvent::FailedFollower {
            peer: peer_id,
            reason,
        });
    }

    /// Informs the queue that commits advanced (so follower requests carry
    /// the new committed index).
    pub fn update_committed_index(&self, committed: LogIndex) {
        let mut inner = self.lock();
        if committed > inner.committed_index {
            inner.committed_index = committed;
        }
    }

    /// The current majority-replicated op id.
    #[must_use]
    pub fn majority_replicated_op_id(&self) -> OpId {
        self.lock().majority_replicated
    }

    /// Read-only view of a tracked peer.
    #[must_use]
    pub fn tracked_peer(&self, peer_id: PeerId) -> Option<TrackedPeerInfo> {
        let inner = self.lock();
        inner.peers.get(&peer_id).map(|p| TrackedPeerInfo {
            id: p.id,
            member_type: p.member_type,
            last_received: p.last_received,
            next_index: p.next_index,
            last_known_committed_index: p.last_known_committed_index,
            last_exchange_successful: p.last_exchange_successful,
            needs_remote_bootstrap: p.needs_remote_bootstrap,
        })
    }

    /// True when the peer's acked log matches the leader's appended log.
    #[must_use]
    pub fn peer_caught_up(&self, peer_id: PeerId) -> bool {
        let inner = self.lock();
        inner
            .peers
            .get(&peer_id)
            .map_or(false, |p| !p.is_new && p.last_received >= inner.local_last_enqueued)
    }

    fn recompute_watermarks_locked(
        &self,
        inner: &mut QueueInner,
    ) -> Option<MajorityReplicatedData> {
        if inner.mode != Mode::Leader {
            return None;
        }
        let config = inner.active_config.as_ref()?;
        let majority = config.majority_size();

        let mut cursors: Vec<OpId> = Vec::with_capacity(config.voter_count());
        let mut wall_leases: Vec<Option<Instant>> = Vec::with_capacity(config.voter_count());
        let mut ht_leases: Vec<HybridTime> = Vec::with_capacity(config.voter_count());
        for voter in config.voters() {
            if voter.id == self.local_peer_id {
                cursors.push(inner.local_last_durable);
                // The leader's own lease is always fresh.
                wall_leases.push(Some(Instant::now() + self.options.leader_lease_duration));
                ht_leases.push(HybridTime::from_micros(
                    self.clock.now().physical_micros()
                        + self.options.ht_lease_duration.as_micros() as u64,
                ));
                continue;
            }
            match inner.peers.get(&voter.id) {
                Some(peer) => {
                    cursors.push(peer.last_received);
                    wall_leases.push(peer.leader_lease_expiration);
                    ht_leases.push(peer.ht_lease_expiration);
                }
                None => {
                    cursors.push(OpId::MIN);
                    wall_leases.push(None);
                    ht_leases.push(HybridTime::MIN);
                }
            }
        }
        if cursors.len() < majority {
            return None;
        }

        cursors.sort_unstable_by(|a, b| b.cmp(a));
        let watermark = cursors[majority - 1];
        if watermark <= inner.majority_replicated {
            return None;
        }
        inner.majority_replicated = watermark;

        // The commit rule: only ops from the current term advance the
        // committed index.
        if watermark.term != inner.term {
            return None;
        }

        wall_leases.sort_unstable_by(|a, b| b.cmp(a));
        ht_leases.sort_unstable_by(|a, b| b.cmp(a));
        let leader_lease_expiration = wall_leases[majority - 1];
        let ht_lease_expiration = ht_leases[majority - 1];

        Some(MajorityReplicatedData {
            op_id: watermark,
            leader_lease_expiration,
            ht_lease_expiration,
        })
    }

    fn publish_majority(&self, data: Option<MajorityReplicatedData>) {
        if let Some(data) = data {
            debug!(
                tablet = %self.tablet_id,
                op_id = %data.op_id,
                "majority-replicated watermark advanced"
            );
            let _ = self.events.send(QueueEvent::MajorityReplicated(data));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("queue lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tessera_core::{OpType, ReplicateMsg, ReplicateMsgRef};

    use crate::metadata::RaftPeer;
    use crate::rpc::ConsensusStatus;

    use super::*;

    fn msg(term: u64, index: u64) -> ReplicateMsgRef {
        ReplicateMsgRef::new(ReplicateMsg::new(
            OpId::new(TermId::new(term), LogIndex::new(index)),
            OpType::Write,
            HybridTime::from_micros(index),
            OpId::MIN,
            Bytes::from_static(b"x"),
        ))
    }

    fn three_voters() -> RaftConfig {
        RaftConfig {
            opid_index: Some(LogIndex::new(1)),
            peers: vec![
                RaftPeer::voter(PeerId::new(1), "a:1"),
                RaftPeer::voter(PeerId::new(2), "b:1"),
                RaftPeer::voter(PeerId::new(3), "c:1"),
            ],
        }
    }

    struct Harness {
        queue: Arc<PeerMessageQueue>,
        log: Arc<LogStore>,
        events: mpsc::UnboundedReceiver<QueueEvent>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let log = LogStore::open(
            TabletId::new(1),
            tessera_log::LogOptions::new(dir.path()),
        )
        .await
        .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = PeerMessageQueue::new(
            TabletId::new(1),
            PeerId::new(1),
            Arc::new(ConsensusOptions::new()),
            Arc::clone(&log),
            Arc::new(HybridClock::new()),
            tx,
        );
        queue.init(OpId::MIN);
        Harness {
            queue,
            log,
            events: rx,
            _dir: dir,
        }
    }

    impl Harness {
        async fn close(self) {
            self.log.close().await;
        }
    }

    async fn append_and_wait(h: &Harness, msgs: Vec<ReplicateMsgRef>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        h.queue
            .append_operations(
                msgs,
                Box::new(move |r| {
                    let _ = tx.send(r);
                }),
            )
            .unwrap();
        rx.await.unwrap().unwrap();
    }

    fn ok_response(peer: PeerId, term: u64, last: OpId) -> ConsensusResponse {
        ConsensusResponse {
            responder_id: peer,
            responder_term: TermId::new(term),
            status: ConsensusStatus::ok(last, last, last.index),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_request_for_new_peer_is_status_only() {
        let h = harness().await;
        h.queue
            .set_leader_mode(OpId::MIN, TermId::new(1), &three_voters());
        append_and_wait(&h, vec![msg(1, 1), msg(1, 2)]).await;

        let data = h.queue.request_for_peer(PeerId::new(2)).unwrap();
        assert!(data.request.ops.is_empty(), "negotiation round ships no ops");
        assert!(data.remote_bootstrap.is_none());
        h.close().await;
    }

    #[tokio::test]
    async fn test_response_advances_watermark_with_majority() {
        let mut h = harness().await;
        h.queue
            .set_leader_mode(OpId::MIN, TermId::new(1), &three_voters());
        append_and_wait(&h, vec![msg(1, 1), msg(1, 2)]).await;

        // Local durability alone is not a majority of 3.
        assert!(h.events.try_recv().is_err());

        let last = OpId::new(TermId::new(1), LogIndex::new(2));
        let more = h
            .queue
            .response_from_peer(PeerId::new(2), &ok_response(PeerId::new(2), 1, last));
        assert!(!more);

        match h.events.try_recv().unwrap() {
            QueueEvent::MajorityReplicated(data) => {
                assert_eq!(data.op_id, last);
                assert!(data.leader_lease_expiration.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Watermark is monotone: an older ack changes nothing.
        let older = OpId::new(TermId::new(1), LogIndex::new(1));
        h.queue
            .response_from_peer(PeerId::new(3), &ok_response(PeerId::new(3), 1, older));
        assert_eq!(h.queue.majority_replicated_op_id(), last);
        h.close().await;
    }

    #[tokio::test]
    async fn test_no_commit_from_prior_terms() {
        let mut h = harness().await;
        // Entries from term 1, but we lead in term 2.
        h.queue
            .set_leader_mode(OpId::MIN, TermId::new(2), &three_voters());
        append_and_wait(&h, vec![msg(1, 1)]).await;

        let old = OpId::new(TermId::new(1), LogIndex::new(1));
        h.queue
            .response_from_peer(PeerId::new(2), &ok_response(PeerId::new(2), 2, old));

        // Watermark advanced but no commit callback: wrong term.
        assert_eq!(h.queue.majority_replicated_op_id(), old);
        assert!(h.events.try_recv().is_err());
        h.close().await;
    }

    #[tokio::test]
    async fn test_preceding_mismatch_backs_off() {
        let h = harness().await;
        h.queue
            .set_leader_mode(OpId::MIN, TermId::new(1), &three_voters());
        append_and_wait(&h, (1..=5).map(|i| msg(1, i)).collect()).await;

        // Fake a previous successful exchange placing the cursor at 6.
        let last = OpId::new(TermId::new(1), LogIndex::new(5));
        h.queue
            .response_from_peer(PeerId::new(2), &ok_response(PeerId::new(2), 1, last));
        assert_eq!(
            h.queue.tracked_peer(PeerId::new(2)).unwrap().next_index,
            LogIndex::new(6)
        );

        let mismatch = ConsensusResponse {
            responder_id: PeerId::new(2),
            responder_term: TermId::new(1),
            status: ConsensusStatus::ok(last, OpId::MIN, LogIndex::new(0)).with_error(
                ConsensusErrorCode::PrecedingEntryDidntMatch,
                "no entry",
            ),
            error: None,
        };
        let more = h.queue.response_from_peer(PeerId::new(2), &mismatch);
        assert!(more, "peer still behind after a mismatch");
        assert_eq!(
            h.queue.tracked_peer(PeerId::new(2)).unwrap().next_index,
            LogIndex::new(5)
        );
        h.close().await;
    }

    #[tokio::test]
    async fn test_higher_term_response_publishes_term_advance() {
        let mut h = harness().await;
        h.queue
            .set_leader_mode(OpId::MIN, TermId::new(1), &three_voters());

        let resp = ConsensusResponse {
            responder_id: PeerId::new(2),
            responder_term: TermId::new(5),
            status: ConsensusStatus::ok(OpId::MIN, OpId::MIN, LogIndex::new(0))
                .with_error(ConsensusErrorCode::InvalidTerm, "behind"),
            error: None,
        };
        let more = h.queue.response_from_peer(PeerId::new(2), &resp);
        assert!(!more);
        assert!(matches!(
            h.events.try_recv().unwrap(),
            QueueEvent::TermAdvanced(t) if t == TermId::new(5)
        ));
        h.close().await;
    }

    #[tokio::test]
    async fn test_gc_lost_prefix_triggers_remote_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogStore::open(
            TabletId::new(1),
            tessera_log::LogOptions::new(dir.path()).with_max_segment_bytes(128),
        )
        .await
        .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let queue = PeerMessageQueue::new(
            TabletId::new(1),
            PeerId::new(1),
            Arc::new(ConsensusOptions::new()),
            Arc::clone(&log),
            Arc::new(HybridClock::new()),
            tx,
        );
        queue.init(OpId::MIN);
        queue.set_leader_mode(OpId::MIN, TermId::new(1), &three_voters());

        for i in 1..=12 {
            let (ack, done) = tokio::sync::oneshot::channel();
            queue
                .append_operations(
                    vec![msg(1, i)],
                    Box::new(move |r| {
                        let _ = ack.send(r);
                    }),
                )
                .unwrap();
            done.await.unwrap().unwrap();
        }

        // Reclaim the sealed prefix; peer 2's cursor (index 1) now points
        // below the first retained entry.
        let removed = log.gc(LogIndex::new(10)).unwrap();
        assert!(removed > 0);

        let data = queue.request_for_peer(PeerId::new(2)).unwrap();
        let bootstrap = data.remote_bootstrap.expect("peer needs remote bootstrap");
        assert_eq!(bootstrap.dest_id, PeerId::new(2));
        assert_eq!(bootstrap.bootstrap_source_peer_id, PeerId::new(1));
        assert!(queue
            .tracked_peer(PeerId::new(2))
            .unwrap()
            .needs_remote_bootstrap);
        log.close().await;
    }

    #[tokio::test]
    async fn test_single_server_majority_from_local_durability() {
        let mut h = harness().await;
        let config = RaftConfig {
            opid_index: Some(LogIndex::new(1)),
            peers: vec![RaftPeer::voter(PeerId::new(1), "a:1")],
        };
        h.queue
            .set_leader_mode(OpId::MIN, TermId::new(1), &config);
        append_and_wait(&h, vec![msg(1, 1)]).await;

        match h.events.recv().await.unwrap() {
            QueueEvent::MajorityReplicated(data) => {
                assert_eq!(data.op_id, OpId::new(TermId::new(1), LogIndex::new(1)));
            }
            other => panic!("unexpected event {other:?}"),
        }
        h.close().await;
    }
}
