//! The replica's authoritative in-memory Raft state.
//!
//! One mutex guards everything: term, vote, configs, the pending-round
//! map, the received/committed watermarks, and lease deadlines. Mutators
//! go through a `lock_for_*` method that validates the replica is in an
//! acceptable state before handing out the guard; lock-free readers get
//! the packed role+term atomic.
//!
//! Invariants maintained here:
//! - `committed_op_id ≤ last_received_op_id`.
//! - The pending map holds every round in `(committed, last_received]`
//!   that has not yet been applied.
//! - `voted_for` is durable before any vote-granted reply, and the term is
//!   durable before any action in that term.
//! - Lease deadlines only move forward.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tessera_core::{Error, HybridTime, LogIndex, OpId, OpType, PeerId, Result, TabletId, TermId};
use tracing::{debug, info, warn};

use crate::config::ConsensusOptions;
use crate::metadata::{decode_config_change, ConsensusMetadata, MetadataStore, MemberType, RaftConfig};
use crate::queue::MajorityReplicatedData;
use crate::round::ConsensusRoundRef;

/// Replica lifecycle. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Built but not started.
    Initialized,
    /// Accepting requests.
    Running,
    /// Quiescing; no new operations.
    ShuttingDown,
    /// Fully shut down.
    ShutDown,
}

/// The replica's active Raft role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Leader of the active config.
    Leader,
    /// Voting follower.
    Follower,
    /// Non-voting member (observer or bootstrap transition).
    Learner,
    /// Not a member of the active config.
    NonParticipant,
}

impl Role {
    const fn as_u64(self) -> u64 {
        match self {
            Self::Leader => 0,
            Self::Follower => 1,
            Self::Learner => 2,
            Self::NonParticipant => 3,
        }
    }

    const fn from_u64(raw: u64) -> Self {
        match raw {
            0 => Self::Leader,
            1 => Self::Follower,
            2 => Self::Learner,
            _ => Self::NonParticipant,
        }
    }
}

/// Result of a leader-lease check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderLeaseStatus {
    /// This leader holds a majority-replicated lease.
    HasLease,
    /// No majority-replicated lease yet; wait for the queue to advance.
    NoMajorityReplicatedLease,
    /// The previous leader's lease may still be in force.
    OldLeaderMayHaveLease,
}

/// Outcome of a committed-index advancement.
#[derive(Debug, Default)]
pub struct CommitAdvance {
    /// Whether the committed index moved.
    pub changed: bool,
    /// A config that became committed during the advance, if any.
    pub applied_config: Option<RaftConfig>,
}

/// Guard over the replica state; derefs to [`StateInner`].
pub type StateGuard<'a> = MutexGuard<'a, StateInner>;

/// The mutex-guarded state. Obtain a guard through the `lock_for_*`
/// methods on [`ReplicaState`].
pub struct StateInner {
    peer_id: PeerId,
    tablet_id: TabletId,
    store: Arc<dyn MetadataStore>,
    meta: ConsensusMetadata,
    state: LifecycleState,
    leader_id: Option<PeerId>,
    /// LEADER only: index of the next operation generated in this term.
    next_index: LogIndex,
    /// Rounds received but not yet applied, keyed by index.
    pending: BTreeMap<LogIndex, ConsensusRoundRef>,
    last_received: OpId,
    last_received_current_leader: OpId,
    committed: OpId,
    /// If set, an election starts once this op id commits locally.
    pending_election_op_id: Option<OpId>,
    old_leader_lease_expiration: Option<Instant>,
    old_leader_ht_lease_expiration: HybridTime,
    majority_replicated_lease_expiration: Option<Instant>,
    majority_replicated_ht_lease_expiration: HybridTime,
    role_and_term: Arc<AtomicU64>,
}

/// Coordinates access to the replica state.
pub struct ReplicaState {
    inner: Mutex<StateInner>,
    lease_cond: Condvar,
    role_and_term: Arc<AtomicU64>,
    peer_id: PeerId,
    tablet_id: TabletId,
}

impl ReplicaState {
    /// Builds the state from (possibly recovered) metadata.
    #[must_use]
    pub fn new(
        tablet_id: TabletId,
        peer_id: PeerId,
        _options: Arc<ConsensusOptions>,
        meta: ConsensusMetadata,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        let role_and_term = Arc::new(AtomicU64::new(0));
        let mut inner = StateInner {
            peer_id,
            tablet_id,
            store,
            meta,
            state: LifecycleState::Initialized,
            leader_id: None,
            next_index: LogIndex::new(1),
            pending: BTreeMap::new(),
            last_received: OpId::MIN,
            last_received_current_leader: OpId::MIN,
            committed: OpId::MIN,
            pending_election_op_id: None,
            old_leader_lease_expiration: None,
            old_leader_ht_lease_expiration: HybridTime::MIN,
            majority_replicated_lease_expiration: None,
            majority_replicated_ht_lease_expiration: HybridTime::MIN,
            role_and_term: Arc::clone(&role_and_term),
        };
        inner.store_role_and_term();
        Self {
            inner: Mutex::new(inner),
            lease_cond: Condvar::new(),
            role_and_term,
            peer_id,
            tablet_id,
        }
    }

    /// This replica's permanent id.
    #[must_use]
    pub const fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The tablet this replica belongs to.
    #[must_use]
    pub const fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    /// Lock-free snapshot of the active role and current term.
    #[must_use]
    pub fn role_and_term(&self) -> (Role, TermId) {
        let packed = self.role_and_term.load(Ordering::Acquire);
        (Role::from_u64(packed >> 62), TermId::new(packed & ((1 << 62) - 1)))
    }

    /// Locks for a state read; any lifecycle state is acceptable.
    pub fn lock_for_read(&self) -> Result<StateGuard<'_>> {
        Ok(self.lock())
    }

    /// Locks in preparation for `start`; replica must be `Initialized`.
    pub fn lock_for_start(&self) -> Result<StateGuard<'_>> {
        let guard = self.lock();
        if guard.state != LifecycleState::Initialized {
            return Err(Error::illegal_state(format!(
                "cannot start in state {:?}",
                guard.state
            )));
        }
        Ok(guard)
    }

    /// Locks for a leader-side replicate; replica must be a running leader.
    pub fn lock_for_replicate(&self) -> Result<StateGuard<'_>> {
        let guard = self.lock();
        guard.check_running()?;
        if guard.active_role() != Role::Leader {
            return Err(Error::illegal_state("replica is not leader"));
        }
        Ok(guard)
    }

    /// Locks for a follower-side update; replica must be running.
    pub fn lock_for_update(&self) -> Result<StateGuard<'_>> {
        let guard = self.lock();
        guard.check_running()?;
        Ok(guard)
    }

    /// Locks for a config change; replica must be running.
    pub fn lock_for_config_change(&self) -> Result<StateGuard<'_>> {
        let guard = self.lock();
        guard.check_running()?;
        Ok(guard)
    }

    /// Locks to advance the majority-replicated index; leader only.
    pub fn lock_for_majority_replicated_index_update(&self) -> Result<StateGuard<'_>> {
        let guard = self.lock();
        guard.check_running()?;
        if guard.active_role() != Role::Leader {
            return Err(Error::illegal_state(
                "majority-replicated update on non-leader",
            ));
        }
        Ok(guard)
    }

    /// Locks for shutdown, moving the lifecycle to `ShuttingDown`.
    pub fn lock_for_shutdown(&self) -> Result<StateGuard<'_>> {
        let mut guard = self.lock();
        if guard.state == LifecycleState::ShutDown {
            return Err(Error::illegal_state("replica already shut down"));
        }
        if guard.state != LifecycleState::ShuttingDown {
            info!(tablet = %guard.tablet_id, peer = %guard.peer_id, "replica shutting down");
            guard.state = LifecycleState::ShuttingDown;
        }
        Ok(guard)
    }

    /// Wakes threads blocked in [`wait_for_leader_lease`](Self::wait_for_leader_lease).
    pub fn notify_lease_observers(&self) {
        self.lease_cond.notify_all();
    }

    /// Blocks until this leader holds a majority-replicated lease, the
    /// deadline passes, or leadership is lost.
    ///
    /// # Errors
    /// `TimedOut` past the deadline; `IllegalState` if not leader.
    pub fn wait_for_leader_lease(&self, deadline: Instant) -> Result<()> {
        let mut guard = self.lock();
        loop {
            if guard.active_role() != Role::Leader {
                return Err(Error::illegal_state("lost leadership while waiting for lease"));
            }
            match guard.leader_lease_status().0 {
                LeaderLeaseStatus::HasLease => return Ok(()),
                LeaderLeaseStatus::NoMajorityReplicatedLease
                | LeaderLeaseStatus::OldLeaderMayHaveLease => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::timed_out("waiting for leader lease"));
            }
            let wait = (deadline - now).min(Duration::from_millis(100));
            let (next, _) = self
                .lease_cond
                .wait_timeout(guard, wait)
                .expect("replica state lock poisoned");
            guard = next;
        }
    }

    fn lock(&self) -> StateGuard<'_> {
        self.inner.lock().expect("replica state lock poisoned")
    }
}

impl StateInner {
    // ---------------------------------------------------------------------
    // Lifecycle

    fn check_running(&self) -> Result<()> {
        if self.state != LifecycleState::Running {
            return Err(Error::illegal_state(format!(
                "replica not running (state {:?})",
                self.state
            )));
        }
        Ok(())
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Completes startup: primes the id generator and watermarks from the
    /// last entry recovered from the WAL.
    pub fn start(&mut self, last_in_wal: OpId, committed: OpId) {
        debug_assert_eq!(self.state, LifecycleState::Initialized);
        self.next_index = LogIndex::new(last_in_wal.index.get() + 1);
        self.last_received = last_in_wal;
        self.committed = committed;
        self.state = LifecycleState::Running;
        self.store_role_and_term();
    }

    /// Completes shutdown after quiescing. Aborts anything still pending.
    pub fn shutdown(&mut self) {
        debug_assert_eq!(self.state, LifecycleState::ShuttingDown);
        self.cancel_pending_operations();
        self.state = LifecycleState::ShutDown;
        self.store_role_and_term();
    }

    // ---------------------------------------------------------------------
    // Term, vote, leader

    /// The current term.
    #[must_use]
    pub fn current_term(&self) -> TermId {
        self.meta.current_term
    }

    /// The current leader's id, if known.
    #[must_use]
    pub fn leader_id(&self) -> Option<PeerId> {
        self.leader_id
    }

    /// Records the current leader.
    pub fn set_leader(&mut self, leader: Option<PeerId>) {
        if self.leader_id != leader {
            debug!(tablet = %self.tablet_id, peer = %self.peer_id, leader = ?leader, "leader changed");
        }
        self.leader_id = leader;
        self.store_role_and_term();
    }

    /// Advances the current term, clearing the vote. Durable before return.
    ///
    /// # Errors
    /// `IllegalState` if the term would not increase, or the flush fails.
    pub fn set_current_term(&mut self, new_term: TermId) -> Result<()> {
        if new_term <= self.meta.current_term {
            return Err(Error::illegal_state(format!(
                "cannot advance term {} to {}",
                self.meta.current_term, new_term
            )));
        }
        self.meta.current_term = new_term;
        self.meta.voted_for = None;
        self.store.flush(&self.meta)?;
        // A term advance means the previous leader's stream ended.
        self.last_received_current_leader = OpId::MIN;
        self.store_role_and_term();
        Ok(())
    }

    /// True if this replica voted in the current term.
    #[must_use]
    pub fn has_voted_current_term(&self) -> bool {
        self.meta.voted_for.is_some()
    }

    /// The vote cast this term, if any.
    #[must_use]
    pub fn voted_for(&self) -> Option<PeerId> {
        self.meta.voted_for
    }

    /// Records a vote for the current term. Durable before return.
    ///
    /// # Errors
    /// `IllegalState` on a conflicting vote, or the flush error.
    pub fn set_voted_for(&mut self, candidate: PeerId) -> Result<()> {
        if let Some(prior) = self.meta.voted_for {
            if prior != candidate {
                return Err(Error::illegal_state(format!(
                    "already voted for {prior} in term {}",
                    self.meta.current_term
                )));
            }
            return Ok(());
        }
        self.meta.voted_for = Some(candidate);
        self.store.flush(&self.meta)
    }

    // ---------------------------------------------------------------------
    // Configs

    /// The active config: pending if one exists, committed otherwise.
    #[must_use]
    pub fn active_config(&self) -> &RaftConfig {
        self.meta.active_config()
    }

    /// The committed config.
    #[must_use]
    pub fn committed_config(&self) -> &RaftConfig {
        &self.meta.committed_config
    }

    /// True if a config change is in flight.
    #[must_use]
    pub fn has_pending_config(&self) -> bool {
        self.meta.has_pending_config()
    }

    /// Installs a pending config.
    ///
    /// # Errors
    /// `IllegalState` if one is already pending.
    pub fn set_pending_config(&mut self, config: RaftConfig) -> Result<()> {
        if self.meta.pending_config.is_some() {
            return Err(Error::illegal_state("a config change is already pending"));
        }
        self.meta.pending_config = Some(config);
        self.store_role_and_term();
        Ok(())
    }

    /// Drops the pending config (config-change round aborted).
    pub fn clear_pending_config(&mut self) {
        self.meta.pending_config = None;
        self.store_role_and_term();
    }

    /// Makes `config` the committed config, clears the pending config, and
    /// persists. Called when a config-change round commits.
    ///
    /// # Errors
    /// Returns the flush error.
    pub fn set_committed_config(&mut self, config: RaftConfig) -> Result<()> {
        self.meta.committed_config = config;
        self.meta.pending_config = None;
        self.store.flush(&self.meta)?;
        self.store_role_and_term();
        Ok(())
    }

    /// The active role derived from leader id and config membership.
    #[must_use]
    pub fn active_role(&self) -> Role {
        if self.state != LifecycleState::Running {
            return Role::NonParticipant;
        }
        if self.leader_id == Some(self.peer_id) {
            return Role::Leader;
        }
        match self.active_config().peer(self.peer_id) {
            Some(peer) => match peer.member_type {
                MemberType::Voter => Role::Follower,
                MemberType::Observer | MemberType::PreVoter | MemberType::PreObserver => {
                    Role::Learner
                }
                MemberType::NonParticipant => Role::NonParticipant,
            },
            None => Role::NonParticipant,
        }
    }

    /// On-disk size of the persisted consensus metadata.
    #[must_use]
    pub fn metadata_on_disk_size(&self) -> u64 {
        self.store.on_disk_size()
    }

    // ---------------------------------------------------------------------
    // Op ids and the pending map

    /// The committed op id.
    #[must_use]
    pub fn committed_op_id(&self) -> OpId {
        self.committed
    }

    /// The last received op id (from any leader).
    #[must_use]
    pub fn last_received(&self) -> OpId {
        self.last_received
    }

    /// The last op id received from the current leader.
    #[must_use]
    pub fn last_received_current_leader(&self) -> OpId {
        self.last_received_current_leader
    }

    /// True iff an op from the current term has been committed.
    #[must_use]
    pub fn are_committed_and_current_terms_same(&self) -> bool {
        self.committed.term == self.meta.current_term
    }

    /// Index of the newest pending round, or the committed index if none.
    #[must_use]
    pub fn last_pending_index(&self) -> LogIndex {
        self.pending
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.committed.index)
    }

    /// The pending round at `index`, if any.
    #[must_use]
    pub fn pending_round(&self, index: LogIndex) -> Option<&ConsensusRoundRef> {
        self.pending.get(&index)
    }

    /// Number of pending rounds.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Allocates the next leader op id. Pair with
    /// [`cancel_pending_operation`](Self::cancel_pending_operation) on
    /// rollback.
    pub fn new_id(&mut self) -> OpId {
        let id = OpId::new(self.meta.current_term, self.next_index);
        self.next_index = self.next_index.next();
        id
    }

    /// Rewinds the id generator after a failed append. Ids must be
    /// cancelled newest-first.
    pub fn cancel_pending_operation(&mut self, id: OpId, should_exist: bool) {
        debug_assert_eq!(
            id.index.next(),
            self.next_index,
            "ids must be cancelled in reverse allocation order"
        );
        self.next_index = id.index;
        let removed = self.pending.remove(&id.index);
        if removed.is_some() != should_exist {
            warn!(
                tablet = %self.tablet_id,
                op_id = %id,
                should_exist,
                "pending-map mismatch while cancelling operation"
            );
        }
    }

    /// Inserts a round into the pending map.
    ///
    /// # Errors
    /// `IllegalState` if the index is at or below the committed index, or
    /// an entry with the same index but a different term already exists.
    pub fn add_pending_operation(&mut self, round: ConsensusRoundRef) -> Result<()> {
        let id = round
            .id()
            .ok_or_else(|| Error::illegal_state("round has no assigned op id"))?;
        if id.index <= self.committed.index {
            return Err(Error::illegal_state(format!(
                "op {id} at or below committed {}",
                self.committed
            )));
        }
        if let Some(existing) = self.pending.get(&id.index) {
            let existing_id = existing.id().unwrap_or(OpId::MIN);
            if existing_id != id {
                return Err(Error::illegal_state(format!(
                    "pending map already holds {existing_id} at index {}",
                    id.index
                )));
            }
            return Ok(());
        }
        self.pending.insert(id.index, round);
        Ok(())
    }

    /// Updates the last-received watermarks.
    pub fn update_last_received(&mut self, op_id: OpId, from_current_leader: bool) {
        debug_assert!(
            op_id >= self.last_received,
            "last_received may regress only via abort_ops_after"
        );
        self.last_received = op_id;
        if from_current_leader {
            self.last_received_current_leader = op_id;
        }
        debug_assert!(self.committed.index <= self.last_received.index);
    }

    /// True if `op_id` is at or below committed, or matches a pending
    /// round exactly. The second return is true iff a pending round has
    /// the same index but a different term.
    #[must_use]
    pub fn is_op_committed_or_pending(&self, op_id: OpId) -> (bool, bool) {
        if op_id.index <= self.committed.index {
            return (true, false);
        }
        match self.pending.get(&op_id.index) {
            Some(round) => match round.id() {
                Some(existing) if existing == op_id => (true, false),
                Some(_) => (false, true),
                None => (false, false),
            },
            None => (false, false),
        }
    }

    /// Checks that `current` correctly follows `previous`: same or higher
    /// term, index exactly one greater.
    ///
    /// # Errors
    /// `Corruption` on violation.
    pub fn check_op_in_sequence(previous: OpId, current: OpId) -> Result<()> {
        if current.term < previous.term {
            return Err(Error::corruption(format!(
                "op {current} has lower term than preceding {previous}"
            )));
        }
        if current.index.get() != previous.index.get() + 1 {
            return Err(Error::corruption(format!(
                "op {current} does not follow {previous} sequentially"
            )));
        }
        Ok(())
    }

    /// Aborts pending rounds after, but not including, `index`. Their
    /// callbacks fire with `Aborted`; `last_received` becomes the newest
    /// surviving id.
    ///
    /// # Errors
    /// `IllegalState` if `index` is below the committed index.
    pub fn abort_ops_after(&mut self, index: LogIndex) -> Result<()> {
        if index < self.committed.index {
            return Err(Error::illegal_state(format!(
                "cannot abort below committed index {}",
                self.committed.index
            )));
        }
        let aborted = self.pending.split_off(&LogIndex::new(index.get() + 1));
        if aborted.is_empty() {
            return Ok(());
        }
        info!(
            tablet = %self.tablet_id,
            peer = %self.peer_id,
            after = index.get(),
            count = aborted.len(),
            "aborting uncommitted operations after index"
        );
        for (_, round) in aborted.into_iter().rev() {
            round.notify_replication_finished(Err(Error::aborted(
                "op aborted by new leader",
            )));
        }
        let new_last = self
            .pending
            .values()
            .next_back()
            .and_then(|r| r.id())
            .unwrap_or(self.committed);
        self.last_received = new_last;
        if self.last_received_current_leader > new_last {
            self.last_received_current_leader = new_last;
        }
        Ok(())
    }

    /// Aborts every pending round, newest first (shutdown path).
    pub fn cancel_pending_operations(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (_, round) in pending.into_iter().rev() {
            round.notify_replication_finished(Err(Error::aborted("replica shutting down")));
        }
    }

    /// Advances the committed index up to `target_index`, applying rounds
    /// in index order. Every index in `(committed, target]` must be
    /// pending.
    ///
    /// # Errors
    /// `IllegalState` on a gap, `Corruption` on an undecodable committed
    /// config change.
    pub fn advance_committed_index(&mut self, target_index: LogIndex) -> Result<CommitAdvance> {
        let mut advance = CommitAdvance::default();
        if target_index <= self.committed.index {
            // Committing the same index twice is a no-op.
            return Ok(advance);
        }

        // Verify coverage before touching anything.
        for index in (self.committed.index.get() + 1)..=target_index.get() {
            if !self.pending.contains_key(&LogIndex::new(index)) {
                return Err(Error::illegal_state(format!(
                    "cannot commit up to index {target_index}: index {index} is not pending"
                )));
            }
        }

        let to_apply = {
            let rest = self.pending.split_off(&LogIndex::new(target_index.get() + 1));
            std::mem::replace(&mut self.pending, rest)
        };

        for (_, round) in to_apply {
            let id = round.id().unwrap_or(OpId::MIN);
            debug_assert_eq!(id.index.get(), self.committed.index.get() + 1);
            if round.op_type() == OpType::ChangeConfig {
                self.apply_config_change(&round, &mut advance)?;
            }
            self.committed = id;
            round.notify_replication_finished(Ok(id));
        }
        advance.changed = true;
        debug!(
            tablet = %self.tablet_id,
            peer = %self.peer_id,
            committed = %self.committed,
            "advanced committed op id"
        );
        Ok(advance)
    }

    fn apply_config_change(
        &mut self,
        round: &ConsensusRoundRef,
        advance: &mut CommitAdvance,
    ) -> Result<()> {
        let msg = round
            .msg()
            .ok_or_else(|| Error::illegal_state("config round has no message"))?;
        let (_, mut new_config) = decode_config_change(&msg.payload)?;
        new_config.opid_index = Some(msg.id.index);
        info!(
            tablet = %self.tablet_id,
            peer = %self.peer_id,
            op_id = %msg.id,
            peers = new_config.peers.len(),
            "committing config change"
        );
        self.set_committed_config(new_config.clone())?;
        advance.applied_config = Some(new_config);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Pending election

    /// Op id whose local commit should trigger an election, if set.
    #[must_use]
    pub fn pending_election_op_id(&self) -> Option<OpId> {
        self.pending_election_op_id
    }

    /// Defers an election until `op_id` commits locally.
    pub fn set_pending_election_op_id(&mut self, op_id: Option<OpId>) {
        self.pending_election_op_id = op_id;
    }

    // ---------------------------------------------------------------------
    // Leases

    /// Extends the old leader's lease expirations; deadlines never
    /// regress.
    pub fn update_old_leader_lease(
        &mut self,
        lease_duration: Option<Duration>,
        ht_lease_expiration: Option<HybridTime>,
    ) {
        if let Some(duration) = lease_duration {
            let expiration = Instant::now() + duration;
            self.old_leader_lease_expiration = Some(
                self.old_leader_lease_expiration
                    .map_or(expiration, |current| current.max(expiration)),
            );
        }
        if let Some(ht) = ht_lease_expiration {
            if ht > self.old_leader_ht_lease_expiration {
                self.old_leader_ht_lease_expiration = ht;
            }
        }
    }

    /// Remaining duration of the old leader's wall-clock lease, if any.
    #[must_use]
    pub fn remaining_old_leader_lease(&mut self) -> Option<Duration> {
        let expiration = self.old_leader_lease_expiration?;
        let now = Instant::now();
        if expiration <= now {
            // Expired; stop querying the clock for it.
            self.old_leader_lease_expiration = None;
            return None;
        }
        Some(expiration - now)
    }

    /// The old leader's hybrid-time lease expiration.
    #[must_use]
    pub fn old_leader_ht_lease_expiration(&self) -> HybridTime {
        self.old_leader_ht_lease_expiration
    }

    /// Installs the majority-replicated lease deadlines (leader only).
    pub fn set_majority_replicated_lease_expiration(&mut self, data: &MajorityReplicatedData) {
        if let Some(expiration) = data.leader_lease_expiration {
            self.majority_replicated_lease_expiration = Some(
                self.majority_replicated_lease_expiration
                    .map_or(expiration, |current| current.max(expiration)),
            );
        }
        if data.ht_lease_expiration > self.majority_replicated_ht_lease_expiration {
            self.majority_replicated_ht_lease_expiration = data.ht_lease_expiration;
        }
    }

    /// The leader's lease status and, when the old leader may still hold a
    /// lease, the remaining delay.
    #[must_use]
    pub fn leader_lease_status(&self) -> (LeaderLeaseStatus, Option<Duration>) {
        let now = Instant::now();
        if let Some(old) = self.old_leader_lease_expiration {
            if old > now {
                return (LeaderLeaseStatus::OldLeaderMayHaveLease, Some(old - now));
            }
        }
        match self.majority_replicated_lease_expiration {
            Some(expiration) if expiration > now => (LeaderLeaseStatus::HasLease, None),
            _ => (LeaderLeaseStatus::NoMajorityReplicatedLease, None),
        }
    }

    /// The majority-replicated hybrid-time lease expiration.
    #[must_use]
    pub fn majority_replicated_ht_lease_expiration(&self) -> HybridTime {
        self.majority_replicated_ht_lease_expiration
    }

    fn store_role_and_term(&self) {
        let packed = (self.active_role().as_u64() << 62) | self.meta.current_term.get();
        self.role_and_term.store(packed, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tessera_core::OpType;

    use crate::metadata::{InMemoryMetadataStore, RaftPeer};
    use crate::round::ConsensusRound;

    use super::*;

    fn three_node_config() -> RaftConfig {
        RaftConfig {
            opid_index: Some(LogIndex::new(1)),
            peers: vec![
                RaftPeer::voter(PeerId::new(1), "a:1"),
                RaftPeer::voter(PeerId::new(2), "b:1"),
                RaftPeer::voter(PeerId::new(3), "c:1"),
            ],
        }
    }

    fn running_state() -> ReplicaState {
        let state = ReplicaState::new(
            TabletId::new(1),
            PeerId::new(1),
            Arc::new(ConsensusOptions::new()),
            ConsensusMetadata::new(three_node_config()),
            Arc::new(InMemoryMetadataStore::new()),
        );
        state.lock_for_start().unwrap().start(OpId::MIN, OpId::MIN);
        state
    }

    fn leader_state(term: u64) -> ReplicaState {
        let state = running_state();
        {
            let mut guard = state.lock_for_update().unwrap();
            guard.set_current_term(TermId::new(term)).unwrap();
            guard.set_leader(Some(PeerId::new(1)));
        }
        state
    }

    fn pending_round(state: &ReplicaState) -> (OpId, ConsensusRoundRef) {
        let mut guard = state.lock_for_replicate().unwrap();
        let id = guard.new_id();
        let round = ConsensusRound::leader(OpType::Write, Bytes::new());
        round.assign(id, HybridTime::from_micros(1), guard.committed_op_id());
        guard.add_pending_operation(round.clone()).unwrap();
        guard.update_last_received(id, true);
        (id, round)
    }

    #[test]
    fn test_lock_for_replicate_requires_leader() {
        let state = running_state();
        assert!(state.lock_for_replicate().is_err());

        let state = leader_state(1);
        assert!(state.lock_for_replicate().is_ok());
    }

    #[test]
    fn test_new_id_then_cancel_is_deterministic() {
        let state = leader_state(1);
        let (id, _round) = pending_round(&state);

        let mut guard = state.lock_for_replicate().unwrap();
        guard.cancel_pending_operation(id, true);
        let again = guard.new_id();
        assert_eq!(again, id);
    }

    #[test]
    fn test_add_pending_rejects_committed_index() {
        let state = leader_state(1);
        let (id, _round) = pending_round(&state);
        {
            let mut guard = state.lock_for_replicate().unwrap();
            guard.advance_committed_index(id.index).unwrap();
        }

        let mut guard = state.lock_for_replicate().unwrap();
        let stale = ConsensusRound::leader(OpType::Write, Bytes::new());
        stale.assign(id, HybridTime::from_micros(2), OpId::MIN);
        assert!(guard.add_pending_operation(stale).is_err());
    }

    #[test]
    fn test_advance_committed_requires_contiguous_pending() {
        let state = leader_state(1);
        let (_id1, _r1) = pending_round(&state);
        let (id2, _r2) = pending_round(&state);

        let mut guard = state.lock_for_replicate().unwrap();
        // Drop index 1's round to fake a gap.
        guard.pending.remove(&LogIndex::new(1));
        assert!(guard.advance_committed_index(id2.index).is_err());
    }

    #[test]
    fn test_commit_twice_is_noop() {
        let state = leader_state(1);
        let (id, _round) = pending_round(&state);

        let mut guard = state.lock_for_replicate().unwrap();
        let first = guard.advance_committed_index(id.index).unwrap();
        assert!(first.changed);
        let second = guard.advance_committed_index(id.index).unwrap();
        assert!(!second.changed);
        assert_eq!(guard.committed_op_id(), id);
    }

    #[test]
    fn test_abort_ops_after_fires_callbacks_and_rewinds() {
        let state = leader_state(1);
        let (id1, _r1) = pending_round(&state);
        let (_id2, r2) = pending_round(&state);
        let (_id3, r3) = pending_round(&state);

        let aborted = Arc::new(Mutex::new(Vec::new()));
        for round in [&r2, &r3] {
            let sink = Arc::clone(&aborted);
            round.set_replicated_callback(Box::new(move |result| {
                sink.lock().unwrap().push(result);
            }));
        }

        let mut guard = state.lock_for_update().unwrap();
        guard.abort_ops_after(id1.index).unwrap();
        assert_eq!(guard.last_received(), id1);
        assert_eq!(guard.pending_count(), 1);

        let aborted = aborted.lock().unwrap();
        assert_eq!(aborted.len(), 2);
        assert!(aborted.iter().all(|r| matches!(r, Err(e) if e.is_aborted())));
    }

    #[test]
    fn test_is_op_committed_or_pending_term_mismatch() {
        let state = leader_state(2);
        let (id, _round) = pending_round(&state);

        let guard = state.lock_for_read().unwrap();
        let (found, mismatch) = guard.is_op_committed_or_pending(id);
        assert!(found);
        assert!(!mismatch);

        let wrong_term = OpId::new(TermId::new(1), id.index);
        let (found, mismatch) = guard.is_op_committed_or_pending(wrong_term);
        assert!(!found);
        assert!(mismatch);
    }

    #[test]
    fn test_check_op_in_sequence() {
        let prev = OpId::new(TermId::new(1), LogIndex::new(4));
        assert!(StateInner::check_op_in_sequence(
            prev,
            OpId::new(TermId::new(1), LogIndex::new(5))
        )
        .is_ok());
        assert!(StateInner::check_op_in_sequence(
            prev,
            OpId::new(TermId::new(2), LogIndex::new(5))
        )
        .is_ok());
        assert!(StateInner::check_op_in_sequence(
            prev,
            OpId::new(TermId::new(1), LogIndex::new(6))
        )
        .unwrap_err()
        .is_corruption());
        assert!(StateInner::check_op_in_sequence(
            prev,
            OpId::new(TermId::new(0), LogIndex::new(5))
        )
        .unwrap_err()
        .is_corruption());
    }

    #[test]
    fn test_vote_is_sticky_within_term() {
        let state = running_state();
        let mut guard = state.lock_for_update().unwrap();
        guard.set_current_term(TermId::new(3)).unwrap();
        guard.set_voted_for(PeerId::new(2)).unwrap();
        // Same candidate: idempotent.
        assert!(guard.set_voted_for(PeerId::new(2)).is_ok());
        // Different candidate: rejected.
        assert!(guard.set_voted_for(PeerId::new(3)).is_err());
        // New term clears the vote.
        guard.set_current_term(TermId::new(4)).unwrap();
        assert!(!guard.has_voted_current_term());
    }

    #[test]
    fn test_old_leader_lease_never_regresses() {
        let state = running_state();
        let mut guard = state.lock_for_update().unwrap();
        guard.update_old_leader_lease(Some(Duration::from_secs(10)), None);
        let long = guard.remaining_old_leader_lease().unwrap();
        guard.update_old_leader_lease(Some(Duration::from_millis(1)), None);
        let still_long = guard.remaining_old_leader_lease().unwrap();
        assert!(still_long > long / 2, "lease regressed");
    }

    #[test]
    fn test_leader_lease_status_progression() {
        let state = leader_state(1);
        let mut guard = state.lock_for_replicate().unwrap();

        assert_eq!(
            guard.leader_lease_status().0,
            LeaderLeaseStatus::NoMajorityReplicatedLease
        );

        guard.update_old_leader_lease(Some(Duration::from_secs(5)), None);
        let (status, remaining) = guard.leader_lease_status();
        assert_eq!(status, LeaderLeaseStatus::OldLeaderMayHaveLease);
        assert!(remaining.unwrap() <= Duration::from_secs(5));

        guard.old_leader_lease_expiration = None;
        guard.set_majority_replicated_lease_expiration(&MajorityReplicatedData {
            op_id: OpId::MIN,
            leader_lease_expiration: Some(Instant::now() + Duration::from_secs(2)),
            ht_lease_expiration: HybridTime::MIN,
        });
        assert_eq!(guard.leader_lease_status().0, LeaderLeaseStatus::HasLease);
    }

    #[test]
    fn test_role_and_term_snapshot() {
        let state = leader_state(5);
        let (role, term) = state.role_and_term();
        assert_eq!(role, Role::Leader);
        assert_eq!(term, TermId::new(5));
    }

    #[test]
    fn test_shutdown_aborts_pending() {
        let state = leader_state(1);
        let (_id, round) = pending_round(&state);
        let aborted = Arc::new(Mutex::new(false));
        let sink = Arc::clone(&aborted);
        round.set_replicated_callback(Box::new(move |result| {
            *sink.lock().unwrap() = result.is_err();
        }));

        let mut guard = state.lock_for_shutdown().unwrap();
        guard.shutdown();
        assert_eq!(guard.state(), LifecycleState::ShutDown);
        assert!(*aborted.lock().unwrap());
    }
}
