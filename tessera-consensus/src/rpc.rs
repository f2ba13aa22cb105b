//! Wire envelopes for the five consensus RPCs.
//!
//! The transport itself lives outside this crate; these are the payload
//! shapes the [`PeerProxy`](crate::proxy::PeerProxy) moves around.

use tessera_core::{HybridTime, LogIndex, OpId, PeerId, ReplicateMsgRef, TabletId, TermId};

/// Consensus-level error codes carried inside a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusErrorCode {
    /// The caller's term is behind the responder's.
    InvalidTerm,
    /// The log-matching check failed at `preceding_id`.
    PrecedingEntryDidntMatch,
    /// The responder already voted for another candidate this term.
    AlreadyVoted,
    /// The candidate's log is behind the responder's.
    LastOpIdTooOld,
    /// The responder recently heard from a live leader.
    LeaderIsAlive,
    /// The responder could not take the update lock in time.
    ConsensusBusy,
    /// The responder could not prepare one of the operations.
    CannotPrepare,
}

/// An error embedded in a consensus status.
#[derive(Debug, Clone)]
pub struct ConsensusStatusError {
    /// The error code.
    pub code: ConsensusErrorCode,
    /// Human-readable detail.
    pub message: String,
}

/// The responder's view of its log, returned on every exchange.
#[derive(Debug, Clone)]
pub struct ConsensusStatus {
    /// Last op id written to the responder's log, from any leader.
    pub last_received: OpId,
    /// Last op id received from the current leader.
    pub last_received_current_leader: OpId,
    /// The responder's committed index.
    pub last_committed_index: LogIndex,
    /// Consensus-level error, if any.
    pub error: Option<ConsensusStatusError>,
}

/// Server-level error codes (outside the consensus status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletServerErrorCode {
    /// The request was addressed to a different server id.
    WrongServerId,
    /// The tablet is not hosted on the responder.
    TabletNotFound,
}

/// A server-level error.
#[derive(Debug, Clone)]
pub struct TabletServerError {
    /// The error code.
    pub code: TabletServerErrorCode,
    /// Human-readable detail.
    pub message: String,
}

/// `UpdateConsensus` request: the main replication RPC.
#[derive(Debug, Clone)]
pub struct ConsensusRequest {
    /// Sender's permanent id.
    pub caller_id: PeerId,
    /// Sender's term.
    pub caller_term: TermId,
    /// Target tablet.
    pub tablet_id: TabletId,
    /// Intended recipient's permanent id.
    pub dest_id: PeerId,
    /// Id of the entry immediately preceding `ops`.
    pub preceding_id: OpId,
    /// Entries to replicate (empty for a heartbeat).
    pub ops: Vec<ReplicateMsgRef>,
    /// The leader's committed index.
    pub committed_index: LogIndex,
    /// Hybrid time propagated to advance the follower's clock.
    pub propagated_hybrid_time: Option<HybridTime>,
    /// Safe time propagated for follower reads.
    pub propagated_safe_time: Option<HybridTime>,
    /// Leader-lease window granted by this request, in milliseconds.
    pub leader_lease_duration_ms: Option<u64>,
    /// Hybrid-time lease expiration granted by this request.
    pub ht_lease_expiration: Option<HybridTime>,
}

/// `UpdateConsensus` response.
#[derive(Debug, Clone)]
pub struct ConsensusResponse {
    /// Responder's permanent id.
    pub responder_id: PeerId,
    /// Responder's term (≥ the caller's on success).
    pub responder_term: TermId,
    /// The responder's log status.
    pub status: ConsensusStatus,
    /// Server-level error, if any.
    pub error: Option<TabletServerError>,
}

/// `RequestVote` request.
#[derive(Debug, Clone)]
pub struct VoteRequest {
    /// The candidate asking for the vote.
    pub candidate_id: PeerId,
    /// The term the candidate is running in.
    pub candidate_term: TermId,
    /// Target tablet.
    pub tablet_id: TabletId,
    /// Intended recipient.
    pub dest_id: PeerId,
    /// The candidate's last-received op id.
    pub last_received: OpId,
    /// Set on leadership transfer: vote even if a leader seems alive.
    pub ignore_live_leader: bool,
}

/// `RequestVote` response.
#[derive(Debug, Clone)]
pub struct VoteResponse {
    /// Responder's permanent id.
    pub responder_id: PeerId,
    /// Responder's term.
    pub responder_term: TermId,
    /// Whether the vote was granted.
    pub vote_granted: bool,
    /// Reason for denial.
    pub error_code: Option<ConsensusErrorCode>,
    /// The remaining wall-clock lease the responder last granted to a
    /// leader, in milliseconds. The winner waits this out.
    pub remaining_leader_lease_duration_ms: Option<u64>,
    /// The hybrid-time lease expiration the responder last granted.
    pub leader_ht_lease_expiration: Option<HybridTime>,
}

/// `RunLeaderElection` request: tells a nominee to start an election.
#[derive(Debug, Clone)]
pub struct RunLeaderElectionRequest {
    /// The peer asking for the election (the outgoing leader).
    pub originator_id: PeerId,
    /// Intended recipient (the nominee).
    pub dest_id: PeerId,
    /// Target tablet.
    pub tablet_id: TabletId,
    /// The originator's committed op id.
    pub committed_op_id: OpId,
}

/// `LeaderElectionLost` request: a protégé reports a failed election back
/// to its originator.
#[derive(Debug, Clone)]
pub struct LeaderElectionLostRequest {
    /// The protégé that lost.
    pub election_lost_by_id: PeerId,
    /// Intended recipient (the stepdown originator).
    pub dest_id: PeerId,
    /// Target tablet.
    pub tablet_id: TabletId,
}

/// `StartRemoteBootstrap` request: fire-and-forget kickoff of an
/// out-of-band bulk transfer. The session itself is opaque to this core.
#[derive(Debug, Clone)]
pub struct StartRemoteBootstrapRequest {
    /// Intended recipient (the peer to bootstrap).
    pub dest_id: PeerId,
    /// Target tablet.
    pub tablet_id: TabletId,
    /// The peer to bootstrap from (the leader).
    pub bootstrap_source_peer_id: PeerId,
    /// The source's last-known address.
    pub bootstrap_source_addr: String,
    /// The leader's term, so stale kickoffs can be ignored.
    pub caller_term: TermId,
}

impl ConsensusStatus {
    /// A status with no error.
    #[must_use]
    pub fn ok(
        last_received: OpId,
        last_received_current_leader: OpId,
        last_committed_index: LogIndex,
    ) -> Self {
        Self {
            last_received,
            last_received_current_leader,
            last_committed_index,
            error: None,
        }
    }

    /// A status carrying an error.
    #[must_use]
    pub fn with_error(mut self, code: ConsensusErrorCode, message: impl Into<String>) -> Self {
        self.error = Some(ConsensusStatusError {
            code,
            message: message.into(),
        });
        self
    }
}
