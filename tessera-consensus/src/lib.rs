//! Per-tablet Raft replication core.
//!
//! Each tablet replica runs one [`RaftConsensus`]: it agrees with its peers
//! on an ordered log of operations and hands committed operations to the
//! local storage engine through the replica-operation factory.
//!
//! The moving parts, leaves first:
//!
//! - [`ReplicaState`]: the mutex-guarded Raft state (term, vote, configs,
//!   pending rounds, commit watermark, leases).
//! - [`PeerMessageQueue`]: the leader's shared view of follower progress;
//!   packages the next request per peer and advances the
//!   majority-replicated watermark.
//! - [`Peer`]: one single-in-flight sender per follower, with a
//!   heartbeater and the remote-bootstrap kickoff.
//! - [`PeerManager`]: opens and closes peers to match the active config.
//! - [`FailureDetector`]: the election timer, sampled by a randomized
//!   monitor task.
//! - [`LeaderElection`]: one-shot vote collection.
//! - [`RaftConsensus`]: the orchestrator for `replicate_batch`, `update`,
//!   `request_vote`, `change_config`, `step_down`, role transitions, and
//!   lease bookkeeping.

mod config;
mod failure_detector;
mod leader_election;
mod metadata;
mod peer;
mod peer_manager;
mod proxy;
mod queue;
mod raft;
mod replica_state;
mod round;
mod rpc;

pub use config::ConsensusOptions;
pub use failure_detector::{FailureDetector, FailureMonitor};
pub use leader_election::{
    ElectionCallback, ElectionDecision, ElectionResult, LeaderElection, VoteCounter,
};
pub use metadata::{
    decode_config_change, encode_config_change, ConsensusMetadata, FileMetadataStore,
    InMemoryMetadataStore, MemberType, MetadataStore, RaftConfig, RaftPeer,
};
pub use peer::{Peer, RequestTriggerMode, RoleChangeDelegate};
pub use peer_manager::PeerManager;
pub use proxy::{resolve_permanent_peer_id, PeerProxy, PeerProxyFactory};
pub use queue::{
    MajorityReplicatedData, PeerMessageQueue, PeerRequestData, QueueEvent, TrackedPeerInfo,
};
pub use raft::{
    ChangeConfigRequest, ChangeConfigType, ElectionMode, RaftConsensus, ReplicaOperationFactory,
};
pub use replica_state::{
    CommitAdvance, LeaderLeaseStatus, LifecycleState, ReplicaState, Role, StateGuard, StateInner,
};
pub use round::{ConsensusRound, ConsensusRoundRef, PreAppendHook, ReplicatedCallback};
pub use rpc::{
    ConsensusErrorCode, ConsensusRequest, ConsensusResponse, ConsensusStatus,
    ConsensusStatusError, LeaderElectionLostRequest, RunLeaderElectionRequest,
    StartRemoteBootstrapRequest, TabletServerError, TabletServerErrorCode, VoteRequest,
    VoteResponse,
};
