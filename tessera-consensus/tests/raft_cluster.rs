//! Multi-replica consensus tests over an in-process proxy mesh.
//!
//! Each "node" is a full `RaftConsensus` with its own log directory and
//! metadata store; the mesh routes RPCs directly into the target node's
//! entry points and can silence individual peers to simulate partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tessera_consensus::{
    ChangeConfigRequest, ChangeConfigType, ConsensusMetadata, ConsensusOptions, ConsensusRequest,
    ConsensusResponse, ConsensusRound, ConsensusRoundRef, ElectionMode, InMemoryMetadataStore,
    LeaderElectionLostRequest, MemberType, PeerProxy, PeerProxyFactory, RaftConfig, RaftConsensus,
    RaftPeer, ReplicaOperationFactory, Role, RunLeaderElectionRequest,
    StartRemoteBootstrapRequest, VoteRequest, VoteResponse,
};
use tessera_core::{
    Error, HybridClock, LogIndex, OpId, OpType, PeerId, ReplicateMsgRef, Result, TabletId, TermId,
};
use tessera_log::{LogOptions, LogStore};

const TABLET: TabletId = TabletId::new(7);

// ---------------------------------------------------------------------------
// In-process mesh

#[derive(Default)]
struct Mesh {
    nodes: Mutex<HashMap<PeerId, Arc<RaftConsensus>>>,
    silent: Mutex<HashSet<PeerId>>,
}

impl Mesh {
    fn register(&self, id: PeerId, node: Arc<RaftConsensus>) {
        self.nodes.lock().unwrap().insert(id, node);
    }

    fn silence(&self, id: PeerId) {
        self.silent.lock().unwrap().insert(id);
    }

    fn unsilence(&self, id: PeerId) {
        self.silent.lock().unwrap().remove(&id);
    }

    fn target(&self, to: PeerId) -> Result<Arc<RaftConsensus>> {
        if self.silent.lock().unwrap().contains(&to) {
            return Err(Error::remote(format!("{to} is unreachable")));
        }
        self.nodes
            .lock()
            .unwrap()
            .get(&to)
            .cloned()
            .ok_or_else(|| Error::remote(format!("{to} is not registered")))
    }
}

struct MeshProxy {
    mesh: Arc<Mesh>,
    to: PeerId,
}

#[async_trait]
impl PeerProxy for MeshProxy {
    async fn update(&self, request: ConsensusRequest) -> Result<ConsensusResponse> {
        self.mesh.target(self.to)?.update(request).await
    }

    async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.mesh.target(self.to)?.request_vote(&request).await
    }

    async fn run_leader_election(&self, request: RunLeaderElectionRequest) -> Result<()> {
        self.mesh.target(self.to)?.run_leader_election(&request)
    }

    async fn leader_election_lost(&self, request: LeaderElectionLostRequest) -> Result<()> {
        self.mesh.target(self.to)?.leader_election_lost(&request);
        Ok(())
    }

    async fn start_remote_bootstrap(&self, _request: StartRemoteBootstrapRequest) -> Result<()> {
        Ok(())
    }

    async fn fetch_server_id(&self) -> Result<PeerId> {
        Ok(self.to)
    }
}

struct MeshFactory {
    mesh: Arc<Mesh>,
}

impl PeerProxyFactory for MeshFactory {
    fn new_proxy(&self, peer: &RaftPeer) -> Result<Arc<dyn PeerProxy>> {
        Ok(Arc::new(MeshProxy {
            mesh: Arc::clone(&self.mesh),
            to: peer.id,
        }))
    }
}

/// Replica operations with no storage engine behind them.
struct PassThroughFactory;

impl ReplicaOperationFactory for PassThroughFactory {
    fn start_replica_operation(&self, msg: ReplicateMsgRef) -> Result<ConsensusRoundRef> {
        Ok(ConsensusRound::replica(msg))
    }
}

// ---------------------------------------------------------------------------
// Harness

struct Node {
    consensus: Arc<RaftConsensus>,
    log: Arc<LogStore>,
    _dir: tempfile::TempDir,
}

struct Cluster {
    mesh: Arc<Mesh>,
    nodes: HashMap<PeerId, Node>,
}

fn fast_options() -> ConsensusOptions {
    ConsensusOptions::new()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_leader_failure_detection(false)
        .with_evict_failed_followers(false)
}

fn voters(n: u64) -> RaftConfig {
    RaftConfig {
        opid_index: Some(LogIndex::new(0)),
        peers: (1..=n)
            .map(|i| RaftPeer::voter(PeerId::new(i), format!("127.0.0.1:{}", 9000 + i)))
            .collect(),
    }
}

async fn build_cluster(config: &RaftConfig, member_ids: &[u64]) -> Cluster {
    let mesh = Arc::new(Mesh::default());
    let mut nodes = HashMap::new();
    for &raw_id in member_ids {
        let id = PeerId::new(raw_id);
        let dir = tempfile::tempdir().unwrap();
        let log = LogStore::open(TABLET, LogOptions::new(dir.path())).await.unwrap();
        let consensus = RaftConsensus::create(
            TABLET,
            id,
            Arc::new(fast_options()),
            ConsensusMetadata::new(config.clone()),
            Arc::new(InMemoryMetadataStore::new()),
            Arc::clone(&log),
            Arc::new(HybridClock::new()),
            Arc::new(MeshFactory {
                mesh: Arc::clone(&mesh),
            }),
            Arc::new(PassThroughFactory),
        );
        consensus.start(OpId::MIN, OpId::MIN).unwrap();
        mesh.register(id, Arc::clone(&consensus));
        nodes.insert(
            id,
            Node {
                consensus,
                log,
                _dir: dir,
            },
        );
    }
    Cluster { mesh, nodes }
}

impl Cluster {
    fn node(&self, id: u64) -> &Arc<RaftConsensus> {
        &self.nodes[&PeerId::new(id)].consensus
    }

    async fn shutdown(self) {
        for node in self.nodes.values() {
            node.consensus.shutdown().await;
        }
        for node in self.nodes.values() {
            node.log.close().await;
        }
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, condition: F) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn submit_write(leader: &Arc<RaftConsensus>, payload: &'static [u8]) -> tokio::sync::oneshot::Receiver<Result<OpId>> {
    let round = ConsensusRound::leader(OpType::Write, Bytes::from_static(payload));
    round.bind_term(leader.leader_term().expect("caller must be leader"));
    let (tx, rx) = tokio::sync::oneshot::channel();
    round.set_replicated_callback(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    leader.replicate_batch(&[round]).unwrap();
    rx
}

// ---------------------------------------------------------------------------
// Scenarios

#[tokio::test(flavor = "multi_thread")]
async fn three_node_cluster_elects_and_replicates() {
    let cluster = build_cluster(&voters(3), &[1, 2, 3]).await;

    cluster.node(1).start_election(ElectionMode::NormalElection).unwrap();
    wait_until("node 1 becomes leader", Duration::from_secs(5), || {
        cluster.node(1).role_and_term().0 == Role::Leader
    })
    .await;

    // The term's no-op commits once a majority acks.
    wait_until("no-op commits", Duration::from_secs(5), || {
        !cluster.node(1).committed_op_id().is_min()
    })
    .await;

    let done = submit_write(cluster.node(1), b"row");
    let committed_id = done.await.unwrap().unwrap();
    assert_eq!(committed_id.term, TermId::new(1));

    // Followers learn the commit through subsequent heartbeats.
    for id in [2u64, 3] {
        wait_until("follower catches up", Duration::from_secs(5), || {
            cluster.node(id).committed_op_id() >= committed_id
        })
        .await;
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn write_commits_with_one_silent_follower() {
    let cluster = build_cluster(&voters(3), &[1, 2, 3]).await;
    cluster.mesh.silence(PeerId::new(3));

    cluster.node(1).start_election(ElectionMode::NormalElection).unwrap();
    wait_until("node 1 becomes leader", Duration::from_secs(5), || {
        cluster.node(1).role_and_term().0 == Role::Leader
    })
    .await;
    wait_until("no-op commits", Duration::from_secs(5), || {
        !cluster.node(1).committed_op_id().is_min()
    })
    .await;

    // Majority = 2: the leader plus node 2 suffice.
    let done = submit_write(cluster.node(1), b"w");
    let committed_id = done.await.unwrap().unwrap();
    wait_until("node 2 applies", Duration::from_secs(5), || {
        cluster.node(2).committed_op_id() >= committed_id
    })
    .await;
    assert!(cluster.node(3).committed_op_id().is_min());

    // The silent node catches up once it is reachable again.
    cluster.mesh.unsilence(PeerId::new(3));
    wait_until("node 3 catches up", Duration::from_secs(5), || {
        cluster.node(3).committed_op_id() >= committed_id
    })
    .await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_leader_steps_down_on_higher_term() {
    let cluster = build_cluster(&voters(3), &[1, 2, 3]).await;

    cluster.node(1).start_election(ElectionMode::NormalElection).unwrap();
    wait_until("node 1 leads term 1", Duration::from_secs(5), || {
        cluster.node(1).role_and_term() == (Role::Leader, TermId::new(1))
    })
    .await;
    wait_until("term 1 no-op commits", Duration::from_secs(5), || {
        !cluster.node(1).committed_op_id().is_min()
    })
    .await;

    // Node 2 usurps with a higher term (leadership-transfer style, so
    // live-leader protection does not apply).
    cluster.node(2).start_election(ElectionMode::ElectLeaderNow).unwrap();
    wait_until("node 2 leads term 2", Duration::from_secs(5), || {
        cluster.node(2).role_and_term() == (Role::Leader, TermId::new(2))
    })
    .await;

    // Node 1's own exchanges carry back INVALID_TERM with the higher
    // responder term, and it becomes a follower.
    wait_until("node 1 steps down", Duration::from_secs(5), || {
        let (role, term) = cluster.node(1).role_and_term();
        role == Role::Follower && term == TermId::new(2)
    })
    .await;
    assert_eq!(cluster.node(1).leader_hint(), Some(PeerId::new(2)));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stepdown_rejected_when_nominee_behind() {
    let cluster = build_cluster(&voters(3), &[1, 2, 3]).await;
    cluster.mesh.silence(PeerId::new(3));

    cluster.node(1).start_election(ElectionMode::NormalElection).unwrap();
    wait_until("node 1 becomes leader", Duration::from_secs(5), || {
        cluster.node(1).role_and_term().0 == Role::Leader
    })
    .await;
    wait_until("no-op commits", Duration::from_secs(5), || {
        !cluster.node(1).committed_op_id().is_min()
    })
    .await;

    // Node 3 has never acked anything: not a viable successor.
    let err = cluster.node(1).step_down(Some(PeerId::new(3))).unwrap_err();
    assert!(err.is_illegal_state(), "unexpected error: {err}");
    assert_eq!(cluster.node(1).role_and_term().0, Role::Leader);

    // A caught-up nominee is accepted and the old leader becomes a
    // replica. Retry until the leader's queue has seen node 2's ack.
    wait_until("node 2 catches up", Duration::from_secs(5), || {
        cluster.node(2).last_received_op_id() >= cluster.node(1).last_received_op_id()
    })
    .await;
    wait_until("stepdown accepted", Duration::from_secs(5), || {
        cluster.node(1).step_down(Some(PeerId::new(2))).is_ok()
    })
    .await;
    assert_ne!(cluster.node(1).role_and_term().0, Role::Leader);

    // The nominee runs its transfer election and wins.
    wait_until("node 2 takes over", Duration::from_secs(5), || {
        cluster.node(2).role_and_term().0 == Role::Leader
    })
    .await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pre_voter_is_promoted_after_catching_up() {
    // Nodes 1 and 2 form the initial config; node 4 joins later.
    let initial = voters(2);
    let cluster = build_cluster(&initial, &[1, 2, 4]).await;

    cluster.node(1).start_election(ElectionMode::NormalElection).unwrap();
    wait_until("node 1 becomes leader", Duration::from_secs(5), || {
        cluster.node(1).role_and_term().0 == Role::Leader
    })
    .await;
    wait_until("no-op commits", Duration::from_secs(5), || {
        !cluster.node(1).committed_op_id().is_min()
    })
    .await;

    let add = ChangeConfigRequest {
        change_type: ChangeConfigType::AddServer,
        server: RaftPeer::new(PeerId::new(4), "127.0.0.1:9004", MemberType::PreVoter),
        cas_config_opid_index: None,
    };
    cluster.node(1).change_config(add, None).unwrap();

    // The add commits, then the sender notices node 4 caught up and
    // promotes it to a full voter.
    wait_until("node 4 becomes a voter", Duration::from_secs(10), || {
        cluster
            .node(1)
            .committed_config()
            .peer(PeerId::new(4))
            .is_some_and(|p| p.member_type == MemberType::Voter)
    })
    .await;

    // The new voter's replica also has the promoted config committed.
    wait_until("node 4 sees itself as voter", Duration::from_secs(10), || {
        cluster
            .node(4)
            .committed_config()
            .peer(PeerId::new(4))
            .is_some_and(|p| p.member_type == MemberType::Voter)
    })
    .await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn add_server_rejects_plain_voter() {
    let cluster = build_cluster(&voters(3), &[1, 2, 3]).await;
    cluster.node(1).start_election(ElectionMode::NormalElection).unwrap();
    wait_until("leader ready", Duration::from_secs(5), || {
        cluster.node(1).role_and_term().0 == Role::Leader
            && !cluster.node(1).committed_op_id().is_min()
    })
    .await;

    let add = ChangeConfigRequest {
        change_type: ChangeConfigType::AddServer,
        server: RaftPeer::voter(PeerId::new(9), "127.0.0.1:9009"),
        cas_config_opid_index: None,
    };
    let err = cluster.node(1).change_config(add, None).unwrap_err();
    assert!(err.is_invalid_argument());

    let remove_self = ChangeConfigRequest {
        change_type: ChangeConfigType::RemoveServer,
        server: RaftPeer::voter(PeerId::new(1), ""),
        cas_config_opid_index: None,
    };
    let err = cluster.node(1).change_config(remove_self, None).unwrap_err();
    assert!(err.is_invalid_argument());

    let bad_cas = ChangeConfigRequest {
        change_type: ChangeConfigType::RemoveServer,
        server: RaftPeer::voter(PeerId::new(3), ""),
        cas_config_opid_index: Some(LogIndex::new(999)),
    };
    let err = cluster.node(1).change_config(bad_cas, None).unwrap_err();
    assert!(err.is_illegal_state());
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn update_replay_is_idempotent() {
    let cluster = build_cluster(&voters(3), &[1, 2, 3]).await;
    cluster.node(1).start_election(ElectionMode::NormalElection).unwrap();
    wait_until("leader ready", Duration::from_secs(5), || {
        cluster.node(1).role_and_term().0 == Role::Leader
            && !cluster.node(1).committed_op_id().is_min()
    })
    .await;
    let done = submit_write(cluster.node(1), b"idempotent");
    let committed_id = done.await.unwrap().unwrap();
    wait_until("node 2 catches up", Duration::from_secs(5), || {
        cluster.node(2).committed_op_id() >= committed_id
    })
    .await;

    // Build a replay of everything the leader has and deliver it twice.
    let reader = cluster.nodes[&PeerId::new(1)].log.reader();
    let last = cluster.node(1).last_received_op_id();
    let ops = reader
        .read_replicates_in_range(LogIndex::new(1), last.index, usize::MAX)
        .unwrap();
    let request = ConsensusRequest {
        caller_id: PeerId::new(1),
        caller_term: TermId::new(1),
        tablet_id: TABLET,
        dest_id: PeerId::new(2),
        preceding_id: OpId::MIN,
        ops,
        committed_index: committed_id.index,
        propagated_hybrid_time: None,
        propagated_safe_time: None,
        leader_lease_duration_ms: None,
        ht_lease_expiration: None,
    };

    let first = cluster.node(2).update(request.clone()).await.unwrap();
    let second = cluster.node(2).update(request).await.unwrap();
    assert!(first.status.error.is_none());
    assert!(second.status.error.is_none());
    assert_eq!(first.status.last_received, second.status.last_received);
    assert_eq!(
        first.status.last_committed_index,
        second.status.last_committed_index
    );
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn uncommitted_suffix_is_overwritten_by_new_leader() {
    use tessera_core::{HybridTime, OpType, ReplicateMsg};

    // Only node 1 runs; updates are crafted by hand.
    let cluster = build_cluster(&voters(3), &[1]).await;
    let follower = cluster.node(1);

    let entry = |term: u64, index: u64, payload: &'static [u8]| {
        ReplicateMsgRef::new(ReplicateMsg::new(
            OpId::new(TermId::new(term), LogIndex::new(index)),
            OpType::Write,
            HybridTime::from_micros(index),
            OpId::MIN,
            bytes::Bytes::from_static(payload),
        ))
    };
    let base_request = |caller: u64, term: u64, ops: Vec<ReplicateMsgRef>| ConsensusRequest {
        caller_id: PeerId::new(caller),
        caller_term: TermId::new(term),
        tablet_id: TABLET,
        dest_id: PeerId::new(1),
        preceding_id: OpId::MIN,
        ops,
        committed_index: LogIndex::new(0),
        propagated_hybrid_time: None,
        propagated_safe_time: None,
        leader_lease_duration_ms: None,
        ht_lease_expiration: None,
    };

    // The term-1 leader appends two entries; the crash happens before
    // either commits.
    let first = base_request(2, 1, vec![entry(1, 1, b"w1"), entry(1, 2, b"w2")]);
    let response = follower.update(first).await.unwrap();
    assert!(response.status.error.is_none());
    assert_eq!(
        response.status.last_received,
        OpId::new(TermId::new(1), LogIndex::new(2))
    );

    // The term-2 leader overwrites index 1 with its own no-op; the
    // follower truncates its divergent suffix.
    let second = base_request(3, 2, vec![entry(2, 1, b"noop")]);
    let response = follower.update(second).await.unwrap();
    assert!(response.status.error.is_none());
    assert_eq!(
        response.status.last_received,
        OpId::new(TermId::new(2), LogIndex::new(1))
    );
    assert_eq!(follower.committed_op_id(), OpId::MIN);

    // A replay of the dead leader's entries is refused: its term is gone.
    let replay = base_request(2, 1, vec![entry(1, 2, b"w2")]);
    let response = follower.update(replay).await.unwrap();
    let error = response.status.error.expect("stale leader must be rejected");
    assert!(matches!(
        error.code,
        tessera_consensus::ConsensusErrorCode::InvalidTerm
    ));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_term_update_gets_invalid_term() {
    let cluster = build_cluster(&voters(3), &[1, 2, 3]).await;
    cluster.node(2).start_election(ElectionMode::NormalElection).unwrap();
    wait_until("node 2 leads", Duration::from_secs(5), || {
        cluster.node(2).role_and_term().0 == Role::Leader
    })
    .await;

    // A "leader" from a lower term heartbeats node 2's follower.
    let request = ConsensusRequest {
        caller_id: PeerId::new(3),
        caller_term: TermId::new(0),
        tablet_id: TABLET,
        dest_id: PeerId::new(1),
        preceding_id: OpId::MIN,
        ops: Vec::new(),
        committed_index: LogIndex::new(0),
        propagated_hybrid_time: None,
        propagated_safe_time: None,
        leader_lease_duration_ms: None,
        ht_lease_expiration: None,
    };
    wait_until("node 1 joined term 1", Duration::from_secs(5), || {
        cluster.node(1).role_and_term().1 >= TermId::new(1)
    })
    .await;
    let response = cluster.node(1).update(request).await.unwrap();
    let status_error = response.status.error.expect("stale term must be rejected");
    assert!(matches!(
        status_error.code,
        tessera_consensus::ConsensusErrorCode::InvalidTerm
    ));
    assert!(response.responder_term >= TermId::new(1));
    cluster.shutdown().await;
}
