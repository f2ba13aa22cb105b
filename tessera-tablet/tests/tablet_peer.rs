//! End-to-end tablet peer tests: the single-server write path, crash
//! recovery by log replay, and the log-GC / flush coupling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tessera_consensus::{
    ConsensusOptions, ConsensusRequest, ConsensusResponse, ElectionMode,
    LeaderElectionLostRequest, PeerProxy, PeerProxyFactory, RaftConfig, RaftPeer, Role,
    RunLeaderElectionRequest, StartRemoteBootstrapRequest, VoteRequest, VoteResponse,
};
use tessera_core::{Error, LogIndex, OpId, PeerId, Result, TabletId, TermId};
use tessera_tablet::{
    AlterSchemaOperation, Operation, RowOp, Tablet, TabletPeer, TabletPeerOptions, WriteOperation,
};

/// A proxy factory for single-node tests: any attempt to reach a remote
/// peer is a bug.
struct NoRemotesFactory;

struct FailingProxy;

#[async_trait]
impl PeerProxy for FailingProxy {
    async fn update(&self, _r: ConsensusRequest) -> Result<ConsensusResponse> {
        panic!("single-node test sent an outbound update");
    }
    async fn request_vote(&self, _r: VoteRequest) -> Result<VoteResponse> {
        panic!("single-node test sent an outbound vote request");
    }
    async fn run_leader_election(&self, _r: RunLeaderElectionRequest) -> Result<()> {
        panic!("single-node test sent an outbound election trigger");
    }
    async fn leader_election_lost(&self, _r: LeaderElectionLostRequest) -> Result<()> {
        panic!("single-node test reported a lost election");
    }
    async fn start_remote_bootstrap(&self, _r: StartRemoteBootstrapRequest) -> Result<()> {
        panic!("single-node test started remote bootstrap");
    }
    async fn fetch_server_id(&self) -> Result<PeerId> {
        Err(Error::remote("no remotes"))
    }
}

impl PeerProxyFactory for NoRemotesFactory {
    fn new_proxy(&self, _peer: &RaftPeer) -> Result<Arc<dyn PeerProxy>> {
        Ok(Arc::new(FailingProxy))
    }
}

fn single_node_config(id: u64) -> RaftConfig {
    RaftConfig {
        opid_index: Some(LogIndex::new(0)),
        peers: vec![RaftPeer::voter(PeerId::new(id), "127.0.0.1:9100")],
    }
}

fn test_options(dir: &std::path::Path) -> TabletPeerOptions {
    TabletPeerOptions::new(
        TabletId::new(1),
        PeerId::new(1),
        dir,
        single_node_config(1),
    )
    .with_consensus(
        ConsensusOptions::new()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_leader_failure_detection(false),
    )
}

async fn start_peer(dir: &std::path::Path) -> Arc<TabletPeer> {
    TabletPeer::start(test_options(dir), Arc::new(NoRemotesFactory))
        .await
        .unwrap()
}

async fn elect_and_wait(peer: &Arc<TabletPeer>) {
    peer.consensus()
        .start_election(ElectionMode::NormalElection)
        .unwrap();
    wait_until("self-election", Duration::from_secs(5), || {
        peer.consensus().role_and_term().0 == Role::Leader
            && !peer.consensus().committed_op_id().is_min()
    })
    .await;
}

async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, condition: F) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn write_row(peer: &Arc<TabletPeer>, key: &'static [u8], value: &'static [u8]) -> OpId {
    let (tx, rx) = tokio::sync::oneshot::channel();
    peer.submit_write(
        WriteOperation::new(vec![RowOp::put(key, value)]),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    )
    .unwrap();
    rx.await.unwrap().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn single_server_write_commits_and_applies() {
    let dir = tempfile::tempdir().unwrap();
    let peer = start_peer(dir.path()).await;
    elect_and_wait(&peer).await;

    let op_id = write_row(&peer, b"user:1", b"alice").await;
    // The no-op holds index 1; the write lands at (1, 2).
    assert_eq!(op_id, OpId::new(TermId::new(1), LogIndex::new(2)));

    // The callback fires after apply: the row is already readable.
    assert_eq!(peer.tablet().get(b"user:1"), Some(Bytes::from_static(b"alice")));
    assert!(peer.consensus().committed_op_id() >= op_id);
    assert!(peer.in_flight_operations().is_empty());

    peer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_rejected_without_leadership() {
    let dir = tempfile::tempdir().unwrap();
    let peer = start_peer(dir.path()).await;

    let err = peer
        .submit_write(
            WriteOperation::new(vec![RowOp::put(&b"k"[..], &b"v"[..])]),
            Box::new(|_| {}),
        )
        .unwrap_err();
    assert!(err.is_illegal_state());

    peer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_replays_log_into_engine() {
    let dir = tempfile::tempdir().unwrap();
    {
        let peer = start_peer(dir.path()).await;
        elect_and_wait(&peer).await;
        write_row(&peer, b"a", b"1").await;
        write_row(&peer, b"b", b"2").await;
        peer.shutdown().await;
    }

    // A fresh peer over the same directory: the engine starts empty and
    // the WAL replays once leadership re-establishes the commit point.
    let peer = start_peer(dir.path()).await;
    assert_eq!(peer.tablet().get(b"a"), None);
    peer.consensus()
        .start_election(ElectionMode::NormalElection)
        .unwrap();
    wait_until("replay applies recovered writes", Duration::from_secs(5), || {
        peer.tablet().get(b"a") == Some(Bytes::from_static(b"1"))
            && peer.tablet().get(b"b") == Some(Bytes::from_static(b"2"))
    })
    .await;

    // The recovered metadata forced the new term past the old one.
    let (_, term) = peer.consensus().role_and_term();
    assert!(term > TermId::new(1));
    peer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn log_gc_waits_for_engine_flush() {
    let dir = tempfile::tempdir().unwrap();
    let peer = Arc::new(
        TabletPeer::start(
            test_options(dir.path()).with_max_log_segment_bytes(256),
            Arc::new(NoRemotesFactory),
        )
        .await
        .unwrap(),
    );
    elect_and_wait(&peer).await;

    for i in 0..20u8 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        peer.submit_write(
            WriteOperation::new(vec![RowOp::put(
                Bytes::from(vec![b'k', i]),
                Bytes::from(vec![0u8; 32]),
            )]),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();
        rx.await.unwrap().unwrap();
    }
    assert!(peer.log().reader().segments().len() > 1, "expected rotation");

    // Un-flushed writes pin the whole log.
    assert_eq!(peer.earliest_needed_log_index().unwrap(), LogIndex::new(0));
    assert_eq!(peer.run_log_gc().unwrap(), 0);

    // After a flush the persistent front moves and the prefix becomes
    // reclaimable.
    assert!(peer.flush_tablet().unwrap() > 0);
    let min_index = peer.earliest_needed_log_index().unwrap();
    assert_eq!(min_index, peer.consensus().committed_op_id().index);
    assert!(!peer.reclaimable_segments().is_empty());
    assert!(peer.run_log_gc().unwrap() > 0);

    // An anchor pins GC again.
    let registry = Arc::clone(peer.anchor_registry());
    let log_first = peer.log().reader().first_retained_index().unwrap();
    let anchor = registry.register(log_first, "compaction");
    assert_eq!(peer.earliest_needed_log_index().unwrap(), log_first);
    assert_eq!(peer.run_log_gc().unwrap(), 0);
    drop(anchor);

    peer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn schema_change_applies_and_bumps_version() {
    let dir = tempfile::tempdir().unwrap();
    let peer = start_peer(dir.path()).await;
    elect_and_wait(&peer).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    peer.submit_operation(
        Operation::AlterSchema(AlterSchemaOperation {
            schema_version: 1,
            schema: Bytes::from_static(b"add col c"),
        }),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    )
    .unwrap();
    rx.await.unwrap().unwrap();
    assert_eq!(peer.tablet().schema_version(), 1);

    // A non-advancing version fails in prepare, before replication.
    let (tx, rx) = tokio::sync::oneshot::channel();
    peer.submit_operation(
        Operation::AlterSchema(AlterSchemaOperation {
            schema_version: 1,
            schema: Bytes::from_static(b"dup"),
        }),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    )
    .unwrap();
    let err = rx.await.unwrap().unwrap_err();
    assert!(err.is_invalid_argument());

    peer.shutdown().await;
}
