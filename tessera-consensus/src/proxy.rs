//! The transport seam.
//!
//! A [`PeerProxy`] issues asynchronous calls to one remote peer; the
//! factory mints proxies from peer descriptors. Production wires these to
//! the RPC client; tests use an in-process mesh.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tessera_core::{Error, PeerId, Result};
use tracing::debug;

use crate::metadata::RaftPeer;
use crate::rpc::{
    ConsensusRequest, ConsensusResponse, LeaderElectionLostRequest, RunLeaderElectionRequest,
    StartRemoteBootstrapRequest, VoteRequest, VoteResponse,
};

/// Asynchronous calls to one remote peer.
#[async_trait]
pub trait PeerProxy: Send + Sync {
    /// Sends an `UpdateConsensus` request.
    async fn update(&self, request: ConsensusRequest) -> Result<ConsensusResponse>;

    /// Sends a `RequestVote` request.
    async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse>;

    /// Asks the peer to start an election (leadership transfer).
    async fn run_leader_election(&self, request: RunLeaderElectionRequest) -> Result<()>;

    /// Reports a lost protégé election back to the originator.
    async fn leader_election_lost(&self, request: LeaderElectionLostRequest) -> Result<()>;

    /// Kicks off remote bootstrap on the peer. Fire-and-forget semantics:
    /// callers ignore everything but transport-level failure.
    async fn start_remote_bootstrap(&self, request: StartRemoteBootstrapRequest) -> Result<()>;

    /// Returns the peer's permanent id (used to resolve address-only
    /// peer descriptors).
    async fn fetch_server_id(&self) -> Result<PeerId>;
}

/// Mints proxies from peer descriptors.
pub trait PeerProxyFactory: Send + Sync {
    /// Creates a proxy to the given peer.
    ///
    /// # Errors
    /// Returns an error if the peer's address cannot be resolved.
    fn new_proxy(&self, peer: &RaftPeer) -> Result<Arc<dyn PeerProxy>>;
}

/// Resolves the permanent id of a peer known only by address, retrying
/// with exponential back-off plus jitter until `deadline`.
///
/// # Errors
/// `TimedOut` if the peer does not answer before the deadline.
pub async fn resolve_permanent_peer_id(
    factory: &dyn PeerProxyFactory,
    peer: &RaftPeer,
    deadline: Instant,
) -> Result<PeerId> {
    let mut backoff = Duration::from_millis(100);
    let max_backoff = Duration::from_secs(3);
    let mut last_error = None;

    while Instant::now() < deadline {
        match try_fetch_id(factory, peer).await {
            Ok(id) => return Ok(id),
            Err(e) => {
                debug!(addr = %peer.addr, error = %e, "permanent-id resolution attempt failed");
                last_error = Some(e);
            }
        }

        let jitter_ms = rand::thread_rng().gen_range(0..=(backoff.as_millis() as u64 / 2).max(1));
        let sleep = (backoff + Duration::from_millis(jitter_ms)).min(
            deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1)),
        );
        tokio::time::sleep(sleep).await;
        backoff = (backoff * 2).min(max_backoff);
    }

    Err(Error::timed_out(format!(
        "resolving permanent id for {}: {}",
        peer.addr,
        last_error.map_or_else(|| "no attempt completed".to_string(), |e| e.to_string())
    )))
}

async fn try_fetch_id(factory: &dyn PeerProxyFactory, peer: &RaftPeer) -> Result<PeerId> {
    factory.new_proxy(peer)?.fetch_server_id().await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FlakyProxy {
        attempts: Arc<AtomicUsize>,
        succeed_after: usize,
        id: PeerId,
    }

    #[async_trait]
    impl PeerProxy for FlakyProxy {
        async fn update(&self, _request: ConsensusRequest) -> Result<ConsensusResponse> {
            Err(Error::remote("unused"))
        }
        async fn request_vote(&self, _request: VoteRequest) -> Result<VoteResponse> {
            Err(Error::remote("unused"))
        }
        async fn run_leader_election(&self, _request: RunLeaderElectionRequest) -> Result<()> {
            Err(Error::remote("unused"))
        }
        async fn leader_election_lost(&self, _request: LeaderElectionLostRequest) -> Result<()> {
            Err(Error::remote("unused"))
        }
        async fn start_remote_bootstrap(
            &self,
            _request: StartRemoteBootstrapRequest,
        ) -> Result<()> {
            Err(Error::remote("unused"))
        }
        async fn fetch_server_id(&self) -> Result<PeerId> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n + 1 >= self.succeed_after {
                Ok(self.id)
            } else {
                Err(Error::remote("connection refused"))
            }
        }
    }

    struct FlakyFactory {
        attempts: Arc<AtomicUsize>,
        succeed_after: usize,
    }

    impl PeerProxyFactory for FlakyFactory {
        fn new_proxy(&self, peer: &RaftPeer) -> Result<Arc<dyn PeerProxy>> {
            Ok(Arc::new(FlakyProxy {
                attempts: Arc::clone(&self.attempts),
                succeed_after: self.succeed_after,
                id: peer.id,
            }))
        }
    }

    #[tokio::test]
    async fn test_resolution_retries_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let factory = FlakyFactory {
            attempts: Arc::clone(&attempts),
            succeed_after: 3,
        };
        let peer = RaftPeer::voter(PeerId::new(7), "10.0.0.7:9100");

        let id = resolve_permanent_peer_id(
            &factory,
            &peer,
            Instant::now() + Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(id, PeerId::new(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_resolution_times_out() {
        let factory = FlakyFactory {
            attempts: Arc::new(AtomicUsize::new(0)),
            succeed_after: usize::MAX,
        };
        let peer = RaftPeer::voter(PeerId::new(7), "10.0.0.7:9100");

        let err = resolve_permanent_peer_id(
            &factory,
            &peer,
            Instant::now() + Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert!(err.is_timed_out());
    }
}
