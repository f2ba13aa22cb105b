//! Keeps the set of open peer senders matching the active config.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tessera_core::{PeerId, Result, TabletId};
use tracing::{debug, warn};

use crate::config::ConsensusOptions;
use crate::metadata::RaftConfig;
use crate::peer::{Peer, RequestTriggerMode, RoleChangeDelegate};
use crate::proxy::PeerProxyFactory;
use crate::queue::PeerMessageQueue;

/// Opens and closes [`Peer`]s to track the active config; fans out
/// signals to all of them.
pub struct PeerManager {
    tablet_id: TabletId,
    local_peer_id: PeerId,
    options: Arc<ConsensusOptions>,
    queue: Arc<PeerMessageQueue>,
    factory: Arc<dyn PeerProxyFactory>,
    delegate: Arc<dyn RoleChangeDelegate>,
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
}

impl PeerManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new(
        tablet_id: TabletId,
        local_peer_id: PeerId,
        options: Arc<ConsensusOptions>,
        queue: Arc<PeerMessageQueue>,
        factory: Arc<dyn PeerProxyFactory>,
        delegate: Arc<dyn RoleChangeDelegate>,
    ) -> Self {
        Self {
            tablet_id,
            local_peer_id,
            options,
            queue,
            factory,
            delegate,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Opens senders for new config members and closes senders for
    /// removed ones. The local peer never gets a sender.
    ///
    /// # Errors
    /// Returns the first proxy-creation error; peers opened before the
    /// failure stay open.
    pub fn update_raft_config(&self, config: &RaftConfig) -> Result<()> {
        let mut peers = self.lock();

        let removed: Vec<PeerId> = peers
            .keys()
            .copied()
            .filter(|id| !config.contains(*id))
            .collect();
        for id in removed {
            if let Some(peer) = peers.remove(&id) {
                debug!(tablet = %self.tablet_id, peer = %id, "closing removed peer");
                tokio::spawn(async move {
                    peer.close().await;
                });
            }
        }

        for member in &config.peers {
            if member.id == self.local_peer_id || peers.contains_key(&member.id) {
                continue;
            }
            let proxy = self.factory.new_proxy(member)?;
            debug!(tablet = %self.tablet_id, peer = %member.id, addr = %member.addr, "opening peer");
            let peer = Peer::start(
                member.clone(),
                self.tablet_id,
                Arc::clone(&self.queue),
                proxy,
                Arc::clone(&self.delegate),
                Arc::clone(&self.options),
            );
            peers.insert(member.id, peer);
        }
        Ok(())
    }

    /// Signals every open peer. Individual errors are swallowed; each
    /// peer owns its own back-off.
    pub fn signal_request(&self, trigger_mode: RequestTriggerMode) {
        let peers: Vec<Arc<Peer>> = self.lock().values().cloned().collect();
        for peer in peers {
            if let Err(e) = peer.signal_request(trigger_mode) {
                warn!(
                    tablet = %self.tablet_id,
                    peer = %peer.peer_id(),
                    error = %e,
                    "failed to signal peer"
                );
            }
        }
    }

    /// Closes every open peer.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Peer>> = {
            let mut peers = self.lock();
            peers.drain().map(|(_, p)| p).collect()
        };
        for peer in drained {
            peer.close().await;
        }
    }

    /// Number of open senders.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, Arc<Peer>>> {
        self.peers.lock().expect("peer manager lock poisoned")
    }
}
