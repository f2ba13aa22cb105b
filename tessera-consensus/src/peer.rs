//! The per-follower sender.
//!
//! Each remote peer gets one `Peer`: a single-in-flight request loop
//! guarded by a one-permit semaphore, plus a heartbeater that fires when
//! no payload has been sent for a heartbeat interval. Responses are
//! classified where they land and heavier work happens on spawned tasks,
//! never on the transport's callback path.
//!
//! Lock ordering: the send permit is never acquired while the peer state
//! lock is held.

use std::sync::{Arc, Mutex};

use tessera_core::{Error, PeerId, Result, TabletId};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConsensusOptions;
use crate::metadata::RaftPeer;
use crate::proxy::PeerProxy;
use crate::queue::PeerMessageQueue;
use crate::rpc::TabletServerErrorCode;

/// How a signal should treat an empty payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTriggerMode {
    /// Send even if the queue has nothing for the peer (heartbeat).
    AlwaysSend,
    /// Skip the send if the payload would be empty.
    NonEmptyOnly,
}

/// Narrow capability used by a `Peer` to ask consensus to promote a
/// caught-up PRE_VOTER / PRE_OBSERVER. Keeps the peer free of a consensus
/// back-pointer.
pub trait RoleChangeDelegate: Send + Sync {
    /// Requests a CHANGE_ROLE config change for `peer`.
    fn request_role_change(&self, peer: PeerId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerLifecycle {
    /// Created; the first signal runs the initial negotiation round.
    Started,
    /// Normal operation.
    Running,
    /// Closed; new sends short-circuit.
    Closed,
}

struct PeerState {
    lifecycle: PeerLifecycle,
    failed_attempts: u64,
}

/// A single follower's sender.
pub struct Peer {
    descriptor: RaftPeer,
    tablet_id: TabletId,
    queue: Arc<PeerMessageQueue>,
    proxy: Arc<dyn PeerProxy>,
    role_delegate: Arc<dyn RoleChangeDelegate>,
    options: Arc<ConsensusOptions>,
    /// One-permit semaphore enforcing the single-in-flight discipline.
    sem: Arc<Semaphore>,
    state: Mutex<PeerState>,
    heartbeat_reset: Arc<Notify>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Creates the peer, registers it with the queue, and starts its
    /// heartbeater.
    #[must_use]
    pub fn start(
        descriptor: RaftPeer,
        tablet_id: TabletId,
        queue: Arc<PeerMessageQueue>,
        proxy: Arc<dyn PeerProxy>,
        role_delegate: Arc<dyn RoleChangeDelegate>,
        options: Arc<ConsensusOptions>,
    ) -> Arc<Self> {
        queue.track_peer(descriptor.id, descriptor.member_type);
        let peer = Arc::new(Self {
            descriptor,
            tablet_id,
            queue,
            proxy,
            role_delegate,
            options,
            sem: Arc::new(Semaphore::new(1)),
            state: Mutex::new(PeerState {
                lifecycle: PeerLifecycle::Started,
                failed_attempts: 0,
            }),
            heartbeat_reset: Arc::new(Notify::new()),
            heartbeat_task: Mutex::new(None),
        });
        peer.spawn_heartbeater();
        peer
    }

    /// The peer's id.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.descriptor.id
    }

    /// Signals that the queue may have work for this peer.
    ///
    /// If a request is already in flight this is a no-op: the running loop
    /// observes new work when the response arrives.
    ///
    /// # Errors
    /// `IllegalState` if the peer is closed.
    pub fn signal_request(self: &Arc<Self>, trigger_mode: RequestTriggerMode) -> Result<()> {
        let Ok(permit) = Arc::clone(&self.sem).try_acquire_owned() else {
            return Ok(());
        };

        let mut mode = trigger_mode;
        {
            let mut state = self.lock_state();
            match state.lifecycle {
                PeerLifecycle::Closed => {
                    return Err(Error::illegal_state("peer is closed"));
                }
                PeerLifecycle::Started => {
                    // Initial negotiation round always goes out.
                    state.lifecycle = PeerLifecycle::Running;
                    mode = RequestTriggerMode::AlwaysSend;
                }
                PeerLifecycle::Running => {}
            }
            if state.failed_attempts > 0 && mode == RequestTriggerMode::NonEmptyOnly {
                // Back off until the next heartbeat retries.
                return Ok(());
            }
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.send_requests(mode, permit).await;
        });
        Ok(())
    }

    /// The request loop: holds the permit, pipelining further requests
    /// while the queue reports the peer behind.
    async fn send_requests(
        self: Arc<Self>,
        mut mode: RequestTriggerMode,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let _permit = permit;
        loop {
            if self.is_closed() {
                return;
            }
            let data = match self.queue.request_for_peer(self.descriptor.id) {
                Ok(data) => data,
                Err(e) => {
                    debug!(
                        tablet = %self.tablet_id,
                        peer = %self.descriptor.id,
                        error = %e,
                        "no request for peer"
                    );
                    return;
                }
            };

            if let Some(bootstrap) = data.remote_bootstrap {
                info!(
                    tablet = %self.tablet_id,
                    peer = %self.descriptor.id,
                    "peer too far behind; starting remote bootstrap"
                );
                if let Err(e) = self.proxy.start_remote_bootstrap(bootstrap).await {
                    warn!(
                        tablet = %self.tablet_id,
                        peer = %self.descriptor.id,
                        error = %e,
                        "remote bootstrap kickoff failed"
                    );
                    self.record_failure();
                }
                return;
            }

            // A caught-up transition member gets promoted instead of
            // receiving another (empty) update.
            if data.last_exchange_successful
                && data.peer_caught_up
                && data.member_type.is_transition()
            {
                info!(
                    tablet = %self.tablet_id,
                    peer = %self.descriptor.id,
                    member_type = ?data.member_type,
                    "bootstrapped peer caught up; requesting role change"
                );
                self.role_delegate.request_role_change(self.descriptor.id);
                return;
            }

            if data.request.ops.is_empty() && mode == RequestTriggerMode::NonEmptyOnly {
                return;
            }

            if !data.request.ops.is_empty() {
                // Real payload counts as a heartbeat.
                self.heartbeat_reset.notify_waiters();
            }

            let response = match tokio::time::timeout(
                self.options.consensus_rpc_timeout,
                self.proxy.update(data.request),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    self.process_response_error(&e);
                    return;
                }
                Err(_) => {
                    self.process_response_error(&Error::timed_out("update rpc timed out"));
                    return;
                }
            };

            if let Some(server_error) = &response.error {
                match server_error.code {
                    TabletServerErrorCode::WrongServerId => {
                        self.queue.notify_observers_of_failed_follower(
                            self.descriptor.id,
                            format!("wrong server id: {}", server_error.message),
                        );
                        return;
                    }
                    TabletServerErrorCode::TabletNotFound => {
                        // The process answered; don't count it dead.
                        self.queue
                            .notify_peer_is_responsive_despite_error(self.descriptor.id);
                        self.record_failure();
                        return;
                    }
                }
            }

            self.clear_failures();
            let more_pending = self
                .queue
                .response_from_peer(self.descriptor.id, &response);
            if !more_pending {
                return;
            }
            mode = RequestTriggerMode::AlwaysSend;
        }
    }

    fn process_response_error(&self, error: &Error) {
        let attempts = {
            let mut state = self.lock_state();
            state.failed_attempts += 1;
            state.failed_attempts
        };
        debug!(
            tablet = %self.tablet_id,
            peer = %self.descriptor.id,
            error = %error,
            attempts,
            "peer request failed"
        );
    }

    fn record_failure(&self) {
        self.lock_state().failed_attempts += 1;
    }

    fn clear_failures(&self) {
        self.lock_state().failed_attempts = 0;
    }

    fn is_closed(&self) -> bool {
        self.lock_state().lifecycle == PeerLifecycle::Closed
    }

    /// Closes the peer: new sends short-circuit, any outstanding request
    /// is waited out (its response will be dropped), and the peer is
    /// untracked from the queue.
    pub async fn close(&self) {
        {
            let mut state = self.lock_state();
            if state.lifecycle == PeerLifecycle::Closed {
                return;
            }
            state.lifecycle = PeerLifecycle::Closed;
        }
        // Wait for the in-flight request, if any, by taking the permit.
        // Never done while holding the state lock.
        let _ = self.sem.acquire().await;
        if let Some(task) = self.heartbeat_task.lock().expect("peer lock poisoned").take() {
            task.abort();
        }
        self.queue.untrack_peer(self.descriptor.id);
        debug!(tablet = %self.tablet_id, peer = %self.descriptor.id, "peer closed");
    }

    fn spawn_heartbeater(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let reset = Arc::clone(&self.heartbeat_reset);
        let interval = self.options.raft_heartbeat_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        let Some(peer) = weak.upgrade() else { return };
                        if peer.is_closed() {
                            return;
                        }
                        let _ = peer.signal_request(RequestTriggerMode::AlwaysSend);
                    }
                    () = reset.notified() => {}
                }
            }
        });
        *self.heartbeat_task.lock().expect("peer lock poisoned") = Some(task);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PeerState> {
        self.state.lock().expect("peer state lock poisoned")
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat_task.lock().expect("peer lock poisoned").take() {
            task.abort();
        }
    }
}
