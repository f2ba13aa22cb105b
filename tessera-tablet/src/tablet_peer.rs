//! The tablet peer: one replica's lifecycle and the log-GC policy.
//!
//! Owns the write-ahead log, the consensus instance, the preparer, the
//! serial apply executor, and the storage engine. Supplies consensus with
//! the replica-operation factory, gives the engine a flush filter that
//! refuses to flush a memtable before its ops are durable in the log, and
//! computes the earliest log index GC must retain.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tessera_consensus::{
    ConsensusMetadata, ConsensusOptions, ConsensusRoundRef, FileMetadataStore, MetadataStore,
    PeerProxyFactory, RaftConfig, RaftConsensus, ReplicaOperationFactory,
};
use tessera_core::{
    Error, HybridClock, LogIndex, OpId, PeerId, ReplicateMsgRef, Result, TabletId, TermId,
};
use tessera_log::{LogOptions, LogStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::anchor::LogAnchorRegistry;
use crate::driver::{ApplyTask, ClientCallback, OperationDriver, OperationStatusInfo, OperationTracker};
use crate::operation::{Operation, WriteOperation};
use crate::preparer::{Preparer, PreparerSender};
use crate::tablet::{MemTablet, Tablet};

/// External source of a GC horizon (e.g. a transaction coordinator's
/// prepare-GC front).
pub trait GcHorizonSource: Send + Sync {
    /// The earliest log index the source still needs, if any.
    fn prepare_gc_horizon(&self) -> Option<LogIndex>;
}

/// Construction options for a tablet peer.
#[derive(Debug, Clone)]
pub struct TabletPeerOptions {
    /// This tablet's id.
    pub tablet_id: TabletId,
    /// This replica's permanent id.
    pub local_peer_id: PeerId,
    /// Data directory (WAL and consensus metadata live under it).
    pub dir: PathBuf,
    /// Consensus tuning.
    pub consensus: ConsensusOptions,
    /// Initial committed config, used on first start only.
    pub initial_config: RaftConfig,
    /// Memory soft limit for the in-memory engine.
    pub memory_soft_limit_bytes: usize,
    /// WAL segment rotation size.
    pub max_log_segment_bytes: u64,
}

impl TabletPeerOptions {
    /// Creates options with defaults for the given identity and config.
    #[must_use]
    pub fn new(
        tablet_id: TabletId,
        local_peer_id: PeerId,
        dir: impl Into<PathBuf>,
        initial_config: RaftConfig,
    ) -> Self {
        Self {
            tablet_id,
            local_peer_id,
            dir: dir.into(),
            consensus: ConsensusOptions::new(),
            initial_config,
            memory_soft_limit_bytes: 256 * 1024 * 1024,
            max_log_segment_bytes: 64 * 1024 * 1024,
        }
    }

    /// Overrides the consensus options.
    #[must_use]
    pub fn with_consensus(mut self, consensus: ConsensusOptions) -> Self {
        self.consensus = consensus;
        self
    }

    /// Overrides the WAL segment rotation size.
    #[must_use]
    pub const fn with_max_log_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_log_segment_bytes = bytes;
        self
    }
}

/// The factory consensus uses to start replica-side operations.
struct TabletReplicaOperationFactory {
    tablet: Arc<dyn Tablet>,
    tracker: Arc<OperationTracker>,
    apply_tx: mpsc::UnboundedSender<ApplyTask>,
    preparer: Mutex<Option<PreparerSender>>,
}

impl ReplicaOperationFactory for TabletReplicaOperationFactory {
    fn start_replica_operation(&self, msg: ReplicateMsgRef) -> Result<ConsensusRoundRef> {
        let driver = OperationDriver::new_replica(
            msg,
            Arc::clone(&self.tablet),
            Arc::clone(&self.tracker),
            self.apply_tx.clone(),
        )?;
        let round = driver.round();
        let sender = self
            .preparer
            .lock()
            .expect("factory lock poisoned")
            .clone()
            .ok_or_else(|| Error::illegal_state("tablet peer is not running"))?;
        sender.submit(driver)?;
        Ok(round)
    }

    fn check_memory_pressure(&self) -> Result<()> {
        self.tablet.check_memory_pressure()
    }
}

/// One tablet replica.
pub struct TabletPeer {
    tablet_id: TabletId,
    local_peer_id: PeerId,
    tablet: Arc<MemTablet>,
    log: Arc<LogStore>,
    consensus: Arc<RaftConsensus>,
    preparer: Preparer,
    tracker: Arc<OperationTracker>,
    anchors: Arc<LogAnchorRegistry>,
    clock: Arc<HybridClock>,
    apply_tx: mpsc::UnboundedSender<ApplyTask>,
    apply_task: Mutex<Option<JoinHandle<()>>>,
    gc_horizon: Mutex<Option<Arc<dyn GcHorizonSource>>>,
}

impl TabletPeer {
    /// Opens (or recovers) the tablet peer: the log is replayed, entries
    /// above the committed prefix are re-registered as pending rounds,
    /// and consensus starts as a follower.
    ///
    /// # Errors
    /// Log or metadata recovery failures.
    pub async fn start(
        options: TabletPeerOptions,
        proxy_factory: Arc<dyn PeerProxyFactory>,
    ) -> Result<Arc<Self>> {
        options.consensus.validate()?;

        let log = LogStore::open(
            options.tablet_id,
            LogOptions::new(options.dir.join("wal"))
                .with_max_segment_bytes(options.max_log_segment_bytes),
        )
        .await
        .map_err(tessera_core::Error::from)?;

        let tablet = Arc::new(MemTablet::new(options.memory_soft_limit_bytes));
        {
            let log = Arc::clone(&log);
            tablet.set_flush_filter(Box::new(move |max_op| max_op <= log.durable_op_id()));
        }

        let tracker = OperationTracker::new();
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let apply_task = tokio::spawn(run_apply_executor(apply_rx));

        let factory = Arc::new(TabletReplicaOperationFactory {
            tablet: Arc::clone(&tablet) as Arc<dyn Tablet>,
            tracker: Arc::clone(&tracker),
            apply_tx: apply_tx.clone(),
            preparer: Mutex::new(None),
        });

        let store = Arc::new(FileMetadataStore::new(options.dir.join("cmeta")));
        let meta = match store.load()? {
            Some(meta) => meta,
            None => ConsensusMetadata::new(options.initial_config.clone()),
        };

        let clock = Arc::new(HybridClock::new());
        let consensus_options = Arc::new(options.consensus.clone());
        let consensus = RaftConsensus::create(
            options.tablet_id,
            options.local_peer_id,
            Arc::clone(&consensus_options),
            meta,
            store,
            Arc::clone(&log),
            Arc::clone(&clock),
            proxy_factory,
            Arc::clone(&factory) as Arc<dyn ReplicaOperationFactory>,
        );

        let preparer = Preparer::start(
            Arc::clone(&consensus),
            options.consensus.max_group_replicate_batch_size,
            options.consensus.prepare_queue_max_size,
        );
        *factory.preparer.lock().expect("factory lock poisoned") = Some(preparer.sender());

        // Hand recovered, uncommitted entries back to consensus as pending
        // rounds; their applies rebuild the in-memory engine state once a
        // leader re-establishes the commit point.
        let last_in_wal = log.durable_op_id();
        let recovered = match log.reader().first_retained_index() {
            Some(first) if last_in_wal.index.get() > 0 => log
                .reader()
                .read_replicates_in_range(first, last_in_wal.index, usize::MAX)
                .map_err(tessera_core::Error::from)?,
            _ => Vec::new(),
        };
        consensus.start_with_recovered(last_in_wal, OpId::MIN, recovered)?;

        let peer = Arc::new(Self {
            tablet_id: options.tablet_id,
            local_peer_id: options.local_peer_id,
            tablet,
            log,
            consensus,
            preparer,
            tracker,
            anchors: LogAnchorRegistry::new(),
            clock,
            apply_tx,
            apply_task: Mutex::new(Some(apply_task)),
            gc_horizon: Mutex::new(None),
        });
        info!(
            tablet = %peer.tablet_id,
            peer = %peer.local_peer_id,
            last_in_wal = %last_in_wal,
            "tablet peer started"
        );
        Ok(peer)
    }

    /// The tablet id.
    #[must_use]
    pub const fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    /// This replica's id.
    #[must_use]
    pub const fn peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// The consensus instance.
    #[must_use]
    pub fn consensus(&self) -> &Arc<RaftConsensus> {
        &self.consensus
    }

    /// The storage engine.
    #[must_use]
    pub fn tablet(&self) -> &Arc<MemTablet> {
        &self.tablet
    }

    /// The write-ahead log.
    #[must_use]
    pub fn log(&self) -> &Arc<LogStore> {
        &self.log
    }

    /// The log-anchor registry.
    #[must_use]
    pub fn anchor_registry(&self) -> &Arc<LogAnchorRegistry> {
        &self.anchors
    }

    /// The hybrid clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    /// Installs an external GC-horizon source.
    pub fn set_gc_horizon_source(&self, source: Arc<dyn GcHorizonSource>) {
        *self.gc_horizon.lock().expect("gc horizon lock poisoned") = Some(source);
    }

    /// Submits a client write on the leader. The callback fires with the
    /// committed op id after apply, or the failure.
    ///
    /// # Errors
    /// `IllegalState` with a leader hint when this replica is not leader,
    /// `ServiceUnavailable` on prepare-queue backpressure.
    pub fn submit_write(&self, write: WriteOperation, callback: ClientCallback) -> Result<()> {
        self.submit_operation(Operation::Write(write), callback)
    }

    /// Submits any leader-side operation.
    ///
    /// # Errors
    /// See [`submit_write`](Self::submit_write).
    pub fn submit_operation(&self, operation: Operation, callback: ClientCallback) -> Result<()> {
        let term = self.leader_term_or_hint()?;
        let driver = OperationDriver::new_leader(
            operation,
            term,
            Arc::clone(&self.tablet) as Arc<dyn Tablet>,
            Arc::clone(&self.tracker),
            self.apply_tx.clone(),
            Some(callback),
        );
        self.preparer.submit(driver)
    }

    fn leader_term_or_hint(&self) -> Result<TermId> {
        self.consensus.leader_term().ok_or_else(|| {
            match self.consensus.leader_hint() {
                Some(leader) => {
                    Error::illegal_state(format!("not the leader; try {leader}"))
                }
                None => Error::illegal_state("not the leader; no leader known"),
            }
        })
    }

    /// Status of every in-flight operation driver.
    #[must_use]
    pub fn in_flight_operations(&self) -> Vec<OperationStatusInfo> {
        self.tracker.statuses()
    }

    /// The earliest log index that must be retained: the minimum over the
    /// latest entry, the anchor registry, in-flight operations, the
    /// external GC horizon, the engine's flush fronts, and the committed
    /// op id.
    ///
    /// # Errors
    /// Engine errors from the flush-front query.
    pub fn earliest_needed_log_index(&self) -> Result<LogIndex> {
        // The latest entry bounds the computation and is the trivial
        // anchor for an empty log.
        let mut min_index = self.log.latest_entry_op_id().index;
        if min_index.get() == 0 {
            return Ok(min_index);
        }

        if let Some(anchored) = self.anchors.earliest_anchored_index() {
            min_index = min_index.min(anchored);
        }

        if let Some(in_flight) = self.tracker.min_pending_op_index() {
            min_index = min_index.min(in_flight);
        }

        let horizon = self
            .gc_horizon
            .lock()
            .expect("gc horizon lock poisoned")
            .as_ref()
            .and_then(|s| s.prepare_gc_horizon());
        if let Some(horizon) = horizon {
            min_index = min_index.min(horizon);
        }

        // Writes newer than the engine's persistent front are only
        // recoverable from the log.
        let last_committed_write = self.tablet.last_committed_write_index();
        let max_persistent = self.tablet.max_persistent_op_id()?.index;
        if max_persistent < last_committed_write {
            min_index = min_index.min(max_persistent);
        }

        // Keep at least one committed op for bootstrap to recover safe
        // time from.
        min_index = min_index.min(self.consensus.committed_op_id().index);

        Ok(min_index)
    }

    /// Runs log GC up to the earliest needed index. Returns the number of
    /// segments reclaimed.
    ///
    /// # Errors
    /// GC-policy or filesystem errors.
    pub fn run_log_gc(&self) -> Result<usize> {
        let min_index = self.earliest_needed_log_index()?;
        let removed = self.log.gc(min_index).map_err(tessera_core::Error::from)?;
        if removed > 0 {
            debug!(
                tablet = %self.tablet_id,
                min_index = min_index.get(),
                removed,
                "log gc reclaimed segments"
            );
        }
        Ok(removed)
    }

    /// For each reclaimable sealed segment, its max op index and size.
    #[must_use]
    pub fn reclaimable_segments(&self) -> Vec<(LogIndex, u64)> {
        let min_index = self.earliest_needed_log_index().unwrap_or(LogIndex::new(0));
        self.log.reader().max_indexes_to_segment_size(min_index)
    }

    /// Flushes engine memtables permitted by the flush filter.
    ///
    /// # Errors
    /// Engine errors.
    pub fn flush_tablet(&self) -> Result<usize> {
        self.tablet.flush()
    }

    /// Shuts the peer down: the preparer drains, consensus aborts pending
    /// rounds, the apply executor stops, the log closes.
    pub async fn shutdown(&self) {
        self.preparer.stop().await;
        self.consensus.shutdown().await;
        if let Some(task) = self.apply_task.lock().expect("apply lock poisoned").take() {
            task.abort();
        }
        self.log.close().await;
        info!(tablet = %self.tablet_id, peer = %self.local_peer_id, "tablet peer shut down");
    }
}

/// The serial apply executor: committed operations apply in submission
/// (index) order.
async fn run_apply_executor(mut rx: mpsc::UnboundedReceiver<ApplyTask>) {
    while let Some(task) = rx.recv().await {
        task.driver.apply(task.op_id);
    }
}
