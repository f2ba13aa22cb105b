//! The per-tablet preparer pipeline.
//!
//! A single worker drains a bounded queue of operation drivers. Leader-
//! side drivers accumulate into a batch that is flushed when it reaches
//! the configured size, when the next item is bound to a different term,
//! or when an item must be applied separately (schema changes and the
//! safe-time propagation op run in a batch of their own). Replica-side
//! drivers bypass batching: the current batch flushes first, then the
//! item's prepare runs inline.
//!
//! A flush walks the batch calling `prepare_and_start` on each item,
//! replicating each run of consecutive successes as one `ReplicateBatch`;
//! a failed item is failed individually and the walk continues. If the
//! replicate call itself fails, every item of that sub-batch fails with
//! its status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tessera_consensus::{ConsensusRoundRef, RaftConsensus};
use tessera_core::{Error, OpType, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::driver::OperationDriver;

pub(crate) enum PrepareItem {
    Operation(Arc<OperationDriver>),
    Shutdown(tokio::sync::oneshot::Sender<()>),
}

/// Handle to the per-tablet preparer worker.
pub struct Preparer {
    tx: mpsc::Sender<PrepareItem>,
    stopped: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
}

impl Preparer {
    /// Spawns the worker.
    #[must_use]
    pub fn start(
        consensus: Arc<RaftConsensus>,
        max_batch_size: usize,
        queue_capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let worker = tokio::spawn(run_worker(consensus, rx, max_batch_size));
        Self {
            tx,
            stopped: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(Some(worker)),
            capacity: queue_capacity,
        }
    }

    /// A submission handle for the replica-operation factory.
    #[must_use]
    pub(crate) fn sender(&self) -> PreparerSender {
        PreparerSender {
            tx: self.tx.clone(),
            stopped: Arc::clone(&self.stopped),
            capacity: self.capacity,
        }
    }

    /// Submits a driver.
    ///
    /// # Errors
    /// `IllegalState` after stop, `ServiceUnavailable` when the queue is
    /// full.
    pub fn submit(&self, driver: Arc<OperationDriver>) -> Result<()> {
        submit_item(&self.tx, &self.stopped, self.capacity, driver)
    }

    /// Stops accepting work, drains the queue, and joins the worker.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let (ack, done) = tokio::sync::oneshot::channel();
        if self.tx.send(PrepareItem::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
        let worker = self.worker.lock().expect("preparer lock poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

/// Clonable submission handle held by the replica-operation factory.
#[derive(Clone)]
pub(crate) struct PreparerSender {
    tx: mpsc::Sender<PrepareItem>,
    stopped: Arc<AtomicBool>,
    capacity: usize,
}

impl PreparerSender {
    pub(crate) fn submit(&self, driver: Arc<OperationDriver>) -> Result<()> {
        submit_item(&self.tx, &self.stopped, self.capacity, driver)
    }
}

fn submit_item(
    tx: &mpsc::Sender<PrepareItem>,
    stopped: &AtomicBool,
    capacity: usize,
    driver: Arc<OperationDriver>,
) -> Result<()> {
    if stopped.load(Ordering::Acquire) {
        return Err(Error::illegal_state("tablet is shutting down"));
    }
    match tx.try_send(PrepareItem::Operation(driver)) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => Err(Error::service_unavailable(format!(
            "prepare queue is full (capacity {capacity})"
        ))),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(Error::illegal_state("prepare queue is closed"))
        }
    }
}

async fn run_worker(
    consensus: Arc<RaftConsensus>,
    mut rx: mpsc::Receiver<PrepareItem>,
    max_batch_size: usize,
) {
    let mut batch: Vec<Arc<OperationDriver>> = Vec::with_capacity(max_batch_size);
    loop {
        let Some(item) = rx.recv().await else {
            break;
        };
        let mut shutdown_ack = None;
        match item {
            PrepareItem::Operation(driver) => process_item(&consensus, &mut batch, max_batch_size, driver),
            PrepareItem::Shutdown(ack) => shutdown_ack = Some(ack),
        }
        // Drain whatever queued up while we were busy, then flush.
        while shutdown_ack.is_none() {
            match rx.try_recv() {
                Ok(PrepareItem::Operation(driver)) => {
                    process_item(&consensus, &mut batch, max_batch_size, driver);
                }
                Ok(PrepareItem::Shutdown(ack)) => shutdown_ack = Some(ack),
                Err(_) => break,
            }
        }
        flush_batch(&consensus, &mut batch);
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
            break;
        }
    }
    flush_batch(&consensus, &mut batch);
    debug!("preparer worker stopped");
}

fn process_item(
    consensus: &Arc<RaftConsensus>,
    batch: &mut Vec<Arc<OperationDriver>>,
    max_batch_size: usize,
    driver: Arc<OperationDriver>,
) {
    if driver.is_leader_side() {
        // Schema changes take the engine's schema latch in prepare, so two
        // of them must never share a batch; the safe-time op likewise runs
        // alone.
        let apply_separately = matches!(driver.op_type(), OpType::AlterSchema | OpType::Empty);
        let bound_term = driver.round().bound_term();
        let breaks_batch = batch.len() >= max_batch_size
            || batch
                .last()
                .is_some_and(|last| last.round().bound_term() != bound_term);
        if breaks_batch {
            flush_batch(consensus, batch);
        }
        batch.push(driver);
        if apply_separately {
            flush_batch(consensus, batch);
        }
    } else {
        // Replica-side items run inline, after the pending leader batch.
        flush_batch(consensus, batch);
        if let Err(e) = driver.prepare_and_start() {
            warn!(error = %e, "replica operation failed to prepare");
            driver.handle_failure(e);
        }
    }
}

fn flush_batch(consensus: &Arc<RaftConsensus>, batch: &mut Vec<Arc<OperationDriver>>) {
    if batch.is_empty() {
        return;
    }
    trace!(size = batch.len(), "flushing leader-side prepare batch");

    let mut sub_batch: Vec<Arc<OperationDriver>> = Vec::with_capacity(batch.len());
    for driver in batch.drain(..) {
        match driver.prepare_and_start() {
            Ok(()) => sub_batch.push(driver),
            Err(e) => {
                // Replicate what we have, fail this one, keep going.
                replicate_sub_batch(consensus, &mut sub_batch);
                debug!(error = %e, "leader operation failed to prepare");
                driver.handle_failure(e);
            }
        }
    }
    replicate_sub_batch(consensus, &mut sub_batch);
}

fn replicate_sub_batch(consensus: &Arc<RaftConsensus>, sub_batch: &mut Vec<Arc<OperationDriver>>) {
    if sub_batch.is_empty() {
        return;
    }
    let rounds: Vec<ConsensusRoundRef> = sub_batch.iter().map(|d| d.round()).collect();
    if let Err(e) = consensus.replicate_batch(&rounds) {
        warn!(
            error = %e,
            count = sub_batch.len(),
            "replicate batch failed; failing every operation in it"
        );
        for driver in sub_batch.drain(..) {
            driver.handle_failure(e.clone());
        }
        return;
    }
    sub_batch.clear();
}
