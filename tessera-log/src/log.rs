//! The log store: append path, durability tracking, truncation and GC.
//!
//! A single appender task owns the active segment file. Callers enqueue
//! batches (and truncations) on a command channel; the task applies them in
//! submission order, fsyncs, publishes the durable watermark, and fires the
//! batch's durability callback exactly once. Append failure is fatal: the
//! log has promised ordering and cannot continue past a lost write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tessera_core::{AtomicOpId, LogIndex, OpId, ReplicateMsgRef, TabletId};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{LogError, LogResult};
use crate::index::LogIndexMap;
use crate::reader::LogReader;
use crate::segment::{Segment, SegmentHeader, SegmentId};

/// Log configuration.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Directory for segment files.
    pub dir: PathBuf,
    /// Size at which the active segment is sealed and rotated.
    pub max_segment_bytes: u64,
    /// Maximum number of batches waiting in the append queue.
    pub append_queue_size: usize,
}

impl LogOptions {
    /// Creates options with defaults for the given directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_segment_bytes: 64 * 1024 * 1024,
            append_queue_size: 1024,
        }
    }

    /// Sets the segment rotation size.
    #[must_use]
    pub const fn with_max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    /// Sets the append queue capacity.
    #[must_use]
    pub const fn with_append_queue_size(mut self, size: usize) -> Self {
        self.append_queue_size = size;
        self
    }
}

/// Callback invoked exactly once when a batch is durable (or has failed).
pub type DurableCallback = Box<dyn FnOnce(tessera_core::Result<()>) + Send>;

/// Shared in-memory view of the segment list.
pub(crate) struct LogState {
    pub(crate) segments: BTreeMap<SegmentId, Segment>,
    pub(crate) index: LogIndexMap,
    pub(crate) active: SegmentId,
}

impl LogState {
    pub(crate) fn entry_at(&self, index: LogIndex) -> Option<&ReplicateMsgRef> {
        let loc = self.index.lookup(index)?;
        self.segments.get(&loc.segment)?.entry_at(index)
    }
}

enum LogCommand {
    Append {
        msgs: Vec<ReplicateMsgRef>,
        on_durable: DurableCallback,
    },
    TruncateAfter {
        index: LogIndex,
        ack: oneshot::Sender<()>,
    },
    Sync {
        ack: oneshot::Sender<()>,
    },
}

/// The tablet's write-ahead log.
pub struct LogStore {
    tablet_id: TabletId,
    options: LogOptions,
    state: Arc<Mutex<LogState>>,
    latest: Arc<AtomicOpId>,
    durable_rx: watch::Receiver<OpId>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<LogCommand>>>,
    inflight_batches: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogStore {
    /// Opens (or creates) the log in the configured directory, recovering
    /// any existing segments. A torn tail in the newest segment is
    /// truncated.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or a segment
    /// header is unreadable.
    pub async fn open(tablet_id: TabletId, options: LogOptions) -> LogResult<Arc<Self>> {
        tokio::fs::create_dir_all(&options.dir)
            .await
            .map_err(|e| LogError::io("create log dir", e))?;

        let mut segments = BTreeMap::new();
        let mut index = LogIndexMap::new();
        let mut last_op = OpId::MIN;
        let mut next_seqno = SegmentId::new(1);

        let mut paths = list_segment_files(&options.dir)?;
        paths.sort();
        for path in &paths {
            let data = tokio::fs::read(path)
                .await
                .map_err(|e| LogError::io("read segment", e))?;
            let mut segment = Segment::decode(bytes::Bytes::from(data))?;
            segment.seal();
            if segment.seqno() >= next_seqno {
                next_seqno = segment.seqno().next();
            }
            for pos in 0.. {
                let idx = LogIndex::new(segment.first_index().get() + pos);
                let Some(entry) = segment.entry_at(idx) else {
                    break;
                };
                let offset = segment.offset_at(idx).unwrap_or(0);
                last_op = entry.id;
                index.insert(idx, segment.seqno(), offset);
            }
            info!(
                tablet = %tablet_id,
                segment = %segment.seqno(),
                entries = segment.entry_count(),
                "recovered log segment"
            );
            segments.insert(segment.seqno(), segment);
        }

        // A fresh active segment always follows recovery.
        let active_seqno = next_seqno;
        let first_index = LogIndex::new(last_op.index.get() + 1);
        let active = Segment::new(active_seqno, first_index);
        let active_path = segment_path(&options.dir, active_seqno);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)
            .await
            .map_err(|e| LogError::io("create active segment", e))?;
        let mut header = BytesMut::new();
        SegmentHeader {
            seqno: active_seqno,
            first_index,
        }
        .encode(&mut header);
        file.write_all(&header)
            .await
            .map_err(|e| LogError::io("write segment header", e))?;
        file.sync_data()
            .await
            .map_err(|e| LogError::io("sync segment header", e))?;
        segments.insert(active_seqno, active);

        let state = Arc::new(Mutex::new(LogState {
            segments,
            index,
            active: active_seqno,
        }));

        let (durable_tx, durable_rx) = watch::channel(last_op);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let inflight_batches = Arc::new(AtomicUsize::new(0));
        let latest = Arc::new(AtomicOpId::new(last_op));

        let worker = AppendWorker {
            tablet_id,
            dir: options.dir.clone(),
            max_segment_bytes: options.max_segment_bytes,
            state: Arc::clone(&state),
            durable_tx,
            latest: Arc::clone(&latest),
            latest_durable: last_op,
            file,
            inflight_batches: Arc::clone(&inflight_batches),
        };
        let handle = tokio::spawn(worker.run(cmd_rx));

        Ok(Arc::new(Self {
            tablet_id,
            options,
            state,
            latest,
            durable_rx,
            cmd_tx: Mutex::new(Some(cmd_tx)),
            inflight_batches,
            worker: Mutex::new(Some(handle)),
        }))
    }

    /// Returns a read-side handle sharing this log's segment list.
    #[must_use]
    pub fn reader(&self) -> LogReader {
        LogReader::new(Arc::clone(&self.state))
    }

    /// Lock-free snapshot of the last appended op id.
    #[must_use]
    pub fn latest_entry_op_id(&self) -> OpId {
        self.latest.load()
    }

    /// The last op id known durable on disk.
    #[must_use]
    pub fn durable_op_id(&self) -> OpId {
        *self.durable_rx.borrow()
    }

    /// Enqueues a contiguous batch for append. `on_durable` runs exactly
    /// once from the appender task after the batch is fsync'ed.
    ///
    /// # Errors
    /// Returns `AppendQueueFull` when too many batches are in flight, and
    /// `Closed` after shutdown.
    pub fn append_replicates(
        &self,
        msgs: Vec<ReplicateMsgRef>,
        on_durable: DurableCallback,
    ) -> LogResult<()> {
        if msgs.is_empty() {
            return Err(LogError::NonContiguousAppend {
                expected: 0,
                actual: 0,
            });
        }
        let inflight = self.inflight_batches.load(Ordering::Acquire);
        if inflight >= self.options.append_queue_size {
            return Err(LogError::AppendQueueFull {
                capacity: self.options.append_queue_size,
            });
        }

        let tx = self.cmd_tx.lock().expect("cmd_tx lock poisoned");
        let Some(tx) = tx.as_ref() else {
            return Err(LogError::Closed);
        };
        self.inflight_batches.fetch_add(1, Ordering::AcqRel);
        tx.send(LogCommand::Append { msgs, on_durable })
            .map_err(|_| LogError::Closed)?;
        Ok(())
    }

    /// Blocks until the given op id is durable, returning the durable
    /// watermark observed.
    pub async fn wait_for_safe_op_id_to_apply(&self, op_id: OpId) -> OpId {
        let mut rx = self.durable_rx.clone();
        let result = match rx.wait_for(|durable| *durable >= op_id).await {
            Ok(durable) => *durable,
            // The log shut down; report what we have.
            Err(_) => *self.durable_rx.borrow(),
        };
        result
    }

    /// Enqueues a truncation of everything after `index`. Ordered with
    /// appends; the returned receiver resolves when the truncation has been
    /// applied.
    ///
    /// # Errors
    /// Returns `Closed` after shutdown.
    pub fn truncate_after(&self, index: LogIndex) -> LogResult<oneshot::Receiver<()>> {
        let (ack, rx) = oneshot::channel();
        let tx = self.cmd_tx.lock().expect("cmd_tx lock poisoned");
        let Some(tx) = tx.as_ref() else {
            return Err(LogError::Closed);
        };
        tx.send(LogCommand::TruncateAfter { index, ack })
            .map_err(|_| LogError::Closed)?;
        Ok(rx)
    }

    /// Waits until every previously-enqueued command has been applied and
    /// synced.
    pub async fn sync(&self) -> LogResult<()> {
        let (ack, rx) = oneshot::channel();
        {
            let tx = self.cmd_tx.lock().expect("cmd_tx lock poisoned");
            let Some(tx) = tx.as_ref() else {
                return Err(LogError::Closed);
            };
            tx.send(LogCommand::Sync { ack }).map_err(|_| LogError::Closed)?;
        }
        let _ = rx.await;
        Ok(())
    }

    /// Deletes the prefix of sealed segments containing no entry with
    /// index ≥ `min_needed_index`. Returns the number of segments removed.
    ///
    /// # Errors
    /// Returns an I/O error if a segment file cannot be deleted.
    pub fn gc(&self, min_needed_index: LogIndex) -> LogResult<usize> {
        let mut removed = Vec::new();
        {
            let mut state = self.state.lock().expect("log state lock poisoned");
            let candidates: Vec<SegmentId> = state
                .segments
                .values()
                .take_while(|s| {
                    s.is_sealed() && s.last_index().map_or(false, |last| last < min_needed_index)
                })
                .map(Segment::seqno)
                .collect();
            for seqno in candidates {
                state.segments.remove(&seqno);
                state.index.remove_segment(seqno);
                removed.push(seqno);
            }
        }
        for seqno in &removed {
            let path = segment_path(&self.options.dir, *seqno);
            std::fs::remove_file(&path).map_err(|e| LogError::io("delete segment", e))?;
            debug!(tablet = %self.tablet_id, segment = %seqno, "garbage-collected log segment");
        }
        Ok(removed.len())
    }

    /// Shuts down the appender task after draining enqueued commands.
    pub async fn close(&self) {
        let tx = self.cmd_tx.lock().expect("cmd_tx lock poisoned").take();
        drop(tx);
        let handle = self.worker.lock().expect("worker lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct AppendWorker {
    tablet_id: TabletId,
    dir: PathBuf,
    max_segment_bytes: u64,
    state: Arc<Mutex<LogState>>,
    durable_tx: watch::Sender<OpId>,
    latest: Arc<AtomicOpId>,
    latest_durable: OpId,
    file: tokio::fs::File,
    inflight_batches: Arc<AtomicUsize>,
}

impl AppendWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LogCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                LogCommand::Append { msgs, on_durable } => {
                    self.handle_append(msgs, on_durable).await;
                    self.inflight_batches.fetch_sub(1, Ordering::AcqRel);
                }
                LogCommand::TruncateAfter { index, ack } => {
                    self.handle_truncate(index).await;
                    let _ = ack.send(());
                }
                LogCommand::Sync { ack } => {
                    if let Err(e) = self.file.sync_data().await {
                        fatal_append_error("sync", &e);
                    }
                    let _ = ack.send(());
                }
            }
        }
        if let Err(e) = self.file.sync_data().await {
            error!(tablet = %self.tablet_id, error = %e, "final log sync failed");
        }
        debug!(tablet = %self.tablet_id, "log appender stopped");
    }

    async fn handle_append(&mut self, msgs: Vec<ReplicateMsgRef>, on_durable: DurableCallback) {
        self.maybe_rotate().await;

        let last_id = msgs.last().map(|m| m.id).unwrap_or(self.latest_durable);
        let mut buf = BytesMut::new();
        {
            let mut state = self.state.lock().expect("log state lock poisoned");
            let active = state.active;
            for msg in msgs {
                let index = msg.id.index;
                let segment = state
                    .segments
                    .get_mut(&active)
                    .expect("active segment missing");
                match segment.append(msg, &mut buf) {
                    Ok(offset) => state.index.insert(index, active, offset),
                    Err(e) => fatal_append_error("append", &e),
                }
            }
        }
        self.latest.store(last_id);

        if let Err(e) = self.file.write_all(&buf).await {
            on_durable(Err(LogError::io("write", &e).into()));
            fatal_append_error("write", &e);
        }
        if let Err(e) = self.file.sync_data().await {
            on_durable(Err(LogError::io("sync", &e).into()));
            fatal_append_error("sync", &e);
        }

        self.latest_durable = last_id;
        self.durable_tx.send_replace(last_id);
        on_durable(Ok(()));
    }

    async fn maybe_rotate(&mut self) {
        let rotate = {
            let state = self.state.lock().expect("log state lock poisoned");
            let active = state.segments.get(&state.active).expect("active segment");
            active.size_bytes() >= self.max_segment_bytes && active.entry_count() > 0
        };
        if !rotate {
            return;
        }

        if let Err(e) = self.file.sync_data().await {
            fatal_append_error("sync before rotate", &e);
        }

        let (new_seqno, first_index) = {
            let mut state = self.state.lock().expect("log state lock poisoned");
            let old = state.active;
            let last = {
                let active = state.segments.get_mut(&old).expect("active segment");
                active.seal();
                active.last_index().unwrap_or(LogIndex::new(0))
            };
            let new_seqno = old.next();
            let first_index = last.next();
            state
                .segments
                .insert(new_seqno, Segment::new(new_seqno, first_index));
            state.active = new_seqno;
            (new_seqno, first_index)
        };

        let path = segment_path(&self.dir, new_seqno);
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) => fatal_append_error("open new segment", &e),
        };
        let mut header = BytesMut::new();
        SegmentHeader {
            seqno: new_seqno,
            first_index,
        }
        .encode(&mut header);
        if let Err(e) = file.write_all(&header).await {
            fatal_append_error("write new segment header", &e);
        }
        self.file = file;
        info!(
            tablet = %self.tablet_id,
            segment = %new_seqno,
            first_index = first_index.get(),
            "rotated log segment"
        );
    }

    async fn handle_truncate(&mut self, index: LogIndex) {
        // Drop whole segments strictly after `index`, then rewrite the
        // highest remaining segment with its tail cut off. The remaining
        // segment becomes the active one.
        let (rewrite, drop_paths, new_last) = {
            let mut state = self.state.lock().expect("log state lock poisoned");
            state.index.truncate_after(index);

            let dropped: Vec<SegmentId> = state
                .segments
                .values()
                .filter(|s| s.first_index() > index)
                .map(Segment::seqno)
                .collect();
            let mut drop_paths = Vec::new();
            for seqno in &dropped {
                state.segments.remove(seqno);
                drop_paths.push(segment_path(&self.dir, *seqno));
            }

            let tail_seqno = state.segments.keys().next_back().copied();
            let (rewrite, new_last) = match tail_seqno {
                Some(seqno) => {
                    let segment = state.segments.get_mut(&seqno).expect("tail segment");
                    segment.truncate_after(index);
                    // Reopen the tail for appends.
                    let encoded = segment.encode();
                    let last = segment.last_op_id().unwrap_or(OpId::MIN);
                    state.active = seqno;
                    (Some((seqno, encoded)), last)
                }
                None => {
                    // Everything was dropped; start over with a fresh
                    // active segment.
                    let seqno = dropped
                        .iter()
                        .copied()
                        .max()
                        .map_or(SegmentId::new(1), SegmentId::next);
                    let segment = Segment::new(seqno, LogIndex::new(index.get() + 1));
                    let encoded = segment.encode();
                    state.segments.insert(seqno, segment);
                    state.active = seqno;
                    (Some((seqno, encoded)), OpId::MIN)
                }
            };
            (rewrite, drop_paths, new_last)
        };

        for path in drop_paths {
            if let Err(e) = std::fs::remove_file(&path) {
                error!(tablet = %self.tablet_id, path = %path.display(), error = %e,
                       "failed to remove truncated segment");
            }
        }

        if let Some((seqno, encoded)) = rewrite {
            let path = segment_path(&self.dir, seqno);
            if let Err(e) = tokio::fs::write(&path, &encoded).await {
                fatal_append_error("rewrite truncated segment", &e);
            }
            let file = match tokio::fs::OpenOptions::new().append(true).open(&path).await {
                Ok(f) => f,
                Err(e) => fatal_append_error("reopen truncated segment", &e),
            };
            if let Err(e) = file.sync_data().await {
                fatal_append_error("sync truncated segment", &e);
            }
            self.file = file;
        }

        self.latest.store(new_last);
        self.latest_durable = new_last;
        self.durable_tx.send_replace(new_last);
        info!(tablet = %self.tablet_id, index = index.get(), "truncated log after index");
    }
}

fn segment_path(dir: &Path, seqno: SegmentId) -> PathBuf {
    dir.join(format!("wal-{:08}.seg", seqno.get()))
}

fn list_segment_files(dir: &Path) -> LogResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| LogError::io("read log dir", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| LogError::io("read log dir entry", e))?;
        let path = entry.path();
        let is_segment = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with("wal-") && n.ends_with(".seg"));
        if is_segment {
            out.push(path);
        }
    }
    Ok(out)
}

fn fatal_append_error(operation: &str, err: &dyn std::fmt::Display) -> ! {
    // The log has promised ordering; continuing past a lost write would
    // violate the durability contract for already-acked entries.
    error!(operation, error = %err, "log append failure is fatal");
    panic!("log append failure ({operation}): {err}");
}
