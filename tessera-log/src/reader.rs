//! Read-side view of the log.
//!
//! The reader shares the in-memory segment list with the [`LogStore`] and
//! serves op-id lookups, ranged reads for peer catch-up, and the GC prefix
//! computation.
//!
//! [`LogStore`]: crate::log::LogStore

use std::sync::{Arc, Mutex};

use tessera_core::{LogIndex, OpId, ReplicateMsgRef};

use crate::error::{LogError, LogResult};
use crate::log::LogState;
use crate::segment::SegmentId;

/// Metadata about one segment, for GC decisions.
#[derive(Debug, Clone, Copy)]
pub struct SegmentInfo {
    /// Segment sequence number.
    pub seqno: SegmentId,
    /// First op index in this segment.
    pub first_index: LogIndex,
    /// Last op index in this segment (`None` if empty).
    pub last_index: Option<LogIndex>,
    /// Total size in bytes.
    pub size_bytes: u64,
    /// Number of entries.
    pub entry_count: usize,
    /// Whether the segment is sealed.
    pub is_sealed: bool,
}

/// Read-side handle over the log's segment list.
#[derive(Clone)]
pub struct LogReader {
    state: Arc<Mutex<LogState>>,
}

impl LogReader {
    pub(crate) fn new(state: Arc<Mutex<LogState>>) -> Self {
        Self { state }
    }

    /// Returns the op id stored at the given index.
    ///
    /// # Errors
    /// Returns `IndexNotFound` if the index is not retained.
    pub fn lookup_op_id(&self, index: LogIndex) -> LogResult<OpId> {
        let state = self.state.lock().expect("log state lock poisoned");
        state
            .entry_at(index)
            .map(|e| e.id)
            .ok_or_else(|| state.index_not_found(index))
    }

    /// Reads the entries in `[lo, hi]`, up to `max_bytes` of serialized
    /// size. At least one entry is returned when `lo` is retained, even if
    /// it alone exceeds the cap.
    ///
    /// # Errors
    /// Returns `IndexNotFound` if `lo` is not retained.
    pub fn read_replicates_in_range(
        &self,
        lo: LogIndex,
        hi: LogIndex,
        max_bytes: usize,
    ) -> LogResult<Vec<ReplicateMsgRef>> {
        let state = self.state.lock().expect("log state lock poisoned");
        if lo > hi {
            return Ok(Vec::new());
        }
        if state.entry_at(lo).is_none() {
            return Err(state.index_not_found(lo));
        }

        let mut out = Vec::new();
        let mut used = 0usize;
        let mut next = lo;
        'segments: for segment in state.segments.values() {
            match segment.last_index() {
                Some(last) if last >= next => {}
                _ => continue,
            }
            while next <= hi {
                let Some(entry) = segment.entry_at(next) else {
                    continue 'segments;
                };
                let size = entry.serialized_size();
                if !out.is_empty() && used + size > max_bytes {
                    break 'segments;
                }
                used += size;
                out.push(entry.clone());
                next = next.next();
                if used >= max_bytes {
                    break 'segments;
                }
            }
            break;
        }
        Ok(out)
    }

    /// The first retained op index, if the log retains anything.
    #[must_use]
    pub fn first_retained_index(&self) -> Option<LogIndex> {
        let state = self.state.lock().expect("log state lock poisoned");
        state.index.first_index()
    }

    /// Returns the largest prefix of sealed segments known to contain no
    /// entry with index ≥ `index`. These segments are GC candidates.
    #[must_use]
    pub fn segment_prefix_not_including(&self, index: LogIndex) -> Vec<SegmentInfo> {
        let state = self.state.lock().expect("log state lock poisoned");
        let mut prefix = Vec::new();
        for segment in state.segments.values() {
            if !segment.is_sealed() {
                break;
            }
            match segment.last_index() {
                Some(last) if last < index => prefix.push(segment_info(segment)),
                _ => break,
            }
        }
        prefix
    }

    /// For each sealed segment entirely below `min_index`, returns its max
    /// op index and size in bytes. Used to report reclaimable log space.
    #[must_use]
    pub fn max_indexes_to_segment_size(&self, min_index: LogIndex) -> Vec<(LogIndex, u64)> {
        self.segment_prefix_not_including(min_index)
            .into_iter()
            .filter_map(|info| info.last_index.map(|last| (last, info.size_bytes)))
            .collect()
    }

    /// Returns metadata for all retained segments, oldest first.
    #[must_use]
    pub fn segments(&self) -> Vec<SegmentInfo> {
        let state = self.state.lock().expect("log state lock poisoned");
        state.segments.values().map(segment_info).collect()
    }
}

fn segment_info(segment: &crate::segment::Segment) -> SegmentInfo {
    SegmentInfo {
        seqno: segment.seqno(),
        first_index: segment.first_index(),
        last_index: segment.last_index(),
        size_bytes: segment.size_bytes(),
        entry_count: segment.entry_count(),
        is_sealed: segment.is_sealed(),
    }
}

impl LogState {
    fn index_not_found(&self, index: LogIndex) -> LogError {
        LogError::IndexNotFound {
            index: index.get(),
            first: self.index.first_index().map_or(0, LogIndex::get),
            last: self.index.last_index().map_or(0, LogIndex::get),
        }
    }
}
