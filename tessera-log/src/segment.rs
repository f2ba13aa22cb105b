//! Log segments.
//!
//! A segment is one file on disk: a fixed header followed by framed
//! entries. The active segment accepts appends; sealed segments are
//! immutable. Every retained entry is also kept in memory so that reads
//! for peer catch-up never hit the filesystem.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tessera_core::{LogIndex, OpId, ReplicateMsgRef};
use tracing::warn;

use crate::entry::{decode_entry, encode_entry};
use crate::error::{LogError, LogResult};

/// Magic bytes identifying a Tessera log segment ("TSLG").
const SEGMENT_MAGIC: u32 = 0x54534C47;

/// Current segment format version.
const SEGMENT_VERSION: u32 = 1;

/// Size of the segment file header in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 24;

/// Sequence number of a segment within a tablet's log.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct SegmentId(u64);

impl SegmentId {
    /// Creates a segment id from a raw sequence number.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw sequence number.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next segment id.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg({})", self.0)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg-{}", self.0)
    }
}

/// Segment file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Segment sequence number.
    pub seqno: SegmentId,
    /// Expected index of the first entry.
    pub first_index: LogIndex,
}

impl SegmentHeader {
    /// Encodes the header.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(SEGMENT_MAGIC);
        buf.put_u32_le(SEGMENT_VERSION);
        buf.put_u64_le(self.seqno.get());
        buf.put_u64_le(self.first_index.get());
    }

    /// Decodes the header.
    ///
    /// # Errors
    /// Returns `InvalidHeader` on bad magic or version.
    pub fn decode(buf: &mut impl Buf) -> LogResult<Self> {
        if buf.remaining() < SEGMENT_HEADER_SIZE {
            return Err(LogError::InvalidHeader {
                offset: 0,
                reason: "segment file shorter than header",
            });
        }
        let magic = buf.get_u32_le();
        if magic != SEGMENT_MAGIC {
            return Err(LogError::InvalidHeader {
                offset: 0,
                reason: "bad segment magic",
            });
        }
        let version = buf.get_u32_le();
        if version != SEGMENT_VERSION {
            return Err(LogError::InvalidHeader {
                offset: 4,
                reason: "unsupported segment version",
            });
        }
        let seqno = SegmentId::new(buf.get_u64_le());
        let first_index = LogIndex::new(buf.get_u64_le());
        Ok(Self { seqno, first_index })
    }
}

/// In-memory view of one segment.
#[derive(Debug)]
pub struct Segment {
    seqno: SegmentId,
    first_index: LogIndex,
    entries: Vec<ReplicateMsgRef>,
    /// Byte offset of each entry within the file, parallel to `entries`.
    offsets: Vec<u64>,
    size_bytes: u64,
    sealed: bool,
}

impl Segment {
    /// Creates a new empty (active) segment.
    #[must_use]
    pub fn new(seqno: SegmentId, first_index: LogIndex) -> Self {
        Self {
            seqno,
            first_index,
            entries: Vec::new(),
            offsets: Vec::new(),
            size_bytes: SEGMENT_HEADER_SIZE as u64,
            sealed: false,
        }
    }

    /// Returns the segment sequence number.
    #[must_use]
    pub const fn seqno(&self) -> SegmentId {
        self.seqno
    }

    /// Returns the expected index of the first entry.
    #[must_use]
    pub const fn first_index(&self) -> LogIndex {
        self.first_index
    }

    /// Returns the op id of the last entry, if any.
    #[must_use]
    pub fn last_op_id(&self) -> Option<OpId> {
        self.entries.last().map(|e| e.id)
    }

    /// Returns the index of the last entry, if any.
    #[must_use]
    pub fn last_index(&self) -> Option<LogIndex> {
        self.entries.last().map(|e| e.id.index)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns the segment size in bytes (header + entries).
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Returns true if the segment is sealed.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Seals the segment; no further appends are accepted.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Appends an entry, encoding it into `buf` for the file write.
    ///
    /// Returns the byte offset at which the entry starts in the file.
    ///
    /// # Errors
    /// Returns `NonContiguousAppend` if the entry's index does not follow
    /// the previous one, or an encoding error.
    pub fn append(&mut self, msg: ReplicateMsgRef, buf: &mut BytesMut) -> LogResult<u64> {
        debug_assert!(!self.sealed, "append to sealed segment");

        let expected = self
            .last_index()
            .map_or(self.first_index, LogIndex::next);
        if msg.id.index != expected {
            return Err(LogError::NonContiguousAppend {
                expected: expected.get(),
                actual: msg.id.index.get(),
            });
        }

        let offset = self.size_bytes;
        let written = encode_entry(&msg, buf)?;
        self.entries.push(msg);
        self.offsets.push(offset);
        self.size_bytes += written as u64;
        Ok(offset)
    }

    /// Returns the entry at the given op index, if this segment holds it.
    #[must_use]
    pub fn entry_at(&self, index: LogIndex) -> Option<&ReplicateMsgRef> {
        if index < self.first_index {
            return None;
        }
        let pos = (index.get() - self.first_index.get()) as usize;
        self.entries.get(pos)
    }

    /// Returns the file byte offset of the entry at the given op index.
    #[must_use]
    pub fn offset_at(&self, index: LogIndex) -> Option<u64> {
        if index < self.first_index {
            return None;
        }
        let pos = (index.get() - self.first_index.get()) as usize;
        self.offsets.get(pos).copied()
    }

    /// Drops all entries with index greater than `index`.
    ///
    /// Returns the number of entries removed.
    pub fn truncate_after(&mut self, index: LogIndex) -> usize {
        if index.get() < self.first_index.get() {
            let removed = self.entries.len();
            self.entries.clear();
            self.offsets.clear();
            self.size_bytes = SEGMENT_HEADER_SIZE as u64;
            return removed;
        }
        let keep = (index.get() - self.first_index.get() + 1) as usize;
        if keep >= self.entries.len() {
            return 0;
        }
        let removed = self.entries.len() - keep;
        self.entries.truncate(keep);
        self.offsets.truncate(keep);
        self.size_bytes = self
            .offsets
            .last()
            .map_or(SEGMENT_HEADER_SIZE as u64, |last_offset| {
                let last_len = {
                    let last = &self.entries[self.entries.len() - 1];
                    crate::entry::ENTRY_HEADER_SIZE as u64 + last.serialized_size() as u64
                };
                last_offset + last_len
            });
        removed
    }

    /// Re-encodes the entire segment (header + entries), used when the
    /// active segment must be rewritten after truncation.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_bytes as usize);
        SegmentHeader {
            seqno: self.seqno,
            first_index: self.first_index,
        }
        .encode(&mut buf);
        for entry in &self.entries {
            // Entries were encodable when appended.
            let _ = encode_entry(entry, &mut buf);
        }
        buf.freeze()
    }

    /// Decodes a segment from file contents, tolerating a torn tail.
    ///
    /// Entries after the first torn or corrupt frame are discarded with a
    /// warning; this is the crash-recovery path.
    ///
    /// # Errors
    /// Returns `InvalidHeader` if the segment header itself is unreadable.
    pub fn decode(data: Bytes) -> LogResult<Self> {
        let mut buf = data;
        let header = SegmentHeader::decode(&mut buf)?;

        let mut segment = Self::new(header.seqno, header.first_index);
        let mut offset = SEGMENT_HEADER_SIZE as u64;
        while buf.has_remaining() {
            let before = buf.remaining();
            match decode_entry(&mut buf, offset) {
                Ok(msg) => {
                    let consumed = (before - buf.remaining()) as u64;
                    segment.entries.push(msg);
                    segment.offsets.push(offset);
                    offset += consumed;
                    segment.size_bytes = offset;
                }
                Err(err) => {
                    warn!(
                        segment = %header.seqno,
                        offset,
                        error = %err,
                        "discarding torn tail during segment recovery"
                    );
                    break;
                }
            }
        }
        Ok(segment)
    }

}
