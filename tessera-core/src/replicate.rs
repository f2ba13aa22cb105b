//! The replicated log entry payload.
//!
//! A [`ReplicateMsg`] is the unit the leader replicates: it carries its own
//! op id, the operation type, the hybrid time assigned at append, the
//! committed op id as of the append, and an opaque payload owned by the
//! storage engine. Once constructed a message is immutable; the log, the
//! leader queue, and any number of in-flight peer requests share the same
//! [`ReplicateMsgRef`].

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::hybrid_time::HybridTime;
use crate::types::{LogIndex, OpId, TermId};
use crate::{Error, Result};

/// The kind of operation carried by a replicate message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    /// Leader no-op, appended at the start of each term.
    NoOp,
    /// A row write batch.
    Write,
    /// A configuration change (old + new config encoded in the payload).
    ChangeConfig,
    /// A schema change.
    AlterSchema,
    /// A transaction status update.
    UpdateTransaction,
    /// A snapshot operation.
    Snapshot,
    /// Truncate the tablet.
    Truncate,
    /// In-memory-only operation used to propagate safe time to followers.
    Empty,
}

impl OpType {
    /// Encodes the op type as a single byte tag.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::NoOp => 0,
            Self::Write => 1,
            Self::ChangeConfig => 2,
            Self::AlterSchema => 3,
            Self::UpdateTransaction => 4,
            Self::Snapshot => 5,
            Self::Truncate => 6,
            Self::Empty => 7,
        }
    }

    /// Decodes an op type from its byte tag.
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::NoOp),
            1 => Some(Self::Write),
            2 => Some(Self::ChangeConfig),
            3 => Some(Self::AlterSchema),
            4 => Some(Self::UpdateTransaction),
            5 => Some(Self::Snapshot),
            6 => Some(Self::Truncate),
            7 => Some(Self::Empty),
            _ => None,
        }
    }
}

/// A replicated log entry. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateMsg {
    /// Id of this entry.
    pub id: OpId,
    /// Operation kind.
    pub op_type: OpType,
    /// Hybrid time assigned when the entry was appended on the leader.
    pub hybrid_time: HybridTime,
    /// The leader's committed op id at the time of append.
    pub committed_op_id: OpId,
    /// Opaque operation payload; the schema belongs to the storage engine.
    pub payload: Bytes,
}

/// Shared, reference-counted replicate message.
pub type ReplicateMsgRef = Arc<ReplicateMsg>;

impl ReplicateMsg {
    /// Creates a new replicate message.
    #[must_use]
    pub fn new(
        id: OpId,
        op_type: OpType,
        hybrid_time: HybridTime,
        committed_op_id: OpId,
        payload: Bytes,
    ) -> Self {
        Self {
            id,
            op_type,
            hybrid_time,
            committed_op_id,
            payload,
        }
    }

    /// Returns the serialized size of this message in bytes.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        // id (16) + op_type (1) + hybrid_time (8) + committed (16) + len (4) + payload
        16 + 1 + 8 + 16 + 4 + self.payload.len()
    }

    /// Encodes the message into the buffer (little-endian framing).
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id.term.get());
        buf.put_u64_le(self.id.index.get());
        buf.put_u8(self.op_type.as_u8());
        buf.put_u64_le(self.hybrid_time.raw());
        buf.put_u64_le(self.committed_op_id.term.get());
        buf.put_u64_le(self.committed_op_id.index.get());
        // Payload length is bounded by the log's entry size limit.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Decodes a message from the buffer.
    ///
    /// # Errors
    /// Returns `Corruption` if the buffer is truncated or the op-type tag is
    /// unknown.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 45 {
            return Err(Error::corruption("replicate message truncated"));
        }
        let term = TermId::new(buf.get_u64_le());
        let index = LogIndex::new(buf.get_u64_le());
        let tag = buf.get_u8();
        let op_type = OpType::from_u8(tag)
            .ok_or_else(|| Error::corruption(format!("unknown op type tag {tag}")))?;
        let hybrid_time = HybridTime::from_raw(buf.get_u64_le());
        let committed = OpId::new(
            TermId::new(buf.get_u64_le()),
            LogIndex::new(buf.get_u64_le()),
        );
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(Error::corruption("replicate payload truncated"));
        }
        let payload = buf.copy_to_bytes(len);
        Ok(Self {
            id: OpId::new(term, index),
            op_type,
            hybrid_time,
            committed_op_id: committed,
            payload,
        })
    }
}
