//! On-disk entry framing.
//!
//! Each log entry is a CRC-framed replicate message:
//!
//! ```text
//! +----------+----------+------------------+
//! |  CRC32   |  Length  |  ReplicateMsg    |
//! | (4 bytes)| (4 bytes)|  (Length bytes)  |
//! +----------+----------+------------------+
//! ```
//!
//! The CRC covers Length + body. All integers are little-endian.

use bytes::{Buf, BufMut, BytesMut};
use tessera_core::{ReplicateMsg, ReplicateMsgRef};

use crate::error::{LogError, LogResult};

/// Size of the entry frame header in bytes.
pub const ENTRY_HEADER_SIZE: usize = 8;

/// Maximum size of a framed entry body.
pub const MAX_ENTRY_BYTES: usize = 32 * 1024 * 1024;

/// Encodes a replicate message as a framed log entry.
///
/// Returns the total number of bytes written.
///
/// # Errors
/// Returns `EntryTooLarge` if the message exceeds [`MAX_ENTRY_BYTES`].
pub fn encode_entry(msg: &ReplicateMsg, buf: &mut BytesMut) -> LogResult<usize> {
    let body_len = msg.serialized_size();
    if body_len > MAX_ENTRY_BYTES {
        return Err(LogError::EntryTooLarge {
            size: body_len,
            max: MAX_ENTRY_BYTES,
        });
    }

    let mut body = BytesMut::with_capacity(body_len);
    msg.encode(&mut body);
    debug_assert_eq!(body.len(), body_len);

    // Body length is bounded by MAX_ENTRY_BYTES which fits in u32.
    #[allow(clippy::cast_possible_truncation)]
    let length = body_len as u32;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(&body);
    let crc = hasher.finalize();

    buf.put_u32_le(crc);
    buf.put_u32_le(length);
    buf.put_slice(&body);

    Ok(ENTRY_HEADER_SIZE + body_len)
}

/// Decodes a framed log entry at the given file offset.
///
/// # Errors
/// Returns `TruncatedEntry` if the buffer ends mid-entry, `InvalidHeader`
/// if the length field is implausible, and `ChecksumMismatch` on CRC
/// failure.
pub fn decode_entry(buf: &mut impl Buf, offset: u64) -> LogResult<ReplicateMsgRef> {
    if buf.remaining() < ENTRY_HEADER_SIZE {
        return Err(LogError::TruncatedEntry {
            offset,
            expected: ENTRY_HEADER_SIZE,
            found: buf.remaining(),
        });
    }

    let crc = buf.get_u32_le();
    let length = buf.get_u32_le() as usize;

    if length > MAX_ENTRY_BYTES {
        return Err(LogError::InvalidHeader {
            offset,
            reason: "length exceeds maximum entry size",
        });
    }
    if buf.remaining() < length {
        return Err(LogError::TruncatedEntry {
            offset,
            expected: length,
            found: buf.remaining(),
        });
    }

    let body = buf.copy_to_bytes(length);

    let mut hasher = crc32fast::Hasher::new();
    // Length fits in u32 by the check above.
    #[allow(clippy::cast_possible_truncation)]
    hasher.update(&(length as u32).to_le_bytes());
    hasher.update(&body);
    let actual = hasher.finalize();
    if actual != crc {
        return Err(LogError::ChecksumMismatch {
            offset,
            expected: crc,
            actual,
        });
    }

    let msg = ReplicateMsg::decode(&mut &body[..]).map_err(|_| LogError::InvalidHeader {
        offset,
        reason: "undecodable replicate message",
    })?;
    Ok(ReplicateMsgRef::new(msg))
}
