//! Log error types.
//!
//! All errors are explicit and typed. No string errors.

use thiserror::Error;

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// Entry exceeds maximum size.
    #[error("entry too large: {size} bytes exceeds max {max} bytes")]
    EntryTooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// CRC checksum mismatch indicates corruption.
    #[error("checksum mismatch at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Byte offset where corruption was detected.
        offset: u64,
        /// Expected CRC32 value.
        expected: u32,
        /// Actual CRC32 value computed.
        actual: u32,
    },

    /// Entry or segment header is invalid.
    #[error("invalid header at offset {offset}: {reason}")]
    InvalidHeader {
        /// Byte offset of the header.
        offset: u64,
        /// Why the header is invalid.
        reason: &'static str,
    },

    /// Recovery detected a truncated write (torn write).
    #[error("truncated entry at offset {offset}: expected {expected} bytes, found {found} bytes")]
    TruncatedEntry {
        /// Offset of the truncated entry.
        offset: u64,
        /// Expected entry size.
        expected: usize,
        /// Actual bytes found.
        found: usize,
    },

    /// The requested op index is not in the log.
    #[error("op index {index} not in log (retained range: {first}..={last})")]
    IndexNotFound {
        /// Requested index.
        index: u64,
        /// First retained index.
        first: u64,
        /// Last retained index.
        last: u64,
    },

    /// Entries must be appended in contiguous index order.
    #[error("non-contiguous append: expected index {expected}, got {actual}")]
    NonContiguousAppend {
        /// Expected next index.
        expected: u64,
        /// Actual index of the offending entry.
        actual: u64,
    },

    /// The append queue is full; the caller should retry later.
    #[error("log append queue is full (capacity {capacity})")]
    AppendQueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// The log has been closed.
    #[error("log is closed")]
    Closed,

    /// I/O error from the underlying filesystem.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl LogError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if this error indicates data corruption.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::InvalidHeader { .. }
        )
    }
}

impl From<LogError> for tessera_core::Error {
    fn from(err: LogError) -> Self {
        match &err {
            LogError::ChecksumMismatch { .. }
            | LogError::InvalidHeader { .. }
            | LogError::TruncatedEntry { .. } => tessera_core::Error::corruption(err.to_string()),
            LogError::IndexNotFound { .. } => tessera_core::Error::not_found(err.to_string()),
            LogError::AppendQueueFull { .. } => {
                tessera_core::Error::service_unavailable(err.to_string())
            }
            LogError::Closed => tessera_core::Error::illegal_state(err.to_string()),
            LogError::EntryTooLarge { .. } | LogError::NonContiguousAppend { .. } => {
                tessera_core::Error::invalid_argument(err.to_string())
            }
            LogError::Io { .. } => tessera_core::Error::remote(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LogError::ChecksumMismatch {
            offset: 1024,
            expected: 0xDEAD_BEEF,
            actual: 0xCAFE_BABE,
        };
        let msg = format!("{err}");
        assert!(msg.contains("1024"));
        assert!(msg.contains("0xdeadbeef"));
    }

    #[test]
    fn test_kind_mapping() {
        let err: tessera_core::Error = LogError::AppendQueueFull { capacity: 8 }.into();
        assert!(err.is_service_unavailable());

        let err: tessera_core::Error = LogError::InvalidHeader {
            offset: 0,
            reason: "bad magic",
        }
        .into();
        assert!(err.is_corruption());
    }
}
