//! The shared error type.
//!
//! Every failure in the replication core maps to one of these kinds, and
//! every kind has a defined propagation policy: lifecycle and argument
//! errors surface to the caller unretried, backpressure is retried by the
//! caller, corruption is fatal to the current role, and only log-durability
//! failure is fatal to the process.

use std::fmt;

/// The result type for Tessera operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the replication core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Wrong lifecycle state or role for the requested operation.
    IllegalState(String),
    /// Log-matching or sequence violation; fatal to the current role.
    Corruption(String),
    /// A tablet, peer, or entry is missing.
    NotFound(String),
    /// An RPC, lease, or wait deadline elapsed.
    TimedOut(String),
    /// Backpressure: a queue is full or a memory soft limit was exceeded.
    ServiceUnavailable(String),
    /// A malformed request or argument.
    InvalidArgument(String),
    /// A pending operation was cancelled by a term change or shutdown.
    Aborted(String),
    /// The remote peer replied with an error, or transport failed.
    Remote(String),
}

macro_rules! error_ctors {
    ($(($ctor:ident, $pred:ident, $variant:ident)),* $(,)?) => {
        impl Error {
            $(
                #[doc = concat!("Creates a `", stringify!($variant), "` error.")]
                pub fn $ctor(message: impl Into<String>) -> Self {
                    Self::$variant(message.into())
                }

                #[doc = concat!("Returns true if this is a `", stringify!($variant), "` error.")]
                #[must_use]
                pub const fn $pred(&self) -> bool {
                    matches!(self, Self::$variant(_))
                }
            )*
        }
    };
}

error_ctors!(
    (illegal_state, is_illegal_state, IllegalState),
    (corruption, is_corruption, Corruption),
    (not_found, is_not_found, NotFound),
    (timed_out, is_timed_out, TimedOut),
    (service_unavailable, is_service_unavailable, ServiceUnavailable),
    (invalid_argument, is_invalid_argument, InvalidArgument),
    (aborted, is_aborted, Aborted),
    (remote, is_remote, Remote),
);

impl Error {
    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::IllegalState(m)
            | Self::Corruption(m)
            | Self::NotFound(m)
            | Self::TimedOut(m)
            | Self::ServiceUnavailable(m)
            | Self::InvalidArgument(m)
            | Self::Aborted(m)
            | Self::Remote(m) => m,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalState(m) => write!(f, "illegal state: {m}"),
            Self::Corruption(m) => write!(f, "corruption: {m}"),
            Self::NotFound(m) => write!(f, "not found: {m}"),
            Self::TimedOut(m) => write!(f, "timed out: {m}"),
            Self::ServiceUnavailable(m) => write!(f, "service unavailable: {m}"),
            Self::InvalidArgument(m) => write!(f, "invalid argument: {m}"),
            Self::Aborted(m) => write!(f, "aborted: {m}"),
            Self::Remote(m) => write!(f, "remote error: {m}"),
        }
    }
}

impl std::error::Error for Error {}
