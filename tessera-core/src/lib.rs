//! Core types shared across the Tessera tablet server.
//!
//! This crate holds the vocabulary every other crate speaks: strongly-typed
//! identifiers, the `(term, index)` op id, hybrid time and the hybrid clock,
//! the shared replicate-message payload, and the common error type.

mod error;
mod hybrid_time;
mod replicate;
mod types;

pub use error::{Error, Result};
pub use hybrid_time::{HybridClock, HybridTime};
pub use replicate::{OpType, ReplicateMsg, ReplicateMsgRef};
pub use types::{AtomicOpId, LogIndex, OpId, PeerId, TabletId, TermId};
