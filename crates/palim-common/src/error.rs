//! Engine error type.
//!
//! One enum covers the failure modes that cross crate boundaries. Each
//! Palim crate defines richer internal errors where useful and converts
//! into this type at its API surface.

use std::io;
use thiserror::Error;

use crate::ids::{Tid, UndoPtr, Xid};

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// All transaction slots on a page (and its overflow) are held by
    /// in-progress transactions. The caller must release its page locks
    /// and retry; waiting while holding them risks deadlock.
    #[error("no transaction slot available on block {block}")]
    SlotExhausted {
        /// Block whose slots are exhausted.
        block: u32,
    },

    /// The page cannot fit the new tuple image even after pruning.
    /// Updates degrade to non-in-place on this error.
    #[error("not enough space on page: need {needed} bytes, have {available}")]
    OutOfPageSpace {
        /// Bytes required by the operation.
        needed: usize,
        /// Bytes actually free on the page.
        available: usize,
    },

    /// A cross-partition update was attempted; surfaces to the client.
    #[error("tuple to be updated was moved to another partition")]
    SerializationFailure,

    /// The row is locked by another transaction and the wait policy was
    /// `Skip` or `Error`.
    #[error("could not obtain lock on row: held by transaction {holder}")]
    LockNotAvailable {
        /// The conflicting lock holder.
        holder: Xid,
    },

    /// An undo pointer lies below the discard horizon. Callers resolving
    /// visibility treat this as "all-visible".
    #[error("undo record {ptr} has been discarded")]
    UndoUnavailable {
        /// The unreachable pointer.
        ptr: UndoPtr,
    },

    /// An on-page or on-log invariant check failed. Fatal for the
    /// operation; carries enough context to locate the damage.
    #[error("data corruption: {reason}")]
    Corruption {
        /// What the invariant check found.
        reason: String,
    },

    /// A tid referenced a line pointer that does not exist on its page.
    #[error("tid {tid} is out of range for its page")]
    InvalidTid {
        /// The offending tid.
        tid: Tid,
    },

    /// I/O error from the undo store or segment files.
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error.
        #[from]
        source: io::Error,
    },
}

impl EngineError {
    /// Creates a corruption error.
    pub fn corrupted(reason: impl Into<String>) -> Self {
        Self::Corruption {
            reason: reason.into(),
        }
    }

    /// Creates an out-of-space error.
    pub fn out_of_space(needed: usize, available: usize) -> Self {
        Self::OutOfPageSpace { needed, available }
    }

    /// Returns true if the caller can retry after releasing locks.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SlotExhausted { .. })
    }

    /// Returns true if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        let err = EngineError::SlotExhausted { block: 3 };
        assert!(err.is_retryable());
        assert!(!err.is_corruption());

        let err = EngineError::corrupted("slot count mismatch");
        assert!(err.is_corruption());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::out_of_space(128, 40);
        let msg = format!("{}", err);
        assert!(msg.contains("128"));
        assert!(msg.contains("40"));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "segment missing");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
