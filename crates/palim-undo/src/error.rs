//! Undo store error types.

use std::io;
use thiserror::Error;

use palim_common::{EngineError, UndoPtr, Xid};

/// Result type for undo store operations.
pub type UndoResult<T> = Result<T, UndoError>;

/// Errors raised by the undo store.
#[derive(Debug, Error)]
pub enum UndoError {
    /// I/O error on a segment or meta file.
    #[error("undo I/O error: {source}")]
    Io {
        /// Underlying I/O error.
        #[from]
        source: io::Error,
    },

    /// The requested pointer lies below the log's discard horizon.
    #[error("undo pointer {ptr} is below the discard horizon {horizon}")]
    Discarded {
        /// The requested pointer.
        ptr: UndoPtr,
        /// The log's current oldest reachable pointer.
        horizon: UndoPtr,
    },

    /// The requested pointer lies at or past the insertion point.
    #[error("undo pointer {ptr} is past the insertion point")]
    PastInsertPoint {
        /// The requested pointer.
        ptr: UndoPtr,
    },

    /// A record failed its checksum.
    #[error("undo record checksum mismatch at {ptr}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Location of the bad record.
        ptr: UndoPtr,
        /// Checksum read from disk.
        stored: u32,
        /// Checksum computed over the bytes.
        computed: u32,
    },

    /// A structural invariant of the log or a record failed.
    #[error("undo log corrupted: {reason}")]
    Corrupted {
        /// What the check found.
        reason: String,
    },

    /// The log already has a writer attached.
    #[error("undo log {log_no} is already attached by transaction {holder}")]
    AlreadyAttached {
        /// The busy log.
        log_no: u32,
        /// The transaction holding it.
        holder: Xid,
    },

    /// An append was attempted without attaching first.
    #[error("no undo log attached")]
    NotAttached,

    /// The log number does not exist in this store.
    #[error("unknown undo log {log_no}")]
    UnknownLog {
        /// The missing log number.
        log_no: u32,
    },
}

impl UndoError {
    /// Creates a corruption error.
    pub fn corrupted(reason: impl Into<String>) -> Self {
        Self::Corrupted {
            reason: reason.into(),
        }
    }

    /// Returns true if this error means the record was discarded and the
    /// caller should treat the version as all-visible.
    pub fn is_discarded(&self) -> bool {
        matches!(self, Self::Discarded { .. })
    }
}

impl From<UndoError> for EngineError {
    fn from(err: UndoError) -> Self {
        match err {
            UndoError::Discarded { ptr, .. } => EngineError::UndoUnavailable { ptr },
            UndoError::Io { source } => EngineError::Io { source },
            UndoError::ChecksumMismatch { .. }
            | UndoError::Corrupted { .. }
            | UndoError::PastInsertPoint { .. } => EngineError::corrupted(err.to_string()),
            other => EngineError::corrupted(other.to_string()),
        }
    }
}
