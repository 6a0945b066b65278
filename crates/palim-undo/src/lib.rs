//! # palim-undo
//!
//! Per-writer undo logs for the Palim storage engine.
//!
//! Every writing transaction attaches to one undo log and appends typed
//! undo records to it; the resulting 64-bit pointers are stored in page
//! transaction slots and chained through the records themselves. Readers
//! follow those chains to reconstruct prior row versions; rollback walks
//! them in reverse; the discard horizon bounds how far back anyone may
//! reach.
//!
//! Undo is written strictly sequentially, so segments take no full-page
//! images: a torn tail past the durable insertion point is simply cut off
//! during crash bootstrap.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Undo store configuration.
pub mod config;

/// Undo error types.
pub mod error;

/// Typed undo records and their wire codec.
pub mod record;

/// Fixed-size undo segment files.
pub mod segment;

/// Per-log durable metadata.
pub mod meta;

/// Undo logs and the process-wide log manager.
pub mod log;

/// Discard horizon bookkeeping.
pub mod discard;

pub use config::UndoStoreConfig;
pub use discard::{DiscardDecision, HorizonPolicy};
pub use error::{UndoError, UndoResult};
pub use log::{AttachedUndoLog, UndoLogManager, UndoMetaHint};
pub use record::{UndoPayload, UndoRecord, UndoRecordType};
