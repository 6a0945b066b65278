//! # palim-common
//!
//! Shared building blocks for the Palim storage engine:
//!
//! - Type-safe identifier newtypes (transaction ids, undo pointers, tids)
//! - The engine-wide error type
//! - On-disk layout constants
//! - Engine configuration
//!
//! Every other Palim crate depends on this one; it depends on nothing but
//! `serde` and `thiserror`.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Identifier newtypes.
pub mod ids;

/// Engine error type and result alias.
pub mod error;

/// On-disk layout constants.
pub mod constants;

/// Engine configuration.
pub mod config;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use ids::{
    BlockNumber, CommandId, OffsetNumber, RelFileId, SlotNo, SpecToken, Tid, UndoPtr, Xid,
};
