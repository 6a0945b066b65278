//! # palim-mvcc
//!
//! Snapshots, transaction status, and snapshot-driven version
//! reconstruction for the Palim storage engine.
//!
//! The engine keeps only the newest row version in the table; everything
//! older lives in undo chains hanging off page transaction slots. The
//! visibility resolver here walks those chains to materialize the version
//! a snapshot is entitled to see.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Snapshots.
pub mod snapshot;

/// Transaction status registry.
pub mod registry;

/// Snapshot-driven version reconstruction.
pub mod visibility;

pub use registry::{TransactionRegistry, TxnStatus};
pub use snapshot::{Snapshot, SnapshotKind};
pub use visibility::{resolve_version, PageSlots, SlotReader};
