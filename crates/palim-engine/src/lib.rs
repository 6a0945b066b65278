//! # palim-engine
//!
//! The mutation side of the Palim storage engine: the DML kernel that
//! updates rows in place and journals prior versions into undo logs, the
//! rollback engine that applies undo on abort, the background undo
//! worker, and the table-access surface the executor calls.
//!
//! Every mutating operation follows one protocol under the page's
//! exclusive lock: verify the target line pointer, reserve a transaction
//! slot, build the undo record, and then, inside one critical section,
//! append the undo record, mutate the page, refresh the slot, and emit a
//! single WAL record covering both the page delta and the undo hints.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Engine WAL records and sinks.
pub mod wal;

/// Engine assembly and transaction lifecycle.
pub mod engine;

/// The DML kernel.
pub mod kernel;

/// Rollback: applying undo on abort.
pub mod rollback;

/// The background undo worker.
pub mod worker;

/// Table-access surface.
pub mod access;

pub use access::{AnalyzeCounts, ScanState, SizeEstimate, TableAccess};
pub use engine::{PalimEngine, Transaction};
pub use kernel::{FailureData, LockWaitPolicy, MutationOutcome};
pub use wal::{MemWal, WalRecord, WalSink};
pub use worker::{RollbackQueue, UndoWorker};
