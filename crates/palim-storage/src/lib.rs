//! # palim-storage
//!
//! On-page format and relation storage for the Palim storage engine.
//!
//! A table page holds its row versions in place: a header, a line-pointer
//! array growing forward, tuple payloads growing backward, and a special
//! area at the page end holding the transaction slots that tie on-page
//! rows to their undo chains. Deleted and updated rows release their
//! space as soon as the owning transaction's commit becomes all-visible;
//! there is no vacuum over the main table.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Page format: header, line pointers, transaction slots, tuples.
pub mod page;

/// Transaction-slot reservation and reuse.
pub mod reserve;

/// Page pruning and space reuse.
pub mod prune;

/// In-memory relations and the process-wide relation store.
pub mod relation;

pub use page::{LinePointer, LinePointerState, LockMode, TablePage, TransSlot, TupleHeader};
pub use relation::{Relation, RelationStore};
pub use reserve::{SlotDisposition, SlotOracle, SlotRequest};
