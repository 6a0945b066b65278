//! Snapshots.
//!
//! A snapshot captures which transactions' effects a reader may observe:
//! everything before `xmin` is in, everything at or past `xmax` is out,
//! and the transactions listed as running in between are out. A reader
//! always sees its own writes.

use palim_common::{CommandId, Xid};

/// How the snapshot treats in-progress transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Normal MVCC visibility.
    Mvcc,
    /// Dirty read: uncommitted changes are visible. Used when chasing
    /// speculative insertions and update chains.
    Dirty,
}

/// A consistent view of the transaction state.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Every xid below this is either committed-and-visible or aborted.
    pub xmin: Xid,
    /// First xid invisible regardless of state.
    pub xmax: Xid,
    /// Transactions in `[xmin, xmax)` that were running when the
    /// snapshot was taken. Sorted for binary search.
    pub running: Vec<Xid>,
    /// The snapshot owner, or invalid for standalone readers.
    pub own_xid: Xid,
    /// The owner's current command counter.
    pub own_cid: CommandId,
    /// Visibility flavor.
    pub kind: SnapshotKind,
}

impl Snapshot {
    /// Creates an MVCC snapshot.
    pub fn new(xmin: Xid, xmax: Xid, mut running: Vec<Xid>, own_xid: Xid, own_cid: CommandId) -> Self {
        running.sort_unstable();
        Self {
            xmin,
            xmax,
            running,
            own_xid,
            own_cid,
            kind: SnapshotKind::Mvcc,
        }
    }

    /// Creates a dirty snapshot that sees uncommitted changes.
    pub fn dirty() -> Self {
        Self {
            xmin: Xid::INVALID,
            xmax: Xid::new(u64::MAX),
            running: Vec::new(),
            own_xid: Xid::INVALID,
            own_cid: CommandId::FIRST,
            kind: SnapshotKind::Dirty,
        }
    }

    /// Returns true if the snapshot reads uncommitted state.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.kind == SnapshotKind::Dirty
    }

    /// Returns true if `xid` is the snapshot owner.
    #[inline]
    pub fn is_own(&self, xid: Xid) -> bool {
        self.own_xid.is_valid() && xid == self.own_xid
    }

    /// Decides whether the effects of `xid` are visible to this
    /// snapshot.
    pub fn sees(&self, xid: Xid) -> bool {
        // Frozen rows and bootstrap state are visible to everyone.
        if !xid.is_normal() {
            return true;
        }
        if self.is_own(xid) {
            return true;
        }
        if self.is_dirty() {
            return true;
        }
        if xid.precedes(self.xmin) {
            return true;
        }
        if !xid.precedes(self.xmax) {
            return false;
        }
        self.running.binary_search(&xid).is_err()
    }
}
