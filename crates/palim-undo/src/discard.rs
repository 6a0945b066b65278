//! Discard horizon bookkeeping.
//!
//! Each log carries two shared values: `oldest_xid`, the oldest
//! transaction with undo still in the log, and `oldest_data`, the byte
//! offset of the oldest undiscarded record. Readers hold the shared side
//! of the discard lock across the horizon check and the fetch; the
//! discard worker takes the exclusive side to advance. A reader holding
//! the shared lock therefore can never see the data under its feet
//! disappear.

use parking_lot::{RwLock, RwLockReadGuard};

use palim_common::Xid;

/// Decision of the [`HorizonPolicy`] for one transaction during the
/// discard walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardDecision {
    /// The transaction's undo is no longer needed; keep walking.
    Discard,
    /// The transaction's undo must be retained; the walk stops here.
    /// Covers in-progress transactions, transactions at or above the
    /// global xmin, aborted transactions with pending undo, and aborted
    /// transactions whose slot-reuse records may still be referenced.
    Stop,
}

/// Transaction-status oracle consulted by the discard walk. Implemented
/// by the transaction registry; the undo crate only needs the verdict.
pub trait HorizonPolicy {
    /// Decides whether `xid`'s undo may be discarded.
    fn decide(&self, xid: Xid) -> DiscardDecision;
}

impl<F: Fn(Xid) -> DiscardDecision> HorizonPolicy for F {
    fn decide(&self, xid: Xid) -> DiscardDecision {
        self(xid)
    }
}

/// The two horizon values of one log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Horizon {
    /// Byte offset of the oldest undiscarded record.
    pub oldest_data: u64,
    /// Oldest xid that still has undo in this log.
    pub oldest_xid: Xid,
}

/// The per-log discard lock and the horizon it protects.
#[derive(Debug)]
pub struct DiscardState {
    horizon: RwLock<Horizon>,
}

impl DiscardState {
    /// Creates the state with an initial horizon.
    pub fn new(oldest_data: u64, oldest_xid: Xid) -> Self {
        Self {
            horizon: RwLock::new(Horizon {
                oldest_data,
                oldest_xid,
            }),
        }
    }

    /// Takes the shared discard lock. The horizon cannot advance while
    /// the guard is held.
    pub fn pin(&self) -> DiscardGuard<'_> {
        DiscardGuard {
            inner: self.horizon.read(),
        }
    }

    /// Advances the horizon under the exclusive discard lock.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the horizon would move backwards.
    pub fn advance(&self, oldest_data: u64, oldest_xid: Xid) {
        let mut horizon = self.horizon.write();
        debug_assert!(
            oldest_data >= horizon.oldest_data,
            "discard horizon may not retreat"
        );
        horizon.oldest_data = oldest_data;
        horizon.oldest_xid = oldest_xid;
    }

    /// Returns a momentary copy of the horizon, without pinning it.
    pub fn snapshot(&self) -> Horizon {
        *self.horizon.read()
    }
}

/// Shared-side guard of the discard lock.
pub struct DiscardGuard<'a> {
    inner: RwLockReadGuard<'a, Horizon>,
}

impl DiscardGuard<'_> {
    /// The horizon pinned by this guard.
    pub fn horizon(&self) -> Horizon {
        *self.inner
    }

    /// Returns true if `offset` is still reachable.
    pub fn is_reachable(&self, offset: u64) -> bool {
        offset >= self.inner.oldest_data
    }
}
