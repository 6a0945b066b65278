//! Transaction status registry.
//!
//! Tracks which transactions are running, committed or aborted, hands out
//! xids and snapshots, and answers the status questions the slot manager,
//! pruning and the discard walk keep asking. Aborted transactions stay
//! "pending undo" until the rollback engine reports their undo applied.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};

use palim_common::{CommandId, EngineError, EngineResult, Xid};
use palim_storage::reserve::SlotDisposition;
use palim_undo::discard::DiscardDecision;

use crate::snapshot::Snapshot;

/// The widest distance allowed between the oldest running xid and the
/// next one to assign.
const XID_WINDOW: u64 = 1 << 31;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Running.
    InProgress,
    /// Committed.
    Committed,
    /// Aborted; `pending_undo` says whether rollback still owes work.
    Aborted {
        /// True until the rollback engine has applied all of its undo.
        pending_undo: bool,
    },
}

#[derive(Debug, Default)]
struct RegistryInner {
    running: BTreeSet<Xid>,
    /// Completed transactions. Anything absent and below every running
    /// xid is long-committed history.
    completed: HashMap<Xid, TxnStatus>,
    /// Aborted transactions whose undo holds slot-reuse records; their
    /// logs cannot be discarded until they fall below the global xmin.
    holds_slot_reuse: BTreeSet<Xid>,
}

/// Process-wide transaction state.
#[derive(Debug)]
pub struct TransactionRegistry {
    inner: RwLock<RegistryInner>,
    next_xid: AtomicU64,
    /// Waiters blocked on another transaction's completion.
    completion_lock: Mutex<()>,
    completion: Condvar,
}

impl TransactionRegistry {
    /// Creates a registry that assigns xids from the first normal value.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            next_xid: AtomicU64::new(Xid::FIRST_NORMAL.as_u64()),
            completion_lock: Mutex::new(()),
            completion: Condvar::new(),
        }
    }

    /// Starts a transaction and returns its xid.
    ///
    /// Fails when assigning would stretch the distance between the
    /// oldest running xid and the newest past 2^31.
    pub fn begin(&self) -> EngineResult<Xid> {
        let mut inner = self.inner.write();
        let candidate = self.next_xid.load(Ordering::Acquire);
        if let Some(oldest) = inner.running.iter().next() {
            if candidate - oldest.as_u64() >= XID_WINDOW {
                return Err(EngineError::corrupted(
                    "xid window exhausted: oldest in-progress transaction is too old",
                ));
            }
        }
        let xid = Xid::new(self.next_xid.fetch_add(1, Ordering::AcqRel));
        inner.running.insert(xid);
        Ok(xid)
    }

    /// Commits a transaction.
    pub fn commit(&self, xid: Xid) {
        {
            let mut inner = self.inner.write();
            inner.running.remove(&xid);
            inner.completed.insert(xid, TxnStatus::Committed);
        }
        self.notify_completion();
    }

    /// Aborts a transaction. Its undo is pending until
    /// [`Self::undo_applied`] is called. `holds_slot_reuse` defers
    /// discarding its undo log region until the xid ages past the
    /// global xmin.
    pub fn abort(&self, xid: Xid, holds_slot_reuse: bool) {
        {
            let mut inner = self.inner.write();
            inner.running.remove(&xid);
            inner
                .completed
                .insert(xid, TxnStatus::Aborted { pending_undo: true });
            if holds_slot_reuse {
                inner.holds_slot_reuse.insert(xid);
            }
        }
        self.notify_completion();
    }

    fn notify_completion(&self) {
        let _guard = self.completion_lock.lock();
        self.completion.notify_all();
    }

    /// Blocks until `xid` commits or aborts. Callers must not hold page
    /// locks while waiting.
    pub fn wait_for_completion(&self, xid: Xid) {
        let mut guard = self.completion_lock.lock();
        while self.status(xid) == TxnStatus::InProgress {
            self.completion.wait(&mut guard);
        }
    }

    /// Marks an aborted transaction's undo as fully applied.
    pub fn undo_applied(&self, xid: Xid) {
        let mut inner = self.inner.write();
        if let Some(status) = inner.completed.get_mut(&xid) {
            *status = TxnStatus::Aborted {
                pending_undo: false,
            };
        }
    }

    /// Returns a transaction's status. Unknown xids below every running
    /// transaction are treated as committed history.
    pub fn status(&self, xid: Xid) -> TxnStatus {
        if !xid.is_normal() {
            return TxnStatus::Committed;
        }
        let inner = self.inner.read();
        if inner.running.contains(&xid) {
            return TxnStatus::InProgress;
        }
        inner
            .completed
            .get(&xid)
            .copied()
            .unwrap_or(TxnStatus::Committed)
    }

    /// Aborted transactions whose undo is still pending, oldest first.
    /// The undo worker scans these to pick up forgotten rollbacks.
    pub fn aborted_pending_undo(&self) -> Vec<Xid> {
        let inner = self.inner.read();
        let mut pending: Vec<Xid> = inner
            .completed
            .iter()
            .filter_map(|(xid, status)| {
                matches!(status, TxnStatus::Aborted { pending_undo: true }).then_some(*xid)
            })
            .collect();
        pending.sort_unstable();
        pending
    }

    /// The oldest xid any running transaction might still care about.
    pub fn global_xmin(&self) -> Xid {
        let inner = self.inner.read();
        inner
            .running
            .iter()
            .next()
            .copied()
            .unwrap_or_else(|| Xid::new(self.next_xid.load(Ordering::Acquire)))
    }

    /// Takes a snapshot for `own_xid` at command `cid`.
    pub fn snapshot(&self, own_xid: Xid, cid: CommandId) -> Snapshot {
        let inner = self.inner.read();
        let xmax = Xid::new(self.next_xid.load(Ordering::Acquire));
        let xmin = inner.running.iter().next().copied().unwrap_or(xmax);
        let running = inner
            .running
            .iter()
            .copied()
            .filter(|&xid| xid != own_xid)
            .collect();
        Snapshot::new(xmin, xmax, running, own_xid, cid)
    }

    /// Classifies a slot-owning transaction for the slot manager and
    /// pruning.
    pub fn disposition(&self, xid: Xid) -> SlotDisposition {
        if !xid.is_normal() {
            return SlotDisposition::CommittedAllVisible;
        }
        match self.status(xid) {
            TxnStatus::InProgress => SlotDisposition::InProgress,
            TxnStatus::Committed => {
                if xid.precedes(self.global_xmin()) {
                    SlotDisposition::CommittedAllVisible
                } else {
                    SlotDisposition::Committed
                }
            }
            TxnStatus::Aborted { pending_undo } => {
                if pending_undo {
                    SlotDisposition::AbortedPending
                } else {
                    SlotDisposition::AbortedUndone
                }
            }
        }
    }

    /// Decides whether the discard walk may pass a transaction's undo.
    pub fn discard_decision(&self, xid: Xid) -> DiscardDecision {
        if !xid.is_normal() {
            return DiscardDecision::Discard;
        }
        let global_xmin = self.global_xmin();
        if !xid.precedes(global_xmin) {
            return DiscardDecision::Stop;
        }
        match self.status(xid) {
            TxnStatus::InProgress => DiscardDecision::Stop,
            TxnStatus::Committed => DiscardDecision::Discard,
            TxnStatus::Aborted { pending_undo } => {
                if pending_undo {
                    // Undo must survive until it is applied.
                    DiscardDecision::Stop
                } else {
                    DiscardDecision::Discard
                }
            }
        }
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_commit_status() {
        let registry = TransactionRegistry::new();
        let xid = registry.begin().unwrap();
        assert_eq!(registry.status(xid), TxnStatus::InProgress);

        registry.commit(xid);
        assert_eq!(registry.status(xid), TxnStatus::Committed);
    }

    #[test]
    fn test_abort_and_undo_applied() {
        let registry = TransactionRegistry::new();
        let xid = registry.begin().unwrap();
        registry.abort(xid, false);
        assert_eq!(
            registry.status(xid),
            TxnStatus::Aborted { pending_undo: true }
        );
        assert_eq!(registry.aborted_pending_undo(), vec![xid]);

        registry.undo_applied(xid);
        assert_eq!(
            registry.status(xid),
            TxnStatus::Aborted {
                pending_undo: false
            }
        );
        assert!(registry.aborted_pending_undo().is_empty());
    }

    #[test]
    fn test_global_xmin_tracks_oldest_running() {
        let registry = TransactionRegistry::new();
        let t1 = registry.begin().unwrap();
        let t2 = registry.begin().unwrap();
        assert_eq!(registry.global_xmin(), t1);

        registry.commit(t1);
        assert_eq!(registry.global_xmin(), t2);

        registry.commit(t2);
        // With nothing running the horizon is the next assignment.
        assert!(registry.global_xmin().follows(t2));
    }

    #[test]
    fn test_snapshot_excludes_running() {
        let registry = TransactionRegistry::new();
        let t1 = registry.begin().unwrap();
        let t2 = registry.begin().unwrap();
        registry.commit(t1);

        let reader = registry.begin().unwrap();
        let snap = registry.snapshot(reader, CommandId::FIRST);
        assert!(snap.sees(t1));
        assert!(!snap.sees(t2));
        assert!(snap.sees(reader));
    }

    #[test]
    fn test_disposition_mapping() {
        let registry = TransactionRegistry::new();
        let old = registry.begin().unwrap();
        registry.commit(old);

        // No running transactions: the commit is all-visible.
        assert_eq!(
            registry.disposition(old),
            SlotDisposition::CommittedAllVisible
        );

        // A running transaction pins the horizon below a newer commit.
        let pin = registry.begin().unwrap();
        let newer = registry.begin().unwrap();
        registry.commit(newer);
        assert_eq!(registry.disposition(newer), SlotDisposition::Committed);
        assert_eq!(registry.disposition(pin), SlotDisposition::InProgress);

        let aborted = registry.begin().unwrap();
        registry.abort(aborted, false);
        assert_eq!(
            registry.disposition(aborted),
            SlotDisposition::AbortedPending
        );
        registry.undo_applied(aborted);
        assert_eq!(registry.disposition(aborted), SlotDisposition::AbortedUndone);

        assert_eq!(
            registry.disposition(Xid::FROZEN),
            SlotDisposition::CommittedAllVisible
        );
    }

    #[test]
    fn test_discard_decisions() {
        let registry = TransactionRegistry::new();
        let committed = registry.begin().unwrap();
        registry.commit(committed);

        let aborted = registry.begin().unwrap();
        registry.abort(aborted, false);

        let running = registry.begin().unwrap();

        // Below the horizon and committed: discardable.
        assert_eq!(
            registry.discard_decision(committed),
            DiscardDecision::Discard
        );
        // Aborted with pending undo: must stay.
        assert_eq!(registry.discard_decision(aborted), DiscardDecision::Stop);
        registry.undo_applied(aborted);
        assert_eq!(registry.discard_decision(aborted), DiscardDecision::Discard);
        // Running, and at/above the horizon: must stay.
        assert_eq!(registry.discard_decision(running), DiscardDecision::Stop);
    }

    #[test]
    fn test_xid_window_enforced() {
        let registry = TransactionRegistry::new();
        let old = registry.begin().unwrap();

        // Simulate a long-running transaction pinning the window open.
        registry
            .next_xid
            .store(old.as_u64() + XID_WINDOW, Ordering::Release);
        assert!(registry.begin().is_err());

        registry.commit(old);
        assert!(registry.begin().is_ok());
    }
}
