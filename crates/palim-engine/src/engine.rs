//! Engine assembly and transaction lifecycle.
//!
//! [`PalimEngine`] wires the relation store, the undo store, the
//! transaction registry and the WAL sink together, and owns transaction
//! begin/commit/rollback. The shared pieces live in one place and are
//! released together at shutdown; lock order across them is log attach,
//! then page, then metapage, then discard.

use std::sync::Arc;

use tracing::{debug, info};

use palim_common::{
    BlockNumber, CommandId, EngineConfig, EngineError, EngineResult, RelFileId, SlotNo, Tid,
    UndoPtr, Xid,
};
use palim_common::constants::TRANS_SLOTS_PER_PAGE;
use palim_mvcc::visibility::{resolve_version, SlotReader};
use palim_mvcc::{Snapshot, TransactionRegistry};
use palim_storage::page::{TablePageRef, TransSlot};
use palim_storage::relation::Relation;
use palim_storage::reserve::SlotDisposition;
use palim_storage::RelationStore;
use palim_undo::{AttachedUndoLog, UndoLogManager, UndoStoreConfig};

use crate::rollback;
use crate::wal::WalSink;
use crate::worker::RollbackQueue;

/// Undo position captured at subtransaction start, used to rewind on
/// subtransaction abort.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubXactMark {
    /// Insertion point at the savepoint.
    pub insert: UndoPtr,
    /// The transaction's latest undo pointer at the savepoint.
    pub latest: UndoPtr,
}

/// One open transaction.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) xid: Xid,
    pub(crate) cid: CommandId,
    /// Attached lazily on the first write.
    pub(crate) undo: Option<AttachedUndoLog>,
    /// Open savepoints, innermost last.
    pub(crate) subxacts: Vec<SubXactMark>,
    /// True once the transaction recycled a committed slot; its undo
    /// then outlives a toplevel abort's rewind and defers discard.
    pub(crate) wrote_slot_reuse: bool,
}

impl Transaction {
    /// Returns the transaction's xid.
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Returns the current command counter.
    pub fn command_id(&self) -> CommandId {
        self.cid
    }

    /// Advances the command counter, as the executor does between
    /// statements.
    pub fn next_command(&mut self) {
        self.cid = self.cid.next();
    }

    /// True while inside a subtransaction.
    pub fn in_subxact(&self) -> bool {
        !self.subxacts.is_empty()
    }
}

/// The assembled storage engine.
pub struct PalimEngine {
    pub(crate) config: EngineConfig,
    pub(crate) relations: RelationStore,
    pub(crate) undo: UndoLogManager,
    pub(crate) registry: TransactionRegistry,
    pub(crate) wal: Arc<dyn WalSink>,
    pub(crate) rollback_queue: RollbackQueue,
}

impl PalimEngine {
    /// Builds an engine over a fresh undo store.
    pub fn open(
        config: EngineConfig,
        undo_config: UndoStoreConfig,
        wal: Arc<dyn WalSink>,
    ) -> EngineResult<Arc<Self>> {
        let undo = UndoLogManager::new(undo_config)?;
        Ok(Arc::new(Self {
            config,
            relations: RelationStore::new(),
            undo,
            registry: TransactionRegistry::new(),
            wal,
            rollback_queue: RollbackQueue::new(),
        }))
    }

    /// Rebuilds an engine after a crash: the undo store's insertion
    /// points come from the WAL's undo-meta records.
    pub fn recover(
        config: EngineConfig,
        undo_config: UndoStoreConfig,
        wal: Arc<dyn WalSink>,
        hints: &[palim_undo::UndoMetaHint],
    ) -> EngineResult<Arc<Self>> {
        let undo = UndoLogManager::recover(undo_config, hints)?;
        info!(logs = undo.all_logs().len(), "undo store recovered");
        Ok(Arc::new(Self {
            config,
            relations: RelationStore::new(),
            undo,
            registry: TransactionRegistry::new(),
            wal,
            rollback_queue: RollbackQueue::new(),
        }))
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the relation store.
    pub fn relations(&self) -> &RelationStore {
        &self.relations
    }

    /// Returns the transaction registry.
    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    /// Returns the undo store.
    pub fn undo(&self) -> &UndoLogManager {
        &self.undo
    }

    /// Creates a table.
    pub fn create_table(&self, rel_id: RelFileId) -> EngineResult<Arc<Relation>> {
        self.relations.create(rel_id)
    }

    /// Begins a transaction.
    pub fn begin(&self) -> EngineResult<Transaction> {
        let xid = self.registry.begin()?;
        Ok(Transaction {
            xid,
            cid: CommandId::FIRST,
            undo: None,
            subxacts: Vec::new(),
            wrote_slot_reuse: false,
        })
    }

    /// Takes an MVCC snapshot for the transaction's current command.
    pub fn snapshot(&self, txn: &Transaction) -> Snapshot {
        self.registry.snapshot(txn.xid, txn.cid)
    }

    /// Resolves the version of `(rel, tid)` visible to `snapshot`.
    pub fn read(
        &self,
        rel_id: RelFileId,
        tid: Tid,
        snapshot: &Snapshot,
    ) -> EngineResult<Option<Vec<u8>>> {
        let relation = self.relations.get(rel_id)?;
        let page_lock = relation.page(tid.block)?;
        let guard = page_lock.read();
        let view = TablePageRef::new(&guard);
        let slots = EngineSlots {
            page: &view,
            relation: &relation,
            block: tid.block,
        };
        resolve_version(
            &view,
            tid.block,
            tid.offset,
            snapshot,
            &slots,
            &self.undo,
            &self.registry,
        )
    }

    /// Commits a transaction.
    pub fn commit(&self, mut txn: Transaction) -> EngineResult<()> {
        if let Some(attached) = txn.undo.take() {
            self.undo.detach(attached)?;
        }
        self.registry.commit(txn.xid);
        debug!(xid = %txn.xid, "transaction committed");
        Ok(())
    }

    /// Rolls a transaction back. Small transactions apply their undo in
    /// the foreground; larger ones are handed to the undo worker.
    pub fn rollback(&self, mut txn: Transaction) -> EngineResult<()> {
        let Some(attached) = txn.undo.take() else {
            // Read-only transaction: nothing to undo.
            self.registry.abort(txn.xid, false);
            self.registry.undo_applied(txn.xid);
            return Ok(());
        };

        let xid = txn.xid;
        let from = attached.latest();
        let undo_size = attached.undo_size() as usize;
        self.registry.abort(xid, txn.wrote_slot_reuse);
        self.undo.detach(attached)?;

        if undo_size <= self.config.rollback_foreground_limit {
            rollback::apply_undo(self, xid, from)?;
            self.registry.undo_applied(xid);
            debug!(xid = %xid, undo_size, "rolled back in foreground");
        } else {
            self.rollback_queue.push(xid, from);
            debug!(xid = %xid, undo_size, "rollback handed to undo worker");
        }
        Ok(())
    }

    /// Opens a subtransaction, capturing the undo position to rewind to
    /// if it aborts.
    pub fn begin_subxact(&self, txn: &mut Transaction) {
        let mark = match &txn.undo {
            Some(attached) => SubXactMark {
                insert: UndoPtr::from_parts(
                    attached.log_no(),
                    self.undo
                        .log(attached.log_no())
                        .expect("attached log exists")
                        .insert_point(),
                ),
                latest: attached.latest(),
            },
            None => SubXactMark {
                insert: UndoPtr::INVALID,
                latest: UndoPtr::INVALID,
            },
        };
        txn.subxacts.push(mark);
    }

    /// Commits a subtransaction: its undo simply stays part of the
    /// toplevel transaction's.
    pub fn commit_subxact(&self, txn: &mut Transaction) {
        txn.subxacts.pop();
    }

    /// Aborts a subtransaction: applies its undo, then rewinds the
    /// insertion point so the toplevel's undo stays contiguous.
    /// Toplevel aborts never rewind, because their log may hold
    /// slot-reuse records other transactions still reference.
    pub fn rollback_subxact(&self, txn: &mut Transaction) -> EngineResult<()> {
        let mark = txn
            .subxacts
            .pop()
            .expect("rollback_subxact without begin_subxact");

        let Some(attached) = txn.undo.as_mut() else {
            return Ok(());
        };
        if attached.latest() == mark.latest {
            return Ok(());
        }

        rollback::apply_undo_range(self, txn.xid, attached.latest(), mark.latest)?;

        if mark.insert.is_valid() {
            attached.rewind_to(mark.insert, mark.latest);
        }
        Ok(())
    }

    /// Finds the slot already owned by `xid` on a page, checking the
    /// on-page array first and the overflow chain after.
    pub(crate) fn find_existing_slot(
        &self,
        page: &TablePageRef<'_>,
        relation: &Relation,
        block: BlockNumber,
        xid: Xid,
    ) -> EngineResult<Option<(SlotNo, UndoPtr)>> {
        for (no, slot) in page.trans_slots() {
            if slot.xid == xid {
                return Ok(Some((no, slot.undo_ptr)));
            }
        }
        if page
            .flags()
            .contains(palim_storage::page::PageFlags::HAS_OVERFLOW_SLOTS)
        {
            for no in TRANS_SLOTS_PER_PAGE as u16 + 1..=palim_common::constants::MAX_TRANS_SLOTS as u16 {
                let slot_no = SlotNo::new(no);
                match relation.overflow_slot(block, slot_no)? {
                    Some(slot) if slot.xid == xid => {
                        return Ok(Some((slot_no, slot.undo_ptr)))
                    }
                    Some(_) => continue,
                    None => break,
                }
            }
        }
        Ok(None)
    }

    /// Writes a slot's new state, on the page or in the overflow chain.
    pub(crate) fn stamp_slot(
        &self,
        page: &mut palim_storage::TablePage<'_>,
        relation: &Relation,
        block: BlockNumber,
        slot_no: SlotNo,
        xid: Xid,
        undo_ptr: UndoPtr,
    ) -> EngineResult<()> {
        if slot_no.as_u16() as usize <= TRANS_SLOTS_PER_PAGE {
            page.stamp_trans_slot(slot_no, xid, undo_ptr);
        } else if !relation.set_overflow_slot(block, slot_no, TransSlot::new(xid, undo_ptr))? {
            return Err(EngineError::corrupted(format!(
                "overflow slot {} of block {} vanished",
                slot_no, block
            )));
        }
        Ok(())
    }

    /// The status oracle handed to the slot manager and pruning.
    pub(crate) fn oracle(&self) -> impl Fn(Xid) -> SlotDisposition + '_ {
        move |xid| self.registry.disposition(xid)
    }
}

impl std::fmt::Debug for PalimEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PalimEngine")
            .field("undo", &self.undo)
            .finish()
    }
}

/// Slot access spanning a page and its relation's overflow chain.
pub(crate) struct EngineSlots<'a> {
    pub page: &'a TablePageRef<'a>,
    pub relation: &'a Relation,
    pub block: BlockNumber,
}

impl SlotReader for EngineSlots<'_> {
    fn read_slot(&self, slot_no: SlotNo) -> TransSlot {
        if slot_no.as_u16() as usize <= TRANS_SLOTS_PER_PAGE {
            self.page.trans_slot(slot_no)
        } else {
            self.relation
                .overflow_slot(self.block, slot_no)
                .ok()
                .flatten()
                .unwrap_or(TransSlot::EMPTY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::MemWal;
    use tempfile::TempDir;

    fn engine() -> (TempDir, Arc<PalimEngine>) {
        let tmp = TempDir::new().unwrap();
        let engine = PalimEngine::open(
            EngineConfig::default(),
            UndoStoreConfig::new(tmp.path())
                .with_segment_size(64 * 1024)
                .with_sync_on_append(false),
            Arc::new(MemWal::new()),
        )
        .unwrap();
        (tmp, engine)
    }

    #[test]
    fn test_begin_commit() {
        let (_tmp, engine) = engine();
        let txn = engine.begin().unwrap();
        let xid = txn.xid();
        engine.commit(txn).unwrap();
        assert_eq!(
            engine.registry().status(xid),
            palim_mvcc::TxnStatus::Committed
        );
    }

    #[test]
    fn test_rollback_readonly() {
        let (_tmp, engine) = engine();
        let txn = engine.begin().unwrap();
        let xid = txn.xid();
        engine.rollback(txn).unwrap();
        assert_eq!(
            engine.registry().status(xid),
            palim_mvcc::TxnStatus::Aborted {
                pending_undo: false
            }
        );
    }

    #[test]
    fn test_command_counter() {
        let (_tmp, engine) = engine();
        let mut txn = engine.begin().unwrap();
        assert_eq!(txn.command_id(), CommandId::FIRST);
        txn.next_command();
        assert_eq!(txn.command_id().as_u32(), 1);
        engine.commit(txn).unwrap();
    }
}
