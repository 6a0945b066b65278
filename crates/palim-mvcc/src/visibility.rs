//! Snapshot-driven version reconstruction.
//!
//! Given a row's line pointer and a snapshot, the resolver decides which
//! version of the row, if any, the snapshot sees. The newest version
//! sits on the page; every older one is reassembled from undo records by
//! walking the per-page chain hanging off the row's transaction slot.
//!
//! Lock-only records never change visibility and are stepped over.
//! Slot-reuse records splice the displaced transaction's chain back in.
//! When a prior version was written by a different transaction, the
//! prior tuple image stored in the undo record carries that
//! transaction's slot number in its header, and the walk continues in
//! that slot's chain. A walk that would cross the discard horizon stops
//! and treats what it has as all-visible.
//!
//! Callers copy tuple bytes out under at least a shared page lock,
//! because in-place update mutates pages under concurrent pins.

use palim_common::{BlockNumber, EngineError, EngineResult, OffsetNumber, SlotNo, UndoPtr, Xid};
use palim_storage::page::line_pointer::LinePointerState;
use palim_storage::page::tuple::InfoMask;
use palim_storage::page::{TablePageRef, TransSlot, TupleHeader};
use palim_undo::record::{UndoPayload, UndoRecord, UndoRecordType};
use palim_undo::UndoLogManager;

use crate::registry::{TransactionRegistry, TxnStatus};
use crate::snapshot::Snapshot;

/// Snapshot visibility of one operation. The snapshot alone cannot tell
/// an aborted transaction from a committed one (completed xids drop out
/// of its running list either way), so abort status comes from the
/// registry. An aborted operation is never visible, even while its undo
/// is still waiting to be applied.
fn sees_op(snapshot: &Snapshot, registry: &TransactionRegistry, xid: Xid) -> bool {
    if !snapshot.is_own(xid) && matches!(registry.status(xid), TxnStatus::Aborted { .. }) {
        return false;
    }
    snapshot.sees(xid)
}

/// Access to a page's transaction slots, including any that overflowed
/// to a separate page.
pub trait SlotReader {
    /// Reads the slot with the given number.
    fn read_slot(&self, slot_no: SlotNo) -> TransSlot;
}

/// Slot access for pages without overflow slots.
pub struct PageSlots<'a>(pub &'a TablePageRef<'a>);

impl SlotReader for PageSlots<'_> {
    fn read_slot(&self, slot_no: SlotNo) -> TransSlot {
        self.0.trans_slot(slot_no)
    }
}

/// One step of the per-page chain walk.
enum WalkStep {
    /// A record concerning the requested row.
    Record(UndoRecord),
    /// The chain ran past the discard horizon; everything older is
    /// all-visible.
    Horizon,
    /// The chain is exhausted.
    End,
}

/// Where to look for the record preceding the current one.
enum Continuation {
    /// Everything older is all-visible.
    AllVisible,
    /// Continue at this pointer.
    At(UndoPtr),
}

/// Returns true if the record describes an operation on `(block, offset)`.
fn record_covers(record: &UndoRecord, block: BlockNumber, offset: OffsetNumber) -> bool {
    if record.tid.block != block {
        return false;
    }
    match &record.payload {
        UndoPayload::MultiInsert { ranges } => ranges
            .iter()
            .any(|(start, end)| *start <= offset && offset <= *end),
        _ => record.tid.offset == offset,
    }
}

/// Advances along the per-page chain to the next record concerning the
/// row, splicing through slot-reuse records.
fn next_covering(
    undo: &UndoLogManager,
    mut ptr: UndoPtr,
    block: BlockNumber,
    offset: OffsetNumber,
) -> EngineResult<WalkStep> {
    loop {
        if !ptr.is_valid() {
            return Ok(WalkStep::End);
        }
        let record = match undo.read_record(ptr) {
            Ok(record) => record,
            Err(err) if err.is_discarded() => return Ok(WalkStep::Horizon),
            Err(err) => return Err(err.into()),
        };
        match record.record_type() {
            UndoRecordType::XactHeader => return Ok(WalkStep::End),
            UndoRecordType::SlotReuse => {
                // The displaced transaction's chain continues here.
                let UndoPayload::SlotReuse { prev_undo, .. } = record.payload else {
                    unreachable!("payload matches record type");
                };
                ptr = prev_undo;
            }
            _ if record_covers(&record, block, offset) => {
                return Ok(WalkStep::Record(record));
            }
            _ => ptr = record.blkprev,
        }
    }
}

/// Decides where the version preceding `record` lives. The prior tuple
/// header names the slot of the transaction that wrote that version;
/// when it differs from the record's own transaction, the walk crosses
/// into that slot's chain.
fn prior_continuation(
    slots: &dyn SlotReader,
    record: &UndoRecord,
    prior_header_bytes: &[u8],
) -> Continuation {
    let prior_header = TupleHeader::from_bytes(prior_header_bytes);
    let prior_slot = prior_header.slot();
    if prior_slot.is_frozen() {
        return Continuation::AllVisible;
    }

    let slot = slots.read_slot(prior_slot);
    if slot.is_free() || slot.is_frozen() {
        return Continuation::AllVisible;
    }
    if slot.xid == record.xid {
        // Same transaction: its own per-page chain links the records.
        Continuation::At(record.blkprev)
    } else {
        Continuation::At(slot.undo_ptr)
    }
}

/// Resolves `(block, offset)` under `snapshot` to the visible tuple
/// image, or `None` when no version is visible.
pub fn resolve_version(
    page: &TablePageRef<'_>,
    block: BlockNumber,
    offset: OffsetNumber,
    snapshot: &Snapshot,
    slots: &dyn SlotReader,
    undo: &UndoLogManager,
    registry: &TransactionRegistry,
) -> EngineResult<Option<Vec<u8>>> {
    let Some(lp) = page.line_pointer(offset) else {
        return Ok(None);
    };

    let (chain_head, image) = match lp.state {
        LinePointerState::Unused | LinePointerState::Dead => return Ok(None),
        LinePointerState::Deleted => {
            // The tuple is gone; only the slot recorded in the line
            // pointer can lead us to the prior version.
            let slot = slots.read_slot(lp.slot());
            if slot.is_frozen() || slot.is_free() {
                return Ok(None);
            }
            (slot.undo_ptr, None)
        }
        LinePointerState::Normal => {
            let tuple = page.tuple_bytes(offset).ok_or_else(|| {
                EngineError::corrupted("normal line pointer without tuple bytes")
            })?;
            let tuple_header = page.tuple_header(offset).expect("tuple bytes exist");
            let slot_no = tuple_header.slot();
            if slot_no.is_frozen() {
                return Ok(Some(tuple.to_vec()));
            }

            let slot = slots.read_slot(slot_no);
            let reused = tuple_header.infomask.contains(InfoMask::SLOT_REUSED);

            if tuple_header.infomask.contains(InfoMask::SPECULATIVE)
                && !snapshot.is_own(slot.xid)
                && !snapshot.is_dirty()
            {
                // Provisional row: dirty snapshots and the inserter only.
                return Ok(None);
            }

            if !reused
                && !tuple_header.infomask.contains(InfoMask::HAS_LOCK)
                && sees_op(snapshot, registry, slot.xid)
            {
                // The newest operation on this row is a data operation
                // by the slot's transaction, and it is visible.
                return Ok(Some(tuple.to_vec()));
            }

            (slot.undo_ptr, Some(tuple.to_vec()))
        }
    };

    walk_chain(undo, slots, chain_head, block, offset, snapshot, registry, image)
}

#[allow(clippy::too_many_arguments)]
fn walk_chain(
    undo: &UndoLogManager,
    slots: &dyn SlotReader,
    head: UndoPtr,
    block: BlockNumber,
    offset: OffsetNumber,
    snapshot: &Snapshot,
    registry: &TransactionRegistry,
    mut image: Option<Vec<u8>>,
) -> EngineResult<Option<Vec<u8>>> {
    let mut ptr = head;
    loop {
        let record = match next_covering(undo, ptr, block, offset)? {
            // Past the horizon or past the chain: what we hold is the
            // oldest reachable version and counts as all-visible.
            WalkStep::Horizon | WalkStep::End => return Ok(image),
            WalkStep::Record(record) => record,
        };

        let continuation = match &record.payload {
            UndoPayload::Lock { prior_header, .. } => {
                // Lockers do not change what is visible; move on to the
                // prior data operation.
                prior_continuation(slots, &record, prior_header)
            }
            UndoPayload::Insert { spec_token } => {
                if spec_token.is_some() && !snapshot.is_own(record.xid) && !snapshot.is_dirty() {
                    return Ok(None);
                }
                return if sees_op(snapshot, registry, record.xid) {
                    Ok(image)
                } else {
                    Ok(None)
                };
            }
            UndoPayload::MultiInsert { .. } => {
                return if sees_op(snapshot, registry, record.xid) {
                    Ok(image)
                } else {
                    Ok(None)
                };
            }
            UndoPayload::InPlaceUpdate { old_tuple } => {
                if sees_op(snapshot, registry, record.xid) {
                    return Ok(image);
                }
                let continuation = prior_continuation(slots, &record, old_tuple);
                image = Some(old_tuple.to_vec());
                continuation
            }
            UndoPayload::Delete { tuple, .. } => {
                if sees_op(snapshot, registry, record.xid) {
                    return Ok(None);
                }
                let continuation = prior_continuation(slots, &record, tuple);
                image = Some(tuple.to_vec());
                continuation
            }
            UndoPayload::NonInPlaceUpdate { old_tuple, .. } => {
                if sees_op(snapshot, registry, record.xid) {
                    // The row moved away; this position holds nothing.
                    return Ok(None);
                }
                let continuation = prior_continuation(slots, &record, old_tuple);
                image = Some(old_tuple.to_vec());
                continuation
            }
            UndoPayload::XactHeader { .. } | UndoPayload::SlotReuse { .. } => {
                unreachable!("filtered out by next_covering");
            }
        };

        match continuation {
            Continuation::AllVisible => return Ok(image),
            Continuation::At(next) => ptr = next,
        }
    }
}

/// Reports the xid that inserted the row, by walking to the oldest
/// insert record of its chain. Returns [`Xid::FROZEN`] when the chain
/// has been discarded (the insert is all-visible history).
pub fn fetch_insert_xid(
    page: &TablePageRef<'_>,
    block: BlockNumber,
    offset: OffsetNumber,
    slots: &dyn SlotReader,
    undo: &UndoLogManager,
) -> EngineResult<Option<Xid>> {
    let Some(tuple_header) = page.tuple_header(offset) else {
        return Ok(None);
    };
    let slot_no = tuple_header.slot();
    if slot_no.is_frozen() {
        return Ok(Some(Xid::FROZEN));
    }

    let mut ptr = slots.read_slot(slot_no).undo_ptr;
    loop {
        match next_covering(undo, ptr, block, offset)? {
            WalkStep::Horizon => return Ok(Some(Xid::FROZEN)),
            WalkStep::End => return Ok(None),
            WalkStep::Record(record) => {
                let continuation = match &record.payload {
                    UndoPayload::Insert { .. } | UndoPayload::MultiInsert { .. } => {
                        return Ok(Some(record.xid));
                    }
                    UndoPayload::Lock { prior_header, .. } => {
                        prior_continuation(slots, &record, prior_header)
                    }
                    UndoPayload::InPlaceUpdate { old_tuple }
                    | UndoPayload::NonInPlaceUpdate { old_tuple, .. } => {
                        prior_continuation(slots, &record, old_tuple)
                    }
                    UndoPayload::Delete { tuple, .. } => {
                        prior_continuation(slots, &record, tuple)
                    }
                    UndoPayload::XactHeader { .. } | UndoPayload::SlotReuse { .. } => {
                        unreachable!("filtered out by next_covering");
                    }
                };
                match continuation {
                    Continuation::AllVisible => return Ok(Some(Xid::FROZEN)),
                    Continuation::At(next) => ptr = next,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palim_common::constants::PAGE_SIZE;
    use palim_common::{CommandId, RelFileId, SpecToken, Tid};
    use palim_storage::page::{LinePointer, LockMode, TablePage, TupleHeader};
    use palim_undo::record::UndoRecordInfo;
    use palim_undo::{AttachedUndoLog, DiscardDecision, UndoStoreConfig};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        undo: UndoLogManager,
        registry: TransactionRegistry,
        page: Vec<u8>,
    }

    const BLOCK: BlockNumber = BlockNumber::new(1);
    const REL: RelFileId = RelFileId::new(500);

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let undo = UndoLogManager::new(
            UndoStoreConfig::new(tmp.path())
                .with_segment_size(64 * 1024)
                .with_sync_on_append(false),
        )
        .unwrap();
        let mut page = vec![0u8; PAGE_SIZE];
        TablePage::new(&mut page).init_data();
        Fixture {
            _tmp: tmp,
            undo,
            registry: TransactionRegistry::new(),
            page,
        }
    }

    /// A snapshot whose horizon sits at `boundary`: xids below it are
    /// visible, everything else is not.
    fn snapshot_at(boundary: u32) -> Snapshot {
        let xid = Xid::from_parts(0, boundary);
        Snapshot::new(xid, xid, vec![], Xid::INVALID, CommandId::FIRST)
    }

    fn tuple(slot: SlotNo, payload: &[u8]) -> Vec<u8> {
        TupleHeader::for_insert(slot).with_payload(payload)
    }

    /// Runs one DML-shaped step: append the undo record with correct
    /// chain links, then stamp the slot with the new chain head.
    fn append_and_stamp(
        fx: &mut Fixture,
        attached: &mut AttachedUndoLog,
        slot_no: SlotNo,
        offset: OffsetNumber,
        payload: UndoPayload,
    ) -> UndoRecordInfo {
        let mut page = TablePage::new(&mut fx.page);
        let slot = page.trans_slot(slot_no);
        let blkprev = if slot.xid == attached.xid() {
            slot.undo_ptr
        } else {
            UndoPtr::INVALID
        };
        let record = UndoRecord::new(
            REL,
            Tid::new(BLOCK, offset),
            attached.xid(),
            attached.latest(),
            blkprev,
            payload,
        );
        let ptr = attached.append(&record).unwrap();
        page.stamp_trans_slot(slot_no, attached.xid(), ptr);
        UndoRecordInfo { ptr, record }
    }

    fn resolve(fx: &Fixture, offset: OffsetNumber, snapshot: &Snapshot) -> Option<Vec<u8>> {
        let view = TablePageRef::new(&fx.page);
        let slots = PageSlots(&view);
        resolve_version(&view, BLOCK, offset, snapshot, &slots, &fx.undo, &fx.registry).unwrap()
    }

    #[test]
    fn test_unused_offset_resolves_to_none() {
        let fx = fixture();
        assert_eq!(resolve(&fx, OffsetNumber::new(1), &Snapshot::dirty()), None);
    }

    #[test]
    fn test_insert_visible_after_commit_invisible_before() {
        let mut fx = fixture();
        let t1 = Xid::from_parts(0, 10);
        let mut attached = fx.undo.attach(t1).unwrap();

        let slot_no = SlotNo::new(1);
        let bytes = tuple(slot_no, b"a");
        let offset = {
            let mut page = TablePage::new(&mut fx.page);
            page.add_tuple(&bytes, None).unwrap()
        };
        append_and_stamp(
            &mut fx,
            &mut attached,
            slot_no,
            offset,
            UndoPayload::Insert { spec_token: None },
        );
        fx.undo.detach(attached).unwrap();

        assert_eq!(resolve(&fx, offset, &snapshot_at(11)), Some(bytes));
        assert_eq!(resolve(&fx, offset, &snapshot_at(10)), None);
    }

    #[test]
    fn test_in_place_update_old_version_from_undo() {
        let mut fx = fixture();
        let slot_no = SlotNo::new(1);

        // t1 inserts "a" and commits.
        let t1 = Xid::from_parts(0, 10);
        let mut attached = fx.undo.attach(t1).unwrap();
        let old_bytes = tuple(slot_no, b"a");
        let offset = {
            let mut page = TablePage::new(&mut fx.page);
            page.add_tuple(&old_bytes, None).unwrap()
        };
        append_and_stamp(
            &mut fx,
            &mut attached,
            slot_no,
            offset,
            UndoPayload::Insert { spec_token: None },
        );
        fx.undo.detach(attached).unwrap();

        // t2 updates to "b" in place through the same slot.
        let t2 = Xid::from_parts(0, 12);
        let mut attached = fx.undo.attach(t2).unwrap();
        append_and_stamp(
            &mut fx,
            &mut attached,
            slot_no,
            offset,
            UndoPayload::InPlaceUpdate {
                old_tuple: old_bytes.clone().into(),
            },
        );
        let mut new_header = TupleHeader::for_insert(slot_no);
        new_header.infomask |= InfoMask::IN_PLACE_UPDATED;
        let new_bytes = new_header.with_payload(b"b");
        {
            let mut page = TablePage::new(&mut fx.page);
            assert!(page.replace_tuple(offset, &new_bytes));
        }
        fx.undo.detach(attached).unwrap();

        // After t2: the new image. Between t1 and t2: the prior image
        // out of the undo chain.
        assert_eq!(resolve(&fx, offset, &snapshot_at(13)), Some(new_bytes));
        assert_eq!(resolve(&fx, offset, &snapshot_at(11)), Some(old_bytes));
        assert_eq!(resolve(&fx, offset, &snapshot_at(10)), None);
    }

    #[test]
    fn test_deleted_row_prior_version_via_slot() {
        let mut fx = fixture();
        let slot_no = SlotNo::new(1);

        let t1 = Xid::from_parts(0, 10);
        let mut attached = fx.undo.attach(t1).unwrap();
        let bytes = tuple(slot_no, b"doomed");
        let offset = {
            let mut page = TablePage::new(&mut fx.page);
            page.add_tuple(&bytes, None).unwrap()
        };
        append_and_stamp(
            &mut fx,
            &mut attached,
            slot_no,
            offset,
            UndoPayload::Insert { spec_token: None },
        );
        fx.undo.detach(attached).unwrap();

        // t2 deletes: the delete undo holds the tuple, the pointer
        // flips to Deleted carrying the slot.
        let t2 = Xid::from_parts(0, 12);
        let mut attached = fx.undo.attach(t2).unwrap();
        append_and_stamp(
            &mut fx,
            &mut attached,
            slot_no,
            offset,
            UndoPayload::Delete {
                tuple: bytes.clone().into(),
                subxact: None,
            },
        );
        {
            let mut page = TablePage::new(&mut fx.page);
            page.set_line_pointer(offset, LinePointer::deleted(slot_no));
        }
        fx.undo.detach(attached).unwrap();

        // Before t2 the deleted row is still visible, recovered from
        // the delete record's payload; after t2 it is gone.
        assert_eq!(resolve(&fx, offset, &snapshot_at(11)), Some(bytes));
        assert_eq!(resolve(&fx, offset, &snapshot_at(13)), None);
    }

    #[test]
    fn test_lock_record_skipped() {
        let mut fx = fixture();

        // t1 inserts via slot 1 and commits.
        let t1 = Xid::from_parts(0, 10);
        let mut attached = fx.undo.attach(t1).unwrap();
        let bytes = tuple(SlotNo::new(1), b"locked row");
        let offset = {
            let mut page = TablePage::new(&mut fx.page);
            page.add_tuple(&bytes, None).unwrap()
        };
        append_and_stamp(
            &mut fx,
            &mut attached,
            SlotNo::new(1),
            offset,
            UndoPayload::Insert { spec_token: None },
        );
        fx.undo.detach(attached).unwrap();

        // t2 locks the row via slot 2 and repoints the tuple there.
        let t2 = Xid::from_parts(0, 12);
        let mut attached = fx.undo.attach(t2).unwrap();
        let prior_header = fx.page_header_bytes(offset);
        append_and_stamp(
            &mut fx,
            &mut attached,
            SlotNo::new(2),
            offset,
            UndoPayload::Lock {
                prior_header: prior_header.into(),
                mode: LockMode::Share.as_u8(),
                subxact: None,
            },
        );
        {
            let mut page = TablePage::new(&mut fx.page);
            let mut tuple_header = page.tuple_header(offset).unwrap();
            tuple_header.set_slot(SlotNo::new(2));
            tuple_header.set_lock_mode(LockMode::Share);
            page.set_tuple_header(offset, tuple_header);
        }
        fx.undo.detach(attached).unwrap();

        // A snapshot that sees t1 but not the locker t2 still sees the
        // row: the lock record is stepped over into t1's chain.
        let resolved = resolve(&fx, offset, &snapshot_at(11)).unwrap();
        assert_eq!(&resolved[5..], b"locked row");

        // A snapshot that sees neither finds the insert invisible.
        assert_eq!(resolve(&fx, offset, &snapshot_at(9)), None);
    }

    impl Fixture {
        fn page_header_bytes(&self, offset: OffsetNumber) -> Vec<u8> {
            let view = TablePageRef::new(&self.page);
            view.tuple_bytes(offset).unwrap()[..5].to_vec()
        }
    }

    #[test]
    fn test_cross_slot_update_chain() {
        let mut fx = fixture();

        // t1 inserts via slot 1, commits; t2 updates in place via
        // slot 2.
        let t1 = Xid::from_parts(0, 10);
        let mut attached = fx.undo.attach(t1).unwrap();
        let old_bytes = tuple(SlotNo::new(1), b"v1");
        let offset = {
            let mut page = TablePage::new(&mut fx.page);
            page.add_tuple(&old_bytes, None).unwrap()
        };
        append_and_stamp(
            &mut fx,
            &mut attached,
            SlotNo::new(1),
            offset,
            UndoPayload::Insert { spec_token: None },
        );
        fx.undo.detach(attached).unwrap();

        let t2 = Xid::from_parts(0, 12);
        let mut attached = fx.undo.attach(t2).unwrap();
        append_and_stamp(
            &mut fx,
            &mut attached,
            SlotNo::new(2),
            offset,
            UndoPayload::InPlaceUpdate {
                old_tuple: old_bytes.clone().into(),
            },
        );
        let mut new_header = TupleHeader::for_insert(SlotNo::new(2));
        new_header.infomask |= InfoMask::IN_PLACE_UPDATED;
        let new_bytes = new_header.with_payload(b"v2");
        {
            let mut page = TablePage::new(&mut fx.page);
            assert!(page.replace_tuple(offset, &new_bytes));
        }
        fx.undo.detach(attached).unwrap();

        // Sees t1, not t2: prior image, reached across the slot change.
        assert_eq!(resolve(&fx, offset, &snapshot_at(11)), Some(old_bytes));
        // Sees neither: the insert itself is invisible.
        assert_eq!(resolve(&fx, offset, &snapshot_at(9)), None);
        // Sees both: current image.
        assert_eq!(resolve(&fx, offset, &snapshot_at(13)), Some(new_bytes));
    }

    #[test]
    fn test_slot_reuse_chain_recovers_displaced_version() {
        let mut fx = fixture();
        let slot_no = SlotNo::new(1);

        // t1 inserts via slot 1 and commits.
        let t1 = Xid::from_parts(0, 10);
        let mut attached = fx.undo.attach(t1).unwrap();
        let bytes = tuple(slot_no, b"old row");
        let offset = {
            let mut page = TablePage::new(&mut fx.page);
            page.add_tuple(&bytes, None).unwrap()
        };
        let t1_info = append_and_stamp(
            &mut fx,
            &mut attached,
            slot_no,
            offset,
            UndoPayload::Insert { spec_token: None },
        );
        fx.undo.detach(attached).unwrap();

        // t5 recycles slot 1: slot-reuse record, tuple flagged, then t5
        // inserts its own row through the same slot.
        let t5 = Xid::from_parts(0, 50);
        let mut attached = fx.undo.attach(t5).unwrap();
        let reuse = UndoRecord::new(
            REL,
            Tid::new(BLOCK, OffsetNumber::INVALID),
            t5,
            attached.latest(),
            UndoPtr::INVALID,
            UndoPayload::SlotReuse {
                prev_xid: t1,
                prev_undo: t1_info.ptr,
            },
        );
        let reuse_ptr = attached.append(&reuse).unwrap();
        {
            let mut page = TablePage::new(&mut fx.page);
            let mut tuple_header = page.tuple_header(offset).unwrap();
            tuple_header.infomask |= InfoMask::SLOT_REUSED;
            page.set_tuple_header(offset, tuple_header);
            page.stamp_trans_slot(slot_no, t5, reuse_ptr);
        }
        let offset2 = {
            let mut page = TablePage::new(&mut fx.page);
            page.add_tuple(&tuple(slot_no, b"new row"), None).unwrap()
        };
        append_and_stamp(
            &mut fx,
            &mut attached,
            slot_no,
            offset2,
            UndoPayload::Insert { spec_token: None },
        );
        fx.undo.detach(attached).unwrap();

        // A reader between t1 and t5 still sees the old row: the walk
        // hops the slot-reuse record into t1's chain and finds the
        // insert there; the slot itself no longer knows t1's xid.
        assert_eq!(resolve(&fx, offset, &snapshot_at(20)), Some(bytes));
        // And it does not see t5's new row.
        assert_eq!(resolve(&fx, offset2, &snapshot_at(20)), None);
    }

    #[test]
    fn test_speculative_hidden_from_mvcc_visible_to_dirty() {
        let mut fx = fixture();
        let slot_no = SlotNo::new(1);

        let t1 = Xid::from_parts(0, 10);
        let mut attached = fx.undo.attach(t1).unwrap();
        let mut header = TupleHeader::for_insert(slot_no);
        header.infomask |= InfoMask::SPECULATIVE;
        let bytes = header.with_payload(b"spec");
        let offset = {
            let mut page = TablePage::new(&mut fx.page);
            page.add_tuple(&bytes, None).unwrap()
        };
        append_and_stamp(
            &mut fx,
            &mut attached,
            slot_no,
            offset,
            UndoPayload::Insert {
                spec_token: Some(SpecToken::new(99)),
            },
        );
        fx.undo.detach(attached).unwrap();

        // Even a snapshot that would see t1 ignores the provisional
        // row; a dirty snapshot sees it.
        assert_eq!(resolve(&fx, offset, &snapshot_at(11)), None);
        assert_eq!(resolve(&fx, offset, &Snapshot::dirty()), Some(bytes));
    }

    #[test]
    fn test_discarded_chain_treated_all_visible() {
        let mut fx = fixture();
        let slot_no = SlotNo::new(1);

        let t1 = Xid::from_parts(0, 10);
        let mut attached = fx.undo.attach(t1).unwrap();
        let bytes = tuple(slot_no, b"settled");
        let offset = {
            let mut page = TablePage::new(&mut fx.page);
            page.add_tuple(&bytes, None).unwrap()
        };
        append_and_stamp(
            &mut fx,
            &mut attached,
            slot_no,
            offset,
            UndoPayload::Insert { spec_token: None },
        );
        let log_no = attached.log_no();
        fx.undo.detach(attached).unwrap();

        // Discard everything in the log.
        let log = fx.undo.log(log_no).unwrap();
        let horizon = log
            .compute_discard(&|_: Xid| DiscardDecision::Discard)
            .unwrap()
            .unwrap();
        log.apply_discard(horizon).unwrap();

        // Any snapshot now sees the on-page row: its history sits below
        // the horizon.
        assert_eq!(resolve(&fx, offset, &snapshot_at(1)), Some(bytes));
    }

    #[test]
    fn test_fetch_insert_xid_through_update() {
        let mut fx = fixture();
        let slot_no = SlotNo::new(1);

        let t1 = Xid::from_parts(0, 10);
        let mut attached = fx.undo.attach(t1).unwrap();
        let bytes = tuple(slot_no, b"x");
        let offset = {
            let mut page = TablePage::new(&mut fx.page);
            page.add_tuple(&bytes, None).unwrap()
        };
        append_and_stamp(
            &mut fx,
            &mut attached,
            slot_no,
            offset,
            UndoPayload::Insert { spec_token: None },
        );
        // An in-place update on top must not hide the inserting xid.
        append_and_stamp(
            &mut fx,
            &mut attached,
            slot_no,
            offset,
            UndoPayload::InPlaceUpdate {
                old_tuple: bytes.into(),
            },
        );
        fx.undo.detach(attached).unwrap();

        let view = TablePageRef::new(&fx.page);
        let slots = PageSlots(&view);
        let found = fetch_insert_xid(&view, BLOCK, offset, &slots, &fx.undo).unwrap();
        assert_eq!(found, Some(t1));
    }
}
