//! Rollback: applying undo on abort.
//!
//! The transaction's undo is read newest-first along its back-links, in
//! windows, then grouped by page and applied page-at-a-time under the
//! page's exclusive lock, in ascending (relation, block) order. Each
//! applied page batch emits one WAL record describing the reverted
//! state. A record whose page slot is missing or already rewound past it
//! is skipped: the relation may have been dropped, truncated or the
//! record applied before a crash.
//!
//! The same procedure serves the foreground path (small transactions,
//! subtransaction aborts) and the background undo worker; both emit
//! identical WAL.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use palim_common::constants::TRANS_SLOTS_PER_PAGE;
use palim_common::{
    BlockNumber, EngineError, EngineResult, OffsetNumber, RelFileId, SlotNo, UndoPtr, Xid,
};
use palim_storage::page::{LinePointer, LinePointerState, TablePage, TransSlot, TupleHeader};
use palim_storage::relation::Relation;
use palim_undo::record::{UndoPayload, UndoRecordInfo, UndoRecordType};

use crate::engine::PalimEngine;
use crate::wal::WalRecord;

/// Applies all undo of an aborted toplevel transaction, starting at its
/// newest record.
pub fn apply_undo(engine: &PalimEngine, xid: Xid, from: UndoPtr) -> EngineResult<()> {
    apply_undo_internal(engine, xid, from, UndoPtr::INVALID, None)
}

/// Applies the undo between `from` (newest, inclusive) and `until`
/// (exclusive): the subtransaction-abort path.
pub fn apply_undo_range(
    engine: &PalimEngine,
    xid: Xid,
    from: UndoPtr,
    until: UndoPtr,
) -> EngineResult<()> {
    apply_undo_internal(engine, xid, from, until, None)
}

/// Worker entry point: as [`apply_undo`], with a cancellation flag
/// checked between page batches.
pub fn apply_undo_cancellable(
    engine: &PalimEngine,
    xid: Xid,
    from: UndoPtr,
    cancel: &AtomicBool,
) -> EngineResult<()> {
    apply_undo_internal(engine, xid, from, UndoPtr::INVALID, Some(cancel))
}

fn apply_undo_internal(
    engine: &PalimEngine,
    xid: Xid,
    from: UndoPtr,
    until: UndoPtr,
    cancel: Option<&AtomicBool>,
) -> EngineResult<()> {
    let window_limit = engine.config().rollback_window;
    let mut cursor = from;

    loop {
        // One window of records, newest first.
        let mut window: Vec<UndoRecordInfo> = Vec::new();
        let mut window_bytes = 0usize;

        while cursor.is_valid() && cursor != until && window_bytes < window_limit {
            let record = engine.undo().read_record(cursor)?;
            if record.record_type() == UndoRecordType::XactHeader {
                cursor = UndoPtr::INVALID;
                break;
            }
            if record.xid != xid {
                return Err(EngineError::corrupted(format!(
                    "undo back-link of {} reached a record of {}",
                    xid, record.xid
                )));
            }
            let next = record.prev_undo;
            window_bytes += record.encoded_size();
            window.push(UndoRecordInfo {
                ptr: cursor,
                record,
            });
            cursor = next;
        }

        if window.is_empty() {
            break;
        }
        apply_window(engine, xid, &window, cancel)?;

        if !cursor.is_valid() || cursor == until {
            break;
        }
    }

    debug!(xid = %xid, "undo applied");
    Ok(())
}

/// Applies one window: group by page, sort by (relation, block), apply
/// each page's records under its exclusive lock.
fn apply_window(
    engine: &PalimEngine,
    xid: Xid,
    window: &[UndoRecordInfo],
    cancel: Option<&AtomicBool>,
) -> EngineResult<()> {
    let mut by_page: BTreeMap<(RelFileId, BlockNumber), Vec<&UndoRecordInfo>> = BTreeMap::new();
    for info in window {
        by_page
            .entry((info.record.rel, info.record.tid.block))
            .or_default()
            .push(info);
    }

    for ((rel_id, block), records) in by_page {
        if let Some(cancel) = cancel {
            if cancel.load(Ordering::Acquire) {
                return Err(EngineError::corrupted("undo application cancelled"));
            }
        }

        let relation = match engine.relations().get(rel_id) {
            Ok(relation) => relation,
            Err(_) => {
                // Relation dropped since the abort: nothing to revert.
                debug!(%rel_id, "skipping undo for dropped relation");
                continue;
            }
        };
        if relation.block_count() <= block.as_u32() as usize {
            // Truncated or rewritten under us.
            debug!(%rel_id, %block, "skipping undo for vanished block");
            continue;
        }

        apply_page_batch(engine, &relation, rel_id, block, xid, &records)?;
    }
    Ok(())
}

fn apply_page_batch(
    engine: &PalimEngine,
    relation: &Relation,
    rel_id: RelFileId,
    block: BlockNumber,
    xid: Xid,
    records: &[&UndoRecordInfo],
) -> EngineResult<()> {
    let page_lock = relation.page(block)?;
    let mut guard = page_lock.write();
    let mut page = TablePage::new(&mut guard);

    let mut oldest_applied: Option<&UndoRecordInfo> = None;

    for info in records {
        let Some((slot_no, slot)) = find_xid_slot(&page, relation, block, xid)? else {
            // Slot already cleared: everything here was applied.
            debug!(%block, xid = %xid, "undo batch found no slot; skipping");
            break;
        };
        if slot.undo_ptr < info.ptr {
            // Already rewound past this record.
            continue;
        }

        apply_one(&mut page, relation, block, slot_no, info)?;
        oldest_applied = Some(info);
    }

    let slot_rewind = match oldest_applied {
        None => return Ok(()),
        Some(info) => info.record.blkprev,
    };

    // Rewind the slot to the newest unapplied record, or clear it when
    // the page's whole chain for this transaction was applied.
    if let Some((slot_no, slot)) = find_xid_slot(&page, relation, block, xid)? {
        if slot.xid == xid {
            let new_slot = if slot_rewind.is_valid() {
                TransSlot::new(xid, slot_rewind)
            } else {
                TransSlot::EMPTY
            };
            if slot_no.as_u16() as usize <= TRANS_SLOTS_PER_PAGE {
                page.set_trans_slot(slot_no, new_slot);
            } else {
                relation.set_overflow_slot(block, slot_no, new_slot)?;
            }
        }
    }

    let lsn = engine.wal.emit(&WalRecord::UndoApply {
        rel: rel_id,
        block,
        xid,
        slot_rewind,
    })?;
    page.page_header().set_lsn(lsn);
    Ok(())
}

/// Finds the transaction's slot on the page or its overflow chain.
fn find_xid_slot(
    page: &TablePage<'_>,
    relation: &Relation,
    block: BlockNumber,
    xid: Xid,
) -> EngineResult<Option<(SlotNo, TransSlot)>> {
    for (no, slot) in page.trans_slots() {
        if slot.xid == xid {
            return Ok(Some((no, slot)));
        }
    }
    for no in TRANS_SLOTS_PER_PAGE as u16 + 1..=palim_common::constants::MAX_TRANS_SLOTS as u16 {
        let slot_no = SlotNo::new(no);
        match relation.overflow_slot(block, slot_no)? {
            Some(slot) if slot.xid == xid => return Ok(Some((slot_no, slot))),
            Some(_) => continue,
            None => break,
        }
    }
    Ok(None)
}

/// Applies one undo record to its page.
fn apply_one(
    page: &mut TablePage<'_>,
    relation: &Relation,
    block: BlockNumber,
    our_slot: SlotNo,
    info: &UndoRecordInfo,
) -> EngineResult<()> {
    let offset = info.record.tid.offset;
    match &info.record.payload {
        UndoPayload::Insert { .. } => {
            retract_if_normal(page, offset);
        }
        UndoPayload::MultiInsert { ranges } => {
            for (start, end) in ranges {
                for off in (start.as_u16()..=end.as_u16()).rev() {
                    retract_if_normal(page, OffsetNumber::new(off));
                }
            }
        }
        UndoPayload::Delete { tuple, .. } | UndoPayload::NonInPlaceUpdate { old_tuple: tuple, .. } => {
            restore_tuple(page, offset, tuple)?;
        }
        UndoPayload::InPlaceUpdate { old_tuple } => {
            if !page.replace_tuple(offset, old_tuple) {
                warn!(%block, %offset, "in-place update rollback found no room");
                return Err(EngineError::out_of_space(old_tuple.len(), page.free_space()));
            }
        }
        UndoPayload::Lock { prior_header, .. } => {
            if page
                .line_pointer(offset)
                .map(|lp| lp.is_normal())
                .unwrap_or(false)
            {
                page.set_tuple_header(offset, TupleHeader::from_bytes(prior_header));
            }
        }
        UndoPayload::SlotReuse {
            prev_xid,
            prev_undo,
        } => {
            // Hand the slot back to the displaced transaction.
            let restored = TransSlot::new(*prev_xid, *prev_undo);
            if our_slot.as_u16() as usize <= TRANS_SLOTS_PER_PAGE {
                page.set_trans_slot(our_slot, restored);
            } else {
                relation.set_overflow_slot(block, our_slot, restored)?;
            }
        }
        UndoPayload::XactHeader { .. } => {
            unreachable!("transaction headers are not collected into windows");
        }
    }
    Ok(())
}

fn retract_if_normal(page: &mut TablePage<'_>, offset: OffsetNumber) {
    if page
        .line_pointer(offset)
        .map(|lp| lp.is_normal())
        .unwrap_or(false)
    {
        page.retract_tuple(offset);
    }
}

/// Puts a deleted or migrated-away tuple back at its original offset.
fn restore_tuple(page: &mut TablePage<'_>, offset: OffsetNumber, tuple: &[u8]) -> EngineResult<()> {
    match page.line_pointer(offset) {
        Some(lp) if lp.state == LinePointerState::Deleted => {
            page.set_line_pointer(offset, LinePointer::UNUSED);
        }
        Some(lp) if lp.is_unused() => {}
        Some(_) | None => {
            // Already restored, or the page was rewritten.
            return Ok(());
        }
    }
    if page.add_tuple(tuple, Some(offset)).is_none() {
        // Make room and try once more; the tuple fit before the delete.
        page.repair_fragmentation();
        page.add_tuple(tuple, Some(offset)).ok_or_else(|| {
            EngineError::corrupted(format!(
                "could not restore tuple at offset {} during rollback",
                offset
            ))
        })?;
    }
    Ok(())
}
