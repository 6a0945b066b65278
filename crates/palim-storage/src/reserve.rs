//! Transaction-slot reservation and reuse.
//!
//! Every mutation needs a transaction slot on its page. Reservation runs
//! under the page's exclusive lock and tries, in order: the transaction's
//! own slot, a free or trivially reusable slot, recycling a committed
//! slot behind a slot-reuse undo record, and finally overflow-page
//! allocation (signalled back to the caller). When even that fails, a
//! toplevel transaction may recycle all committed slots in bulk; a
//! subtransaction must give up so its caller can release page locks and
//! wait instead of deadlocking.

use palim_common::{EngineError, EngineResult, OffsetNumber, SlotNo, UndoPtr, Xid};

use crate::page::line_pointer::LinePointerState;
use crate::page::tuple::InfoMask;
use crate::page::{LinePointer, TablePage, TransSlot};

/// What the status oracle knows about a slot's owning transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDisposition {
    /// Still running; the slot is untouchable.
    InProgress,
    /// Committed and visible to every snapshot; trivially reusable.
    CommittedAllVisible,
    /// Committed but some snapshot may still need its undo; reusable
    /// only behind a slot-reuse undo record.
    Committed,
    /// Aborted with undo fully applied; reusable.
    AbortedUndone,
    /// Aborted but its undo has not been applied yet; untouchable until
    /// the rollback engine gets to it.
    AbortedPending,
}

/// Transaction-status oracle used by reservation, pruning and freezing.
pub trait SlotOracle {
    /// Classifies the transaction owning a slot.
    fn disposition(&self, xid: Xid) -> SlotDisposition;
}

impl<F: Fn(Xid) -> SlotDisposition> SlotOracle for F {
    fn disposition(&self, xid: Xid) -> SlotDisposition {
        self(xid)
    }
}

/// Result of a slot reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRequest {
    /// The transaction already owns a slot on this page.
    Existing {
        /// The owned slot.
        slot: SlotNo,
        /// Its current newest undo pointer, the per-page chain
        /// predecessor for the next record.
        undo_ptr: UndoPtr,
    },
    /// A slot was freed up and cleared for the transaction.
    Reserved {
        /// The reserved slot.
        slot: SlotNo,
    },
    /// All on-page slots belong to in-progress transactions; the caller
    /// should try an overflow-page slot next.
    TryOverflow,
}

/// Sink for the slot-reuse undo records reservation must emit before
/// recycling a committed slot. The engine appends the record to the
/// recycling transaction's undo log.
pub type ReuseSink<'a> = dyn FnMut(SlotNo, TransSlot) -> EngineResult<()> + 'a;

/// Finds or reserves a transaction slot for `xid` on the page.
pub fn find_or_reserve_slot(
    page: &mut TablePage<'_>,
    xid: Xid,
    oracle: &dyn SlotOracle,
    emit_reuse: &mut ReuseSink<'_>,
) -> EngineResult<SlotRequest> {
    let slots = page.trans_slots();

    // The transaction may already have a slot here.
    for (no, slot) in &slots {
        if slot.xid == xid {
            return Ok(SlotRequest::Existing {
                slot: *no,
                undo_ptr: slot.undo_ptr,
            });
        }
    }

    // Free, frozen, all-visible and undone-abort slots are cheap.
    for (no, slot) in &slots {
        if slot.is_free() || slot.is_frozen() {
            page.set_trans_slot(*no, TransSlot::EMPTY);
            return Ok(SlotRequest::Reserved { slot: *no });
        }
        match oracle.disposition(slot.xid) {
            SlotDisposition::CommittedAllVisible => {
                freeze_one_slot(page, *no, oracle);
                page.set_trans_slot(*no, TransSlot::EMPTY);
                return Ok(SlotRequest::Reserved { slot: *no });
            }
            SlotDisposition::AbortedUndone => {
                page.set_trans_slot(*no, TransSlot::EMPTY);
                return Ok(SlotRequest::Reserved { slot: *no });
            }
            _ => {}
        }
    }

    // Recycle one committed slot behind a slot-reuse undo record.
    for (no, slot) in &slots {
        if oracle.disposition(slot.xid) == SlotDisposition::Committed {
            emit_reuse(*no, *slot)?;
            mark_referencing_tuples_reused(page, *no);
            page.set_trans_slot(*no, TransSlot::EMPTY);
            return Ok(SlotRequest::Reserved { slot: *no });
        }
    }

    Ok(SlotRequest::TryOverflow)
}

/// Bulk fallback for toplevel transactions when overflow allocation also
/// failed: recycles every committed slot on the page and returns the
/// first freed one. Returns `SlotExhausted` when nothing is committed.
pub fn bulk_reuse_committed_slots(
    page: &mut TablePage<'_>,
    block: u32,
    oracle: &dyn SlotOracle,
    emit_reuse: &mut ReuseSink<'_>,
) -> EngineResult<SlotNo> {
    let mut freed = None;

    for (no, slot) in page.trans_slots() {
        if oracle.disposition(slot.xid) == SlotDisposition::Committed {
            emit_reuse(no, slot)?;
            mark_referencing_tuples_reused(page, no);
            page.set_trans_slot(no, TransSlot::EMPTY);
            freed.get_or_insert(no);
        }
    }

    freed.ok_or(EngineError::SlotExhausted { block })
}

/// Writes the reserved slot number into a tuple's header.
pub fn mark_tuple_slot(page: &mut TablePage<'_>, offset: OffsetNumber, slot: SlotNo) {
    let mut tuple_header = page
        .tuple_header(offset)
        .expect("tuple must exist to be marked");
    tuple_header.set_slot(slot);
    page.set_tuple_header(offset, tuple_header);
}

/// Freezes every slot whose transaction is all-visible: tuples are
/// repointed at the frozen sentinel and the slot is stamped frozen.
/// Returns the number of slots frozen.
pub fn freeze_slots(page: &mut TablePage<'_>, oracle: &dyn SlotOracle) -> usize {
    let mut frozen = 0;
    for (no, slot) in page.trans_slots() {
        if slot.is_free() || slot.is_frozen() {
            continue;
        }
        if oracle.disposition(slot.xid) == SlotDisposition::CommittedAllVisible {
            freeze_one_slot(page, no, oracle);
            page.set_trans_slot(no, TransSlot::FROZEN);
            frozen += 1;
        }
    }
    frozen
}

/// Repoints everything referencing `victim` at the frozen sentinel. For
/// a `Deleted` line pointer that means the delete is all-visible and the
/// pointer can go straight to `Unused`.
fn freeze_one_slot(page: &mut TablePage<'_>, victim: SlotNo, _oracle: &dyn SlotOracle) {
    for off in 1..=page.line_pointer_count() as u16 {
        let offset = OffsetNumber::new(off);
        let lp = page.line_pointer(offset).unwrap();
        match lp.state {
            LinePointerState::Normal => {
                let mut tuple_header = page.tuple_header(offset).unwrap();
                if tuple_header.slot() == victim
                    && !tuple_header.infomask.contains(InfoMask::SLOT_REUSED)
                {
                    tuple_header.set_slot(SlotNo::FROZEN);
                    page.set_tuple_header(offset, tuple_header);
                }
            }
            LinePointerState::Deleted => {
                if lp.slot() == victim {
                    page.set_line_pointer(offset, LinePointer::UNUSED);
                }
            }
            _ => {}
        }
    }
}

/// Flags every tuple referencing `victim` so the visibility resolver
/// switches to undo-based xid lookup.
fn mark_referencing_tuples_reused(page: &mut TablePage<'_>, victim: SlotNo) {
    for off in 1..=page.line_pointer_count() as u16 {
        let offset = OffsetNumber::new(off);
        let lp = page.line_pointer(offset).unwrap();
        if lp.state != LinePointerState::Normal {
            continue;
        }
        let mut tuple_header = page.tuple_header(offset).unwrap();
        if tuple_header.slot() == victim {
            tuple_header.infomask |= InfoMask::SLOT_REUSED;
            page.set_tuple_header(offset, tuple_header);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::TupleHeader;
    use palim_common::constants::TRANS_SLOTS_PER_PAGE;
    use palim_common::constants::PAGE_SIZE;

    fn data_page() -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        TablePage::new(&mut buf).init_data();
        buf
    }

    fn no_reuse() -> impl FnMut(SlotNo, TransSlot) -> EngineResult<()> {
        |_, _| panic!("reservation should not have recycled a slot")
    }

    fn all_in_progress(_xid: Xid) -> SlotDisposition {
        SlotDisposition::InProgress
    }

    #[test]
    fn test_reserve_free_slot() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let request = find_or_reserve_slot(
            &mut page,
            Xid::from_parts(0, 5),
            &all_in_progress,
            &mut no_reuse(),
        )
        .unwrap();
        assert_eq!(request, SlotRequest::Reserved { slot: SlotNo::new(1) });
    }

    #[test]
    fn test_existing_slot_returned_with_chain_head() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let xid = Xid::from_parts(0, 5);
        let ptr = UndoPtr::from_parts(0, 640);
        page.stamp_trans_slot(SlotNo::new(2), xid, ptr);

        let request =
            find_or_reserve_slot(&mut page, xid, &all_in_progress, &mut no_reuse()).unwrap();
        assert_eq!(
            request,
            SlotRequest::Existing { slot: SlotNo::new(2), undo_ptr: ptr }
        );
    }

    #[test]
    fn test_all_busy_requests_overflow() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        for i in 0..TRANS_SLOTS_PER_PAGE as u16 {
            page.stamp_trans_slot(
                SlotNo::new(i + 1),
                Xid::from_parts(0, 10 + i as u32),
                UndoPtr::INVALID,
            );
        }

        let request = find_or_reserve_slot(
            &mut page,
            Xid::from_parts(0, 99),
            &all_in_progress,
            &mut no_reuse(),
        )
        .unwrap();
        assert_eq!(request, SlotRequest::TryOverflow);
    }

    #[test]
    fn test_committed_slot_recycled_with_undo_record() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let committed = Xid::from_parts(0, 10);
        for i in 0..TRANS_SLOTS_PER_PAGE as u16 {
            let xid = if i == 2 { committed } else { Xid::from_parts(0, 20 + i as u32) };
            page.stamp_trans_slot(SlotNo::new(i + 1), xid, UndoPtr::from_parts(0, 64));
        }

        // A tuple referencing the committed slot must get the reuse flag.
        let tuple = TupleHeader::for_insert(SlotNo::new(3)).with_payload(b"row");
        let off = page.add_tuple(&tuple, None).unwrap();

        let oracle = move |xid: Xid| {
            if xid == committed {
                SlotDisposition::Committed
            } else {
                SlotDisposition::InProgress
            }
        };

        let mut emitted = Vec::new();
        let request = find_or_reserve_slot(&mut page, Xid::from_parts(0, 99), &oracle, &mut |no,
                slot| {
            emitted.push((no, slot));
            Ok(())
        })
        .unwrap();

        assert_eq!(request, SlotRequest::Reserved { slot: SlotNo::new(3) });
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].0, SlotNo::new(3));
        assert_eq!(emitted[0].1.xid, committed);

        let tuple_header = page.tuple_header(off).unwrap();
        assert!(tuple_header.infomask.contains(InfoMask::SLOT_REUSED));
    }

    #[test]
    fn test_all_visible_slot_frozen_then_reused() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let old = Xid::from_parts(0, 10);
        for i in 0..TRANS_SLOTS_PER_PAGE as u16 {
            let xid = if i == 0 { old } else { Xid::from_parts(0, 20 + i as u32) };
            page.stamp_trans_slot(SlotNo::new(i + 1), xid, UndoPtr::INVALID);
        }
        let tuple = TupleHeader::for_insert(SlotNo::new(1)).with_payload(b"row");
        let off = page.add_tuple(&tuple, None).unwrap();

        let oracle = move |xid: Xid| {
            if xid == old {
                SlotDisposition::CommittedAllVisible
            } else {
                SlotDisposition::InProgress
            }
        };

        let request = find_or_reserve_slot(
            &mut page,
            Xid::from_parts(0, 99),
            &oracle,
            &mut no_reuse(),
        )
        .unwrap();
        assert_eq!(request, SlotRequest::Reserved { slot: SlotNo::new(1) });

        // The old tuple now points at the frozen sentinel.
        assert_eq!(page.tuple_header(off).unwrap().slot(), SlotNo::FROZEN);
    }

    #[test]
    fn test_bulk_reuse() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        for i in 0..TRANS_SLOTS_PER_PAGE as u16 {
            page.stamp_trans_slot(
                SlotNo::new(i + 1),
                Xid::from_parts(0, 10 + i as u32),
                UndoPtr::from_parts(0, 64 * (i as u64 + 1)),
            );
        }

        let mut emitted = Vec::new();
        let slot = bulk_reuse_committed_slots(
            &mut page,
            1,
            &|_: Xid| SlotDisposition::Committed,
            &mut |no, slot| {
                emitted.push((no, slot));
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(slot, SlotNo::new(1));
        assert_eq!(emitted.len(), TRANS_SLOTS_PER_PAGE);
        for (no, _) in page.trans_slots() {
            assert!(page.trans_slot(no).is_free());
        }
    }

    #[test]
    fn test_bulk_reuse_nothing_committed() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);
        for i in 0..TRANS_SLOTS_PER_PAGE as u16 {
            page.stamp_trans_slot(SlotNo::new(i + 1), Xid::from_parts(0, 10), UndoPtr::INVALID);
        }

        let err = bulk_reuse_committed_slots(
            &mut page,
            7,
            &all_in_progress,
            &mut |_, _| Ok(()),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::SlotExhausted { block: 7 }));
    }

    #[test]
    fn test_freeze_slots() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let old = Xid::from_parts(0, 10);
        page.stamp_trans_slot(SlotNo::new(1), old, UndoPtr::INVALID);
        let tuple = TupleHeader::for_insert(SlotNo::new(1)).with_payload(b"row");
        let off = page.add_tuple(&tuple, None).unwrap();

        let frozen = freeze_slots(&mut page, &move |xid: Xid| {
            if xid == old {
                SlotDisposition::CommittedAllVisible
            } else {
                SlotDisposition::InProgress
            }
        });

        assert_eq!(frozen, 1);
        assert!(page.trans_slot(SlotNo::new(1)).is_frozen());
        assert_eq!(page.tuple_header(off).unwrap().slot(), SlotNo::FROZEN);
    }
}
