//! Page pruning and space reuse.
//!
//! Space on a data page is reclaimed the moment it is cheap to do so: a
//! mutation that finds the page short on room, or an eviction or
//! first-read moment, asks for a prune. Pruning turns `Deleted` line
//! pointers whose deleting transaction became all-visible into `Unused`
//! ones, drops pointers whose owning transaction aborted and was undone,
//! and then compacts the tuple area. Line pointers never move.
//!
//! The work is split into a planning step and an execution step so WAL
//! replay can apply a recorded plan without re-deriving it.

use palim_common::{OffsetNumber, Xid};

use crate::page::line_pointer::LinePointerState;
use crate::page::{LinePointer, TablePage};
use crate::reserve::{SlotDisposition, SlotOracle};

/// A planned prune: the line-pointer transitions it will apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunePlan {
    /// `Deleted` pointers whose delete became all-visible, and orphaned
    /// aborted-and-undone pointers; both go to `Unused`.
    pub to_unused: Vec<OffsetNumber>,
    /// Newest xid whose row removal this prune makes permanent. WAL
    /// consumers use it for recovery-conflict detection.
    pub latest_removed_xid: Xid,
}

impl PrunePlan {
    /// Returns true if the plan changes nothing.
    pub fn is_empty(&self) -> bool {
        self.to_unused.is_empty()
    }
}

/// Outcome of a prune.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneResult {
    /// Bytes gained.
    pub freed: usize,
    /// Newest xid whose row removal became permanent.
    pub latest_removed_xid: Xid,
}

/// Plans a prune of the page.
///
/// Returns `None` when the prune-xid hint shows the last interesting
/// transaction is still in progress (unless `force` is set); pruning
/// then cannot free anything worth the page rewrite.
pub fn plan_prune(
    page: &TablePage<'_>,
    oracle: &dyn SlotOracle,
    force: bool,
) -> Option<PrunePlan> {
    let hint = page.prune_xid();
    if !force && hint.is_valid() && oracle.disposition(hint) == SlotDisposition::InProgress {
        return None;
    }

    let mut plan = PrunePlan::default();

    for off in 1..=page.line_pointer_count() as u16 {
        let offset = OffsetNumber::new(off);
        let lp = page.line_pointer(offset).unwrap();
        match lp.state {
            LinePointerState::Deleted => {
                let slot = page.trans_slot(lp.slot());
                let xid = slot.xid;
                if slot.is_frozen()
                    || oracle.disposition(xid) == SlotDisposition::CommittedAllVisible
                {
                    plan.to_unused.push(offset);
                    if xid.follows(plan.latest_removed_xid) {
                        plan.latest_removed_xid = xid;
                    }
                }
            }
            LinePointerState::Normal => {
                let Some(tuple_header) = page.tuple_header(offset) else {
                    continue;
                };
                let slot_no = tuple_header.slot();
                if slot_no.is_frozen() || slot_no.as_u16() > page.trans_slot_count() as u16 {
                    continue;
                }
                let slot = page.trans_slot(slot_no);
                if !slot.is_free()
                    && !slot.is_frozen()
                    && oracle.disposition(slot.xid) == SlotDisposition::AbortedUndone
                {
                    plan.to_unused.push(offset);
                }
            }
            _ => {}
        }
    }

    Some(plan)
}

/// Applies a prune plan and compacts the tuple area. Returns the bytes
/// gained, counting both the pointer transitions and the compaction of
/// orphaned tuple bytes.
pub fn execute_prune(page: &mut TablePage<'_>, plan: &PrunePlan) -> usize {
    for &offset in &plan.to_unused {
        page.set_line_pointer(offset, LinePointer::UNUSED);
    }

    let freed = page.repair_fragmentation();
    page.page_header().set_prune_xid(Xid::INVALID);
    freed
}

/// Plans and executes a prune in one call.
pub fn prune_page(
    page: &mut TablePage<'_>,
    oracle: &dyn SlotOracle,
    force: bool,
) -> Option<PruneResult> {
    let plan = plan_prune(page, oracle, force)?;
    let freed = execute_prune(page, &plan);
    Some(PruneResult {
        freed,
        latest_removed_xid: plan.latest_removed_xid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{TablePage, TupleHeader};
    use palim_common::constants::PAGE_SIZE;
    use palim_common::{SlotNo, UndoPtr};

    fn data_page() -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        TablePage::new(&mut buf).init_data();
        buf
    }

    fn add_row(page: &mut TablePage<'_>, slot: SlotNo, payload: &[u8]) -> OffsetNumber {
        page.add_tuple(&TupleHeader::for_insert(slot).with_payload(payload), None)
            .unwrap()
    }

    #[test]
    fn test_all_visible_delete_pruned() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let deleter = Xid::from_parts(0, 8);
        page.stamp_trans_slot(SlotNo::new(1), deleter, UndoPtr::from_parts(0, 64));

        // A committed delete left this pointer behind.
        let off = add_row(&mut page, SlotNo::new(1), &vec![7u8; 120]);
        page.set_line_pointer(off, LinePointer::deleted(SlotNo::new(1)));

        let free_before = page.free_space();
        let result = prune_page(
            &mut page,
            &move |xid: Xid| {
                if xid == deleter {
                    SlotDisposition::CommittedAllVisible
                } else {
                    SlotDisposition::InProgress
                }
            },
            false,
        )
        .unwrap();

        assert!(result.freed >= 120);
        assert_eq!(result.latest_removed_xid, deleter);
        assert!(page.free_space() > free_before);
        assert!(page.line_pointer(off).unwrap().is_unused());
    }

    #[test]
    fn test_not_yet_visible_delete_kept() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let deleter = Xid::from_parts(0, 8);
        page.stamp_trans_slot(SlotNo::new(1), deleter, UndoPtr::from_parts(0, 64));
        let off = add_row(&mut page, SlotNo::new(1), b"row");
        page.set_line_pointer(off, LinePointer::deleted(SlotNo::new(1)));

        let result = prune_page(
            &mut page,
            &move |_: Xid| SlotDisposition::Committed,
            false,
        )
        .unwrap();

        // The pointer keeps its slot so readers can reach the prior
        // version; only orphaned bytes were compacted away.
        let lp = page.line_pointer(off).unwrap();
        assert_eq!(lp.state, LinePointerState::Deleted);
        assert_eq!(lp.slot(), SlotNo::new(1));
        assert_eq!(result.latest_removed_xid, Xid::INVALID);
    }

    #[test]
    fn test_hint_in_progress_skips() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);
        page.page_header().set_prune_xid(Xid::from_parts(0, 9));

        assert!(plan_prune(&page, &|_: Xid| SlotDisposition::InProgress, false).is_none());
        // Force overrides the hint.
        assert!(plan_prune(&page, &|_: Xid| SlotDisposition::InProgress, true).is_some());
    }

    #[test]
    fn test_aborted_undone_insert_dropped() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let aborted = Xid::from_parts(0, 12);
        page.stamp_trans_slot(SlotNo::new(2), aborted, UndoPtr::INVALID);
        let off = add_row(&mut page, SlotNo::new(2), b"ghost");

        prune_page(
            &mut page,
            &move |xid: Xid| {
                if xid == aborted {
                    SlotDisposition::AbortedUndone
                } else {
                    SlotDisposition::InProgress
                }
            },
            false,
        )
        .unwrap();

        assert!(page.line_pointer(off).unwrap().is_unused());
    }

    #[test]
    fn test_space_reuse_after_prune() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let deleter = Xid::from_parts(0, 8);
        page.stamp_trans_slot(SlotNo::new(1), deleter, UndoPtr::from_parts(0, 64));

        // Fill the page, then delete everything.
        let payload = vec![1u8; 900];
        let mut offsets = Vec::new();
        while page.has_room_for(payload.len() + 5) {
            offsets.push(add_row(&mut page, SlotNo::new(1), &payload));
        }
        for &off in &offsets {
            page.set_line_pointer(off, LinePointer::deleted(SlotNo::new(1)));
        }

        prune_page(&mut page, &|_: Xid| SlotDisposition::CommittedAllVisible, false).unwrap();

        // The page can take a full load of rows again.
        let mut reinserted = 0;
        while page.has_room_for(payload.len() + 5) {
            add_row(&mut page, SlotNo::new(2), &payload);
            reinserted += 1;
        }
        assert_eq!(reinserted, offsets.len());
    }
}
