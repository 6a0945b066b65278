//! Page format.
//!
//! ```text
//! +--------------------------+ 0
//! |        page header       | 24 bytes
//! +--------------------------+
//! |   line pointers  ->      | 4 bytes each, grows forward
//! +--------------------------+ lower
//! |        free space        |
//! +--------------------------+ upper
//! |      <-  tuples          | grows backward, 2-byte aligned
//! +--------------------------+ special
//! |    transaction slots     | 16 bytes each
//! +--------------------------+ 8192
//! ```
//!
//! Line pointers never move once created; tuples may move within the
//! page during compaction. The transaction-slot array is sized at page
//! creation and never grows on the page itself; extra slots spill to
//! overflow pages tracked by the relation metapage.

pub mod header;
pub mod line_pointer;
pub mod meta;
pub mod slots;
pub mod tuple;

pub use header::{data_special_offset, PageFlags, PageHeader};
pub use line_pointer::{LinePointer, LinePointerState, LINE_POINTER_SIZE};
pub use slots::TransSlot;
pub use tuple::{InfoMask, LockMode, TupleHeader};

use palim_common::constants::{
    PAGE_HEADER_SIZE, PAGE_SIZE, TRANS_SLOTS_PER_PAGE, TUPLE_ALIGNMENT, TUPLE_HEADER_SIZE,
};
use palim_common::{OffsetNumber, SlotNo, UndoPtr, Xid};

/// Rounds a tuple length up to the placement alignment.
#[inline]
fn align_tuple_len(len: usize) -> usize {
    (len + TUPLE_ALIGNMENT - 1) & !(TUPLE_ALIGNMENT - 1)
}

fn lp_position(offset: OffsetNumber) -> usize {
    PAGE_HEADER_SIZE + offset.index() * LINE_POINTER_SIZE
}

fn read_lp(data: &[u8], offset: OffsetNumber) -> Option<LinePointer> {
    let count = (header::read_lower(data) as usize - PAGE_HEADER_SIZE) / LINE_POINTER_SIZE;
    if !offset.is_valid() || offset.index() >= count {
        return None;
    }
    let at = lp_position(offset);
    Some(LinePointer::from_bytes(
        data[at..at + LINE_POINTER_SIZE].try_into().unwrap(),
    ))
}

fn read_tuple_bytes(data: &[u8], offset: OffsetNumber) -> Option<&[u8]> {
    let lp = read_lp(data, offset)?;
    if !lp.is_normal() {
        return None;
    }
    let start = lp.offset as usize;
    Some(&data[start..start + lp.len()])
}

/// Mutable view of one table page.
pub struct TablePage<'a> {
    data: &'a mut [u8],
}

impl<'a> TablePage<'a> {
    /// Creates a view into a page buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not exactly one page.
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE, "buffer is not one page");
        Self { data }
    }

    /// Initializes an empty data page: no line pointers, all slots free.
    pub fn init_data(&mut self) {
        self.data.fill(0);
        PageHeader::new(self.data).initialize(data_special_offset());
    }

    /// Returns a read-only view of the same page.
    pub fn as_ref_view(&self) -> TablePageRef<'_> {
        TablePageRef { data: self.data }
    }

    /// Returns the page header view.
    pub fn page_header(&mut self) -> PageHeader<'_> {
        PageHeader::new(self.data)
    }

    /// Returns the full page bytes.
    pub fn bytes(&self) -> &[u8] {
        self.data
    }

    /// Returns the page flags.
    pub fn flags(&self) -> PageFlags {
        header::read_flags(self.data)
    }

    /// Returns the prune-xid hint.
    pub fn prune_xid(&self) -> Xid {
        header::read_prune_xid(self.data)
    }

    /// Number of line pointers on the page.
    pub fn line_pointer_count(&self) -> usize {
        (header::read_lower(self.data) as usize - PAGE_HEADER_SIZE) / LINE_POINTER_SIZE
    }

    /// Highest offset number in use.
    pub fn max_offset(&self) -> OffsetNumber {
        OffsetNumber::new(self.line_pointer_count() as u16)
    }

    /// Reads a line pointer, if the offset exists.
    pub fn line_pointer(&self, offset: OffsetNumber) -> Option<LinePointer> {
        read_lp(self.data, offset)
    }

    /// Rewrites an existing line pointer.
    pub fn set_line_pointer(&mut self, offset: OffsetNumber, lp: LinePointer) {
        debug_assert!(offset.index() < self.line_pointer_count());
        let at = lp_position(offset);
        self.data[at..at + LINE_POINTER_SIZE].copy_from_slice(&lp.to_bytes());
    }

    /// Returns the raw tuple bytes behind a normal line pointer.
    pub fn tuple_bytes(&self, offset: OffsetNumber) -> Option<&[u8]> {
        read_tuple_bytes(self.data, offset)
    }

    /// Returns the decoded tuple header at an offset.
    pub fn tuple_header(&self, offset: OffsetNumber) -> Option<TupleHeader> {
        self.tuple_bytes(offset).map(TupleHeader::from_bytes)
    }

    /// Rewrites a tuple's header in place. Placement alignment makes the
    /// header words two-byte aligned, so this never tears.
    pub fn set_tuple_header(&mut self, offset: OffsetNumber, tuple_header: TupleHeader) {
        let lp = self.line_pointer(offset).expect("offset must exist");
        debug_assert!(lp.is_normal());
        let at = lp.offset as usize;
        self.data[at..at + TUPLE_HEADER_SIZE].copy_from_slice(&tuple_header.to_bytes());
    }

    /// Free bytes between the line-pointer array and the tuple area.
    pub fn free_space(&self) -> usize {
        let lower = header::read_lower(self.data) as usize;
        let upper = header::read_upper(self.data) as usize;
        upper.saturating_sub(lower)
    }

    /// Returns true if a tuple of `len` bytes fits, counting the line
    /// pointer that would have to be created when no unused one exists.
    pub fn has_room_for(&self, len: usize) -> bool {
        let lp_cost = if self.find_unused_offset().is_some() {
            0
        } else {
            LINE_POINTER_SIZE
        };
        self.free_space() >= align_tuple_len(len) + lp_cost
    }

    fn find_unused_offset(&self) -> Option<OffsetNumber> {
        (1..=self.line_pointer_count() as u16)
            .map(OffsetNumber::new)
            .find(|&off| {
                self.line_pointer(off)
                    .map(|lp| lp.is_unused())
                    .unwrap_or(false)
            })
    }

    /// Places a tuple on the page and returns its offset number.
    ///
    /// With `at` given, the tuple lands exactly there: the offset must
    /// name an unused pointer or extend the array by one. Rollback and
    /// WAL replay use that to restore rows at their original position.
    pub fn add_tuple(&mut self, tuple_bytes: &[u8], at: Option<OffsetNumber>) -> Option<OffsetNumber> {
        let count = self.line_pointer_count();
        let (offset, extends) = match at {
            Some(off) => {
                if off.index() < count {
                    if !self.line_pointer(off)?.is_unused() {
                        return None;
                    }
                    (off, false)
                } else if off.index() == count {
                    (off, true)
                } else {
                    return None;
                }
            }
            None => match self.find_unused_offset() {
                Some(off) => (off, false),
                None => (OffsetNumber::new(count as u16 + 1), true),
            },
        };

        let lower = header::read_lower(self.data) as usize;
        let upper = header::read_upper(self.data) as usize;
        let needed_lower = lower + if extends { LINE_POINTER_SIZE } else { 0 };

        let len = tuple_bytes.len();
        let new_upper = upper.checked_sub(align_tuple_len(len))?;
        if new_upper < needed_lower {
            return None;
        }

        self.data[new_upper..new_upper + len].copy_from_slice(tuple_bytes);

        let mut page_header = PageHeader::new(self.data);
        page_header.set_upper(new_upper as u16);
        if extends {
            page_header.set_lower(needed_lower as u16);
        }

        let at = lp_position(offset);
        self.data[at..at + LINE_POINTER_SIZE]
            .copy_from_slice(&LinePointer::normal(new_upper as u16, len as u16).to_bytes());

        Some(offset)
    }

    /// Replaces the tuple at `offset` with a new image, keeping the
    /// offset number. Overwrites in place when the new image is no
    /// longer than the old one; otherwise relocates within the page.
    /// Returns false if the page has no room.
    pub fn replace_tuple(&mut self, offset: OffsetNumber, new_tuple: &[u8]) -> bool {
        let Some(lp) = self.line_pointer(offset) else {
            return false;
        };
        if !lp.is_normal() {
            return false;
        }

        if new_tuple.len() <= lp.len() {
            let start = lp.offset as usize;
            self.data[start..start + new_tuple.len()].copy_from_slice(new_tuple);
            self.set_line_pointer(
                offset,
                LinePointer::normal(lp.offset, new_tuple.len() as u16),
            );
            return true;
        }

        let lower = header::read_lower(self.data) as usize;
        let upper = header::read_upper(self.data) as usize;
        let Some(new_upper) = upper.checked_sub(align_tuple_len(new_tuple.len())) else {
            return false;
        };
        if new_upper < lower {
            return false;
        }

        self.data[new_upper..new_upper + new_tuple.len()].copy_from_slice(new_tuple);
        PageHeader::new(self.data).set_upper(new_upper as u16);
        self.set_line_pointer(
            offset,
            LinePointer::normal(new_upper as u16, new_tuple.len() as u16),
        );
        true
    }

    /// Zeroes the tuple bytes behind a normal pointer without touching
    /// the pointer. Deletes clear the body before flipping the pointer
    /// to `Deleted`; the space itself is reclaimed by compaction.
    pub fn clear_tuple_body(&mut self, offset: OffsetNumber) {
        if let Some(lp) = self.line_pointer(offset) {
            if lp.is_normal() {
                let start = lp.offset as usize;
                self.data[start..start + lp.len()].fill(0);
            }
        }
    }

    /// Removes the tuple at `offset`, zeroing its bytes and reclaiming
    /// its space when it borders the free area. Trailing unused line
    /// pointers are dropped from the array, so rolling back the newest
    /// insert restores the page's pre-insert layout exactly.
    pub fn retract_tuple(&mut self, offset: OffsetNumber) -> bool {
        let Some(lp) = self.line_pointer(offset) else {
            return false;
        };
        if !lp.is_normal() {
            return false;
        }

        let start = lp.offset as usize;
        let len = lp.len();
        self.data[start..start + len].fill(0);

        let upper = header::read_upper(self.data) as usize;
        if start == upper {
            PageHeader::new(self.data).set_upper((upper + align_tuple_len(len)) as u16);
        }
        self.set_line_pointer(offset, LinePointer::UNUSED);

        let mut count = self.line_pointer_count();
        while count > 0 {
            let last = OffsetNumber::new(count as u16);
            if !self.line_pointer(last).unwrap().is_unused() {
                break;
            }
            let at = lp_position(last);
            self.data[at..at + LINE_POINTER_SIZE].fill(0);
            count -= 1;
        }
        PageHeader::new(self.data)
            .set_lower((PAGE_HEADER_SIZE + count * LINE_POINTER_SIZE) as u16);
        true
    }

    /// Reads a transaction slot.
    pub fn trans_slot(&self, slot: SlotNo) -> TransSlot {
        slots::read_slot(self.data, slot)
    }

    /// Writes a transaction slot.
    pub fn set_trans_slot(&mut self, slot: SlotNo, value: TransSlot) {
        slots::write_slot(self.data, slot, value);
    }

    /// Updates a slot's xid and newest undo pointer in one step.
    pub fn stamp_trans_slot(&mut self, slot: SlotNo, xid: Xid, undo_ptr: UndoPtr) {
        self.set_trans_slot(slot, TransSlot::new(xid, undo_ptr));
    }

    /// Iterates `(slot number, slot)` over the on-page array.
    pub fn trans_slots(&self) -> Vec<(SlotNo, TransSlot)> {
        slots::on_page_slots()
            .map(|no| (no, self.trans_slot(no)))
            .collect()
    }

    /// Number of transaction slots on the page.
    pub fn trans_slot_count(&self) -> usize {
        TRANS_SLOTS_PER_PAGE
    }

    /// Collects contiguous runs of usable offset numbers for a bulk
    /// insert of `ntuples` tuples of `tuple_len` bytes each. Unused
    /// pointers are preferred; the array is extended for the rest while
    /// space lasts.
    pub fn usable_offset_ranges(
        &self,
        ntuples: usize,
        tuple_len: usize,
    ) -> Vec<(OffsetNumber, OffsetNumber)> {
        let per_tuple = align_tuple_len(tuple_len);
        let mut space = self.free_space();
        let mut offsets: Vec<u16> = Vec::new();

        for off in 1..=self.line_pointer_count() as u16 {
            if offsets.len() >= ntuples || space < per_tuple {
                break;
            }
            let lp = self.line_pointer(OffsetNumber::new(off)).unwrap();
            if lp.is_unused() {
                offsets.push(off);
                space -= per_tuple;
            }
        }

        let mut next = self.line_pointer_count() as u16 + 1;
        while offsets.len() < ntuples && space >= per_tuple + LINE_POINTER_SIZE {
            offsets.push(next);
            next += 1;
            space -= per_tuple + LINE_POINTER_SIZE;
        }

        let mut ranges = Vec::new();
        for &off in &offsets {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == off => *end = off,
                _ => ranges.push((off, off)),
            }
        }
        ranges
            .into_iter()
            .map(|(s, e)| (OffsetNumber::new(s), OffsetNumber::new(e)))
            .collect()
    }

    /// Compacts the tuple area, squeezing out space behind non-normal
    /// line pointers. Line pointers keep their offsets; only tuple bytes
    /// move. Returns the number of bytes gained.
    pub fn repair_fragmentation(&mut self) -> usize {
        let special = data_special_offset();
        let before = self.free_space();

        let mut live: Vec<(OffsetNumber, Vec<u8>)> = Vec::new();
        for off in 1..=self.line_pointer_count() as u16 {
            let offset = OffsetNumber::new(off);
            if let Some(bytes) = self.tuple_bytes(offset) {
                live.push((offset, bytes.to_vec()));
            }
        }

        // Repack from the special area downward.
        let mut top = special;
        for (offset, bytes) in &live {
            top -= align_tuple_len(bytes.len());
            self.data[top..top + bytes.len()].copy_from_slice(bytes);
            let at = lp_position(*offset);
            self.data[at..at + LINE_POINTER_SIZE]
                .copy_from_slice(&LinePointer::normal(top as u16, bytes.len() as u16).to_bytes());
        }
        PageHeader::new(self.data).set_upper(top as u16);

        self.free_space() - before
    }
}

impl std::fmt::Debug for TablePage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TablePage")
            .field("line_pointers", &self.line_pointer_count())
            .field("free_space", &self.free_space())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Read-only view of one table page, for visibility checks under a
/// shared page lock.
pub struct TablePageRef<'a> {
    data: &'a [u8],
}

impl<'a> TablePageRef<'a> {
    /// Creates a read-only view into a page buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not exactly one page.
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE, "buffer is not one page");
        Self { data }
    }

    /// Returns the page flags.
    pub fn flags(&self) -> PageFlags {
        header::read_flags(self.data)
    }

    /// Returns the prune-xid hint.
    pub fn prune_xid(&self) -> Xid {
        header::read_prune_xid(self.data)
    }

    /// Number of line pointers on the page.
    pub fn line_pointer_count(&self) -> usize {
        (header::read_lower(self.data) as usize - PAGE_HEADER_SIZE) / LINE_POINTER_SIZE
    }

    /// Reads a line pointer, if the offset exists.
    pub fn line_pointer(&self, offset: OffsetNumber) -> Option<LinePointer> {
        read_lp(self.data, offset)
    }

    /// Returns the raw tuple bytes behind a normal line pointer.
    pub fn tuple_bytes(&self, offset: OffsetNumber) -> Option<&'a [u8]> {
        read_tuple_bytes(self.data, offset)
    }

    /// Returns the decoded tuple header at an offset.
    pub fn tuple_header(&self, offset: OffsetNumber) -> Option<TupleHeader> {
        self.tuple_bytes(offset).map(TupleHeader::from_bytes)
    }

    /// Reads a transaction slot.
    pub fn trans_slot(&self, slot: SlotNo) -> TransSlot {
        slots::read_slot(self.data, slot)
    }

    /// Iterates `(slot number, slot)` over the on-page array.
    pub fn trans_slots(&self) -> Vec<(SlotNo, TransSlot)> {
        slots::on_page_slots()
            .map(|no| (no, self.trans_slot(no)))
            .collect()
    }

    /// Free bytes between the line-pointer array and the tuple area.
    pub fn free_space(&self) -> usize {
        let lower = header::read_lower(self.data) as usize;
        let upper = header::read_upper(self.data) as usize;
        upper.saturating_sub(lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_page() -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        TablePage::new(&mut buf).init_data();
        buf
    }

    fn tuple(slot: SlotNo, payload: &[u8]) -> Vec<u8> {
        TupleHeader::for_insert(slot).with_payload(payload)
    }

    #[test]
    fn test_init_data_page() {
        let mut buf = data_page();
        let page = TablePage::new(&mut buf);
        assert_eq!(page.line_pointer_count(), 0);
        assert_eq!(
            page.free_space(),
            data_special_offset() - PAGE_HEADER_SIZE
        );
        for (_, slot) in page.trans_slots() {
            assert!(slot.is_free());
        }
    }

    #[test]
    fn test_add_and_read_tuple() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let bytes = tuple(SlotNo::new(1), b"hello");
        let off = page.add_tuple(&bytes, None).unwrap();
        assert_eq!(off, OffsetNumber::new(1));

        assert_eq!(page.tuple_bytes(off).unwrap(), bytes.as_slice());
        assert_eq!(page.tuple_header(off).unwrap().slot(), SlotNo::new(1));
    }

    #[test]
    fn test_add_tuple_at_requested_offset() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        // Extend to offset 1, then explicitly re-add at a freed offset.
        let t = tuple(SlotNo::new(1), b"one");
        page.add_tuple(&t, None).unwrap();
        page.add_tuple(&tuple(SlotNo::new(1), b"two"), None).unwrap();

        page.set_line_pointer(OffsetNumber::new(1), LinePointer::UNUSED);
        let off = page
            .add_tuple(&tuple(SlotNo::new(2), b"redo"), Some(OffsetNumber::new(1)))
            .unwrap();
        assert_eq!(off, OffsetNumber::new(1));

        // Occupied target is refused.
        assert!(page
            .add_tuple(&t, Some(OffsetNumber::new(2)))
            .is_none());
        // A gap past the end is refused.
        assert!(page
            .add_tuple(&t, Some(OffsetNumber::new(9)))
            .is_none());
    }

    #[test]
    fn test_tuples_are_two_byte_aligned() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        // Odd-length tuples still start on even offsets.
        for len in [1usize, 3, 7, 9] {
            let bytes = tuple(SlotNo::new(1), &vec![0xAA; len]);
            let off = page.add_tuple(&bytes, None).unwrap();
            let lp = page.line_pointer(off).unwrap();
            assert_eq!(lp.offset % 2, 0, "tuple start must be aligned");
        }
    }

    #[test]
    fn test_in_place_header_rewrite() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let off = page
            .add_tuple(&tuple(SlotNo::new(1), b"payload"), None)
            .unwrap();

        let mut tuple_header = page.tuple_header(off).unwrap();
        tuple_header.infomask |= InfoMask::IN_PLACE_UPDATED;
        tuple_header.set_slot(SlotNo::new(2));
        page.set_tuple_header(off, tuple_header);

        let reread = page.tuple_header(off).unwrap();
        assert!(reread.infomask.contains(InfoMask::IN_PLACE_UPDATED));
        assert_eq!(reread.slot(), SlotNo::new(2));
        // Payload is untouched.
        assert_eq!(&page.tuple_bytes(off).unwrap()[TUPLE_HEADER_SIZE..], b"payload");
    }

    #[test]
    fn test_replace_tuple_same_and_larger() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let off = page
            .add_tuple(&tuple(SlotNo::new(1), b"aaaa"), None)
            .unwrap();

        // Same-size replacement overwrites in place.
        let lp_before = page.line_pointer(off).unwrap();
        assert!(page.replace_tuple(off, &tuple(SlotNo::new(1), b"bbbb")));
        let lp_after = page.line_pointer(off).unwrap();
        assert_eq!(lp_before.offset, lp_after.offset);
        assert_eq!(&page.tuple_bytes(off).unwrap()[TUPLE_HEADER_SIZE..], b"bbbb");

        // A larger replacement relocates but keeps the offset number.
        let wide = tuple(SlotNo::new(1), &vec![0xCC; 64]);
        assert!(page.replace_tuple(off, &wide));
        assert_eq!(page.tuple_bytes(off).unwrap(), wide.as_slice());
    }

    #[test]
    fn test_page_fills_up() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let bytes = tuple(SlotNo::new(1), &vec![0u8; 1000]);
        let mut inserted = 0;
        while page.has_room_for(bytes.len()) {
            page.add_tuple(&bytes, None).unwrap();
            inserted += 1;
        }
        assert!(inserted >= 7);
        assert!(page.add_tuple(&bytes, None).is_none());
    }

    #[test]
    fn test_trans_slot_round_trip() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let slot_no = SlotNo::new(2);
        page.stamp_trans_slot(slot_no, Xid::from_parts(0, 5), UndoPtr::from_parts(0, 64));
        let slot = page.trans_slot(slot_no);
        assert_eq!(slot.xid, Xid::from_parts(0, 5));
        assert_eq!(slot.undo_ptr, UndoPtr::from_parts(0, 64));
    }

    #[test]
    fn test_usable_offset_ranges_coalesce() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        // Three tuples, free the middle one.
        let bytes = tuple(SlotNo::new(1), b"xxxxxxxx");
        for _ in 0..3 {
            page.add_tuple(&bytes, None).unwrap();
        }
        page.set_line_pointer(OffsetNumber::new(2), LinePointer::UNUSED);

        let ranges = page.usable_offset_ranges(4, bytes.len());
        // Offset 2 is reused, then 4..6 extend the array.
        assert_eq!(
            ranges,
            vec![(OffsetNumber::new(2), OffsetNumber::new(2)),
                 (OffsetNumber::new(4), OffsetNumber::new(6))]
        );
    }

    #[test]
    fn test_repair_fragmentation() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let a = page.add_tuple(&tuple(SlotNo::new(1), &vec![1u8; 100]), None).unwrap();
        let b = page.add_tuple(&tuple(SlotNo::new(1), &vec![2u8; 100]), None).unwrap();
        let c = page.add_tuple(&tuple(SlotNo::new(1), &vec![3u8; 100]), None).unwrap();

        let b_bytes = page.tuple_bytes(b).unwrap().to_vec();
        let free_before = page.free_space();

        // Drop tuple a's pointer; its bytes become reclaimable.
        page.set_line_pointer(a, LinePointer::UNUSED);
        let gained = page.repair_fragmentation();
        assert!(gained >= 100);
        assert!(page.free_space() > free_before);

        // Surviving tuples read back unchanged through their pointers.
        assert_eq!(page.tuple_bytes(b).unwrap(), b_bytes.as_slice());
        assert!(page.tuple_bytes(c).is_some());
        assert!(page.tuple_bytes(a).is_none());
    }

    #[test]
    fn test_retract_tuple_restores_layout() {
        let mut buf = data_page();
        let pristine = buf.clone();
        let mut page = TablePage::new(&mut buf);

        let off = page
            .add_tuple(&tuple(SlotNo::new(1), b"transient"), None)
            .unwrap();
        assert!(page.retract_tuple(off));

        assert_eq!(page.line_pointer_count(), 0);
        drop(page);
        assert_eq!(buf, pristine);
    }

    #[test]
    fn test_retract_middle_tuple_keeps_later_pointers() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);

        let a = page.add_tuple(&tuple(SlotNo::new(1), b"aa"), None).unwrap();
        let b = page.add_tuple(&tuple(SlotNo::new(1), b"bb"), None).unwrap();

        assert!(page.retract_tuple(a));
        // The later pointer stays; the array cannot shrink past it.
        assert_eq!(page.line_pointer_count(), 2);
        assert!(page.line_pointer(a).unwrap().is_unused());
        assert!(page.tuple_bytes(b).is_some());
    }

    #[test]
    fn test_ref_view_matches() {
        let mut buf = data_page();
        let mut page = TablePage::new(&mut buf);
        let off = page.add_tuple(&tuple(SlotNo::new(1), b"shared"), None).unwrap();

        let view = TablePageRef::new(&buf);
        assert_eq!(view.line_pointer_count(), 1);
        assert_eq!(view.tuple_header(off).unwrap().slot(), SlotNo::new(1));
        assert!(view.line_pointer(OffsetNumber::new(2)).is_none());
    }
}
