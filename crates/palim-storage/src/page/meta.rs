//! Relation metapage and overflow slot pages.
//!
//! Block 0 of every relation is a metapage: a magic number, a format
//! version, and the head and tail of the overflow-page chain. Overflow
//! pages hold transaction-slot entries for data pages whose on-page
//! array ran out; sequential scans skip both kinds.

use palim_common::constants::{META_MAGIC, META_VERSION, PAGE_HEADER_SIZE, PAGE_SIZE};
use palim_common::{BlockNumber, SlotNo, UndoPtr, Xid};

use super::header::{PageFlags, PageHeader};
use super::slots::TransSlot;

/// Content layout of the metapage, after the page header.
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
///   0       4   magic
///   4       4   version
///   8       4   first_overflow (block number, INVALID if none)
///  12       4   last_overflow
/// ```
#[derive(Debug)]
pub struct MetaPage<'a> {
    data: &'a mut [u8],
}

impl<'a> MetaPage<'a> {
    /// Creates a metapage view.
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE, "buffer is not one page");
        Self { data }
    }

    /// Initializes block 0 of a fresh relation.
    pub fn initialize(&mut self) {
        self.data.fill(0);
        let mut page_header = PageHeader::new(self.data);
        page_header.initialize(PAGE_SIZE);
        page_header.set_flag(PageFlags::IS_META);

        self.write_u32(0, META_MAGIC);
        self.write_u32(4, META_VERSION);
        self.write_u32(8, BlockNumber::INVALID.as_u32());
        self.write_u32(12, BlockNumber::INVALID.as_u32());
    }

    /// Checks magic and version.
    pub fn is_valid(&self) -> bool {
        self.read_u32(0) == META_MAGIC && self.read_u32(4) == META_VERSION
    }

    /// First overflow page, or invalid.
    pub fn first_overflow(&self) -> BlockNumber {
        BlockNumber::new(self.read_u32(8))
    }

    /// Sets the first overflow page.
    pub fn set_first_overflow(&mut self, block: BlockNumber) {
        self.write_u32(8, block.as_u32());
    }

    /// Last overflow page, or invalid.
    pub fn last_overflow(&self) -> BlockNumber {
        BlockNumber::new(self.read_u32(12))
    }

    /// Sets the last overflow page.
    pub fn set_last_overflow(&mut self, block: BlockNumber) {
        self.write_u32(12, block.as_u32());
    }

    fn read_u32(&self, at: usize) -> u32 {
        let at = PAGE_HEADER_SIZE + at;
        u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap())
    }

    fn write_u32(&mut self, at: usize, value: u32) {
        let at = PAGE_HEADER_SIZE + at;
        self.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Size of one overflow slot entry:
/// owner block (4) + slot number (2) + xid (8) + undo pointer (8).
const OVERFLOW_ENTRY_SIZE: usize = 22;

/// Offset of the next-page link within an overflow page's content.
const OVERFLOW_NEXT_OFFSET: usize = PAGE_HEADER_SIZE;

/// Offset of the entry count.
const OVERFLOW_COUNT_OFFSET: usize = PAGE_HEADER_SIZE + 4;

/// Offset of the first entry.
const OVERFLOW_ENTRIES_OFFSET: usize = PAGE_HEADER_SIZE + 8;

/// One slot entry on an overflow page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowEntry {
    /// The data page this slot extends.
    pub owner: BlockNumber,
    /// The slot number tuples on the owner page reference.
    pub slot_no: SlotNo,
    /// The slot contents.
    pub slot: TransSlot,
}

/// View of an overflow slot page.
#[derive(Debug)]
pub struct OverflowPage<'a> {
    data: &'a mut [u8],
}

impl<'a> OverflowPage<'a> {
    /// Creates an overflow page view.
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE, "buffer is not one page");
        Self { data }
    }

    /// Initializes a fresh overflow page.
    pub fn initialize(&mut self) {
        self.data.fill(0);
        let mut page_header = PageHeader::new(self.data);
        page_header.initialize(PAGE_SIZE);
        page_header.set_flag(PageFlags::IS_OVERFLOW);
        self.set_next(BlockNumber::INVALID);
    }

    /// Next overflow page in the chain, or invalid.
    pub fn next(&self) -> BlockNumber {
        let at = OVERFLOW_NEXT_OFFSET;
        BlockNumber::new(u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap()))
    }

    /// Links the next overflow page.
    pub fn set_next(&mut self, block: BlockNumber) {
        let at = OVERFLOW_NEXT_OFFSET;
        self.data[at..at + 4].copy_from_slice(&block.as_u32().to_le_bytes());
    }

    /// Number of entries on this page.
    pub fn entry_count(&self) -> usize {
        let at = OVERFLOW_COUNT_OFFSET;
        u16::from_le_bytes(self.data[at..at + 2].try_into().unwrap()) as usize
    }

    fn set_entry_count(&mut self, count: usize) {
        let at = OVERFLOW_COUNT_OFFSET;
        self.data[at..at + 2].copy_from_slice(&(count as u16).to_le_bytes());
    }

    /// Maximum entries one overflow page can hold.
    pub fn capacity() -> usize {
        (PAGE_SIZE - OVERFLOW_ENTRIES_OFFSET) / OVERFLOW_ENTRY_SIZE
    }

    /// Reads the entry at `index`.
    pub fn entry(&self, index: usize) -> Option<OverflowEntry> {
        if index >= self.entry_count() {
            return None;
        }
        let at = OVERFLOW_ENTRIES_OFFSET + index * OVERFLOW_ENTRY_SIZE;
        let bytes = &self.data[at..at + OVERFLOW_ENTRY_SIZE];
        Some(OverflowEntry {
            owner: BlockNumber::new(u32::from_le_bytes(bytes[0..4].try_into().unwrap())),
            slot_no: SlotNo::new(u16::from_le_bytes(bytes[4..6].try_into().unwrap())),
            slot: TransSlot::new(
                Xid::new(u64::from_le_bytes(bytes[6..14].try_into().unwrap())),
                UndoPtr::new(u64::from_le_bytes(bytes[14..22].try_into().unwrap())),
            ),
        })
    }

    /// Rewrites the entry at `index`.
    pub fn set_entry(&mut self, index: usize, entry: OverflowEntry) {
        debug_assert!(index < self.entry_count());
        let at = OVERFLOW_ENTRIES_OFFSET + index * OVERFLOW_ENTRY_SIZE;
        let bytes = &mut self.data[at..at + OVERFLOW_ENTRY_SIZE];
        bytes[0..4].copy_from_slice(&entry.owner.as_u32().to_le_bytes());
        bytes[4..6].copy_from_slice(&entry.slot_no.as_u16().to_le_bytes());
        bytes[6..14].copy_from_slice(&entry.slot.xid.as_u64().to_le_bytes());
        bytes[14..22].copy_from_slice(&entry.slot.undo_ptr.as_u64().to_le_bytes());
    }

    /// Appends an entry, returning its index, or `None` when full.
    pub fn add_entry(&mut self, entry: OverflowEntry) -> Option<usize> {
        let count = self.entry_count();
        if count >= Self::capacity() {
            return None;
        }
        self.set_entry_count(count + 1);
        self.set_entry(count, entry);
        Some(count)
    }

    /// Finds the entry index for `(owner, slot_no)`.
    pub fn find(&self, owner: BlockNumber, slot_no: SlotNo) -> Option<usize> {
        (0..self.entry_count()).find(|&i| {
            self.entry(i)
                .map(|e| e.owner == owner && e.slot_no == slot_no)
                .unwrap_or(false)
        })
    }
}
