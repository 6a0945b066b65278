//! Page header format.
//!
//! Every page starts with a 24-byte header:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       8   lsn (WAL position of the last change)
//!   8       8   prune_xid (hint: xid whose commit makes pruning useful)
//!  16       2   checksum (folded CRC32 of the page, excluding itself)
//!  18       2   flags
//!  20       2   lower (end of the line-pointer array)
//!  22       2   upper (start of the tuple area)
//! ```
//!
//! Free space is the gap between `lower` and `upper`. The transaction
//! slots live in the special area at the page end; its position is fixed
//! per page kind, so it is not stored.

use palim_common::constants::{PAGE_HEADER_SIZE, PAGE_SIZE, TRANS_SLOTS_PER_PAGE, TRANS_SLOT_SIZE};
use palim_common::Xid;

bitflags::bitflags! {
    /// Page-level flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// This page holds overflow transaction slots, not rows.
        /// Sequential scans must skip it.
        const IS_OVERFLOW = 0x0001;
        /// Some tuples on this data page reference slots on an overflow
        /// page.
        const HAS_OVERFLOW_SLOTS = 0x0002;
        /// This is the relation metapage (block 0).
        const IS_META = 0x0004;
    }
}

/// Offset of the checksum field within the header.
const CHECKSUM_OFFSET: usize = 16;

/// Byte offset where the transaction-slot array of a data page begins.
pub const fn data_special_offset() -> usize {
    PAGE_SIZE - TRANS_SLOTS_PER_PAGE * TRANS_SLOT_SIZE
}

/// Mutable view of a page header.
#[derive(Debug)]
pub struct PageHeader<'a> {
    data: &'a mut [u8],
}

impl<'a> PageHeader<'a> {
    /// Creates a header view into the given page buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than the header.
    #[inline]
    pub fn new(data: &'a mut [u8]) -> Self {
        assert!(data.len() >= PAGE_HEADER_SIZE, "buffer too small for header");
        Self { data }
    }

    /// Initializes the header of a fresh data page.
    pub fn initialize(&mut self, special: usize) {
        self.set_lsn(0);
        self.set_prune_xid(Xid::INVALID);
        self.set_checksum(0);
        self.set_flags(PageFlags::empty());
        self.set_lower(PAGE_HEADER_SIZE as u16);
        self.set_upper(special as u16);
    }

    /// Returns the page LSN.
    #[inline]
    pub fn lsn(&self) -> u64 {
        u64::from_le_bytes(self.data[0..8].try_into().unwrap())
    }

    /// Sets the page LSN.
    #[inline]
    pub fn set_lsn(&mut self, lsn: u64) {
        self.data[0..8].copy_from_slice(&lsn.to_le_bytes());
    }

    /// Returns the prune-xid hint.
    #[inline]
    pub fn prune_xid(&self) -> Xid {
        Xid::new(u64::from_le_bytes(self.data[8..16].try_into().unwrap()))
    }

    /// Sets the prune-xid hint.
    #[inline]
    pub fn set_prune_xid(&mut self, xid: Xid) {
        self.data[8..16].copy_from_slice(&xid.as_u64().to_le_bytes());
    }

    /// Returns the stored checksum.
    #[inline]
    pub fn checksum(&self) -> u16 {
        u16::from_le_bytes(self.data[16..18].try_into().unwrap())
    }

    /// Sets the checksum.
    #[inline]
    pub fn set_checksum(&mut self, checksum: u16) {
        self.data[16..18].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Returns the page flags.
    #[inline]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(u16::from_le_bytes(self.data[18..20].try_into().unwrap()))
    }

    /// Sets the page flags.
    #[inline]
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.data[18..20].copy_from_slice(&flags.bits().to_le_bytes());
    }

    /// Sets one flag bit.
    #[inline]
    pub fn set_flag(&mut self, flag: PageFlags) {
        self.set_flags(self.flags() | flag);
    }

    /// Clears one flag bit.
    #[inline]
    pub fn clear_flag(&mut self, flag: PageFlags) {
        self.set_flags(self.flags() - flag);
    }

    /// Returns `lower`: the byte offset past the line-pointer array.
    #[inline]
    pub fn lower(&self) -> u16 {
        u16::from_le_bytes(self.data[20..22].try_into().unwrap())
    }

    /// Sets `lower`.
    #[inline]
    pub fn set_lower(&mut self, lower: u16) {
        self.data[20..22].copy_from_slice(&lower.to_le_bytes());
    }

    /// Returns `upper`: the byte offset of the lowest tuple.
    #[inline]
    pub fn upper(&self) -> u16 {
        u16::from_le_bytes(self.data[22..24].try_into().unwrap())
    }

    /// Sets `upper`.
    #[inline]
    pub fn set_upper(&mut self, upper: u16) {
        self.data[22..24].copy_from_slice(&upper.to_le_bytes());
    }

    /// Computes and stores the page checksum. Call after all other
    /// modifications are complete.
    pub fn update_checksum(&mut self) {
        self.set_checksum(0);
        let crc = crc32fast::hash(self.data);
        self.set_checksum(fold_crc(crc));
    }

    /// Verifies the stored checksum against the page contents.
    pub fn verify_checksum(&mut self) -> bool {
        let stored = self.checksum();
        self.set_checksum(0);
        let computed = fold_crc(crc32fast::hash(self.data));
        self.set_checksum(stored);
        stored == computed
    }
}

/// Read-only header accessors over a shared page slice.
pub(crate) fn read_lower(data: &[u8]) -> u16 {
    u16::from_le_bytes(data[20..22].try_into().unwrap())
}

pub(crate) fn read_upper(data: &[u8]) -> u16 {
    u16::from_le_bytes(data[22..24].try_into().unwrap())
}

pub(crate) fn read_flags(data: &[u8]) -> PageFlags {
    PageFlags::from_bits_truncate(u16::from_le_bytes(data[18..20].try_into().unwrap()))
}

pub(crate) fn read_prune_xid(data: &[u8]) -> Xid {
    Xid::new(u64::from_le_bytes(data[8..16].try_into().unwrap()))
}

/// Folds a 32-bit CRC into the 16-bit on-page checksum field.
fn fold_crc(crc: u32) -> u16 {
    ((crc & 0xFFFF) ^ (crc >> 16)) as u16
}

/// Keep the fold result stable: the checksum field itself is zeroed
/// before hashing, so `CHECKSUM_OFFSET` only documents the layout.
const _: () = assert!(CHECKSUM_OFFSET == 16);
