//! Core identifier types for the Palim storage engine.
//!
//! These are type-safe wrappers around the raw integers that flow between
//! pages, undo logs and the transaction machinery. Keeping them distinct
//! prevents, say, an undo pointer from being handed to something expecting
//! a transaction id.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 64-bit transaction identifier: a 32-bit epoch paired with a 32-bit
/// counter, packed as `epoch << 32 | counter`.
///
/// Because the epoch grows whenever the counter wraps, an `Xid` never needs
/// freezing. The transaction registry guarantees that the distance between
/// the oldest in-progress xid and the newest assigned xid stays below 2^31.
///
/// # Example
///
/// ```rust
/// use palim_common::ids::Xid;
///
/// let xid = Xid::from_parts(1, 42);
/// assert_eq!(xid.epoch(), 1);
/// assert_eq!(xid.counter(), 42);
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Xid(u64);

impl Xid {
    /// Invalid xid, used as a sentinel value.
    pub const INVALID: Self = Self(0);

    /// The xid written into a frozen transaction slot. Rows stamped with it
    /// are visible to every snapshot and need no undo lookup.
    pub const FROZEN: Self = Self(1);

    /// First xid handed out to a normal transaction. Values below this are
    /// reserved for the sentinels above.
    pub const FIRST_NORMAL: Self = Self(3);

    /// Creates an xid from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Creates an xid from an epoch and a counter.
    #[inline]
    #[must_use]
    pub const fn from_parts(epoch: u32, counter: u32) -> Self {
        Self(((epoch as u64) << 32) | counter as u64)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the epoch component.
    #[inline]
    #[must_use]
    pub const fn epoch(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the counter component.
    #[inline]
    #[must_use]
    pub const fn counter(self) -> u32 {
        self.0 as u32
    }

    /// Returns the next xid.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Checks that this is not the invalid sentinel.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Checks that this is a normal, assignable xid (not a sentinel).
    #[inline]
    #[must_use]
    pub const fn is_normal(self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }

    /// Returns true if this xid was assigned before `other`.
    ///
    /// With 64-bit xids this is a plain comparison; the helper exists so
    /// call sites read as age checks rather than integer math.
    #[inline]
    #[must_use]
    pub const fn precedes(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Returns true if this xid was assigned after `other`.
    #[inline]
    #[must_use]
    pub const fn follows(self, other: Self) -> bool {
        self.0 > other.0
    }

    /// Creates an Xid from bytes (big-endian).
    #[inline]
    #[must_use]
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Converts to bytes (big-endian).
    #[inline]
    #[must_use]
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::INVALID => write!(f, "Xid(INVALID)"),
            Self::FROZEN => write!(f, "Xid(FROZEN)"),
            _ => write!(f, "Xid({}:{})", self.epoch(), self.counter()),
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch(), self.counter())
    }
}

impl From<u64> for Xid {
    #[inline]
    fn from(raw: u64) -> Self {
        Self::new(raw)
    }
}

impl From<Xid> for u64 {
    #[inline]
    fn from(xid: Xid) -> Self {
        xid.0
    }
}

/// Number of bits in an [`UndoPtr`] reserved for the byte offset.
pub const UNDO_PTR_OFFSET_BITS: u32 = 40;

/// Mask covering the offset bits of an [`UndoPtr`].
pub const UNDO_PTR_OFFSET_MASK: u64 = (1 << UNDO_PTR_OFFSET_BITS) - 1;

/// A 64-bit address into the undo store: the high 24 bits select a log,
/// the low 40 bits are a byte offset within that log.
///
/// Pointers are monotonic within one log; comparing pointers from
/// different logs is meaningless and the ordering impl is therefore only
/// derived for use within a single log.
///
/// # Example
///
/// ```rust
/// use palim_common::ids::UndoPtr;
///
/// let ptr = UndoPtr::from_parts(7, 4096);
/// assert_eq!(ptr.log_no(), 7);
/// assert_eq!(ptr.offset(), 4096);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct UndoPtr(u64);

impl UndoPtr {
    /// The "no undo" sentinel. Offset zero is never a valid record start
    /// because every log begins with its header block, so the all-zero
    /// pointer is free to mean "none".
    pub const INVALID: Self = Self(0);

    /// Creates an undo pointer from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Creates an undo pointer from a log number and a byte offset.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if either component overflows its field.
    #[inline]
    #[must_use]
    pub fn from_parts(log_no: u32, offset: u64) -> Self {
        debug_assert!(log_no < (1 << 24), "log number out of range");
        debug_assert!(offset <= UNDO_PTR_OFFSET_MASK, "undo offset out of range");
        Self(((log_no as u64) << UNDO_PTR_OFFSET_BITS) | offset)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the log number (high 24 bits).
    #[inline]
    #[must_use]
    pub const fn log_no(self) -> u32 {
        (self.0 >> UNDO_PTR_OFFSET_BITS) as u32
    }

    /// Returns the byte offset within the log (low 40 bits).
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.0 & UNDO_PTR_OFFSET_MASK
    }

    /// Returns this pointer advanced by `delta` bytes within the same log.
    #[inline]
    #[must_use]
    pub fn advance(self, delta: u64) -> Self {
        Self::from_parts(self.log_no(), self.offset() + delta)
    }

    /// Checks that this is not the "no undo" sentinel.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Creates an UndoPtr from bytes (big-endian).
    #[inline]
    #[must_use]
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Converts to bytes (big-endian).
    #[inline]
    #[must_use]
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for UndoPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "UndoPtr(INVALID)")
        } else {
            write!(f, "UndoPtr({}/{:#x})", self.log_no(), self.offset())
        }
    }
}

impl fmt::Display for UndoPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:#x}", self.log_no(), self.offset())
    }
}

/// A block number within a relation's main fork.
///
/// Block 0 is the relation metapage and never holds table rows.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct BlockNumber(u32);

impl BlockNumber {
    /// Invalid block number sentinel.
    pub const INVALID: Self = Self(u32::MAX);

    /// The relation metapage lives in block 0 of the main fork.
    pub const METAPAGE: Self = Self(0);

    /// First block that can hold table rows.
    pub const FIRST_DATA: Self = Self(1);

    /// Creates a block number from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the next block number.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Checks that this is not the invalid sentinel.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "BlockNumber(INVALID)")
        } else {
            write!(f, "BlockNumber({})", self.0)
        }
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for BlockNumber {
    #[inline]
    fn from(raw: u32) -> Self {
        Self::new(raw)
    }
}

/// A 1-based line-pointer index within a page.
///
/// Offset 0 is invalid, matching the on-page convention that a zero
/// offset field always means "absent".
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct OffsetNumber(u16);

impl OffsetNumber {
    /// Invalid offset number sentinel.
    pub const INVALID: Self = Self(0);

    /// First valid offset number.
    pub const FIRST: Self = Self(1);

    /// Creates an offset number from a raw u16 value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the raw u16 value.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the zero-based index of this offset into the line-pointer
    /// array.
    ///
    /// # Panics
    ///
    /// Panics in debug builds on the invalid sentinel.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        debug_assert!(self.is_valid(), "indexing with invalid offset number");
        (self.0 - 1) as usize
    }

    /// Returns the next offset number.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Checks that this is not the invalid sentinel.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for OffsetNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "OffsetNumber(INVALID)")
        } else {
            write!(f, "OffsetNumber({})", self.0)
        }
    }
}

impl fmt::Display for OffsetNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A row identifier: (block, 1-based offset within the block).
///
/// Not stable across non-in-place updates; the origin tuple's undo record
/// carries the new `Tid` so chasers can follow the move.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tid {
    /// Block number within the relation.
    pub block: BlockNumber,
    /// 1-based line-pointer index within the block.
    pub offset: OffsetNumber,
}

impl Tid {
    /// Invalid tid sentinel.
    pub const INVALID: Self = Self {
        block: BlockNumber::INVALID,
        offset: OffsetNumber::INVALID,
    };

    /// Creates a tid from a block and an offset.
    #[inline]
    #[must_use]
    pub const fn new(block: BlockNumber, offset: OffsetNumber) -> Self {
        Self { block, offset }
    }

    /// Checks that both components are valid.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.block.is_valid() && self.offset.is_valid()
    }

    /// Converts to 6 bytes (big-endian block, then offset).
    #[inline]
    #[must_use]
    pub fn to_bytes(self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[0..4].copy_from_slice(&self.block.as_u32().to_be_bytes());
        out[4..6].copy_from_slice(&self.offset.as_u16().to_be_bytes());
        out
    }

    /// Reads a tid from 6 bytes.
    #[inline]
    #[must_use]
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        let block = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let offset = u16::from_be_bytes([bytes[4], bytes[5]]);
        Self::new(BlockNumber::new(block), OffsetNumber::new(offset))
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({}, {})", self.block, self.offset)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.block, self.offset)
    }
}

/// A transaction-slot number on a page.
///
/// Slot numbers are 1-based as stored in tuple headers and line pointers;
/// slot 0 is the frozen sentinel meaning "all-visible, no undo lookup".
/// The numbers above the per-page array refer into overflow pages.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct SlotNo(u16);

impl SlotNo {
    /// The frozen sentinel: tuples stamped with it are all-visible.
    pub const FROZEN: Self = Self(0);

    /// First real slot number.
    pub const FIRST: Self = Self(1);

    /// Creates a slot number from a raw u16 value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the raw u16 value.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the zero-based index into the slot array.
    ///
    /// # Panics
    ///
    /// Panics in debug builds on the frozen sentinel, which has no array
    /// entry.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        debug_assert!(self.0 > 0, "frozen sentinel has no slot array entry");
        (self.0 - 1) as usize
    }

    /// Checks whether this is the frozen sentinel.
    #[inline]
    #[must_use]
    pub const fn is_frozen(self) -> bool {
        self.0 == Self::FROZEN.0
    }
}

impl fmt::Debug for SlotNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_frozen() {
            write!(f, "SlotNo(FROZEN)")
        } else {
            write!(f, "SlotNo({})", self.0)
        }
    }
}

impl fmt::Display for SlotNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a relation's on-disk file, recorded in undo and WAL records
/// so replay and rollback can find the right pages.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct RelFileId(u32);

impl RelFileId {
    /// Invalid relation file id sentinel.
    pub const INVALID: Self = Self(0);

    /// Creates a relation file id from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Checks that this is not the invalid sentinel.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for RelFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelFileId({})", self.0)
    }
}

impl fmt::Display for RelFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Intra-transaction statement counter, used to detect a transaction
/// tripping over its own earlier modifications.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct CommandId(u32);

impl CommandId {
    /// The first command of a transaction.
    pub const FIRST: Self = Self(0);

    /// Creates a command id from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the next command id.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandId({})", self.0)
    }
}

/// Token identifying one speculative insertion, carried in the insert undo
/// record and matched at completion time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SpecToken(u32);

impl SpecToken {
    /// Creates a token from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for SpecToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpecToken({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xid_parts() {
        let xid = Xid::from_parts(2, 7);
        assert_eq!(xid.epoch(), 2);
        assert_eq!(xid.counter(), 7);
        assert_eq!(xid.as_u64(), (2u64 << 32) | 7);
        assert!(xid.is_valid());
        assert!(xid.is_normal());
    }

    #[test]
    fn test_xid_sentinels() {
        assert!(!Xid::INVALID.is_valid());
        assert!(Xid::FROZEN.is_valid());
        assert!(!Xid::FROZEN.is_normal());
        assert!(Xid::FIRST_NORMAL.is_normal());
    }

    #[test]
    fn test_xid_ordering_across_epochs() {
        let late_in_epoch = Xid::from_parts(0, u32::MAX);
        let early_next_epoch = Xid::from_parts(1, 0);
        assert!(late_in_epoch.precedes(early_next_epoch));
        assert!(early_next_epoch.follows(late_in_epoch));
    }

    #[test]
    fn test_xid_byte_round_trip() {
        let xid = Xid::from_parts(9, 12345);
        assert_eq!(Xid::from_be_bytes(xid.to_be_bytes()), xid);
    }

    #[test]
    fn test_undo_ptr_parts() {
        let ptr = UndoPtr::from_parts(3, 0xABCDE);
        assert_eq!(ptr.log_no(), 3);
        assert_eq!(ptr.offset(), 0xABCDE);
        assert!(ptr.is_valid());
    }

    #[test]
    fn test_undo_ptr_max_fields() {
        let ptr = UndoPtr::from_parts((1 << 24) - 1, UNDO_PTR_OFFSET_MASK);
        assert_eq!(ptr.log_no(), (1 << 24) - 1);
        assert_eq!(ptr.offset(), UNDO_PTR_OFFSET_MASK);
    }

    #[test]
    fn test_undo_ptr_advance() {
        let ptr = UndoPtr::from_parts(1, 100);
        let next = ptr.advance(28);
        assert_eq!(next.log_no(), 1);
        assert_eq!(next.offset(), 128);
    }

    #[test]
    fn test_undo_ptr_ordering_within_log() {
        assert!(UndoPtr::from_parts(1, 100) < UndoPtr::from_parts(1, 200));
    }

    #[test]
    fn test_undo_ptr_invalid() {
        assert!(!UndoPtr::INVALID.is_valid());
        assert_eq!(UndoPtr::INVALID.log_no(), 0);
        assert_eq!(UndoPtr::INVALID.offset(), 0);
    }

    #[test]
    fn test_offset_number_index() {
        assert_eq!(OffsetNumber::FIRST.index(), 0);
        assert_eq!(OffsetNumber::new(5).index(), 4);
        assert!(!OffsetNumber::INVALID.is_valid());
    }

    #[test]
    fn test_tid_round_trip() {
        let tid = Tid::new(BlockNumber::new(17), OffsetNumber::new(4));
        assert_eq!(Tid::from_bytes(tid.to_bytes()), tid);
        assert!(tid.is_valid());
        assert!(!Tid::INVALID.is_valid());
    }

    #[test]
    fn test_slot_no() {
        assert!(SlotNo::FROZEN.is_frozen());
        assert!(!SlotNo::FIRST.is_frozen());
        assert_eq!(SlotNo::FIRST.index(), 0);
        assert_eq!(SlotNo::new(4).index(), 3);
    }

    #[test]
    fn test_block_number() {
        assert_eq!(BlockNumber::METAPAGE.as_u32(), 0);
        assert_eq!(BlockNumber::FIRST_DATA.as_u32(), 1);
        assert!(!BlockNumber::INVALID.is_valid());
        assert_eq!(BlockNumber::new(7).next().as_u32(), 8);
    }

    #[test]
    fn test_command_id() {
        let cid = CommandId::FIRST;
        assert_eq!(cid.next().as_u32(), 1);
    }
}
