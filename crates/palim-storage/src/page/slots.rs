//! Transaction slots.
//!
//! The special area at the end of every data page holds a fixed array of
//! 16-byte transaction slots, each pairing an xid with that transaction's
//! newest undo pointer for this page. Tuple headers reference slots by
//! number; slot 0 is the frozen sentinel and has no array entry.

use palim_common::constants::{TRANS_SLOTS_PER_PAGE, TRANS_SLOT_SIZE};
use palim_common::{SlotNo, UndoPtr, Xid};

use super::header::data_special_offset;

/// One transaction slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransSlot {
    /// The owning transaction, or invalid if the slot is free.
    pub xid: Xid,
    /// The transaction's newest undo record touching this page.
    pub undo_ptr: UndoPtr,
}

impl TransSlot {
    /// An empty slot.
    pub const EMPTY: Self = Self {
        xid: Xid::INVALID,
        undo_ptr: UndoPtr::INVALID,
    };

    /// A slot stamped frozen: its rows are all-visible.
    pub const FROZEN: Self = Self {
        xid: Xid::FROZEN,
        undo_ptr: UndoPtr::INVALID,
    };

    /// Creates a slot.
    pub const fn new(xid: Xid, undo_ptr: UndoPtr) -> Self {
        Self { xid, undo_ptr }
    }

    /// Returns true if no transaction owns the slot.
    #[inline]
    pub fn is_free(&self) -> bool {
        !self.xid.is_valid()
    }

    /// Returns true if the slot is stamped frozen.
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.xid == Xid::FROZEN
    }

    /// Decodes a slot from its 16 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= TRANS_SLOT_SIZE);
        Self {
            xid: Xid::new(u64::from_le_bytes(bytes[0..8].try_into().unwrap())),
            undo_ptr: UndoPtr::new(u64::from_le_bytes(bytes[8..16].try_into().unwrap())),
        }
    }

    /// Encodes the slot into 16 bytes.
    pub fn to_bytes(self) -> [u8; TRANS_SLOT_SIZE] {
        let mut out = [0u8; TRANS_SLOT_SIZE];
        out[0..8].copy_from_slice(&self.xid.as_u64().to_le_bytes());
        out[8..16].copy_from_slice(&self.undo_ptr.as_u64().to_le_bytes());
        out
    }
}

/// Byte position of a slot's entry within a data page.
pub(crate) fn slot_offset(slot: SlotNo) -> usize {
    debug_assert!(!slot.is_frozen(), "frozen sentinel has no entry");
    data_special_offset() + slot.index() * TRANS_SLOT_SIZE
}

/// Reads a slot from a data page.
pub(crate) fn read_slot(data: &[u8], slot: SlotNo) -> TransSlot {
    let at = slot_offset(slot);
    TransSlot::from_bytes(&data[at..at + TRANS_SLOT_SIZE])
}

/// Writes a slot into a data page.
pub(crate) fn write_slot(data: &mut [u8], slot: SlotNo, value: TransSlot) {
    let at = slot_offset(slot);
    data[at..at + TRANS_SLOT_SIZE].copy_from_slice(&value.to_bytes());
}

/// Iterates the on-page slot numbers.
pub(crate) fn on_page_slots() -> impl Iterator<Item = SlotNo> {
    (1..=TRANS_SLOTS_PER_PAGE as u16).map(SlotNo::new)
}
