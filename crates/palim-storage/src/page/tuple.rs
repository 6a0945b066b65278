//! Tuple format.
//!
//! A tuple is a 5-byte header followed immediately by the column payload,
//! with no padding between header and body:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       2   infomask2 (low 6 bits: transaction-slot number)
//!   2       2   infomask  (visibility and lock bits)
//!   4       1   hoff      (header size; payload starts here)
//! ```
//!
//! Tuples are placed on two-byte boundaries so header words can be
//! rewritten in place under the page lock. Payload bytes are opaque to
//! this layer except that multi-byte values inside them may be
//! unaligned, so field access goes through the copying readers at the
//! bottom of this module.

use palim_common::constants::TUPLE_HEADER_SIZE;
use palim_common::SlotNo;

/// Mask of the transaction-slot bits within `infomask2`.
pub const SLOT_MASK: u16 = 0x003F;

bitflags::bitflags! {
    /// Tuple infomask bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InfoMask: u16 {
        /// Payload carries a null bitmap.
        const HAS_NULLS = 0x0001;
        /// Payload carries out-of-line values.
        const HAS_EXTERNAL = 0x0002;
        /// A row lock is (or was) held; the lock mode bits are valid.
        const HAS_LOCK = 0x0004;
        /// More than one locker is or was active on this row.
        const MULTI_LOCKER = 0x0008;
        /// Speculative insertion awaiting confirmation.
        const SPECULATIVE = 0x0010;
        /// The row's transaction slot was recycled; the authoritative
        /// xid must be recovered from the slot's undo chain.
        const SLOT_REUSED = 0x0020;
        /// The row was updated in place; prior image in the undo chain.
        const IN_PLACE_UPDATED = 0x0040;

        /// Lock-mode field, three bits.
        const LOCK_MODE_MASK = 0x0700;
    }
}

/// Row-level lock modes, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockMode {
    /// Blocks only exclusive locks.
    KeyShare = 1,
    /// Blocks key and plain exclusive locks.
    Share = 2,
    /// Taken by updates that leave key columns alone.
    NoKeyExclusive = 3,
    /// Blocks everything; taken by delete and key updates.
    Exclusive = 4,
}

impl LockMode {
    /// Parses the numeric mode.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::KeyShare),
            2 => Some(Self::Share),
            3 => Some(Self::NoKeyExclusive),
            4 => Some(Self::Exclusive),
            _ => None,
        }
    }

    /// Returns the numeric mode.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns the stronger of two modes.
    #[inline]
    pub fn stronger(self, other: Self) -> Self {
        if self >= other {
            self
        } else {
            other
        }
    }

    /// Returns true if the two modes can be held concurrently.
    pub fn is_compatible_with(self, other: Self) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (KeyShare, KeyShare)
                | (KeyShare, Share)
                | (KeyShare, NoKeyExclusive)
                | (Share, KeyShare)
                | (Share, Share)
                | (NoKeyExclusive, KeyShare)
        )
    }
}

/// A decoded tuple header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleHeader {
    /// infomask2: slot number plus reserved bits.
    pub infomask2: u16,
    /// Visibility and lock bits.
    pub infomask: InfoMask,
    /// Header size; payload starts at this offset.
    pub hoff: u8,
}

impl TupleHeader {
    /// A fresh header for a plain insert into the given slot.
    pub fn for_insert(slot: SlotNo) -> Self {
        let mut header = Self {
            infomask2: 0,
            infomask: InfoMask::empty(),
            hoff: TUPLE_HEADER_SIZE as u8,
        };
        header.set_slot(slot);
        header
    }

    /// Returns the transaction-slot number.
    #[inline]
    pub fn slot(&self) -> SlotNo {
        SlotNo::new(self.infomask2 & SLOT_MASK)
    }

    /// Sets the transaction-slot number.
    #[inline]
    pub fn set_slot(&mut self, slot: SlotNo) {
        debug_assert!(slot.as_u16() <= SLOT_MASK, "slot number overflows header");
        self.infomask2 = (self.infomask2 & !SLOT_MASK) | slot.as_u16();
    }

    /// Returns the lock mode, if the lock bits are valid.
    pub fn lock_mode(&self) -> Option<LockMode> {
        if !self.infomask.contains(InfoMask::HAS_LOCK) {
            return None;
        }
        LockMode::from_u8(((self.infomask.bits() & InfoMask::LOCK_MODE_MASK.bits()) >> 8) as u8)
    }

    /// Stores a lock mode and sets the lock bit.
    pub fn set_lock_mode(&mut self, mode: LockMode) {
        let bits = (self.infomask.bits() & !InfoMask::LOCK_MODE_MASK.bits())
            | ((mode.as_u8() as u16) << 8);
        self.infomask = InfoMask::from_bits_retain(bits) | InfoMask::HAS_LOCK;
    }

    /// Clears the lock bits.
    pub fn clear_lock(&mut self) {
        let bits = self.infomask.bits() & !InfoMask::LOCK_MODE_MASK.bits();
        self.infomask = InfoMask::from_bits_retain(bits);
        self.infomask -= InfoMask::HAS_LOCK;
        self.infomask -= InfoMask::MULTI_LOCKER;
    }

    /// Decodes a header from the first 5 tuple bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= TUPLE_HEADER_SIZE);
        Self {
            infomask2: u16::from_le_bytes([bytes[0], bytes[1]]),
            infomask: InfoMask::from_bits_retain(u16::from_le_bytes([bytes[2], bytes[3]])),
            hoff: bytes[4],
        }
    }

    /// Encodes the header into 5 bytes.
    pub fn to_bytes(self) -> [u8; TUPLE_HEADER_SIZE] {
        let mut out = [0u8; TUPLE_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.infomask2.to_le_bytes());
        out[2..4].copy_from_slice(&self.infomask.bits().to_le_bytes());
        out[4] = self.hoff;
        out
    }

    /// Builds a full tuple image: header followed by payload, no padding.
    pub fn with_payload(self, payload: &[u8]) -> Vec<u8> {
        let mut tuple = Vec::with_capacity(TUPLE_HEADER_SIZE + payload.len());
        tuple.extend_from_slice(&self.to_bytes());
        tuple.extend_from_slice(payload);
        tuple
    }
}

/// Reads a u32 from a possibly unaligned position in a tuple payload.
#[inline]
pub fn read_unaligned_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

/// Reads a u64 from a possibly unaligned position in a tuple payload.
#[inline]
pub fn read_unaligned_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut header = TupleHeader::for_insert(SlotNo::new(3));
        header.infomask |= InfoMask::IN_PLACE_UPDATED;
        let decoded = TupleHeader::from_bytes(&header.to_bytes());
        assert_eq!(decoded, header);
        assert_eq!(decoded.slot(), SlotNo::new(3));
        assert!(decoded.infomask.contains(InfoMask::IN_PLACE_UPDATED));
    }

    #[test]
    fn test_slot_field_isolated() {
        let mut header = TupleHeader::for_insert(SlotNo::new(1));
        header.infomask2 |= 0x4000; // unrelated reserved bit
        header.set_slot(SlotNo::new(5));
        assert_eq!(header.slot(), SlotNo::new(5));
        assert_eq!(header.infomask2 & 0x4000, 0x4000);
    }

    #[test]
    fn test_lock_mode_round_trip() {
        let mut header = TupleHeader::for_insert(SlotNo::new(2));
        assert_eq!(header.lock_mode(), None);

        header.set_lock_mode(LockMode::Share);
        assert_eq!(header.lock_mode(), Some(LockMode::Share));

        header.set_lock_mode(LockMode::Exclusive);
        assert_eq!(header.lock_mode(), Some(LockMode::Exclusive));

        header.clear_lock();
        assert_eq!(header.lock_mode(), None);
        assert!(!header.infomask.contains(InfoMask::HAS_LOCK));
    }

    #[test]
    fn test_lock_mode_lattice() {
        assert_eq!(
            LockMode::Share.stronger(LockMode::Exclusive),
            LockMode::Exclusive
        );
        assert_eq!(LockMode::Share.stronger(LockMode::KeyShare), LockMode::Share);
        assert!(LockMode::KeyShare.is_compatible_with(LockMode::NoKeyExclusive));
        assert!(!LockMode::Share.is_compatible_with(LockMode::Exclusive));
        assert!(!LockMode::Exclusive.is_compatible_with(LockMode::Exclusive));
    }

    #[test]
    fn test_with_payload_has_no_padding() {
        let header = TupleHeader::for_insert(SlotNo::new(1));
        let tuple = header.with_payload(b"abc");
        assert_eq!(tuple.len(), TUPLE_HEADER_SIZE + 3);
        assert_eq!(&tuple[TUPLE_HEADER_SIZE..], b"abc");
    }

    #[test]
    fn test_unaligned_reads() {
        let mut payload = vec![0u8; 16];
        payload[3..7].copy_from_slice(&0xCAFE_F00Du32.to_le_bytes());
        payload[7..15].copy_from_slice(&0x0123_4567_89AB_CDEFu64.to_le_bytes());
        assert_eq!(read_unaligned_u32(&payload, 3), 0xCAFE_F00D);
        assert_eq!(read_unaligned_u64(&payload, 7), 0x0123_4567_89AB_CDEF);
    }
}
