//! Typed undo records and their wire codec.
//!
//! One undo record is written per page-touching operation. Records are
//! length-prefixed *and* length-suffixed so rollback can walk a log
//! backwards without an index:
//!
//! ```text
//! | total_len u16 | type u8 | flags u8 | rel u32 | block u32 | offset u16 |
//! | xid u64 | prev_undo u64 | blkprev u64 |        fixed header, 38 bytes
//! | payload ...              |                     type-specific
//! | crc u32 | total_len u16  |                     trailer, 6 bytes
//! ```
//!
//! `prev_undo` is the per-transaction back-link; `blkprev` is the link to
//! the previous record of the same transaction on the same page. The crc
//! covers everything before it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use palim_common::{BlockNumber, OffsetNumber, RelFileId, SpecToken, Tid, UndoPtr, Xid};

use crate::error::{UndoError, UndoResult};

/// Size of the fixed record header in bytes.
pub const UNDO_RECORD_HEADER_SIZE: usize = 38;

/// Size of the record trailer (crc + repeated length) in bytes.
pub const UNDO_RECORD_TRAILER_SIZE: usize = 6;

/// Byte offset of the `next_txn_start` field within an encoded
/// transaction-header record. The log manager patches this field in place
/// when the next transaction arrives.
pub const NEXT_TXN_START_FIELD_OFFSET: usize = UNDO_RECORD_HEADER_SIZE;

/// Discriminator for the undo record variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UndoRecordType {
    /// First record of a transaction in a log; links to the next
    /// transaction's start for the discard walk.
    XactHeader = 1,
    /// Row insertion.
    Insert = 2,
    /// Bulk insertion of one contiguous offset range.
    MultiInsert = 3,
    /// Row deletion; carries the deleted tuple.
    Delete = 4,
    /// In-place update; carries the prior tuple image.
    InPlaceUpdate = 5,
    /// Update that moved the row; carries the prior image and the new tid.
    NonInPlaceUpdate = 6,
    /// Row lock; carries the prior tuple header.
    Lock = 7,
    /// Recycling of a still-referenced committed transaction slot.
    SlotReuse = 8,
}

impl UndoRecordType {
    /// Returns the numeric discriminator.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a discriminator byte.
    pub fn from_u8(value: u8) -> UndoResult<Self> {
        match value {
            1 => Ok(Self::XactHeader),
            2 => Ok(Self::Insert),
            3 => Ok(Self::MultiInsert),
            4 => Ok(Self::Delete),
            5 => Ok(Self::InPlaceUpdate),
            6 => Ok(Self::NonInPlaceUpdate),
            7 => Ok(Self::Lock),
            8 => Ok(Self::SlotReuse),
            other => Err(UndoError::corrupted(format!(
                "unknown undo record type {}",
                other
            ))),
        }
    }
}

bitflags::bitflags! {
    /// Per-record flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UndoRecordFlags: u8 {
        /// Insert record carries a speculative token.
        const SPECULATIVE = 0b0000_0001;
        /// Record carries a subtransaction id.
        const SUBXACT = 0b0000_0010;
    }
}

/// Type-specific payload of an undo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoPayload {
    /// See [`UndoRecordType::XactHeader`].
    XactHeader {
        /// Offset of the next transaction's first record in this log, or
        /// zero while this is still the newest transaction.
        next_txn_start: u64,
    },
    /// See [`UndoRecordType::Insert`].
    Insert {
        /// Completion token when this was a speculative insertion.
        spec_token: Option<SpecToken>,
    },
    /// See [`UndoRecordType::MultiInsert`].
    MultiInsert {
        /// Inclusive offset ranges filled by the bulk insert.
        ranges: Vec<(OffsetNumber, OffsetNumber)>,
    },
    /// See [`UndoRecordType::Delete`].
    Delete {
        /// The full deleted tuple (header + payload).
        tuple: Bytes,
        /// Owning subtransaction, when the delete happened inside one.
        subxact: Option<u32>,
    },
    /// See [`UndoRecordType::InPlaceUpdate`].
    InPlaceUpdate {
        /// The full prior tuple image.
        old_tuple: Bytes,
    },
    /// See [`UndoRecordType::NonInPlaceUpdate`].
    NonInPlaceUpdate {
        /// The full prior tuple image.
        old_tuple: Bytes,
        /// Where the replacement row was placed.
        new_tid: Tid,
    },
    /// See [`UndoRecordType::Lock`].
    Lock {
        /// Prior tuple header bytes, restored on rollback.
        prior_header: Bytes,
        /// The acquired lock mode, as stored in the tuple infomask.
        mode: u8,
        /// Owning subtransaction, when the lock was taken inside one.
        subxact: Option<u32>,
    },
    /// See [`UndoRecordType::SlotReuse`].
    SlotReuse {
        /// The committed transaction that previously owned the slot.
        prev_xid: Xid,
        /// That transaction's last undo pointer for the page.
        prev_undo: UndoPtr,
    },
}

impl UndoPayload {
    /// Returns the record type this payload belongs to.
    pub fn record_type(&self) -> UndoRecordType {
        match self {
            Self::XactHeader { .. } => UndoRecordType::XactHeader,
            Self::Insert { .. } => UndoRecordType::Insert,
            Self::MultiInsert { .. } => UndoRecordType::MultiInsert,
            Self::Delete { .. } => UndoRecordType::Delete,
            Self::InPlaceUpdate { .. } => UndoRecordType::InPlaceUpdate,
            Self::NonInPlaceUpdate { .. } => UndoRecordType::NonInPlaceUpdate,
            Self::Lock { .. } => UndoRecordType::Lock,
            Self::SlotReuse { .. } => UndoRecordType::SlotReuse,
        }
    }

    fn flags(&self) -> UndoRecordFlags {
        let mut flags = UndoRecordFlags::empty();
        match self {
            Self::Insert {
                spec_token: Some(_),
            } => flags |= UndoRecordFlags::SPECULATIVE,
            Self::Delete {
                subxact: Some(_), ..
            }
            | Self::Lock {
                subxact: Some(_), ..
            } => flags |= UndoRecordFlags::SUBXACT,
            _ => {}
        }
        flags
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::XactHeader { .. } => 8,
            Self::Insert { spec_token } => {
                if spec_token.is_some() {
                    4
                } else {
                    0
                }
            }
            Self::MultiInsert { ranges } => 2 + ranges.len() * 4,
            Self::Delete { tuple, subxact } => {
                2 + tuple.len() + if subxact.is_some() { 4 } else { 0 }
            }
            Self::InPlaceUpdate { old_tuple } => 2 + old_tuple.len(),
            Self::NonInPlaceUpdate { old_tuple, .. } => 2 + old_tuple.len() + 6,
            Self::Lock {
                prior_header,
                subxact,
                ..
            } => 2 + prior_header.len() + 1 + if subxact.is_some() { 4 } else { 0 },
            Self::SlotReuse { .. } => 16,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::XactHeader { next_txn_start } => buf.put_u64(*next_txn_start),
            Self::Insert { spec_token } => {
                if let Some(token) = spec_token {
                    buf.put_u32(token.as_u32());
                }
            }
            Self::MultiInsert { ranges } => {
                buf.put_u16(ranges.len() as u16);
                for (start, end) in ranges {
                    buf.put_u16(start.as_u16());
                    buf.put_u16(end.as_u16());
                }
            }
            Self::Delete { tuple, subxact } => {
                buf.put_u16(tuple.len() as u16);
                buf.put_slice(tuple);
                if let Some(sub) = subxact {
                    buf.put_u32(*sub);
                }
            }
            Self::InPlaceUpdate { old_tuple } => {
                buf.put_u16(old_tuple.len() as u16);
                buf.put_slice(old_tuple);
            }
            Self::NonInPlaceUpdate { old_tuple, new_tid } => {
                buf.put_u16(old_tuple.len() as u16);
                buf.put_slice(old_tuple);
                buf.put_slice(&new_tid.to_bytes());
            }
            Self::Lock {
                prior_header,
                mode,
                subxact,
            } => {
                buf.put_u16(prior_header.len() as u16);
                buf.put_slice(prior_header);
                buf.put_u8(*mode);
                if let Some(sub) = subxact {
                    buf.put_u32(*sub);
                }
            }
            Self::SlotReuse { prev_xid, prev_undo } => {
                buf.put_u64(prev_xid.as_u64());
                buf.put_u64(prev_undo.as_u64());
            }
        }
    }

    fn decode(
        record_type: UndoRecordType,
        flags: UndoRecordFlags,
        buf: &mut &[u8],
    ) -> UndoResult<Self> {
        let need = |buf: &&[u8], n: usize| -> UndoResult<()> {
            if buf.remaining() < n {
                Err(UndoError::corrupted("undo payload truncated"))
            } else {
                Ok(())
            }
        };

        match record_type {
            UndoRecordType::XactHeader => {
                need(buf, 8)?;
                Ok(Self::XactHeader {
                    next_txn_start: buf.get_u64(),
                })
            }
            UndoRecordType::Insert => {
                let spec_token = if flags.contains(UndoRecordFlags::SPECULATIVE) {
                    need(buf, 4)?;
                    Some(SpecToken::new(buf.get_u32()))
                } else {
                    None
                };
                Ok(Self::Insert { spec_token })
            }
            UndoRecordType::MultiInsert => {
                need(buf, 2)?;
                let count = buf.get_u16() as usize;
                need(buf, count * 4)?;
                let mut ranges = Vec::with_capacity(count);
                for _ in 0..count {
                    let start = OffsetNumber::new(buf.get_u16());
                    let end = OffsetNumber::new(buf.get_u16());
                    ranges.push((start, end));
                }
                Ok(Self::MultiInsert { ranges })
            }
            UndoRecordType::Delete => {
                let tuple = get_prefixed_bytes(buf)?;
                let subxact = if flags.contains(UndoRecordFlags::SUBXACT) {
                    need(buf, 4)?;
                    Some(buf.get_u32())
                } else {
                    None
                };
                Ok(Self::Delete { tuple, subxact })
            }
            UndoRecordType::InPlaceUpdate => Ok(Self::InPlaceUpdate {
                old_tuple: get_prefixed_bytes(buf)?,
            }),
            UndoRecordType::NonInPlaceUpdate => {
                let old_tuple = get_prefixed_bytes(buf)?;
                need(buf, 6)?;
                let mut tid_bytes = [0u8; 6];
                buf.copy_to_slice(&mut tid_bytes);
                Ok(Self::NonInPlaceUpdate {
                    old_tuple,
                    new_tid: Tid::from_bytes(tid_bytes),
                })
            }
            UndoRecordType::Lock => {
                let prior_header = get_prefixed_bytes(buf)?;
                need(buf, 1)?;
                let mode = buf.get_u8();
                let subxact = if flags.contains(UndoRecordFlags::SUBXACT) {
                    need(buf, 4)?;
                    Some(buf.get_u32())
                } else {
                    None
                };
                Ok(Self::Lock {
                    prior_header,
                    mode,
                    subxact,
                })
            }
            UndoRecordType::SlotReuse => {
                need(buf, 16)?;
                Ok(Self::SlotReuse {
                    prev_xid: Xid::new(buf.get_u64()),
                    prev_undo: UndoPtr::new(buf.get_u64()),
                })
            }
        }
    }
}

fn get_prefixed_bytes(buf: &mut &[u8]) -> UndoResult<Bytes> {
    if buf.remaining() < 2 {
        return Err(UndoError::corrupted("undo payload truncated"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(UndoError::corrupted("undo payload truncated"));
    }
    let bytes = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(bytes)
}

/// One undo record, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    /// Relation the operation touched.
    pub rel: RelFileId,
    /// The touched row's location.
    pub tid: Tid,
    /// Transaction that performed the operation.
    pub xid: Xid,
    /// Per-transaction back-link: this transaction's previous undo record
    /// (in the same log, by invariant).
    pub prev_undo: UndoPtr,
    /// Per-page chain: this transaction's previous record for this page.
    pub blkprev: UndoPtr,
    /// Type-specific payload.
    pub payload: UndoPayload,
}

impl UndoRecord {
    /// Builds a record.
    pub fn new(
        rel: RelFileId,
        tid: Tid,
        xid: Xid,
        prev_undo: UndoPtr,
        blkprev: UndoPtr,
        payload: UndoPayload,
    ) -> Self {
        Self {
            rel,
            tid,
            xid,
            prev_undo,
            blkprev,
            payload,
        }
    }

    /// Returns the record type.
    #[inline]
    pub fn record_type(&self) -> UndoRecordType {
        self.payload.record_type()
    }

    /// Returns true if this record changed row contents (as opposed to
    /// lock and bookkeeping records). The visibility resolver descends
    /// past records for which this is false.
    pub fn modifies_row(&self) -> bool {
        matches!(
            self.record_type(),
            UndoRecordType::Insert
                | UndoRecordType::MultiInsert
                | UndoRecordType::Delete
                | UndoRecordType::InPlaceUpdate
                | UndoRecordType::NonInPlaceUpdate
        )
    }

    /// Returns true if this record is relevant for `(block, offset, xid)`.
    ///
    /// Chain walks use this to detect the end of the portion that concerns
    /// a particular row.
    pub fn matches(&self, block: BlockNumber, offset: OffsetNumber, xid: Xid) -> bool {
        self.tid.block == block && self.tid.offset == offset && self.xid == xid
    }

    /// Returns the total encoded size in bytes.
    pub fn encoded_size(&self) -> usize {
        UNDO_RECORD_HEADER_SIZE + self.payload.encoded_len() + UNDO_RECORD_TRAILER_SIZE
    }

    /// Encodes the record, including checksum and trailer.
    pub fn encode(&self) -> Bytes {
        let total = self.encoded_size();
        debug_assert!(total <= u16::MAX as usize, "undo record too large");

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u16(total as u16);
        buf.put_u8(self.record_type().as_u8());
        buf.put_u8(self.payload.flags().bits());
        buf.put_u32(self.rel.as_u32());
        buf.put_u32(self.tid.block.as_u32());
        buf.put_u16(self.tid.offset.as_u16());
        buf.put_u64(self.xid.as_u64());
        buf.put_u64(self.prev_undo.as_u64());
        buf.put_u64(self.blkprev.as_u64());
        self.payload.encode(&mut buf);

        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        buf.put_u16(total as u16);
        buf.freeze()
    }

    /// Decodes a record from its full encoded bytes.
    ///
    /// `ptr` is only used for error context.
    pub fn decode(bytes: &[u8], ptr: UndoPtr) -> UndoResult<Self> {
        if bytes.len() < UNDO_RECORD_HEADER_SIZE + UNDO_RECORD_TRAILER_SIZE {
            return Err(UndoError::corrupted("undo record shorter than header"));
        }

        let mut buf = bytes;
        let total = buf.get_u16() as usize;
        if total != bytes.len() {
            return Err(UndoError::corrupted(format!(
                "undo record length prefix {} does not match buffer {}",
                total,
                bytes.len()
            )));
        }

        let body_len = total - UNDO_RECORD_TRAILER_SIZE;
        let stored_crc = u32::from_be_bytes(
            bytes[body_len..body_len + 4]
                .try_into()
                .expect("slice is 4 bytes"),
        );
        let computed_crc = crc32fast::hash(&bytes[..body_len]);
        if stored_crc != computed_crc {
            return Err(UndoError::ChecksumMismatch {
                ptr,
                stored: stored_crc,
                computed: computed_crc,
            });
        }
        let trailer_len = u16::from_be_bytes(
            bytes[total - 2..]
                .try_into()
                .expect("slice is 2 bytes"),
        ) as usize;
        if trailer_len != total {
            return Err(UndoError::corrupted(
                "undo record trailer length does not match prefix",
            ));
        }

        let record_type = UndoRecordType::from_u8(buf.get_u8())?;
        let flags = UndoRecordFlags::from_bits_truncate(buf.get_u8());
        let rel = RelFileId::new(buf.get_u32());
        let block = BlockNumber::new(buf.get_u32());
        let offset = OffsetNumber::new(buf.get_u16());
        let xid = Xid::new(buf.get_u64());
        let prev_undo = UndoPtr::new(buf.get_u64());
        let blkprev = UndoPtr::new(buf.get_u64());

        let mut payload_buf = &buf[..body_len - UNDO_RECORD_HEADER_SIZE];
        let payload = UndoPayload::decode(record_type, flags, &mut payload_buf)?;
        if payload_buf.has_remaining() {
            return Err(UndoError::corrupted(
                "undo record payload has trailing bytes",
            ));
        }

        Ok(Self {
            rel,
            tid: Tid::new(block, offset),
            xid,
            prev_undo,
            blkprev,
            payload,
        })
    }
}

/// A decoded record together with the pointer it was read from, as
/// produced by chain walks and rollback windows.
#[derive(Debug, Clone)]
pub struct UndoRecordInfo {
    /// Where the record lives.
    pub ptr: UndoPtr,
    /// The record itself.
    pub record: UndoRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tid() -> Tid {
        Tid::new(BlockNumber::new(5), OffsetNumber::new(2))
    }

    fn round_trip(payload: UndoPayload) -> UndoRecord {
        let record = UndoRecord::new(
            RelFileId::new(16384),
            sample_tid(),
            Xid::from_parts(0, 42),
            UndoPtr::from_parts(1, 64),
            UndoPtr::from_parts(1, 128),
            payload,
        );
        let encoded = record.encode();
        assert_eq!(encoded.len(), record.encoded_size());
        let decoded = UndoRecord::decode(&encoded, UndoPtr::INVALID).unwrap();
        assert_eq!(decoded, record);
        decoded
    }

    #[test]
    fn test_insert_round_trip() {
        let rec = round_trip(UndoPayload::Insert { spec_token: None });
        assert!(rec.modifies_row());
    }

    #[test]
    fn test_speculative_insert_round_trip() {
        round_trip(UndoPayload::Insert {
            spec_token: Some(SpecToken::new(0xFEED)),
        });
    }

    #[test]
    fn test_delete_round_trip() {
        round_trip(UndoPayload::Delete {
            tuple: Bytes::from_static(b"\x01\x02\x03\x04\x05payload"),
            subxact: None,
        });
        round_trip(UndoPayload::Delete {
            tuple: Bytes::from_static(b"\x01\x02\x03\x04\x05payload"),
            subxact: Some(7),
        });
    }

    #[test]
    fn test_update_round_trips() {
        round_trip(UndoPayload::InPlaceUpdate {
            old_tuple: Bytes::from_static(b"old image"),
        });
        round_trip(UndoPayload::NonInPlaceUpdate {
            old_tuple: Bytes::from_static(b"old image"),
            new_tid: Tid::new(BlockNumber::new(9), OffsetNumber::new(1)),
        });
    }

    #[test]
    fn test_lock_round_trip() {
        let rec = round_trip(UndoPayload::Lock {
            prior_header: Bytes::from_static(&[0, 1, 2, 3, 4]),
            mode: 2,
            subxact: None,
        });
        assert!(!rec.modifies_row());
    }

    #[test]
    fn test_slot_reuse_round_trip() {
        round_trip(UndoPayload::SlotReuse {
            prev_xid: Xid::from_parts(0, 17),
            prev_undo: UndoPtr::from_parts(2, 4096),
        });
    }

    #[test]
    fn test_multi_insert_round_trip() {
        round_trip(UndoPayload::MultiInsert {
            ranges: vec![
                (OffsetNumber::new(1), OffsetNumber::new(8)),
                (OffsetNumber::new(12), OffsetNumber::new(14)),
            ],
        });
    }

    #[test]
    fn test_xact_header_round_trip_and_field_offset() {
        let record = UndoRecord::new(
            RelFileId::INVALID,
            Tid::INVALID,
            Xid::from_parts(0, 42),
            UndoPtr::INVALID,
            UndoPtr::INVALID,
            UndoPayload::XactHeader { next_txn_start: 0 },
        );
        let encoded = record.encode();
        // The patchable field must sit right after the fixed header.
        let field = &encoded[NEXT_TXN_START_FIELD_OFFSET..NEXT_TXN_START_FIELD_OFFSET + 8];
        assert_eq!(u64::from_be_bytes(field.try_into().unwrap()), 0);
    }

    #[test]
    fn test_corrupt_crc_detected() {
        let record = round_trip(UndoPayload::Insert { spec_token: None });
        let mut encoded = record.encode().to_vec();
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0xFF;
        let err = UndoRecord::decode(&encoded, UndoPtr::from_parts(0, 64)).unwrap_err();
        assert!(matches!(
            err,
            UndoError::ChecksumMismatch { .. } | UndoError::Corrupted { .. }
        ));
    }

    #[test]
    fn test_truncated_record_detected() {
        let record = round_trip(UndoPayload::Insert { spec_token: None });
        let encoded = record.encode();
        let err = UndoRecord::decode(&encoded[..encoded.len() - 3], UndoPtr::INVALID).unwrap_err();
        assert!(matches!(err, UndoError::Corrupted { .. }));
    }

    #[test]
    fn test_reverse_traversal_by_trailer() {
        // Concatenate two records, then find the second from the end.
        let a = round_trip(UndoPayload::Insert { spec_token: None }).encode();
        let b = round_trip(UndoPayload::Delete {
            tuple: Bytes::from_static(b"tuple bytes"),
            subxact: None,
        })
        .encode();

        let mut log = Vec::new();
        log.extend_from_slice(&a);
        log.extend_from_slice(&b);

        let tail_len =
            u16::from_be_bytes(log[log.len() - 2..].try_into().unwrap()) as usize;
        assert_eq!(tail_len, b.len());
        let b_start = log.len() - tail_len;
        let decoded = UndoRecord::decode(&log[b_start..], UndoPtr::INVALID).unwrap();
        assert_eq!(decoded.record_type(), UndoRecordType::Delete);
    }
}
