//! Engine WAL records and sinks.
//!
//! The kernel emits exactly one WAL record per critical section; the
//! record carries both the page delta and the hints needed to
//! reconstruct the paired undo record during recovery. When full-page
//! writes are off, records that would otherwise rely on a page image
//! (deletes, updates) carry the affected tuple outright.
//!
//! The write-ahead log proper lives outside this engine; [`WalSink`] is
//! the contract with it, and [`MemWal`] is the in-process stand-in used
//! by tests and by recovery-path unit checks.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use palim_common::{
    BlockNumber, EngineError, EngineResult, OffsetNumber, RelFileId, SlotNo, SpecToken, Tid,
    UndoPtr, Xid,
};
use palim_storage::page::tuple::InfoMask;
use palim_storage::page::{LinePointer, LockMode, TablePage};
use palim_undo::UndoMetaHint;

/// Undo-reconstruction hints carried by every DML record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoHints {
    /// Pointer the paired undo record was written at.
    pub undo_ptr: UndoPtr,
    /// The transaction's previous undo pointer (back-link).
    pub prev_undo: UndoPtr,
    /// The transaction slot used on the page.
    pub slot: u16,
}

/// One engine WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Row insertion.
    Insert {
        /// Relation touched.
        rel: RelFileId,
        /// Transaction.
        xid: Xid,
        /// Placement of the new row.
        tid: Tid,
        /// The tuple bytes.
        tuple: Bytes,
        /// Undo reconstruction hints.
        undo: UndoHints,
        /// Set for speculative insertions.
        spec_token: Option<SpecToken>,
    },
    /// Row deletion.
    Delete {
        /// Relation touched.
        rel: RelFileId,
        /// Transaction.
        xid: Xid,
        /// The deleted row.
        tid: Tid,
        /// The deleted tuple; present when full-page writes are off and
        /// recovery cannot take it from a page image.
        tuple: Option<Bytes>,
        /// Undo reconstruction hints.
        undo: UndoHints,
    },
    /// Row update, in place or migrating.
    Update {
        /// Relation touched.
        rel: RelFileId,
        /// Transaction.
        xid: Xid,
        /// The updated row's original position.
        tid: Tid,
        /// Where the new version lives (equals `tid` for in-place).
        new_tid: Tid,
        /// The new tuple bytes.
        tuple: Bytes,
        /// The prior tuple; present when full-page writes are off.
        old_tuple: Option<Bytes>,
        /// Undo reconstruction hints for the origin page.
        undo: UndoHints,
        /// True for the in-place variant.
        in_place: bool,
    },
    /// Bulk insertion of contiguous offset ranges.
    MultiInsert {
        /// Relation touched.
        rel: RelFileId,
        /// Transaction.
        xid: Xid,
        /// Target block.
        block: BlockNumber,
        /// The filled ranges, inclusive.
        ranges: Vec<(OffsetNumber, OffsetNumber)>,
        /// All inserted tuples, in range order.
        tuples: Vec<Bytes>,
        /// Undo reconstruction hints.
        undo: UndoHints,
    },
    /// Row lock acquisition.
    Lock {
        /// Relation touched.
        rel: RelFileId,
        /// Transaction.
        xid: Xid,
        /// The locked row.
        tid: Tid,
        /// The acquired mode, as stored in the infomask.
        mode: u8,
        /// Undo reconstruction hints.
        undo: UndoHints,
    },
    /// Speculative insertion confirmed.
    SpecConfirm {
        /// Relation touched.
        rel: RelFileId,
        /// The confirmed row.
        tid: Tid,
    },
    /// Speculative insertion abandoned.
    SpecAbort {
        /// Relation touched.
        rel: RelFileId,
        /// The abandoned row.
        tid: Tid,
    },
    /// Undo-log insertion point, emitted on writer change and first
    /// append after a checkpoint.
    UndoMeta {
        /// The log described.
        log_no: u32,
        /// Its insertion point.
        insert: u64,
        /// The writer attached.
        xid: Xid,
    },
    /// One page batch of rollback work.
    UndoApply {
        /// Relation touched.
        rel: RelFileId,
        /// The reverted page.
        block: BlockNumber,
        /// Transaction whose undo was applied.
        xid: Xid,
        /// Slot pointer after the batch; invalid when the slot was
        /// cleared.
        slot_rewind: UndoPtr,
    },
    /// Discard horizon advancement.
    Discard {
        /// The log discarded from.
        log_no: u32,
        /// New oldest reachable offset.
        new_oldest_data: u64,
        /// Oldest xid still holding undo in the log.
        oldest_xid: Xid,
    },
}

impl WalRecord {
    /// Builds an undo-meta record from the store's hint.
    pub fn undo_meta(hint: UndoMetaHint) -> Self {
        Self::UndoMeta {
            log_no: hint.log_no,
            insert: hint.insert,
            xid: hint.xid,
        }
    }

    fn discriminant(&self) -> u8 {
        match self {
            Self::Insert { .. } => 1,
            Self::Delete { .. } => 2,
            Self::Update { .. } => 3,
            Self::MultiInsert { .. } => 4,
            Self::Lock { .. } => 5,
            Self::SpecConfirm { .. } => 6,
            Self::SpecAbort { .. } => 7,
            Self::UndoMeta { .. } => 8,
            Self::UndoApply { .. } => 9,
            Self::Discard { .. } => 10,
        }
    }

    /// Encodes the record with a length prefix and trailing crc.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u8(self.discriminant());
        match self {
            Self::Insert {
                rel,
                xid,
                tid,
                tuple,
                undo,
                spec_token,
            } => {
                body.put_u32(rel.as_u32());
                body.put_u64(xid.as_u64());
                body.put_slice(&tid.to_bytes());
                put_hints(&mut body, undo);
                put_opt_u32(&mut body, spec_token.map(|t| t.as_u32()));
                put_bytes(&mut body, tuple);
            }
            Self::Delete {
                rel,
                xid,
                tid,
                tuple,
                undo,
            } => {
                body.put_u32(rel.as_u32());
                body.put_u64(xid.as_u64());
                body.put_slice(&tid.to_bytes());
                put_hints(&mut body, undo);
                put_opt_bytes(&mut body, tuple.as_ref());
            }
            Self::Update {
                rel,
                xid,
                tid,
                new_tid,
                tuple,
                old_tuple,
                undo,
                in_place,
            } => {
                body.put_u32(rel.as_u32());
                body.put_u64(xid.as_u64());
                body.put_slice(&tid.to_bytes());
                body.put_slice(&new_tid.to_bytes());
                put_hints(&mut body, undo);
                body.put_u8(u8::from(*in_place));
                put_bytes(&mut body, tuple);
                put_opt_bytes(&mut body, old_tuple.as_ref());
            }
            Self::MultiInsert {
                rel,
                xid,
                block,
                ranges,
                tuples,
                undo,
            } => {
                body.put_u32(rel.as_u32());
                body.put_u64(xid.as_u64());
                body.put_u32(block.as_u32());
                put_hints(&mut body, undo);
                body.put_u16(ranges.len() as u16);
                for (start, end) in ranges {
                    body.put_u16(start.as_u16());
                    body.put_u16(end.as_u16());
                }
                body.put_u16(tuples.len() as u16);
                for tuple in tuples {
                    put_bytes(&mut body, tuple);
                }
            }
            Self::Lock {
                rel,
                xid,
                tid,
                mode,
                undo,
            } => {
                body.put_u32(rel.as_u32());
                body.put_u64(xid.as_u64());
                body.put_slice(&tid.to_bytes());
                put_hints(&mut body, undo);
                body.put_u8(*mode);
            }
            Self::SpecConfirm { rel, tid } | Self::SpecAbort { rel, tid } => {
                body.put_u32(rel.as_u32());
                body.put_slice(&tid.to_bytes());
            }
            Self::UndoMeta { log_no, insert, xid } => {
                body.put_u32(*log_no);
                body.put_u64(*insert);
                body.put_u64(xid.as_u64());
            }
            Self::UndoApply {
                rel,
                block,
                xid,
                slot_rewind,
            } => {
                body.put_u32(rel.as_u32());
                body.put_u32(block.as_u32());
                body.put_u64(xid.as_u64());
                body.put_u64(slot_rewind.as_u64());
            }
            Self::Discard {
                log_no,
                new_oldest_data,
                oldest_xid,
            } => {
                body.put_u32(*log_no);
                body.put_u64(*new_oldest_data);
                body.put_u64(oldest_xid.as_u64());
            }
        }

        let mut out = BytesMut::with_capacity(body.len() + 8);
        out.put_u32(body.len() as u32);
        out.put_slice(&body);
        out.put_u32(crc32fast::hash(&body));
        out.freeze()
    }

    /// Decodes a record previously produced by [`Self::encode`].
    pub fn decode(mut bytes: &[u8]) -> EngineResult<Self> {
        if bytes.remaining() < 8 {
            return Err(EngineError::corrupted("wal record shorter than framing"));
        }
        let body_len = bytes.get_u32() as usize;
        if bytes.remaining() != body_len + 4 {
            return Err(EngineError::corrupted("wal record length mismatch"));
        }
        let body = &bytes[..body_len];
        let crc = u32::from_be_bytes(bytes[body_len..body_len + 4].try_into().unwrap());
        if crc != crc32fast::hash(body) {
            return Err(EngineError::corrupted("wal record checksum mismatch"));
        }

        let mut buf = body;
        let discriminant = buf.get_u8();
        let record = match discriminant {
            1 => {
                let rel = RelFileId::new(buf.get_u32());
                let xid = Xid::new(buf.get_u64());
                let tid = get_tid(&mut buf);
                let undo = get_hints(&mut buf);
                let spec_token = get_opt_u32(&mut buf).map(SpecToken::new);
                let tuple = get_bytes(&mut buf)?;
                Self::Insert {
                    rel,
                    xid,
                    tid,
                    tuple,
                    undo,
                    spec_token,
                }
            }
            2 => {
                let rel = RelFileId::new(buf.get_u32());
                let xid = Xid::new(buf.get_u64());
                let tid = get_tid(&mut buf);
                let undo = get_hints(&mut buf);
                let tuple = get_opt_bytes(&mut buf)?;
                Self::Delete {
                    rel,
                    xid,
                    tid,
                    tuple,
                    undo,
                }
            }
            3 => {
                let rel = RelFileId::new(buf.get_u32());
                let xid = Xid::new(buf.get_u64());
                let tid = get_tid(&mut buf);
                let new_tid = get_tid(&mut buf);
                let undo = get_hints(&mut buf);
                let in_place = buf.get_u8() != 0;
                let tuple = get_bytes(&mut buf)?;
                let old_tuple = get_opt_bytes(&mut buf)?;
                Self::Update {
                    rel,
                    xid,
                    tid,
                    new_tid,
                    tuple,
                    old_tuple,
                    undo,
                    in_place,
                }
            }
            4 => {
                let rel = RelFileId::new(buf.get_u32());
                let xid = Xid::new(buf.get_u64());
                let block = BlockNumber::new(buf.get_u32());
                let undo = get_hints(&mut buf);
                let nranges = buf.get_u16() as usize;
                let mut ranges = Vec::with_capacity(nranges);
                for _ in 0..nranges {
                    ranges.push((
                        OffsetNumber::new(buf.get_u16()),
                        OffsetNumber::new(buf.get_u16()),
                    ));
                }
                let ntuples = buf.get_u16() as usize;
                let mut tuples = Vec::with_capacity(ntuples);
                for _ in 0..ntuples {
                    tuples.push(get_bytes(&mut buf)?);
                }
                Self::MultiInsert {
                    rel,
                    xid,
                    block,
                    ranges,
                    tuples,
                    undo,
                }
            }
            5 => {
                let rel = RelFileId::new(buf.get_u32());
                let xid = Xid::new(buf.get_u64());
                let tid = get_tid(&mut buf);
                let undo = get_hints(&mut buf);
                let mode = buf.get_u8();
                Self::Lock {
                    rel,
                    xid,
                    tid,
                    mode,
                    undo,
                }
            }
            6 | 7 => {
                let rel = RelFileId::new(buf.get_u32());
                let tid = get_tid(&mut buf);
                if discriminant == 6 {
                    Self::SpecConfirm { rel, tid }
                } else {
                    Self::SpecAbort { rel, tid }
                }
            }
            8 => Self::UndoMeta {
                log_no: buf.get_u32(),
                insert: buf.get_u64(),
                xid: Xid::new(buf.get_u64()),
            },
            9 => Self::UndoApply {
                rel: RelFileId::new(buf.get_u32()),
                block: BlockNumber::new(buf.get_u32()),
                xid: Xid::new(buf.get_u64()),
                slot_rewind: UndoPtr::new(buf.get_u64()),
            },
            10 => Self::Discard {
                log_no: buf.get_u32(),
                new_oldest_data: buf.get_u64(),
                oldest_xid: Xid::new(buf.get_u64()),
            },
            other => {
                return Err(EngineError::corrupted(format!(
                    "unknown wal record discriminant {}",
                    other
                )))
            }
        };
        Ok(record)
    }
}

fn put_hints(buf: &mut BytesMut, hints: &UndoHints) {
    buf.put_u64(hints.undo_ptr.as_u64());
    buf.put_u64(hints.prev_undo.as_u64());
    buf.put_u16(hints.slot);
}

fn get_hints(buf: &mut &[u8]) -> UndoHints {
    UndoHints {
        undo_ptr: UndoPtr::new(buf.get_u64()),
        prev_undo: UndoPtr::new(buf.get_u64()),
        slot: buf.get_u16(),
    }
}

fn get_tid(buf: &mut &[u8]) -> Tid {
    let mut bytes = [0u8; 6];
    buf.copy_to_slice(&mut bytes);
    Tid::from_bytes(bytes)
}

fn put_bytes(buf: &mut BytesMut, bytes: &Bytes) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn get_bytes(buf: &mut &[u8]) -> EngineResult<Bytes> {
    if buf.remaining() < 4 {
        return Err(EngineError::corrupted("wal payload truncated"));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(EngineError::corrupted("wal payload truncated"));
    }
    let out = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(out)
}

fn put_opt_bytes(buf: &mut BytesMut, bytes: Option<&Bytes>) {
    match bytes {
        Some(bytes) => {
            buf.put_u8(1);
            put_bytes(buf, bytes);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_bytes(buf: &mut &[u8]) -> EngineResult<Option<Bytes>> {
    if buf.get_u8() == 0 {
        Ok(None)
    } else {
        get_bytes(buf).map(Some)
    }
}

fn put_opt_u32(buf: &mut BytesMut, value: Option<u32>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            buf.put_u32(value);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_u32(buf: &mut &[u8]) -> Option<u32> {
    if buf.get_u8() == 0 {
        None
    } else {
        Some(buf.get_u32())
    }
}

impl WalRecord {
    /// Replays a DML record against its page during recovery. The
    /// record's undo hints restamp the transaction slot; deletes and
    /// updates that carry their tuple (full-page writes off) are
    /// reconstructed purely from the record.
    pub fn apply_to_page(&self, page: &mut TablePage<'_>) -> EngineResult<()> {
        match self {
            Self::Insert {
                xid, tid, tuple, undo, ..
            } => {
                page.add_tuple(tuple, Some(tid.offset)).ok_or_else(|| {
                    EngineError::corrupted("insert replay found no room on page")
                })?;
                stamp_on_page_slot(page, undo, *xid);
            }
            Self::Delete { xid, tid, undo, .. } => {
                page.clear_tuple_body(tid.offset);
                page.set_line_pointer(tid.offset, LinePointer::deleted(SlotNo::new(undo.slot)));
                page.page_header().set_prune_xid(*xid);
                stamp_on_page_slot(page, undo, *xid);
            }
            Self::Update {
                xid,
                tid,
                new_tid,
                tuple,
                undo,
                in_place,
                ..
            } => {
                if *in_place {
                    if !page.replace_tuple(tid.offset, tuple) {
                        return Err(EngineError::corrupted(
                            "in-place update replay found no room on page",
                        ));
                    }
                } else {
                    // Origin-page side; the destination page replays the
                    // insert through its own full-page image.
                    let _ = new_tid;
                    page.clear_tuple_body(tid.offset);
                    page.set_line_pointer(
                        tid.offset,
                        LinePointer::deleted(SlotNo::new(undo.slot)),
                    );
                    page.page_header().set_prune_xid(*xid);
                }
                stamp_on_page_slot(page, undo, *xid);
            }
            Self::MultiInsert {
                xid,
                ranges,
                tuples,
                undo,
                ..
            } => {
                let mut next_tuple = tuples.iter();
                for (start, end) in ranges {
                    for off in start.as_u16()..=end.as_u16() {
                        let Some(tuple) = next_tuple.next() else {
                            break;
                        };
                        page.add_tuple(tuple, Some(OffsetNumber::new(off)))
                            .ok_or_else(|| {
                                EngineError::corrupted("multi-insert replay found no room")
                            })?;
                    }
                }
                stamp_on_page_slot(page, undo, *xid);
            }
            Self::Lock {
                xid,
                tid,
                mode,
                undo,
                ..
            } => {
                if let Some(mut header) = page.tuple_header(tid.offset) {
                    header.set_slot(SlotNo::new(undo.slot));
                    if let Some(mode) = LockMode::from_u8(*mode) {
                        header.set_lock_mode(mode);
                    }
                    page.set_tuple_header(tid.offset, header);
                }
                stamp_on_page_slot(page, undo, *xid);
            }
            Self::SpecConfirm { tid, .. } => {
                if let Some(mut header) = page.tuple_header(tid.offset) {
                    header.infomask -= InfoMask::SPECULATIVE;
                    page.set_tuple_header(tid.offset, header);
                }
            }
            Self::SpecAbort { tid, .. } => {
                page.retract_tuple(tid.offset);
            }
            Self::UndoMeta { .. } | Self::UndoApply { .. } | Self::Discard { .. } => {
                return Err(EngineError::corrupted(
                    "record kind is not page-applicable",
                ));
            }
        }
        Ok(())
    }
}

/// Restamps the slot named by the record's undo hints. Slots that
/// overflowed to a separate page are restored by that page's own
/// records, not here.
fn stamp_on_page_slot(page: &mut TablePage<'_>, hints: &UndoHints, xid: Xid) {
    if hints.slot as usize <= palim_common::constants::TRANS_SLOTS_PER_PAGE {
        page.stamp_trans_slot(SlotNo::new(hints.slot), xid, hints.undo_ptr);
    }
}

/// Where the engine sends its WAL records. Durable insertion must
/// complete before the emitting critical section releases its page.
pub trait WalSink: Send + Sync {
    /// Appends a record, returning its LSN.
    fn emit(&self, record: &WalRecord) -> EngineResult<u64>;
}

/// In-memory WAL used by tests and recovery checks: records are kept
/// decoded alongside their encoding.
#[derive(Default)]
pub struct MemWal {
    records: Mutex<Vec<WalRecord>>,
}

impl MemWal {
    /// Creates an empty in-memory WAL.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything emitted so far.
    pub fn records(&self) -> Vec<WalRecord> {
        self.records.lock().clone()
    }

    /// Returns the last undo-meta hint per log, the way crash recovery
    /// scans the real WAL.
    pub fn undo_meta_hints(&self) -> Vec<UndoMetaHint> {
        let mut hints: Vec<UndoMetaHint> = Vec::new();
        for record in self.records.lock().iter() {
            if let WalRecord::UndoMeta { log_no, insert, xid } = record {
                let hint = UndoMetaHint {
                    log_no: *log_no,
                    insert: *insert,
                    xid: *xid,
                };
                match hints.iter_mut().find(|h| h.log_no == *log_no) {
                    Some(existing) => *existing = hint,
                    None => hints.push(hint),
                }
            }
        }
        hints
    }
}

impl WalSink for MemWal {
    fn emit(&self, record: &WalRecord) -> EngineResult<u64> {
        // Encode/decode on the way in: catches codec drift at every
        // emission instead of only in dedicated tests.
        let encoded = record.encode();
        debug_assert_eq!(&WalRecord::decode(&encoded).expect("self-decode"), record);

        let mut records = self.records.lock();
        records.push(record.clone());
        Ok(records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hints() -> UndoHints {
        UndoHints {
            undo_ptr: UndoPtr::from_parts(1, 128),
            prev_undo: UndoPtr::from_parts(1, 64),
            slot: 2,
        }
    }

    fn tid(block: u32, offset: u16) -> Tid {
        Tid::new(BlockNumber::new(block), OffsetNumber::new(offset))
    }

    fn round_trip(record: WalRecord) {
        let encoded = record.encode();
        assert_eq!(WalRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn test_round_trips() {
        round_trip(WalRecord::Insert {
            rel: RelFileId::new(1000),
            xid: Xid::from_parts(0, 9),
            tid: tid(1, 1),
            tuple: Bytes::from_static(b"tuple"),
            undo: hints(),
            spec_token: None,
        });
        round_trip(WalRecord::Insert {
            rel: RelFileId::new(1000),
            xid: Xid::from_parts(0, 9),
            tid: tid(1, 1),
            tuple: Bytes::from_static(b"tuple"),
            undo: hints(),
            spec_token: Some(SpecToken::new(0xFEED)),
        });
        round_trip(WalRecord::Delete {
            rel: RelFileId::new(1000),
            xid: Xid::from_parts(0, 9),
            tid: tid(1, 5),
            tuple: Some(Bytes::from_static(b"the row")),
            undo: hints(),
        });
        round_trip(WalRecord::Update {
            rel: RelFileId::new(1000),
            xid: Xid::from_parts(0, 9),
            tid: tid(1, 5),
            new_tid: tid(2, 1),
            tuple: Bytes::from_static(b"new"),
            old_tuple: None,
            undo: hints(),
            in_place: false,
        });
        round_trip(WalRecord::MultiInsert {
            rel: RelFileId::new(1000),
            xid: Xid::from_parts(0, 9),
            block: BlockNumber::new(3),
            ranges: vec![(OffsetNumber::new(1), OffsetNumber::new(4))],
            tuples: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
            undo: hints(),
        });
        round_trip(WalRecord::Lock {
            rel: RelFileId::new(1000),
            xid: Xid::from_parts(0, 9),
            tid: tid(1, 3),
            mode: 4,
            undo: hints(),
        });
        round_trip(WalRecord::SpecConfirm {
            rel: RelFileId::new(1000),
            tid: tid(1, 1),
        });
        round_trip(WalRecord::SpecAbort {
            rel: RelFileId::new(1000),
            tid: tid(1, 1),
        });
        round_trip(WalRecord::UndoMeta {
            log_no: 3,
            insert: 8192,
            xid: Xid::from_parts(0, 9),
        });
        round_trip(WalRecord::UndoApply {
            rel: RelFileId::new(1000),
            block: BlockNumber::new(2),
            xid: Xid::from_parts(0, 9),
            slot_rewind: UndoPtr::INVALID,
        });
        round_trip(WalRecord::Discard {
            log_no: 1,
            new_oldest_data: 4096,
            oldest_xid: Xid::from_parts(0, 30),
        });
    }

    #[test]
    fn test_corruption_detected() {
        let record = WalRecord::SpecConfirm {
            rel: RelFileId::new(1),
            tid: tid(1, 1),
        };
        let mut encoded = record.encode().to_vec();
        encoded[6] ^= 0xFF;
        assert!(WalRecord::decode(&encoded).is_err());
    }

    #[test]
    fn test_mem_wal_hints_keep_latest_per_log() {
        let wal = MemWal::new();
        wal.emit(&WalRecord::UndoMeta {
            log_no: 0,
            insert: 64,
            xid: Xid::from_parts(0, 5),
        })
        .unwrap();
        wal.emit(&WalRecord::UndoMeta {
            log_no: 0,
            insert: 256,
            xid: Xid::from_parts(0, 6),
        })
        .unwrap();
        wal.emit(&WalRecord::UndoMeta {
            log_no: 1,
            insert: 64,
            xid: Xid::from_parts(0, 7),
        })
        .unwrap();

        let hints = wal.undo_meta_hints();
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0].insert, 256);
        assert_eq!(hints[1].log_no, 1);
    }
}
