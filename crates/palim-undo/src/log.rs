//! Undo logs and the process-wide log manager.
//!
//! A log is an append-only sequence of undo records spread over fixed-size
//! segment files. At most one writer is attached to a log at any time; the
//! manager enforces this through its attached-writer table and hands out
//! [`AttachedUndoLog`] handles that own the append side.
//!
//! The first record a transaction writes into a log is a
//! transaction-header record. Each such header links forward to the next
//! transaction's header, which is what lets the discard walk hop from
//! transaction to transaction without decoding everything in between. The
//! forward link is patched into the previous header when the next
//! transaction arrives.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BufMut;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use palim_common::{RelFileId, Tid, UndoPtr, Xid};

use crate::config::UndoStoreConfig;
use crate::discard::{DiscardDecision, DiscardState, Horizon, HorizonPolicy};
use crate::error::{UndoError, UndoResult};
use crate::meta::UndoLogMeta;
use crate::record::{
    UndoPayload, UndoRecord, UndoRecordType, NEXT_TXN_START_FIELD_OFFSET,
    UNDO_RECORD_HEADER_SIZE, UNDO_RECORD_TRAILER_SIZE,
};
use crate::segment::UndoSegment;

/// Size of the header block at the start of every log. Record offsets
/// begin past it, which keeps offset zero free as the "none" sentinel.
pub const UNDO_LOG_HEADER_SIZE: u64 = 64;

/// Magic number in the log header block.
const LOG_HEADER_MAGIC: u32 = 0x504C_4C47;

/// Mutable state of one log, guarded by the append lock.
#[derive(Debug)]
struct LogInner {
    /// Offset of the next append.
    insert: u64,
    /// Offset of the newest transaction-header record, or zero.
    last_xact_start: u64,
}

/// One undo log: a directory of segment files plus its meta file.
pub struct UndoLog {
    log_no: u32,
    config: UndoStoreConfig,
    segments: RwLock<BTreeMap<u64, Arc<UndoSegment>>>,
    inner: Mutex<LogInner>,
    discard: DiscardState,
}

impl UndoLog {
    /// Creates a new empty log on disk.
    pub fn create(log_no: u32, config: &UndoStoreConfig) -> UndoResult<Arc<Self>> {
        let segment = UndoSegment::create(0, config.segment_path(log_no, 0), config.segment_size)?;

        // Log header block: magic, version, log number, crc.
        let mut header = Vec::with_capacity(16);
        header.put_u32(LOG_HEADER_MAGIC);
        header.put_u32(1);
        header.put_u32(log_no);
        let crc = crc32fast::hash(&header);
        header.put_u32(crc);
        header.resize(UNDO_LOG_HEADER_SIZE as usize, 0);
        segment.write_at(0, &header)?;
        segment.sync()?;

        let meta = UndoLogMeta::fresh(UNDO_LOG_HEADER_SIZE);
        meta.save(config.meta_path(log_no))?;

        let mut segments = BTreeMap::new();
        segments.insert(0, Arc::new(segment));

        debug!(log_no, "created undo log");

        Ok(Arc::new(Self {
            log_no,
            config: config.clone(),
            segments: RwLock::new(segments),
            inner: Mutex::new(LogInner {
                insert: meta.insert,
                last_xact_start: meta.last_xact_start,
            }),
            discard: DiscardState::new(meta.discard, meta.oldest_xid),
        }))
    }

    /// Opens an existing log from its durable meta, optionally overriding
    /// the insertion point with the value recovered from the WAL.
    pub fn open(
        log_no: u32,
        config: &UndoStoreConfig,
        meta: UndoLogMeta,
        wal_insert: Option<u64>,
    ) -> UndoResult<Arc<Self>> {
        let insert = match wal_insert {
            Some(from_wal) if from_wal != meta.insert => {
                info!(
                    log_no,
                    meta_insert = meta.insert,
                    wal_insert = from_wal,
                    "undo log insertion point reconstructed from WAL"
                );
                from_wal
            }
            _ => meta.insert,
        };

        Ok(Arc::new(Self {
            log_no,
            config: config.clone(),
            segments: RwLock::new(BTreeMap::new()),
            inner: Mutex::new(LogInner {
                insert,
                last_xact_start: meta.last_xact_start,
            }),
            discard: DiscardState::new(meta.discard, meta.oldest_xid),
        }))
    }

    /// Returns the log number.
    pub fn log_no(&self) -> u32 {
        self.log_no
    }

    /// Returns the current insertion offset.
    pub fn insert_point(&self) -> u64 {
        self.inner.lock().insert
    }

    /// Returns this log's discard state.
    pub fn discard_state(&self) -> &DiscardState {
        &self.discard
    }

    /// Returns the segment for `segno`, opening or creating its file.
    fn segment(&self, segno: u64, create: bool) -> UndoResult<Arc<UndoSegment>> {
        if let Some(segment) = self.segments.read().get(&segno) {
            return Ok(Arc::clone(segment));
        }

        let mut segments = self.segments.write();
        // Raced with another opener.
        if let Some(segment) = segments.get(&segno) {
            return Ok(Arc::clone(segment));
        }

        let path = self.config.segment_path(self.log_no, segno);
        let segment = if path.exists() {
            UndoSegment::open(segno, &path, self.config.segment_size)?
        } else if create {
            UndoSegment::create(segno, &path, self.config.segment_size)?
        } else {
            return Err(UndoError::corrupted(format!(
                "undo segment {} of log {} is missing",
                segno, self.log_no
            )));
        };

        let segment = Arc::new(segment);
        segments.insert(segno, Arc::clone(&segment));
        Ok(segment)
    }

    /// Writes bytes at an absolute log offset, splitting across segment
    /// boundaries and creating segment files as needed.
    fn write_bytes_at(&self, mut offset: u64, mut bytes: &[u8]) -> UndoResult<()> {
        let seg_size = self.config.segment_size as u64;
        while !bytes.is_empty() {
            let segno = offset / seg_size;
            let in_seg = (offset % seg_size) as usize;
            let room = self.config.segment_size - in_seg;
            let chunk = room.min(bytes.len());

            let segment = self.segment(segno, true)?;
            segment.write_at(in_seg, &bytes[..chunk])?;
            if self.config.sync_on_append {
                segment.sync()?;
            }

            offset += chunk as u64;
            bytes = &bytes[chunk..];
        }
        Ok(())
    }

    /// Reads bytes from an absolute log offset, splitting across segment
    /// boundaries.
    fn read_bytes_at(&self, mut offset: u64, mut buf: &mut [u8]) -> UndoResult<()> {
        let seg_size = self.config.segment_size as u64;
        while !buf.is_empty() {
            let segno = offset / seg_size;
            let in_seg = (offset % seg_size) as usize;
            let room = self.config.segment_size - in_seg;
            let chunk = room.min(buf.len());

            let segment = self.segment(segno, false)?;
            segment.read_at(in_seg, &mut buf[..chunk])?;

            offset += chunk as u64;
            buf = &mut buf[chunk..];
        }
        Ok(())
    }

    /// Appends encoded record bytes, returning their starting offset.
    fn append_bytes(&self, bytes: &[u8]) -> UndoResult<u64> {
        let mut inner = self.inner.lock();
        let offset = inner.insert;
        self.write_bytes_at(offset, bytes)?;
        inner.insert = offset + bytes.len() as u64;
        Ok(offset)
    }

    /// Reads and decodes the record starting at `offset`, under the
    /// shared discard lock.
    pub fn read_record(&self, offset: u64) -> UndoResult<UndoRecord> {
        let guard = self.discard.pin();
        if !guard.is_reachable(offset) {
            return Err(UndoError::Discarded {
                ptr: UndoPtr::from_parts(self.log_no, offset),
                horizon: UndoPtr::from_parts(self.log_no, guard.horizon().oldest_data),
            });
        }
        if offset >= self.insert_point() {
            return Err(UndoError::PastInsertPoint {
                ptr: UndoPtr::from_parts(self.log_no, offset),
            });
        }
        self.read_record_unguarded(offset)
    }

    /// Reads a record without horizon checks. For the append side and
    /// recovery, which know the record cannot be discarded under them.
    fn read_record_unguarded(&self, offset: u64) -> UndoResult<UndoRecord> {
        let mut len_buf = [0u8; 2];
        self.read_bytes_at(offset, &mut len_buf)?;
        let total = u16::from_be_bytes(len_buf) as usize;
        if total < UNDO_RECORD_HEADER_SIZE + UNDO_RECORD_TRAILER_SIZE {
            return Err(UndoError::corrupted(format!(
                "undo record at {}/{:#x} has impossible length {}",
                self.log_no, offset, total
            )));
        }

        let mut buf = vec![0u8; total];
        self.read_bytes_at(offset, &mut buf)?;
        UndoRecord::decode(&buf, UndoPtr::from_parts(self.log_no, offset))
    }

    /// Reads the record that ends exactly at `end_offset`, using the
    /// trailer length. Used by scans that walk a log tail backwards.
    pub fn read_record_before(&self, end_offset: u64) -> UndoResult<(u64, UndoRecord)> {
        if end_offset < UNDO_LOG_HEADER_SIZE + 2 {
            return Err(UndoError::corrupted("no record ends at log start"));
        }
        let mut len_buf = [0u8; 2];
        self.read_bytes_at(end_offset - 2, &mut len_buf)?;
        let total = u16::from_be_bytes(len_buf) as u64;
        if total == 0 || end_offset < UNDO_LOG_HEADER_SIZE + total {
            return Err(UndoError::corrupted(
                "undo record trailer points before log start",
            ));
        }
        let start = end_offset - total;
        let record = self.read_record_unguarded(start)?;
        Ok((start, record))
    }

    /// Rewrites the forward link of the transaction-header record at
    /// `header_offset`. Only the appender calls this, for the previous
    /// transaction's header, which cannot be discarded while the current
    /// transaction still needs the log.
    fn patch_next_txn_start(&self, header_offset: u64, next_txn_start: u64) -> UndoResult<()> {
        let record = self.read_record_unguarded(header_offset)?;
        if record.record_type() != UndoRecordType::XactHeader {
            return Err(UndoError::corrupted(format!(
                "expected transaction header at {}/{:#x}, found {:?}",
                self.log_no,
                header_offset,
                record.record_type()
            )));
        }

        let total = record.encoded_size();
        let mut bytes = vec![0u8; total];
        self.read_bytes_at(header_offset, &mut bytes)?;
        bytes[NEXT_TXN_START_FIELD_OFFSET..NEXT_TXN_START_FIELD_OFFSET + 8]
            .copy_from_slice(&next_txn_start.to_be_bytes());

        // The crc covers everything before the trailer; refresh it.
        let body_len = total - UNDO_RECORD_TRAILER_SIZE;
        let crc = crc32fast::hash(&bytes[..body_len]);
        bytes[body_len..body_len + 4].copy_from_slice(&crc.to_be_bytes());

        self.write_bytes_at(header_offset, &bytes)
    }

    /// Rewinds the insertion point. Used on subtransaction abort, after
    /// the rewound records have been applied.
    pub fn rewind(&self, to_offset: u64) {
        let mut inner = self.inner.lock();
        debug_assert!(to_offset <= inner.insert, "rewind must move backwards");
        inner.insert = to_offset;
    }

    /// Walks transaction headers from the current horizon and returns the
    /// new horizon the policy permits, or `None` when nothing can move.
    pub fn compute_discard(&self, policy: &dyn HorizonPolicy) -> UndoResult<Option<Horizon>> {
        let start = self.discard.snapshot();
        let insert = self.insert_point();

        let mut offset = start.oldest_data;
        let mut advanced = false;

        loop {
            if offset >= insert {
                // Everything in the log is discardable.
                return Ok(advanced.then_some(Horizon {
                    oldest_data: insert,
                    oldest_xid: Xid::INVALID,
                }));
            }

            let record = self.read_record_unguarded(offset)?;
            if record.record_type() != UndoRecordType::XactHeader {
                return Err(UndoError::corrupted(format!(
                    "discard walk expected transaction header at {}/{:#x}",
                    self.log_no, offset
                )));
            }

            match policy.decide(record.xid) {
                DiscardDecision::Stop => {
                    return Ok(advanced.then_some(Horizon {
                        oldest_data: offset,
                        oldest_xid: record.xid,
                    }));
                }
                DiscardDecision::Discard => {
                    let next = match &record.payload {
                        UndoPayload::XactHeader { next_txn_start } => *next_txn_start,
                        _ => unreachable!("checked record type above"),
                    };
                    advanced = true;
                    if next == 0 {
                        // Last transaction in the log; its undo ends at
                        // the insertion point.
                        return Ok(Some(Horizon {
                            oldest_data: insert,
                            oldest_xid: Xid::INVALID,
                        }));
                    }
                    offset = next;
                }
            }
        }
    }

    /// Advances the horizon under the exclusive discard lock and drops
    /// segment files that fell entirely below it.
    pub fn apply_discard(&self, horizon: Horizon) -> UndoResult<()> {
        self.discard.advance(horizon.oldest_data, horizon.oldest_xid);

        let first_live_segno = horizon.oldest_data / self.config.segment_size as u64;
        let mut segments = self.segments.write();
        let dead: Vec<u64> = segments.range(..first_live_segno).map(|(&n, _)| n).collect();
        for segno in dead {
            if let Some(segment) = segments.remove(&segno) {
                if let Err(err) = std::fs::remove_file(segment.path()) {
                    warn!(
                        log_no = self.log_no,
                        segno, %err, "could not remove discarded undo segment"
                    );
                }
            }
        }
        drop(segments);

        self.save_meta(Xid::INVALID)?;
        debug!(
            log_no = self.log_no,
            oldest_data = horizon.oldest_data,
            "advanced undo discard horizon"
        );
        Ok(())
    }

    /// Flushes the log's meta file.
    fn save_meta(&self, attached_writer: Xid) -> UndoResult<()> {
        let (insert, last_xact_start) = {
            let inner = self.inner.lock();
            (inner.insert, inner.last_xact_start)
        };
        let horizon = self.discard.snapshot();
        let meta = UndoLogMeta {
            insert,
            discard: horizon.oldest_data,
            last_xact_start,
            oldest_xid: horizon.oldest_xid,
            attached_writer,
        };
        meta.save(self.config.meta_path(self.log_no))
    }
}

impl std::fmt::Debug for UndoLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoLog")
            .field("log_no", &self.log_no)
            .field("insert", &self.insert_point())
            .field("horizon", &self.discard.snapshot())
            .finish()
    }
}

/// Insertion-point hint carried in a WAL undo-meta record, emitted on
/// writer change and on the first append after a checkpoint; recovery
/// feeds these back to [`UndoLogManager::recover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoMetaHint {
    /// The log this hint describes.
    pub log_no: u32,
    /// Its insertion point at emission time.
    pub insert: u64,
    /// The writer attached at emission time.
    pub xid: Xid,
}

/// Process-wide undo store: all logs plus the attached-writer table.
pub struct UndoLogManager {
    config: UndoStoreConfig,
    logs: DashMap<u32, Arc<UndoLog>>,
    /// At-most-one-writer enforcement: log number -> attached xid.
    attached: DashMap<u32, Xid>,
    /// Detached logs available for the next writer.
    free: Mutex<Vec<u32>>,
    next_log_no: AtomicU32,
    /// Bumped at checkpoints; attached handles re-emit their undo-meta
    /// WAL record when their seen epoch falls behind.
    meta_epoch: AtomicU64,
}

impl UndoLogManager {
    /// Creates an empty store rooted at the configured directory.
    pub fn new(config: UndoStoreConfig) -> UndoResult<Self> {
        std::fs::create_dir_all(&config.dir)?;
        Ok(Self {
            config,
            logs: DashMap::new(),
            attached: DashMap::new(),
            free: Mutex::new(Vec::new()),
            next_log_no: AtomicU32::new(0),
            meta_epoch: AtomicU64::new(1),
        })
    }

    /// Opens a store from disk after a crash or restart. `hints` are the
    /// last undo-meta records recovered from the WAL, one per log at
    /// most; they override the meta files' insertion points.
    pub fn recover(config: UndoStoreConfig, hints: &[UndoMetaHint]) -> UndoResult<Self> {
        std::fs::create_dir_all(&config.dir)?;

        let manager = Self::new(config.clone())?;
        let mut max_log_no = None;

        for entry in std::fs::read_dir(&config.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(log_no) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };

            let meta = UndoLogMeta::load(config.meta_path(log_no))?;
            let wal_insert = hints
                .iter()
                .find(|h| h.log_no == log_no)
                .map(|h| h.insert);
            let log = UndoLog::open(log_no, &config, meta, wal_insert)?;

            info!(
                log_no,
                insert = log.insert_point(),
                "recovered undo log"
            );
            manager.logs.insert(log_no, log);
            manager.free.lock().push(log_no);
            max_log_no = Some(max_log_no.map_or(log_no, |m: u32| m.max(log_no)));
        }

        if let Some(max) = max_log_no {
            manager.next_log_no.store(max + 1, Ordering::Release);
        }
        Ok(manager)
    }

    /// Attaches `xid` to a free log, creating one if all are busy.
    /// While attached the transaction is the log's only writer.
    pub fn attach(&self, xid: Xid) -> UndoResult<AttachedUndoLog> {
        let log = match self.free.lock().pop() {
            Some(log_no) => Arc::clone(
                self.logs
                    .get(&log_no)
                    .expect("free list entry must exist")
                    .value(),
            ),
            None => {
                let log_no = self.next_log_no.fetch_add(1, Ordering::AcqRel);
                let log = UndoLog::create(log_no, &self.config)?;
                self.logs.insert(log_no, Arc::clone(&log));
                log
            }
        };

        match self.attached.entry(log.log_no()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                return Err(UndoError::AlreadyAttached {
                    log_no: log.log_no(),
                    holder: *entry.get(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(xid);
            }
        }

        Ok(AttachedUndoLog {
            log,
            xid,
            latest: UndoPtr::INVALID,
            txn_start: UndoPtr::INVALID,
            wrote_header: false,
            seen_meta_epoch: 0,
        })
    }

    /// Detaches a writer from its log, making the log durable and
    /// available again.
    pub fn detach(&self, handle: AttachedUndoLog) -> UndoResult<()> {
        let log_no = handle.log.log_no();
        handle.log.save_meta(Xid::INVALID)?;
        self.attached.remove(&log_no);
        self.free.lock().push(log_no);
        Ok(())
    }

    /// Reads the record at `ptr`, holding the log's shared discard lock
    /// across the horizon check and the fetch.
    pub fn read_record(&self, ptr: UndoPtr) -> UndoResult<UndoRecord> {
        let log = self.log(ptr.log_no())?;
        log.read_record(ptr.offset())
    }

    /// Returns the log with the given number.
    pub fn log(&self, log_no: u32) -> UndoResult<Arc<UndoLog>> {
        self.logs
            .get(&log_no)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(UndoError::UnknownLog { log_no })
    }

    /// Returns all logs, for horizon maintenance and dead-xid scans.
    pub fn all_logs(&self) -> Vec<Arc<UndoLog>> {
        self.logs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// The oldest xid that still has undo in any log, or invalid when no
    /// log retains any.
    pub fn oldest_xid_with_undo(&self) -> Xid {
        self.logs
            .iter()
            .map(|entry| entry.value().discard_state().snapshot().oldest_xid)
            .filter(|xid| xid.is_valid())
            .min()
            .unwrap_or(Xid::INVALID)
    }

    /// Marks a checkpoint: every attached writer re-emits its undo-meta
    /// WAL record on its next append.
    pub fn note_checkpoint(&self) {
        self.meta_epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn current_meta_epoch(&self) -> u64 {
        self.meta_epoch.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for UndoLogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoLogManager")
            .field("logs", &self.logs.len())
            .field("attached", &self.attached.len())
            .finish()
    }
}

/// The append side of one log, owned by the attached transaction.
#[derive(Debug)]
pub struct AttachedUndoLog {
    log: Arc<UndoLog>,
    xid: Xid,
    /// The transaction's newest undo pointer.
    latest: UndoPtr,
    /// Where the transaction's undo begins (its header record).
    txn_start: UndoPtr,
    wrote_header: bool,
    seen_meta_epoch: u64,
}

impl AttachedUndoLog {
    /// Returns the attached log's number.
    pub fn log_no(&self) -> u32 {
        self.log.log_no()
    }

    /// Returns the attached transaction.
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// The transaction's newest undo pointer, or invalid before its
    /// first record.
    pub fn latest(&self) -> UndoPtr {
        self.latest
    }

    /// Where the transaction's undo begins, or invalid before its first
    /// record.
    pub fn txn_start(&self) -> UndoPtr {
        self.txn_start
    }

    /// Appends a record for the attached transaction and returns its
    /// pointer. The first append also writes the transaction-header
    /// record and links the previous transaction's header forward.
    pub fn append(&mut self, record: &UndoRecord) -> UndoResult<UndoPtr> {
        debug_assert_eq!(record.xid, self.xid, "record xid must match writer");

        if !self.wrote_header {
            self.write_xact_header()?;
        }

        let offset = self.log.append_bytes(&record.encode())?;
        self.latest = UndoPtr::from_parts(self.log.log_no(), offset);
        Ok(self.latest)
    }

    fn write_xact_header(&mut self) -> UndoResult<()> {
        let header = UndoRecord::new(
            RelFileId::INVALID,
            Tid::INVALID,
            self.xid,
            UndoPtr::INVALID,
            UndoPtr::INVALID,
            UndoPayload::XactHeader { next_txn_start: 0 },
        );
        let offset = self.log.append_bytes(&header.encode())?;

        let prev_header = {
            let mut inner = self.log.inner.lock();
            let prev = inner.last_xact_start;
            inner.last_xact_start = offset;
            prev
        };
        if prev_header != 0 {
            self.log.patch_next_txn_start(prev_header, offset)?;
        }

        self.txn_start = UndoPtr::from_parts(self.log.log_no(), offset);
        self.wrote_header = true;
        Ok(())
    }

    /// Returns the undo-meta WAL hint if one is due (first append after
    /// attach or after a checkpoint). The caller includes it in the next
    /// WAL record it emits.
    pub fn take_meta_hint(&mut self, manager: &UndoLogManager) -> Option<UndoMetaHint> {
        let current = manager.current_meta_epoch();
        if self.seen_meta_epoch == current {
            return None;
        }
        self.seen_meta_epoch = current;
        Some(UndoMetaHint {
            log_no: self.log.log_no(),
            insert: self.log.insert_point(),
            xid: self.xid,
        })
    }

    /// Rewinds the transaction's undo to `(ptr, latest)` as captured at
    /// subtransaction start. Only subtransaction aborts rewind; toplevel
    /// aborts keep their undo because slot-reuse records in it may still
    /// be referenced.
    pub fn rewind_to(&mut self, insert: UndoPtr, latest: UndoPtr) {
        debug_assert_eq!(insert.log_no(), self.log.log_no());
        self.log.rewind(insert.offset());
        self.latest = latest;
    }

    /// The size in bytes of the undo this transaction has written.
    pub fn undo_size(&self) -> u64 {
        if !self.txn_start.is_valid() {
            return 0;
        }
        self.log.insert_point() - self.txn_start.offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use palim_common::{BlockNumber, OffsetNumber};
    use tempfile::TempDir;

    fn test_config(dir: &std::path::Path) -> UndoStoreConfig {
        UndoStoreConfig::new(dir)
            .with_segment_size(16 * 1024)
            .with_sync_on_append(false)
    }

    fn insert_record(xid: Xid, prev: UndoPtr, blkprev: UndoPtr) -> UndoRecord {
        UndoRecord::new(
            RelFileId::new(1000),
            Tid::new(BlockNumber::new(1), OffsetNumber::new(1)),
            xid,
            prev,
            blkprev,
            UndoPayload::Insert { spec_token: None },
        )
    }

    #[test]
    fn test_attach_append_read() {
        let tmp = TempDir::new().unwrap();
        let manager = UndoLogManager::new(test_config(tmp.path())).unwrap();

        let xid = Xid::from_parts(0, 10);
        let mut attached = manager.attach(xid).unwrap();

        let ptr = attached
            .append(&insert_record(xid, UndoPtr::INVALID, UndoPtr::INVALID))
            .unwrap();
        assert!(ptr.is_valid());
        assert_eq!(attached.latest(), ptr);

        let record = manager.read_record(ptr).unwrap();
        assert_eq!(record.xid, xid);
        assert_eq!(record.record_type(), UndoRecordType::Insert);

        // The transaction's header record precedes its first real record.
        let header = manager.read_record(attached.txn_start()).unwrap();
        assert_eq!(header.record_type(), UndoRecordType::XactHeader);

        manager.detach(attached).unwrap();
    }

    #[test]
    fn test_single_writer_per_log() {
        let tmp = TempDir::new().unwrap();
        let manager = UndoLogManager::new(test_config(tmp.path())).unwrap();

        let a = manager.attach(Xid::from_parts(0, 10)).unwrap();
        let b = manager.attach(Xid::from_parts(0, 11)).unwrap();
        // Concurrent writers land on different logs.
        assert_ne!(a.log_no(), b.log_no());

        // Detach frees the log for the next writer.
        let a_log = a.log_no();
        manager.detach(a).unwrap();
        let c = manager.attach(Xid::from_parts(0, 12)).unwrap();
        assert_eq!(c.log_no(), a_log);

        manager.detach(b).unwrap();
        manager.detach(c).unwrap();
    }

    #[test]
    fn test_xact_header_chain() {
        let tmp = TempDir::new().unwrap();
        let manager = UndoLogManager::new(test_config(tmp.path())).unwrap();

        let xid1 = Xid::from_parts(0, 10);
        let mut t1 = manager.attach(xid1).unwrap();
        t1.append(&insert_record(xid1, UndoPtr::INVALID, UndoPtr::INVALID))
            .unwrap();
        let t1_start = t1.txn_start();
        manager.detach(t1).unwrap();

        let xid2 = Xid::from_parts(0, 11);
        let mut t2 = manager.attach(xid2).unwrap();
        t2.append(&insert_record(xid2, UndoPtr::INVALID, UndoPtr::INVALID))
            .unwrap();
        let t2_start = t2.txn_start();
        manager.detach(t2).unwrap();

        // t1's header now links forward to t2's.
        let header = manager.read_record(t1_start).unwrap();
        match header.payload {
            UndoPayload::XactHeader { next_txn_start } => {
                assert_eq!(next_txn_start, t2_start.offset());
            }
            other => panic!("expected transaction header, got {:?}", other),
        }
    }

    #[test]
    fn test_records_span_segments() {
        let tmp = TempDir::new().unwrap();
        let config = UndoStoreConfig::new(tmp.path())
            .with_segment_size(512)
            .with_sync_on_append(false);
        let manager = UndoLogManager::new(config).unwrap();

        let xid = Xid::from_parts(0, 7);
        let mut attached = manager.attach(xid).unwrap();

        // Large delete records force writes across segment boundaries.
        let mut ptrs = Vec::new();
        let mut prev = UndoPtr::INVALID;
        for _ in 0..10 {
            let record = UndoRecord::new(
                RelFileId::new(1),
                Tid::new(BlockNumber::new(1), OffsetNumber::new(1)),
                xid,
                prev,
                UndoPtr::INVALID,
                UndoPayload::Delete {
                    tuple: Bytes::from(vec![0xAB; 200]),
                    subxact: None,
                },
            );
            prev = attached.append(&record).unwrap();
            ptrs.push(prev);
        }

        for ptr in ptrs {
            let record = manager.read_record(ptr).unwrap();
            assert_eq!(record.record_type(), UndoRecordType::Delete);
        }
    }

    #[test]
    fn test_recover_insert_point() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        let (log_no, insert_after) = {
            let manager = UndoLogManager::new(config.clone()).unwrap();
            let xid = Xid::from_parts(0, 20);
            let mut attached = manager.attach(xid).unwrap();
            attached
                .append(&insert_record(xid, UndoPtr::INVALID, UndoPtr::INVALID))
                .unwrap();
            let log_no = attached.log_no();
            let insert = attached.log.insert_point();
            manager.detach(attached).unwrap();
            (log_no, insert)
        };

        // Plain reopen trusts the meta file.
        let manager = UndoLogManager::recover(config.clone(), &[]).unwrap();
        assert_eq!(manager.log(log_no).unwrap().insert_point(), insert_after);

        // A WAL hint overrides it.
        let hint = UndoMetaHint {
            log_no,
            insert: insert_after - 10,
            xid: Xid::from_parts(0, 20),
        };
        let manager = UndoLogManager::recover(config, &[hint]).unwrap();
        assert_eq!(
            manager.log(log_no).unwrap().insert_point(),
            insert_after - 10
        );
    }

    #[test]
    fn test_discard_walk_and_read_below_horizon() {
        let tmp = TempDir::new().unwrap();
        let manager = UndoLogManager::new(test_config(tmp.path())).unwrap();

        // Two committed transactions, then one that must be retained.
        let mut ptrs = Vec::new();
        for n in [10u32, 11, 12] {
            let xid = Xid::from_parts(0, n);
            let mut attached = manager.attach(xid).unwrap();
            ptrs.push(
                attached
                    .append(&insert_record(xid, UndoPtr::INVALID, UndoPtr::INVALID))
                    .unwrap(),
            );
            manager.detach(attached).unwrap();
        }

        let log = manager.log(ptrs[0].log_no()).unwrap();
        let keep_from = Xid::from_parts(0, 12);
        let horizon = log
            .compute_discard(&move |xid: Xid| {
                if xid.precedes(keep_from) {
                    DiscardDecision::Discard
                } else {
                    DiscardDecision::Stop
                }
            })
            .unwrap()
            .expect("two transactions are discardable");
        assert_eq!(horizon.oldest_xid, keep_from);
        log.apply_discard(horizon).unwrap();

        // Records of the discarded transactions are now unreachable.
        let err = manager.read_record(ptrs[0]).unwrap_err();
        assert!(err.is_discarded());
        // The retained transaction still reads fine.
        assert!(manager.read_record(ptrs[2]).is_ok());
    }

    #[test]
    fn test_rewind_for_subxact() {
        let tmp = TempDir::new().unwrap();
        let manager = UndoLogManager::new(test_config(tmp.path())).unwrap();

        let xid = Xid::from_parts(0, 30);
        let mut attached = manager.attach(xid).unwrap();
        let p1 = attached
            .append(&insert_record(xid, UndoPtr::INVALID, UndoPtr::INVALID))
            .unwrap();

        // Subtransaction starts here.
        let save_insert = UndoPtr::from_parts(attached.log_no(), attached.log.insert_point());
        let save_latest = attached.latest();

        let p2 = attached.append(&insert_record(xid, p1, p1)).unwrap();
        assert!(p2.offset() > p1.offset());

        attached.rewind_to(save_insert, save_latest);
        assert_eq!(attached.latest(), p1);

        // The next record reuses the rewound space.
        let p3 = attached.append(&insert_record(xid, p1, p1)).unwrap();
        assert_eq!(p3.offset(), p2.offset());

        manager.detach(attached).unwrap();
    }

    #[test]
    fn test_undo_size() {
        let tmp = TempDir::new().unwrap();
        let manager = UndoLogManager::new(test_config(tmp.path())).unwrap();

        let xid = Xid::from_parts(0, 40);
        let mut attached = manager.attach(xid).unwrap();
        assert_eq!(attached.undo_size(), 0);

        attached
            .append(&insert_record(xid, UndoPtr::INVALID, UndoPtr::INVALID))
            .unwrap();
        assert!(attached.undo_size() > 0);
        manager.detach(attached).unwrap();
    }

    #[test]
    fn test_meta_hint_epochs() {
        let tmp = TempDir::new().unwrap();
        let manager = UndoLogManager::new(test_config(tmp.path())).unwrap();

        let xid = Xid::from_parts(0, 50);
        let mut attached = manager.attach(xid).unwrap();

        // Due right after attach, then quiescent.
        assert!(attached.take_meta_hint(&manager).is_some());
        assert!(attached.take_meta_hint(&manager).is_none());

        // A checkpoint makes it due again.
        manager.note_checkpoint();
        let hint = attached.take_meta_hint(&manager).unwrap();
        assert_eq!(hint.log_no, attached.log_no());
        assert_eq!(hint.xid, xid);

        manager.detach(attached).unwrap();
    }
}
