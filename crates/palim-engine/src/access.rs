//! Table-access surface.
//!
//! The executor and utility commands talk to the engine through
//! [`TableAccess`]; callers never learn whether an in-place engine or an
//! append-only heap sits behind it. Sequential and sample scans iterate
//! data blocks only; the metapage and overflow slot pages are skipped.
//! Index fetches resolve a single version per tid: there are no
//! multi-tuple tid chains here, so `call_again` is always false.

use palim_common::constants::{PAGE_SIZE, TUPLE_HEADER_SIZE};
use palim_common::{BlockNumber, EngineResult, OffsetNumber, RelFileId, Tid, Xid};
use palim_mvcc::visibility::fetch_insert_xid;
use palim_mvcc::{Snapshot, SlotReader, TxnStatus};
use palim_storage::page::{LinePointerState, TablePageRef};

use crate::engine::{EngineSlots, PalimEngine};

/// Position of an in-progress sequential or sample scan.
#[derive(Debug, Clone)]
pub struct ScanState {
    /// The scanned relation.
    pub rel_id: RelFileId,
    /// Next block to visit.
    next_block: BlockNumber,
    /// Next offset within the current block.
    next_offset: OffsetNumber,
}

impl ScanState {
    fn new(rel_id: RelFileId) -> Self {
        Self {
            rel_id,
            next_block: BlockNumber::FIRST_DATA,
            next_offset: OffsetNumber::FIRST,
        }
    }
}

/// Row counts produced by an analyze pass over one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalyzeCounts {
    /// Rows visible to the analyze snapshot.
    pub live: u64,
    /// Rows dead to everyone.
    pub dead: u64,
}

/// Size estimate for the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEstimate {
    /// Blocks in the main fork, metapage included.
    pub blocks: u64,
    /// Estimated live row count.
    pub tuples: u64,
}

/// The capability set exposed to the executor.
pub trait TableAccess {
    /// Starts a sequential scan.
    fn scan_begin(&self, rel_id: RelFileId) -> EngineResult<ScanState>;

    /// Returns the next visible row, or `None` at the end.
    fn scan_next(
        &self,
        scan: &mut ScanState,
        snapshot: &Snapshot,
    ) -> EngineResult<Option<(Tid, Vec<u8>)>>;

    /// Restarts a scan from the beginning.
    fn scan_rescan(&self, scan: &mut ScanState);

    /// All visible rows of one block, for bitmap scans.
    fn bitmap_block(
        &self,
        rel_id: RelFileId,
        block: BlockNumber,
        snapshot: &Snapshot,
    ) -> EngineResult<Vec<(Tid, Vec<u8>)>>;

    /// Fetches the version of a row an index points at. Single version
    /// per tid; callers must assert `call_again == false`.
    fn index_fetch(
        &self,
        rel_id: RelFileId,
        tid: Tid,
        snapshot: &Snapshot,
    ) -> EngineResult<Option<Vec<u8>>>;

    /// Fetches a specific row version.
    fn fetch_row_version(
        &self,
        rel_id: RelFileId,
        tid: Tid,
        snapshot: &Snapshot,
    ) -> EngineResult<Option<Vec<u8>>>;

    /// Returns true if the tid names an existing line pointer on a data
    /// page.
    fn tid_valid(&self, rel_id: RelFileId, tid: Tid) -> EngineResult<bool>;

    /// Returns true if the row at `tid` has a version visible to the
    /// snapshot.
    fn satisfies_snapshot(
        &self,
        rel_id: RelFileId,
        tid: Tid,
        snapshot: &Snapshot,
    ) -> EngineResult<bool>;

    /// Advances a sample scan to its next data block. Per-tuple
    /// iteration over the returned block goes through
    /// [`TableAccess::bitmap_block`].
    fn sample_next_block(&self, scan: &mut ScanState) -> EngineResult<Option<BlockNumber>>;

    /// Reports the xid that created the row, for analyze and conflict
    /// reporting.
    fn insert_xid(&self, rel_id: RelFileId, tid: Tid) -> EngineResult<Option<Xid>>;

    /// Live/dead counters over one block.
    fn analyze_block(
        &self,
        rel_id: RelFileId,
        block: BlockNumber,
        snapshot: &Snapshot,
    ) -> EngineResult<AnalyzeCounts>;

    /// Empties the relation without transactional safety (DDL-level
    /// truncate).
    fn truncate(&self, rel_id: RelFileId) -> EngineResult<()>;

    /// Points the relation at a fresh, empty file.
    fn set_new_filenode(&self, rel_id: RelFileId) -> EngineResult<()>;

    /// Copies the relation's data into another relation, live rows and
    /// all page state included.
    fn copy_data(&self, rel_id: RelFileId, target: RelFileId) -> EngineResult<()>;

    /// Rewrites the relation into `target`, keeping only rows visible
    /// to `snapshot`, stamped all-visible. The cluster path.
    fn rewrite(
        &self,
        rel_id: RelFileId,
        target: RelFileId,
        snapshot: &Snapshot,
    ) -> EngineResult<u64>;

    /// Size of the main fork in bytes.
    fn relation_size(&self, rel_id: RelFileId) -> EngineResult<u64>;

    /// Whether rows of the given width want out-of-line storage.
    fn needs_toast_table(&self, row_width: usize) -> bool;

    /// Planner estimate of blocks and live rows.
    fn estimate_size(&self, rel_id: RelFileId) -> EngineResult<SizeEstimate>;
}

impl TableAccess for PalimEngine {
    fn scan_begin(&self, rel_id: RelFileId) -> EngineResult<ScanState> {
        self.relations().get(rel_id)?;
        Ok(ScanState::new(rel_id))
    }

    fn scan_next(
        &self,
        scan: &mut ScanState,
        snapshot: &Snapshot,
    ) -> EngineResult<Option<(Tid, Vec<u8>)>> {
        let relation = self.relations().get(scan.rel_id)?;

        loop {
            if scan.next_block.as_u32() as usize >= relation.block_count() {
                return Ok(None);
            }
            if !relation.is_data_block(scan.next_block) {
                // Metapage or overflow slots: skip the whole block.
                scan.next_block = scan.next_block.next();
                scan.next_offset = OffsetNumber::FIRST;
                continue;
            }

            let page_lock = relation.page(scan.next_block)?;
            let guard = page_lock.read();
            let view = TablePageRef::new(&guard);

            while scan.next_offset.index() < view.line_pointer_count() {
                let tid = Tid::new(scan.next_block, scan.next_offset);
                scan.next_offset = scan.next_offset.next();

                let slots = EngineSlots {
                    page: &view,
                    relation: &relation,
                    block: tid.block,
                };
                if let Some(row) = palim_mvcc::resolve_version(
                    &view,
                    tid.block,
                    tid.offset,
                    snapshot,
                    &slots,
                    self.undo(),
                    self.registry(),
                )? {
                    return Ok(Some((tid, row)));
                }
            }

            scan.next_block = scan.next_block.next();
            scan.next_offset = OffsetNumber::FIRST;
        }
    }

    fn scan_rescan(&self, scan: &mut ScanState) {
        scan.next_block = BlockNumber::FIRST_DATA;
        scan.next_offset = OffsetNumber::FIRST;
    }

    fn bitmap_block(
        &self,
        rel_id: RelFileId,
        block: BlockNumber,
        snapshot: &Snapshot,
    ) -> EngineResult<Vec<(Tid, Vec<u8>)>> {
        let relation = self.relations().get(rel_id)?;
        if !relation.is_data_block(block) {
            return Ok(Vec::new());
        }

        let page_lock = relation.page(block)?;
        let guard = page_lock.read();
        let view = TablePageRef::new(&guard);
        let slots = EngineSlots {
            page: &view,
            relation: &relation,
            block,
        };

        let mut rows = Vec::new();
        for off in 1..=view.line_pointer_count() as u16 {
            let offset = OffsetNumber::new(off);
            if let Some(row) = palim_mvcc::resolve_version(
                &view,
                block,
                offset,
                snapshot,
                &slots,
                self.undo(),
                self.registry(),
            )? {
                rows.push((Tid::new(block, offset), row));
            }
        }
        Ok(rows)
    }

    fn index_fetch(
        &self,
        rel_id: RelFileId,
        tid: Tid,
        snapshot: &Snapshot,
    ) -> EngineResult<Option<Vec<u8>>> {
        // One version per tid, so this is a plain guarded resolve.
        self.read(rel_id, tid, snapshot)
    }

    fn fetch_row_version(
        &self,
        rel_id: RelFileId,
        tid: Tid,
        snapshot: &Snapshot,
    ) -> EngineResult<Option<Vec<u8>>> {
        self.read(rel_id, tid, snapshot)
    }

    fn tid_valid(&self, rel_id: RelFileId, tid: Tid) -> EngineResult<bool> {
        let relation = self.relations().get(rel_id)?;
        if !tid.is_valid()
            || tid.block.as_u32() as usize >= relation.block_count()
            || !relation.is_data_block(tid.block)
        {
            return Ok(false);
        }
        let page_lock = relation.page(tid.block)?;
        let guard = page_lock.read();
        let view = TablePageRef::new(&guard);
        Ok(tid.offset.index() < view.line_pointer_count())
    }

    fn satisfies_snapshot(
        &self,
        rel_id: RelFileId,
        tid: Tid,
        snapshot: &Snapshot,
    ) -> EngineResult<bool> {
        Ok(self.read(rel_id, tid, snapshot)?.is_some())
    }

    fn sample_next_block(&self, scan: &mut ScanState) -> EngineResult<Option<BlockNumber>> {
        let relation = self.relations().get(scan.rel_id)?;
        while (scan.next_block.as_u32() as usize) < relation.block_count() {
            let block = scan.next_block;
            scan.next_block = scan.next_block.next();
            scan.next_offset = OffsetNumber::FIRST;
            if relation.is_data_block(block) {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    fn insert_xid(&self, rel_id: RelFileId, tid: Tid) -> EngineResult<Option<Xid>> {
        let relation = self.relations().get(rel_id)?;
        let page_lock = relation.page(tid.block)?;
        let guard = page_lock.read();
        let view = TablePageRef::new(&guard);
        let slots = EngineSlots {
            page: &view,
            relation: &relation,
            block: tid.block,
        };
        fetch_insert_xid(&view, tid.block, tid.offset, &slots, self.undo())
    }

    fn analyze_block(
        &self,
        rel_id: RelFileId,
        block: BlockNumber,
        snapshot: &Snapshot,
    ) -> EngineResult<AnalyzeCounts> {
        let relation = self.relations().get(rel_id)?;
        if !relation.is_data_block(block) {
            return Ok(AnalyzeCounts::default());
        }

        let page_lock = relation.page(block)?;
        let guard = page_lock.read();
        let view = TablePageRef::new(&guard);
        let slots = EngineSlots {
            page: &view,
            relation: &relation,
            block,
        };

        let mut counts = AnalyzeCounts::default();
        for off in 1..=view.line_pointer_count() as u16 {
            let offset = OffsetNumber::new(off);
            let Some(lp) = view.line_pointer(offset) else {
                continue;
            };
            match lp.state {
                LinePointerState::Unused => {}
                LinePointerState::Dead => counts.dead += 1,
                _ => {
                    let visible = palim_mvcc::resolve_version(
                        &view,
                        block,
                        offset,
                        snapshot,
                        &slots,
                        self.undo(),
                        self.registry(),
                    )?
                    .is_some();
                    if visible {
                        counts.live += 1;
                    } else {
                        // Invisible but possibly still needed; dead only
                        // when its last modifier is settled history.
                        let modifier = if lp.state == LinePointerState::Deleted {
                            slots.read_slot(lp.slot()).xid
                        } else {
                            view.tuple_header(offset)
                                .map(|h| slots.read_slot(h.slot()).xid)
                                .unwrap_or(Xid::INVALID)
                        };
                        if self.registry().status(modifier) != TxnStatus::InProgress {
                            counts.dead += 1;
                        }
                    }
                }
            }
        }
        Ok(counts)
    }

    fn truncate(&self, rel_id: RelFileId) -> EngineResult<()> {
        let relation = self.relations().get(rel_id)?;
        relation.reset();
        Ok(())
    }

    fn set_new_filenode(&self, rel_id: RelFileId) -> EngineResult<()> {
        self.relations().set_new_filenode(rel_id)?;
        Ok(())
    }

    fn copy_data(&self, rel_id: RelFileId, target: RelFileId) -> EngineResult<()> {
        let source = self.relations().get(rel_id)?;
        let target = self.relations().get(target)?;
        source.copy_into(&target);
        Ok(())
    }

    fn rewrite(
        &self,
        rel_id: RelFileId,
        target: RelFileId,
        snapshot: &Snapshot,
    ) -> EngineResult<u64> {
        let target_rel = self.relations().get(target)?;

        // Surviving rows are re-stamped with the frozen sentinel: in the
        // rewritten table their history is gone, so they are all-visible
        // by construction and carry no undo.
        let mut rewritten = 0u64;
        let mut scan = self.scan_begin(rel_id)?;
        let mut dest_block: Option<BlockNumber> = None;

        while let Some((_, row)) = self.scan_next(&mut scan, snapshot)? {
            let mut tuple_header = palim_storage::page::TupleHeader::from_bytes(&row);
            tuple_header.set_slot(palim_common::SlotNo::FROZEN);
            tuple_header.clear_lock();
            tuple_header.infomask -= palim_storage::page::InfoMask::SLOT_REUSED;
            let tuple = tuple_header.with_payload(&row[TUPLE_HEADER_SIZE..]);

            loop {
                let block = match dest_block {
                    Some(block) => block,
                    None => {
                        let block = target_rel.extend();
                        dest_block = Some(block);
                        block
                    }
                };
                let page_lock = target_rel.page(block)?;
                let mut guard = page_lock.write();
                let mut page = palim_storage::TablePage::new(&mut guard);
                if page.add_tuple(&tuple, None).is_some() {
                    break;
                }
                dest_block = None;
            }
            rewritten += 1;
        }
        Ok(rewritten)
    }

    fn relation_size(&self, rel_id: RelFileId) -> EngineResult<u64> {
        Ok(self.relations().get(rel_id)?.size_bytes())
    }

    fn needs_toast_table(&self, row_width: usize) -> bool {
        TUPLE_HEADER_SIZE + row_width > self.config().toast_threshold
    }

    fn estimate_size(&self, rel_id: RelFileId) -> EngineResult<SizeEstimate> {
        let relation = self.relations().get(rel_id)?;
        let blocks = relation.block_count() as u64;

        // Density from the first data page, extrapolated.
        let mut density = 0u64;
        let mut data_blocks = 0u64;
        for raw in 1..relation.block_count() as u32 {
            let block = BlockNumber::new(raw);
            if !relation.is_data_block(block) {
                continue;
            }
            data_blocks += 1;
            if density == 0 {
                let page_lock = relation.page(block)?;
                let guard = page_lock.read();
                let view = TablePageRef::new(&guard);
                density = (1..=view.line_pointer_count() as u16)
                    .filter(|&off| {
                        view.line_pointer(OffsetNumber::new(off))
                            .map(|lp| lp.is_normal())
                            .unwrap_or(false)
                    })
                    .count() as u64;
            }
        }

        Ok(SizeEstimate {
            blocks,
            tuples: density * data_blocks,
        })
    }
}

/// Sanity bound: a scan position never addresses past one page's
/// possible offsets.
const _: () = assert!(PAGE_SIZE / 4 < u16::MAX as usize);
