//! In-memory relations and the process-wide relation store.
//!
//! The engine kernel works against page buffers handed out by a buffer
//! cache; this module is the stand-in scoped to this crate: each relation
//! is a vector of page buffers behind per-page reader-writer locks, with
//! block 0 as the metapage. Lock order follows the engine-wide rule:
//! data page before metapage, metapage before anything in the undo layer.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use palim_common::constants::{MAX_TRANS_SLOTS, PAGE_SIZE, TRANS_SLOTS_PER_PAGE};
use palim_common::{BlockNumber, EngineError, EngineResult, RelFileId, SlotNo, UndoPtr, Xid};

use crate::page::meta::{MetaPage, OverflowEntry, OverflowPage};
use crate::page::{PageFlags, TablePage, TransSlot};

/// One page buffer behind its lock.
pub type PageLock = Arc<RwLock<Vec<u8>>>;

/// An in-memory relation: metapage, data pages, overflow pages.
pub struct Relation {
    rel_id: RelFileId,
    pages: RwLock<Vec<PageLock>>,
}

impl Relation {
    /// Creates a relation with an initialized metapage at block 0.
    pub fn create(rel_id: RelFileId) -> Self {
        let mut meta_buf = vec![0u8; PAGE_SIZE];
        MetaPage::new(&mut meta_buf).initialize();

        Self {
            rel_id,
            pages: RwLock::new(vec![Arc::new(RwLock::new(meta_buf))]),
        }
    }

    /// Returns the relation's file id.
    pub fn rel_id(&self) -> RelFileId {
        self.rel_id
    }

    /// Number of blocks, metapage included.
    pub fn block_count(&self) -> usize {
        self.pages.read().len()
    }

    /// Returns the page lock for a block.
    pub fn page(&self, block: BlockNumber) -> EngineResult<PageLock> {
        self.pages
            .read()
            .get(block.as_u32() as usize)
            .cloned()
            .ok_or_else(|| {
                EngineError::corrupted(format!(
                    "block {} out of range for relation {}",
                    block, self.rel_id
                ))
            })
    }

    /// Appends a fresh data page and returns its block number.
    pub fn extend(&self) -> BlockNumber {
        let mut buf = vec![0u8; PAGE_SIZE];
        TablePage::new(&mut buf).init_data();

        let mut pages = self.pages.write();
        let block = BlockNumber::new(pages.len() as u32);
        pages.push(Arc::new(RwLock::new(buf)));
        block
    }

    /// Returns true if the block holds table rows (not the metapage, not
    /// an overflow page). Sequential scans visit only these.
    pub fn is_data_block(&self, block: BlockNumber) -> bool {
        if block == BlockNumber::METAPAGE {
            return false;
        }
        let Ok(page) = self.page(block) else {
            return false;
        };
        let guard = page.read();
        !crate::page::header::read_flags(&guard)
            .intersects(PageFlags::IS_OVERFLOW | PageFlags::IS_META)
    }

    /// Appends an overflow slot page and links it into the metapage
    /// chain. Takes the metapage lock.
    fn allocate_overflow_page(&self) -> EngineResult<BlockNumber> {
        let mut buf = vec![0u8; PAGE_SIZE];
        OverflowPage::new(&mut buf).initialize();

        let block = {
            let mut pages = self.pages.write();
            let block = BlockNumber::new(pages.len() as u32);
            pages.push(Arc::new(RwLock::new(buf)));
            block
        };

        let meta_lock = self.page(BlockNumber::METAPAGE)?;
        let mut meta_guard = meta_lock.write();
        let mut meta = MetaPage::new(&mut meta_guard);
        let old_last = meta.last_overflow();
        if !meta.first_overflow().is_valid() {
            meta.set_first_overflow(block);
        }
        meta.set_last_overflow(block);
        drop(meta_guard);

        if old_last.is_valid() {
            let prev_lock = self.page(old_last)?;
            let mut prev_guard = prev_lock.write();
            OverflowPage::new(&mut prev_guard).set_next(block);
        }

        debug!(rel = %self.rel_id, block = %block, "allocated overflow slot page");
        Ok(block)
    }

    /// Walks the overflow chain. Returns each overflow block in order.
    fn overflow_blocks(&self) -> EngineResult<Vec<BlockNumber>> {
        let meta_lock = self.page(BlockNumber::METAPAGE)?;
        let first = {
            let mut guard = meta_lock.write();
            MetaPage::new(&mut guard).first_overflow()
        };

        let mut blocks = Vec::new();
        let mut current = first;
        while current.is_valid() {
            blocks.push(current);
            let lock = self.page(current)?;
            let mut guard = lock.write();
            current = OverflowPage::new(&mut guard).next();
        }
        Ok(blocks)
    }

    /// Looks up an overflow slot for `(owner, slot_no)`.
    pub fn overflow_slot(
        &self,
        owner: BlockNumber,
        slot_no: SlotNo,
    ) -> EngineResult<Option<TransSlot>> {
        for block in self.overflow_blocks()? {
            let lock = self.page(block)?;
            let mut guard = lock.write();
            let page = OverflowPage::new(&mut guard);
            if let Some(index) = page.find(owner, slot_no) {
                return Ok(page.entry(index).map(|e| e.slot));
            }
        }
        Ok(None)
    }

    /// Updates an existing overflow slot. Returns false if absent.
    pub fn set_overflow_slot(
        &self,
        owner: BlockNumber,
        slot_no: SlotNo,
        slot: TransSlot,
    ) -> EngineResult<bool> {
        for block in self.overflow_blocks()? {
            let lock = self.page(block)?;
            let mut guard = lock.write();
            let mut page = OverflowPage::new(&mut guard);
            if let Some(index) = page.find(owner, slot_no) {
                let mut entry = page.entry(index).expect("index from find");
                entry.slot = slot;
                page.set_entry(index, entry);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Allocates an overflow slot for a data page whose on-page array is
    /// exhausted. Returns the new slot number, or `None` when the page
    /// already carries the maximum representable slots.
    pub fn allocate_overflow_slot(
        &self,
        owner: BlockNumber,
        xid: Xid,
        undo_ptr: UndoPtr,
    ) -> EngineResult<Option<SlotNo>> {
        let blocks = self.overflow_blocks()?;

        // Next slot number for this owner.
        let mut max_slot = TRANS_SLOTS_PER_PAGE as u16;
        for &block in &blocks {
            let lock = self.page(block)?;
            let mut guard = lock.write();
            let page = OverflowPage::new(&mut guard);
            for i in 0..page.entry_count() {
                let entry = page.entry(i).expect("entry in range");
                if entry.owner == owner {
                    max_slot = max_slot.max(entry.slot_no.as_u16());
                }
            }
        }
        let slot_no = SlotNo::new(max_slot + 1);
        if slot_no.as_u16() as usize > MAX_TRANS_SLOTS {
            return Ok(None);
        }

        let entry = OverflowEntry {
            owner,
            slot_no,
            slot: TransSlot::new(xid, undo_ptr),
        };

        // Append to the first overflow page with room, extending the
        // chain when every page is full.
        for &block in &blocks {
            let lock = self.page(block)?;
            let mut guard = lock.write();
            let mut page = OverflowPage::new(&mut guard);
            if page.add_entry(entry).is_some() {
                return Ok(Some(slot_no));
            }
        }

        let block = self.allocate_overflow_page()?;
        let lock = self.page(block)?;
        let mut guard = lock.write();
        let mut page = OverflowPage::new(&mut guard);
        page.add_entry(entry)
            .expect("fresh overflow page has room");
        Ok(Some(slot_no))
    }

    /// Drops every page and reinitializes the metapage. Not
    /// transactional; used by truncate.
    pub fn reset(&self) {
        let mut meta_buf = vec![0u8; PAGE_SIZE];
        MetaPage::new(&mut meta_buf).initialize();

        let mut pages = self.pages.write();
        pages.clear();
        pages.push(Arc::new(RwLock::new(meta_buf)));
    }

    /// Byte size of the relation's main fork.
    pub fn size_bytes(&self) -> u64 {
        (self.block_count() * PAGE_SIZE) as u64
    }

    /// Copies all page contents into another relation.
    pub fn copy_into(&self, target: &Relation) {
        let source = self.pages.read();
        let mut dest = target.pages.write();
        dest.clear();
        for page in source.iter() {
            dest.push(Arc::new(RwLock::new(page.read().clone())));
        }
    }
}

impl std::fmt::Debug for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relation")
            .field("rel_id", &self.rel_id)
            .field("blocks", &self.block_count())
            .finish()
    }
}

/// Process-wide table of open relations.
#[derive(Debug, Default)]
pub struct RelationStore {
    relations: DashMap<RelFileId, Arc<Relation>>,
}

impl RelationStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a relation, failing if the id is taken.
    pub fn create(&self, rel_id: RelFileId) -> EngineResult<Arc<Relation>> {
        let relation = Arc::new(Relation::create(rel_id));
        match self.relations.entry(rel_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::corrupted(format!(
                "relation {} already exists",
                rel_id
            ))),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&relation));
                Ok(relation)
            }
        }
    }

    /// Looks up a relation.
    pub fn get(&self, rel_id: RelFileId) -> EngineResult<Arc<Relation>> {
        self.relations
            .get(&rel_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::corrupted(format!("unknown relation {}", rel_id)))
    }

    /// Removes a relation.
    pub fn drop_relation(&self, rel_id: RelFileId) {
        self.relations.remove(&rel_id);
    }

    /// Replaces a relation's storage with a fresh file, as DDL does when
    /// rewriting a table.
    pub fn set_new_filenode(&self, rel_id: RelFileId) -> EngineResult<Arc<Relation>> {
        let relation = Arc::new(Relation::create(rel_id));
        self.relations.insert(rel_id, Arc::clone(&relation));
        Ok(relation)
    }
}
