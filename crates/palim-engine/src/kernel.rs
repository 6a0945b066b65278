//! The DML kernel.
//!
//! Every mutation follows the same ordered protocol under the target
//! page's exclusive lock:
//!
//! 1. verify the target line pointer is in the expected state,
//! 2. find or reserve the transaction's slot on the page,
//! 3. build the undo record, chaining it to the slot's current pointer
//!    (per-page) and the transaction's latest pointer (back-link),
//! 4. append the undo record,
//! 5. mutate the page,
//! 6. stamp the slot with the new chain head,
//! 7. emit one WAL record carrying the page delta and the undo hints.
//!
//! Conflicts with in-progress transactions release the page lock before
//! waiting; never wait while holding it.

use bytes::Bytes;

use palim_common::constants::TUPLE_HEADER_SIZE;
use palim_common::{
    BlockNumber, CommandId, EngineError, EngineResult, OffsetNumber, RelFileId, SlotNo, SpecToken,
    Tid, UndoPtr, Xid,
};
use palim_mvcc::visibility::SlotReader;
use palim_mvcc::TxnStatus;
use palim_storage::page::tuple::InfoMask;
use palim_storage::page::{
    LinePointer, LinePointerState, LockMode, PageFlags, TablePage, TupleHeader,
};
use palim_storage::prune::prune_page;
use palim_storage::relation::Relation;
use palim_storage::reserve::{bulk_reuse_committed_slots, find_or_reserve_slot, SlotRequest};
use palim_storage::TransSlot;
use palim_undo::record::{UndoPayload, UndoRecord};
use palim_undo::AttachedUndoLog;

use crate::engine::{EngineSlots, PalimEngine, Transaction};
use crate::wal::{UndoHints, WalRecord};

/// What to do when the target row is locked or being modified by
/// another transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWaitPolicy {
    /// Wait for the conflicting transaction to finish.
    Block,
    /// Give up immediately with `WouldBlock`.
    Skip,
    /// Fail with `LockNotAvailable`.
    Error,
}

/// Context about a failed or deferred mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureData {
    /// The conflicting transaction.
    pub xid: Xid,
    /// Where the current row version lives (follows non-in-place
    /// updates).
    pub tid: Tid,
    /// The conflicting command, for self-modification.
    pub cid: Option<CommandId>,
}

/// Result of a delete, update or lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The mutation went through. Updates report where the new version
    /// lives.
    Ok {
        /// New row position, when the operation created one.
        new_tid: Option<Tid>,
    },
    /// The row is not visible to the operation.
    Invisible,
    /// The row was already modified by the current transaction.
    SelfModified {
        /// The command that modified it.
        cid: CommandId,
    },
    /// A committed concurrent update moved the row.
    Updated {
        /// Conflict context; `tid` points at the new version.
        failure: FailureData,
    },
    /// A committed concurrent delete removed the row.
    Deleted {
        /// Conflict context.
        failure: FailureData,
    },
    /// The row is being modified by an in-progress transaction and the
    /// policy did not allow waiting it out.
    BeingModified {
        /// Conflict context.
        failure: FailureData,
    },
    /// The row is locked and the policy was `Skip`.
    WouldBlock {
        /// Conflict context.
        failure: FailureData,
    },
}

/// Control flow of one locked attempt at a row.
enum Step<T> {
    /// Release the page and wait for this transaction, then retry.
    Wait(Xid),
    /// Finished with this outcome.
    Done(T),
}

impl PalimEngine {
    /// Inserts a row, returning its tid.
    pub fn insert(
        &self,
        txn: &mut Transaction,
        rel_id: RelFileId,
        payload: &[u8],
    ) -> EngineResult<Tid> {
        self.insert_internal(txn, rel_id, payload, None)
    }

    /// Inserts a provisional row that only dirty snapshots (and the
    /// inserting transaction) can see until it is confirmed.
    pub fn insert_speculative(
        &self,
        txn: &mut Transaction,
        rel_id: RelFileId,
        payload: &[u8],
        token: SpecToken,
    ) -> EngineResult<Tid> {
        self.insert_internal(txn, rel_id, payload, Some(token))
    }

    fn insert_internal(
        &self,
        txn: &mut Transaction,
        rel_id: RelFileId,
        payload: &[u8],
        spec_token: Option<SpecToken>,
    ) -> EngineResult<Tid> {
        let relation = self.relations.get(rel_id)?;
        let tuple_len = TUPLE_HEADER_SIZE + payload.len();
        let block = self.find_block_with_room(&relation, tuple_len)?;

        let page_lock = relation.page(block)?;
        let mut guard = page_lock.write();
        let mut page = TablePage::new(&mut guard);

        if !page.has_room_for(tuple_len) {
            let oracle = self.oracle();
            prune_page(&mut page, &oracle, false);
        }
        if !page.has_room_for(tuple_len) {
            return Err(EngineError::out_of_space(tuple_len, page.free_space()));
        }

        let xid = txn.xid;
        let in_subxact = txn.in_subxact();
        let (attached, wrote_reuse) = self.split_for_undo(txn)?;
        let (slot_no, blkprev) = self.reserve_slot(
            attached,
            wrote_reuse,
            &mut page,
            &relation,
            block,
            rel_id,
            xid,
            in_subxact,
        )?;

        // Target offset, then the critical section: undo, page, slot,
        // WAL.
        let offset = page
            .usable_offset_ranges(1, tuple_len)
            .first()
            .map(|(start, _)| *start)
            .ok_or_else(|| EngineError::out_of_space(tuple_len, page.free_space()))?;
        let tid = Tid::new(block, offset);

        let mut tuple_header = TupleHeader::for_insert(slot_no);
        if spec_token.is_some() {
            tuple_header.infomask |= InfoMask::SPECULATIVE;
        }
        let tuple_bytes = tuple_header.with_payload(payload);

        let prev_undo = attached.latest();
        let record = UndoRecord::new(
            rel_id,
            tid,
            xid,
            prev_undo,
            blkprev,
            UndoPayload::Insert { spec_token },
        );
        let undo_ptr = attached.append(&record)?;

        page.add_tuple(&tuple_bytes, Some(offset))
            .ok_or_else(|| EngineError::out_of_space(tuple_len, page.free_space()))?;
        self.stamp_slot(&mut page, &relation, block, slot_no, xid, undo_ptr)?;

        let lsn = self.emit_wal(
            attached,
            WalRecord::Insert {
                rel: rel_id,
                xid,
                tid,
                tuple: Bytes::copy_from_slice(&tuple_bytes),
                undo: UndoHints {
                    undo_ptr,
                    prev_undo,
                    slot: slot_no.as_u16(),
                },
                spec_token,
            },
        )?;
        page.page_header().set_lsn(lsn);

        Ok(tid)
    }

    /// Inserts a batch of rows, coalescing their placement into
    /// contiguous offset ranges with one undo record per range.
    pub fn multi_insert(
        &self,
        txn: &mut Transaction,
        rel_id: RelFileId,
        payloads: &[Vec<u8>],
    ) -> EngineResult<Vec<Tid>> {
        let relation = self.relations.get(rel_id)?;
        let mut tids = Vec::with_capacity(payloads.len());
        let mut remaining = payloads;

        while !remaining.is_empty() {
            let widest = remaining
                .iter()
                .map(|p| TUPLE_HEADER_SIZE + p.len())
                .max()
                .expect("remaining is non-empty");
            let block = self.find_block_with_room(&relation, widest)?;

            let page_lock = relation.page(block)?;
            let mut guard = page_lock.write();
            let mut page = TablePage::new(&mut guard);

            let mut ranges = page.usable_offset_ranges(remaining.len(), widest);
            if ranges.is_empty() {
                let oracle = self.oracle();
                prune_page(&mut page, &oracle, false);
                ranges = page.usable_offset_ranges(remaining.len(), widest);
                if ranges.is_empty() {
                    return Err(EngineError::out_of_space(widest, page.free_space()));
                }
            }

            let xid = txn.xid;
            let in_subxact = txn.in_subxact();
            let (attached, wrote_reuse) = self.split_for_undo(txn)?;
            let (slot_no, mut blkprev) = self.reserve_slot(
                attached,
                wrote_reuse,
                &mut page,
                &relation,
                block,
                rel_id,
                xid,
                in_subxact,
            )?;

            let mut used_ranges = Vec::new();
            let mut placed_tuples = Vec::new();
            let mut undo_ptr = UndoPtr::INVALID;
            let mut prev_undo = attached.latest();

            for (start, end) in ranges {
                if remaining.is_empty() {
                    break;
                }
                let room = (end.as_u16() - start.as_u16() + 1) as usize;
                let take = room.min(remaining.len());
                let used = (
                    start,
                    OffsetNumber::new(start.as_u16() + take as u16 - 1),
                );

                // One undo record per contiguous range actually filled.
                prev_undo = attached.latest();
                let record = UndoRecord::new(
                    rel_id,
                    Tid::new(block, OffsetNumber::INVALID),
                    xid,
                    prev_undo,
                    blkprev,
                    UndoPayload::MultiInsert { ranges: vec![used] },
                );
                undo_ptr = attached.append(&record)?;
                blkprev = undo_ptr;

                for off in used.0.as_u16()..=used.1.as_u16() {
                    let offset = OffsetNumber::new(off);
                    let payload = &remaining[0];
                    let tuple_bytes = TupleHeader::for_insert(slot_no).with_payload(payload);
                    if page.add_tuple(&tuple_bytes, Some(offset)).is_none() {
                        return Err(EngineError::out_of_space(
                            tuple_bytes.len(),
                            page.free_space(),
                        ));
                    }
                    placed_tuples.push(Bytes::copy_from_slice(&tuple_bytes));
                    tids.push(Tid::new(block, offset));
                    remaining = &remaining[1..];
                }
                used_ranges.push(used);
            }
            if used_ranges.is_empty() {
                return Err(EngineError::out_of_space(widest, page.free_space()));
            }

            self.stamp_slot(&mut page, &relation, block, slot_no, xid, undo_ptr)?;

            let lsn = self.emit_wal(
                attached,
                WalRecord::MultiInsert {
                    rel: rel_id,
                    xid,
                    block,
                    ranges: used_ranges,
                    tuples: placed_tuples,
                    undo: UndoHints {
                        undo_ptr,
                        prev_undo,
                        slot: slot_no.as_u16(),
                    },
                },
            )?;
            page.page_header().set_lsn(lsn);
        }

        Ok(tids)
    }

    /// Deletes a row.
    pub fn delete(
        &self,
        txn: &mut Transaction,
        rel_id: RelFileId,
        tid: Tid,
        policy: LockWaitPolicy,
    ) -> EngineResult<MutationOutcome> {
        let relation = self.relations.get(rel_id)?;
        loop {
            let page_lock = relation.page(tid.block)?;
            let step = {
                let mut guard = page_lock.write();
                let mut page = TablePage::new(&mut guard);
                self.delete_locked(txn, &relation, rel_id, tid, policy, &mut page)?
            };
            match step {
                Step::Done(outcome) => return Ok(outcome),
                Step::Wait(holder) => self.registry.wait_for_completion(holder),
            }
        }
    }

    fn delete_locked(
        &self,
        txn: &mut Transaction,
        relation: &Relation,
        rel_id: RelFileId,
        tid: Tid,
        policy: LockWaitPolicy,
        page: &mut TablePage<'_>,
    ) -> EngineResult<Step<MutationOutcome>> {
        let tuple_bytes = match self.check_modifiable(txn, relation, tid, policy, page)? {
            Step::Done(Ok(bytes)) => bytes,
            Step::Done(Err(outcome)) => return Ok(Step::Done(outcome)),
            Step::Wait(xid) => return Ok(Step::Wait(xid)),
        };

        let xid = txn.xid;
        let in_subxact = txn.in_subxact();
        let subxact = in_subxact.then(|| txn.subxacts.len() as u32);
        let (attached, wrote_reuse) = self.split_for_undo(txn)?;
        let (slot_no, blkprev) = self.reserve_slot(
            attached,
            wrote_reuse,
            page,
            relation,
            tid.block,
            rel_id,
            xid,
            in_subxact,
        )?;

        let image = Bytes::copy_from_slice(&tuple_bytes);
        let prev_undo = attached.latest();
        let record = UndoRecord::new(
            rel_id,
            tid,
            xid,
            prev_undo,
            blkprev,
            UndoPayload::Delete {
                tuple: image.clone(),
                subxact,
            },
        );
        let undo_ptr = attached.append(&record)?;

        page.clear_tuple_body(tid.offset);
        page.set_line_pointer(tid.offset, LinePointer::deleted(slot_no));
        page.page_header().set_prune_xid(xid);
        self.stamp_slot(page, relation, tid.block, slot_no, xid, undo_ptr)?;

        let lsn = self.emit_wal(
            attached,
            WalRecord::Delete {
                rel: rel_id,
                xid,
                tid,
                tuple: (!self.config.full_page_writes).then_some(image),
                undo: UndoHints {
                    undo_ptr,
                    prev_undo,
                    slot: slot_no.as_u16(),
                },
            },
        )?;
        page.page_header().set_lsn(lsn);

        Ok(Step::Done(MutationOutcome::Ok { new_tid: None }))
    }

    /// Updates a row. In place when the new image fits on the page and
    /// no delete-marking-less index covers a modified column; otherwise
    /// the row migrates and callers learn the new tid.
    pub fn update(
        &self,
        txn: &mut Transaction,
        rel_id: RelFileId,
        tid: Tid,
        new_payload: &[u8],
        modified_indexed_column: bool,
        policy: LockWaitPolicy,
    ) -> EngineResult<MutationOutcome> {
        let relation = self.relations.get(rel_id)?;
        loop {
            enum Decision {
                InPlace(MutationOutcome),
                Migrate,
                Wait(Xid),
                Bail(MutationOutcome),
            }

            let page_lock = relation.page(tid.block)?;
            let decision = {
                let mut guard = page_lock.write();
                let mut page = TablePage::new(&mut guard);

                match self.check_modifiable(txn, &relation, tid, policy, &mut page)? {
                    Step::Done(Ok(old_tuple)) => {
                        let new_len = TUPLE_HEADER_SIZE + new_payload.len();
                        let fits = |page: &TablePage<'_>| {
                            let lp = page.line_pointer(tid.offset).expect("checked normal");
                            new_len <= lp.len() || page.free_space() >= new_len + 8
                        };

                        let mut can_in_place = !modified_indexed_column && fits(&page);
                        if !can_in_place && !modified_indexed_column {
                            let oracle = self.oracle();
                            prune_page(&mut page, &oracle, false);
                            can_in_place = fits(&page);
                        }

                        if can_in_place {
                            Decision::InPlace(self.update_in_place(
                                txn,
                                &relation,
                                rel_id,
                                tid,
                                new_payload,
                                &old_tuple,
                                &mut page,
                            )?)
                        } else {
                            Decision::Migrate
                        }
                    }
                    Step::Done(Err(outcome)) => Decision::Bail(outcome),
                    Step::Wait(xid) => Decision::Wait(xid),
                }
            };

            match decision {
                Decision::InPlace(outcome) | Decision::Bail(outcome) => return Ok(outcome),
                Decision::Wait(holder) => self.registry.wait_for_completion(holder),
                Decision::Migrate => {
                    return self
                        .update_non_in_place(txn, &relation, rel_id, tid, new_payload, policy)
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn update_in_place(
        &self,
        txn: &mut Transaction,
        relation: &Relation,
        rel_id: RelFileId,
        tid: Tid,
        new_payload: &[u8],
        old_tuple: &[u8],
        page: &mut TablePage<'_>,
    ) -> EngineResult<MutationOutcome> {
        let xid = txn.xid;
        let in_subxact = txn.in_subxact();
        let (attached, wrote_reuse) = self.split_for_undo(txn)?;
        let (slot_no, blkprev) = self.reserve_slot(
            attached,
            wrote_reuse,
            page,
            relation,
            tid.block,
            rel_id,
            xid,
            in_subxact,
        )?;

        let prev_undo = attached.latest();
        let record = UndoRecord::new(
            rel_id,
            tid,
            xid,
            prev_undo,
            blkprev,
            UndoPayload::InPlaceUpdate {
                old_tuple: Bytes::copy_from_slice(old_tuple),
            },
        );
        let undo_ptr = attached.append(&record)?;

        let mut tuple_header = TupleHeader::for_insert(slot_no);
        tuple_header.infomask |= InfoMask::IN_PLACE_UPDATED;
        let new_tuple = tuple_header.with_payload(new_payload);
        if !page.replace_tuple(tid.offset, &new_tuple) {
            // Space was verified under this same lock.
            return Err(EngineError::out_of_space(new_tuple.len(), page.free_space()));
        }
        self.stamp_slot(page, relation, tid.block, slot_no, xid, undo_ptr)?;

        let lsn = self.emit_wal(
            attached,
            WalRecord::Update {
                rel: rel_id,
                xid,
                tid,
                new_tid: tid,
                tuple: Bytes::copy_from_slice(&new_tuple),
                old_tuple: (!self.config.full_page_writes)
                    .then(|| Bytes::copy_from_slice(old_tuple)),
                undo: UndoHints {
                    undo_ptr,
                    prev_undo,
                    slot: slot_no.as_u16(),
                },
                in_place: true,
            },
        )?;
        page.page_header().set_lsn(lsn);

        Ok(MutationOutcome::Ok { new_tid: Some(tid) })
    }

    /// The migrating update: delete on the origin page, insert on the
    /// destination, one undo record per page, one WAL record overall.
    fn update_non_in_place(
        &self,
        txn: &mut Transaction,
        relation: &Relation,
        rel_id: RelFileId,
        tid: Tid,
        new_payload: &[u8],
        policy: LockWaitPolicy,
    ) -> EngineResult<MutationOutcome> {
        let new_len = TUPLE_HEADER_SIZE + new_payload.len();
        loop {
            let dest_block = self.find_block_with_room_excluding(relation, new_len, tid.block)?;

            let origin_lock = relation.page(tid.block)?;
            let dest_lock = relation.page(dest_block)?;

            // Lock pages in block order; same block takes one lock.
            let step = if dest_block == tid.block {
                let mut guard = origin_lock.write();
                let mut page = TablePage::new(&mut guard);
                self.move_row(
                    txn, relation, rel_id, tid, dest_block, None, new_payload, policy, &mut page,
                )?
            } else if tid.block < dest_block {
                let mut origin_guard = origin_lock.write();
                let mut dest_guard = dest_lock.write();
                let mut origin_page = TablePage::new(&mut origin_guard);
                let mut dest_page = TablePage::new(&mut dest_guard);
                self.move_row(
                    txn,
                    relation,
                    rel_id,
                    tid,
                    dest_block,
                    Some(&mut dest_page),
                    new_payload,
                    policy,
                    &mut origin_page,
                )?
            } else {
                let mut dest_guard = dest_lock.write();
                let mut origin_guard = origin_lock.write();
                let mut origin_page = TablePage::new(&mut origin_guard);
                let mut dest_page = TablePage::new(&mut dest_guard);
                self.move_row(
                    txn,
                    relation,
                    rel_id,
                    tid,
                    dest_block,
                    Some(&mut dest_page),
                    new_payload,
                    policy,
                    &mut origin_page,
                )?
            };

            match step {
                Step::Done(outcome) => return Ok(outcome),
                Step::Wait(holder) => self.registry.wait_for_completion(holder),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn move_row<'a>(
        &self,
        txn: &mut Transaction,
        relation: &Relation,
        rel_id: RelFileId,
        tid: Tid,
        dest_block: BlockNumber,
        mut dest_page: Option<&mut TablePage<'a>>,
        new_payload: &[u8],
        policy: LockWaitPolicy,
        origin_page: &mut TablePage<'a>,
    ) -> EngineResult<Step<MutationOutcome>> {
        let old_tuple = match self.check_modifiable(txn, relation, tid, policy, origin_page)? {
            Step::Done(Ok(bytes)) => bytes,
            Step::Done(Err(outcome)) => return Ok(Step::Done(outcome)),
            Step::Wait(xid) => return Ok(Step::Wait(xid)),
        };

        let xid = txn.xid;
        let in_subxact = txn.in_subxact();
        let new_len = TUPLE_HEADER_SIZE + new_payload.len();

        // Slots on both pages, then the destination offset.
        let (attached, wrote_reuse) = self.split_for_undo(txn)?;
        let (origin_slot, origin_blkprev) = self.reserve_slot(
            attached,
            wrote_reuse,
            origin_page,
            relation,
            tid.block,
            rel_id,
            xid,
            in_subxact,
        )?;
        let (dest_slot, dest_chain, dest_offset) = match dest_page.as_deref_mut() {
            Some(dest) => {
                let (slot, blkprev) = self.reserve_slot(
                    attached,
                    wrote_reuse,
                    dest,
                    relation,
                    dest_block,
                    rel_id,
                    xid,
                    in_subxact,
                )?;
                let offset = dest
                    .usable_offset_ranges(1, new_len)
                    .first()
                    .map(|(start, _)| *start)
                    .ok_or_else(|| EngineError::out_of_space(new_len, dest.free_space()))?;
                (slot, Some(blkprev), offset)
            }
            None => {
                // Same page: the origin reservation covers both roles;
                // the insert record chains behind the origin record.
                let offset = origin_page
                    .usable_offset_ranges(1, new_len)
                    .first()
                    .map(|(start, _)| *start)
                    .ok_or_else(|| {
                        EngineError::out_of_space(new_len, origin_page.free_space())
                    })?;
                (origin_slot, None, offset)
            }
        };
        let new_tid = Tid::new(dest_block, dest_offset);

        // Origin record first, then the destination's insert record.
        let old_image = Bytes::copy_from_slice(&old_tuple);
        let prev_undo = attached.latest();
        let origin_record = UndoRecord::new(
            rel_id,
            tid,
            xid,
            prev_undo,
            origin_blkprev,
            UndoPayload::NonInPlaceUpdate {
                old_tuple: old_image.clone(),
                new_tid,
            },
        );
        let origin_ptr = attached.append(&origin_record)?;

        let insert_record = UndoRecord::new(
            rel_id,
            new_tid,
            xid,
            attached.latest(),
            dest_chain.unwrap_or(origin_ptr),
            UndoPayload::Insert { spec_token: None },
        );
        let insert_ptr = attached.append(&insert_record)?;

        // Page mutations and slot stamps.
        let new_tuple = TupleHeader::for_insert(dest_slot).with_payload(new_payload);
        {
            let target = dest_page.as_deref_mut().unwrap_or(&mut *origin_page);
            target
                .add_tuple(&new_tuple, Some(dest_offset))
                .ok_or_else(|| EngineError::out_of_space(new_len, target.free_space()))?;
        }
        origin_page.clear_tuple_body(tid.offset);
        origin_page.set_line_pointer(tid.offset, LinePointer::deleted(origin_slot));
        origin_page.page_header().set_prune_xid(xid);

        self.stamp_slot(origin_page, relation, tid.block, origin_slot, xid, origin_ptr)?;
        {
            let target = dest_page.as_deref_mut().unwrap_or(&mut *origin_page);
            self.stamp_slot(target, relation, dest_block, dest_slot, xid, insert_ptr)?;
        }

        let lsn = self.emit_wal(
            attached,
            WalRecord::Update {
                rel: rel_id,
                xid,
                tid,
                new_tid,
                tuple: Bytes::copy_from_slice(&new_tuple),
                old_tuple: (!self.config.full_page_writes).then_some(old_image),
                undo: UndoHints {
                    undo_ptr: origin_ptr,
                    prev_undo,
                    slot: origin_slot.as_u16(),
                },
                in_place: false,
            },
        )?;
        origin_page.page_header().set_lsn(lsn);
        if let Some(dest) = dest_page {
            dest.page_header().set_lsn(lsn);
        }

        Ok(Step::Done(MutationOutcome::Ok {
            new_tid: Some(new_tid),
        }))
    }

    /// Acquires a row-level lock, promoting to the strongest mode
    /// active on the row.
    pub fn lock_row(
        &self,
        txn: &mut Transaction,
        rel_id: RelFileId,
        tid: Tid,
        mode: LockMode,
        policy: LockWaitPolicy,
    ) -> EngineResult<MutationOutcome> {
        let relation = self.relations.get(rel_id)?;
        loop {
            let page_lock = relation.page(tid.block)?;
            let step = {
                let mut guard = page_lock.write();
                let mut page = TablePage::new(&mut guard);
                self.lock_locked(txn, &relation, rel_id, tid, mode, policy, &mut page)?
            };
            match step {
                Step::Done(outcome) => return Ok(outcome),
                Step::Wait(holder) => self.registry.wait_for_completion(holder),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn lock_locked(
        &self,
        txn: &mut Transaction,
        relation: &Relation,
        rel_id: RelFileId,
        tid: Tid,
        mode: LockMode,
        policy: LockWaitPolicy,
        page: &mut TablePage<'_>,
    ) -> EngineResult<Step<MutationOutcome>> {
        let Some(lp) = page.line_pointer(tid.offset) else {
            return Err(EngineError::InvalidTid { tid });
        };
        match lp.state {
            LinePointerState::Unused | LinePointerState::Dead => {
                return Ok(Step::Done(MutationOutcome::Invisible));
            }
            LinePointerState::Deleted => {
                let outcome = self.deleted_outcome(txn, page, relation, tid, lp.slot());
                return Ok(Step::Done(outcome));
            }
            LinePointerState::Normal => {}
        }

        let tuple_header = page.tuple_header(tid.offset).expect("normal pointer");
        let holder = self.tuple_modifier(page, relation, tid.block, &tuple_header);
        let xid = txn.xid;

        // Another in-progress holder blocks us only when the modes
        // conflict; compatible lockers stack and set the multi-locker
        // bit.
        let mut other_locker_active = false;
        if holder.is_normal()
            && holder != xid
            && self.registry.status(holder) == TxnStatus::InProgress
        {
            let held = tuple_header.lock_mode().unwrap_or(LockMode::Exclusive);
            if !mode.is_compatible_with(held) {
                return self.conflict_step(policy, holder, tid);
            }
            other_locker_active = true;
        }

        let in_subxact = txn.in_subxact();
        let subxact = in_subxact.then(|| txn.subxacts.len() as u32);
        let (attached, wrote_reuse) = self.split_for_undo(txn)?;
        let (slot_no, blkprev) = self.reserve_slot(
            attached,
            wrote_reuse,
            page,
            relation,
            tid.block,
            rel_id,
            xid,
            in_subxact,
        )?;

        let new_mode = tuple_header
            .lock_mode()
            .map_or(mode, |held| held.stronger(mode));

        let prev_undo = attached.latest();
        let record = UndoRecord::new(
            rel_id,
            tid,
            xid,
            prev_undo,
            blkprev,
            UndoPayload::Lock {
                prior_header: Bytes::copy_from_slice(&tuple_header.to_bytes()),
                mode: new_mode.as_u8(),
                subxact,
            },
        );
        let undo_ptr = attached.append(&record)?;

        let mut new_header = tuple_header;
        new_header.set_slot(slot_no);
        new_header.set_lock_mode(new_mode);
        if other_locker_active || tuple_header.infomask.contains(InfoMask::MULTI_LOCKER) {
            new_header.infomask |= InfoMask::MULTI_LOCKER;
        }
        page.set_tuple_header(tid.offset, new_header);
        self.stamp_slot(page, relation, tid.block, slot_no, xid, undo_ptr)?;

        let lsn = self.emit_wal(
            attached,
            WalRecord::Lock {
                rel: rel_id,
                xid,
                tid,
                mode: new_mode.as_u8(),
                undo: UndoHints {
                    undo_ptr,
                    prev_undo,
                    slot: slot_no.as_u16(),
                },
            },
        )?;
        page.page_header().set_lsn(lsn);

        Ok(Step::Done(MutationOutcome::Ok { new_tid: None }))
    }

    /// Finishes a speculative insertion: confirm clears the provisional
    /// bit; abandonment reverts the insert and frees the offset.
    pub fn complete_speculative(
        &self,
        txn: &mut Transaction,
        rel_id: RelFileId,
        tid: Tid,
        token: SpecToken,
        success: bool,
    ) -> EngineResult<()> {
        let relation = self.relations.get(rel_id)?;
        let page_lock = relation.page(tid.block)?;
        let mut guard = page_lock.write();
        let mut page = TablePage::new(&mut guard);

        let tuple_header = page
            .tuple_header(tid.offset)
            .ok_or(EngineError::InvalidTid { tid })?;
        if !tuple_header.infomask.contains(InfoMask::SPECULATIVE) {
            return Err(EngineError::corrupted(
                "speculative completion on a non-speculative row",
            ));
        }

        // Find the insert record on the slot's chain and verify its
        // token matches the completion.
        let slot_no = tuple_header.slot();
        let slot = {
            let view = page.as_ref_view();
            let slots = EngineSlots {
                page: &view,
                relation: &relation,
                block: tid.block,
            };
            slots.read_slot(slot_no)
        };
        let mut ptr = slot.undo_ptr;
        let insert_record = loop {
            if !ptr.is_valid() {
                return Err(EngineError::corrupted(
                    "speculative insert undo record not found",
                ));
            }
            let record = self.undo.read_record(ptr)?;
            if record.tid == tid {
                break record;
            }
            ptr = record.blkprev;
        };
        match insert_record.payload {
            UndoPayload::Insert {
                spec_token: Some(found),
            } if found == token => {}
            _ => {
                return Err(EngineError::corrupted(
                    "speculative token does not match insert undo record",
                ));
            }
        }

        if success {
            let mut new_header = tuple_header;
            new_header.infomask -= InfoMask::SPECULATIVE;
            page.set_tuple_header(tid.offset, new_header);
            let lsn = self.wal.emit(&WalRecord::SpecConfirm { rel: rel_id, tid })?;
            page.page_header().set_lsn(lsn);
        } else {
            // No new tuple is written: the insert is reverted and the
            // slot rewound past its record.
            page.retract_tuple(tid.offset);
            self.stamp_slot(
                &mut page,
                &relation,
                tid.block,
                slot_no,
                txn.xid,
                insert_record.blkprev,
            )?;
            let lsn = self.wal.emit(&WalRecord::SpecAbort { rel: rel_id, tid })?;
            page.page_header().set_lsn(lsn);
        }
        Ok(())
    }

    // =====================================================================
    // Shared steps
    // =====================================================================

    /// Verifies that the row at `tid` can be modified by `txn` right
    /// now, returning its current tuple bytes. `Err` outcomes report
    /// rows that are gone, moved or contended.
    fn check_modifiable(
        &self,
        txn: &Transaction,
        relation: &Relation,
        tid: Tid,
        policy: LockWaitPolicy,
        page: &mut TablePage<'_>,
    ) -> EngineResult<Step<Result<Vec<u8>, MutationOutcome>>> {
        let Some(lp) = page.line_pointer(tid.offset) else {
            return Err(EngineError::InvalidTid { tid });
        };

        match lp.state {
            LinePointerState::Unused | LinePointerState::Dead => {
                Ok(Step::Done(Err(MutationOutcome::Invisible)))
            }
            LinePointerState::Deleted => {
                let outcome = self.deleted_outcome(txn, page, relation, tid, lp.slot());
                Ok(Step::Done(Err(outcome)))
            }
            LinePointerState::Normal => {
                let tuple_header = page.tuple_header(tid.offset).expect("normal pointer");
                let holder = self.tuple_modifier(page, relation, tid.block, &tuple_header);

                if holder.is_normal() && holder != txn.xid {
                    match self.registry.status(holder) {
                        TxnStatus::InProgress => {
                            return match self.conflict_step(policy, holder, tid)? {
                                Step::Wait(xid) => Ok(Step::Wait(xid)),
                                Step::Done(outcome) => Ok(Step::Done(Err(outcome))),
                            };
                        }
                        TxnStatus::Aborted { pending_undo: true } => {
                            // The rollback engine still owes this row
                            // work; report it as busy.
                            return Ok(Step::Done(Err(MutationOutcome::BeingModified {
                                failure: FailureData {
                                    xid: holder,
                                    tid,
                                    cid: None,
                                },
                            })));
                        }
                        _ => {}
                    }
                }

                let bytes = page
                    .tuple_bytes(tid.offset)
                    .expect("normal pointer")
                    .to_vec();
                Ok(Step::Done(Ok(bytes)))
            }
        }
    }

    /// The xid currently owning the row's newest modification.
    fn tuple_modifier(
        &self,
        page: &TablePage<'_>,
        relation: &Relation,
        block: BlockNumber,
        tuple_header: &TupleHeader,
    ) -> Xid {
        let slot_no = tuple_header.slot();
        if slot_no.is_frozen() {
            return Xid::FROZEN;
        }
        let view = page.as_ref_view();
        let slots = EngineSlots {
            page: &view,
            relation,
            block,
        };
        slots.read_slot(slot_no).xid
    }

    /// Outcome for a row whose line pointer is `Deleted`: deleted by
    /// ourselves (self-modified), by an in-progress transaction
    /// (contended), or by a committed one (gone, possibly moved).
    fn deleted_outcome(
        &self,
        txn: &Transaction,
        page: &TablePage<'_>,
        relation: &Relation,
        tid: Tid,
        slot_no: SlotNo,
    ) -> MutationOutcome {
        let view = page.as_ref_view();
        let slots = EngineSlots {
            page: &view,
            relation,
            block: tid.block,
        };
        let slot = slots.read_slot(slot_no);

        if slot.is_frozen() || slot.is_free() {
            return MutationOutcome::Deleted {
                failure: FailureData {
                    xid: Xid::INVALID,
                    tid,
                    cid: None,
                },
            };
        }
        if slot.xid == txn.xid {
            return MutationOutcome::SelfModified { cid: txn.cid };
        }

        let moved_to = self.follow_moved_row(slot.undo_ptr, tid);
        let failure = FailureData {
            xid: slot.xid,
            tid: moved_to.unwrap_or(tid),
            cid: None,
        };
        match self.registry.status(slot.xid) {
            TxnStatus::InProgress => MutationOutcome::BeingModified { failure },
            _ if moved_to.is_some() => MutationOutcome::Updated { failure },
            _ => MutationOutcome::Deleted { failure },
        }
    }

    /// Follows a non-in-place update record to the row's new position.
    fn follow_moved_row(&self, head: UndoPtr, tid: Tid) -> Option<Tid> {
        let mut ptr = head;
        while ptr.is_valid() {
            let record = self.undo.read_record(ptr).ok()?;
            if record.tid == tid {
                if let UndoPayload::NonInPlaceUpdate { new_tid, .. } = record.payload {
                    return Some(new_tid);
                }
                return None;
            }
            ptr = record.blkprev;
        }
        None
    }

    /// Applies the wait policy to a conflict with `holder`.
    fn conflict_step(
        &self,
        policy: LockWaitPolicy,
        holder: Xid,
        tid: Tid,
    ) -> EngineResult<Step<MutationOutcome>> {
        match policy {
            LockWaitPolicy::Block => Ok(Step::Wait(holder)),
            LockWaitPolicy::Skip => Ok(Step::Done(MutationOutcome::WouldBlock {
                failure: FailureData {
                    xid: holder,
                    tid,
                    cid: None,
                },
            })),
            LockWaitPolicy::Error => Err(EngineError::LockNotAvailable { holder }),
        }
    }

    /// Splits the transaction borrow into the attached undo log and the
    /// slot-reuse flag, attaching first if needed.
    fn split_for_undo<'a>(
        &self,
        txn: &'a mut Transaction,
    ) -> EngineResult<(&'a mut AttachedUndoLog, &'a mut bool)> {
        if txn.undo.is_none() {
            txn.undo = Some(self.undo.attach(txn.xid)?);
        }
        Ok((
            txn.undo.as_mut().expect("attached above"),
            &mut txn.wrote_slot_reuse,
        ))
    }

    /// Runs the full slot-reservation protocol: own slot, cheap reuse,
    /// committed-slot recycling behind slot-reuse undo records, overflow
    /// allocation, and finally bulk reuse for toplevel transactions.
    #[allow(clippy::too_many_arguments)]
    fn reserve_slot(
        &self,
        attached: &mut AttachedUndoLog,
        wrote_reuse: &mut bool,
        page: &mut TablePage<'_>,
        relation: &Relation,
        block: BlockNumber,
        rel_id: RelFileId,
        xid: Xid,
        in_subxact: bool,
    ) -> EngineResult<(SlotNo, UndoPtr)> {
        if let Some((slot_no, undo_ptr)) =
            self.find_existing_slot(&page.as_ref_view(), relation, block, xid)?
        {
            return Ok((slot_no, undo_ptr));
        }

        let oracle = self.oracle();
        let mut last_reuse = UndoPtr::INVALID;
        let mut emit_reuse = |_slot_no: SlotNo, victim: TransSlot| -> EngineResult<()> {
            let record = UndoRecord::new(
                rel_id,
                Tid::new(block, OffsetNumber::INVALID),
                xid,
                attached.latest(),
                last_reuse,
                UndoPayload::SlotReuse {
                    prev_xid: victim.xid,
                    prev_undo: victim.undo_ptr,
                },
            );
            last_reuse = attached.append(&record)?;
            *wrote_reuse = true;
            Ok(())
        };

        match find_or_reserve_slot(page, xid, &oracle, &mut emit_reuse)? {
            SlotRequest::Existing { slot, undo_ptr } => Ok((slot, undo_ptr)),
            SlotRequest::Reserved { slot } => Ok((slot, last_reuse)),
            SlotRequest::TryOverflow => {
                if let Some(slot_no) =
                    relation.allocate_overflow_slot(block, xid, UndoPtr::INVALID)?
                {
                    page.page_header().set_flag(PageFlags::HAS_OVERFLOW_SLOTS);
                    return Ok((slot_no, UndoPtr::INVALID));
                }
                if in_subxact {
                    // Deadlock avoidance: the subtransaction must give
                    // up so its caller can release page locks and wait.
                    return Err(EngineError::SlotExhausted {
                        block: block.as_u32(),
                    });
                }
                let slot =
                    bulk_reuse_committed_slots(page, block.as_u32(), &oracle, &mut emit_reuse)?;
                Ok((slot, last_reuse))
            }
        }
    }

    /// Emits any due undo-meta record, then the operation's WAL record.
    fn emit_wal(&self, attached: &mut AttachedUndoLog, record: WalRecord) -> EngineResult<u64> {
        if let Some(hint) = attached.take_meta_hint(&self.undo) {
            self.wal.emit(&WalRecord::undo_meta(hint))?;
        }
        self.wal.emit(&record)
    }

    /// Finds (or creates) a data block with room for a tuple.
    fn find_block_with_room(
        &self,
        relation: &Relation,
        tuple_len: usize,
    ) -> EngineResult<BlockNumber> {
        self.find_block_with_room_excluding(relation, tuple_len, BlockNumber::INVALID)
    }

    fn find_block_with_room_excluding(
        &self,
        relation: &Relation,
        tuple_len: usize,
        exclude: BlockNumber,
    ) -> EngineResult<BlockNumber> {
        // Newest pages first: appends cluster there.
        for raw in (1..relation.block_count() as u32).rev() {
            let block = BlockNumber::new(raw);
            if block == exclude || !relation.is_data_block(block) {
                continue;
            }
            let page_lock = relation.page(block)?;
            let guard = page_lock.read();
            let view = palim_storage::page::TablePageRef::new(&guard);
            if view.free_space() >= tuple_len + 8 {
                return Ok(block);
            }
        }
        Ok(relation.extend())
    }
}
