//! The background undo worker.
//!
//! A single long-lived thread drains the rollback queue, applies undo
//! for aborted transactions too large for foreground rollback, picks up
//! forgotten aborts by scanning the undo logs for dead transactions, and
//! advances each log's discard horizon. Failed applications go to a
//! retry queue and come back around on the next cycle.
//!
//! The worker hibernates between cycles with an adaptive naptime:
//! resets to the minimum whenever a cycle did work, doubles while idle,
//! capped at the maximum.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use palim_common::{UndoPtr, Xid};
use palim_undo::record::UndoPayload;
use palim_undo::DiscardDecision;

use crate::engine::PalimEngine;
use crate::rollback;
use crate::wal::WalRecord;

/// One pending rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackRequest {
    /// The aborted transaction.
    pub xid: Xid,
    /// Its newest undo pointer.
    pub from: UndoPtr,
}

#[derive(Debug, Default)]
struct QueueInner {
    pending: VecDeque<RollbackRequest>,
    retry: VecDeque<RollbackRequest>,
    /// Everything queued or retrying, to keep the forgotten-abort scan
    /// from double-enqueueing.
    known: HashSet<Xid>,
}

/// Work queue feeding the undo worker.
#[derive(Debug, Default)]
pub struct RollbackQueue {
    inner: Mutex<QueueInner>,
    wakeup: Condvar,
}

impl RollbackQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a rollback and wakes the worker.
    pub fn push(&self, xid: Xid, from: UndoPtr) {
        let mut inner = self.inner.lock();
        if inner.known.insert(xid) {
            inner.pending.push_back(RollbackRequest { xid, from });
        }
        self.wakeup.notify_all();
    }

    /// Takes the next request, retries first.
    fn pop(&self) -> Option<RollbackRequest> {
        let mut inner = self.inner.lock();
        inner.retry.pop_front().or_else(|| inner.pending.pop_front())
    }

    /// Returns a failed request for a later cycle.
    fn requeue(&self, request: RollbackRequest) {
        self.inner.lock().retry.push_back(request);
    }

    /// Marks a request fully processed.
    fn done(&self, xid: Xid) {
        self.inner.lock().known.remove(&xid);
    }

    /// Number of requests waiting, retries included.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.pending.len() + inner.retry.len()
    }

    /// Returns true when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to the spawned undo worker.
pub struct UndoWorker {
    shutdown: Arc<AtomicBool>,
    engine: Arc<PalimEngine>,
    handle: JoinHandle<()>,
}

impl UndoWorker {
    /// Spawns the worker thread.
    pub fn spawn(engine: Arc<PalimEngine>) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_engine = Arc::clone(&engine);
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = std::thread::Builder::new()
            .name("palim-undo-worker".into())
            .spawn(move || worker_loop(&thread_engine, &thread_shutdown))?;

        Ok(Self {
            shutdown,
            engine,
            handle,
        })
    }

    /// Stops the worker and waits for it to exit.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let _inner = self.engine.rollback_queue.inner.lock();
            self.engine.rollback_queue.wakeup.notify_all();
        }
        if self.handle.join().is_err() {
            warn!("undo worker panicked during shutdown");
        }
    }
}

fn worker_loop(engine: &PalimEngine, shutdown: &AtomicBool) {
    info!("undo worker started");
    let min_nap = engine.config().worker_min_naptime;
    let max_nap = engine.config().worker_max_naptime;
    let mut naptime = min_nap;

    while !shutdown.load(Ordering::Acquire) {
        let mut did_work = false;

        did_work |= drain_rollbacks(engine, shutdown);
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        did_work |= scan_forgotten_aborts(engine);
        did_work |= advance_discard_horizons(engine);

        naptime = if did_work {
            min_nap
        } else {
            (naptime * 2).min(max_nap)
        };

        let mut inner = engine.rollback_queue.inner.lock();
        if inner.pending.is_empty() && inner.retry.is_empty() {
            let _ = engine
                .rollback_queue
                .wakeup
                .wait_for(&mut inner, naptime);
        }
    }
    info!("undo worker stopped");
}

/// Applies every queued rollback. Failures go to the retry queue.
fn drain_rollbacks(engine: &PalimEngine, shutdown: &AtomicBool) -> bool {
    let mut did_work = false;
    while let Some(request) = engine.rollback_queue.pop() {
        match rollback::apply_undo_cancellable(engine, request.xid, request.from, shutdown) {
            Ok(()) => {
                engine.registry().undo_applied(request.xid);
                engine.rollback_queue.done(request.xid);
                did_work = true;
                debug!(xid = %request.xid, "background rollback applied");
            }
            Err(err) => {
                warn!(xid = %request.xid, %err, "background rollback failed; will retry");
                engine.rollback_queue.requeue(request);
                break;
            }
        }
        if shutdown.load(Ordering::Acquire) {
            break;
        }
    }
    did_work
}

/// Finds aborted transactions nobody enqueued (a crashed backend, a
/// lost request) by walking each log's transaction headers, and queues
/// them.
fn scan_forgotten_aborts(engine: &PalimEngine) -> bool {
    let pending: HashSet<Xid> = engine
        .registry()
        .aborted_pending_undo()
        .into_iter()
        .collect();
    if pending.is_empty() {
        return false;
    }

    let mut found = false;
    for log in engine.undo().all_logs() {
        let insert = log.insert_point();
        let mut offset = log.discard_state().snapshot().oldest_data;

        while offset < insert {
            let Ok(header) = log.read_record(offset) else {
                break;
            };
            let next = match header.payload {
                UndoPayload::XactHeader { next_txn_start } if next_txn_start != 0 => {
                    next_txn_start
                }
                UndoPayload::XactHeader { .. } => insert,
                _ => break,
            };

            if pending.contains(&header.xid) {
                // The transaction's newest record ends where the next
                // transaction (or the log) begins.
                if let Ok((start, _)) = log.read_record_before(next) {
                    engine
                        .rollback_queue
                        .push(header.xid, UndoPtr::from_parts(log.log_no(), start));
                    debug!(xid = %header.xid, "queued forgotten abort");
                    found = true;
                }
            }
            offset = next;
        }
    }
    found
}

/// Advances each log's discard horizon as far as the registry permits,
/// emitting one discard WAL record per advanced log.
fn advance_discard_horizons(engine: &PalimEngine) -> bool {
    let registry = engine.registry();
    let policy = move |xid: Xid| -> DiscardDecision { registry.discard_decision(xid) };

    let mut advanced = false;
    for log in engine.undo().all_logs() {
        match log.compute_discard(&policy) {
            Ok(Some(horizon)) => {
                if let Err(err) = log.apply_discard(horizon) {
                    warn!(log_no = log.log_no(), %err, "discard failed");
                    continue;
                }
                let _ = engine.wal.emit(&WalRecord::Discard {
                    log_no: log.log_no(),
                    new_oldest_data: horizon.oldest_data,
                    oldest_xid: horizon.oldest_xid,
                });
                advanced = true;
            }
            Ok(None) => {}
            Err(err) => warn!(log_no = log.log_no(), %err, "discard walk failed"),
        }
    }
    advanced
}
