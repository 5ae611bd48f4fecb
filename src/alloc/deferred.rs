/*!
 * Deferred Release Queue
 * Cross-thread free requests and counter-gated strong releases
 */

use super::handle::Allocation;
use super::manager::BackingAllocator;
use crate::core::types::{FileIndex, RegionId};
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Cross-thread entry point for freeing allocations
///
/// A worker thread enqueues under the queue mutex and never touches
/// region lists; the owner thread drains at flush points and performs
/// the real transitions. Drain order is FIFO so callers can enqueue
/// children before parents.
#[derive(Clone)]
pub struct WorkerQueue {
    inner: Arc<Mutex<VecDeque<Allocation>>>,
}

impl WorkerQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Queue an allocation for release at the owner's next flush point
    pub fn free_from_worker(&self, alloc: Allocation) {
        self.inner.lock().push_back(alloc);
    }

    /// Take everything queued so far, oldest first (owner side)
    pub(crate) fn take_pending(&self) -> Vec<Allocation> {
        let mut queue = self.inner.lock();
        queue.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// A strong release registered to fire once an externally-decremented
/// counter reaches zero. Accumulates repeat registrations against the
/// same counter.
#[derive(Debug)]
pub(crate) struct DelayedRelease {
    pub target: (FileIndex, RegionId),
    pub counter: Arc<AtomicU32>,
    pub releases: u32,
}

impl BackingAllocator {
    /// Drain the worker queue and fire any delayed strong releases whose
    /// counters have reached zero. Called at every flush point: before
    /// allocate, free, and reclamation, and at shutdown.
    pub(crate) fn drain_deferred(&mut self) {
        let pending = self.queue.take_pending();
        if !pending.is_empty() {
            debug!("Draining {} worker-freed allocations", pending.len());
            for alloc in pending {
                self.free_now(alloc);
            }
        }

        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].counter.load(Ordering::Acquire) == 0 {
                let entry = self.delayed.swap_remove(index);
                debug!(
                    "Delayed release counter hit zero, firing {} strong release(s)",
                    entry.releases
                );
                for _ in 0..entry.releases {
                    self.release_lock(entry.target.0, entry.target.1, false);
                }
            } else {
                index += 1;
            }
        }
    }
}
