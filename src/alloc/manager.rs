/*!
 * Backing-Store Allocator
 * Free-list allocation over anonymous shared files with heap fallback
 */

use super::deferred::{DelayedRelease, WorkerQueue};
use super::file::BackingFile;
use super::handle::{AllocKind, Allocation};
use super::region::RegionState;
use super::types::{AllocError, AllocResult, AllocStats, Config};
use crate::core::types::{round_up_to_page, ByteOffset, FileIndex, RegionId, Size};
use log::{debug, error, info, warn};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Backing-store memory allocator
///
/// Holds large byte ranges in anonymous shared files so their bytes do
/// not occupy address space unless mapped; maps regions on demand and
/// evicts least-needed mappings when the configured ceiling is exceeded.
/// Requests below one page, and every failure along the file path, fall
/// back to the system heap.
///
/// Single-owner model: every method takes `&mut self` and must run on
/// the owning thread, except [`free_from_worker`](Self::free_from_worker)
/// and the [`WorkerQueue`] handle, which only enqueue.
pub struct BackingAllocator {
    pub(super) config: Config,
    pub(super) files: Vec<BackingFile>,
    pub(super) allocated_bytes: Size,
    pub(super) locked_bytes: Size,
    pub(super) mapped_bytes: Size,
    pub(super) queue: WorkerQueue,
    pub(super) delayed: Vec<DelayedRelease>,
}

impl BackingAllocator {
    pub fn new(config: Config) -> Self {
        match config.ceiling {
            Some(ceiling) => info!(
                "Backing-store allocator initialized (mapped ceiling {} bytes, page {} bytes, up to {} files)",
                ceiling, config.page_size, config.max_files
            ),
            None => info!("Backing-store allocator initialized in pure-heap mode"),
        }
        Self {
            config,
            files: Vec::new(),
            allocated_bytes: 0,
            locked_bytes: 0,
            mapped_bytes: 0,
            queue: WorkerQueue::new(),
            delayed: Vec::new(),
        }
    }

    /// Create with a mapped-byte ceiling in megabytes; a negative value
    /// disables file-backed mode entirely
    pub fn with_ceiling_mb(ceiling_mb: i64) -> Self {
        Self::new(Config::with_ceiling_mb(ceiling_mb))
    }

    /// Handle for worker threads to queue frees through
    pub fn worker_queue(&self) -> WorkerQueue {
        self.queue.clone()
    }

    /// Queue an allocation for release at the next flush point. The only
    /// entry point that may be called off the owner thread.
    pub fn free_from_worker(&self, alloc: Allocation) {
        self.queue.free_from_worker(alloc);
    }

    /// Allocate `size` logically-zero bytes
    ///
    /// Sub-page requests always use the heap. Page-sized requests go to
    /// the backing files when a ceiling is configured; any failure on
    /// that path falls back to the heap, and only a failed heap fallback
    /// returns `OutOfMemory`.
    pub fn allocate(&mut self, size: Size) -> AllocResult<Allocation> {
        self.drain_deferred();

        if self.config.ceiling.is_some() && size >= self.config.page_size {
            match self.allocate_file_backed(size) {
                Ok(alloc) => return Ok(alloc),
                Err(e) => {
                    warn!(
                        "File-backed allocation of {} bytes failed ({}), falling back to heap",
                        size, e
                    );
                }
            }
        }

        self.allocate_heap(size)
    }

    /// Free an allocation immediately. Owner thread only; worker threads
    /// go through `free_from_worker`.
    pub fn free(&mut self, alloc: Allocation) {
        self.drain_deferred();
        self.free_now(alloc);
    }

    /// Pointer to the allocation's bytes, mapping its region first if
    /// needed (which may evict other mappings under the ceiling)
    ///
    /// File-backed pointers stay valid until the matching release drops
    /// the last lock; heap and external pointers are returned as stored,
    /// unconditionally. Sub-allocations resolve to their parent's bytes
    /// plus the relative offset.
    pub fn get_pointer(&mut self, alloc: &mut Allocation) -> AllocResult<NonNull<u8>> {
        match &mut alloc.kind {
            AllocKind::FileBacked { file, region } => self.lock_region(*file, *region, 0),
            AllocKind::SubFileBacked {
                file,
                region,
                offset,
            } => self.lock_region(*file, *region, *offset),
            AllocKind::Heap { buf, .. } => {
                // SAFETY: a boxed slice pointer is never null
                Ok(unsafe { NonNull::new_unchecked(buf.as_mut_ptr()) })
            }
            AllocKind::SubHeap { ptr, .. } => Ok(*ptr),
            AllocKind::External { ptr } => Ok(*ptr),
        }
    }

    /// Release a lock with a reuse-soon hint; at zero locks the region
    /// becomes a soft eviction candidate
    pub fn weak_release(&mut self, alloc: &Allocation) {
        if let Some((file, region)) = alloc.region_target() {
            self.release_lock(file, region, true);
        }
    }

    /// Release a lock; at zero locks the region becomes a normal
    /// eviction candidate
    pub fn strong_release(&mut self, alloc: &Allocation) {
        if let Some((file, region)) = alloc.region_target() {
            self.release_lock(file, region, false);
        }
    }

    /// Register a strong release to fire once `counter` (decremented
    /// externally) reaches zero, checked at flush points. An allocation
    /// accumulates against one counter only; registering a second,
    /// different counter while the first is outstanding is a programming
    /// error.
    pub fn delayed_strong_release(&mut self, alloc: &Allocation, counter: &Arc<AtomicU32>) {
        let Some(target) = alloc.region_target() else {
            return;
        };

        if let Some(entry) = self.delayed.iter_mut().find(|entry| entry.target == target) {
            if Arc::ptr_eq(&entry.counter, counter) {
                entry.releases += 1;
            } else {
                debug_assert!(
                    false,
                    "second delayed-release counter registered while one is outstanding"
                );
                error!(
                    "Ignoring second delayed-release counter for region {:?}",
                    target
                );
            }
        } else {
            self.delayed.push(DelayedRelease {
                target,
                counter: Arc::clone(counter),
                releases: 1,
            });
        }
    }

    /// Handle into a sub-range of `parent`'s storage
    ///
    /// A file-backed sub-allocation shares the parent's region and
    /// mapping but has no lock count of its own: it does not protect the
    /// parent from reclamation. Suballocating a sub-allocation or an
    /// external wrapper is a programming error.
    pub fn suballocate(&mut self, parent: &Allocation, offset: ByteOffset) -> Allocation {
        debug_assert!(offset <= parent.size || parent.is_external());
        let sub_size = parent.size.saturating_sub(offset);

        match &parent.kind {
            AllocKind::FileBacked { file, region } => {
                self.files[*file]
                    .regions
                    .get_mut(*region)
                    .unwrap()
                    .suballocs += 1;
                Allocation::new(
                    AllocKind::SubFileBacked {
                        file: *file,
                        region: *region,
                        offset,
                    },
                    sub_size,
                )
            }
            AllocKind::Heap { buf, subs } => {
                subs.fetch_add(1, Ordering::AcqRel);
                // SAFETY: offset is within the parent's buffer (asserted
                // above under the trusted-caller contract)
                let ptr = unsafe { NonNull::new_unchecked(buf.as_ptr().add(offset) as *mut u8) };
                Allocation::new(
                    AllocKind::SubHeap {
                        ptr,
                        subs: Arc::clone(subs),
                    },
                    sub_size,
                )
            }
            AllocKind::SubFileBacked {
                file,
                region,
                offset: parent_offset,
            } => {
                debug_assert!(false, "suballocation of a sub-allocation");
                error!("Suballocating a sub-allocation; chaining offsets");
                self.files[*file]
                    .regions
                    .get_mut(*region)
                    .unwrap()
                    .suballocs += 1;
                Allocation::new(
                    AllocKind::SubFileBacked {
                        file: *file,
                        region: *region,
                        offset: parent_offset + offset,
                    },
                    sub_size,
                )
            }
            AllocKind::SubHeap { ptr, subs } => {
                debug_assert!(false, "suballocation of a sub-allocation");
                error!("Suballocating a sub-allocation; chaining offsets");
                subs.fetch_add(1, Ordering::AcqRel);
                let ptr = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(offset)) };
                Allocation::new(
                    AllocKind::SubHeap {
                        ptr,
                        subs: Arc::clone(subs),
                    },
                    sub_size,
                )
            }
            AllocKind::External { ptr } => {
                debug_assert!(false, "suballocation of an external wrapper");
                error!("Suballocating an external wrapper; offsetting the raw pointer");
                let ptr = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(offset)) };
                Allocation::new(AllocKind::External { ptr }, 0)
            }
        }
    }

    /// Non-owning handle around an externally-managed pointer; freeing
    /// it is a no-op
    pub fn wrap_external(&self, ptr: NonNull<u8>) -> Allocation {
        Allocation::new(AllocKind::External { ptr }, 0)
    }

    /// Drain the deferred-release queue now. Draining also happens
    /// automatically before allocate, free, and reclamation, and at
    /// shutdown.
    pub fn flush(&mut self) {
        self.drain_deferred();
    }

    /// Whether the allocation's bytes are currently mapped. Heap and
    /// external storage is always resident.
    pub fn is_resident(&self, alloc: &Allocation) -> bool {
        match alloc.region_target() {
            Some((file, region)) => self.files[file]
                .regions
                .get(region)
                .map_or(false, |entry| entry.mapping.is_some()),
            None => true,
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> AllocStats {
        let mut free_regions = 0;
        let mut allocated_regions = 0;
        let mut mapped_regions = 0;
        for file in &self.files {
            for (_, region) in file.regions.iter() {
                match region.state {
                    RegionState::Free => free_regions += 1,
                    RegionState::Allocated => allocated_regions += 1,
                    _ => mapped_regions += 1,
                }
            }
        }
        AllocStats {
            allocated_bytes: self.allocated_bytes,
            locked_bytes: self.locked_bytes,
            mapped_bytes: self.mapped_bytes,
            mapped_ceiling: self.config.ceiling,
            file_count: self.files.len(),
            free_regions,
            allocated_regions,
            mapped_regions,
        }
    }

    /// Structural invariant check: every file's regions partition it
    /// with a coalesced free list, and the mapped-byte counter matches
    /// the mappings that actually exist
    pub fn verify_integrity(&self) -> bool {
        let tables_ok = self.files.iter().all(|file| file.regions.verify_integrity());
        let mapped_sum: Size = self
            .files
            .iter()
            .flat_map(|file| file.regions.iter())
            .filter(|(_, region)| region.mapping.is_some())
            .map(|(_, region)| region.size)
            .sum();
        tables_ok && mapped_sum == self.mapped_bytes
    }

    // ---- internal ----

    fn allocate_heap(&mut self, size: Size) -> AllocResult<Allocation> {
        let mut buf = Vec::new();
        if buf.try_reserve_exact(size).is_err() {
            error!(
                "OOM: heap fallback failed for {} bytes ({} bytes allocated)",
                size, self.allocated_bytes
            );
            return Err(AllocError::OutOfMemory {
                requested: size,
                allocated: self.allocated_bytes,
            });
        }
        buf.resize(size, 0);

        self.allocated_bytes += size;
        debug!("Allocated {} bytes on the heap", size);
        Ok(Allocation::new(
            AllocKind::Heap {
                buf: buf.into_boxed_slice(),
                subs: Arc::new(AtomicU32::new(0)),
            },
            size,
        ))
    }

    fn allocate_file_backed(&mut self, size: Size) -> AllocResult<Allocation> {
        // A request so large that page rounding would wrap cannot be
        // satisfied by any region; fail this path and let allocate()
        // fall through to the heap, where try_reserve reports OOM.
        let need = round_up_to_page(size, self.config.page_size)
            .ok_or(AllocError::NoFittingRegion { requested: size })?;
        let (file, region) = self.claim_region(need)?;

        // Guarantee the result is logically zero before return: map
        // once, zero, mark, and leave the transient mapping unlocked.
        let zero_filled = self.files[file].regions.get(region).unwrap().zero_filled;
        if !zero_filled {
            if let Err(e) = self.ensure_mapped(file, region) {
                self.files[file].regions.release_region(region);
                return Err(e);
            }
            self.files[file].zero_region(region);
        }

        self.allocated_bytes += need;
        debug!(
            "Allocated {} bytes file-backed (file {}, {} bytes requested)",
            need, file, size
        );
        Ok(Allocation::new(AllocKind::FileBacked { file, region }, need))
    }

    /// Best-fit scan of all files' free lists; creates a new backing
    /// file when nothing fits
    fn claim_region(&mut self, need: Size) -> AllocResult<(FileIndex, RegionId)> {
        let mut best: Option<(FileIndex, RegionId, Size)> = None;
        for (file_index, file) in self.files.iter().enumerate() {
            if let Some((id, region_size)) = file.regions.best_fit(need) {
                if best.map_or(true, |(_, _, best_size)| region_size < best_size) {
                    best = Some((file_index, id, region_size));
                }
            }
        }

        let (file_index, id) = match best {
            Some((file_index, id, _)) => (file_index, id),
            None => {
                let file_index = self.create_file(need)?;
                let (id, _) = self.files[file_index]
                    .regions
                    .best_fit(need)
                    .ok_or(AllocError::NoFittingRegion { requested: need })?;
                (file_index, id)
            }
        };

        let claimed = self.files[file_index].regions.claim(id, need);
        Ok((file_index, claimed))
    }

    fn create_file(&mut self, min_size: Size) -> AllocResult<FileIndex> {
        if self.files.len() >= self.config.max_files {
            warn!(
                "Backing file limit reached ({} files), not creating another",
                self.files.len()
            );
            return Err(AllocError::FileLimitReached {
                count: self.files.len(),
                max: self.config.max_files,
            });
        }

        let size = round_up_to_page(
            min_size.max(self.config.min_file_size),
            self.config.page_size,
        )
        .ok_or(AllocError::NoFittingRegion { requested: min_size })?;
        let file = BackingFile::create(size)?;
        self.files.push(file);
        Ok(self.files.len() - 1)
    }

    /// Map (if needed), lock, and resolve a region pointer
    fn lock_region(
        &mut self,
        file: FileIndex,
        region: RegionId,
        offset: ByteOffset,
    ) -> AllocResult<NonNull<u8>> {
        self.ensure_mapped(file, region)?;

        let locked_bytes = &mut self.locked_bytes;
        let entry = self.files[file].regions.get_mut(region).unwrap();
        if entry.locks == 0 {
            *locked_bytes += entry.size;
        }
        entry.locks += 1;
        entry.state = RegionState::LockedMapped;
        entry.weak_unlocks = 0;
        // The caller may write through the pointer
        entry.zero_filled = false;

        let base = entry.mapping.as_mut().unwrap().as_mut_ptr();
        // SAFETY: mapping base is non-null and offset is within the
        // region (trusted-caller contract for sub-allocations)
        Ok(unsafe { NonNull::new_unchecked(base.add(offset)) })
    }

    /// Decrement a region's lock count; at zero, move it to the weak or
    /// normal eviction candidate state
    pub(super) fn release_lock(&mut self, file: FileIndex, region: RegionId, weak: bool) {
        let locked_bytes = &mut self.locked_bytes;
        let Some(entry) = self.files[file].regions.get_mut(region) else {
            error!("Release of unknown region {} in file {}", region, file);
            return;
        };

        debug_assert!(entry.locks > 0, "lock count underflow");
        if entry.locks == 0 {
            error!("Lock underflow on region at offset {}", entry.offset);
            return;
        }

        entry.locks -= 1;
        if entry.locks == 0 {
            *locked_bytes -= entry.size;
            if weak {
                entry.state = RegionState::WeakUnlockedMapped;
                entry.weak_unlocks += 1;
            } else {
                entry.state = RegionState::UnlockedMapped;
            }
        }
    }

    /// Perform the real release transitions for an allocation. Used by
    /// both the owner-thread free path and the deferred-queue drain.
    pub(super) fn free_now(&mut self, alloc: Allocation) {
        match alloc.kind {
            AllocKind::FileBacked { file, region } => {
                self.release_file_region(file, region, alloc.size);
            }
            AllocKind::SubFileBacked { file, region, .. } => {
                if let Some(entry) = self.files[file].regions.get_mut(region) {
                    debug_assert!(entry.suballocs > 0, "sub-allocation count underflow");
                    entry.suballocs = entry.suballocs.saturating_sub(1);
                } else {
                    error!("Sub-allocation freed after its parent's region");
                }
            }
            AllocKind::Heap { buf, subs } => {
                debug_assert_eq!(
                    subs.load(Ordering::Acquire),
                    0,
                    "freeing a heap parent with live sub-allocations"
                );
                self.allocated_bytes -= buf.len();
                debug!("Released {} heap bytes", buf.len());
            }
            AllocKind::SubHeap { subs, .. } => {
                let prior = subs.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(prior > 0, "sub-allocation count underflow");
            }
            AllocKind::External { .. } => {}
        }
    }

    fn release_file_region(&mut self, file: FileIndex, region: RegionId, size: Size) {
        let (suballocs, locks, mapped, zero_filled, region_size) = {
            let entry = self.files[file].regions.get(region).unwrap();
            (
                entry.suballocs,
                entry.locks,
                entry.mapping.is_some(),
                entry.zero_filled,
                entry.size,
            )
        };

        debug_assert_eq!(suballocs, 0, "freeing a parent with live sub-allocations");
        if suballocs > 0 {
            error!(
                "Region in file {} freed with {} live sub-allocations; leaking it",
                file, suballocs
            );
            return;
        }

        // Owner-thread frees fully unlock
        if locks > 0 {
            self.locked_bytes -= region_size;
            self.files[file].regions.get_mut(region).unwrap().locks = 0;
        }

        if mapped {
            // Zero while the pages are hot so the next claim skips it
            if !zero_filled {
                self.files[file].zero_region(region);
            }
            let unmapped = self.files[file].unmap_region(region);
            self.mapped_bytes -= unmapped;
        }

        self.files[file].regions.release_region(region);
        self.allocated_bytes -= size;

        let delayed_before = self.delayed.len();
        self.delayed
            .retain(|entry| entry.target != (file, region));
        if self.delayed.len() != delayed_before {
            debug!("Dropped pending delayed release for freed region");
        }

        debug!("Freed {} file-backed bytes (file {})", size, file);
    }
}

impl Drop for BackingAllocator {
    fn drop(&mut self) {
        self.drain_deferred();

        let mut leaked = 0;
        let mut locked = 0;
        for file in &self.files {
            for (_, region) in file.regions.iter() {
                match region.state {
                    RegionState::Free => {}
                    RegionState::LockedMapped => locked += 1,
                    _ => leaked += 1,
                }
            }
        }

        debug_assert_eq!(locked, 0, "allocator dropped with locked allocations");
        if locked > 0 {
            error!("Allocator dropped with {} locked regions", locked);
        }
        if leaked > 0 {
            warn!("Allocator dropped with {} unfreed regions", leaked);
        }
        let file_bytes: Size = self.files.iter().map(|file| file.size()).sum();
        info!(
            "Backing-store allocator shut down ({} files, {} file bytes, {} bytes still allocated)",
            self.files.len(),
            file_bytes,
            self.allocated_bytes
        );
    }
}
