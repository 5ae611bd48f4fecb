/*!
 * Backing File
 * Anonymous shared memory-backed file subdivided into tracked regions
 */

use super::region::{RegionState, RegionTable};
use super::types::{AllocError, AllocResult};
use crate::core::types::{RegionId, Size};
use log::{debug, info};
use memmap2::MmapOptions;
use std::fs::File;
use std::os::fd::AsRawFd;

/// One anonymous backing file and its region table
///
/// The file is created unlinked and sized once at creation; it exists
/// only for the process lifetime and never reaches persistent storage
/// under normal tmp configurations. Region contents persist in the file
/// across unmap/remap cycles, which is what makes eviction safe.
#[derive(Debug)]
pub(crate) struct BackingFile {
    file: File,
    size: Size,
    pub regions: RegionTable,
    /// Fault injection: fail this many map calls before succeeding
    #[cfg(test)]
    pub fail_next_maps: u32,
}

impl BackingFile {
    /// Create and size an anonymous file, seeding one all-free,
    /// zero-filled region. Any OS failure is non-fatal for callers,
    /// which fall back to the heap.
    pub fn create(size: Size) -> AllocResult<Self> {
        let file = tempfile::tempfile().map_err(AllocError::FileCreationFailed)?;

        let len = libc::off_t::try_from(size).map_err(|_| {
            AllocError::FileCreationFailed(std::io::Error::from(std::io::ErrorKind::InvalidInput))
        })?;
        // SAFETY: ftruncate on a freshly created anonymous file
        let rc = unsafe { libc::ftruncate(file.as_raw_fd(), len) };
        if rc != 0 {
            return Err(AllocError::FileCreationFailed(
                std::io::Error::last_os_error(),
            ));
        }

        info!("Created backing file ({} bytes)", size);
        Ok(Self {
            file,
            size,
            regions: RegionTable::new(size),
            #[cfg(test)]
            fail_next_maps: 0,
        })
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Map region `id` into the address space. The new mapping starts
    /// unlocked; lock accounting is the manager's concern. Returns the
    /// mapped size for budget bookkeeping.
    pub fn map_region(&mut self, id: RegionId) -> AllocResult<Size> {
        let region = self.regions.get_mut(id).unwrap();
        debug_assert!(region.mapping.is_none(), "region already mapped");

        #[cfg(test)]
        if self.fail_next_maps > 0 {
            self.fail_next_maps -= 1;
            return Err(AllocError::MapFailed {
                offset: region.offset,
                size: region.size,
                source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
            });
        }

        // SAFETY: mapping a range of a file exclusively owned by this
        // allocator; nothing else writes through the fd.
        let mapping = unsafe {
            MmapOptions::new()
                .offset(region.offset as u64)
                .len(region.size)
                .map_mut(&self.file)
        }
        .map_err(|e| AllocError::MapFailed {
            offset: region.offset,
            size: region.size,
            source: e,
        })?;

        debug!(
            "Mapped region at offset {} ({} bytes)",
            region.offset, region.size
        );
        region.mapping = Some(mapping);
        region.state = RegionState::UnlockedMapped;
        Ok(region.size)
    }

    /// Drop region `id`'s mapping, returning its size. Contents remain
    /// in the backing file; the region moves back to the allocated,
    /// unmapped state.
    pub fn unmap_region(&mut self, id: RegionId) -> Size {
        let region = self.regions.get_mut(id).unwrap();
        debug_assert!(region.mapping.is_some(), "region not mapped");
        debug_assert_eq!(region.locks, 0, "unmap of locked region");

        region.mapping = None;
        region.state = RegionState::Allocated;
        region.weak_unlocks = 0;
        debug!(
            "Unmapped region at offset {} ({} bytes)",
            region.offset, region.size
        );
        region.size
    }

    /// Zero a mapped region in place and mark it known-zero. Cheap while
    /// its pages are hot; saves a re-zero on the next claim.
    pub fn zero_region(&mut self, id: RegionId) {
        let region = self.regions.get_mut(id).unwrap();
        let mapping = region
            .mapping
            .as_mut()
            .expect("zero_region requires a mapped region");
        mapping.fill(0);
        region.zero_filled = true;
    }
}
