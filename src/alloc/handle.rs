/*!
 * Allocation Handle
 * Tagged handle over the four allocation kinds
 */

use crate::core::types::{ByteOffset, FileIndex, RegionId, Size};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

/// Storage backing an allocation handle
///
/// Dispatch is by tag; the heap and external paths never touch the
/// file-backed machinery.
#[derive(Debug)]
pub(crate) enum AllocKind {
    /// Owns a region of a backing file
    FileBacked { file: FileIndex, region: RegionId },
    /// Shares a parent's region and mapping at a relative offset, with
    /// no lock count of its own
    SubFileBacked {
        file: FileIndex,
        region: RegionId,
        offset: ByteOffset,
    },
    /// Plain heap block (sub-page requests and fallback path)
    Heap {
        buf: Box<[u8]>,
        /// Live sub-allocation count, for ownership checking
        subs: Arc<AtomicU32>,
    },
    /// Offset wrapper into a heap parent's buffer
    SubHeap {
        ptr: NonNull<u8>,
        subs: Arc<AtomicU32>,
    },
    /// Non-owned external pointer; free is a no-op
    External { ptr: NonNull<u8> },
}

/// Handle to storage obtained from a [`BackingAllocator`](super::BackingAllocator)
///
/// Owned by its creator until passed back to `free` (owner thread) or
/// `free_from_worker` (any thread). Dropping a file-backed handle
/// without freeing it leaks its region until the allocator itself is
/// dropped.
#[derive(Debug)]
pub struct Allocation {
    pub(crate) kind: AllocKind,
    pub(crate) size: Size,
}

// SAFETY: the handle is inert data. The raw pointers in SubHeap and
// External are only dereferenced through owner-thread calls; the handle
// itself may move across threads (free_from_worker).
unsafe impl Send for Allocation {}

impl Allocation {
    pub(crate) fn new(kind: AllocKind, size: Size) -> Self {
        Self { kind, size }
    }

    /// Logical size in bytes (0 for external wrappers)
    pub fn size(&self) -> Size {
        self.size
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(
            self.kind,
            AllocKind::FileBacked { .. } | AllocKind::SubFileBacked { .. }
        )
    }

    pub fn is_heap_backed(&self) -> bool {
        matches!(self.kind, AllocKind::Heap { .. } | AllocKind::SubHeap { .. })
    }

    pub fn is_external(&self) -> bool {
        matches!(self.kind, AllocKind::External { .. })
    }

    /// Region this handle locks and releases through, if file-backed
    pub(crate) fn region_target(&self) -> Option<(FileIndex, RegionId)> {
        match self.kind {
            AllocKind::FileBacked { file, region }
            | AllocKind::SubFileBacked { file, region, .. } => Some((file, region)),
            _ => None,
        }
    }
}
