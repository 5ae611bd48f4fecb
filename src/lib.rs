/*!
 * Backing-Store Allocator Library
 *
 * Free-list allocation of large byte ranges over anonymous, shared,
 * memory-backed files, with on-demand mapping, ceiling-driven eviction,
 * and a deferred-release queue for worker threads. Built for holding
 * system-memory mirrors of GPU-visible objects without exhausting
 * process address space on constrained targets.
 */

pub mod alloc;
pub mod core;

// Re-exports
pub use crate::alloc::{
    AllocError, AllocResult, AllocStats, Allocation, BackingAllocator, CompletionFence, Config,
    WorkerQueue,
};
pub use crate::core::types::{ByteOffset, Size};
