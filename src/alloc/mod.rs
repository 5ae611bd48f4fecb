/*!
 * Allocator Module
 * Backing-store allocation over anonymous shared files
 */

mod deferred;
mod file;
mod handle;
mod manager;
mod reclaim;
mod region;
mod types;

// Re-export for convenience
pub use deferred::WorkerQueue;
pub use handle::Allocation;
pub use manager::BackingAllocator;
pub use types::{AllocError, AllocResult, AllocStats, CompletionFence, Config};
