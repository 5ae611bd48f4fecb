/*!
 * Allocator Types
 * Errors, configuration, and statistics for the backing-store allocator
 */

use crate::core::types::{
    Size, DEFAULT_MAX_FILES, DEFAULT_MIN_FILE_SIZE, DEFAULT_PAGE_SIZE,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Allocator operation result
pub type AllocResult<T> = Result<T, AllocError>;

/// Allocator errors
///
/// Capacity exhaustion is always recoverable (callers fall back to the
/// heap); only a failed heap fallback surfaces as `OutOfMemory`.
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("Out of memory: requested {requested} bytes, {allocated} bytes already allocated")]
    OutOfMemory { requested: Size, allocated: Size },

    #[error("No backing-file region fits {requested} bytes")]
    NoFittingRegion { requested: Size },

    #[error("Backing file limit reached ({count} of {max})")]
    FileLimitReached { count: usize, max: usize },

    #[error("Backing file creation failed: {0}")]
    FileCreationFailed(#[source] std::io::Error),

    #[error("Mapping failed for {size} bytes at offset {offset}: {source}")]
    MapFailed {
        offset: Size,
        size: Size,
        #[source]
        source: std::io::Error,
    },
}

/// Hook invoked when reclamation alone cannot satisfy a mapping.
/// Forces outstanding asynchronous work (e.g. pending uploads holding
/// region locks) to completion; the one blocking cross-subsystem call.
pub type CompletionFence = Box<dyn FnMut() + Send>;

/// Allocator configuration
///
/// `ceiling` is a soft target for total mapped bytes across all backing
/// files; `None` disables file-backed mode entirely (pure heap).
pub struct Config {
    pub ceiling: Option<Size>,
    pub page_size: Size,
    pub min_file_size: Size,
    pub max_files: usize,
    pub(crate) completion_fence: Option<CompletionFence>,
}

impl Config {
    /// Configuration from a mapped-byte ceiling in megabytes.
    /// A negative ceiling disables file-backed mode, matching the
    /// collaborator-facing `create(ceiling_mb)` contract.
    pub fn with_ceiling_mb(ceiling_mb: i64) -> Self {
        let ceiling = if ceiling_mb < 0 {
            None
        } else {
            Some(ceiling_mb as Size * 1024 * 1024)
        };
        Self {
            ceiling,
            ..Self::default()
        }
    }

    /// Exact byte ceiling (useful for tests with tiny budgets)
    pub fn with_ceiling_bytes(ceiling: Size) -> Self {
        Self {
            ceiling: Some(ceiling),
            ..Self::default()
        }
    }

    pub fn page_size(mut self, page_size: Size) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        self.page_size = page_size;
        self
    }

    pub fn min_file_size(mut self, min_file_size: Size) -> Self {
        self.min_file_size = min_file_size;
        self
    }

    pub fn max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    /// Install the completion fence invoked by the last-resort reclaim pass
    pub fn completion_fence(mut self, fence: CompletionFence) -> Self {
        self.completion_fence = Some(fence);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ceiling: None,
            page_size: DEFAULT_PAGE_SIZE,
            min_file_size: DEFAULT_MIN_FILE_SIZE,
            max_files: DEFAULT_MAX_FILES,
            completion_fence: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("ceiling", &self.ceiling)
            .field("page_size", &self.page_size)
            .field("min_file_size", &self.min_file_size)
            .field("max_files", &self.max_files)
            .field("completion_fence", &self.completion_fence.is_some())
            .finish()
    }
}

/// Allocator statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocStats {
    pub allocated_bytes: Size,
    pub locked_bytes: Size,
    pub mapped_bytes: Size,
    pub mapped_ceiling: Option<Size>,
    pub file_count: usize,
    pub free_regions: usize,
    pub allocated_regions: usize,
    pub mapped_regions: usize,
}
