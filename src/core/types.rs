/*!
 * Core Types
 * Common types used across the allocator
 */

/// Size type for byte counts
pub type Size = usize;

/// Byte offset within a backing file
pub type ByteOffset = usize;

/// Index of a backing file in the allocator's file table
pub type FileIndex = usize;

/// Identifier of a region within a backing file
pub type RegionId = u32;

/// Default page size used for rounding region sizes
pub const DEFAULT_PAGE_SIZE: Size = 4096;

/// Default minimum size of a freshly created backing file (100 MB)
pub const DEFAULT_MIN_FILE_SIZE: Size = 100 * 1024 * 1024;

/// Default bound on the number of backing files
pub const DEFAULT_MAX_FILES: usize = 64;

/// Round `size` up to a multiple of `page`. `page` must be a power of
/// two. `None` when the rounded size would not fit in `Size`; callers
/// treat that the same as a request nothing can satisfy.
pub const fn round_up_to_page(size: Size, page: Size) -> Option<Size> {
    debug_assert!(page.is_power_of_two());
    match size.checked_add(page - 1) {
        Some(padded) => Some(padded & !(page - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_to_page() {
        assert_eq!(round_up_to_page(0, 4096), Some(0));
        assert_eq!(round_up_to_page(1, 4096), Some(4096));
        assert_eq!(round_up_to_page(4096, 4096), Some(4096));
        assert_eq!(round_up_to_page(4097, 4096), Some(8192));
        assert_eq!(round_up_to_page(100, 1024), Some(1024));
    }

    #[test]
    fn test_round_up_near_max_does_not_wrap() {
        assert_eq!(round_up_to_page(usize::MAX - 10, 4096), None);
        assert_eq!(round_up_to_page(usize::MAX, 4096), None);
        // The largest page-aligned size still rounds to itself
        let top = usize::MAX & !(4096 - 1);
        assert_eq!(round_up_to_page(top, 4096), Some(top));
    }
}
