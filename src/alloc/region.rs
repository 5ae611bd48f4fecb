/*!
 * Region Tracking
 * Offset-sorted, auto-coalescing region bookkeeping for one backing file
 */

use crate::core::types::{ByteOffset, RegionId, Size};
use log::debug;
use memmap2::MmapMut;
use std::collections::{BTreeMap, HashMap};

/// Region lifecycle states
///
/// FREE -> ALLOCATED -> LOCKED_MAPPED -> {UNLOCKED_MAPPED | WEAK_UNLOCKED_MAPPED}
/// -> LOCKED_MAPPED (reacquire) or ALLOCATED (reclaimed) -> FREE.
/// Only LOCKED_MAPPED forbids reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegionState {
    /// Available for claiming; always unmapped
    Free,
    /// Claimed by an allocation, not currently mapped
    Allocated,
    /// Mapped with at least one outstanding lock
    LockedMapped,
    /// Mapped, zero locks, normal eviction candidate
    UnlockedMapped,
    /// Mapped, zero locks, reuse expected soon (soft eviction candidate)
    WeakUnlockedMapped,
}

impl RegionState {
    pub fn is_mapped(self) -> bool {
        matches!(
            self,
            RegionState::LockedMapped | RegionState::UnlockedMapped | RegionState::WeakUnlockedMapped
        )
    }
}

/// A tracked byte range within a backing file
///
/// The mapping is `Some` iff the region is in a mapped state; the bytes
/// themselves persist in the backing file across unmap/remap cycles.
#[derive(Debug)]
pub(crate) struct Region {
    pub offset: ByteOffset,
    pub size: Size,
    pub state: RegionState,
    pub mapping: Option<MmapMut>,
    pub locks: u32,
    pub weak_unlocks: u32,
    pub zero_filled: bool,
    /// Live sub-allocations sharing this region (ownership tracking)
    pub suballocs: u32,
}

impl Region {
    fn free(offset: ByteOffset, size: Size, zero_filled: bool) -> Self {
        Self {
            offset,
            size,
            state: RegionState::Free,
            mapping: None,
            locks: 0,
            weak_unlocks: 0,
            zero_filled,
            suballocs: 0,
        }
    }
}

/// Region table for one backing file
///
/// Free regions are indexed by offset in a `BTreeMap`, which keeps them
/// sorted and makes neighbour lookup for coalescing O(log n). Two
/// adjacent free regions never coexist: `release_region` always merges.
#[derive(Debug, Default)]
pub(crate) struct RegionTable {
    regions: HashMap<RegionId, Region>,
    free_by_offset: BTreeMap<ByteOffset, RegionId>,
    next_id: RegionId,
    total: Size,
}

impl RegionTable {
    /// Seed the table with one all-free, zero-filled region covering the file
    pub fn new(total: Size) -> Self {
        let mut table = Self {
            regions: HashMap::new(),
            free_by_offset: BTreeMap::new(),
            next_id: 0,
            total,
        };
        let id = table.insert(Region::free(0, total, true));
        table.free_by_offset.insert(0, id);
        table
    }

    fn insert(&mut self, region: Region) -> RegionId {
        let id = self.next_id;
        self.next_id += 1;
        self.regions.insert(id, region);
        id
    }

    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(&id)
    }

    pub fn get_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.regions.get_mut(&id)
    }

    /// Smallest free region that fits `size`, if any
    pub fn best_fit(&self, size: Size) -> Option<(RegionId, Size)> {
        self.free_by_offset
            .values()
            .filter_map(|&id| {
                let region = &self.regions[&id];
                (region.size >= size).then_some((id, region.size))
            })
            .min_by_key(|&(_, region_size)| region_size)
    }

    /// Claim `size` bytes from free region `id`, splitting off the
    /// remainder as a new free region. `size` must already be
    /// page-rounded and fit within the region.
    pub fn claim(&mut self, id: RegionId, size: Size) -> RegionId {
        let (offset, region_size, zero_filled) = {
            let region = &self.regions[&id];
            debug_assert_eq!(region.state, RegionState::Free, "claim of non-free region");
            debug_assert!(region.size >= size);
            (region.offset, region.size, region.zero_filled)
        };

        self.free_by_offset.remove(&offset);

        if region_size > size {
            let remainder = Region::free(offset + size, region_size - size, zero_filled);
            let remainder_id = self.insert(remainder);
            self.free_by_offset.insert(offset + size, remainder_id);
            debug!(
                "Split region at offset {}: claimed {} bytes, {} bytes remain free",
                offset,
                size,
                region_size - size
            );
        }

        let region = self.regions.get_mut(&id).unwrap();
        region.size = size;
        region.state = RegionState::Allocated;
        id
    }

    /// Return region `id` to the free list, merging with adjacent free
    /// neighbours. The region must already be unmapped. The merged
    /// region is zero-filled only if every merged part was.
    pub fn release_region(&mut self, id: RegionId) {
        let (mut offset, mut size, mut zero_filled) = {
            let region = self.regions.get_mut(&id).unwrap();
            debug_assert!(region.mapping.is_none(), "release of mapped region");
            debug_assert_ne!(region.state, RegionState::Free, "double release of region");
            (region.offset, region.size, region.zero_filled)
        };
        self.regions.remove(&id);

        // Merge with left neighbour if directly adjacent
        if let Some((&left_offset, &left_id)) = self.free_by_offset.range(..offset).next_back() {
            let left = &self.regions[&left_id];
            if left_offset + left.size == offset {
                zero_filled &= left.zero_filled;
                offset = left_offset;
                size += left.size;
                self.free_by_offset.remove(&left_offset);
                self.regions.remove(&left_id);
                debug!("Coalesced with left neighbour at offset {}", left_offset);
            }
        }

        // Merge with right neighbour if directly adjacent
        let right_offset = offset + size;
        if let Some(&right_id) = self.free_by_offset.get(&right_offset) {
            let right = &self.regions[&right_id];
            zero_filled &= right.zero_filled;
            size += right.size;
            self.free_by_offset.remove(&right_offset);
            self.regions.remove(&right_id);
            debug!("Coalesced with right neighbour at offset {}", right_offset);
        }

        let merged = self.insert(Region::free(offset, size, zero_filled));
        self.free_by_offset.insert(offset, merged);
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegionId, &Region)> {
        self.regions.iter().map(|(&id, region)| (id, region))
    }

    /// Region ids currently in `state`
    pub fn ids_in_state(&self, state: RegionState) -> Vec<RegionId> {
        let mut ids: Vec<RegionId> = self
            .regions
            .iter()
            .filter(|(_, region)| region.state == state)
            .map(|(&id, _)| id)
            .collect();
        // Deterministic eviction order
        ids.sort_by_key(|id| self.regions[id].offset);
        ids
    }

    pub fn free_count(&self) -> usize {
        self.free_by_offset.len()
    }

    /// Invariant check: regions partition the file and no two adjacent
    /// free regions coexist
    pub fn verify_integrity(&self) -> bool {
        let byte_sum: Size = self.regions.values().map(|region| region.size).sum();
        if byte_sum != self.total {
            return false;
        }

        let mut previous_end: Option<ByteOffset> = None;
        for (&offset, &id) in &self.free_by_offset {
            let region = &self.regions[&id];
            if region.state != RegionState::Free || region.offset != offset {
                return false;
            }
            if previous_end == Some(offset) {
                // Adjacent free regions should have been merged
                return false;
            }
            previous_end = Some(offset + region.size);
        }

        self.regions.values().all(|region| {
            let mapping_matches = region.mapping.is_some() == region.state.is_mapped();
            // A stale weak hint would distort eviction ordering
            let weak_hint_matches =
                region.weak_unlocks == 0 || region.state == RegionState::WeakUnlockedMapped;
            mapping_matches && weak_hint_matches
        })
    }
}
