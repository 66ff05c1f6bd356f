// SPDX-FileCopyrightText:  2022-2023 xvanc and contributors
// SPDX-License-Identifier: BSD-3-Clause

use super::{MemoryKind, MemoryMap};
use alloc::collections::BTreeMap;
use core::fmt;

/// An inclusive range of physical addresses
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PhysRegion {
    pub start: u64,
    pub end: u64,
}

impl fmt::Debug for PhysRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PhysRegion {{ start: {:#x}, end: {:#x} }}", self.start, self.end)
    }
}

impl PhysRegion {
    pub const fn new(start: u64, end: u64) -> PhysRegion {
        Self { start, end }
    }

    /// Returns the size of the region, or `None` if it spans the entire 64-bit space
    pub const fn size(self) -> Option<u64> {
        (self.end - self.start).checked_add(1)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub const fn overlaps_with(self, other: Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

fn pow2_align_up(x: u64, align: u64) -> Option<u64> {
    Some(x.checked_add(align - 1)? & !(align - 1))
}

/// Free-space tracker for the physical address space
///
/// Free space is kept as a set of disjoint intervals ordered by address. Allocation
/// carves pieces out of them, nothing is ever handed out twice.
pub struct PhysSpace {
    /// start -> end (inclusive)
    free: BTreeMap<u64, u64>,
}

impl PhysSpace {
    /// Create a space where `[0, max_addr]` is entirely free
    pub fn new(max_addr: u64) -> PhysSpace {
        let mut free = BTreeMap::new();
        free.insert(0, max_addr);
        Self { free }
    }

    /// Create a space with nothing free
    pub const fn empty() -> PhysSpace {
        Self {
            free: BTreeMap::new(),
        }
    }

    /// Withhold everything `map` reports as occupied
    ///
    /// Only [`MemoryKind::Io`] regions stay available for device apertures.
    pub fn seed(&mut self, map: &dyn MemoryMap) {
        for region in map.regions() {
            if region.kind == MemoryKind::Io {
                continue;
            }
            log::debug!(
                "phys: reserving {:#018x}-{:#018x} ({:?})",
                region.start,
                region.end,
                region.kind
            );
            self.reserve(PhysRegion::new(region.start, region.end));
        }
    }

    /// Returns the number of free intervals
    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Returns an iterator over all free intervals in address order
    pub fn entries(&self) -> impl Iterator<Item = PhysRegion> + '_ {
        self.free.iter().map(|(&start, &end)| PhysRegion { start, end })
    }

    // The free interval overlapping `range`, if any. The set is disjoint, so only the
    // last interval starting at or below `range.end` can overlap.
    fn overlapping(&self, range: PhysRegion) -> Option<PhysRegion> {
        let (&start, &end) = self.free.range(..=range.end).next_back()?;
        (end >= range.start).then_some(PhysRegion { start, end })
    }

    /// Remove `range` from the free set
    ///
    /// Returns `true` if any part of `range` was free.
    pub fn reserve(&mut self, range: PhysRegion) -> bool {
        let mut reserved = false;

        while let Some(region) = self.overlapping(range) {
            reserved = true;

            match (region.start >= range.start, region.end <= range.end) {
                // Entirely covered, drop it.
                (true, true) => {
                    self.free.remove(&region.start);
                }
                // Covers the low end, move the start up.
                (true, false) => {
                    self.free.remove(&region.start);
                    self.free.insert(range.end + 1, region.end);
                }
                // Covers the high end, move the end down.
                (false, true) => {
                    self.free.insert(region.start, range.start - 1);
                }
                // Strictly inside, split in two.
                (false, false) => {
                    self.free.insert(region.start, range.start - 1);
                    self.free.insert(range.end + 1, region.end);
                }
            }
        }

        reserved
    }

    /// Reserve exactly `range`, which must be entirely free
    pub fn alloc_range(&mut self, range: PhysRegion) -> bool {
        match self.overlapping(range) {
            Some(region) if region.contains(range) => self.reserve(range),
            _ => false,
        }
    }

    /// Allocate `size` bytes aligned to `align`, which must be a power of two
    pub fn alloc(&mut self, size: u64, align: u64) -> Option<PhysRegion> {
        self.alloc_below(size, align, u64::MAX)
    }

    /// Allocate `size` bytes aligned to `align` ending at or below `limit`
    pub fn alloc_below(&mut self, size: u64, align: u64, limit: u64) -> Option<PhysRegion> {
        debug_assert!(align.is_power_of_two());

        if size == 0 {
            return None;
        }

        let found = self
            .entries()
            .take_while(|region| region.start <= limit)
            .find_map(|region| {
                let start = pow2_align_up(region.start, align)?;
                let end = start.checked_add(size - 1)?;
                (end <= region.end && end <= limit).then_some(PhysRegion { start, end })
            })?;

        self.reserve(found);
        Some(found)
    }

    /// Return `range` to the free set, merging it with adjacent intervals
    ///
    /// Returns `false` without changing anything if part of `range` is already free.
    pub fn free(&mut self, range: PhysRegion) -> bool {
        if range.start > range.end || self.overlapping(range).is_some() {
            return false;
        }

        let mut start = range.start;
        let mut end = range.end;

        if let Some((&prev_start, &prev_end)) = self.free.range(..start).next_back() {
            if prev_end.checked_add(1) == Some(start) {
                self.free.remove(&prev_start);
                start = prev_start;
            }
        }

        if let Some(next_start) = end.checked_add(1) {
            if let Some(next_end) = self.free.remove(&next_start) {
                end = next_end;
            }
        }

        self.free.insert(start, end);
        true
    }
}

impl fmt::Debug for PhysSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.entries()).finish()
    }
}
