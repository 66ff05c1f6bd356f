/*
 * Copyright (c) 2022-2023 xvanc and contributors
 * SPDX-License-Identifier: BSD-3-Clause
 */

mod memory_map;
mod phys_space;

pub use memory_map::{MemoryKind, MemoryMap, MemoryRegion};
pub use phys_space::{PhysRegion, PhysSpace};

use core::ops::RangeInclusive;

pub const PAGE_SIZE: u64 = 0x1000;

/// Highest physical address representable with `bits` address lines
pub const fn max_phys_addr(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1 << bits) - 1
    }
}

/// Build the physical address space handed out to MMIO resources
///
/// Everything the memory map reports as occupied, plus `extra`, is withheld.
pub fn init_phys_space(
    bits: u32,
    map: &dyn MemoryMap,
    extra: &[RangeInclusive<u64>],
) -> PhysSpace {
    let mut space = PhysSpace::new(max_phys_addr(bits));
    space.seed(map);

    for range in extra {
        space.reserve(PhysRegion::new(*range.start(), *range.end()));
    }

    space
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn seeding_withholds_ram_but_not_io() {
        let map = vec![
            MemoryRegion::new(0x0, 0x9_ffff, MemoryKind::Ram),
            MemoryRegion::new(0xa_0000, 0xb_ffff, MemoryKind::Io),
            MemoryRegion::new(0xe_0000, 0xf_ffff, MemoryKind::Firmware),
            MemoryRegion::new(0x10_0000, 0x7fff_ffff, MemoryKind::Ram),
        ];
        let space = init_phys_space(32, &map, &[0xfee0_0000..=0xfee0_0fff]);

        let free: alloc::vec::Vec<_> = space.entries().collect();
        assert_eq!(
            free,
            vec![
                PhysRegion::new(0xa_0000, 0xd_ffff),
                PhysRegion::new(0x8000_0000, 0xfedf_ffff),
                PhysRegion::new(0xfee0_1000, 0xffff_ffff),
            ]
        );
    }

    #[test]
    fn address_width() {
        assert_eq!(max_phys_addr(32), 0xffff_ffff);
        assert_eq!(max_phys_addr(64), u64::MAX);
    }
}
