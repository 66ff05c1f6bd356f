/*
 * Copyright (c) 2023 xvanc and contributors
 * SPDX-License-Identifier: BSD-3-Clause
 */

use alloc::{boxed::Box, vec::Vec};
use core::fmt;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MemoryKind {
    /// System memory
    Ram,
    Reserved,
    /// Claimed by firmware tables or runtime services
    Firmware,
    /// Address space not backed by memory, free for device apertures
    Io,
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct MemoryRegion {
    pub start: u64,
    /// Inclusive
    pub end: u64,
    pub kind: MemoryKind,
}

impl MemoryRegion {
    pub const fn new(start: u64, end: u64, kind: MemoryKind) -> MemoryRegion {
        Self { start, end, kind }
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "MemoryRegion {{ start: {:#x}, end: {:#x}, kind: {:?} }}",
            self.start, self.end, self.kind,
        )
    }
}

/// Source of the platform's physical memory layout
///
/// Consumed once, when the physical address space allocator is built.
pub trait MemoryMap {
    fn regions(&self) -> Box<dyn Iterator<Item = MemoryRegion> + '_>;
}

impl MemoryMap for [MemoryRegion] {
    fn regions(&self) -> Box<dyn Iterator<Item = MemoryRegion> + '_> {
        Box::new(self.iter().copied())
    }
}

impl MemoryMap for Vec<MemoryRegion> {
    fn regions(&self) -> Box<dyn Iterator<Item = MemoryRegion> + '_> {
        self.as_slice().regions()
    }
}
