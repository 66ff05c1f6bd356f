/*
 * Copyright (c) 2023 xvanc and contributors
 *
 * Redistribution and use in source and binary forms, with or without modification,
 * are permitted provided that the following conditions are met:
 *
 * 1. Redistributions of source code must retain the above copyright notice,
 *    this list of conditions and the following disclaimer.
 *
 * 2. Redistributions in binary form must reproduce the above copyright notice,
 *    this list of conditions and the following disclaimer in the documentation
 *    and/or other materials provided with the distribution.
 *
 * 3. Neither the name of the copyright holder nor the names of its contributors
 *    may be used to endorse or promote products derived from this software without
 *    specific prior written permission.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY
 * EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES
 * OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE DISCLAIMED.
 * IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT,
 * INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
 * PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS
 * INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
 * LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
 * OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
 *
 * SPDX-License-Identifier: BSD-3-Clause
 */

//! Resources and the spaces they are carved from
//!
//! A [`Resource`] is one contiguous, inclusive range of some resource type together
//! with a set of [`ResourceFlags`]. Resources that hand out sub-ranges to other
//! resources (root apertures, bridge windows, ...) own a [`ResourceSpace`].

mod space;

pub use space::{ProviderSpace, ResourceSpace};

use core::fmt;

pub type Addr = u64;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResourceType {
    Invalid,
    Irq,
    Mmio,
    Io,
    Bus,
    DmaDomain,
}

impl ResourceType {
    /// Types whose ranges must never overlap within one root
    pub const fn is_exclusive(self) -> bool {
        matches!(self, Self::Mmio | Self::Io | Self::Bus)
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Invalid => "INVALID",
            Self::Irq => "IRQ",
            Self::Mmio => "IOMEM",
            Self::Io => "IOPORT",
            Self::Bus => "BUS",
            Self::DmaDomain => "DMAD",
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct ResourceFlags : u32 {
        const DISABLED          = 1 << 8;
        /// The range is carved from a parent resource rather than fixed by the platform
        const HIERARCHICAL      = 1 << 9;
        const PREFETCHABLE      = 1 << 10;
        /// Alignment equals the size
        const SIZE_ALIGNED      = 1 << 11;
        const EMPTY             = 1 << 12;
        const ROM               = 1 << 13;
        const CAN_RESIZE        = 1 << 14;
        const CAN_MOVE          = 1 << 15;
        const WIDTH_64BIT       = 1 << 16;
        const CACHED_MEM        = 1 << 17;
        /// The range is an offset interpreted by the provider (e.g. an interrupt pin)
        const RELATIVE          = 1 << 18;
        const IRQ_LEVEL         = 1 << 20;
        const IRQ_LOW           = 1 << 21;
        const IRQ_BOTH_EDGES    = 1 << 22;
    }
}

/// A four character tag naming a resource within its device, e.g. `BAR0`
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct ResTag(u32);

impl ResTag {
    pub const NONE: ResTag = ResTag(0);
    pub const ROM: ResTag = ResTag::new("ROM");
    pub const PIN: ResTag = ResTag::new("PIN");
    pub const IRQ_ROUTER: ResTag = ResTag::new("IRQR");
    pub const BUS: ResTag = ResTag::new("BUS");
    pub const DMA_DOMAIN: ResTag = ResTag::new("DMAD");

    /// Pack up to four ASCII characters, first character in the low byte
    pub const fn new(name: &str) -> ResTag {
        let bytes = name.as_bytes();
        assert!(bytes.len() <= 4, "resource tags are at most four characters");
        let mut value = 0u32;
        let mut i = 0;
        while i < bytes.len() {
            value |= (bytes[i] as u32) << (i * 8);
            i += 1;
        }
        ResTag(value)
    }

    pub const fn bar(index: u8) -> ResTag {
        ResTag(ResTag::new("BAR").0 | ((b'0' + index) as u32) << 24)
    }

    pub const fn window(index: u8) -> ResTag {
        ResTag(ResTag::new("WIN").0 | ((b'0' + index) as u32) << 24)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ResTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.to_le_bytes() {
            if byte == 0 {
                break;
            }
            write!(f, "{}", byte as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ResTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Handle of a resource in the device tree's resource arena
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResId(pub(crate) u32);

impl ResId {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub struct Resource {
    ty: ResourceType,
    flags: ResourceFlags,
    tag: ResTag,
    start: Addr,
    end: Addr,
    align: Addr,
    parent: Option<ResId>,
    pub(crate) space: Option<ResourceSpace>,
}

impl Resource {
    pub const fn new(ty: ResourceType, flags: ResourceFlags) -> Resource {
        Self {
            ty,
            flags,
            tag: ResTag::NONE,
            start: 0,
            end: 0,
            align: 0,
            parent: None,
            space: None,
        }
    }

    pub fn with_range(ty: ResourceType, flags: ResourceFlags, start: Addr, end: Addr) -> Resource {
        let mut r = Self::new(ty, flags);
        r.start_end(start, end);
        r
    }

    /// Attach `space`, making this resource a provider for others
    pub fn providing(mut self, space: ResourceSpace) -> Resource {
        self.space = Some(space);
        self
    }

    pub fn tagged(mut self, tag: ResTag) -> Resource {
        self.tag = tag;
        self
    }

    pub const fn ty(&self) -> ResourceType {
        self.ty
    }

    pub const fn flags(&self) -> ResourceFlags {
        self.flags
    }

    pub const fn tag(&self) -> ResTag {
        self.tag
    }

    pub const fn start(&self) -> Addr {
        self.start
    }

    pub const fn end(&self) -> Addr {
        self.end
    }

    /// Size of the range, wrapping to zero for a range spanning all 64 bits
    pub const fn size(&self) -> Addr {
        self.end.wrapping_sub(self.start).wrapping_add(1)
    }

    /// Alignment as a mask (`alignment - 1`)
    pub const fn alignment(&self) -> Addr {
        if self.flags.contains(ResourceFlags::SIZE_ALIGNED) {
            self.end.wrapping_sub(self.start)
        } else {
            self.align
        }
    }

    /// The provider resource this one was granted from
    pub const fn parent(&self) -> Option<ResId> {
        self.parent
    }

    pub const fn provides(&self) -> bool {
        self.space.is_some()
    }

    pub fn space(&self) -> Option<&ResourceSpace> {
        self.space.as_ref()
    }

    pub const fn disabled(&self) -> bool {
        self.flags.contains(ResourceFlags::DISABLED)
    }

    pub const fn enabled(&self) -> bool {
        !self.disabled()
    }

    pub const fn prefetchable(&self) -> bool {
        self.flags.contains(ResourceFlags::PREFETCHABLE)
    }

    pub const fn hierarchical(&self) -> bool {
        self.flags.contains(ResourceFlags::HIERARCHICAL)
    }

    pub const fn empty(&self) -> bool {
        self.flags.contains(ResourceFlags::EMPTY)
    }

    pub const fn is_64bit(&self) -> bool {
        self.flags.contains(ResourceFlags::WIDTH_64BIT)
    }

    pub const fn relative(&self) -> bool {
        self.flags.contains(ResourceFlags::RELATIVE)
    }

    pub const fn fixed_addr(&self) -> bool {
        !self.flags.contains(ResourceFlags::CAN_MOVE)
    }

    pub const fn fixed_size(&self) -> bool {
        !self.flags.contains(ResourceFlags::CAN_RESIZE)
    }

    pub fn enable(&mut self) {
        self.flags.remove(ResourceFlags::DISABLED);
    }

    pub fn disable(&mut self) {
        self.flags.insert(ResourceFlags::DISABLED);
    }

    pub fn set_empty(&mut self, empty: bool) {
        self.flags.set(ResourceFlags::EMPTY, empty);
    }

    /// Collapse the range and mark the resource empty
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
        self.set_empty(true);
    }

    pub fn insert_flags(&mut self, flags: ResourceFlags) {
        self.flags.insert(flags);
    }

    pub(crate) fn set_parent(&mut self, parent: Option<ResId>) {
        self.parent = parent;
    }

    /// Set an explicit alignment mask
    pub fn set_alignment(&mut self, mask: Addr) {
        self.align = mask;
        self.flags.remove(ResourceFlags::SIZE_ALIGNED);
    }

    /// Move the range to `start`, keeping its size
    pub fn set_start(&mut self, start: Addr) {
        self.end = start.wrapping_add(self.end.wrapping_sub(self.start));
        self.start = start;
    }

    pub fn set_end(&mut self, end: Addr) {
        self.end = end;
        self.set_empty(false);
    }

    pub fn set_size(&mut self, size: Addr) {
        self.end = self.start.wrapping_add(size).wrapping_sub(1);
        self.set_empty(false);
    }

    pub fn start_end(&mut self, start: Addr, end: Addr) {
        self.start = start;
        self.end = end;
        self.set_empty(false);
    }

    pub fn start_size(&mut self, start: Addr, size: Addr) {
        self.start_end(start, start.wrapping_add(size).wrapping_sub(1));
    }

    pub const fn valid(&self) -> bool {
        !matches!(self.ty, ResourceType::Invalid) && self.start <= self.end
    }

    /// Disable the resource if its range is malformed
    pub fn validate(&mut self) {
        if !self.valid() {
            self.disable();
        }
    }

    /// Whether this provider can satisfy `consumer`
    ///
    /// With `pref` false a prefetchable consumer may also be placed in a
    /// non-prefetchable provider.
    pub fn compatible(&self, consumer: &Resource, pref: bool) -> bool {
        self.ty == consumer.ty && self.prefetchable() == (consumer.prefetchable() && pref)
    }

    pub const fn contains(&self, other: &Resource) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub const fn overlaps(&self, other: &Resource) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tag != ResTag::NONE {
            write!(f, "{:<4} ", self.tag)?;
        }
        write!(
            f,
            "{:<6} [{:#010x}-{:#010x} {:#x}]",
            self.ty.name(),
            self.start,
            self.end,
            self.size(),
        )?;
        for (name, flag) in [
            (" pref", ResourceFlags::PREFETCHABLE),
            (" 64bit", ResourceFlags::WIDTH_64BIT),
            (" rom", ResourceFlags::ROM),
            (" rel", ResourceFlags::RELATIVE),
            (" empty", ResourceFlags::EMPTY),
            (" disabled", ResourceFlags::DISABLED),
        ] {
            if self.flags.contains(flag) {
                f.write_str(name)?;
            }
        }
        if self.fixed_addr() {
            f.write_str(" fixed")?;
        }
        write!(f, " (align={:#x})", self.alignment())
    }
}
