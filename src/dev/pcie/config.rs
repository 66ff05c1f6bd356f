// SPDX-FileCopyrightText:  2022-2023 xvanc and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! Configuration space access

use alloc::sync::Arc;
use core::{fmt, ops::RangeInclusive};

#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BusAddr {
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
}

impl BusAddr {
    pub const fn new(bus: u8, dev: u8, func: u8) -> BusAddr {
        Self { bus, dev, func }
    }

    pub const fn devfn(self) -> u8 {
        (self.dev << 3) | self.func
    }

    /// Address of the function on its bus as used for device lookup
    pub const fn adr(self) -> u32 {
        ((self.dev as u32) << 16) | self.func as u32
    }
}

impl fmt::Debug for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:02x}:{:02x}:{:02x}]", self.bus, self.dev, self.func)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Width {
    U8,
    U16,
    U32,
}

impl Width {
    const fn bits(self) -> u32 {
        match self {
            Width::U8 => 8,
            Width::U16 => 16,
            Width::U32 => 32,
        }
    }

    /// Mask of the bits covered by an access of this width at `reg`
    pub const fn mask(self, reg: u16) -> u32 {
        let shift = (reg as u32 % 4) * 8;
        match self {
            Width::U32 => !0,
            _ => ((1 << self.bits()) - 1) << shift,
        }
    }
}

/// A way to reach the configuration registers of PCI functions
///
/// Reads of functions that do not exist must return all-ones.
pub trait ConfigSpace: Send + Sync {
    fn read(&self, addr: BusAddr, reg: u16, width: Width) -> u32;
    fn write(&self, addr: BusAddr, reg: u16, value: u32, width: Width);
}

/// Memory mapped (enhanced) configuration access
pub struct Ecam {
    base: *mut u32,
    bus_range: RangeInclusive<u8>,
}

// SAFETY: The mapping is only ever touched with volatile accesses and concurrent use is
// serialized by the device tree lock.
unsafe impl Send for Ecam {}
// SAFETY: See above.
unsafe impl Sync for Ecam {}

impl Ecam {
    /// Create a new `Ecam`
    ///
    /// # Safety
    ///
    /// `base` must be the mapped, 4-byte aligned configuration window of `bus_range`, 1 MiB
    /// for every bus, valid for as long as the `Ecam` lives.
    pub unsafe fn new(base: *mut u8, bus_range: RangeInclusive<u8>) -> Ecam {
        Self {
            base: base.cast(),
            bus_range,
        }
    }

    fn register(&self, addr: BusAddr, reg: u16) -> Option<*mut u32> {
        if !self.bus_range.contains(&addr.bus) || reg >= 0x1000 {
            return None;
        }
        if addr.dev >= 32 || addr.func >= 8 {
            return None;
        }

        let offset = (usize::from(addr.bus - self.bus_range.start()) << 20)
            | (usize::from(addr.dev) << 15)
            | (usize::from(addr.func) << 12)
            | usize::from(reg & !3);

        // SAFETY: The offset is within the window promised to `new`.
        Some(unsafe { self.base.add(offset / 4) })
    }
}

impl ConfigSpace for Ecam {
    fn read(&self, addr: BusAddr, reg: u16, width: Width) -> u32 {
        let Some(ptr) = self.register(addr, reg) else {
            return !0;
        };
        // SAFETY: `register` checked the bounds.
        let value = u32::from_le(unsafe { ptr.read_volatile() });
        (value & width.mask(reg)) >> ((u32::from(reg) % 4) * 8)
    }

    fn write(&self, addr: BusAddr, reg: u16, value: u32, width: Width) {
        let Some(ptr) = self.register(addr, reg) else {
            return;
        };
        let mask = width.mask(reg);
        let shifted = (value << ((u32::from(reg) % 4) * 8)) & mask;

        // SAFETY: `register` checked the bounds.
        unsafe {
            let old = if width == Width::U32 {
                0
            } else {
                u32::from_le(ptr.read_volatile())
            };
            ptr.write_volatile(((old & !mask) | shifted).to_le());
        }
    }
}

/// Configuration registers of one function
#[derive(Clone)]
pub struct CfgHandle {
    space: Arc<dyn ConfigSpace>,
    addr: BusAddr,
}

impl CfgHandle {
    pub fn new(space: Arc<dyn ConfigSpace>, addr: BusAddr) -> CfgHandle {
        Self { space, addr }
    }

    pub fn addr(&self) -> BusAddr {
        self.addr
    }

    pub fn space(&self) -> &Arc<dyn ConfigSpace> {
        &self.space
    }

    pub fn read_u8(&self, reg: u16) -> u8 {
        self.space.read(self.addr, reg, Width::U8) as u8
    }

    pub fn read_u16(&self, reg: u16) -> u16 {
        self.space.read(self.addr, reg, Width::U16) as u16
    }

    pub fn read_u32(&self, reg: u16) -> u32 {
        self.space.read(self.addr, reg, Width::U32)
    }

    pub fn write_u8(&self, reg: u16, value: u8) {
        self.space.write(self.addr, reg, value.into(), Width::U8);
    }

    pub fn write_u16(&self, reg: u16, value: u16) {
        self.space.write(self.addr, reg, value.into(), Width::U16);
    }

    pub fn write_u32(&self, reg: u16, value: u32) {
        self.space.write(self.addr, reg, value, Width::U32);
    }
}

impl fmt::Debug for CfgHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}
