// SPDX-FileCopyrightText:  2023 xvanc and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! In-memory configuration space for tests

use super::config::{BusAddr, ConfigSpace, Width};
use alloc::{collections::BTreeMap, sync::Arc, vec, vec::Vec};
use spin::Mutex;

struct Regs {
    value: Vec<u32>,
    /// Bits that accept writes, everything else is hardwired
    writable: Vec<u32>,
}

#[derive(Default)]
pub struct MockConfig {
    functions: Mutex<BTreeMap<BusAddr, Regs>>,
}

impl MockConfig {
    pub fn new() -> Arc<MockConfig> {
        Arc::new(Self::default())
    }

    /// Add a function with a type 0 or type 1 header
    pub fn add(&self, addr: BusAddr, vendor: u16, device: u16, class: u16, header_type: u8) {
        let mut regs = Regs {
            value: vec![0; 1024],
            writable: vec![0; 1024],
        };
        regs.value[0] = u32::from(device) << 16 | u32::from(vendor);
        regs.value[2] = u32::from(class) << 16;
        regs.value[3] = u32::from(header_type) << 16;
        // command register
        regs.writable[1] = 0x0000_0547;
        self.functions.lock().insert(addr, regs);
    }

    /// Set a register along with the mask of its writable bits
    pub fn set(&self, addr: BusAddr, reg: u16, value: u32, writable: u32) {
        let mut functions = self.functions.lock();
        let Some(regs) = functions.get_mut(&addr) else {
            panic!("no function at {addr:?}");
        };
        regs.value[usize::from(reg / 4)] = value;
        regs.writable[usize::from(reg / 4)] = writable;
    }

    pub fn get(&self, addr: BusAddr, reg: u16) -> u32 {
        self.read(addr, reg & !3, Width::U32)
    }

    /// A 32-bit memory or I/O BAR of `size` bytes at `base`
    pub fn bar(&self, addr: BusAddr, index: u16, base: u32, size: u32, flags: u32) {
        let type_bits = if flags & 1 != 0 { 0x3 } else { 0xf };
        self.set(addr, 0x10 + 4 * index, base | flags, !(size - 1) & !type_bits);
    }

    /// A 64-bit memory BAR occupying `index` and `index + 1`
    pub fn bar64(&self, addr: BusAddr, index: u16, base: u64, size: u64, prefetchable: bool) {
        let flags = 0x4 | if prefetchable { 0x8 } else { 0 };
        let mask = !(size - 1);
        self.set(
            addr,
            0x10 + 4 * index,
            (base as u32) | flags,
            (mask as u32) & !0xf,
        );
        self.set(addr, 0x14 + 4 * index, (base >> 32) as u32, (mask >> 32) as u32);
    }

    /// A legacy capability header `id` at `offset` pointing at `next`
    pub fn cap(&self, addr: BusAddr, offset: u16, id: u8, next: u8, extra: u16) {
        self.set(
            addr,
            offset,
            u32::from(extra) << 16 | u32::from(next) << 8 | u32::from(id),
            0,
        );
    }
}

impl ConfigSpace for MockConfig {
    fn read(&self, addr: BusAddr, reg: u16, width: Width) -> u32 {
        let functions = self.functions.lock();
        let Some(regs) = functions.get(&addr) else {
            return !0;
        };
        let value = regs.value[usize::from(reg / 4)];
        (value & width.mask(reg)) >> ((u32::from(reg) % 4) * 8)
    }

    fn write(&self, addr: BusAddr, reg: u16, value: u32, width: Width) {
        let mut functions = self.functions.lock();
        let Some(regs) = functions.get_mut(&addr) else {
            return;
        };
        let index = usize::from(reg / 4);
        let mask = width.mask(reg) & regs.writable[index];
        let shifted = value << ((u32::from(reg) % 4) * 8);
        regs.value[index] = (regs.value[index] & !mask) | (shifted & mask);
    }
}
