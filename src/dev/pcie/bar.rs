// SPDX-FileCopyrightText:  2022-2023 xvanc and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! Base Address Register sizing

use super::config::CfgHandle;
use crate::resource::{ResTag, Resource, ResourceFlags, ResourceType};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BarKind {
    Memory32,
    Memory64,
    Io,
}

/// What sizing a BAR revealed
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Bar {
    pub index: u8,
    pub kind: BarKind,
    pub prefetchable: bool,
    /// Address currently programmed into the register
    pub base: u64,
    pub size: u64,
}

pub const fn bar_offset(index: u8) -> u16 {
    0x10 + 4 * index as u16
}

// Write all-ones, see which bits stuck, put the old value back.
fn size_register(cfg: &CfgHandle, reg: u16, ones: u32) -> (u32, u32) {
    let value = cfg.read_u32(reg);
    cfg.write_u32(reg, ones);
    let mask = cfg.read_u32(reg);
    cfg.write_u32(reg, value);
    (value, mask)
}

impl Bar {
    /// Size the BAR at `index`
    ///
    /// The caller must have turned the function's decoders off. `count` is the number of
    /// BARs of the header, a 64-bit BAR needs a second slot.
    pub fn probe(cfg: &CfgHandle, index: u8, count: u8) -> Option<Bar> {
        let reg = bar_offset(index);
        let (value, mask) = size_register(cfg, reg, !0);

        if mask == 0 {
            // Unimplemented BARs are hardwired to zero.
            return None;
        }

        if mask & 0x1 == 1 {
            let bits = mask & !0x3;
            if bits == 0 {
                return None;
            }
            return Some(Bar {
                index,
                kind: BarKind::Io,
                prefetchable: false,
                base: u64::from(value & !0x3),
                size: 1 << bits.trailing_zeros(),
            });
        }

        let prefetchable = mask & 0x8 != 0;
        match (mask >> 1) & 0x3 {
            0x2 if index + 1 < count => {
                let (upper, upper_mask) = size_register(cfg, reg + 4, !0);
                let bits = u64::from(upper_mask) << 32 | u64::from(mask & !0xf);
                if bits == 0 {
                    return None;
                }
                Some(Bar {
                    index,
                    kind: BarKind::Memory64,
                    prefetchable,
                    base: u64::from(upper) << 32 | u64::from(value & !0xf),
                    size: 1 << bits.trailing_zeros(),
                })
            }
            0x0 => {
                let bits = mask & !0xf;
                if bits == 0 {
                    return None;
                }
                Some(Bar {
                    index,
                    kind: BarKind::Memory32,
                    prefetchable,
                    base: u64::from(value & !0xf),
                    size: 1 << bits.trailing_zeros(),
                })
            }
            other => {
                log::warn!("{cfg:?}: BAR{index} has unusable type {other:#x}");
                None
            }
        }
    }

    /// Number of register slots this BAR occupies
    pub const fn slots(&self) -> u8 {
        match self.kind {
            BarKind::Memory64 => 2,
            BarKind::Memory32 | BarKind::Io => 1,
        }
    }

    /// The resource describing this BAR
    ///
    /// `decoding` tells whether the matching decoder was enabled by firmware. If not, the
    /// programmed address is not trusted and the resource starts out disabled.
    pub fn resource(&self, decoding: bool) -> Resource {
        let ty = match self.kind {
            BarKind::Io => ResourceType::Io,
            BarKind::Memory32 | BarKind::Memory64 => ResourceType::Mmio,
        };
        let mut flags =
            ResourceFlags::SIZE_ALIGNED | ResourceFlags::HIERARCHICAL | ResourceFlags::CAN_MOVE;
        flags.set(ResourceFlags::PREFETCHABLE, self.prefetchable);
        flags.set(ResourceFlags::WIDTH_64BIT, self.kind == BarKind::Memory64);
        flags.set(ResourceFlags::DISABLED, !decoding);

        let mut res = Resource::new(ty, flags).tagged(ResTag::bar(self.index));
        res.start_size(self.base, self.size);
        res
    }

    /// Program `res` back into the register, returns whether the device took it
    pub fn write(cfg: &CfgHandle, index: u8, res: &Resource) -> bool {
        let reg = bar_offset(index);
        let low = res.start() as u32;
        cfg.write_u32(reg, low);
        let keep: u32 = if res.ty() == ResourceType::Io { !0x3 } else { !0xf };
        let mut ok = cfg.read_u32(reg) & keep == low & keep;
        if res.is_64bit() {
            let high = (res.start() >> 32) as u32;
            cfg.write_u32(reg + 4, high);
            ok &= cfg.read_u32(reg + 4) == high;
        }
        ok
    }
}

/// Expansion ROM at `reg`, sized with the enable bit cleared
pub fn probe_rom(cfg: &CfgHandle, reg: u16) -> Option<Resource> {
    let value = cfg.read_u32(reg);
    if value == !0 {
        return None;
    }
    cfg.write_u32(reg, !0x7ff);
    let mask = cfg.read_u32(reg) & !0x7ff;
    cfg.write_u32(reg, value & !0x1);

    if mask == 0 {
        return None;
    }

    let flags = ResourceFlags::SIZE_ALIGNED
        | ResourceFlags::ROM
        | ResourceFlags::PREFETCHABLE
        | ResourceFlags::CAN_MOVE;
    let mut res = Resource::new(ResourceType::Mmio, flags).tagged(ResTag::ROM);
    res.start_size(u64::from(value & !0x7ff), 1 << mask.trailing_zeros());
    Some(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::pcie::{config::BusAddr, mock::MockConfig};

    const ADDR: BusAddr = BusAddr::new(0, 3, 0);

    fn handle(mock: &alloc::sync::Arc<MockConfig>) -> CfgHandle {
        CfgHandle::new(mock.clone(), ADDR)
    }

    #[test]
    fn sixteen_byte_memory_bar() {
        let mock = MockConfig::new();
        mock.add(ADDR, 0x1234, 0x5678, 0x0200, 0);
        mock.bar(ADDR, 0, 0, 16, 0);
        let cfg = handle(&mock);

        cfg.write_u32(0x10, !0);
        assert_eq!(cfg.read_u32(0x10), 0xffff_fff0);
        cfg.write_u32(0x10, 0);

        let bar = Bar::probe(&cfg, 0, 6).unwrap();
        assert_eq!(bar.kind, BarKind::Memory32);
        assert!(!bar.prefetchable);
        assert_eq!(bar.size, 16);
        assert_eq!(mock.get(ADDR, 0x10), 0);

        let res = bar.resource(true);
        assert_eq!(res.ty(), ResourceType::Mmio);
        assert_eq!(res.size(), 16);
        assert_eq!(res.alignment(), 0xf);
        assert!(!res.fixed_addr());
    }

    #[test]
    fn io_and_64bit_bars() {
        let mock = MockConfig::new();
        mock.add(ADDR, 0x1234, 0x5678, 0x0200, 0);
        mock.bar(ADDR, 0, 0xc000, 0x20, 0x1);
        mock.bar64(ADDR, 1, 0x8_0000_0000, 0x1_0000_0000, true);
        let cfg = handle(&mock);

        let io = Bar::probe(&cfg, 0, 6).unwrap();
        assert_eq!((io.kind, io.base, io.size), (BarKind::Io, 0xc000, 0x20));

        let wide = Bar::probe(&cfg, 1, 6).unwrap();
        assert_eq!(wide.kind, BarKind::Memory64);
        assert!(wide.prefetchable);
        assert_eq!((wide.base, wide.size, wide.slots()), (0x8_0000_0000, 0x1_0000_0000, 2));
        assert_eq!(mock.get(ADDR, 0x18), 0x8);

        // The upper half of a 64-bit BAR in the last slot is missing.
        assert_eq!(Bar::probe(&cfg, 1, 2), None);
        assert_eq!(Bar::probe(&cfg, 3, 6), None);
    }

    #[test]
    fn rom_enable_bit_is_cleared() {
        let mock = MockConfig::new();
        mock.add(ADDR, 0x1234, 0x5678, 0x0300, 0);
        mock.set(ADDR, 0x30, 0xfeb0_0001, 0xffff_0001);
        let cfg = handle(&mock);

        let rom = probe_rom(&cfg, 0x30).unwrap();
        assert_eq!((rom.start(), rom.size()), (0xfeb0_0000, 0x1_0000));
        assert_eq!(rom.tag(), ResTag::ROM);
        assert_eq!(mock.get(ADDR, 0x30), 0xfeb0_0000);
    }
}
