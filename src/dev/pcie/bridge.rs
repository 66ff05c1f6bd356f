// SPDX-FileCopyrightText:  2023 xvanc and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! PCI-to-PCI and CardBus bridges

use super::{config::CfgHandle, CommandRegister};
use crate::{
    dev::{DevId, DeviceTree},
    io::{self, Error},
    resource::{ResId, ResTag, Resource, ResourceFlags, ResourceSpace, ResourceType},
};
use alloc::{vec, vec::Vec};

const PRIMARY_BUS: u16 = 0x18;
const SECONDARY_BUS: u16 = 0x19;
const SUBORDINATE_BUS: u16 = 0x1a;

const IO_BASE: u16 = 0x1c;
const IO_LIMIT: u16 = 0x1d;
const MEMORY_WINDOW: u16 = 0x20;
const PREF_WINDOW: u16 = 0x24;
const PREF_BASE_UPPER: u16 = 0x28;
const PREF_LIMIT_UPPER: u16 = 0x2c;
const IO_BASE_UPPER: u16 = 0x30;
const IO_LIMIT_UPPER: u16 = 0x32;

const CARDBUS_WINDOWS: u16 = 0x1c;
const CARDBUS_CONTROL: u16 = 0x3e;

const MEMORY_GRANULARITY: u64 = 0xf_ffff;
const IO_GRANULARITY: u64 = 0xfff;
const CARDBUS_MEMORY_GRANULARITY: u64 = 0xfff;
const CARDBUS_IO_GRANULARITY: u64 = 0x3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BridgeKind {
    Pci,
    Cardbus,
}

#[derive(Debug)]
pub struct Bridge {
    kind: BridgeKind,
    primary: u8,
    /// `None` if no bus number could be assigned, the bus behind is not scanned then
    secondary: Option<u8>,
    subordinate: u8,
    windows: Vec<ResId>,
    bus: Option<ResId>,
    irq_router: Option<ResId>,
}

// A window provider. A window given as `None` or with its limit below its base is closed.
fn window(
    ty: ResourceType,
    flags: ResourceFlags,
    range: Option<(u64, u64)>,
    granularity: u64,
    index: u8,
) -> Resource {
    let flags =
        flags | ResourceFlags::CAN_MOVE | ResourceFlags::CAN_RESIZE | ResourceFlags::HIERARCHICAL;
    let mut res = Resource::new(ty, flags)
        .providing(ResourceSpace::provider())
        .tagged(ResTag::window(index));
    res.set_alignment(granularity);
    match range {
        Some((start, end)) if start < end => res.start_end(start, end),
        _ => res.clear(),
    }
    res
}

fn pci_windows(cfg: &CfgHandle, command: CommandRegister) -> Vec<Resource> {
    let memory = command.contains(CommandRegister::MEMORY_SPACE);
    let io = command.contains(CommandRegister::IO_SPACE);

    let value = cfg.read_u32(MEMORY_WINDOW);
    let mem = memory.then(|| {
        (
            u64::from(value & 0xfff0) << 16,
            u64::from(value & 0xfff0_0000) | MEMORY_GRANULARITY,
        )
    });

    let value = cfg.read_u32(PREF_WINDOW);
    let wide = value & 0xf == 0x1;
    let pref = memory.then(|| {
        let mut start = u64::from(value & 0xfff0) << 16;
        let mut end = u64::from(value & 0xfff0_0000) | MEMORY_GRANULARITY;
        if wide {
            start |= u64::from(cfg.read_u32(PREF_BASE_UPPER)) << 32;
            end |= u64::from(cfg.read_u32(PREF_LIMIT_UPPER)) << 32;
        }
        (start, end)
    });
    let mut pref_flags = ResourceFlags::PREFETCHABLE;
    pref_flags.set(ResourceFlags::WIDTH_64BIT, wide);

    let value = cfg.read_u16(IO_BASE);
    let ports = io.then(|| {
        let mut start = u64::from(value & 0xf0) << 8;
        let mut end = u64::from(value & 0xf000) | IO_GRANULARITY;
        if value & 0xf == 0x1 {
            start |= u64::from(cfg.read_u16(IO_BASE_UPPER)) << 16;
            end |= u64::from(cfg.read_u16(IO_LIMIT_UPPER)) << 16;
        }
        (start, end)
    });

    vec![
        window(ResourceType::Mmio, ResourceFlags::empty(), mem, MEMORY_GRANULARITY, 0),
        window(ResourceType::Mmio, pref_flags, pref, MEMORY_GRANULARITY, 1),
        window(ResourceType::Io, ResourceFlags::empty(), ports, IO_GRANULARITY, 2),
    ]
}

// Two memory windows followed by two I/O windows, each a base and a limit register.
fn cardbus_windows(cfg: &CfgHandle, command: CommandRegister) -> Vec<Resource> {
    let control = cfg.read_u16(CARDBUS_CONTROL);
    (0..4u8)
        .map(|index| {
            let reg = CARDBUS_WINDOWS + 8 * u16::from(index);
            let base = u64::from(cfg.read_u32(reg));
            let limit = u64::from(cfg.read_u32(reg + 4));

            let (ty, granularity, decoding) = if index < 2 {
                let decoding = command.contains(CommandRegister::MEMORY_SPACE);
                (ResourceType::Mmio, CARDBUS_MEMORY_GRANULARITY, decoding)
            } else {
                let decoding = command.contains(CommandRegister::IO_SPACE);
                (ResourceType::Io, CARDBUS_IO_GRANULARITY, decoding)
            };

            let mut flags = ResourceFlags::empty();
            flags.set(
                ResourceFlags::PREFETCHABLE,
                index < 2 && control & (1 << (8 + index)) != 0,
            );

            let range = (decoding && limit != 0)
                .then_some((base & !granularity, limit | granularity));
            window(ty, flags, range, granularity, index)
        })
        .collect()
}

impl Bridge {
    /// Number the bridge at `cfg` and create its windows
    pub(super) fn discover(
        tree: &mut DeviceTree,
        dev: DevId,
        cfg: &CfgHandle,
        kind: BridgeKind,
        command: CommandRegister,
    ) -> io::Result<Bridge> {
        let Some(bus_dev) = tree.parent(dev) else {
            return Err(Error::InvalidArgument);
        };

        let mut bridge = Bridge {
            kind,
            primary: cfg.addr().bus,
            secondary: None,
            subordinate: 0,
            windows: Vec::new(),
            bus: None,
            irq_router: None,
        };

        if let Some((secondary, subordinate)) = tree.number_bridge(bus_dev, cfg) {
            bridge.secondary = Some(secondary);
            bridge.subordinate = subordinate;
            let buses = Resource::with_range(
                ResourceType::Bus,
                ResourceFlags::HIERARCHICAL,
                secondary.into(),
                subordinate.into(),
            )
            .providing(ResourceSpace::provider())
            .tagged(ResTag::BUS);
            bridge.bus = Some(tree.add_resource_rq(dev, buses)?);
        }

        let router = Resource::with_range(ResourceType::Irq, ResourceFlags::empty(), 0, 3)
            .providing(ResourceSpace::IrqRouter)
            .tagged(ResTag::IRQ_ROUTER);
        bridge.irq_router = Some(tree.add_resource(dev, router)?);

        let windows = match kind {
            BridgeKind::Pci => pci_windows(cfg, command),
            BridgeKind::Cardbus => cardbus_windows(cfg, command),
        };
        for window in windows {
            let id = if window.empty() {
                tree.add_resource(dev, window)?
            } else {
                tree.add_resource_rq(dev, window)?
            };
            bridge.windows.push(id);
        }

        Ok(bridge)
    }

    pub fn kind(&self) -> BridgeKind {
        self.kind
    }

    pub fn primary(&self) -> u8 {
        self.primary
    }

    pub fn secondary(&self) -> Option<u8> {
        self.secondary
    }

    pub fn subordinate(&self) -> u8 {
        self.subordinate
    }

    pub fn windows(&self) -> &[ResId] {
        &self.windows
    }

    pub fn bus(&self) -> Option<ResId> {
        self.bus
    }

    pub fn irq_router(&self) -> Option<ResId> {
        self.irq_router
    }

    fn raise_subordinate(&mut self, cfg: &CfgHandle, subordinate: u8) -> bool {
        if self.secondary.is_none() || self.subordinate >= subordinate {
            return false;
        }
        self.subordinate = subordinate;
        cfg.write_u8(SUBORDINATE_BUS, subordinate);
        true
    }

    fn open_window<'a>(&self, tree: &'a DeviceTree, index: usize) -> Option<&'a Resource> {
        let id = *self.windows.get(index)?;
        let res = tree.resource(id);
        (res.enabled() && !res.empty() && tree.resource_allocated(id)).then_some(res)
    }

    /// Write the placed windows back into the bridge, closing the others
    pub(super) fn program(&self, tree: &DeviceTree, cfg: &CfgHandle) {
        match self.kind {
            BridgeKind::Pci => self.program_pci(tree, cfg),
            BridgeKind::Cardbus => self.program_cardbus(tree, cfg),
        }
    }

    fn program_pci(&self, tree: &DeviceTree, cfg: &CfgHandle) {
        let encode = |r: &Resource| ((r.start() >> 16) & 0xfff0 | r.end() & 0xfff0_0000) as u32;

        match self.open_window(tree, 0) {
            Some(r) => cfg.write_u32(MEMORY_WINDOW, encode(r)),
            None => cfg.write_u32(MEMORY_WINDOW, 0x0000_fff0),
        }

        match self.open_window(tree, 1) {
            Some(r) => {
                cfg.write_u32(PREF_BASE_UPPER, (r.start() >> 32) as u32);
                cfg.write_u32(PREF_LIMIT_UPPER, (r.end() >> 32) as u32);
                cfg.write_u32(PREF_WINDOW, encode(r));
            }
            None => {
                cfg.write_u32(PREF_WINDOW, 0x0000_fff0);
                cfg.write_u32(PREF_BASE_UPPER, 0);
                cfg.write_u32(PREF_LIMIT_UPPER, 0);
            }
        }

        match self.open_window(tree, 2) {
            Some(r) => {
                cfg.write_u16(IO_BASE_UPPER, (r.start() >> 16) as u16);
                cfg.write_u16(IO_LIMIT_UPPER, (r.end() >> 16) as u16);
                cfg.write_u8(IO_BASE, ((r.start() >> 8) & 0xf0) as u8);
                cfg.write_u8(IO_LIMIT, ((r.end() >> 8) & 0xf0) as u8);
            }
            None => {
                cfg.write_u8(IO_BASE, 0xf0);
                cfg.write_u8(IO_LIMIT, 0x00);
                cfg.write_u16(IO_BASE_UPPER, 0);
                cfg.write_u16(IO_LIMIT_UPPER, 0);
            }
        }
    }

    fn program_cardbus(&self, tree: &DeviceTree, cfg: &CfgHandle) {
        for index in 0..4 {
            let reg = CARDBUS_WINDOWS + 8 * index as u16;
            let granularity = if index < 2 {
                CARDBUS_MEMORY_GRANULARITY
            } else {
                CARDBUS_IO_GRANULARITY
            };
            match self.open_window(tree, index) {
                Some(r) => {
                    cfg.write_u32(reg, r.start() as u32);
                    cfg.write_u32(reg + 4, (r.end() & !granularity) as u32);
                }
                None => {
                    cfg.write_u32(reg, !granularity as u32);
                    cfg.write_u32(reg + 4, 0);
                }
            }
        }
    }
}

impl DeviceTree {
    /// The host bridge `dev` sits behind, `dev` itself included
    pub fn host_of(&self, dev: DevId) -> Option<DevId> {
        self.ancestors(dev).find(|&d| self.host_bridge(d).is_some())
    }

    // Decide the secondary and subordinate bus of the bridge at `cfg` on the bus of
    // `bus_dev`. Numbers that look sane are kept, anything else is replaced with the
    // next number not yet handed out below the host bridge.
    fn number_bridge(&mut self, bus_dev: DevId, cfg: &CfgHandle) -> Option<(u8, u8)> {
        let bus = cfg.addr().bus;
        let primary = cfg.read_u8(PRIMARY_BUS);
        let secondary = cfg.read_u8(SECONDARY_BUS);
        let subordinate = cfg.read_u8(SUBORDINATE_BUS);

        if primary == bus && secondary > bus {
            let subordinate = subordinate.max(secondary);
            self.increase_subordinate(bus_dev, subordinate);
            return Some((secondary, subordinate));
        }

        let host = self.host_bridge(self.host_of(bus_dev)?)?;
        let last = *host.bus_range().end();
        let Some(next) = host.subordinate.checked_add(1).filter(|&n| n <= last) else {
            log::error!("{cfg:?}: out of bus numbers");
            return None;
        };

        log::warn!(
            "{cfg:?}: stale bus numbers {primary:02x}/{secondary:02x}/{subordinate:02x}, \
             using {next:02x}"
        );
        cfg.write_u8(PRIMARY_BUS, bus);
        cfg.write_u8(SECONDARY_BUS, next);
        cfg.write_u8(SUBORDINATE_BUS, next);
        self.increase_subordinate(bus_dev, next);
        Some((next, next))
    }

    /// Make every bridge from `dev` up to its host bridge reach bus `subordinate`
    pub(crate) fn increase_subordinate(&mut self, dev: DevId, subordinate: u8) {
        let path: Vec<DevId> = self.ancestors(dev).collect();
        for d in path {
            if let Some(host) = self.host_bridge_mut(d) {
                host.subordinate = host.subordinate.max(subordinate);
                return;
            }

            let Some(func) = self.pci_mut(d) else {
                continue;
            };
            let Some(bridge) = func.bridge.as_mut() else {
                continue;
            };
            if !bridge.raise_subordinate(&func.cfg, subordinate) {
                continue;
            }
            let bus = bridge.bus;
            if let Some(bus) = bus {
                self.resource_mut(bus).set_end(subordinate.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::pcie::{config::BusAddr, mock::MockConfig};

    const ADDR: BusAddr = BusAddr::new(0, 1, 0);
    const DECODING: CommandRegister =
        CommandRegister::MEMORY_SPACE.union(CommandRegister::IO_SPACE);

    fn bridge_config() -> CfgHandle {
        let mock = MockConfig::new();
        mock.add(ADDR, 0x8086, 0x2448, 0x0604, 1);
        mock.set(ADDR, 0x1c, 0x0000_2010, 0xffff_f0f0);
        mock.set(ADDR, 0x20, 0xfebf_fea0, 0xfff0_fff0);
        mock.set(ADDR, 0x24, 0x0001_fff1, 0xfff0_fff0);
        mock.set(ADDR, 0x30, 0, 0xffff_ffff);
        CfgHandle::new(mock, ADDR)
    }

    #[test]
    fn decodes_firmware_windows() {
        let cfg = bridge_config();
        let windows = pci_windows(&cfg, DECODING);

        let mem = &windows[0];
        assert_eq!((mem.start(), mem.end()), (0xfea0_0000, 0xfebf_ffff));
        assert_eq!(mem.alignment(), MEMORY_GRANULARITY);
        assert!(!mem.empty() && !mem.fixed_addr() && !mem.fixed_size());
        assert_eq!(mem.tag(), ResTag::window(0));

        // Limit below base.
        let pref = &windows[1];
        assert!(pref.empty());
        assert!(pref.prefetchable() && pref.is_64bit());

        let io = &windows[2];
        assert_eq!((io.start(), io.end()), (0x1000, 0x2fff));
        assert_eq!(io.ty(), ResourceType::Io);
    }

    #[test]
    fn windows_of_a_disabled_bridge_are_closed() {
        let cfg = bridge_config();
        let windows = pci_windows(&cfg, CommandRegister::empty());
        assert!(windows.iter().all(Resource::empty));
    }

    #[test]
    fn cardbus_windows_follow_bridge_control() {
        let mock = MockConfig::new();
        mock.add(ADDR, 0x104c, 0xac56, 0x0607, 2);
        mock.set(ADDR, 0x1c, 0x8000_0000, !0);
        mock.set(ADDR, 0x20, 0x83ff_f000, !0);
        mock.set(ADDR, 0x2c, 0x0000_4000, !0);
        mock.set(ADDR, 0x30, 0x0000_40fc, !0);
        mock.set(ADDR, 0x3c, 1 << 24, !0);
        let cfg = CfgHandle::new(mock, ADDR);

        let windows = cardbus_windows(&cfg, DECODING);
        assert_eq!(windows.len(), 4);
        assert_eq!((windows[0].start(), windows[0].end()), (0x8000_0000, 0x83ff_ffff));
        assert!(windows[0].prefetchable());
        assert!(windows[1].empty());
        assert_eq!((windows[2].start(), windows[2].end()), (0x4000, 0x40ff));
        assert!(windows[3].empty());
    }
}
