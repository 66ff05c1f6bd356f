/*
 * Copyright (c) 2022 xvanc and contributors
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

//! PCI and PCI Express bus discovery
//!
//! A host bridge owns a range of bus numbers and, optionally, fixed apertures. Scanning
//! a bus creates one device per function found, sizes its BARs, walks its capability
//! lists and recurses into the secondary bus of every bridge.

pub mod bar;
mod bridge;
pub mod caps;
pub mod config;
mod function;
#[cfg(test)]
pub(crate) mod mock;

pub use bridge::{Bridge, BridgeKind};
pub use caps::{Capabilities, PortType};
pub use config::{BusAddr, CfgHandle, ConfigSpace, Ecam, Width};
pub use function::{Function, PciInfo};

use super::{DevId, DeviceTree, Feature};
use crate::{
    config::{HostBridgeConfig, WindowKind},
    io::{self, Error},
    mem::PhysRegion,
    resource::{ResTag, Resource, ResourceFlags, ResourceSpace, ResourceType},
};
use alloc::{format, sync::Arc};
use core::{fmt, ops::RangeInclusive};

/// Configuration header registers shared by every header type
pub(crate) mod reg {
    pub const VENDOR_ID: u16 = 0x00;
    pub const COMMAND: u16 = 0x04;
    pub const REVISION: u16 = 0x08;
    pub const HEADER_TYPE: u16 = 0x0e;
    pub const CAP_PTR: u16 = 0x34;
    pub const CARDBUS_CAP_PTR: u16 = 0x14;
    pub const ROM: u16 = 0x30;
    pub const BRIDGE_ROM: u16 = 0x38;
    pub const INTERRUPT_PIN: u16 = 0x3d;
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct CommandRegister : u16 {
        const IO_SPACE              = 1 << 0;
        const MEMORY_SPACE          = 1 << 1;
        const BUS_MASTER            = 1 << 2;
        const SPECIAL_CYCLES        = 1 << 3;
        const MEM_WRITE_INVALIDATE  = 1 << 4;
        const VGA_PALETTE_SNOOP     = 1 << 5;
        const PARITY_ERROR_RESPONSE = 1 << 6;
        const SERR                  = 1 << 8;
        const FAST_BACK_TO_BACK     = 1 << 9;
        const INTERRUPT_DISABLE     = 1 << 10;
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct DeviceIdent {
    pub vendor: u16,
    pub device: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
}

impl DeviceIdent {
    pub fn read(cfg: &CfgHandle) -> DeviceIdent {
        let id = cfg.read_u32(reg::VENDOR_ID);
        let class = cfg.read_u32(reg::REVISION);
        Self {
            vendor: id as u16,
            device: (id >> 16) as u16,
            class: (class >> 24) as u8,
            subclass: (class >> 16) as u8,
            prog_if: (class >> 8) as u8,
            revision: class as u8,
        }
    }

    /// Base class and subclass, e.g. `0x0604` for a PCI-to-PCI bridge
    pub const fn class_code(&self) -> u16 {
        (self.class as u16) << 8 | self.subclass as u16
    }
}

impl fmt::Debug for DeviceIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#06x}:{:#06x}]: {}",
            self.vendor,
            self.device,
            device_kind(self.class, self.subclass, self.prog_if)
        )
    }
}

fn device_kind(class: u8, subclass: u8, prog_if: u8) -> &'static str {
    let mut s = "<unknown>";

    #[allow(clippy::single_match)]
    match class {
        0x1 => match subclass {
            0x6 => match prog_if {
                0x1 => s = "SATA Controller (AHCI)",
                _ => {}
            },
            0x8 => match prog_if {
                0x2 => s = "NVMe Controller",
                _ => {}
            },
            _ => {}
        },
        0x2 => match subclass {
            0x0 => s = "Ethernet Controller",
            _ => {}
        },
        0x3 => match subclass {
            0x0 => s = "VGA Controller",
            _ => {}
        },
        0x6 => match subclass {
            0x0 => s = "Host Bridge Controller",
            0x1 => s = "ISA Bridge",
            0x4 => s = "PCI-to-PCI Bridge",
            0x7 => s = "CardBus Bridge",
            _ => {}
        },
        0xc => match subclass {
            0x3 => match prog_if {
                0x30 => s = "xHCI Controller",
                _ => {}
            },
            _ => {}
        },
        _ => {}
    }

    s
}

/// What kind of object a function is instantiated as
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FunctionClass {
    Device,
    PciBridge,
    CardbusBridge,
}

type Constructor = fn(&mut DeviceTree, DevId, CfgHandle, &ScanOptions) -> io::Result<Function>;

static CONSTRUCTORS: [(FunctionClass, Constructor); 3] = [
    (FunctionClass::Device, function::device),
    (FunctionClass::PciBridge, function::pci_bridge),
    (FunctionClass::CardbusBridge, function::cardbus_bridge),
];

impl FunctionClass {
    pub fn classify(class_code: u16, header_type: u8) -> FunctionClass {
        match (class_code, header_type & 0x7f) {
            (0x0604 | 0x0607, 1) => Self::PciBridge,
            (0x0604 | 0x0607, 2) => Self::CardbusBridge,
            _ => Self::Device,
        }
    }

    /// Number of BAR slots in the header
    pub const fn bar_count(self) -> u8 {
        match self {
            Self::Device => 6,
            Self::PciBridge => 2,
            Self::CardbusBridge => 1,
        }
    }

    fn constructor(self) -> Option<Constructor> {
        CONSTRUCTORS
            .iter()
            .find(|(class, _)| *class == self)
            .map(|&(_, ctor)| ctor)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ScanOptions {
    /// Discover expansion ROMs as resources
    pub expansion_rom: bool,
    /// Program ACS isolation where available
    pub acs: bool,
    /// The host bridge gives access to extended configuration space
    pub extended_config: bool,
}

pub struct HostBridge {
    space: Arc<dyn ConfigSpace>,
    bus_range: RangeInclusive<u8>,
    /// Highest bus number handed out so far
    pub(crate) subordinate: u8,
    pcie: bool,
}

impl HostBridge {
    pub fn space(&self) -> &Arc<dyn ConfigSpace> {
        &self.space
    }

    pub fn bus_range(&self) -> &RangeInclusive<u8> {
        &self.bus_range
    }

    pub fn root_bus(&self) -> u8 {
        *self.bus_range.start()
    }

    pub fn subordinate(&self) -> u8 {
        self.subordinate
    }

    pub fn is_pcie(&self) -> bool {
        self.pcie
    }
}

impl DeviceTree {
    /// Attach a host bridge below `parent`
    ///
    /// The bridge provides its bus numbers and, if configured, fixed apertures which are
    /// requested from `parent` right away.
    pub fn add_host_bridge(
        &mut self,
        parent: DevId,
        space: Arc<dyn ConfigSpace>,
        config: &HostBridgeConfig,
    ) -> io::Result<DevId> {
        if config.bus_range.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let ecam = match config.ecam {
            Some(base) => {
                let buses = u64::from(config.bus_range.end() - config.bus_range.start()) + 1;
                let end = base
                    .checked_add((buses << 20) - 1)
                    .ok_or(Error::InvalidArgument)?;
                Some(PhysRegion::new(base, end))
            }
            None => None,
        };

        let dev = self.add_child(parent, config.name.as_str());
        self.set_hid(dev, if config.pcie { "PNP0A08" } else { "PNP0A03" });

        if let Some(ecam) = ecam {
            self.phys.reserve(ecam);
        }

        let buses = Resource::with_range(
            ResourceType::Bus,
            ResourceFlags::empty(),
            u64::from(*config.bus_range.start()),
            u64::from(*config.bus_range.end()),
        )
        .providing(ResourceSpace::provider())
        .tagged(ResTag::BUS);
        self.add_resource(dev, buses)?;

        let router = Resource::with_range(ResourceType::Irq, ResourceFlags::empty(), 0, 3)
            .providing(ResourceSpace::IrqRouter)
            .tagged(ResTag::IRQ_ROUTER);
        self.add_resource(dev, router)?;

        for (index, window) in config.windows.iter().enumerate() {
            let (ty, mut flags) = match window.kind {
                WindowKind::Mmio => (ResourceType::Mmio, ResourceFlags::empty()),
                WindowKind::Prefetchable => (ResourceType::Mmio, ResourceFlags::PREFETCHABLE),
                WindowKind::Io => (ResourceType::Io, ResourceFlags::empty()),
            };
            flags |= ResourceFlags::HIERARCHICAL;
            if *window.range.end() > u64::from(u32::MAX) {
                flags |= ResourceFlags::WIDTH_64BIT;
            }
            let res = Resource::with_range(ty, flags, *window.range.start(), *window.range.end())
                .providing(ResourceSpace::provider())
                .tagged(ResTag::window(index as u8));
            self.add_resource_rq(dev, res)?;
        }

        self.add_feature(
            dev,
            Feature::HostBridge(HostBridge {
                space,
                bus_range: config.bus_range.clone(),
                subordinate: *config.bus_range.start(),
                pcie: config.pcie,
            }),
        );

        Ok(dev)
    }

    /// Discover everything behind the host bridge `host`
    pub fn scan_host_bridge(&mut self, host: DevId, options: &ScanOptions) -> io::Result<()> {
        let Some(bridge) = self.host_bridge(host) else {
            return Err(Error::InvalidArgument);
        };
        let space = bridge.space.clone();
        let bus = bridge.root_bus();
        let options = ScanOptions {
            extended_config: options.extended_config && bridge.pcie,
            ..*options
        };

        log::info!("pci: scanning {} from bus {bus:02x}", self.device(host).name());
        self.scan_bus(host, &space, bus, &options)
    }

    /// Probe every function on `bus`, which is decoded by `bus_dev`
    pub fn scan_bus(
        &mut self,
        bus_dev: DevId,
        space: &Arc<dyn ConfigSpace>,
        bus: u8,
        options: &ScanOptions,
    ) -> io::Result<()> {
        for dev in 0..32 {
            let mut multifunction = false;
            for func in 0..8 {
                if func > 0 && !multifunction {
                    break;
                }

                let cfg = CfgHandle::new(space.clone(), BusAddr::new(bus, dev, func));
                if cfg.read_u16(reg::VENDOR_ID) == 0xffff {
                    if func == 0 {
                        break;
                    }
                    continue;
                }

                if func == 0 {
                    multifunction = cfg.read_u8(reg::HEADER_TYPE) & 0x80 != 0;
                }

                self.probe_function(bus_dev, cfg, options)?;
            }
        }
        Ok(())
    }

    fn probe_function(
        &mut self,
        bus_dev: DevId,
        cfg: CfgHandle,
        options: &ScanOptions,
    ) -> io::Result<()> {
        let addr = cfg.addr();
        if let Some(existing) = self.child_by_adr(bus_dev, addr.adr(), false) {
            if self.pci(existing).is_some() {
                return Ok(());
            }
        }

        let ident = DeviceIdent::read(&cfg);
        let class = FunctionClass::classify(ident.class_code(), cfg.read_u8(reg::HEADER_TYPE));
        let Some(constructor) = class.constructor() else {
            log::warn!("{addr:?}: no driver for {class:?}");
            return Err(Error::Unsupported);
        };

        let Some(dev) = self.child_by_adr(bus_dev, addr.adr(), true) else {
            return Err(Error::NotFound);
        };
        self.set_name(dev, format!("pci{addr:?}"));
        log::debug!("{addr:?}:{ident:?}");

        let space = cfg.space().clone();
        let func = constructor(self, dev, cfg, options)?;
        let secondary = func.bridge().and_then(Bridge::secondary);
        self.add_feature(dev, Feature::Pci(func));

        if let Some(secondary) = secondary {
            self.scan_bus(dev, &space, secondary, options)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{mock::MockConfig, *};
    use crate::{
        config::WindowConfig,
        dev::{tests::tree, PmState, RootOptions},
        dma::DmaPolicy,
        resource::ResId,
    };
    use alloc::{string::String, vec, vec::Vec};

    const PCI_BRIDGE: u16 = 0x0604;
    const ETHERNET: u16 = 0x0200;

    struct Fixture {
        tree: DeviceTree,
        root: DevId,
        host: DevId,
    }

    fn fixture(
        mock: &Arc<MockConfig>,
        bus_range: RangeInclusive<u8>,
        windows: Vec<WindowConfig>,
    ) -> Fixture {
        let mut tree = tree();
        let root = tree
            .add_system_bus(&RootOptions {
                phys_bits: 32,
                io_alloc_base: 0x1000,
                dma_policy: DmaPolicy::PerDevice,
            })
            .unwrap();
        let config = HostBridgeConfig {
            name: String::from("pci0"),
            ecam: None,
            bus_range,
            pcie: true,
            windows,
        };
        let host = tree.add_host_bridge(root, mock.clone(), &config).unwrap();
        Fixture { tree, root, host }
    }

    impl Fixture {
        fn scan(&mut self) {
            let options = ScanOptions {
                expansion_rom: false,
                acs: true,
                extended_config: true,
            };
            self.tree.scan_host_bridge(self.host, &options).unwrap();
            self.tree.request_child_resources(self.root);
            self.tree.plugin(self.root);
        }

        fn find(&self, addr: BusAddr) -> DevId {
            self.tree.find_by_name(&format!("pci{addr:?}")).unwrap()
        }

        fn bridge(&self, addr: BusAddr) -> &Bridge {
            self.tree.pci(self.find(addr)).unwrap().bridge().unwrap()
        }

        fn res(&self, addr: BusAddr, tag: ResTag) -> ResId {
            self.tree.resource_by_tag(self.find(addr), tag).unwrap()
        }
    }

    fn add_bridge(mock: &MockConfig, addr: BusAddr, primary: u8, secondary: u8, subordinate: u8) {
        mock.add(addr, 0x8086, 0x2448, PCI_BRIDGE, 1);
        let numbers =
            u32::from(subordinate) << 16 | u32::from(secondary) << 8 | u32::from(primary);
        mock.set(addr, 0x18, numbers, 0x00ff_ffff);
        mock.set(addr, 0x1c, 0, 0xffff_f0f0);
        mock.set(addr, 0x20, 0, 0xfff0_fff0);
        mock.set(addr, 0x24, 0, 0xfff0_fff0);
    }

    #[test]
    fn sibling_bridges_keep_their_numbers() {
        let mock = MockConfig::new();
        let port = BusAddr::new(0, 1, 0);
        let left = BusAddr::new(1, 0, 0);
        let right = BusAddr::new(1, 1, 0);
        let stale = BusAddr::new(0, 2, 0);
        add_bridge(&mock, port, 0, 1, 1);
        add_bridge(&mock, left, 1, 2, 2);
        add_bridge(&mock, right, 1, 3, 3);
        add_bridge(&mock, stale, 0, 0, 0);

        let mut sys = fixture(&mock, 0..=255, vec![]);
        sys.scan();

        assert_eq!(sys.bridge(left).secondary(), Some(2));
        assert_eq!(sys.bridge(right).secondary(), Some(3));
        assert_eq!(sys.bridge(port).subordinate(), 3);
        assert_eq!(mock.get(port, 0x18), 0x0003_0100);

        let port_bus = sys.tree.resource(sys.res(port, ResTag::BUS));
        assert_eq!((port_bus.start(), port_bus.end()), (1, 3));
        let left_bus = sys.res(left, ResTag::BUS);
        assert_eq!(sys.tree.resource(left_bus).parent(), Some(sys.res(port, ResTag::BUS)));
        assert!(sys.tree.resource(sys.res(right, ResTag::BUS)).enabled());

        // Unprogrammed bridge gets the next free number.
        assert_eq!(sys.bridge(stale).secondary(), Some(4));
        assert_eq!(mock.get(stale, 0x18), 0x0004_0400);
        assert_eq!(sys.tree.host_bridge(sys.host).unwrap().subordinate(), 4);
    }

    #[test]
    fn nested_bridges_chain_windows() {
        let mock = MockConfig::new();
        let port = BusAddr::new(0, 1, 0);
        let inner = BusAddr::new(1, 0, 0);
        let nic = BusAddr::new(2, 0, 0);
        add_bridge(&mock, port, 0, 0, 0);
        add_bridge(&mock, inner, 0, 0, 0);
        mock.add(nic, 0x8086, 0x10d3, ETHERNET, 0);
        mock.bar(nic, 0, 0, 0x1000, 0);
        mock.bar(nic, 1, 0, 0x100, 0x1);

        let window = WindowConfig {
            kind: WindowKind::Mmio,
            range: 0xc000_0000..=0xcfff_ffff,
        };
        let mut sys = fixture(&mock, 0..=255, vec![window]);
        sys.scan();

        assert_eq!(sys.bridge(port).secondary(), Some(1));
        assert_eq!(sys.bridge(inner).secondary(), Some(2));
        assert_eq!(sys.bridge(port).subordinate(), 2);
        assert_eq!(mock.get(port, 0x18), 0x0002_0100);
        assert_eq!(mock.get(inner, 0x18), 0x0002_0201);
        let port_bus = sys.tree.resource(sys.res(port, ResTag::BUS));
        assert_eq!((port_bus.start(), port_bus.end()), (1, 2));

        let port_win = sys.res(port, ResTag::window(0));
        let inner_win = sys.tree.resource(sys.res(inner, ResTag::window(0)));
        assert_eq!(inner_win.parent(), Some(port_win));
        assert_eq!((inner_win.start(), inner_win.end()), (0xc000_0000, 0xc00f_ffff));
        let port_win = sys.tree.resource(port_win);
        assert_eq!((port_win.start(), port_win.end()), (0xc000_0000, 0xc00f_ffff));
        assert_eq!(port_win.parent(), sys.tree.resource_by_tag(sys.host, ResTag::window(0)));

        // No I/O window on the host bridge, the port window comes from the root.
        let port_io = sys.tree.resource(sys.res(port, ResTag::window(2)));
        assert_eq!((port_io.start(), port_io.end()), (0x1000, 0x1fff));
        assert!(port_io.enabled());

        let bar0 = sys.tree.resource(sys.res(nic, ResTag::bar(0)));
        let bar1 = sys.tree.resource(sys.res(nic, ResTag::bar(1)));
        assert_eq!(bar0.start(), 0xc000_0000);
        assert_eq!(bar1.start(), 0x1000);
        assert!(bar0.enabled() && bar1.enabled());

        for bridge in [port, inner] {
            assert_eq!(mock.get(bridge, 0x20), 0xc000_c000);
            assert_eq!(mock.get(bridge, 0x1c) & 0xffff, 0x1010);
            assert_eq!(mock.get(bridge, 0x04) & 0x7, 0x7);
        }
        assert_eq!(mock.get(nic, 0x10), 0xc000_0000);
        assert_eq!(mock.get(nic, 0x14), 0x1001);
        assert_eq!(mock.get(nic, 0x04) & 0x3, 0x3);
    }

    #[test]
    fn trusted_bus_number_collides_with_renumbered_sibling() {
        let mock = MockConfig::new();
        let stale = BusAddr::new(0, 1, 0);
        let trusted = BusAddr::new(0, 2, 0);
        add_bridge(&mock, stale, 0, 0, 0);
        add_bridge(&mock, trusted, 0, 1, 1);

        let mut sys = fixture(&mock, 0..=255, vec![]);
        sys.scan();

        // Firmware numbers are kept even when they clash, the clashing range is
        // simply never granted.
        assert_eq!(sys.bridge(stale).secondary(), Some(1));
        assert_eq!(sys.bridge(trusted).secondary(), Some(1));
        assert_eq!(mock.get(stale, 0x18), 0x0001_0100);
        assert_eq!(mock.get(trusted, 0x18), 0x0001_0100);

        let stale_bus = sys.res(stale, ResTag::BUS);
        let trusted_bus = sys.res(trusted, ResTag::BUS);
        assert!(sys.tree.resource_allocated(stale_bus));
        assert!(!sys.tree.resource_allocated(trusted_bus));
    }

    #[test]
    fn ecam_past_the_address_space_is_rejected() {
        let mut tree = tree();
        let root = tree
            .add_system_bus(&RootOptions {
                phys_bits: 32,
                io_alloc_base: 0x1000,
                dma_policy: DmaPolicy::PerDevice,
            })
            .unwrap();
        let config = HostBridgeConfig {
            name: String::from("pci0"),
            ecam: Some(u64::MAX - 0xfff),
            bus_range: 0..=255,
            pcie: true,
            windows: vec![],
        };
        let mock = MockConfig::new();
        assert_eq!(
            tree.add_host_bridge(root, mock, &config).err(),
            Some(Error::InvalidArgument)
        );
        assert_eq!(tree.find_by_name("pci0"), None);
    }

    #[test]
    fn bus_numbers_run_out() {
        let mock = MockConfig::new();
        let stale = BusAddr::new(0, 1, 0);
        add_bridge(&mock, stale, 0, 0, 0);

        let mut sys = fixture(&mock, 0..=0, vec![]);
        sys.scan();

        assert_eq!(sys.bridge(stale).secondary(), None);
        assert_eq!(sys.tree.resource_by_tag(sys.find(stale), ResTag::BUS), None);
        assert_eq!(mock.get(stale, 0x18), 0);
    }

    #[test]
    fn conflicting_io_bar_is_moved() {
        let mock = MockConfig::new();
        let uart = BusAddr::new(0, 3, 0);
        let other = BusAddr::new(0, 4, 0);
        for addr in [uart, other] {
            mock.add(addr, 0x1b36, 0x0002, 0x0700, 0);
            mock.set(addr, 0x04, 0x1, 0x0547);
        }
        mock.bar(uart, 0, 0x3f0, 16, 0x1);
        mock.bar(other, 0, 0x3f8, 8, 0x1);

        let mut sys = fixture(&mock, 0..=255, vec![]);
        sys.scan();

        let kept = sys.tree.resource(sys.res(uart, ResTag::bar(0)));
        assert_eq!((kept.start(), kept.end()), (0x3f0, 0x3ff));
        assert!(kept.enabled());

        let moved = sys.tree.resource(sys.res(other, ResTag::bar(0)));
        assert_eq!((moved.start(), moved.end()), (0x1000, 0x1007));
        assert!(moved.enabled());
        assert_eq!(mock.get(other, 0x10), 0x1001);
        assert_eq!(mock.get(other, 0x04) & 0x1, 0x1);
        assert_eq!(sys.tree.pm_state(sys.find(other)), PmState::Online);
    }

    #[test]
    fn bridge_window_grows_around_bars() {
        let mock = MockConfig::new();
        let port = BusAddr::new(0, 1, 0);
        let nic = BusAddr::new(1, 0, 0);
        add_bridge(&mock, port, 0, 1, 1);
        mock.add(nic, 0x8086, 0x10d3, ETHERNET, 0);
        mock.bar(nic, 0, 0, 0x1000, 0);
        mock.bar(nic, 1, 0, 0x10_0000, 0);

        let window = WindowConfig {
            kind: WindowKind::Mmio,
            range: 0xc000_0000..=0xcfff_ffff,
        };
        let mut sys = fixture(&mock, 0..=255, vec![window]);
        sys.scan();

        let win = sys.tree.resource(sys.res(port, ResTag::window(0)));
        assert_eq!((win.start(), win.end()), (0xc000_0000, 0xc01f_ffff));
        assert!(win.enabled());
        assert_eq!(win.parent(), sys.tree.resource_by_tag(sys.host, ResTag::window(0)));

        let bar1 = sys.tree.resource(sys.res(nic, ResTag::bar(1)));
        let bar0 = sys.tree.resource(sys.res(nic, ResTag::bar(0)));
        assert_eq!(bar1.start(), 0xc000_0000);
        assert_eq!(bar0.start(), 0xc010_0000);
        assert!(bar0.enabled() && bar1.enabled());

        assert_eq!(mock.get(port, 0x20), 0xc010_c000);
        assert_eq!(mock.get(port, 0x04) & 0x7, 0x7);
        assert_eq!(mock.get(nic, 0x10), 0xc010_0000);
        assert_eq!(mock.get(nic, 0x14), 0xc000_0000);
        assert_eq!(mock.get(nic, 0x04) & 0x3, 0x2);

        // The closed windows stay closed.
        assert!(sys.tree.resource(sys.res(port, ResTag::window(1))).empty());
        assert_eq!(mock.get(port, 0x24), 0x0000_fff0);
    }

    #[test]
    fn pins_are_swizzled_per_bridge() {
        let mock = MockConfig::new();
        let port = BusAddr::new(0, 1, 0);
        let nic = BusAddr::new(1, 2, 0);
        add_bridge(&mock, port, 0, 1, 1);
        mock.add(nic, 0x8086, 0x10d3, ETHERNET, 0);
        mock.set(nic, 0x3c, 0x0100, 0x00ff);

        let mut sys = fixture(&mock, 0..=255, vec![]);
        sys.scan();

        let pin = sys.tree.resource(sys.res(nic, ResTag::PIN));
        assert_eq!(pin.start(), 3);
        assert_eq!(pin.parent(), Some(sys.res(port, ResTag::IRQ_ROUTER)));
    }

    #[test]
    fn info_reports_capabilities() {
        let mock = MockConfig::new();
        let nvme = BusAddr::new(0, 5, 0);
        mock.add(nvme, 0x144d, 0xa808, 0x0108, 0);
        mock.set(nvme, 0x08, 0x0108_0200, 0);
        mock.set(nvme, 0x04, 1 << 20, 0x0547);
        mock.set(nvme, 0x34, 0x40, 0);
        mock.cap(nvme, 0x40, caps::CAP_PCIE, 0, 0x0002);
        mock.set(nvme, 0x44, 1 << 3, 0);
        mock.set(nvme, 0x100, 1 << 16 | u32::from(caps::EXT_CAP_ACS), 0);
        mock.set(nvme, 0x104, 0x001f, 0x001f << 16);

        let mut sys = fixture(&mock, 0..=255, vec![]);
        sys.scan();

        let info = sys.tree.pci(sys.find(nvme)).unwrap().info();
        assert_eq!(info.addr, nvme);
        assert_eq!((info.ident.vendor, info.ident.device), (0x144d, 0xa808));
        assert_eq!(format!("{:?}", info.ident), "[0x144d:0xa808]: NVMe Controller");
        assert_eq!(info.msi_source_id, 0x5_0028);
        assert!(info.acs_enabled);
        assert_eq!(info.port_type, Some(PortType::ENDPOINT));
    }

    #[test]
    fn resume_restores_header() {
        let mock = MockConfig::new();
        let nic = BusAddr::new(0, 2, 0);
        mock.add(nic, 0x8086, 0x10d3, ETHERNET, 0);
        mock.set(nic, 0x04, 0x2, 0x0547);
        mock.bar(nic, 0, 0xfebc_0000, 0x2_0000, 0);

        let mut sys = fixture(&mock, 0..=255, vec![]);
        sys.scan();
        let dev = sys.find(nic);

        sys.tree.pm_suspend(dev).unwrap();
        let cfg = CfgHandle::new(mock.clone(), nic);
        cfg.write_u32(0x10, 0);
        cfg.write_u16(0x04, 0);

        sys.tree.pm_resume(dev).unwrap();
        assert_eq!(mock.get(nic, 0x10), 0xfebc_0000);
        assert_eq!(mock.get(nic, 0x04) & 0x2, 0x2);
    }

    #[test]
    fn classification() {
        assert_eq!(FunctionClass::classify(0x0604, 0x81), FunctionClass::PciBridge);
        assert_eq!(FunctionClass::classify(0x0607, 0x02), FunctionClass::CardbusBridge);
        assert_eq!(FunctionClass::classify(0x0604, 0x00), FunctionClass::Device);
        assert_eq!(FunctionClass::classify(0x0200, 0x00), FunctionClass::Device);
        for (class, _) in &CONSTRUCTORS {
            assert!(class.constructor().is_some());
        }
    }
}
