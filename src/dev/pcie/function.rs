// SPDX-FileCopyrightText:  2022-2023 xvanc and contributors
// SPDX-License-Identifier: BSD-3-Clause

use super::{
    bar::{self, Bar},
    bridge::{Bridge, BridgeKind},
    caps::{Capabilities, PortType},
    config::{BusAddr, CfgHandle},
    reg, CommandRegister, DeviceIdent, FunctionClass, ScanOptions,
};
use crate::{
    dev::{DevId, DeviceTree},
    io,
    resource::{ResId, ResTag, Resource, ResourceFlags, ResourceType},
};
use alloc::vec::Vec;

const DECODERS: CommandRegister = CommandRegister::IO_SPACE.union(CommandRegister::MEMORY_SPACE);

/// Registers saved across suspend, the whole type 0/1 header
const SAVED_DWORDS: usize = 16;

/// What a client may learn about a PCI function
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PciInfo {
    pub addr: BusAddr,
    pub ident: DeviceIdent,
    /// Requester id used to validate message signalled interrupts from the function
    pub msi_source_id: u32,
    pub acs_enabled: bool,
    pub port_type: Option<PortType>,
}

/// A PCI function and what discovery learned about it
pub struct Function {
    pub(super) cfg: CfgHandle,
    ident: DeviceIdent,
    header_type: u8,
    class: FunctionClass,
    /// BAR index and the resource describing it
    bars: Vec<(u8, ResId)>,
    rom: Option<ResId>,
    caps: Capabilities,
    pub(super) bridge: Option<Bridge>,
    saved: Option<[u32; SAVED_DWORDS]>,
}

pub(super) fn device(
    tree: &mut DeviceTree,
    dev: DevId,
    cfg: CfgHandle,
    options: &ScanOptions,
) -> io::Result<Function> {
    Function::discover(tree, dev, cfg, FunctionClass::Device, options)
}

pub(super) fn pci_bridge(
    tree: &mut DeviceTree,
    dev: DevId,
    cfg: CfgHandle,
    options: &ScanOptions,
) -> io::Result<Function> {
    let mut func = Function::discover(tree, dev, cfg, FunctionClass::PciBridge, options)?;
    func.attach_bridge(tree, dev, BridgeKind::Pci)?;
    Ok(func)
}

pub(super) fn cardbus_bridge(
    tree: &mut DeviceTree,
    dev: DevId,
    cfg: CfgHandle,
    options: &ScanOptions,
) -> io::Result<Function> {
    let mut func = Function::discover(tree, dev, cfg, FunctionClass::CardbusBridge, options)?;
    func.attach_bridge(tree, dev, BridgeKind::Cardbus)?;
    Ok(func)
}

impl Function {
    fn discover(
        tree: &mut DeviceTree,
        dev: DevId,
        cfg: CfgHandle,
        class: FunctionClass,
        options: &ScanOptions,
    ) -> io::Result<Function> {
        let ident = DeviceIdent::read(&cfg);
        let header_type = cfg.read_u8(reg::HEADER_TYPE) & 0x7f;
        let command = CommandRegister::from_bits_retain(cfg.read_u16(reg::COMMAND));

        // Sizing writes all-ones into the BARs, the function must not decode them
        // meanwhile.
        let quiet = (command - DECODERS) | CommandRegister::INTERRUPT_DISABLE;
        cfg.write_u16(reg::COMMAND, quiet.bits());

        let mut sized = Vec::new();
        let mut index = 0;
        while index < class.bar_count() {
            match Bar::probe(&cfg, index, class.bar_count()) {
                Some(bar) => {
                    index += bar.slots();
                    sized.push(bar);
                }
                None => index += 1,
            }
        }

        let rom_reg = match class {
            FunctionClass::Device => Some(reg::ROM),
            FunctionClass::PciBridge => Some(reg::BRIDGE_ROM),
            FunctionClass::CardbusBridge => None,
        };
        let rom = rom_reg
            .filter(|_| options.expansion_rom)
            .and_then(|reg| bar::probe_rom(&cfg, reg));

        cfg.write_u16(reg::COMMAND, command.bits());

        let mut bars = Vec::with_capacity(sized.len());
        for bar in sized {
            let decoder = match bar.kind {
                bar::BarKind::Io => CommandRegister::IO_SPACE,
                bar::BarKind::Memory32 | bar::BarKind::Memory64 => CommandRegister::MEMORY_SPACE,
            };
            // A zero base was never assigned, leave it to the allocator.
            let placed = command.contains(decoder) && bar.base != 0;
            let res = bar.resource(placed);
            let id = if placed {
                tree.add_resource_rq(dev, res)?
            } else {
                tree.add_resource(dev, res)?
            };
            bars.push((bar.index, id));
        }

        let rom = match rom {
            Some(mut rom) => {
                rom.disable();
                Some(tree.add_resource(dev, rom)?)
            }
            None => None,
        };

        let cap_ptr = if class == FunctionClass::CardbusBridge {
            reg::CARDBUS_CAP_PTR
        } else {
            reg::CAP_PTR
        };
        let mut caps = Capabilities::discover(&cfg, cap_ptr);
        if caps.pcie.is_some() && options.extended_config {
            caps.discover_extended(&cfg, options.acs);
        }

        let pin = cfg.read_u8(reg::INTERRUPT_PIN);
        if (1..=4).contains(&pin) {
            let pin = Resource::with_range(
                ResourceType::Irq,
                ResourceFlags::HIERARCHICAL | ResourceFlags::RELATIVE,
                u64::from(pin - 1),
                u64::from(pin - 1),
            )
            .tagged(ResTag::PIN);
            tree.add_resource_rq(dev, pin)?;
        }

        if let Some(bus_dev) = tree.parent(dev) {
            tree.dma_domain_for(bus_dev, Some(dev))?;
        }

        Ok(Self {
            cfg,
            ident,
            header_type,
            class,
            bars,
            rom,
            caps,
            bridge: None,
            saved: None,
        })
    }

    fn attach_bridge(
        &mut self,
        tree: &mut DeviceTree,
        dev: DevId,
        kind: BridgeKind,
    ) -> io::Result<()> {
        let command = CommandRegister::from_bits_retain(self.cfg.read_u16(reg::COMMAND));
        self.bridge = Some(Bridge::discover(tree, dev, &self.cfg, kind, command)?);

        // Requests forwarded by a PCI Express to PCI bridge carry the bridge's id, so
        // nothing behind it can be told apart.
        match self.caps.pcie {
            Some(cap) if cap.port_type == PortType::PCIE_TO_PCI_BRIDGE => {
                if let Some(bus_dev) = tree.parent(dev) {
                    if let Some(domain) = tree.dma_domain_for(bus_dev, None)? {
                        tree.set_downstream_dma_domain(dev, domain);
                    }
                }
            }
            Some(_) => {}
            None => {
                if let Some(domain) = tree.dma_domain(dev) {
                    tree.set_downstream_dma_domain(dev, domain);
                }
            }
        }
        Ok(())
    }

    pub fn cfg(&self) -> &CfgHandle {
        &self.cfg
    }

    pub fn addr(&self) -> BusAddr {
        self.cfg.addr()
    }

    pub fn ident(&self) -> DeviceIdent {
        self.ident
    }

    pub fn header_type(&self) -> u8 {
        self.header_type
    }

    pub fn class(&self) -> FunctionClass {
        self.class
    }

    pub fn bars(&self) -> &[(u8, ResId)] {
        &self.bars
    }

    pub fn rom(&self) -> Option<ResId> {
        self.rom
    }

    pub fn caps(&self) -> &Capabilities {
        &self.caps
    }

    pub fn bridge(&self) -> Option<&Bridge> {
        self.bridge.as_ref()
    }

    pub fn msi_source_id(&self) -> u32 {
        let addr = self.addr();
        let phantom = self.caps.pcie.map_or(0, |cap| cap.phantom_functions);
        0x4_0000 | u32::from(phantom) << 16 | u32::from(addr.bus) << 8 | u32::from(addr.devfn())
    }

    pub fn info(&self) -> PciInfo {
        PciInfo {
            addr: self.addr(),
            ident: self.ident,
            msi_source_id: self.msi_source_id(),
            acs_enabled: self.caps.acs_enabled,
            port_type: self.caps.pcie.map(|cap| cap.port_type),
        }
    }

    /// Program the placed resources into the function and turn on decoding
    ///
    /// A decoder is only enabled if every BAR of its type took the address written to
    /// it. Returns whether all of them did.
    pub fn setup(&self, tree: &DeviceTree, dev: DevId) -> bool {
        let mut confirmed = CommandRegister::empty();
        let mut refused = CommandRegister::empty();

        for &(index, id) in &self.bars {
            let res = tree.resource(id);
            if res.disabled() || !tree.resource_allocated(id) {
                continue;
            }
            let decoder = if res.ty() == ResourceType::Io {
                CommandRegister::IO_SPACE
            } else {
                CommandRegister::MEMORY_SPACE
            };
            if Bar::write(&self.cfg, index, res) {
                confirmed |= decoder;
            } else {
                log::error!("{}: BAR{index} refused {res}", tree.device(dev).name());
                refused |= decoder;
            }
        }

        if let Some(id) = self.rom {
            let res = tree.resource(id);
            if res.enabled() && tree.resource_allocated(id) {
                let reg = if self.class == FunctionClass::PciBridge {
                    reg::BRIDGE_ROM
                } else {
                    reg::ROM
                };
                self.cfg.write_u32(reg, res.start() as u32 & !0x7ff);
            }
        }

        let mut command = CommandRegister::from_bits_retain(self.cfg.read_u16(reg::COMMAND));
        command |= confirmed - refused;
        if let Some(bridge) = &self.bridge {
            bridge.program(tree, &self.cfg);
            command |= DECODERS | CommandRegister::BUS_MASTER;
        }
        self.cfg.write_u16(reg::COMMAND, command.bits());

        log::debug!("{:?}: command {command:?}", self.addr());
        refused.is_empty()
    }

    pub fn save_state(&mut self) {
        let mut regs = [0; SAVED_DWORDS];
        for (i, value) in regs.iter_mut().enumerate() {
            *value = self.cfg.read_u32(4 * i as u16);
        }
        self.saved = Some(regs);
    }

    /// Write back the header saved by [`Function::save_state`], command register last
    pub fn restore_state(&self) {
        let Some(regs) = &self.saved else {
            return;
        };
        for (i, &value) in regs.iter().enumerate().skip(3) {
            self.cfg.write_u32(4 * i as u16, value);
        }
        self.cfg.write_u16(reg::COMMAND, regs[1] as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::pcie::{caps::PcieCap, mock::MockConfig};

    #[test]
    fn source_id_includes_phantom_bits() {
        let mock = MockConfig::new();
        let addr = BusAddr::new(3, 2, 1);
        mock.add(addr, 0x10de, 0x1eb8, 0x0302, 0);
        let caps = Capabilities {
            pcie: Some(PcieCap {
                offset: 0x60,
                port_type: PortType::ENDPOINT,
                phantom_functions: 2,
            }),
            ..Capabilities::default()
        };
        let func = Function {
            cfg: CfgHandle::new(mock, addr),
            ident: DeviceIdent {
                vendor: 0x10de,
                device: 0x1eb8,
                class: 0x03,
                subclass: 0x02,
                prog_if: 0,
                revision: 0xa1,
            },
            header_type: 0,
            class: FunctionClass::Device,
            bars: Vec::new(),
            rom: None,
            caps,
            bridge: None,
            saved: None,
        };

        assert_eq!(func.msi_source_id(), 0x6_0311);
        assert_eq!(func.info().port_type, Some(PortType::ENDPOINT));
    }
}
