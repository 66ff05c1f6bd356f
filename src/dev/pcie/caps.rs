// SPDX-FileCopyrightText:  2023 xvanc and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! Capability lists

use super::config::CfgHandle;
use alloc::vec::Vec;

const STATUS_CAP_LIST: u16 = 1 << 4;

pub const CAP_PM: u8 = 0x01;
pub const CAP_MSI: u8 = 0x05;
pub const CAP_PCIE: u8 = 0x10;

pub const EXT_CAP_ACS: u16 = 0x0d;
const EXT_CAP_START: u16 = 0x100;

/// Upper bound on list entries, a malformed list may loop
const MAX_CAPS: usize = 48;
const MAX_EXT_CAPS: usize = 960;

bitflags::bitflags! {
    /// ACS capability and control bits
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct AcsFlags : u16 {
        const SOURCE_VALIDATION     = 1 << 0;
        const TRANSLATION_BLOCKING  = 1 << 1;
        const REQUEST_REDIRECT      = 1 << 2;
        const COMPLETION_REDIRECT   = 1 << 3;
        const UPSTREAM_FORWARDING   = 1 << 4;
        const EGRESS_CONTROL        = 1 << 5;
        const DIRECT_TRANSLATED_P2P = 1 << 6;
    }
}

/// PCI Express device/port type
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortType(pub u8);

impl PortType {
    pub const ENDPOINT: PortType = PortType(0x0);
    pub const LEGACY_ENDPOINT: PortType = PortType(0x1);
    pub const ROOT_PORT: PortType = PortType(0x4);
    pub const UPSTREAM_PORT: PortType = PortType(0x5);
    pub const DOWNSTREAM_PORT: PortType = PortType(0x6);
    pub const PCIE_TO_PCI_BRIDGE: PortType = PortType(0x7);
    pub const PCI_TO_PCIE_BRIDGE: PortType = PortType(0x8);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MsiCap {
    pub offset: u8,
    pub is_64bit: bool,
    pub per_vector_masking: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PcieCap {
    pub offset: u8,
    pub port_type: PortType,
    /// Function number bits the device may borrow for requester ids
    pub phantom_functions: u8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExtCap {
    pub id: u16,
    pub version: u8,
    pub offset: u16,
}

#[derive(Clone, Debug, Default)]
pub struct Capabilities {
    pub pm: Option<u8>,
    pub msi: Option<MsiCap>,
    pub pcie: Option<PcieCap>,
    pub extended: Vec<ExtCap>,
    pub acs_enabled: bool,
}

impl Capabilities {
    /// Walk the legacy list starting at the pointer register `ptr_reg`
    pub fn discover(cfg: &CfgHandle, ptr_reg: u16) -> Capabilities {
        let mut caps = Capabilities::default();

        if cfg.read_u16(0x06) & STATUS_CAP_LIST == 0 {
            return caps;
        }

        let mut offset = cfg.read_u8(ptr_reg) & !0x3;
        let mut steps = 0;
        while offset != 0 {
            steps += 1;
            if steps > MAX_CAPS || offset < 0x40 {
                log::warn!("{cfg:?}: malformed capability list");
                break;
            }

            let header = cfg.read_u16(offset.into());
            let id = header as u8;
            match id {
                CAP_PM => caps.pm = Some(offset),
                CAP_MSI => {
                    let control = cfg.read_u16(u16::from(offset) + 2);
                    caps.msi = Some(MsiCap {
                        offset,
                        is_64bit: control & (1 << 7) != 0,
                        per_vector_masking: control & (1 << 8) != 0,
                    });
                }
                CAP_PCIE => {
                    let flags = cfg.read_u16(u16::from(offset) + 2);
                    let devcap = cfg.read_u32(u16::from(offset) + 4);
                    caps.pcie = Some(PcieCap {
                        offset,
                        port_type: PortType(((flags >> 4) & 0xf) as u8),
                        phantom_functions: ((devcap >> 3) & 0x3) as u8,
                    });
                }
                _ => log::trace!("{cfg:?}: capability {id:#04x} at {offset:#04x}"),
            }

            offset = (header >> 8) as u8 & !0x3;
        }

        caps
    }

    /// Walk the extended list and apply the ACS policy if `acs` is set
    pub fn discover_extended(&mut self, cfg: &CfgHandle, acs: bool) {
        let mut offset = EXT_CAP_START;
        for _ in 0..MAX_EXT_CAPS {
            let header = cfg.read_u32(offset);
            let id = header as u16;
            if offset == EXT_CAP_START && (header == 0 || id == 0xffff) {
                return;
            }

            let version = ((header >> 16) & 0xf) as u8;
            if id != 0 && id != 0xffff && version > 0 {
                self.extended.push(ExtCap {
                    id,
                    version,
                    offset,
                });
                if id == EXT_CAP_ACS {
                    self.acs_enabled = apply_acs(cfg, offset, acs);
                }
            }

            let next = ((header >> 20) & 0xffc) as u16;
            if next < EXT_CAP_START {
                return;
            }
            offset = next;
        }
        log::warn!("{cfg:?}: extended capability list does not terminate");
    }

    pub fn extended(&self, id: u16) -> Option<ExtCap> {
        self.extended.iter().copied().find(|cap| cap.id == id)
    }
}

// Turn on every isolation feature the function has except egress control. Returns
// whether the control register reads back as requested.
fn apply_acs(cfg: &CfgHandle, offset: u16, write: bool) -> bool {
    let available = AcsFlags::from_bits_truncate(cfg.read_u16(offset + 4));
    if !write {
        return !AcsFlags::from_bits_truncate(cfg.read_u16(offset + 6)).is_empty();
    }

    let wanted = available - AcsFlags::EGRESS_CONTROL;
    cfg.write_u16(offset + 6, wanted.bits());
    let actual = AcsFlags::from_bits_truncate(cfg.read_u16(offset + 6));

    if actual != wanted {
        log::warn!("{cfg:?}: ACS control reads {actual:?}, wrote {wanted:?}");
        return false;
    }
    !wanted.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::pcie::{config::BusAddr, mock::MockConfig};

    const ADDR: BusAddr = BusAddr::new(0, 1, 0);

    fn function_with_caps() -> alloc::sync::Arc<MockConfig> {
        let mock = MockConfig::new();
        mock.add(ADDR, 0x8086, 0x1234, 0x0200, 0);
        mock.set(ADDR, 0x04, u32::from(STATUS_CAP_LIST) << 16, 0x0000_0547);
        mock.set(ADDR, 0x34, 0x40, 0);
        mock.cap(ADDR, 0x40, CAP_PM, 0x50, 0);
        mock.cap(ADDR, 0x50, CAP_MSI, 0x63, 1 << 7);
        // PCI Express endpoint, one phantom function bit
        mock.cap(ADDR, 0x60, CAP_PCIE, 0, 0x0002);
        mock.set(ADDR, 0x64, 1 << 3, 0);
        mock
    }

    #[test]
    fn legacy_chain() {
        let mock = function_with_caps();
        let cfg = CfgHandle::new(mock, ADDR);
        let caps = Capabilities::discover(&cfg, 0x34);

        assert_eq!(caps.pm, Some(0x40));
        let msi = caps.msi.unwrap();
        assert!(msi.is_64bit && !msi.per_vector_masking);
        let pcie = caps.pcie.unwrap();
        assert_eq!(pcie.offset, 0x60);
        assert_eq!(pcie.port_type, PortType::ENDPOINT);
        assert_eq!(pcie.phantom_functions, 1);
    }

    #[test]
    fn looping_chain_terminates() {
        let mock = function_with_caps();
        mock.cap(ADDR, 0x60, CAP_PCIE, 0x40, 0x0002);
        let cfg = CfgHandle::new(mock, ADDR);
        let caps = Capabilities::discover(&cfg, 0x34);
        assert!(caps.pcie.is_some());
    }

    fn acs_function(control_writable: u32) -> CfgHandle {
        let mock = function_with_caps();
        // AER at 0x100, ACS at 0x140
        mock.set(ADDR, 0x100, 0x140 << 20 | 1 << 16 | 0x0001, 0);
        mock.set(ADDR, 0x140, 1 << 16 | u32::from(EXT_CAP_ACS), 0);
        mock.set(ADDR, 0x144, 0x007f, control_writable << 16);
        CfgHandle::new(mock, ADDR)
    }

    #[test]
    fn acs_enables_all_but_egress() {
        let cfg = acs_function(0x7f);
        let mut caps = Capabilities::discover(&cfg, 0x34);
        caps.discover_extended(&cfg, true);

        assert_eq!(caps.extended.len(), 2);
        assert_eq!(caps.extended(EXT_CAP_ACS).map(|c| c.offset), Some(0x140));
        assert!(caps.acs_enabled);
        assert_eq!(cfg.read_u16(0x146), 0x5f);
    }

    #[test]
    fn acs_write_dropped_by_hardware() {
        // Request redirect is hardwired off.
        let cfg = acs_function(0x7f & !0x4);
        let mut caps = Capabilities::discover(&cfg, 0x34);
        caps.discover_extended(&cfg, true);

        assert!(!caps.acs_enabled);
        assert_eq!(cfg.read_u16(0x146), 0x5b);
    }

    #[test]
    fn absent_extended_space() {
        let mock = function_with_caps();
        let cfg = CfgHandle::new(mock, ADDR);
        let mut caps = Capabilities::default();
        caps.discover_extended(&cfg, true);
        assert!(caps.extended.is_empty());
        assert!(!caps.acs_enabled);
    }
}
