/*
 * Copyright (c) 2023 xvanc and contributors
 * SPDX-License-Identifier: BSD-3-Clause
 */

//! Platform description from a flattened device tree

use crate::{
    config::{HostBridgeConfig, WindowConfig, WindowKind},
    mem::{MemoryKind, MemoryMap, MemoryRegion},
};
use ::fdt as libfdt;
use alloc::{boxed::Box, format, vec::Vec};
use core::ops::RangeInclusive;
use libfdt::node::FdtNode;

const ECAM_COMPAT: &[&str] = &["pci-host-ecam-generic"];

pub fn match_fdt_node(node: &FdtNode, matches: &[&str]) -> bool {
    if let Some(compat) = node.compatible() {
        compat.all().any(|c| matches.contains(&c))
    } else {
        false
    }
}

fn cells(value: &[u8]) -> impl Iterator<Item = u32> + '_ {
    value
        .chunks_exact(4)
        .map(|c| c.try_into().map_or(0, u32::from_be_bytes))
}

fn read_cells(cells: &mut impl Iterator<Item = u32>, count: usize) -> Option<u64> {
    (0..count).try_fold(0u64, |acc, _| Some(acc << 32 | u64::from(cells.next()?)))
}

fn is_memory_node(node: &FdtNode) -> bool {
    let device_type = node.property("device_type").and_then(|p| p.as_str());
    device_type == Some("memory") || node.name == "memory" || node.name.starts_with("memory@")
}

fn regions_of(node: &FdtNode, kind: MemoryKind, out: &mut Vec<MemoryRegion>) {
    let Some(reg) = node.reg() else { return };
    for region in reg {
        let Some(size) = region.size.filter(|&size| size != 0) else {
            continue;
        };
        let start = region.starting_address as u64;
        out.push(MemoryRegion::new(start, start + size as u64 - 1, kind));
    }
}

/// Memory layout described by a device tree
///
/// Memory nodes are reported as RAM. Entries of the memory reservation block and
/// children of `/reserved-memory` that have a `reg` are reported as reserved.
pub struct FdtMemoryMap<'a> {
    fdt: &'a libfdt::Fdt<'a>,
}

impl<'a> FdtMemoryMap<'a> {
    pub fn new(fdt: &'a libfdt::Fdt<'a>) -> FdtMemoryMap<'a> {
        Self { fdt }
    }

    fn collect(&self) -> Vec<MemoryRegion> {
        let mut regions = Vec::new();

        for node in self.fdt.all_nodes().filter(is_memory_node) {
            regions_of(&node, MemoryKind::Ram, &mut regions);
        }

        for rsv in self.fdt.memory_reservations() {
            if rsv.size() == 0 {
                continue;
            }
            let start = rsv.address() as u64;
            regions.push(MemoryRegion::new(
                start,
                start + rsv.size() as u64 - 1,
                MemoryKind::Reserved,
            ));
        }

        if let Some(reserved) = self.fdt.find_node("/reserved-memory") {
            for child in reserved.children() {
                regions_of(&child, MemoryKind::Reserved, &mut regions);
            }
        }

        regions
    }
}

impl MemoryMap for FdtMemoryMap<'_> {
    fn regions(&self) -> Box<dyn Iterator<Item = MemoryRegion> + '_> {
        Box::new(self.collect().into_iter())
    }
}

fn bus_range(node: &FdtNode) -> Option<RangeInclusive<u8>> {
    let Some(property) = node.property("bus-range") else {
        return Some(0..=255);
    };
    let mut values = cells(property.value);
    let start = u8::try_from(values.next()?).ok()?;
    let end = u8::try_from(values.next()?).ok()?;
    (start <= end).then_some(start..=end)
}

// Each `ranges` entry is a 3-cell PCI address, a parent address and a size. The
// windows are recorded in bus address space.
fn windows(node: &FdtNode, parent_address_cells: usize) -> Vec<WindowConfig> {
    let mut windows = Vec::new();
    let Some(ranges) = node.property("ranges") else {
        return windows;
    };
    let size_cells = node.cell_sizes().size_cells;

    let mut values = cells(ranges.value);
    while let Some(space) = values.next() {
        let Some(pci_addr) = read_cells(&mut values, 2) else { break };
        let Some(_cpu_addr) = read_cells(&mut values, parent_address_cells) else { break };
        let Some(size) = read_cells(&mut values, size_cells) else { break };
        if size == 0 {
            continue;
        }

        let kind = match (space >> 24) & 0x3 {
            0x1 => WindowKind::Io,
            0x2 | 0x3 if space & (1 << 30) != 0 => WindowKind::Prefetchable,
            0x2 | 0x3 => WindowKind::Mmio,
            _ => {
                log::warn!("{}: ignoring configuration space range", node.name);
                continue;
            }
        };
        windows.push(WindowConfig {
            kind,
            range: pci_addr..=pci_addr + (size - 1),
        });
    }
    windows
}

/// Every generic ECAM host bridge in the tree, named `pci0`, `pci1` and so on
pub fn host_bridges(fdt: &libfdt::Fdt) -> Vec<HostBridgeConfig> {
    let parent_address_cells = fdt.root().cell_sizes().address_cells;
    let mut bridges = Vec::new();

    for node in fdt.all_nodes().filter(|node| match_fdt_node(node, ECAM_COMPAT)) {
        let Some(ecam) = node.reg().and_then(|mut reg| reg.next()) else {
            log::warn!("{}: no configuration space", node.name);
            continue;
        };
        let Some(bus_range) = bus_range(&node) else {
            log::warn!("{}: invalid bus-range", node.name);
            continue;
        };

        let config = HostBridgeConfig {
            name: format!("pci{}", bridges.len()),
            ecam: Some(ecam.starting_address as u64),
            bus_range,
            pcie: true,
            windows: windows(&node, parent_address_cells),
        };
        log::debug!(
            "{}: host bridge @ {:#x}, bus range: {:?}",
            node.name,
            ecam.starting_address as u64,
            config.bus_range
        );
        bridges.push(config);
    }

    bridges
}
