// SPDX-FileCopyrightText:  2023 xvanc and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! The system bus, root of every device tree

use super::{DevId, DeviceTree};
use crate::{
    dma::DmaPolicy,
    io,
    mem::max_phys_addr,
    resource::{ResTag, Resource, ResourceFlags, ResourceSpace, ResourceType},
};

#[derive(Clone, Copy, Debug)]
pub struct RootOptions {
    pub phys_bits: u32,
    /// Lowest port handed out by root I/O allocation
    pub io_alloc_base: u64,
    pub dma_policy: DmaPolicy,
}

impl DeviceTree {
    /// Create the system bus with one root space per resource type
    pub fn add_system_bus(&mut self, options: &RootOptions) -> io::Result<DevId> {
        let root = self.add_root("system");
        self.set_hid(root, "SYSTEM");

        let max_phys = max_phys_addr(options.phys_bits);
        let roots = [
            Resource::with_range(ResourceType::Irq, ResourceFlags::empty(), 0, u64::from(u32::MAX))
                .providing(ResourceSpace::RootIrq)
                .tagged(ResTag::new("IRQ")),
            Resource::with_range(ResourceType::Mmio, ResourceFlags::WIDTH_64BIT, 0, max_phys)
                .providing(ResourceSpace::RootMmio)
                .tagged(ResTag::new("MMIO")),
            Resource::with_range(
                ResourceType::Mmio,
                ResourceFlags::WIDTH_64BIT | ResourceFlags::PREFETCHABLE,
                0,
                max_phys,
            )
            .providing(ResourceSpace::RootMmio)
            .tagged(ResTag::new("PMEM")),
            Resource::with_range(ResourceType::Io, ResourceFlags::empty(), 0, 0xffff)
                .providing(ResourceSpace::root_io(options.io_alloc_base))
                .tagged(ResTag::new("IO")),
            Resource::with_range(ResourceType::DmaDomain, ResourceFlags::empty(), 0, u64::MAX)
                .providing(ResourceSpace::RootDma)
                .tagged(ResTag::new("DMA")),
        ];
        for res in roots {
            self.add_resource(root, res)?;
        }

        match options.dma_policy {
            DmaPolicy::Shared => {
                let domain = self.dma.create_domain();
                self.set_downstream_dma_domain(root, domain);
            }
            DmaPolicy::PerDevice => self.set_dma_factory(root, true),
        }

        Ok(root)
    }
}
