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

//! The device tree
//!
//! Devices live in an arena and refer to each other by [`DevId`]. The resources they
//! own live in a second arena addressed by [`ResId`], so resource spaces can refer to
//! the resources they granted without borrowing the devices that own them.

mod arbiter;
#[cfg(feature = "fdt")]
pub mod fdt;
pub mod pcie;
mod root;

pub use root::RootOptions;

use crate::{
    dma::{DmaDomainId, DmaRegistry},
    io::{self, Error},
    mem::PhysSpace,
    resource::{ResId, ResTag, Resource, ResourceFlags, ResourceType},
};
use alloc::{string::String, vec::Vec};
use core::fmt::{self, Write};

/// Most resources a single device may own
pub const MAX_DEVICE_RESOURCES: usize = 64;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DevId(u32);

impl DevId {
    const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PmState {
    Disabled,
    Online,
    Suspended,
    /// Setup failed, the device stays unusable
    Failed,
}

/// Something a device can do beyond owning resources
pub enum Feature {
    Pci(pcie::Function),
    HostBridge(pcie::HostBridge),
}

pub struct Device {
    name: String,
    hid: Option<&'static str>,
    adr: Option<u32>,
    parent: Option<DevId>,
    children: Vec<DevId>,
    resources: Vec<ResId>,
    features: Vec<Feature>,
    pm: PmState,
    dma_domain: Option<DmaDomainId>,
    downstream_dma: Option<DmaDomainId>,
    dma_factory: bool,
}

impl Device {
    fn new(name: String, parent: Option<DevId>) -> Device {
        Self {
            name,
            hid: None,
            adr: None,
            parent,
            children: Vec::new(),
            resources: Vec::new(),
            features: Vec::new(),
            pm: PmState::Disabled,
            dma_domain: None,
            downstream_dma: None,
            dma_factory: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hid(&self) -> Option<&'static str> {
        self.hid
    }

    pub fn adr(&self) -> Option<u32> {
        self.adr
    }

    pub fn parent(&self) -> Option<DevId> {
        self.parent
    }

    pub fn children(&self) -> &[DevId] {
        &self.children
    }

    pub fn resources(&self) -> &[ResId] {
        &self.resources
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn pm_state(&self) -> PmState {
        self.pm
    }

    pub fn dma_domain(&self) -> Option<DmaDomainId> {
        self.dma_domain
    }
}

pub struct DeviceTree {
    devices: Vec<Device>,
    resources: Vec<Resource>,
    pub(crate) phys: PhysSpace,
    pub(crate) dma: DmaRegistry,
    roots: Vec<DevId>,
}

impl DeviceTree {
    pub fn new(phys: PhysSpace) -> DeviceTree {
        Self {
            devices: Vec::new(),
            resources: Vec::new(),
            phys,
            dma: DmaRegistry::new(),
            roots: Vec::new(),
        }
    }

    pub fn roots(&self) -> &[DevId] {
        &self.roots
    }

    pub fn phys(&self) -> &PhysSpace {
        &self.phys
    }

    pub fn dma(&self) -> &DmaRegistry {
        &self.dma
    }

    pub fn dma_mut(&mut self) -> &mut DmaRegistry {
        &mut self.dma
    }

    pub fn device(&self, dev: DevId) -> &Device {
        &self.devices[dev.index()]
    }

    /// Like [`DeviceTree::device`], for ids that come from outside the tree
    pub fn get(&self, dev: DevId) -> Option<&Device> {
        self.devices.get(dev.index())
    }

    fn device_mut(&mut self, dev: DevId) -> &mut Device {
        &mut self.devices[dev.index()]
    }

    pub fn resource(&self, res: ResId) -> &Resource {
        &self.resources[res.index()]
    }

    pub fn resource_mut(&mut self, res: ResId) -> &mut Resource {
        &mut self.resources[res.index()]
    }

    pub fn parent(&self, dev: DevId) -> Option<DevId> {
        self.device(dev).parent
    }

    pub fn children(&self, dev: DevId) -> &[DevId] {
        &self.device(dev).children
    }

    pub fn resources(&self, dev: DevId) -> &[ResId] {
        &self.device(dev).resources
    }

    pub fn iter_resources(&self, dev: DevId) -> impl Iterator<Item = (ResId, &Resource)> + '_ {
        self.resources(dev).iter().map(|&r| (r, self.resource(r)))
    }

    /// `dev` followed by its parent, grandparent and so on
    pub fn ancestors(&self, dev: DevId) -> impl Iterator<Item = DevId> + '_ {
        core::iter::successors(Some(dev), |&d| self.parent(d))
    }

    /// Depth-first, parents before children
    pub fn descendants(&self, dev: DevId) -> Vec<DevId> {
        let mut out = Vec::new();
        let mut stack = alloc::vec![dev];
        while let Some(d) = stack.pop() {
            out.push(d);
            stack.extend(self.children(d).iter().rev());
        }
        out
    }

    fn push_device(&mut self, device: Device) -> DevId {
        self.devices.push(device);
        DevId((self.devices.len() - 1) as u32)
    }

    pub fn add_root(&mut self, name: impl Into<String>) -> DevId {
        let id = self.push_device(Device::new(name.into(), None));
        self.roots.push(id);
        id
    }

    pub fn add_child(&mut self, parent: DevId, name: impl Into<String>) -> DevId {
        let id = self.push_device(Device::new(name.into(), Some(parent)));
        self.device_mut(parent).children.push(id);
        id
    }

    /// Find the child of `parent` at bus address `adr`, optionally creating it
    pub fn child_by_adr(&mut self, parent: DevId, adr: u32, create: bool) -> Option<DevId> {
        let existing = self
            .children(parent)
            .iter()
            .copied()
            .find(|&c| self.device(c).adr == Some(adr));
        if existing.is_some() || !create {
            return existing;
        }
        let child = self.add_child(parent, alloc::format!("{adr:#x}"));
        self.device_mut(child).adr = Some(adr);
        Some(child)
    }

    pub fn find_by_name(&self, name: &str) -> Option<DevId> {
        (0..self.devices.len() as u32)
            .map(DevId)
            .find(|&d| self.device(d).name == name)
    }

    pub fn set_name(&mut self, dev: DevId, name: impl Into<String>) {
        self.device_mut(dev).name = name.into();
    }

    pub fn set_hid(&mut self, dev: DevId, hid: &'static str) {
        self.device_mut(dev).hid = Some(hid);
    }

    pub fn add_feature(&mut self, dev: DevId, feature: Feature) {
        self.device_mut(dev).features.push(feature);
    }

    pub fn pci(&self, dev: DevId) -> Option<&pcie::Function> {
        self.device(dev).features.iter().find_map(|f| match f {
            Feature::Pci(func) => Some(func),
            Feature::HostBridge(_) => None,
        })
    }

    pub(crate) fn pci_mut(&mut self, dev: DevId) -> Option<&mut pcie::Function> {
        self.device_mut(dev).features.iter_mut().find_map(|f| match f {
            Feature::Pci(func) => Some(func),
            Feature::HostBridge(_) => None,
        })
    }

    pub fn host_bridge(&self, dev: DevId) -> Option<&pcie::HostBridge> {
        self.device(dev).features.iter().find_map(|f| match f {
            Feature::HostBridge(host) => Some(host),
            Feature::Pci(_) => None,
        })
    }

    pub(crate) fn host_bridge_mut(&mut self, dev: DevId) -> Option<&mut pcie::HostBridge> {
        self.device_mut(dev).features.iter_mut().find_map(|f| match f {
            Feature::HostBridge(host) => Some(host),
            Feature::Pci(_) => None,
        })
    }

    /// Give `res` to `dev`
    ///
    /// Fails with [`Error::Overflow`] once the device owns [`MAX_DEVICE_RESOURCES`]
    /// resources, at which point the enumeration step must be abandoned.
    pub fn add_resource(&mut self, dev: DevId, res: Resource) -> io::Result<ResId> {
        if self.device(dev).resources.len() >= MAX_DEVICE_RESOURCES {
            log::error!("{}: resource list overflow", self.device(dev).name);
            return Err(Error::Overflow);
        }
        self.resources.push(res);
        let id = ResId((self.resources.len() - 1) as u32);
        self.device_mut(dev).resources.push(id);
        Ok(id)
    }

    /// Give `res` to `dev` and immediately request it from the parent
    pub fn add_resource_rq(&mut self, dev: DevId, res: Resource) -> io::Result<ResId> {
        let id = self.add_resource(dev, res)?;
        self.request_resource(dev, id);
        Ok(id)
    }

    pub fn resource_by_tag(&self, dev: DevId, tag: ResTag) -> Option<ResId> {
        self.resources(dev)
            .iter()
            .copied()
            .find(|&r| self.resource(r).tag() == tag)
    }

    pub fn dma_domain(&self, dev: DevId) -> Option<DmaDomainId> {
        self.device(dev).dma_domain
    }

    pub fn set_downstream_dma_domain(&mut self, dev: DevId, domain: DmaDomainId) {
        self.device_mut(dev).downstream_dma = Some(domain);
    }

    /// Make `dev` hand out a fresh domain to every requester below it
    pub fn set_dma_factory(&mut self, dev: DevId, factory: bool) {
        self.device_mut(dev).dma_factory = factory;
    }

    /// Find or create the DMA domain for requests coming through `start`
    ///
    /// If `dev` is given, it is made a member of the domain.
    pub fn dma_domain_for(
        &mut self,
        start: DevId,
        dev: Option<DevId>,
    ) -> io::Result<Option<DmaDomainId>> {
        let mut found = None;
        let path: Vec<_> = self.ancestors(start).collect();
        for d in path {
            let device = self.device(d);
            if let Some(domain) = device.downstream_dma {
                found = Some(domain);
                break;
            }
            if device.dma_factory {
                found = Some(self.dma.create_domain());
                break;
            }
        }

        if let (Some(dev), Some(domain)) = (dev, found) {
            self.attach_dma_domain(dev, domain)?;
        }
        Ok(found)
    }

    pub fn attach_dma_domain(&mut self, dev: DevId, domain: DmaDomainId) -> io::Result<ResId> {
        let res = Resource::with_range(
            ResourceType::DmaDomain,
            ResourceFlags::HIERARCHICAL,
            domain.index(),
            domain.index(),
        )
        .tagged(ResTag::DMA_DOMAIN);
        self.device_mut(dev).dma_domain = Some(domain);
        self.add_resource_rq(dev, res)
    }

    pub fn pm_state(&self, dev: DevId) -> PmState {
        self.device(dev).pm
    }

    fn setup_features(&self, dev: DevId) -> bool {
        self.device(dev).features.iter().all(|feature| match feature {
            Feature::Pci(func) => func.setup(self, dev),
            Feature::HostBridge(_) => true,
        })
    }

    /// Place whatever is still pending and bring the device online
    pub fn pm_init(&mut self, dev: DevId) {
        if self.pm_state(dev) != PmState::Disabled {
            return;
        }

        self.allocate_pending_resources(dev);

        self.device_mut(dev).pm = if self.setup_features(dev) {
            PmState::Online
        } else {
            log::error!("{}: setup failed", self.device(dev).name);
            PmState::Failed
        };
    }

    /// Initialize `dev` and everything below it, parents first
    pub fn plugin(&mut self, dev: DevId) {
        self.pm_init(dev);
        let children = self.children(dev).to_vec();
        for child in children {
            self.plugin(child);
        }
    }

    pub fn pm_suspend(&mut self, dev: DevId) -> io::Result<()> {
        if self.pm_state(dev) != PmState::Online {
            return Err(Error::InvalidArgument);
        }
        for feature in &mut self.device_mut(dev).features {
            if let Feature::Pci(func) = feature {
                func.save_state();
            }
        }
        self.device_mut(dev).pm = PmState::Suspended;
        Ok(())
    }

    pub fn pm_resume(&mut self, dev: DevId) -> io::Result<()> {
        if self.pm_state(dev) != PmState::Suspended {
            return Err(Error::InvalidArgument);
        }
        for feature in &self.device(dev).features {
            if let Feature::Pci(func) = feature {
                func.restore_state();
            }
        }
        self.device_mut(dev).pm = PmState::Online;
        Ok(())
    }

    /// Write a human readable dump of the subtree at `dev`
    pub fn dump(&self, dev: DevId, out: &mut dyn Write) -> fmt::Result {
        let root_depth = self.ancestors(dev).count();
        for d in self.descendants(dev) {
            let indent = 2 * (self.ancestors(d).count() - root_depth);
            let device = self.device(d);
            write!(out, "{:indent$}{}", "", device.name)?;
            if let Some(hid) = device.hid {
                write!(out, " [{hid}]")?;
            }
            if let Some(func) = self.pci(d) {
                write!(out, " {:?}", func.ident())?;
            }
            writeln!(out, " ({:?})", device.pm)?;
            for &r in &device.resources {
                writeln!(out, "{:indent$}  {}", "", self.resource(r))?;
            }
        }
        Ok(())
    }
}
