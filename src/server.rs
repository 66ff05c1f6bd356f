/*
 * Copyright (c) 2023 xvanc and contributors
 * SPDX-License-Identifier: BSD-3-Clause
 */

//! The I/O server
//!
//! [`System`] owns the device tree. Every call takes the tree lock for its whole
//! duration, so discovery, allocation and client requests never interleave.

use crate::{
    config::{Config, HostBridgeConfig},
    dev::{
        pcie::{ConfigSpace, PciInfo, ScanOptions},
        DevId, DeviceTree, PmState, RootOptions,
    },
    dma::{DmaContext, DmaGroupId},
    io::{self, Error},
    mem::{self, MemoryMap},
    resource::{Addr, ResId, ResTag, Resource, ResourceFlags, ResourceSpace, ResourceType},
};
use alloc::{sync::Arc, vec::Vec};
use core::{fmt, ops::RangeInclusive};
use spin::Mutex;

/// Where a resource reserved by a client goes
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Placement {
    /// Exactly this range
    Fixed(RangeInclusive<Addr>),
    /// Anywhere the parent has room, `align` must be a power of two
    Anywhere { size: Addr, align: Addr },
}

struct Inner {
    tree: DeviceTree,
    hosts: Vec<DevId>,
    /// Holder of the DMA group provider resources, created on first use
    group_dev: Option<DevId>,
    groups: Vec<(DmaGroupId, ResId)>,
    /// Provider resources of destroyed groups, reused for new ones
    spare_group_res: Vec<ResId>,
}

impl Inner {
    fn check(&self, dev: DevId) -> io::Result<()> {
        self.tree.get(dev).map(|_| ()).ok_or(Error::NotFound)
    }

    fn group_resource(&self, group: DmaGroupId) -> io::Result<ResId> {
        self.groups
            .iter()
            .find(|&&(g, _)| g == group)
            .map(|&(_, res)| res)
            .ok_or(Error::NotFound)
    }
}

pub struct System {
    inner: Mutex<Inner>,
    root: DevId,
    options: ScanOptions,
}

impl System {
    /// Build the system bus over the physical layout described by `map`
    pub fn new(config: &Config, map: &dyn MemoryMap) -> io::Result<System> {
        io::init(config.log_level);

        let phys = mem::init_phys_space(config.phys_bits, map, &config.reserved);
        log::debug!("phys: {} free ranges", phys.len());

        let mut tree = DeviceTree::new(phys);
        let root = tree.add_system_bus(&RootOptions {
            phys_bits: config.phys_bits,
            io_alloc_base: config.io_alloc_base,
            dma_policy: config.dma_policy,
        })?;

        Ok(Self {
            inner: Mutex::new(Inner {
                tree,
                hosts: Vec::new(),
                group_dev: None,
                groups: Vec::new(),
                spare_group_res: Vec::new(),
            }),
            root,
            options: ScanOptions {
                expansion_rom: config.expansion_rom,
                acs: config.acs,
                extended_config: true,
            },
        })
    }

    pub fn root(&self) -> DevId {
        self.root
    }

    /// Run `f` with the device tree locked
    pub fn with_tree<R>(&self, f: impl FnOnce(&DeviceTree) -> R) -> R {
        f(&self.inner.lock().tree)
    }

    /// Attach a host bridge whose configuration space is reached through `space`
    pub fn add_host_bridge(
        &self,
        config: &HostBridgeConfig,
        space: Arc<dyn ConfigSpace>,
    ) -> io::Result<DevId> {
        let mut inner = self.inner.lock();
        let host = inner.tree.add_host_bridge(self.root, space, config)?;
        inner.hosts.push(host);
        Ok(host)
    }

    /// Register a device found by other means, e.g. a platform UART
    pub fn add_device(&self, parent: DevId, name: &str) -> io::Result<DevId> {
        let mut inner = self.inner.lock();
        inner.check(parent)?;
        Ok(inner.tree.add_child(parent, name))
    }

    /// Discover everything behind the host bridges, place its resources and bring it up
    ///
    /// A host bridge whose enumeration fails is left as far as it got, the others are
    /// still scanned.
    pub fn scan(&self) {
        let mut inner = self.inner.lock();
        let Inner { tree, hosts, .. } = &mut *inner;

        for &host in hosts.iter() {
            if let Err(error) = tree.scan_host_bridge(host, &self.options) {
                log::error!("{}: enumeration abandoned: {error}", tree.device(host).name());
            }
        }

        tree.request_child_resources(self.root);
        tree.plugin(self.root);
    }

    pub fn children(&self, dev: DevId) -> io::Result<Vec<DevId>> {
        let inner = self.inner.lock();
        inner.check(dev)?;
        Ok(inner.tree.children(dev).to_vec())
    }

    pub fn resources(&self, dev: DevId) -> io::Result<Vec<(ResId, Resource)>> {
        let inner = self.inner.lock();
        inner.check(dev)?;
        Ok(inner
            .tree
            .iter_resources(dev)
            .map(|(id, res)| (id, res.clone()))
            .collect())
    }

    pub fn pm_state(&self, dev: DevId) -> io::Result<PmState> {
        let inner = self.inner.lock();
        inner.check(dev)?;
        Ok(inner.tree.pm_state(dev))
    }

    /// Reserve a resource of type `ty` for `dev` out of its parent's resources
    ///
    /// A fixed range fails with [`Error::Conflict`] if it overlaps something already
    /// granted, a movable one with [`Error::Exhausted`] if there is no room left.
    pub fn reserve(
        &self,
        dev: DevId,
        ty: ResourceType,
        tag: ResTag,
        placement: Placement,
    ) -> io::Result<ResId> {
        let mut inner = self.inner.lock();
        inner.check(dev)?;
        let tree = &mut inner.tree;
        let parent = tree.parent(dev).ok_or(Error::InvalidArgument)?;

        match placement {
            Placement::Fixed(range) => {
                if range.is_empty() {
                    return Err(Error::InvalidArgument);
                }
                let flags = ResourceFlags::HIERARCHICAL;
                let res = Resource::with_range(ty, flags, *range.start(), *range.end()).tagged(tag);
                let id = tree.add_resource(dev, res)?;
                if tree.request_child_resource(parent, id, dev) {
                    Ok(id)
                } else {
                    log::warn!("{}: {} is taken", tree.device(dev).name(), tree.resource(id));
                    tree.resource_mut(id).disable();
                    Err(Error::Conflict)
                }
            }
            Placement::Anywhere { size, align } => {
                if size == 0 || !align.is_power_of_two() {
                    return Err(Error::InvalidArgument);
                }
                let mut res =
                    Resource::new(ty, ResourceFlags::HIERARCHICAL | ResourceFlags::CAN_MOVE)
                        .tagged(tag);
                res.start_size(0, size);
                res.set_alignment(align - 1);
                let id = tree.add_resource(dev, res)?;
                if tree.alloc_child_resource(parent, id, dev) {
                    Ok(id)
                } else {
                    Err(Error::Exhausted)
                }
            }
        }
    }

    pub fn pci_info(&self, dev: DevId) -> io::Result<PciInfo> {
        let inner = self.inner.lock();
        inner.check(dev)?;
        inner
            .tree
            .pci(dev)
            .map(|func| func.info())
            .ok_or(Error::NotFound)
    }

    pub fn create_dma_group(&self) -> io::Result<DmaGroupId> {
        let mut inner = self.inner.lock();
        let group_dev = match inner.group_dev {
            Some(dev) => dev,
            None => {
                let dev = inner.tree.add_child(self.root, "dma-groups");
                inner.group_dev = Some(dev);
                dev
            }
        };

        let group = inner.tree.dma_mut().create_group();
        let space = ResourceSpace::DmaGroup(group);
        let res = match inner.spare_group_res.pop() {
            Some(res) => {
                let r = inner.tree.resource_mut(res);
                r.space = Some(space);
                r.enable();
                res
            }
            None => {
                let res = Resource::with_range(
                    ResourceType::DmaDomain,
                    ResourceFlags::empty(),
                    0,
                    Addr::MAX,
                )
                .providing(space)
                .tagged(ResTag::new("DMAG"));
                inner.tree.add_resource(group_dev, res)?
            }
        };
        inner.groups.push((group, res));

        log::debug!("dma: created {group:?}");
        Ok(group)
    }

    pub fn destroy_dma_group(&self, group: DmaGroupId) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let res = inner.group_resource(group)?;
        inner.tree.dma_mut().destroy_group(group)?;

        inner.tree.resource_mut(res).disable();
        inner.groups.retain(|&(g, _)| g != group);
        inner.spare_group_res.push(res);
        Ok(())
    }

    /// Make `dev` share remapping with everything else in `group`
    pub fn join_dma_group(&self, group: DmaGroupId, dev: DevId) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.check(dev)?;
        let provider = inner.group_resource(group)?;
        let group_dev = inner.group_dev.ok_or(Error::NotFound)?;

        let tree = &mut inner.tree;
        let domain = tree
            .resource_by_tag(dev, ResTag::DMA_DOMAIN)
            .ok_or(Error::NotFound)?;
        if tree.rs_request(provider, group_dev, domain, dev) {
            Ok(())
        } else {
            Err(Error::Conflict)
        }
    }

    pub fn leave_dma_group(&self, dev: DevId) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.check(dev)?;
        let domain = inner.tree.dma_domain(dev).ok_or(Error::NotFound)?;
        inner.tree.dma_mut().remove_domain(domain)
    }

    pub fn bind_dma_context(&self, group: DmaGroupId, context: DmaContext) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.group_resource(group)?;
        inner.tree.dma_mut().bind_context(group, context)
    }

    pub fn unbind_dma_context(&self, group: DmaGroupId) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.group_resource(group)?;
        inner.tree.dma_mut().unbind_context(group)
    }

    /// The remapping context bound to the domain of `dev`
    pub fn dma_context(&self, dev: DevId) -> io::Result<Option<DmaContext>> {
        let inner = self.inner.lock();
        inner.check(dev)?;
        let domain = inner.tree.dma_domain(dev).ok_or(Error::NotFound)?;
        Ok(inner.tree.dma().domain_context(domain))
    }

    /// Suspend `dev` and every online device below it, children first
    pub fn suspend(&self, dev: DevId) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.check(dev)?;
        let tree = &mut inner.tree;
        if tree.pm_state(dev) != PmState::Online {
            return Err(Error::InvalidArgument);
        }

        for d in tree.descendants(dev).into_iter().rev() {
            if tree.pm_state(d) == PmState::Online {
                tree.pm_suspend(d)?;
            }
        }
        Ok(())
    }

    /// Resume `dev` and every suspended device below it, parents first
    pub fn resume(&self, dev: DevId) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.check(dev)?;
        let tree = &mut inner.tree;
        if tree.pm_state(dev) != PmState::Suspended {
            return Err(Error::InvalidArgument);
        }

        for d in tree.descendants(dev) {
            if tree.pm_state(d) == PmState::Suspended {
                tree.pm_resume(d)?;
            }
        }
        Ok(())
    }

    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.inner.lock().tree.dump(self.root, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{WindowConfig, WindowKind},
        dev::pcie::{mock::MockConfig, BusAddr},
        dma::DmaPolicy,
        mem::{MemoryKind, MemoryRegion},
    };
    use alloc::{string::String, vec};

    const KERNEL: DmaContext = DmaContext {
        id: 7,
        transferable: false,
    };
    const GUEST: DmaContext = DmaContext {
        id: 8,
        transferable: false,
    };

    fn system(dma_policy: DmaPolicy) -> System {
        let config = Config {
            dma_policy,
            phys_bits: 32,
            ..Config::default()
        };
        let map = vec![MemoryRegion::new(0, 0x7fff_ffff, MemoryKind::Ram)];
        System::new(&config, &map).unwrap()
    }

    fn host_config() -> HostBridgeConfig {
        HostBridgeConfig {
            name: String::from("pci0"),
            ecam: None,
            bus_range: 0..=255,
            pcie: true,
            windows: vec![WindowConfig {
                kind: WindowKind::Mmio,
                range: 0xc000_0000..=0xc0ff_ffff,
            }],
        }
    }

    /// Two network functions on bus 0, the first with an unassigned BAR
    fn scanned(dma_policy: DmaPolicy) -> (System, DevId, DevId, DevId) {
        let mock = MockConfig::new();
        let a = BusAddr::new(0, 1, 0);
        let b = BusAddr::new(0, 2, 0);
        for addr in [a, b] {
            mock.add(addr, 0x8086, 0x10d3, 0x0200, 0);
            mock.set(addr, 0x04, 0, 0x0547);
        }
        mock.bar(a, 0, 0, 0x1000, 0);

        let sys = system(dma_policy);
        let host = sys.add_host_bridge(&host_config(), mock).unwrap();
        sys.scan();

        let devs = sys.children(host).unwrap();
        assert_eq!(devs.len(), 2);
        (sys, host, devs[0], devs[1])
    }

    #[test]
    fn scan_places_and_describes_functions() {
        let (sys, host, nic, _) = scanned(DmaPolicy::Shared);
        assert_eq!(sys.children(sys.root()).unwrap(), vec![host]);

        let info = sys.pci_info(nic).unwrap();
        assert_eq!((info.ident.vendor, info.ident.device), (0x8086, 0x10d3));
        assert_eq!(info.addr, BusAddr::new(0, 1, 0));
        assert_eq!(info.port_type, None);

        let resources = sys.resources(nic).unwrap();
        let (_, bar) = resources
            .iter()
            .find(|(_, r)| r.tag() == ResTag::bar(0))
            .unwrap();
        assert_eq!((bar.start(), bar.end()), (0xc000_0000, 0xc000_0fff));
        assert!(bar.enabled());
        assert_eq!(sys.pm_state(nic), Ok(PmState::Online));

        assert_eq!(sys.pci_info(host), Err(Error::NotFound));
    }

    #[test]
    fn reserve_fixed_and_movable_ranges() {
        let sys = system(DmaPolicy::Shared);
        let com1 = sys.add_device(sys.root(), "com1").unwrap();
        let com2 = sys.add_device(sys.root(), "com2").unwrap();
        let regs = ResTag::new("REGS");

        sys.reserve(com1, ResourceType::Io, regs, Placement::Fixed(0x3f8..=0x3ff))
            .unwrap();
        assert_eq!(
            sys.reserve(com2, ResourceType::Io, regs, Placement::Fixed(0x3fc..=0x403)),
            Err(Error::Conflict)
        );

        let moved = sys
            .reserve(com2, ResourceType::Io, regs, Placement::Anywhere { size: 8, align: 8 })
            .unwrap();
        let (_, moved) = sys
            .resources(com2)
            .unwrap()
            .into_iter()
            .find(|&(id, _)| id == moved)
            .unwrap();
        assert_eq!((moved.start(), moved.end()), (0x1000, 0x1007));

        // RAM is never handed out.
        assert_eq!(
            sys.reserve(
                com1,
                ResourceType::Mmio,
                regs,
                Placement::Fixed(0x1000_0000..=0x1000_0fff)
            ),
            Err(Error::Conflict)
        );
        let mmio = sys
            .reserve(
                com1,
                ResourceType::Mmio,
                regs,
                Placement::Anywhere {
                    size: 0x2000,
                    align: 0x1000,
                },
            )
            .unwrap();
        sys.with_tree(|tree| {
            let r = tree.resource(mmio);
            assert_eq!(r.start() % 0x1000, 0);
            assert!(r.start() >= 0x8000_0000 && r.end() <= 0xffff_ffff);
        });

        assert_eq!(
            sys.reserve(com1, ResourceType::Io, regs, Placement::Anywhere { size: 0, align: 1 }),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            sys.reserve(sys.root(), ResourceType::Io, regs, Placement::Fixed(0..=1)),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn dma_groups_share_contexts() {
        let (sys, host, a, b) = scanned(DmaPolicy::PerDevice);
        let group = sys.create_dma_group().unwrap();
        // Devices added by hand have no DMA domain.
        let c = sys.add_device(host, "c").unwrap();
        assert_eq!(sys.join_dma_group(group, c), Err(Error::NotFound));

        sys.join_dma_group(group, a).unwrap();
        sys.join_dma_group(group, b).unwrap();
        sys.with_tree(|tree| {
            let (da, db) = (tree.dma_domain(a).unwrap(), tree.dma_domain(b).unwrap());
            assert_ne!(da, db);
            assert!(tree.dma().same_set(da, db));
        });

        sys.bind_dma_context(group, KERNEL).unwrap();
        assert_eq!(sys.dma_context(a), Ok(Some(KERNEL)));
        assert_eq!(sys.dma_context(b), Ok(Some(KERNEL)));

        sys.unbind_dma_context(group).unwrap();
        assert_eq!(sys.dma_context(b), Ok(None));
        sys.bind_dma_context(group, KERNEL).unwrap();

        // Domains bound to different contexts cannot share a set.
        let (other, _, d, e) = scanned(DmaPolicy::PerDevice);
        let guests = other.create_dma_group().unwrap();
        other.join_dma_group(guests, d).unwrap();
        other.bind_dma_context(guests, GUEST).unwrap();
        let kernel = other.create_dma_group().unwrap();
        assert_eq!(other.bind_dma_context(kernel, KERNEL), Err(Error::NotFound));
        other.join_dma_group(kernel, e).unwrap();
        other.bind_dma_context(kernel, KERNEL).unwrap();
        assert_eq!(other.join_dma_group(kernel, d), Err(Error::Conflict));
        assert_eq!(other.dma_context(d), Ok(Some(GUEST)));
        assert_eq!(other.dma_context(e), Ok(Some(KERNEL)));

        sys.leave_dma_group(a).unwrap();
        sys.destroy_dma_group(group).unwrap();
        assert_eq!(sys.bind_dma_context(group, KERNEL), Err(Error::NotFound));
        let reused = sys.create_dma_group().unwrap();
        assert_eq!(reused, group);
        assert_eq!(sys.join_dma_group(reused, a), Ok(()));
    }

    #[test]
    fn suspend_covers_the_subtree() {
        let (sys, host, a, b) = scanned(DmaPolicy::Shared);

        sys.suspend(host).unwrap();
        for dev in [host, a, b] {
            assert_eq!(sys.pm_state(dev), Ok(PmState::Suspended));
        }
        assert_eq!(sys.suspend(a), Err(Error::InvalidArgument));

        sys.resume(host).unwrap();
        for dev in [host, a, b] {
            assert_eq!(sys.pm_state(dev), Ok(PmState::Online));
        }
    }

    #[test]
    fn dump_lists_the_tree() {
        let (sys, ..) = scanned(DmaPolicy::Shared);
        let mut out = String::new();
        sys.dump(&mut out).unwrap();
        assert!(out.starts_with("system [SYSTEM]"));
        assert!(out.contains("  pci0 [PNP0A08]"));
        assert!(out.contains("[0x8086:0x10d3]: Ethernet Controller (Online)"));
    }
}
