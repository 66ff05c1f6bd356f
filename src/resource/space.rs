// SPDX-FileCopyrightText:  2023 xvanc and contributors
// SPDX-License-Identifier: BSD-3-Clause

use super::{Addr, ResId, Resource, ResourceType};
use crate::{
    dev::{DevId, DeviceTree},
    dma::{DmaDomainId, DmaGroupId},
    mem::{PhysRegion, PAGE_SIZE},
};
use alloc::vec::Vec;

/// Highest address reachable by a resource without [`ResourceFlags::WIDTH_64BIT`]
///
/// [`ResourceFlags::WIDTH_64BIT`]: super::ResourceFlags::WIDTH_64BIT
const LIMIT_32BIT: Addr = 0xffff_ffff;

/// The pool a provider resource hands sub-ranges out of
#[derive(Clone, Debug)]
pub enum ResourceSpace {
    /// Interrupt lines, shared by everyone who asks
    RootIrq,
    /// The 16-bit port space
    RootIo(ProviderSpace),
    /// Physical addresses, backed by the tree's [`PhysSpace`](crate::mem::PhysSpace)
    RootMmio,
    /// DMA domains of every hardware device
    RootDma,
    /// A bridge or host bridge window
    Provider(ProviderSpace),
    /// Interrupt pin swizzling of a PCI bus
    IrqRouter,
    /// Requesting a domain from this space joins it to the group
    DmaGroup(DmaGroupId),
}

impl ResourceSpace {
    pub fn provider() -> ResourceSpace {
        Self::Provider(ProviderSpace::default())
    }

    /// Port space where allocation starts at `floor`
    pub fn root_io(floor: Addr) -> ResourceSpace {
        Self::RootIo(ProviderSpace {
            floor,
            ..ProviderSpace::default()
        })
    }

    /// Resources granted out of this space, in address order
    pub fn granted(&self) -> &[ResId] {
        match self {
            Self::RootIo(space) | Self::Provider(space) => &space.children,
            _ => &[],
        }
    }
}

/// Bookkeeping of a window that hands out address ranges
#[derive(Clone, Debug, Default)]
pub struct ProviderSpace {
    /// Placed children, sorted by start
    children: Vec<ResId>,
    /// Assigned children waiting for the window to be placed, coarsest alignment first
    pending: Vec<ResId>,
    /// Lowest address handed out by [`DeviceTree::rs_alloc`]
    floor: Addr,
}

// Smallest alignment mask the hardware decodes for each resource type.
const fn min_alignment(ty: ResourceType) -> Addr {
    match ty {
        ResourceType::Mmio => PAGE_SIZE - 1,
        ResourceType::Io => 0x3,
        _ => 0,
    }
}

fn align_up(x: Addr, mask: Addr) -> Option<Addr> {
    Some(x.checked_add(mask)? & !mask)
}

fn active(r: &Resource) -> bool {
    r.enabled() && !r.empty()
}

impl ProviderSpace {
    fn insert_sorted(&mut self, tree: &DeviceTree, child: ResId) {
        if self.children.contains(&child) {
            return;
        }
        let start = tree.resource(child).start();
        let pos = self
            .children
            .partition_point(|&c| tree.resource(c).start() <= start);
        self.children.insert(pos, child);
    }

    fn insert_pending(&mut self, tree: &DeviceTree, child: ResId) {
        if self.pending.contains(&child) {
            return;
        }
        let align = tree.resource(child).alignment();
        let pos = self
            .pending
            .partition_point(|&c| tree.resource(c).alignment() >= align);
        self.pending.insert(pos, child);
    }

    // First aligned address at or above `from` where `child` fits between the
    // active granted children. The end of the window is not checked.
    fn first_fit(&self, tree: &DeviceTree, from: Addr, child: ResId) -> Option<Addr> {
        let c = tree.resource(child);
        let mask = c.alignment().max(min_alignment(c.ty()));
        let last = c.end().checked_sub(c.start())?;

        let mut start = align_up(from, mask)?;
        for &other in &self.children {
            let o = tree.resource(other);
            if other == child || !active(o) || o.end() < start {
                continue;
            }
            if start.checked_add(last)? < o.start() {
                break;
            }
            start = align_up(o.end().checked_add(1)?, mask)?;
        }
        Some(start)
    }

    fn request(&mut self, tree: &mut DeviceTree, parent: ResId, child: ResId) -> bool {
        let p = tree.resource(parent);
        let c = tree.resource(child);

        if c.end() < c.start() || p.empty() || !p.contains(c) {
            return false;
        }

        if let Some(&other) = self.children.iter().filter(|&&o| o != child).find(|&&o| {
            let o = tree.resource(o);
            active(o) && o.overlaps(c)
        }) {
            log::error!("{}: conflicts with {}", c, tree.resource(other));
            return false;
        }

        self.insert_sorted(tree, child);
        tree.resource_mut(child).set_parent(Some(parent));
        true
    }

    fn alloc(&mut self, tree: &mut DeviceTree, parent: ResId, child: ResId, resize: bool) -> bool {
        let p = tree.resource(parent);
        let from = p.start().max(self.floor);
        let last = tree.resource(child).end() - tree.resource(child).start();
        let placed = self
            .first_fit(tree, from, child)
            .and_then(|start| Some((start, start.checked_add(last)?)));

        let Some((start, end)) = placed else {
            tree.resource_mut(child).disable();
            return false;
        };

        if p.empty() || end > p.end() {
            if !resize || p.fixed_size() {
                tree.resource_mut(child).disable();
                return false;
            }
            tree.resource_mut(parent).set_end(end);
        }

        tree.resource_mut(child).set_start(start);
        self.request(tree, parent, child)
    }

    fn assign(&mut self, tree: &mut DeviceTree, parent: ResId, child: ResId) -> bool {
        self.children.retain(|&c| c != child);
        self.insert_pending(tree, child);
        {
            let c = tree.resource_mut(child);
            c.set_parent(Some(parent));
            c.disable();
        }

        let ty = tree.resource(parent).ty();
        let granularity = tree.resource(parent).alignment().max(min_alignment(ty));

        // Lay everything out from offset zero, coarsest alignment first.
        let mut members: Vec<&Resource> = self
            .children
            .iter()
            .map(|&c| tree.resource(c))
            .filter(|r| active(r))
            .chain(self.pending.iter().map(|&c| tree.resource(c)))
            .collect();
        members.sort_by_key(|r| core::cmp::Reverse(r.alignment()));

        let mut align = granularity;
        let mut size: Addr = 0;
        for r in members {
            let mask = r.alignment().max(min_alignment(ty));
            align = align.max(mask);
            let Some(end) = align_up(size, mask).and_then(|s| s.checked_add(r.size())) else {
                log::error!("{}: window size overflows", tree.resource(parent));
                return false;
            };
            size = end;
        }
        let Some(size) = align_up(size, granularity) else {
            return false;
        };

        let p = tree.resource_mut(parent);
        p.set_alignment(align);
        if p.empty() || size > p.size() {
            p.set_size(size);
        }
        true
    }

    fn adjust_children(&mut self, tree: &mut DeviceTree, parent: ResId) -> bool {
        let mut i = 0;
        while i < self.children.len() {
            let child = self.children[i];
            let p = tree.resource(parent);
            let c = tree.resource(child);
            if !active(c) || p.contains(c) {
                i += 1;
                continue;
            }
            self.children.remove(i);
            if c.fixed_addr() {
                log::warn!("{c}: fixed resource outside of {p}");
                let c = tree.resource_mut(child);
                c.set_parent(None);
                c.disable();
            } else {
                self.insert_pending(tree, child);
            }
        }

        let mut ok = true;
        for child in core::mem::take(&mut self.pending) {
            let p = tree.resource(parent);
            let from = p.start().max(self.floor);
            let fits = self.first_fit(tree, from, child).filter(|&start| {
                let c = tree.resource(child);
                !p.empty()
                    && start
                        .checked_add(c.end() - c.start())
                        .is_some_and(|end| end <= p.end())
            });

            match fits {
                Some(start) => {
                    let c = tree.resource_mut(child);
                    c.set_start(start);
                    c.enable();
                    self.insert_sorted(tree, child);
                    if tree.resource(child).provides() {
                        tree.rs_adjust_children(child);
                    }
                }
                None => {
                    log::error!("{}: no room in {}", tree.resource(child), p);
                    let c = tree.resource_mut(child);
                    c.disable();
                    c.set_parent(None);
                    ok = false;
                }
            }
        }
        ok
    }
}

impl DeviceTree {
    // Run `f` on the space of `res` with the space temporarily taken out of the
    // arena, so `f` may freely touch other resources.
    fn with_space<R>(
        &mut self,
        res: ResId,
        f: impl FnOnce(&mut ResourceSpace, &mut DeviceTree) -> R,
    ) -> Option<R> {
        let mut space = self.resource_mut(res).space.take()?;
        let result = f(&mut space, self);
        self.resource_mut(res).space = Some(space);
        Some(result)
    }

    /// Accept `child` at its current position inside `parent`
    pub fn rs_request(&mut self, parent: ResId, pdev: DevId, child: ResId, cdev: DevId) -> bool {
        self.with_space(parent, |space, tree| match space {
            ResourceSpace::RootIrq | ResourceSpace::RootDma => {
                tree.resource_mut(child).set_parent(Some(parent));
                true
            }
            ResourceSpace::RootIo(space) | ResourceSpace::Provider(space) => {
                space.request(tree, parent, child)
            }
            ResourceSpace::RootMmio => {
                let c = tree.resource(child);
                let range = PhysRegion::new(c.start(), c.end());
                if range.end < range.start || !tree.phys.alloc_range(range) {
                    return false;
                }
                tree.resource_mut(child).set_parent(Some(parent));
                true
            }
            ResourceSpace::IrqRouter => {
                let Some(upstream) = tree.parent(pdev) else {
                    return false;
                };
                let slot = tree.device(cdev).adr().map_or(0, |adr| u64::from(adr >> 16));
                let pin = tree.resource(child).start();
                let swizzled = pin.wrapping_add(slot) & 3;
                tree.resource_mut(child).start_end(swizzled, swizzled);
                if tree.request_child_resource(upstream, child, pdev) {
                    tree.resource_mut(child).set_parent(Some(parent));
                    true
                } else {
                    tree.resource_mut(child).start_end(pin, pin);
                    false
                }
            }
            ResourceSpace::DmaGroup(group) => {
                let Some(domain) = DmaDomainId::from_index(tree.resource(child).start()) else {
                    return false;
                };
                match tree.dma.add_to_group(domain, *group) {
                    Ok(()) => true,
                    Err(error) => {
                        log::error!("dma: cannot join domain {domain:?} to {group:?}: {error}");
                        false
                    }
                }
            }
        })
        .unwrap_or(false)
    }

    /// Find a place for `child` inside `parent`
    ///
    /// On failure `child` is disabled. A placed child that itself provides a space has its
    /// own children laid out again.
    pub fn rs_alloc(
        &mut self,
        parent: ResId,
        _pdev: DevId,
        child: ResId,
        _cdev: DevId,
        resize: bool,
    ) -> bool {
        let ok = self
            .with_space(parent, |space, tree| match space {
                ResourceSpace::RootIo(space) | ResourceSpace::Provider(space) => {
                    space.alloc(tree, parent, child, resize)
                }
                ResourceSpace::RootMmio => {
                    let c = tree.resource(child);
                    let align = c
                        .alignment()
                        .max(PAGE_SIZE - 1)
                        .checked_add(1)
                        .and_then(u64::checked_next_power_of_two);
                    let limit = if c.is_64bit() { u64::MAX } else { LIMIT_32BIT };
                    let size = c.end().checked_sub(c.start()).and_then(|s| s.checked_add(1));
                    let region = match (size, align) {
                        (Some(size), Some(align)) => tree.phys.alloc_below(size, align, limit),
                        _ => None,
                    };
                    match region {
                        Some(region) => {
                            let c = tree.resource_mut(child);
                            c.set_start(region.start);
                            c.set_parent(Some(parent));
                            true
                        }
                        None => false,
                    }
                }
                _ => false,
            })
            .unwrap_or(false);

        if !ok {
            self.resource_mut(child).disable();
        } else if self.resource(child).provides() {
            self.rs_adjust_children(child);
        }
        ok
    }

    /// Record `child` in `parent` ahead of placement, growing `parent` to fit
    pub fn rs_assign(&mut self, parent: ResId, child: ResId) -> bool {
        self.with_space(parent, |space, tree| match space {
            ResourceSpace::Provider(space) => space.assign(tree, parent, child),
            _ => {
                log::error!("{}: internal error: assign on a root space", tree.resource(parent));
                false
            }
        })
        .unwrap_or(false)
    }

    /// Lay out the children of `parent` after it was moved or resized
    pub fn rs_adjust_children(&mut self, parent: ResId) -> bool {
        self.with_space(parent, |space, tree| match space {
            ResourceSpace::Provider(space) => space.adjust_children(tree, parent),
            ResourceSpace::IrqRouter | ResourceSpace::DmaGroup(_) => true,
            _ => {
                log::error!(
                    "{}: internal error: adjust_children on a root space",
                    tree.resource(parent)
                );
                false
            }
        })
        .unwrap_or(false)
    }
}
