/*
 * Copyright (c) 2023 xvanc and contributors
 * SPDX-License-Identifier: BSD-3-Clause
 */

//! DMA domain grouping
//!
//! Every device that can master the bus belongs to a DMA domain. Devices whose
//! domains end up in the same group share one remapping context, so domains and
//! groups are joined into sets. Joining a domain that already belongs to one set to a
//! group that belongs to another merges the two sets.

use crate::io::{self, Error};
use alloc::vec::Vec;

/// How devices without a dedicated upstream domain get one
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DmaPolicy {
    /// Remapping hardware is present, every requester gets its own domain
    PerDevice,
    /// No remapping hardware, all devices share a single domain
    Shared,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DmaDomainId(u32);

impl DmaDomainId {
    pub const fn index(self) -> u64 {
        self.0 as u64
    }

    pub(crate) fn from_index(index: u64) -> Option<DmaDomainId> {
        u32::try_from(index).ok().map(DmaDomainId)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DmaGroupId(u32);

/// A remapping context bound to one or more domains
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DmaContext {
    pub id: u64,
    /// Whether the context may be extended to domains that did not hold it before
    pub transferable: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct SetId {
    index: u32,
    generation: u32,
}

#[derive(Default)]
struct Domain {
    set: Option<SetId>,
    context: Option<DmaContext>,
}

#[derive(Default)]
struct Group {
    set: Option<SetId>,
    live: bool,
}

#[derive(Default)]
struct DomainSet {
    domains: Vec<DmaDomainId>,
    groups: Vec<DmaGroupId>,
    context: Option<DmaContext>,
}

impl DomainSet {
    fn members(&self) -> usize {
        self.domains.len() + self.groups.len()
    }
}

struct Slot {
    generation: u32,
    set: Option<DomainSet>,
}

#[derive(Default)]
pub struct DmaRegistry {
    domains: Vec<Domain>,
    groups: Vec<Group>,
    free_groups: Vec<DmaGroupId>,
    slots: Vec<Slot>,
}

// Pick the single context a collection of members agrees on.
fn resolve_context(
    contexts: impl IntoIterator<Item = Option<DmaContext>>,
) -> io::Result<Option<DmaContext>> {
    let mut bound = None;
    let mut bare = false;

    for context in contexts {
        match (context, bound) {
            (None, _) => bare = true,
            (Some(ctx), None) => bound = Some(ctx),
            (Some(ctx), Some(prev)) if ctx != prev => return Err(Error::Conflict),
            _ => {}
        }
    }

    match bound {
        Some(ctx) if bare && !ctx.transferable => Err(Error::Conflict),
        bound => Ok(bound),
    }
}

impl DmaRegistry {
    pub fn new() -> DmaRegistry {
        Self::default()
    }

    pub fn create_domain(&mut self) -> DmaDomainId {
        self.domains.push(Domain::default());
        DmaDomainId((self.domains.len() - 1) as u32)
    }

    /// Create an empty group, reusing the slot of a destroyed one if there is any
    pub fn create_group(&mut self) -> DmaGroupId {
        let fresh = Group {
            set: None,
            live: true,
        };
        if let Some(group) = self.free_groups.pop() {
            self.groups[group.0 as usize] = fresh;
            return group;
        }
        self.groups.push(fresh);
        DmaGroupId((self.groups.len() - 1) as u32)
    }

    pub fn contains_domain(&self, domain: DmaDomainId) -> bool {
        (domain.0 as usize) < self.domains.len()
    }

    fn domain(&self, domain: DmaDomainId) -> io::Result<&Domain> {
        self.domains.get(domain.0 as usize).ok_or(Error::NotFound)
    }

    fn group(&self, group: DmaGroupId) -> io::Result<&Group> {
        self.groups
            .get(group.0 as usize)
            .filter(|g| g.live)
            .ok_or(Error::NotFound)
    }

    fn set(&self, id: SetId) -> Option<&DomainSet> {
        let slot = self.slots.get(id.index as usize)?;
        (slot.generation == id.generation)
            .then_some(slot.set.as_ref())
            .flatten()
    }

    fn set_mut(&mut self, id: SetId) -> Option<&mut DomainSet> {
        let slot = self.slots.get_mut(id.index as usize)?;
        (slot.generation == id.generation)
            .then_some(slot.set.as_mut())
            .flatten()
    }

    fn new_set(&mut self, set: DomainSet) -> SetId {
        if let Some(index) = self.slots.iter().position(|slot| slot.set.is_none()) {
            let slot = &mut self.slots[index];
            slot.set = Some(set);
            return SetId {
                index: index as u32,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            set: Some(set),
        });
        SetId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    fn destroy_set(&mut self, id: SetId) -> Option<DomainSet> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        slot.set.take()
    }

    /// Number of live sets
    pub fn set_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.set.is_some()).count()
    }

    fn member_contexts<'a>(
        &'a self,
        set: &'a DomainSet,
    ) -> impl Iterator<Item = Option<DmaContext>> + 'a {
        set.domains
            .iter()
            .map(|&d| self.domains[d.0 as usize].context)
            .chain(set.context.map(Some))
    }

    /// Add `domain` to `group`, joining or merging their sets as needed
    ///
    /// Fails with [`Error::Conflict`] without changing anything if the domains that
    /// would end up sharing a set hold incompatible remapping contexts.
    pub fn add_to_group(&mut self, domain: DmaDomainId, group: DmaGroupId) -> io::Result<()> {
        let domain_set = self.domain(domain)?.set;
        let group_set = self.group(group)?.set;

        match (domain_set, group_set) {
            (None, None) => {
                let context = self.domain(domain)?.context;
                let set = self.new_set(DomainSet {
                    domains: alloc::vec![domain],
                    groups: alloc::vec![group],
                    context,
                });
                self.domains[domain.0 as usize].set = Some(set);
                self.groups[group.0 as usize].set = Some(set);
            }
            (None, Some(set_id)) => {
                let set = self.set(set_id).ok_or(Error::NotFound)?;
                let context = resolve_context(
                    self.member_contexts(set)
                        .chain([self.domains[domain.0 as usize].context]),
                )?;
                let set = self.set_mut(set_id).ok_or(Error::NotFound)?;
                set.domains.push(domain);
                set.context = context;
                let entry = &mut self.domains[domain.0 as usize];
                entry.set = Some(set_id);
                if context.is_some() {
                    entry.context = context;
                }
            }
            (Some(set_id), None) => {
                self.set_mut(set_id)
                    .ok_or(Error::NotFound)?
                    .groups
                    .push(group);
                self.groups[group.0 as usize].set = Some(set_id);
            }
            (Some(a), Some(b)) if a == b => {}
            (Some(a), Some(b)) => self.merge(a, b)?,
        }

        Ok(())
    }

    fn merge(&mut self, a: SetId, b: SetId) -> io::Result<()> {
        let set_a = self.set(a).ok_or(Error::NotFound)?;
        let set_b = self.set(b).ok_or(Error::NotFound)?;

        let contexts = self.member_contexts(set_a).chain(self.member_contexts(set_b));
        let context = resolve_context(contexts).map_err(|error| {
            log::error!("dma: cannot merge domain sets with conflicting contexts");
            error
        })?;

        let (keep, absorb) = if set_a.members() >= set_b.members() {
            (a, b)
        } else {
            (b, a)
        };

        let absorbed = self.destroy_set(absorb).ok_or(Error::NotFound)?;
        for &domain in &absorbed.domains {
            self.domains[domain.0 as usize].set = Some(keep);
        }
        for &group in &absorbed.groups {
            self.groups[group.0 as usize].set = Some(keep);
        }

        let set = self.set_mut(keep).ok_or(Error::NotFound)?;
        set.domains.extend(absorbed.domains);
        set.groups.extend(absorbed.groups);
        set.context = context;
        if let Some(ctx) = context {
            let members = set.domains.clone();
            for domain in members {
                self.domains[domain.0 as usize].context = Some(ctx);
            }
        }

        Ok(())
    }

    /// Take `domain` out of its set, destroying the set if it becomes empty
    pub fn remove_domain(&mut self, domain: DmaDomainId) -> io::Result<()> {
        let Some(set_id) = self.domain(domain)?.set else { return Ok(()) };
        self.domains[domain.0 as usize].set = None;
        let set = self.set_mut(set_id).ok_or(Error::NotFound)?;
        set.domains.retain(|&d| d != domain);
        if set.domains.is_empty() {
            set.context = None;
        }
        if set.members() == 0 {
            self.destroy_set(set_id);
        }
        Ok(())
    }

    /// Take `group` out of its set, destroying the set if it becomes empty
    pub fn remove_group(&mut self, group: DmaGroupId) -> io::Result<()> {
        let Some(set_id) = self.group(group)?.set else { return Ok(()) };
        self.groups[group.0 as usize].set = None;
        let set = self.set_mut(set_id).ok_or(Error::NotFound)?;
        set.groups.retain(|&g| g != group);
        if set.members() == 0 {
            self.destroy_set(set_id);
        }
        Ok(())
    }

    /// Take `group` out of its set and release its id for reuse
    pub fn destroy_group(&mut self, group: DmaGroupId) -> io::Result<()> {
        self.remove_group(group)?;
        self.groups[group.0 as usize].live = false;
        self.free_groups.push(group);
        Ok(())
    }

    /// Whether two domains share a remapping context
    pub fn same_set(&self, a: DmaDomainId, b: DmaDomainId) -> bool {
        match (self.domain(a).map(|d| d.set), self.domain(b).map(|d| d.set)) {
            (Ok(Some(a)), Ok(Some(b))) => a == b,
            _ => a == b,
        }
    }

    /// Domains in the same set as `group`
    pub fn group_domains(&self, group: DmaGroupId) -> Vec<DmaDomainId> {
        self.group(group)
            .ok()
            .and_then(|g| g.set)
            .and_then(|id| self.set(id))
            .map(|set| set.domains.clone())
            .unwrap_or_default()
    }

    pub fn domain_context(&self, domain: DmaDomainId) -> Option<DmaContext> {
        self.domain(domain).ok()?.context
    }

    /// Resolve the context shared by everything in `group`'s set
    ///
    /// Returns `Ok(None)` while nothing is bound.
    pub fn shared_context(&mut self, group: DmaGroupId) -> io::Result<Option<DmaContext>> {
        let Some(set_id) = self.group(group)?.set else { return Ok(None) };
        let set = self.set(set_id).ok_or(Error::NotFound)?;
        let context = resolve_context(self.member_contexts(set))?;
        self.set_mut(set_id).ok_or(Error::NotFound)?.context = context;
        Ok(context)
    }

    /// Bind `context` to every domain sharing a set with `group`
    pub fn bind_context(&mut self, group: DmaGroupId, context: DmaContext) -> io::Result<()> {
        let set_id = self.group(group)?.set.ok_or(Error::NotFound)?;
        let set = self.set(set_id).ok_or(Error::NotFound)?;

        if let Some(current) = resolve_context(self.member_contexts(set))? {
            if current != context {
                return Err(Error::Conflict);
            }
        }

        let set = self.set_mut(set_id).ok_or(Error::NotFound)?;
        set.context = Some(context);
        let members = set.domains.clone();
        for domain in members {
            self.domains[domain.0 as usize].context = Some(context);
        }
        Ok(())
    }

    /// Bind `context` to a single domain
    ///
    /// If the domain already shares a set, the whole set is bound.
    pub fn bind_domain_context(
        &mut self,
        domain: DmaDomainId,
        context: DmaContext,
    ) -> io::Result<()> {
        let (set_id, current) = {
            let entry = self.domain(domain)?;
            (entry.set, entry.context)
        };
        if let Some(set_id) = set_id {
            let set = self.set(set_id).ok_or(Error::NotFound)?;
            if let Some(&group) = set.groups.first() {
                return self.bind_context(group, context);
            }
        }
        match current {
            Some(current) if current != context => Err(Error::Conflict),
            _ => {
                self.domains[domain.0 as usize].context = Some(context);
                Ok(())
            }
        }
    }

    /// Drop the context bound to `group`'s set
    pub fn unbind_context(&mut self, group: DmaGroupId) -> io::Result<()> {
        let set_id = self.group(group)?.set.ok_or(Error::NotFound)?;
        let set = self.set_mut(set_id).ok_or(Error::NotFound)?;
        set.context = None;
        let members = set.domains.clone();
        for domain in members {
            self.domains[domain.0 as usize].context = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX_A: DmaContext = DmaContext {
        id: 1,
        transferable: true,
    };
    const CTX_B: DmaContext = DmaContext {
        id: 2,
        transferable: true,
    };
    const KERNEL: DmaContext = DmaContext {
        id: 3,
        transferable: false,
    };

    #[test]
    fn four_grouping_cases() {
        let mut dma = DmaRegistry::new();
        let (d0, d1, d2, d3) = (
            dma.create_domain(),
            dma.create_domain(),
            dma.create_domain(),
            dma.create_domain(),
        );
        let (g0, g1) = (dma.create_group(), dma.create_group());

        // ungrouped domain, ungrouped group
        dma.add_to_group(d0, g0).unwrap();
        assert_eq!(dma.set_count(), 1);

        // ungrouped domain, grouped group
        dma.add_to_group(d1, g0).unwrap();
        assert!(dma.same_set(d0, d1));
        assert_eq!(dma.set_count(), 1);

        // grouped domain, ungrouped group
        dma.add_to_group(d2, g1).unwrap();
        dma.add_to_group(d3, g1).unwrap();
        assert_eq!(dma.set_count(), 2);
        assert!(!dma.same_set(d0, d2));

        // grouped domain, differently grouped group: merge
        dma.add_to_group(d0, g1).unwrap();
        assert_eq!(dma.set_count(), 1);
        for d in [d1, d2, d3] {
            assert!(dma.same_set(d0, d));
        }
        let mut members = dma.group_domains(g0);
        members.sort();
        assert_eq!(members, alloc::vec![d0, d1, d2, d3]);
        assert_eq!(dma.group_domains(g1).len(), 4);
    }

    #[test]
    fn conflicting_merge_changes_nothing() {
        let mut dma = DmaRegistry::new();
        let (d0, d1) = (dma.create_domain(), dma.create_domain());
        let (g0, g1) = (dma.create_group(), dma.create_group());

        dma.add_to_group(d0, g0).unwrap();
        dma.add_to_group(d1, g1).unwrap();
        dma.bind_context(g0, CTX_A).unwrap();
        dma.bind_context(g1, CTX_B).unwrap();

        assert_eq!(dma.add_to_group(d0, g1), Err(Error::Conflict));

        assert_eq!(dma.set_count(), 2);
        assert!(!dma.same_set(d0, d1));
        assert_eq!(dma.group_domains(g0), alloc::vec![d0]);
        assert_eq!(dma.group_domains(g1), alloc::vec![d1]);
        assert_eq!(dma.domain_context(d0), Some(CTX_A));
        assert_eq!(dma.domain_context(d1), Some(CTX_B));
        assert_eq!(dma.shared_context(g0), Ok(Some(CTX_A)));
        assert_eq!(dma.shared_context(g1), Ok(Some(CTX_B)));
    }

    #[test]
    fn non_transferable_context_does_not_spread() {
        let mut dma = DmaRegistry::new();
        let (d0, d1) = (dma.create_domain(), dma.create_domain());
        let g0 = dma.create_group();

        dma.bind_domain_context(d0, KERNEL).unwrap();
        dma.add_to_group(d0, g0).unwrap();
        assert_eq!(dma.add_to_group(d1, g0), Err(Error::Conflict));
        assert_eq!(dma.group_domains(g0), alloc::vec![d0]);
        assert_eq!(dma.domain_context(d1), None);

        // A transferable one does.
        let g1 = dma.create_group();
        let (d2, d3) = (dma.create_domain(), dma.create_domain());
        dma.add_to_group(d2, g1).unwrap();
        dma.bind_context(g1, CTX_A).unwrap();
        dma.add_to_group(d3, g1).unwrap();
        assert_eq!(dma.domain_context(d3), Some(CTX_A));
    }

    #[test]
    fn lazy_context_resolution() {
        let mut dma = DmaRegistry::new();
        let (d0, d1) = (dma.create_domain(), dma.create_domain());
        let g0 = dma.create_group();
        dma.add_to_group(d0, g0).unwrap();
        dma.add_to_group(d1, g0).unwrap();

        assert_eq!(dma.shared_context(g0), Ok(None));
        dma.bind_context(g0, CTX_A).unwrap();
        assert_eq!(dma.shared_context(g0), Ok(Some(CTX_A)));
        assert_eq!(dma.bind_context(g0, CTX_B), Err(Error::Conflict));

        dma.unbind_context(g0).unwrap();
        assert_eq!(dma.domain_context(d1), None);
        dma.bind_context(g0, CTX_B).unwrap();
        assert_eq!(dma.domain_context(d0), Some(CTX_B));
    }

    #[test]
    fn last_member_out_destroys_set() {
        let mut dma = DmaRegistry::new();
        let d0 = dma.create_domain();
        let g0 = dma.create_group();
        dma.add_to_group(d0, g0).unwrap();

        dma.remove_domain(d0).unwrap();
        assert_eq!(dma.set_count(), 1);
        dma.remove_group(g0).unwrap();
        assert_eq!(dma.set_count(), 0);

        // The slot is reused under a new generation.
        let d1 = dma.create_domain();
        dma.add_to_group(d1, g0).unwrap();
        assert_eq!(dma.set_count(), 1);
        assert!(!dma.same_set(d0, d1));
    }

    #[test]
    fn group_without_domains_forgets_context() {
        let mut dma = DmaRegistry::new();
        let d0 = dma.create_domain();
        let g0 = dma.create_group();
        dma.add_to_group(d0, g0).unwrap();
        dma.bind_context(g0, KERNEL).unwrap();

        dma.remove_domain(d0).unwrap();
        assert_eq!(dma.set_count(), 1);
        assert_eq!(dma.shared_context(g0), Ok(None));

        let d1 = dma.create_domain();
        dma.add_to_group(d1, g0).unwrap();
        assert_eq!(dma.domain_context(d1), None);
    }

    #[test]
    fn destroyed_group_id_is_reused() {
        let mut dma = DmaRegistry::new();
        let d0 = dma.create_domain();
        let (g0, g1) = (dma.create_group(), dma.create_group());
        dma.add_to_group(d0, g0).unwrap();

        dma.destroy_group(g0).unwrap();
        assert_eq!(dma.remove_group(g0), Err(Error::NotFound));
        assert_eq!(dma.add_to_group(d0, g0), Err(Error::NotFound));
        assert_eq!(dma.set_count(), 1);

        let g2 = dma.create_group();
        assert_eq!(g2, g0);
        assert_ne!(g2, g1);
        assert!(dma.group_domains(g2).is_empty());
        assert_eq!(dma.create_group(), DmaGroupId(2));
    }
}
