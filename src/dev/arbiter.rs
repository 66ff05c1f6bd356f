// SPDX-FileCopyrightText:  2023 xvanc and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! Resource arbitration
//!
//! Resources are resolved in two phases. The request phase accepts every resource whose
//! position is already known into a provider above it, the allocate phase then places
//! whatever is left, innermost devices first.

use super::{DevId, DeviceTree};
use crate::resource::ResId;
use alloc::vec::Vec;
use core::cmp::Reverse;

impl DeviceTree {
    /// Whether `res` has been granted by some provider
    pub fn resource_allocated(&self, res: ResId) -> bool {
        self.resource(res).parent().is_some()
    }

    // Providers of `dev` that may satisfy `res`, exact prefetch matches first.
    fn candidates(&self, dev: DevId, res: ResId) -> Vec<ResId> {
        let r = self.resource(res);
        let providers = || {
            self.resources(dev).iter().copied().filter(|&p| {
                let provider = self.resource(p);
                p != res && provider.provides() && provider.enabled()
            })
        };

        let exact: Vec<ResId> = providers()
            .filter(|&p| self.resource(p).compatible(r, true))
            .collect();
        let relaxed: Vec<ResId> = providers()
            .filter(|&p| self.resource(p).compatible(r, false) && !exact.contains(&p))
            .collect();
        [exact, relaxed].concat()
    }

    /// Request the already positioned resource `res` of `dev` from its parent
    pub fn request_resource(&mut self, dev: DevId, res: ResId) {
        let Some(parent) = self.parent(dev) else {
            return;
        };

        let r = self.resource(res);
        if r.empty() || self.resource_allocated(res) || r.disabled() || !r.hierarchical() {
            return;
        }

        if !self.request_child_resource(parent, res, dev) && self.resource(res).fixed_addr() {
            log::warn!(
                "{}: inconsistent fixed resource {}",
                self.device(dev).name(),
                self.resource(res)
            );
        }
    }

    pub fn request_resources(&mut self, dev: DevId) {
        if self.parent(dev).is_none() {
            return;
        }
        for res in self.resources(dev).to_vec() {
            self.request_resource(dev, res);
        }
    }

    /// Run the request phase for everything below `dev`
    pub fn request_child_resources(&mut self, dev: DevId) {
        for child in self.children(dev).to_vec() {
            self.request_resources(child);
            self.request_child_resources(child);
        }
    }

    /// Find a provider of `dev` (or above) that accepts `res` of the child `cld` as is
    pub fn request_child_resource(&mut self, dev: DevId, res: ResId, cld: DevId) -> bool {
        let candidates = self.candidates(dev, res);

        for &provider in &candidates {
            if self.rs_request(provider, dev, res, cld) {
                return true;
            }
        }

        match self.parent(dev) {
            Some(parent) if candidates.is_empty() => self.request_child_resource(parent, res, cld),
            _ => false,
        }
    }

    /// Find a place for `res` of the child `cld` in a provider of `dev` (or above)
    pub fn alloc_child_resource(&mut self, dev: DevId, res: ResId, cld: DevId) -> bool {
        let candidates = self.candidates(dev, res);

        for &provider in &candidates {
            if self.parent(dev).is_some() && !self.resource_allocated(provider) {
                // A fixed window that was refused is never placed, it cannot host `res`.
                if self.resource(provider).fixed_addr() {
                    continue;
                }
                // The window itself is not placed yet, grow it and let it be placed
                // together with `res` once our parent allocates it.
                if self.rs_assign(provider, res) {
                    log::debug!("{}: assigned {}", self.device(cld).name(), self.resource(res));
                    return true;
                }
            } else if self.rs_alloc(provider, dev, res, cld, false) {
                self.resource_mut(res).enable();
                log::debug!("{}: allocated {}", self.device(cld).name(), self.resource(res));
                return true;
            }
        }

        if candidates.is_empty() {
            if let Some(parent) = self.parent(dev) {
                return self.alloc_child_resource(parent, res, cld);
            }
        }

        log::error!(
            "{}: could not reserve {}",
            self.device(cld).name(),
            self.resource(res)
        );
        self.resource_mut(res).disable();
        false
    }

    /// Resources of `dev` the allocate phase still has to place
    pub fn pending_resources(&self, dev: DevId) -> impl Iterator<Item = ResId> + '_ {
        self.resources(dev).iter().copied().filter(|&res| {
            let r = self.resource(res);
            !r.empty() && !self.resource_allocated(res) && !r.fixed_addr()
        })
    }

    fn sorted_pending(&self, devs: &[DevId]) -> Vec<(ResId, DevId)> {
        let mut pending: Vec<_> = devs
            .iter()
            .flat_map(|&d| self.pending_resources(d).map(move |r| (r, d)))
            .collect();
        pending.sort_by_key(|&(r, _)| Reverse(self.resource(r).alignment()));
        pending
    }

    /// Place the pending resources of every descendant of `dev`, innermost first
    pub fn allocate_pending_child_resources(&mut self, dev: DevId) {
        let children = self.children(dev).to_vec();
        for &child in &children {
            self.allocate_pending_child_resources(child);
        }

        for (res, child) in self.sorted_pending(&children) {
            self.alloc_child_resource(dev, res, child);
        }
    }

    pub fn allocate_pending_resources(&mut self, dev: DevId) {
        self.allocate_pending_child_resources(dev);

        let Some(parent) = self.parent(dev) else {
            return;
        };
        for (res, _) in self.sorted_pending(&[dev]) {
            self.alloc_child_resource(parent, res, dev);
        }
    }
}
