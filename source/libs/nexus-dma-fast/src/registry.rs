// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Registry of attached fast domains.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use log::info;
use spin::Mutex;

use crate::domain::FastDomain;

/// Identifier under which a domain is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(u32);

impl DomainId {
    /// Wraps a raw identifier.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw identifier value.
    pub fn value(self) -> u32 {
        self.0
    }
}

/// Attached domains keyed by id.
///
/// A domain lives as long as the registry entry or any handle from
/// [`DomainRegistry::get`] still refers to it.
pub struct DomainRegistry<W, P> {
    domains: Mutex<BTreeMap<DomainId, Arc<FastDomain<W, P>>>>,
}

impl<W, P> Default for DomainRegistry<W, P> {
    fn default() -> Self {
        Self { domains: Mutex::new(BTreeMap::new()) }
    }
}

impl<W, P> DomainRegistry<W, P> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the domain attached under `id`, building it with `init` on
    /// first attach.
    ///
    /// `init` runs without the registry lock held. If another caller attached
    /// `id` in the meantime, theirs is kept and the freshly built one dropped.
    pub fn attach<E>(
        &self,
        id: DomainId,
        init: impl FnOnce() -> Result<Arc<FastDomain<W, P>>, E>,
    ) -> Result<Arc<FastDomain<W, P>>, E> {
        if let Some(domain) = self.get(id) {
            return Ok(domain);
        }
        let built = init()?;
        let domain = Arc::clone(self.domains.lock().entry(id).or_insert(built));
        info!(target: "dma-fast", "attached domain {}", id.0);
        Ok(domain)
    }

    /// Domain attached under `id`.
    pub fn get(&self, id: DomainId) -> Option<Arc<FastDomain<W, P>>> {
        self.domains.lock().get(&id).cloned()
    }

    /// Drops the registry's reference to `id`. Returns false if nothing was attached.
    pub fn release(&self, id: DomainId) -> bool {
        let removed = self.domains.lock().remove(&id);
        if removed.is_some() {
            info!(target: "dma-fast", "released domain {}", id.0);
        }
        removed.is_some()
    }

    /// Number of attached domains.
    pub fn len(&self) -> usize {
        self.domains.lock().len()
    }

    /// True when nothing is attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
