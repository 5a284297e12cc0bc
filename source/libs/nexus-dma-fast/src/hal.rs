// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host services the orchestrator is built on.
//!
//! The page-table walker is owned by the domain and only ever called with the
//! domain lock held and interrupts masked. The platform is shared and must be
//! callable from any CPU without sleeping.

use thiserror::Error;

use crate::attrs::{CpuProt, IommuProt};

/// Physical address.
pub type PhysAddr = u64;

/// Kernel virtual address of a CPU remap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuAddr(pub usize);

/// Page-table memory touched by a walker call.
///
/// Opaque to the orchestrator; handed back to [`DmaPlatform::clean_ptes`]
/// when the walker is not coherent with CPU caches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PteSpan {
    /// First descriptor index (walker-defined).
    pub first: usize,
    /// Number of descriptors.
    pub count: usize,
}

impl PteSpan {
    /// True when no descriptors were written.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Result of a successful walker lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    /// Physical address backing the looked-up IOVA, including its page offset.
    pub phys: PhysAddr,
    /// Protection the leaf entry was programmed with.
    pub prot: IommuProt,
}

/// Walker failures.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum WalkError {
    /// No memory for an intermediate table.
    #[error("out of page-table memory")]
    NoMemory,
    /// A live entry already covers the address.
    #[error("iova {iova:#x} already mapped")]
    AlreadyMapped {
        /// Offending address.
        iova: u64,
    },
    /// An entry freed since the last invalidate-all is still live.
    #[error("iova {iova:#x} mapped over a stale entry")]
    MappedOverStale {
        /// Offending address.
        iova: u64,
    },
    /// Address outside the tables' reach.
    #[error("iova {iova:#x} out of range")]
    OutOfRange {
        /// Offending address.
        iova: u64,
    },
}

/// IOMMU page-table programmer for one domain.
pub trait PageTableWalker: Send {
    /// Installs leaf entries for `[iova, iova + len)` pointing at `phys`.
    ///
    /// On error nothing from this call may remain installed.
    fn program(&mut self, iova: u64, phys: PhysAddr, len: u64, prot: IommuProt) -> Result<PteSpan, WalkError>;

    /// Removes leaf entries for `[iova, iova + len)`.
    fn unprogram(&mut self, iova: u64, len: u64) -> PteSpan;

    /// Translates a single address.
    fn lookup(&self, iova: u64) -> Option<Translation>;

    /// Drops every entry that was unprogrammed since the last call.
    fn clear_stale(&mut self, skip_sync: bool);

    /// Invalidates every cached translation of the domain.
    fn tlb_invalidate_all(&mut self);
}

/// CPU-side services: cache maintenance, page allocation and remapping.
pub trait DmaPlatform: Send + Sync {
    /// Writes back CPU cache lines covering the range.
    fn clean(&self, phys: PhysAddr, len: u64);
    /// Discards CPU cache lines covering the range.
    fn invalidate(&self, phys: PhysAddr, len: u64);
    /// Writes back then discards.
    fn flush(&self, phys: PhysAddr, len: u64);
    /// Cleans page-table memory written by the walker.
    fn clean_ptes(&self, span: PteSpan);
    /// Allocates one zeroed page.
    fn alloc_page(&self) -> Option<PhysAddr>;
    /// Returns a page from [`DmaPlatform::alloc_page`].
    fn free_page(&self, page: PhysAddr);
    /// Maps `pages` contiguously into kernel virtual space.
    fn remap(&self, pages: &[PhysAddr], prot: CpuProt) -> Option<CpuAddr>;
    /// Undoes [`DmaPlatform::remap`].
    fn unremap(&self, cpu: CpuAddr, len: u64);
    /// Page the guard mappings of a domain point at.
    fn guard_page(&self, vmid: u32) -> Option<PhysAddr>;
    /// Masks interrupts on the current CPU and returns the previous state.
    ///
    /// Calls nest; each is paired with one [`DmaPlatform::irq_restore`].
    fn irq_save(&self) -> usize;
    /// Restores the interrupt state returned by [`DmaPlatform::irq_save`].
    fn irq_restore(&self, flags: usize);
}
