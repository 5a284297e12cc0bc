// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-domain mapping orchestrator.
//!
//! Every call follows the same shape: CPU cache maintenance outside the lock,
//! then under the domain lock reserve IOVA, program or tear down the walker's
//! entries and clean the touched table memory. On failure the call releases
//! what it reserved, in reverse order, before returning.
//!
//! The domain lock is only taken with interrupts masked through
//! [`DmaPlatform::irq_save`], so an unmap from an interrupt handler can never
//! spin on a lock held by the code it interrupted.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};

use log::{debug, error, trace, warn};
use nexus_iova::{align_down, Arena, ArenaHooks, PAGE_OFFSET_MASK, PAGE_SIZE};
use spin::{Mutex, MutexGuard};

use crate::attrs::{cpu_prot, iommu_prot, is_coherent, resource_prot, Direction, DmaAttrs, IommuProt, GUARD_PROT};
use crate::error::{DmaError, Result};
use crate::hal::{CpuAddr, DmaPlatform, PageTableWalker, PhysAddr, PteSpan, WalkError};
use crate::setup::DomainConfig;
use crate::DmaAddr;

/// CPU and device addresses of a coherent buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoherentAlloc {
    /// Kernel virtual address of the CPU remap.
    pub cpu: CpuAddr,
    /// Device address of the first byte.
    pub dma: DmaAddr,
}

struct DomainState<W> {
    arena: Arena,
    walker: W,
}

struct CoherentBuffer {
    iova: u64,
    len: u64,
    pages: Vec<PhysAddr>,
}

/// Interrupt mask held for the lifetime of a [`StateGuard`].
struct IrqMasked<'a, P: DmaPlatform> {
    platform: &'a P,
    flags: usize,
}

impl<P: DmaPlatform> Drop for IrqMasked<'_, P> {
    fn drop(&mut self) {
        self.platform.irq_restore(self.flags);
    }
}

/// Domain lock taken with interrupts masked.
///
/// Fields drop in order: the lock is released before interrupts are restored.
struct StateGuard<'a, W, P: DmaPlatform> {
    state: MutexGuard<'a, DomainState<W>>,
    _irq: IrqMasked<'a, P>,
}

impl<W, P: DmaPlatform> Deref for StateGuard<'_, W, P> {
    type Target = DomainState<W>;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl<W, P: DmaPlatform> DerefMut for StateGuard<'_, W, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}

/// Arena side effects routed to the walker and platform of one domain.
struct Hooks<'a, W, P> {
    walker: &'a mut W,
    platform: &'a P,
    guard_page: Option<PhysAddr>,
    pt_coherent: bool,
    skip_sync: bool,
}

impl<W: PageTableWalker, P: DmaPlatform> ArenaHooks for Hooks<'_, W, P> {
    type Error = WalkError;

    fn invalidate_all(&mut self) {
        self.walker.tlb_invalidate_all();
        self.walker.clear_stale(self.skip_sync);
    }

    fn map_guard(&mut self, iova: u64, len: u64) -> core::result::Result<(), WalkError> {
        let Some(page) = self.guard_page else {
            return Err(WalkError::NoMemory);
        };
        let span = self.walker.program(iova, page, len, GUARD_PROT)?;
        if !self.pt_coherent {
            self.platform.clean_ptes(span);
        }
        Ok(())
    }

    fn unmap_guard(&mut self, iova: u64, len: u64) {
        let span = self.walker.unprogram(iova, len);
        if !self.pt_coherent {
            self.platform.clean_ptes(span);
        }
    }
}

/// A fast-path IOMMU domain: one IOVA arena plus the walker programming it.
pub struct FastDomain<W, P> {
    device_coherent: bool,
    pt_coherent: bool,
    guard_page: Option<PhysAddr>,
    vmid: u32,
    state: Mutex<DomainState<W>>,
    coherent: Mutex<BTreeMap<usize, CoherentBuffer>>,
    platform: Arc<P>,
}

impl<W: PageTableWalker, P: DmaPlatform> FastDomain<W, P> {
    pub(crate) fn new(
        arena: Arena,
        walker: W,
        platform: Arc<P>,
        config: &DomainConfig,
        guard_page: Option<PhysAddr>,
        vmid: u32,
    ) -> Self {
        Self {
            device_coherent: config.device_coherent,
            pt_coherent: config.page_table_coherent,
            guard_page,
            vmid,
            state: Mutex::new(DomainState { arena, walker }),
            coherent: Mutex::new(BTreeMap::new()),
            platform,
        }
    }

    /// Resolved VMID of the domain.
    pub fn vmid(&self) -> u32 {
        self.vmid
    }

    /// Page guard mappings point at, if the guard policy needs one.
    pub fn guard_page(&self) -> Option<PhysAddr> {
        self.guard_page
    }

    /// Device coherency default.
    pub fn is_device_coherent(&self) -> bool {
        self.device_coherent
    }

    /// Runs `f` on the arena with the domain lock held. Host tests only.
    #[doc(hidden)]
    pub fn with_arena<R>(&self, f: impl FnOnce(&Arena) -> R) -> R {
        f(&self.lock().arena)
    }

    /// Runs `f` on the walker with the domain lock held. Host tests only.
    #[doc(hidden)]
    pub fn with_walker<R>(&self, f: impl FnOnce(&W) -> R) -> R {
        f(&self.lock().walker)
    }

    /// Maps `[phys, phys + len)` for device access.
    ///
    /// Returns [`DmaAddr::INVALID`] on failure.
    pub fn map(&self, phys: PhysAddr, len: u64, dir: Direction, attrs: DmaAttrs) -> DmaAddr {
        self.try_map(phys, len, dir, attrs).unwrap_or_else(|err| {
            error!(target: "dma-fast", "map {:#x}+{:#x} failed: {}", phys, len, err);
            DmaAddr::INVALID
        })
    }

    /// Maps `[phys, phys + len)` for device access.
    pub fn try_map(&self, phys: PhysAddr, len: u64, dir: Direction, attrs: DmaAttrs) -> Result<DmaAddr> {
        let (page, offset, span) = page_span(phys, len)?;
        let coherent = is_coherent(self.device_coherent, attrs);
        if !coherent && !attrs.contains(DmaAttrs::SKIP_CPU_SYNC) {
            self.sync_for_device(phys, len, dir);
        }
        let iova = self.map_span(&[(page, span)], span, iommu_prot(dir, attrs, coherent), attrs)?;
        trace!(target: "dma-fast", "map {:#x} -> {:#x}+{:#x}", phys, iova, span);
        Ok(DmaAddr(iova + offset))
    }

    /// Tears down a mapping returned by [`FastDomain::map`].
    pub fn unmap(&self, addr: DmaAddr, len: u64, dir: Direction, attrs: DmaAttrs) {
        if let Err(err) = self.try_unmap(addr, len, dir, attrs) {
            error!(target: "dma-fast", "unmap {:#x}+{:#x} failed: {}", addr.value(), len, err);
        }
    }

    /// Tears down a mapping returned by [`FastDomain::map`].
    pub fn try_unmap(&self, addr: DmaAddr, len: u64, dir: Direction, attrs: DmaAttrs) -> Result<()> {
        let iova = addr.value();
        let (base, _, span) = page_span(iova, len)?;
        let sync = !is_coherent(self.device_coherent, attrs) && !attrs.contains(DmaAttrs::SKIP_CPU_SYNC);

        let mut state = self.lock();
        let DomainState { arena, walker } = &mut *state;
        if sync {
            let translation = walker.lookup(iova).ok_or(DmaError::NotMapped { iova })?;
            self.sync_for_cpu(translation.phys, len, dir);
        }
        self.teardown(arena, walker, base, span, attrs)?;
        trace!(target: "dma-fast", "unmap {:#x}+{:#x}", base, span);
        Ok(())
    }

    /// Maps a physical resource such as an MMIO aperture. No cache maintenance.
    ///
    /// Returns [`DmaAddr::INVALID`] on failure.
    pub fn map_resource(&self, phys: PhysAddr, len: u64, dir: Direction, attrs: DmaAttrs) -> DmaAddr {
        let mapped = page_span(phys, len).and_then(|(page, offset, span)| {
            let iova = self.map_span(&[(page, span)], span, resource_prot(dir), attrs)?;
            Ok(DmaAddr(iova + offset))
        });
        mapped.unwrap_or_else(|err| {
            error!(target: "dma-fast", "map_resource {:#x}+{:#x} failed: {}", phys, len, err);
            DmaAddr::INVALID
        })
    }

    /// Tears down a mapping returned by [`FastDomain::map_resource`].
    pub fn unmap_resource(&self, addr: DmaAddr, len: u64, _dir: Direction, attrs: DmaAttrs) {
        let unmapped = page_span(addr.value(), len).and_then(|(base, _, span)| {
            let mut state = self.lock();
            let DomainState { arena, walker } = &mut *state;
            self.teardown(arena, walker, base, span, attrs)
        });
        if let Err(err) = unmapped {
            error!(target: "dma-fast", "unmap_resource {:#x}+{:#x} failed: {}", addr.value(), len, err);
        }
    }

    /// Allocates a buffer visible to both the CPU and the device.
    pub fn alloc_coherent(&self, len: u64, attrs: DmaAttrs) -> Option<CoherentAlloc> {
        self.try_alloc_coherent(len, attrs)
            .map_err(|err| error!(target: "dma-fast", "alloc_coherent {:#x} failed: {}", len, err))
            .ok()
    }

    /// Allocates a buffer visible to both the CPU and the device.
    pub fn try_alloc_coherent(&self, len: u64, attrs: DmaAttrs) -> Result<CoherentAlloc> {
        let (_, _, span) = page_span(0, len)?;
        let count = span / PAGE_SIZE;
        if count > u64::from(u32::MAX) {
            return Err(DmaError::TooLarge);
        }
        let count = usize::try_from(count).map_err(|_| DmaError::TooLarge)?;
        let coherent = is_coherent(self.device_coherent, attrs);

        let mut pages = Vec::new();
        pages.try_reserve_exact(count).map_err(|_| DmaError::NoPages)?;
        for _ in 0..count {
            match self.platform.alloc_page() {
                Some(page) => pages.push(page),
                None => {
                    self.free_pages(&pages);
                    return Err(DmaError::NoPages);
                }
            }
        }

        let Some(cpu) = self.platform.remap(&pages, cpu_prot(attrs, coherent)) else {
            self.free_pages(&pages);
            return Err(DmaError::RemapFailed);
        };
        if !coherent {
            for &page in &pages {
                self.platform.flush(page, PAGE_SIZE);
            }
        }

        let runs: Vec<(PhysAddr, u64)> = coalesce(&pages).collect();
        let prot = iommu_prot(Direction::Bidirectional, attrs, coherent);
        let iova = match self.map_span(&runs, span, prot, attrs) {
            Ok(iova) => iova,
            Err(err) => {
                self.platform.unremap(cpu, span);
                self.free_pages(&pages);
                return Err(err);
            }
        };

        self.coherent.lock().insert(cpu.0, CoherentBuffer { iova, len: span, pages });
        trace!(target: "dma-fast", "alloc_coherent {:#x} -> cpu {:#x} iova {:#x}", span, cpu.0, iova);
        Ok(CoherentAlloc { cpu, dma: DmaAddr(iova) })
    }

    /// Releases a buffer from [`FastDomain::alloc_coherent`].
    pub fn free_coherent(&self, len: u64, cpu: CpuAddr, dma: DmaAddr, attrs: DmaAttrs) {
        if let Err(err) = self.try_free_coherent(len, cpu, dma, attrs) {
            error!(target: "dma-fast", "free_coherent cpu {:#x} iova {:#x} failed: {}", cpu.0, dma.value(), err);
        }
    }

    /// Releases a buffer from [`FastDomain::alloc_coherent`].
    pub fn try_free_coherent(&self, len: u64, cpu: CpuAddr, dma: DmaAddr, attrs: DmaAttrs) -> Result<()> {
        let (_, _, span) = page_span(0, len)?;
        let buffer = {
            let mut buffers = self.coherent.lock();
            match buffers.get(&cpu.0) {
                Some(buffer) if buffer.iova == dma.value() && buffer.len == span => {}
                _ => return Err(DmaError::UnknownBuffer),
            }
            buffers.remove(&cpu.0).ok_or(DmaError::UnknownBuffer)?
        };

        let released = {
            let mut state = self.lock();
            let DomainState { arena, walker } = &mut *state;
            self.teardown(arena, walker, buffer.iova, buffer.len, attrs)
        };
        self.platform.unremap(cpu, buffer.len);
        self.free_pages(&buffer.pages);
        released
    }

    /// Pages backing a coherent buffer, in CPU address order.
    pub fn coherent_pages(&self, cpu: CpuAddr) -> Option<Vec<PhysAddr>> {
        self.coherent.lock().get(&cpu.0).map(|buffer| buffer.pages.clone())
    }

    /// Makes device writes to a streaming mapping visible to the CPU.
    pub fn sync_single_for_cpu(&self, addr: DmaAddr, len: u64, dir: Direction) {
        if let Some(phys) = self.non_coherent_phys(addr) {
            self.sync_for_cpu(phys, len, dir);
        }
    }

    /// Makes CPU writes to a streaming mapping visible to the device.
    pub fn sync_single_for_device(&self, addr: DmaAddr, len: u64, dir: Direction) {
        if let Some(phys) = self.non_coherent_phys(addr) {
            self.sync_for_device(phys, len, dir);
        }
    }

    /// Scatter-gather mapping is not supported on the fast path; maps nothing.
    pub fn map_sg(&self, entries: &[(PhysAddr, u64)], _dir: Direction, _attrs: DmaAttrs) -> usize {
        warn!(target: "dma-fast", "map_sg of {} entries not supported", entries.len());
        0
    }

    /// Counterpart of [`FastDomain::map_sg`]; does nothing.
    pub fn unmap_sg(&self, entries: &[(DmaAddr, u64)], _dir: Direction, _attrs: DmaAttrs) {
        warn!(target: "dma-fast", "unmap_sg of {} entries not supported", entries.len());
    }

    /// Reserves `span` bytes and programs `runs` back to back from the start.
    fn map_span(&self, runs: &[(PhysAddr, u64)], span: u64, prot: IommuProt, attrs: DmaAttrs) -> Result<u64> {
        let mut state = self.lock();
        let DomainState { arena, walker } = &mut *state;
        let iova = arena.alloc(span, &mut self.hooks(walker, attrs))?;

        let mut mapped = 0;
        for &(phys, len) in runs {
            match walker.program(iova + mapped, phys, len, prot) {
                Ok(pte) => {
                    self.clean_ptes(pte);
                    mapped += len;
                }
                Err(err) => {
                    if let WalkError::MappedOverStale { iova: stale } = err {
                        report_mapped_over_stale(arena, stale);
                    }
                    if mapped != 0 {
                        let pte = walker.unprogram(iova, mapped);
                        self.clean_ptes(pte);
                    }
                    if let Err(release) = self.release(arena, walker, iova, span, attrs) {
                        error!(target: "dma-fast", "rollback of {:#x}+{:#x} failed: {}", iova, span, release);
                    }
                    return Err(DmaError::PageTableProgramFailed(err));
                }
            }
        }
        Ok(iova)
    }

    /// Removes the translations of one live allocation and returns it to the
    /// arena. A range that is not exactly one allocation is left mapped and
    /// handed to the arena, which rejects it and disables itself.
    fn teardown(&self, arena: &mut Arena, walker: &mut W, iova: u64, span: u64, attrs: DmaAttrs) -> Result<()> {
        if arena.is_allocated(iova, span) {
            let pte = walker.unprogram(iova, span);
            self.clean_ptes(pte);
        }
        self.release(arena, walker, iova, span, attrs)
    }

    fn release(&self, arena: &mut Arena, walker: &mut W, iova: u64, span: u64, attrs: DmaAttrs) -> Result<()> {
        arena.free(iova, span, &mut self.hooks(walker, attrs)).map_err(DmaError::from)
    }

    fn lock(&self) -> StateGuard<'_, W, P> {
        let irq = IrqMasked { platform: &*self.platform, flags: self.platform.irq_save() };
        StateGuard { state: self.state.lock(), _irq: irq }
    }

    fn hooks<'a>(&'a self, walker: &'a mut W, attrs: DmaAttrs) -> Hooks<'a, W, P> {
        Hooks {
            walker,
            platform: &*self.platform,
            guard_page: self.guard_page,
            pt_coherent: self.pt_coherent,
            skip_sync: attrs.contains(DmaAttrs::SKIP_CPU_SYNC),
        }
    }

    fn clean_ptes(&self, span: PteSpan) {
        if !self.pt_coherent && !span.is_empty() {
            self.platform.clean_ptes(span);
        }
    }

    fn non_coherent_phys(&self, addr: DmaAddr) -> Option<PhysAddr> {
        let state = self.lock();
        match state.walker.lookup(addr.value()) {
            Some(translation) if !translation.prot.contains(IommuProt::CACHE) => Some(translation.phys),
            Some(_) => None,
            None => {
                warn!(target: "dma-fast", "sync of unmapped iova {:#x}", addr.value());
                None
            }
        }
    }

    fn sync_for_device(&self, phys: PhysAddr, len: u64, dir: Direction) {
        match dir {
            Direction::FromDevice => self.platform.invalidate(phys, len),
            _ => self.platform.clean(phys, len),
        }
    }

    fn sync_for_cpu(&self, phys: PhysAddr, len: u64, dir: Direction) {
        if dir != Direction::ToDevice {
            self.platform.invalidate(phys, len);
        }
    }

    fn free_pages(&self, pages: &[PhysAddr]) {
        for &page in pages {
            self.platform.free_page(page);
        }
    }
}

impl<W, P> Drop for FastDomain<W, P> {
    fn drop(&mut self) {
        let leaked = self.coherent.get_mut().len();
        if leaked != 0 {
            warn!(target: "dma-fast", "domain dropped with {} coherent buffers live", leaked);
        }
        let arena = &self.state.get_mut().arena;
        debug!(target: "dma-fast", "fast domain {:#x}+{:#x} released", arena.base(), arena.size());
    }
}

fn report_mapped_over_stale(arena: &Arena, iova: u64) {
    error!(target: "dma-fast", "mapped over stale tlb at {:#x} (bit {:?})", iova, arena.bit_of(iova));
    arena.dump_bitmap();
}

/// Splits `[addr, addr + len)` into its page base, the offset into the first
/// page and the page-rounded span.
fn page_span(addr: u64, len: u64) -> Result<(u64, u64, u64)> {
    if len == 0 {
        return Err(DmaError::ZeroLength);
    }
    let offset = addr & PAGE_OFFSET_MASK;
    let span = len
        .checked_add(offset)
        .and_then(|end| end.checked_add(PAGE_OFFSET_MASK))
        .map(|end| align_down(end, PAGE_SIZE))
        .ok_or(DmaError::TooLarge)?;
    Ok((addr - offset, offset, span))
}

/// Merges physically adjacent pages into `(phys, len)` runs.
fn coalesce(pages: &[PhysAddr]) -> impl Iterator<Item = (PhysAddr, u64)> + '_ {
    let mut rest = pages;
    core::iter::from_fn(move || {
        let &first = rest.first()?;
        let run = 1 + rest.windows(2).take_while(|pair| pair[1] == pair[0] + PAGE_SIZE).count();
        rest = &rest[run..];
        Some((first, run as u64 * PAGE_SIZE))
    })
}
