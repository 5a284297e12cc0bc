//! Host fakes for the walker and platform traits.
//!
//! The walker keeps a page-granular table plus the set of entries removed
//! since the last invalidate-all, and refuses to program over one of those the
//! way a debug walker reports a mapped-over-stale entry. Once attached to a
//! platform it also asserts that every call arrives with interrupts masked.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nexus_dma_fast::{
    init_domain, CpuAddr, CpuProt, DmaPlatform, DomainConfig, FastDomain, IommuProt, PageTableWalker, PhysAddr,
    PteSpan, Translation, WalkError, PAGE_SIZE,
};

pub const BASE: u64 = 0x1000_0000;

pub type Domain = Arc<FastDomain<FakeWalker, FakePlatform>>;

/// Scripted walker failure: `(successful programs to allow first, error)`.
#[derive(Clone, Default)]
pub struct Faults(Arc<Mutex<Option<(usize, WalkError)>>>);

impl Faults {
    pub fn fail_program(&self, after: usize, err: WalkError) {
        *self.0.lock().unwrap() = Some((after, err));
    }

    fn next(&self) -> Option<WalkError> {
        let mut plan = self.0.lock().unwrap();
        match plan.as_mut() {
            Some((0, err)) => {
                let err = *err;
                *plan = None;
                Some(err)
            }
            Some((left, _)) => {
                *left -= 1;
                None
            }
            None => None,
        }
    }
}

#[derive(Default)]
pub struct FakeWalker {
    pub ptes: BTreeMap<u64, (PhysAddr, IommuProt)>,
    pub unflushed: BTreeSet<u64>,
    pub invalidations: usize,
    pub clear_stale_calls: Vec<bool>,
    pub programs: Vec<(u64, PhysAddr, u64, IommuProt)>,
    pub faults: Faults,
    /// Interrupt mask depth of the attached platform.
    pub irq_depth: Option<Arc<AtomicUsize>>,
}

impl FakeWalker {
    pub fn with_faults(faults: Faults) -> Self {
        Self { faults, ..Self::default() }
    }

    pub fn mapped_pages(&self) -> usize {
        self.ptes.len()
    }

    fn assert_masked(&self) {
        if let Some(depth) = &self.irq_depth {
            assert!(depth.load(Ordering::SeqCst) > 0, "walker called with interrupts enabled");
        }
    }

    /// Physical address and protection behind `iova`, offset included.
    pub fn lookup_page(&self, iova: u64) -> Option<(PhysAddr, IommuProt)> {
        self.lookup(iova).map(|t| (t.phys, t.prot))
    }
}

fn pages(iova: u64, len: u64) -> impl Iterator<Item = u64> {
    (0..len / PAGE_SIZE).map(move |i| iova + i * PAGE_SIZE)
}

fn span(iova: u64, len: u64) -> PteSpan {
    PteSpan { first: (iova / PAGE_SIZE) as usize, count: (len / PAGE_SIZE) as usize }
}

impl PageTableWalker for FakeWalker {
    fn program(&mut self, iova: u64, phys: PhysAddr, len: u64, prot: IommuProt) -> Result<PteSpan, WalkError> {
        self.assert_masked();
        if let Some(err) = self.faults.next() {
            return Err(err);
        }
        for page in pages(iova, len) {
            if self.ptes.contains_key(&page) {
                return Err(WalkError::AlreadyMapped { iova: page });
            }
            if self.unflushed.contains(&page) {
                return Err(WalkError::MappedOverStale { iova: page });
            }
        }
        for (i, page) in pages(iova, len).enumerate() {
            self.ptes.insert(page, (phys + i as u64 * PAGE_SIZE, prot));
        }
        self.programs.push((iova, phys, len, prot));
        Ok(span(iova, len))
    }

    fn unprogram(&mut self, iova: u64, len: u64) -> PteSpan {
        self.assert_masked();
        for page in pages(iova, len) {
            if self.ptes.remove(&page).is_some() {
                self.unflushed.insert(page);
            }
        }
        span(iova, len)
    }

    fn lookup(&self, iova: u64) -> Option<Translation> {
        self.assert_masked();
        let offset = iova % PAGE_SIZE;
        self.ptes
            .get(&(iova - offset))
            .map(|&(phys, prot)| Translation { phys: phys + offset, prot })
    }

    fn clear_stale(&mut self, skip_sync: bool) {
        self.assert_masked();
        self.clear_stale_calls.push(skip_sync);
    }

    fn tlb_invalidate_all(&mut self) {
        self.assert_masked();
        self.invalidations += 1;
        self.unflushed.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Clean(PhysAddr, u64),
    Invalidate(PhysAddr, u64),
    Flush(PhysAddr, u64),
}

#[derive(Default)]
pub struct PlatformState {
    pub cache_ops: Vec<CacheOp>,
    pub pte_cleans: usize,
    pub next_page: PhysAddr,
    pub page_stride: u64,
    pub page_budget: Option<usize>,
    pub live_pages: BTreeSet<PhysAddr>,
    pub remaps: BTreeMap<usize, (Vec<PhysAddr>, CpuProt)>,
    pub next_cpu: usize,
    pub fail_remap: bool,
    pub guard: Option<PhysAddr>,
    pub guard_requests: Vec<u32>,
}

pub struct FakePlatform {
    pub state: Mutex<PlatformState>,
    /// Nesting depth of `irq_save`; zero means interrupts enabled.
    pub irq_depth: Arc<AtomicUsize>,
    /// Total `irq_save` calls.
    pub irq_saves: AtomicUsize,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            state: Mutex::new(PlatformState {
                next_page: 0x8000_0000,
                page_stride: PAGE_SIZE,
                next_cpu: 0xffff_0000_0000,
                guard: Some(0x7fff_f000),
                ..PlatformState::default()
            }),
            irq_depth: Arc::default(),
            irq_saves: AtomicUsize::new(0),
        }
    }
}

impl FakePlatform {
    pub fn with(f: impl FnOnce(&mut PlatformState)) -> Arc<Self> {
        let platform = Self::default();
        f(&mut platform.state.lock().unwrap());
        Arc::new(platform)
    }

    pub fn cache_ops(&self) -> Vec<CacheOp> {
        self.state.lock().unwrap().cache_ops.clone()
    }

    pub fn take_cache_ops(&self) -> Vec<CacheOp> {
        std::mem::take(&mut self.state.lock().unwrap().cache_ops)
    }

    pub fn pte_cleans(&self) -> usize {
        self.state.lock().unwrap().pte_cleans
    }

    pub fn live_pages(&self) -> usize {
        self.state.lock().unwrap().live_pages.len()
    }

    pub fn live_remaps(&self) -> usize {
        self.state.lock().unwrap().remaps.len()
    }

    pub fn irq_masked(&self) -> bool {
        self.irq_depth.load(Ordering::SeqCst) > 0
    }

    pub fn irq_saves(&self) -> usize {
        self.irq_saves.load(Ordering::SeqCst)
    }
}

impl DmaPlatform for FakePlatform {
    fn clean(&self, phys: PhysAddr, len: u64) {
        self.state.lock().unwrap().cache_ops.push(CacheOp::Clean(phys, len));
    }

    fn invalidate(&self, phys: PhysAddr, len: u64) {
        self.state.lock().unwrap().cache_ops.push(CacheOp::Invalidate(phys, len));
    }

    fn flush(&self, phys: PhysAddr, len: u64) {
        self.state.lock().unwrap().cache_ops.push(CacheOp::Flush(phys, len));
    }

    fn clean_ptes(&self, _span: PteSpan) {
        assert!(self.irq_masked(), "page-table clean outside the domain lock");
        self.state.lock().unwrap().pte_cleans += 1;
    }

    fn alloc_page(&self) -> Option<PhysAddr> {
        let mut state = self.state.lock().unwrap();
        if let Some(budget) = state.page_budget.as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        let page = state.next_page;
        state.next_page += state.page_stride;
        state.live_pages.insert(page);
        Some(page)
    }

    fn free_page(&self, page: PhysAddr) {
        assert!(self.state.lock().unwrap().live_pages.remove(&page), "double free of {page:#x}");
    }

    fn remap(&self, pages: &[PhysAddr], prot: CpuProt) -> Option<CpuAddr> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remap {
            return None;
        }
        let cpu = state.next_cpu;
        state.next_cpu += pages.len() * PAGE_SIZE as usize;
        state.remaps.insert(cpu, (pages.to_vec(), prot));
        Some(CpuAddr(cpu))
    }

    fn unremap(&self, cpu: CpuAddr, len: u64) {
        let mut state = self.state.lock().unwrap();
        let (pages, _) = state.remaps.remove(&cpu.0).expect("live remap");
        assert_eq!(pages.len() as u64 * PAGE_SIZE, len);
    }

    fn guard_page(&self, vmid: u32) -> Option<PhysAddr> {
        let mut state = self.state.lock().unwrap();
        state.guard_requests.push(vmid);
        state.guard
    }

    fn irq_save(&self) -> usize {
        self.irq_saves.fetch_add(1, Ordering::SeqCst);
        self.irq_depth.fetch_add(1, Ordering::SeqCst)
    }

    fn irq_restore(&self, flags: usize) {
        let depth = self.irq_depth.swap(flags, Ordering::SeqCst);
        assert_eq!(depth, flags + 1, "unbalanced irq_restore");
    }
}

/// Domain over `num_pages` pages at [`BASE`] with default platform behaviour.
pub fn domain(num_pages: u64) -> (Domain, Arc<FakePlatform>) {
    domain_with(DomainConfig::new(BASE, num_pages * PAGE_SIZE), FakeWalker::default(), Arc::default())
}

/// Builds a domain whose walker checks the platform's interrupt mask.
pub fn domain_with(config: DomainConfig, mut walker: FakeWalker, platform: Arc<FakePlatform>) -> (Domain, Arc<FakePlatform>) {
    walker.irq_depth = Some(Arc::clone(&platform.irq_depth));
    let domain = init_domain(&config, walker, Arc::clone(&platform)).expect("domain");
    (domain, platform)
}
