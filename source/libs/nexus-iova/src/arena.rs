// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! IOVA arena: bump-with-wraparound bitmap allocator with lazy TLB invalidation.
//!
//! Freed ranges are not invalidated on free. Instead the arena remembers the
//! freed page the cursor will reach soonest and, when a later allocation scans
//! over it, asks its hooks for a single invalidate-all before handing the range
//! back to the caller. Everything freed up to that point is covered by the one
//! invalidation.

use alloc::collections::BTreeMap;
use core::fmt::Display;
use core::ops::Range;

use log::{debug, error, trace};
use thiserror::Error;

use crate::bitmap::Bitmap;
use crate::ring::{bit_covered_stale, bit_is_sooner};
use crate::{align_down, align_up, is_page_aligned, Result, PAGE_SHIFT, PAGE_SIZE};

/// Errors reported by the arena.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    /// Neither the forward scan nor the retry from zero found a free run.
    #[error("iova space exhausted")]
    OutOfSpace,
    /// Installing the trailing guard mapping failed; the run was rolled back.
    #[error("guard mapping failed")]
    GuardProgramFailed,
    /// Length is zero or not a multiple of the page size.
    #[error("length {0:#x} is zero or not page aligned")]
    BadLength(u64),
    /// Arena geometry or guard policy cannot be represented.
    #[error("invalid arena geometry: base {base:#x} size {size:#x}")]
    BadGeometry {
        /// Requested base.
        base: u64,
        /// Requested size.
        size: u64,
    },
    /// A free did not name exactly one live allocation.
    #[error("free of {iova:#x}+{len:#x} does not match a live allocation")]
    Corrupted {
        /// Address passed to free.
        iova: u64,
        /// Length passed to free.
        len: u64,
    },
    /// An earlier invariant violation disabled the arena.
    #[error("arena disabled after an invariant violation")]
    Poisoned,
}

/// Side effects the arena needs from its owner.
///
/// Every call happens with the owning domain lock held.
pub trait ArenaHooks {
    /// Error reported by guard programming.
    type Error: Display;

    /// Invalidates every cached translation for the domain and clears any
    /// stale page-table entries.
    fn invalidate_all(&mut self);

    /// Installs the guard mapping covering `[iova, iova + len)`.
    fn map_guard(&mut self, iova: u64, len: u64) -> core::result::Result<(), Self::Error>;

    /// Removes the guard mapping covering `[iova, iova + len)`.
    fn unmap_guard(&mut self, iova: u64, len: u64);
}

/// Guard-page policy imposed by hardware errata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuardPolicy {
    /// Every allocation plus its guard is padded to this alignment.
    pub min_iova_align: u64,
    /// Extra bytes reserved after each allocation before padding.
    pub guard_page_len: u64,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self { min_iova_align: PAGE_SIZE, guard_page_len: 0 }
    }
}

impl GuardPolicy {
    /// Bytes of guard that follow an allocation of `len` bytes.
    pub fn guard_len(&self, len: u64) -> u64 {
        align_up(len + self.guard_page_len, self.min_iova_align) - len
    }

    fn is_valid(&self) -> bool {
        self.min_iova_align >= PAGE_SIZE
            && self.min_iova_align.is_power_of_two()
            && is_page_aligned(self.guard_page_len)
    }
}

/// Bitmap IOVA allocator for one domain.
#[derive(Debug)]
pub struct Arena {
    base: u64,
    size: u64,
    num_pages: usize,
    bitmap: Bitmap,
    /// Pages freed since the last invalidate-all.
    stale: Bitmap,
    /// Live allocations: first bit to run length, guard included.
    runs: BTreeMap<usize, usize>,
    next_search_start: usize,
    have_stale_tlb_entries: bool,
    upcoming_stale_bit: usize,
    policy: GuardPolicy,
    poisoned: bool,
}

impl Arena {
    /// Creates an arena covering `[base, base + size)`.
    pub fn new(base: u64, size: u64, policy: GuardPolicy) -> Result<Self> {
        let geometry_ok = size != 0
            && is_page_aligned(base)
            && is_page_aligned(size)
            && base.checked_add(size).is_some()
            && policy.is_valid();
        if !geometry_ok {
            return Err(ArenaError::BadGeometry { base, size });
        }
        let num_pages = usize::try_from(size >> PAGE_SHIFT)
            .map_err(|_| ArenaError::BadGeometry { base, size })?;
        Ok(Self {
            base,
            size,
            num_pages,
            bitmap: Bitmap::new(num_pages),
            stale: Bitmap::new(num_pages),
            runs: BTreeMap::new(),
            next_search_start: 0,
            have_stale_tlb_entries: false,
            upcoming_stale_bit: 0,
            policy,
            poisoned: false,
        })
    }

    /// First address managed by the arena.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the managed range in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of pages tracked by the bitmap.
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Allocation bitmap, one bit per page.
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Page index the next scan starts from.
    pub fn next_search_start(&self) -> usize {
        self.next_search_start
    }

    /// True while some freed range has not been covered by an invalidate-all.
    pub fn have_stale_tlb_entries(&self) -> bool {
        self.have_stale_tlb_entries
    }

    /// Freed page the cursor will reach first, if any are pending.
    pub fn upcoming_stale_bit(&self) -> Option<usize> {
        self.have_stale_tlb_entries.then_some(self.upcoming_stale_bit)
    }

    /// Returns true if page `bit` was freed since the last invalidate-all.
    pub fn is_stale(&self, bit: usize) -> bool {
        self.stale.test(bit)
    }

    /// Guard policy in force.
    pub fn policy(&self) -> GuardPolicy {
        self.policy
    }

    /// True once an invariant violation disabled the arena.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Page index backing `iova`, if it lies inside the arena.
    pub fn bit_of(&self, iova: u64) -> Option<usize> {
        let offset = iova.checked_sub(self.base)?;
        (offset < self.size).then(|| (offset >> PAGE_SHIFT) as usize)
    }

    /// Returns true if `[iova, iova + len)` is exactly one live allocation,
    /// so that [`Arena::free`] on it would succeed.
    pub fn is_allocated(&self, iova: u64, len: u64) -> bool {
        self.locate(iova, len)
            .is_some_and(|(start_bit, nbits)| self.runs.get(&start_bit) == Some(&nbits))
    }

    /// Permanently marks `[start, end)` as allocated.
    ///
    /// The range is widened to whole pages and clipped to the arena. Returns the
    /// reserved page indices, or `None` if nothing of the range lies inside.
    pub fn reserve(&mut self, start: u64, end: u64) -> Option<Range<usize>> {
        let limit = self.base + self.size;
        let start = align_down(start, PAGE_SIZE).max(self.base);
        let end = align_up(end.min(limit), PAGE_SIZE).min(limit);
        if start >= end {
            return None;
        }
        let first = ((start - self.base) >> PAGE_SHIFT) as usize;
        let last = ((end - self.base) >> PAGE_SHIFT) as usize;
        self.bitmap.set_run(first, last - first);
        Some(first..last)
    }

    /// Reserves `len` bytes plus the policy guard and returns the base address.
    ///
    /// If the scan passes the upcoming stale page, `hooks.invalidate_all` runs
    /// before this returns, so the caller may program translations right away.
    /// A failed scan leaves the cursor at zero.
    pub fn alloc<H: ArenaHooks + ?Sized>(&mut self, len: u64, hooks: &mut H) -> Result<u64> {
        if self.poisoned {
            return Err(ArenaError::Poisoned);
        }
        if len == 0 || !is_page_aligned(len) {
            return Err(ArenaError::BadLength(len));
        }
        if len > self.size {
            self.reset_cursor();
            return Err(ArenaError::OutOfSpace);
        }
        let guard_len = self.policy.guard_len(len);
        let nbits = match usize::try_from((len + guard_len) >> PAGE_SHIFT) {
            Ok(nbits) if nbits <= self.num_pages => nbits,
            _ => {
                self.reset_cursor();
                return Err(ArenaError::OutOfSpace);
            }
        };
        let align_mask = order_mask(nbits);

        let bit = match self.bitmap.find_free_run(self.next_search_start, nbits, align_mask) {
            Some(bit) => bit,
            None => {
                // TODO: decide whether an exhausted retry should keep the old cursor.
                self.reset_cursor();
                self.bitmap.find_free_run(0, nbits, align_mask).ok_or(ArenaError::OutOfSpace)?
            }
        };

        self.bitmap.set_run(bit, nbits);
        let prev_search_start = self.next_search_start;
        self.next_search_start = bit + nbits;
        if self.next_search_start >= self.num_pages {
            self.next_search_start = 0;
        }

        if self.have_stale_tlb_entries
            && bit_covered_stale(self.upcoming_stale_bit, prev_search_start, bit + nbits - 1)
        {
            debug!(
                target: "iova",
                "invalidate-all: scan {}..={} covered stale bit {}",
                prev_search_start,
                bit + nbits - 1,
                self.upcoming_stale_bit
            );
            hooks.invalidate_all();
            self.forget_stale();
        }

        let iova = self.base + ((bit as u64) << PAGE_SHIFT);
        if guard_len != 0 {
            if let Err(err) = hooks.map_guard(iova + len, guard_len) {
                error!(target: "iova", "guard map at {:#x}+{:#x} failed: {}", iova + len, guard_len, err);
                self.bitmap.clear_run(bit, nbits);
                return Err(ArenaError::GuardProgramFailed);
            }
        }
        self.runs.insert(bit, nbits);
        trace!(target: "iova", "alloc {:#x}+{:#x} bits {}+{}", iova, len, bit, nbits);
        Ok(iova)
    }

    /// Returns `[iova, iova + len)` and its guard to the arena.
    ///
    /// The range is not invalidated here; it becomes stale until an allocation
    /// reaches it. A free that does not name exactly one live allocation
    /// poisons the arena.
    pub fn free<H: ArenaHooks + ?Sized>(&mut self, iova: u64, len: u64, hooks: &mut H) -> Result<()> {
        let Some((start_bit, nbits)) = self.locate(iova, len) else {
            self.poison(iova, len);
            return Err(ArenaError::Corrupted { iova, len });
        };
        if self.runs.get(&start_bit) != Some(&nbits) || !self.bitmap.all_set(start_bit, nbits) {
            self.poison(iova, len);
            return Err(ArenaError::Corrupted { iova, len });
        }
        self.runs.remove(&start_bit);

        let guard_len = self.policy.guard_len(len);
        if guard_len != 0 {
            hooks.unmap_guard(iova + len, guard_len);
        }

        if !self.have_stale_tlb_entries
            || bit_is_sooner(self.next_search_start, start_bit, self.upcoming_stale_bit)
        {
            self.upcoming_stale_bit = start_bit;
        }
        self.bitmap.clear_run(start_bit, nbits);
        self.stale.set_run(start_bit, nbits);
        self.have_stale_tlb_entries = true;
        trace!(target: "iova", "free {:#x}+{:#x} bits {}+{}", iova, len, start_bit, nbits);
        Ok(())
    }

    /// Logs the allocation bitmap at error level, 32 bytes per line.
    pub fn dump_bitmap(&self) {
        error!(
            target: "iova",
            "bitmap: {} pages, cursor {}, upcoming stale {:?}",
            self.num_pages,
            self.next_search_start,
            self.upcoming_stale_bit()
        );
        for (row, words) in self.bitmap.words().chunks(4).enumerate() {
            match words {
                [a, b, c, d] => error!(target: "iova", "bmap {:08x}: {:016x} {:016x} {:016x} {:016x}", row * 32, a, b, c, d),
                _ => error!(target: "iova", "bmap {:08x}: {:016x?}", row * 32, words),
            }
        }
    }

    /// Bit range for a free of `[iova, iova + len)` including the guard.
    fn locate(&self, iova: u64, len: u64) -> Option<(usize, usize)> {
        if len == 0 || len > self.size || !is_page_aligned(len) || !is_page_aligned(iova) {
            return None;
        }
        let start_bit = self.bit_of(iova)?;
        let span = len.checked_add(self.policy.guard_len(len))?;
        let nbits = usize::try_from(span >> PAGE_SHIFT).ok()?;
        (start_bit.checked_add(nbits)? <= self.num_pages).then_some((start_bit, nbits))
    }

    /// Moves the cursor to zero and re-derives the soonest stale page from there.
    fn reset_cursor(&mut self) {
        self.next_search_start = 0;
        if self.have_stale_tlb_entries {
            if let Some(bit) = self.stale.first_set_circular(0) {
                self.upcoming_stale_bit = bit;
            }
        }
    }

    fn forget_stale(&mut self) {
        self.have_stale_tlb_entries = false;
        self.upcoming_stale_bit = 0;
        self.stale.clear_all();
    }

    fn poison(&mut self, iova: u64, len: u64) {
        error!(target: "iova", "free of {:#x}+{:#x} does not match a live allocation; disabling arena", iova, len);
        self.dump_bitmap();
        self.poisoned = true;
    }
}

/// Alignment mask for an `nbits`-page run: runs start on a boundary of the
/// next power of two at or above their length.
fn order_mask(nbits: usize) -> usize {
    nbits.checked_next_power_of_two().map_or(usize::MAX, |order| order - 1)
}
