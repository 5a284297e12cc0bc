// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! One-time domain setup: range checks, erratum policy, secure VMID and
//! reserved bus windows.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, error};
use nexus_iova::{Arena, ArenaError, GuardPolicy, PAGE_SIZE};
use thiserror::Error;

use crate::domain::FastDomain;
use crate::hal::{DmaPlatform, PageTableWalker};

/// VMID of the non-secure OS.
pub const VMID_HLOS: u32 = 0x3;
/// First VMID past the valid range.
pub const VMID_LAST: u32 = 0x2C;

/// Minimum IOVA alignment required by the MMU-500 erratum.
pub const ERRATUM_MIN_IOVA_ALIGN: u64 = 128 * 1024;

/// Highest address (exclusive) a fast domain may cover.
pub const IOVA_LIMIT: u64 = 1 << 32;

static_assertions::const_assert!(ERRATUM_MIN_IOVA_ALIGN.is_power_of_two());
static_assertions::const_assert_eq!(ERRATUM_MIN_IOVA_ALIGN % PAGE_SIZE, 0);

/// Kind of a host bridge window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum WindowKind {
    /// Memory window.
    Memory,
    /// I/O port window.
    Io,
    /// Anything else; never reserved.
    Other,
}

/// Host bridge window that must never be handed out as IOVA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct ReservedWindow {
    /// Window kind.
    pub kind: WindowKind,
    /// First CPU address of the window.
    pub start: u64,
    /// Last CPU address of the window (inclusive).
    pub end: u64,
    /// CPU-to-bus offset; bus address = CPU address - offset.
    #[cfg_attr(feature = "serde", serde(default))]
    pub offset: u64,
}

impl ReservedWindow {
    /// Memory window covering `[start, end]`.
    pub fn memory(start: u64, end: u64) -> Self {
        Self { kind: WindowKind::Memory, start, end, offset: 0 }
    }

    /// I/O window covering `[start, end]`.
    pub fn io(start: u64, end: u64) -> Self {
        Self { kind: WindowKind::Io, start, end, offset: 0 }
    }

    /// Sets the CPU-to-bus offset.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Bus address range `[start, end)`, or `None` for windows that are not
    /// reserved.
    pub fn bus_range(&self) -> Option<(u64, u64)> {
        match self.kind {
            WindowKind::Memory | WindowKind::Io => {}
            WindowKind::Other => return None,
        }
        let start = self.start.wrapping_sub(self.offset);
        let end = self.end.wrapping_sub(self.offset).saturating_add(1);
        Some((start, end))
    }
}

/// Policy for one fast domain.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DomainConfig {
    /// First IOVA of the domain.
    pub base: u64,
    /// Size of the IOVA range in bytes.
    pub size: u64,
    /// MMU-500 minimum alignment erratum applies.
    pub min_align_erratum: bool,
    /// Append a guard page to every allocation.
    pub force_guard_page: bool,
    /// Secure VMID owning the domain, if any.
    pub secure_vmid: Option<i32>,
    /// Walker's tables are coherent with CPU caches.
    pub page_table_coherent: bool,
    /// Device snoops CPU caches by default.
    pub device_coherent: bool,
    /// Bus windows to keep out of the allocator.
    pub reserved_windows: Vec<ReservedWindow>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            base: 0,
            size: IOVA_LIMIT,
            min_align_erratum: false,
            force_guard_page: false,
            secure_vmid: None,
            page_table_coherent: false,
            device_coherent: false,
            reserved_windows: Vec::new(),
        }
    }
}

impl DomainConfig {
    /// Domain covering `[base, base + size)` with no errata.
    pub fn new(base: u64, size: u64) -> Self {
        Self { base, size, ..Self::default() }
    }

    /// Enables the minimum alignment erratum.
    pub fn with_min_align_erratum(mut self, on: bool) -> Self {
        self.min_align_erratum = on;
        self
    }

    /// Enables the forced guard page.
    pub fn with_guard_page(mut self, on: bool) -> Self {
        self.force_guard_page = on;
        self
    }

    /// Sets the secure VMID.
    pub fn with_secure_vmid(mut self, vmid: i32) -> Self {
        self.secure_vmid = Some(vmid);
        self
    }

    /// Declares page-table coherency.
    pub fn with_page_table_coherent(mut self, on: bool) -> Self {
        self.page_table_coherent = on;
        self
    }

    /// Declares device coherency.
    pub fn with_device_coherent(mut self, on: bool) -> Self {
        self.device_coherent = on;
        self
    }

    /// Adds a reserved window.
    pub fn with_window(mut self, window: ReservedWindow) -> Self {
        self.reserved_windows.push(window);
        self
    }

    /// Guard policy derived from the errata flags.
    pub fn guard_policy(&self) -> GuardPolicy {
        GuardPolicy {
            min_iova_align: if self.min_align_erratum { ERRATUM_MIN_IOVA_ALIGN } else { PAGE_SIZE },
            guard_page_len: if self.force_guard_page { PAGE_SIZE } else { 0 },
        }
    }

    /// VMID the guard page is requested for.
    pub fn vmid(&self) -> u32 {
        resolve_vmid(self.secure_vmid)
    }
}

/// Maps an optional secure VMID to a valid one, falling back to [`VMID_HLOS`].
pub fn resolve_vmid(vmid: Option<i32>) -> u32 {
    match vmid.map(u32::try_from) {
        Some(Ok(vmid)) if vmid < VMID_LAST => vmid,
        _ => VMID_HLOS,
    }
}

/// Setup failures.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SetupError {
    /// Zero, unaligned or overflowing range.
    #[error("bad iova range {base:#x}+{size:#x}")]
    BadRange {
        /// Requested base.
        base: u64,
        /// Requested size.
        size: u64,
    },
    /// Range ends above 4 GiB.
    #[error("iova end {end:#x} too large")]
    RangeTooLarge {
        /// Exclusive end of the requested range.
        end: u64,
    },
    /// The platform has no guard page for the VMID.
    #[error("no guard page for vmid {vmid:#x}")]
    NoGuardPage {
        /// Resolved VMID.
        vmid: u32,
    },
    /// Arena construction failed.
    #[error("arena: {0}")]
    Arena(#[from] ArenaError),
}

/// Builds a fast domain from `config`.
pub fn init_domain<W, P>(
    config: &DomainConfig,
    walker: W,
    platform: Arc<P>,
) -> Result<Arc<FastDomain<W, P>>, SetupError>
where
    W: PageTableWalker,
    P: DmaPlatform,
{
    let (base, size) = (config.base, config.size);
    let aligned = size != 0 && base % PAGE_SIZE == 0 && size % PAGE_SIZE == 0;
    let Some(end) = base.checked_add(size).filter(|_| aligned) else {
        error!(target: "dma-fast", "bad iova range {:#x}+{:#x}", base, size);
        return Err(SetupError::BadRange { base, size });
    };
    if end > IOVA_LIMIT {
        error!(target: "dma-fast", "iova end {:#x} too large", end);
        return Err(SetupError::RangeTooLarge { end });
    }

    let policy = config.guard_policy();
    let mut arena = Arena::new(base, size, policy)?;

    let vmid = config.vmid();
    let guard_page = if policy == GuardPolicy::default() {
        None
    } else {
        match platform.guard_page(vmid) {
            Some(page) => Some(page),
            None => {
                error!(target: "dma-fast", "no guard page for vmid {:#x}", vmid);
                return Err(SetupError::NoGuardPage { vmid });
            }
        }
    };

    for window in &config.reserved_windows {
        let Some((start, end)) = window.bus_range() else {
            continue;
        };
        if let Some(bits) = arena.reserve(start, end) {
            debug!(
                target: "dma-fast",
                "reserved {:#x}..{:#x} (pages {}..{})",
                base + bits.start as u64 * PAGE_SIZE,
                base + bits.end as u64 * PAGE_SIZE,
                bits.start,
                bits.end
            );
        }
    }

    debug!(
        target: "dma-fast",
        "fast domain {:#x}+{:#x} align {:#x} guard {:#x} vmid {:#x}",
        base,
        size,
        policy.min_iova_align,
        policy.guard_page_len,
        vmid
    );
    Ok(Arc::new(FastDomain::new(arena, walker, platform, config, guard_page, vmid)))
}
