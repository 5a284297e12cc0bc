// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Fast-path IOMMU DMA mapping for latency-sensitive drivers
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests (attrs, domain, setup) + integration and proptest tests (tests/)
//! PUBLIC API: init_domain, FastDomain, DomainRegistry, DomainConfig, DmaAttrs, DmaAddr, is_invalid
//! DEPENDS_ON: nexus-iova, spin::Mutex, bitflags, log, thiserror, static_assertions
//! INVARIANTS:
//!   - All arena and page-table mutation for a domain happens under one spin lock
//!   - Every failing call releases what it reserved before returning
//!   - Failures cross the public surface only as DmaAddr::INVALID (or None)
//!
//! Notes:
//! - Page-table walking, CPU cache maintenance and page allocation are host
//!   services reached through the traits in [`hal`].
//! - Scatter-gather mapping is intentionally a stub.

extern crate alloc;

pub mod attrs;
pub mod domain;
pub mod error;
pub mod hal;
pub mod registry;
pub mod setup;

pub use attrs::{is_coherent, CpuProt, Direction, DmaAttrs, IommuProt};
pub use domain::{CoherentAlloc, FastDomain};
pub use error::{DmaError, Result};
pub use hal::{CpuAddr, DmaPlatform, PageTableWalker, PhysAddr, PteSpan, Translation, WalkError};
pub use registry::{DomainId, DomainRegistry};
pub use setup::{init_domain, DomainConfig, ReservedWindow, SetupError, WindowKind};

pub use nexus_iova::{ArenaError, PAGE_SHIFT, PAGE_SIZE};

/// Device-visible address returned by the mapping calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmaAddr(pub u64);

impl DmaAddr {
    /// Sentinel returned by every failing mapping call.
    pub const INVALID: Self = Self(u64::MAX);

    /// Returns true for the failure sentinel.
    pub const fn is_invalid(self) -> bool {
        self.0 == Self::INVALID.0
    }

    /// Raw address value.
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Returns true if `addr` is the failure sentinel.
pub const fn is_invalid(addr: DmaAddr) -> bool {
    addr.is_invalid()
}
