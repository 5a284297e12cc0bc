// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Bitmap IOVA arena for the fast DMA mapping path
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests per module + proptest (tests_prop.rs) + scenario tests (tests/)
//! PUBLIC API: Arena, ArenaHooks, GuardPolicy, Bitmap, bit_is_sooner, bit_covered_stale
//! DEPENDS_ON: alloc, log, thiserror, static_assertions
//! INVARIANTS:
//!   - A bitmap bit is set iff its page belongs to a live allocation, guard or reservation
//!   - A free must name exactly the start and length of one live allocation
//!   - The search cursor stays within [0, num_pages)
//!   - Reusing a page freed since the last invalidate-all triggers one before the caller maps it
//!
//! Notes:
//! - The arena does no locking of its own; the owning domain serialises every call.
//! - TLB maintenance and guard-page programming are delegated to [`ArenaHooks`].

extern crate alloc;

pub mod arena;
pub mod bitmap;
pub mod ring;

#[cfg(test)]
mod tests_prop;

pub use arena::{Arena, ArenaError, ArenaHooks, GuardPolicy};
pub use bitmap::Bitmap;
pub use ring::{bit_covered_stale, bit_is_sooner, RingOrder};

use static_assertions::const_assert_eq;

/// Page shift used by the arena and the fast page-table format.
pub const PAGE_SHIFT: u32 = 12;
/// Size of one arena page in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// Mask selecting the offset within a page.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

const_assert_eq!(PAGE_SIZE, 4096);

/// Result alias for arena operations.
pub type Result<T> = core::result::Result<T, ArenaError>;

/// Rounds `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` down to a multiple of `align` (a power of two).
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Returns true if `value` is a multiple of [`PAGE_SIZE`].
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_OFFSET_MASK == 0
}
