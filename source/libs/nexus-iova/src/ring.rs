// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Circular ordering of arena bit positions.
//!
//! The allocation cursor walks the bitmap forward and wraps to zero, so
//! "which freed bit will be reused first" is a question about positions on a
//! ring. Both helpers here are pure and total; they never look at the ring
//! size because only the relative order of the positions matters.

/// Relative placement of the cursor `A`, a candidate `B` and the current
/// upcoming stale bit `C` when laid out from bit 0 upwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingOrder {
    /// `A < B < C`
    Abc,
    /// `A < C < B`
    Acb,
    /// `B < A < C`
    Bac,
    /// `B < C < A`
    Bca,
    /// `C < A < B`
    Cab,
    /// `C < B < A`
    Cba,
    /// `A == B` (including all three equal)
    CursorOnCandidate,
    /// `B == C`, `A` distinct
    CandidateIsStale,
    /// `A == C`, `B` distinct
    CursorOnStale,
}

impl RingOrder {
    /// Classifies the three positions.
    pub fn classify(a: usize, b: usize, c: usize) -> Self {
        if a == b {
            return Self::CursorOnCandidate;
        }
        if b == c {
            return Self::CandidateIsStale;
        }
        if a == c {
            return Self::CursorOnStale;
        }
        match (a < b, b < c, a < c) {
            (true, true, _) => Self::Abc,
            (true, false, true) => Self::Acb,
            (true, false, false) => Self::Cab,
            (false, true, true) => Self::Bac,
            (false, true, false) => Self::Bca,
            (false, false, _) => Self::Cba,
        }
    }

    /// Returns true if a forward scan from `A` meets `B` before `C`.
    ///
    /// `Abc`, `Cab` and `Bca` are rotations of the same ring, as are `Acb`,
    /// `Bac` and `Cba`.
    pub fn candidate_first(self) -> bool {
        match self {
            Self::Abc | Self::Cab | Self::Bca | Self::CursorOnCandidate => true,
            Self::Acb | Self::Bac | Self::Cba | Self::CandidateIsStale | Self::CursorOnStale => {
                false
            }
        }
    }
}

/// Returns true if `candidate` will be reached before `upcoming` when scanning
/// forward (with wraparound) from `next`.
///
/// A candidate equal to `upcoming` is not sooner, and nothing is sooner than an
/// `upcoming` bit the cursor already sits on.
pub fn bit_is_sooner(next: usize, candidate: usize, upcoming: usize) -> bool {
    RingOrder::classify(next, candidate, upcoming).candidate_first()
}

/// Returns true if the scanned range `[search_start, end]` stepped over or
/// landed on `stale`.
///
/// `end < search_start` means the scan wrapped past the top of the bitmap.
pub fn bit_covered_stale(stale: usize, search_start: usize, end: usize) -> bool {
    let wrapped = end < search_start;
    if search_start > stale {
        // Started above the stale bit: only a wrapped scan can reach it.
        wrapped && end >= stale
    } else {
        wrapped || end >= stale
    }
}
