// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the IOVA arena and ring ordering
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no arena logic. Drives random alloc/free sequences against a model.
//!
//! TEST_SCOPE:
//!   - Ring comparisons agree with modular distance on random ring sizes
//!   - Live allocations never overlap
//!   - alloc then free restores the bitmap
//!   - The upcoming stale bit is always the soonest unflushed freed page
//!   - Reuse of an unflushed page is always preceded by an invalidate-all
//!
//! TEST_SCENARIOS:
//!   - sooner_is_ring_distance(): bit_is_sooner vs distance model
//!   - covered_is_ring_distance(): bit_covered_stale vs distance model
//!   - alloc_free_roundtrip(): single alloc/free restores the bitmap
//!   - random_sequences_hold_invariants(): overlap, stale tracking and flush-before-reuse over random op streams

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use proptest::prelude::*;

use crate::{bit_covered_stale, bit_is_sooner, Arena, ArenaHooks, GuardPolicy, PAGE_SIZE};

const BASE: u64 = 0x4000_0000;

#[derive(Default)]
struct CountingHooks {
    invalidations: usize,
}

impl ArenaHooks for CountingHooks {
    type Error = &'static str;

    fn invalidate_all(&mut self) {
        self.invalidations += 1;
    }

    fn map_guard(&mut self, _iova: u64, _len: u64) -> Result<(), Self::Error> {
        Ok(())
    }

    fn unmap_guard(&mut self, _iova: u64, _len: u64) {}
}

#[derive(Clone, Debug)]
enum Op {
    Alloc(u64),
    Free(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..=5).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

fn arb_policy() -> impl Strategy<Value = GuardPolicy> {
    prop_oneof![
        Just(GuardPolicy::default()),
        Just(GuardPolicy { min_iova_align: PAGE_SIZE, guard_page_len: PAGE_SIZE }),
        Just(GuardPolicy { min_iova_align: 4 * PAGE_SIZE, guard_page_len: 0 }),
    ]
}

fn distance(from: usize, to: usize, ring: usize) -> usize {
    (to + ring - from) % ring
}

fn page_of(iova: u64) -> usize {
    ((iova - BASE) / PAGE_SIZE) as usize
}

proptest! {
    #[test]
    fn sooner_is_ring_distance(ring in 1usize..4096, a in any::<usize>(), b in any::<usize>(), c in any::<usize>()) {
        let (a, b, c) = (a % ring, b % ring, c % ring);
        let expected = a == b || distance(a, b, ring) < distance(a, c, ring);
        prop_assert_eq!(bit_is_sooner(a, b, c), expected);
    }

    #[test]
    fn covered_is_ring_distance(ring in 1usize..4096, stale in any::<usize>(), start in any::<usize>(), end in any::<usize>()) {
        let (stale, start, end) = (stale % ring, start % ring, end % ring);
        let expected = distance(start, stale, ring) <= distance(start, end, ring);
        prop_assert_eq!(bit_covered_stale(stale, start, end), expected);
    }

    #[test]
    fn alloc_free_roundtrip(num_pages in 4u64..96, policy in arb_policy(), prefix in prop::collection::vec(1u64..=4, 0..8), n in 1u64..=4) {
        let mut arena = Arena::new(BASE, num_pages * PAGE_SIZE, policy).unwrap();
        let mut hooks = CountingHooks::default();
        for len in prefix {
            let _ = arena.alloc(len * PAGE_SIZE, &mut hooks);
        }
        let before = arena.bitmap().clone();
        if let Ok(iova) = arena.alloc(n * PAGE_SIZE, &mut hooks) {
            prop_assert_ne!(arena.bitmap(), &before);
            arena.free(iova, n * PAGE_SIZE, &mut hooks).unwrap();
            prop_assert_eq!(arena.bitmap(), &before);
        }
    }

    #[test]
    fn random_sequences_hold_invariants(
        num_pages in 8u64..64,
        policy in arb_policy(),
        ops in prop::collection::vec(arb_op(), 1..200),
    ) {
        let mut arena = Arena::new(BASE, num_pages * PAGE_SIZE, policy).unwrap();
        let ring = arena.num_pages();
        let mut hooks = CountingHooks::default();
        // (iova, len, pages covered including guard)
        let mut live: Vec<(u64, u64, BTreeSet<usize>)> = Vec::new();
        let mut unflushed: BTreeSet<usize> = BTreeSet::new();

        for op in ops {
            match op {
                Op::Alloc(n) => {
                    let len = n * PAGE_SIZE;
                    let before = hooks.invalidations;
                    let Ok(iova) = arena.alloc(len, &mut hooks) else {
                        prop_assert_eq!(arena.next_search_start(), 0);
                        continue;
                    };
                    let span = len + policy.guard_len(len);
                    let first = page_of(iova);
                    let pages: BTreeSet<usize> = (first..first + (span / PAGE_SIZE) as usize).collect();

                    // No overlap with any live allocation.
                    for (_, _, other) in &live {
                        prop_assert!(pages.is_disjoint(other));
                    }
                    // Reusing an unflushed page implies an invalidation in this call.
                    if !pages.is_disjoint(&unflushed) {
                        prop_assert!(hooks.invalidations > before);
                    }
                    if hooks.invalidations > before {
                        unflushed.clear();
                    }
                    live.push((iova, len, pages));
                }
                Op::Free(pick) => {
                    if live.is_empty() {
                        continue;
                    }
                    let (iova, len, pages) = live.swap_remove(pick % live.len());
                    arena.free(iova, len, &mut hooks).unwrap();
                    unflushed.extend(pages);
                }
            }

            // Cursor in range; bitmap mirrors the live set.
            prop_assert!(arena.next_search_start() < ring);
            let live_pages: usize = live.iter().map(|(_, _, p)| p.len()).sum();
            prop_assert_eq!(arena.bitmap().count_ones(), live_pages);

            // Upcoming stale bit is the soonest unflushed page from the cursor.
            prop_assert_eq!(arena.have_stale_tlb_entries(), !unflushed.is_empty());
            if let Some(upcoming) = arena.upcoming_stale_bit() {
                let cursor = arena.next_search_start();
                let soonest = unflushed
                    .iter()
                    .copied()
                    .min_by_key(|page| distance(cursor, *page, ring));
                prop_assert_eq!(Some(upcoming), soonest);
            }
        }
        prop_assert!(!arena.is_poisoned());
    }
}
