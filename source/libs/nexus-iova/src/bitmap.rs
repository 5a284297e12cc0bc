// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size bit set with run-oriented helpers used by the arena scan.

use alloc::{vec, vec::Vec};

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-length bit set backed by `u64` words.
///
/// Bits past `len` in the last word are always zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` cleared bits.
    pub fn new(len: usize) -> Self {
        Self { words: vec![0; len.div_ceil(WORD_BITS)], len }
    }

    /// Number of bits tracked.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the bitmap tracks no bits at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing words, lowest bit first.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Returns the value of `bit`; out-of-range bits read as clear.
    pub fn test(&self, bit: usize) -> bool {
        bit < self.len && self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Sets `count` bits starting at `start`.
    pub fn set_run(&mut self, start: usize, count: usize) {
        self.update_run(start, count, true);
    }

    /// Clears `count` bits starting at `start`.
    pub fn clear_run(&mut self, start: usize, count: usize) {
        self.update_run(start, count, false);
    }

    /// Clears every bit.
    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }

    /// Returns true if every bit in `[start, start + count)` is set.
    ///
    /// A run extending past the end is never fully set.
    pub fn all_set(&self, start: usize, count: usize) -> bool {
        let Some(end) = start.checked_add(count) else {
            return false;
        };
        if end > self.len {
            return false;
        }
        runs(start, end).all(|(word, mask)| self.words[word] & mask == mask)
    }

    /// First clear bit at or after `from`.
    pub fn find_next_zero(&self, from: usize) -> Option<usize> {
        self.find_next(from, self.len, |word| !word)
    }

    /// First set bit in `[from, end)`.
    pub fn find_next_set(&self, from: usize, end: usize) -> Option<usize> {
        self.find_next(from, end.min(self.len), |word| word)
    }

    /// First set bit reached by scanning forward from `from` and wrapping at the end.
    pub fn first_set_circular(&self, from: usize) -> Option<usize> {
        self.find_next_set(from, self.len).or_else(|| self.find_next_set(0, from))
    }

    /// Finds a clear run of `count` bits starting at or after `start`.
    ///
    /// The returned index satisfies `index & align_mask == 0`. The scan does not
    /// wrap; callers that want wraparound retry from zero themselves.
    pub fn find_free_run(&self, start: usize, count: usize, align_mask: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let mut from = start;
        loop {
            let index = self.find_next_zero(from)?;
            let index = index.checked_add(align_mask)? & !align_mask;
            let end = index.checked_add(count)?;
            if end > self.len {
                return None;
            }
            match self.find_next_set(index, end) {
                Some(busy) => from = busy + 1,
                None => return Some(index),
            }
        }
    }

    fn find_next(&self, from: usize, end: usize, view: impl Fn(u64) -> u64) -> Option<usize> {
        if from >= end {
            return None;
        }
        let mut word = from / WORD_BITS;
        let mut bits = view(self.words[word]) & (!0u64 << (from % WORD_BITS));
        loop {
            if bits != 0 {
                let index = word * WORD_BITS + bits.trailing_zeros() as usize;
                return (index < end).then_some(index);
            }
            word += 1;
            if word * WORD_BITS >= end {
                return None;
            }
            bits = view(self.words[word]);
        }
    }

    fn update_run(&mut self, start: usize, count: usize, set: bool) {
        let end = start + count;
        assert!(end <= self.len, "bit run {start}+{count} exceeds bitmap of {}", self.len);
        for (word, mask) in runs(start, end) {
            if set {
                self.words[word] |= mask;
            } else {
                self.words[word] &= !mask;
            }
        }
    }
}

/// Splits `[start, end)` into per-word masks.
fn runs(start: usize, end: usize) -> impl Iterator<Item = (usize, u64)> {
    let mut bit = start;
    core::iter::from_fn(move || {
        if bit >= end {
            return None;
        }
        let word = bit / WORD_BITS;
        let offset = bit % WORD_BITS;
        let span = (WORD_BITS - offset).min(end - bit);
        let mask = if span == WORD_BITS { !0 } else { ((1u64 << span) - 1) << offset };
        bit += span;
        Some((word, mask))
    })
}
