//! Fixed-capacity bit set over at most 1024 slots (spec.md §4.1).
//!
//! Grounded on `original_source/src/bitmap.h`'s `AtomicBitmapBase`/
//! `BitmapBase` pair. The reference template-parameterizes the word count
//! at compile time per page size (4 words for a 4 KiB page's 256 object
//! slots, up to 16 for a 16 KiB page's 1024); this crate instead sizes the
//! word array at construction time, since Rust's const generics would
//! otherwise force `MiniHeap` to be generic over page size everywhere it
//! touches a bitmap.
use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

/// Atomic bitmap: every mutation is a single-word CAS or exchange. Used by
/// `MiniHeap` for live-object tracking under concurrent free.
pub struct AtomicBitmap {
    words: Vec<AtomicU64>,
    bits: usize,
}

impl AtomicBitmap {
    pub fn new(bits: usize) -> Self {
        let n_words = (bits + WORD_BITS - 1) / WORD_BITS;
        let mut words = Vec::with_capacity(n_words);
        words.resize_with(n_words, || AtomicU64::new(0));
        AtomicBitmap { words, bits }
    }

    pub fn capacity(&self) -> usize {
        self.bits
    }

    pub fn byte_count(&self) -> usize {
        self.words.len() * 8
    }

    fn word_and_mask(&self, i: usize) -> (usize, u64) {
        debug_assert!(i < self.bits);
        (i / WORD_BITS, 1u64 << (i % WORD_BITS))
    }

    /// Atomically set bit `i`; returns whether it was previously clear.
    pub fn try_to_set(&self, i: usize) -> bool {
        let (w, mask) = self.word_and_mask(i);
        let prev = self.words[w].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    /// Atomically clear bit `i`; returns whether it was previously set.
    /// The free path uses this return value as a success signal.
    pub fn unset(&self, i: usize) -> bool {
        let (w, mask) = self.word_and_mask(i);
        let prev = self.words[w].fetch_and(!mask, Ordering::AcqRel);
        prev & mask != 0
    }

    pub fn is_set(&self, i: usize) -> bool {
        let (w, mask) = self.word_and_mask(i);
        self.words[w].load(Ordering::Acquire) & mask != 0
    }

    /// Find the lowest clear bit `>= from`, set it, and return its index.
    /// Aborts if the bitmap is full (spec.md §8 boundary behavior).
    pub fn set_first_empty(&self, from: usize) -> usize {
        let start_word = from / WORD_BITS;
        for w in start_word..self.words.len() {
            loop {
                let cur = self.words[w].load(Ordering::Acquire);
                let skip_mask = if w == start_word {
                    !0u64 << (from % WORD_BITS)
                } else {
                    !0u64
                };
                let avail = !cur & skip_mask;
                if avail == 0 {
                    break;
                }
                let bit_in_word = avail.trailing_zeros() as usize;
                let mask = 1u64 << bit_in_word;
                let prev = self.words[w].fetch_or(mask, Ordering::AcqRel);
                if prev & mask == 0 {
                    return w * WORD_BITS + bit_in_word;
                }
                // lost the race against another setter, retry this word
            }
        }
        hard_assert!(false, "setFirstEmpty on a full bitmap");
        unreachable!()
    }

    /// Atomic per-word exchange: reads current bits into a fresh
    /// `RelaxedFixedBitmap` and writes `fill` into every word. Used by
    /// meshing to drain a source mini-heap atomically with respect to
    /// concurrent frees.
    pub fn set_and_exchange_all(&self, fill: bool) -> RelaxedFixedBitmap {
        let fill_word = if fill { !0u64 } else { 0u64 };
        let mut out = RelaxedFixedBitmap::new(self.bits);
        for (idx, word) in self.words.iter().enumerate() {
            out.words[idx] = word.swap(fill_word, Ordering::AcqRel);
        }
        out
    }

    /// Non-destructive read of the current bits, used by meshing to probe
    /// compatibility without disturbing live allocations.
    pub fn snapshot(&self) -> RelaxedFixedBitmap {
        let mut out = RelaxedFixedBitmap::new(self.bits);
        for (idx, word) in self.words.iter().enumerate() {
            out.words[idx] = word.load(Ordering::Acquire);
        }
        out
    }

    /// Popcount sum. Callers read this without the global lock and
    /// tolerate staleness (spec.md §4.1).
    pub fn in_use_count(&self) -> usize {
        self.words.iter().map(|w| w.load(Ordering::Acquire).count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let bits = self.bits;
        self.words.iter().enumerate().flat_map(move |(wi, w)| {
            let word = w.load(Ordering::Acquire);
            BitIter { word, base: wi * WORD_BITS, limit: bits }
        })
    }
}

struct BitIter {
    word: u64,
    base: usize,
    limit: usize,
}

impl Iterator for BitIter {
    type Item = usize;
    fn next(&mut self) -> Option<usize> {
        while self.word != 0 {
            let bit = self.word.trailing_zeros() as usize;
            self.word &= self.word - 1;
            let idx = self.base + bit;
            if idx < self.limit {
                return Some(idx);
            }
        }
        None
    }
}

/// Non-atomic bitmap snapshot, dynamically sized. Used as the result of
/// `set_and_exchange_all` and for single-threaded scratch work (meshing
/// candidate probing holds the relevant locks already).
#[derive(Clone)]
pub struct RelaxedFixedBitmap {
    words: Vec<u64>,
    bits: usize,
}

impl RelaxedFixedBitmap {
    pub fn new(bits: usize) -> Self {
        let n_words = (bits + WORD_BITS - 1) / WORD_BITS;
        RelaxedFixedBitmap { words: vec![0u64; n_words], bits }
    }

    pub fn set_all(&mut self, up_to: usize) {
        let n = up_to.min(self.bits);
        for i in 0..n {
            self.words[i / WORD_BITS] |= 1u64 << (i % WORD_BITS);
        }
    }

    pub fn invert(&mut self) {
        for w in self.words.iter_mut() {
            *w = !*w;
        }
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn byte_count(&self) -> usize {
        self.words.len() * 8
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let bits = self.bits;
        self.words.iter().enumerate().flat_map(move |(wi, &word)| BitIter {
            word,
            base: wi * WORD_BITS,
            limit: bits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_unset_roundtrip() {
        let bm = AtomicBitmap::new(256);
        assert!(bm.try_to_set(3));
        assert!(!bm.try_to_set(3));
        assert!(bm.is_set(3));
        assert!(bm.unset(3));
        assert!(!bm.unset(3));
        assert!(!bm.is_set(3));
    }

    #[test]
    fn in_use_count_matches_popcount() {
        let bm = AtomicBitmap::new(128);
        for i in [0, 5, 63, 64, 127] {
            bm.try_to_set(i);
        }
        assert_eq!(bm.in_use_count(), 5);
    }

    #[test]
    fn set_first_empty_finds_lowest_clear_bit() {
        let bm = AtomicBitmap::new(64);
        bm.try_to_set(0);
        bm.try_to_set(1);
        let idx = bm.set_first_empty(0);
        assert_eq!(idx, 2);
        assert!(bm.is_set(2));
    }

    #[test]
    fn iteration_yields_ascending_set_bits() {
        let bm = AtomicBitmap::new(70);
        for i in [1, 64, 69] {
            bm.try_to_set(i);
        }
        let got: Vec<usize> = bm.iter().collect();
        assert_eq!(got, vec![1, 64, 69]);
    }

    #[test]
    fn exchange_all_drains_and_fills() {
        let bm = AtomicBitmap::new(64);
        bm.try_to_set(2);
        bm.try_to_set(10);
        let snapshot = bm.set_and_exchange_all(true);
        assert_eq!(snapshot.iter().collect::<Vec<_>>(), vec![2, 10]);
        assert_eq!(bm.in_use_count(), 64);
    }
}
