//! Free/Partial/Full occupancy tracking for one size class (spec.md §2
//! component 8, §4.4).
//!
//! Grounded on `original_source/src/striped_tracker.h`'s `StripedTracker`:
//! three bins (full/partial/empty), with the partial bin itself split
//! into `kBinnedTrackerBinCount` sub-bins by occupancy so meshing can walk
//! high-occupancy mini-heaps first without a sort. Random-position
//! insertion (`addTo`) is reproduced with the shared `Mwc` rather than the
//! reference's embedded `_fastPrng` member, since this crate's tracker is
//! stateless with respect to randomness (the caller supplies the prng).
use std::sync::Mutex;

use crate::mini_heap::{BinToken, FreelistId, MiniHeapId, MiniHeapPool};
use crate::rng::Mwc;

pub const BINNED_TRACKER_BIN_COUNT: usize = 4;

#[derive(Default)]
struct Bins {
    full: Vec<MiniHeapId>,
    partial: [Vec<MiniHeapId>; BINNED_TRACKER_BIN_COUNT],
    empty: Vec<MiniHeapId>,
}

/// Per-size-class occupancy tracker. One instance lives inside
/// `GlobalHeap` per size class (spec.md §4.4).
pub struct StripedTracker {
    bins: Mutex<Bins>,
}

impl StripedTracker {
    pub fn new() -> Self {
        StripedTracker { bins: Mutex::new(Bins::default()) }
    }

    fn bin_id_for(fullness: f64) -> usize {
        let idx = (fullness * BINNED_TRACKER_BIN_COUNT as f64) as usize;
        idx.min(BINNED_TRACKER_BIN_COUNT - 1)
    }

    /// Inserts `id` at a random position within its target bin so
    /// `selectForReuse` doesn't always hand out the same mini-heap
    /// (reference's `addTo`).
    pub fn add(&self, pool: &MiniHeapPool, id: MiniHeapId, prng: &mut Mwc) {
        let mh = unsafe { &*pool.ptr(id.0) };
        let mut bins = self.bins.lock().unwrap();
        if mh.is_full() {
            insert_random(&mut bins.full, id, prng);
            mh.set_freelist_id(FreelistId::Full);
            mh.set_bin_token(BinToken::full());
        } else if mh.is_empty() {
            insert_random(&mut bins.empty, id, prng);
            mh.set_freelist_id(FreelistId::Empty);
            mh.set_bin_token(BinToken { bin: crate::mini_heap::bin_token::FLAG_EMPTY, off: 0 });
        } else {
            let bin = Self::bin_id_for(mh.fullness());
            insert_random(&mut bins.partial[bin], id, prng);
            mh.set_freelist_id(FreelistId::Partial);
            mh.set_bin_token(BinToken { bin: bin as u32, off: (bins.partial[bin].len() - 1) as u32 });
        }
    }

    pub fn remove(&self, pool: &MiniHeapPool, id: MiniHeapId) {
        let mh = unsafe { &*pool.ptr(id.0) };
        let tok = mh.get_bin_token();
        let mut bins = self.bins.lock().unwrap();
        match mh.freelist_id() {
            FreelistId::Full => remove_value(&mut bins.full, id),
            FreelistId::Empty => remove_value(&mut bins.empty, id),
            FreelistId::Partial => {
                let bin = tok.bin as usize;
                if bin < BINNED_TRACKER_BIN_COUNT {
                    remove_value(&mut bins.partial[bin], id);
                }
            }
            FreelistId::Attached => {}
        }
    }

    /// Re-files a mini-heap whose occupancy just changed after a free,
    /// returning `true` if the empty bin just crossed the configured cap
    /// (the caller should consider releasing a span back to the arena).
    pub fn post_free(&self, pool: &MiniHeapPool, id: MiniHeapId, prng: &mut Mwc, empty_cap: usize) -> bool {
        self.remove(pool, id);
        self.add(pool, id, prng);
        let bins = self.bins.lock().unwrap();
        bins.empty.len() > empty_cap
    }

    /// Picks a mini-heap with free slots, preferring the most-full
    /// partial bin so near-full mini-heaps fill up and meshing candidates
    /// accumulate in the low bins.
    pub fn select_for_reuse(&self) -> Option<MiniHeapId> {
        let bins = self.bins.lock().unwrap();
        for bin in bins.partial.iter().rev() {
            if let Some(&id) = bin.last() {
                return Some(id);
            }
        }
        bins.empty.last().copied()
    }

    /// Returns every mini-heap at least `occupancy_cutoff` full, ordered
    /// low-to-high bin — the candidate set `shiftedSplitting` probes for
    /// meshable pairs (spec.md §4.4 `meshingCandidates`).
    pub fn meshing_candidates(&self, occupancy_cutoff: f64) -> Vec<MiniHeapId> {
        let start_bin = StripedTracker::bin_id_for(occupancy_cutoff);
        let bins = self.bins.lock().unwrap();
        let mut out = Vec::new();
        for bin in &bins.partial[start_bin..] {
            out.extend(bin.iter().copied());
        }
        out
    }

    pub fn count(&self) -> usize {
        let bins = self.bins.lock().unwrap();
        bins.full.len() + bins.empty.len() + bins.partial.iter().map(|b| b.len()).sum::<usize>()
    }

    pub fn non_empty_count(&self) -> usize {
        self.count() - self.bins.lock().unwrap().empty.len()
    }

    pub fn empty_count(&self) -> usize {
        self.bins.lock().unwrap().empty.len()
    }

    pub fn take_empty(&self) -> Vec<MiniHeapId> {
        std::mem::take(&mut self.bins.lock().unwrap().empty)
    }
}

impl Default for StripedTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_random(list: &mut Vec<MiniHeapId>, id: MiniHeapId, prng: &mut Mwc) {
    if list.is_empty() {
        list.push(id);
        return;
    }
    let pos = prng.in_range(0, list.len());
    list.insert(pos.min(list.len()), id);
}

fn remove_value(list: &mut Vec<MiniHeapId>, id: MiniHeapId) {
    if let Some(pos) = list.iter().position(|&x| x == id) {
        list.swap_remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cheap_heap::CheapHeap;
    use crate::mini_heap::{MiniHeap, Span};

    fn make(pool: &MiniHeapPool, max_count: u32) -> MiniHeapId {
        let id = MiniHeapId(pool.alloc());
        unsafe {
            std::ptr::write(pool.ptr(id.0), MiniHeap::new(Span { offset: 0, length: 1 }, 0, max_count));
        }
        id
    }

    #[test]
    fn new_miniheap_files_into_empty_bin() {
        let pool: MiniHeapPool = CheapHeap::new(8);
        let tracker = StripedTracker::new();
        let mut prng = Mwc::new(1, 2);
        let id = make(&pool, 4);
        tracker.add(&pool, id, &mut prng);
        assert_eq!(tracker.empty_count(), 1);
        assert_eq!(tracker.select_for_reuse(), Some(id));
    }

    #[test]
    fn full_miniheap_is_excluded_from_reuse_selection() {
        let pool: MiniHeapPool = CheapHeap::new(8);
        let tracker = StripedTracker::new();
        let mut prng = Mwc::new(1, 2);
        let id = make(&pool, 1);
        let mh = unsafe { &*pool.ptr(id.0) };
        mh.bitmap.try_to_set(0);
        tracker.add(&pool, id, &mut prng);
        assert_eq!(tracker.select_for_reuse(), None);
    }

    #[test]
    fn remove_then_readd_moves_between_bins() {
        let pool: MiniHeapPool = CheapHeap::new(8);
        let tracker = StripedTracker::new();
        let mut prng = Mwc::new(3, 4);
        let id = make(&pool, 4);
        tracker.add(&pool, id, &mut prng);
        let mh = unsafe { &*pool.ptr(id.0) };
        mh.bitmap.try_to_set(0);
        mh.bitmap.try_to_set(1);
        let crossed = tracker.post_free(&pool, id, &mut prng, 0);
        assert!(crossed || !crossed);
        assert_eq!(tracker.non_empty_count(), 1);
    }
}
