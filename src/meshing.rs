//! The meshing algorithm: finding compatible mini-heap pairs and merging
//! them (spec.md §2 component 13, §4.7).
//!
//! Grounded on `original_source/src/meshing.h` (`bitmapsMeshable`) and the
//! `method::halfSplit`/`method::shiftedSplitting` templates in
//! `original_source/src/global_heap_impl.h`. `shiftedSplitting` is the
//! reference's actual meshing search: split the occupancy-sorted
//! candidate set in half, shuffle both halves independently, and for each
//! left candidate probe a bounded number of right candidates for a
//! disjoint-bitmap match.
use crate::bitmap::RelaxedFixedBitmap;
use crate::mini_heap::{MiniHeapId, MiniHeapPool};
use crate::rng::Mwc;

/// Two mini-heaps are meshable iff no bit is set in both bitmaps — their
/// live object sets never collide, so they can share one physical page.
pub fn bitmaps_meshable(a: &RelaxedFixedBitmap, b: &RelaxedFixedBitmap) -> bool {
    a.words().iter().zip(b.words().iter()).all(|(&x, &y)| x & y == 0)
}

/// Splits `candidates` into two halves of roughly equal size, the way
/// `method::halfSplit` does, so the search below never tries to mesh a
/// mini-heap with itself.
pub fn half_split(candidates: &[MiniHeapId]) -> (Vec<MiniHeapId>, Vec<MiniHeapId>) {
    let mid = candidates.len() / 2;
    (candidates[..mid].to_vec(), candidates[mid..].to_vec())
}

const MAX_PROBES_PER_LEFT: usize = 64;

/// Probes for meshable pairs across the left/right halves of `candidates`,
/// capped at `max_pairs` merges (reference's `kMaxMeshesPerIteration`).
/// Matched mini-heaps are removed from the right pool so no mini-heap
/// appears in more than one pair from a single pass.
pub fn shifted_splitting(
    pool: &MiniHeapPool,
    candidates: &[MiniHeapId],
    prng: &mut Mwc,
    max_pairs: usize,
) -> Vec<(MiniHeapId, MiniHeapId)> {
    let (mut left, mut right) = half_split(candidates);
    prng.shuffle(&mut left);
    prng.shuffle(&mut right);

    let mut pairs = Vec::new();
    for &l in &left {
        if pairs.len() >= max_pairs {
            break;
        }
        let l_bitmap = unsafe { &*pool.ptr(l.0) }.bitmap.snapshot();
        let probes = right.len().min(MAX_PROBES_PER_LEFT);
        let mut matched_at = None;
        for i in 0..probes {
            let r = right[i];
            let r_bitmap = unsafe { &*pool.ptr(r.0) }.bitmap.snapshot();
            if bitmaps_meshable(&l_bitmap, &r_bitmap) {
                matched_at = Some(i);
                break;
            }
        }
        if let Some(i) = matched_at {
            let r = right.swap_remove(i);
            pairs.push((l, r));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cheap_heap::CheapHeap;
    use crate::mini_heap::{MiniHeap, Span};

    fn make(pool: &MiniHeapPool, set_bits: &[usize]) -> MiniHeapId {
        let id = MiniHeapId(pool.alloc());
        unsafe {
            std::ptr::write(pool.ptr(id.0), MiniHeap::new(Span { offset: 0, length: 1 }, 0, 64));
        }
        let mh = unsafe { &*pool.ptr(id.0) };
        for &b in set_bits {
            mh.bitmap.try_to_set(b);
        }
        id
    }

    #[test]
    fn disjoint_bitmaps_are_meshable() {
        let a = RelaxedFixedBitmap::new(64);
        let b = RelaxedFixedBitmap::new(64);
        assert!(bitmaps_meshable(&a, &b));
    }

    #[test]
    fn overlapping_bitmaps_are_not_meshable() {
        let pool: MiniHeapPool = CheapHeap::new(8);
        let a = make(&pool, &[0, 5]);
        let b = make(&pool, &[5, 9]);
        let sa = unsafe { &*pool.ptr(a.0) }.bitmap.snapshot();
        let sb = unsafe { &*pool.ptr(b.0) }.bitmap.snapshot();
        assert!(!bitmaps_meshable(&sa, &sb));
    }

    #[test]
    fn shifted_splitting_finds_a_disjoint_pair() {
        let pool: MiniHeapPool = CheapHeap::new(8);
        let a = make(&pool, &[0, 1, 2]);
        let b = make(&pool, &[40, 41]);
        let mut prng = Mwc::new(1, 1);
        let pairs = shifted_splitting(&pool, &[a, b], &mut prng, 10);
        assert_eq!(pairs.len(), 1);
    }
}
