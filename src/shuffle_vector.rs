//! Per-thread, per-size-class randomized slot cache (spec.md §2
//! component 9, §4.6).
//!
//! Grounded on `original_source/src/shuffle_vector.h`. The reference packs
//! each cached slot into a 2-byte `sv::Entry { mhOffset: u8, bitOffset:
//! u8 }` and caps attached mini-heaps/list length with fixed arrays; this
//! crate keeps the same two-field entry shape (widening `bit_offset` to
//! `u16` since a 16 KiB page's 1024-slot class-0 bitmap overflows a byte)
//! but backs both the attached list and the entry list with `Vec`,
//! matching the dynamic-sizing approach already used in `bitmap.rs` and
//! `cheap_heap.rs`.
use crate::bitmap::RelaxedFixedBitmap;
use crate::mini_heap::{MiniHeapId, MiniHeapPool};
use crate::options;
use crate::rng::Mwc;
use crate::size_classes;

#[derive(Clone, Copy, Debug)]
struct Entry {
    attached_idx: u8,
    bit_offset: u16,
}

/// Refill/drain cache sitting in front of one size class's mini-heaps for
/// one thread. Holds no allocator-wide lock: a miss just falls through to
/// `GlobalHeap`.
pub struct ShuffleVector {
    arena_begin: usize,
    page_size: usize,
    object_size: usize,
    max_count: u32,
    attached: Vec<MiniHeapId>,
    attached_off: usize,
    list: Vec<Entry>,
}

impl ShuffleVector {
    pub fn new() -> Self {
        ShuffleVector {
            arena_begin: 0,
            page_size: 0,
            object_size: 0,
            max_count: 0,
            attached: Vec::new(),
            attached_off: 0,
            list: Vec::new(),
        }
    }

    /// One-time setup for a size class: fixes the object size and derives
    /// `max_count` from how many objects fit in a page (reference's
    /// `initialInit`).
    pub fn initial_init(&mut self, arena_begin: usize, page_size: usize, size_class: usize) {
        self.arena_begin = arena_begin;
        self.page_size = page_size;
        self.object_size = size_classes::byte_size_for_class(size_class);
        self.max_count = (page_size / self.object_size.max(1)) as u32;
    }

    pub fn is_exhausted(&self) -> bool {
        self.list.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.list.len() >= options::get().max_shuffle_vector_length
    }

    pub fn length(&self) -> usize {
        self.list.len()
    }

    pub fn attach(&mut self, id: MiniHeapId) -> bool {
        if self.attached.len() >= options::get().max_miniheaps_per_shuffle_vector {
            return false;
        }
        self.attached.push(id);
        true
    }

    pub fn attached(&self) -> &[MiniHeapId] {
        &self.attached
    }

    pub fn clear_attached(&mut self) {
        self.attached.clear();
        self.attached_off = 0;
    }

    /// Drains `mh`'s bitmap into the cache: every currently-live slot is
    /// inverted to a free slot and pushed, matching the reference's
    /// `refillFrom` (which exchanges the whole bitmap atomically so
    /// concurrent frees can't race the refill).
    pub fn refill_from(&mut self, pool: &MiniHeapPool, idx: u8, id: MiniHeapId) {
        let mh = unsafe { &*pool.ptr(id.0) };
        let mut snapshot: RelaxedFixedBitmap = mh.bitmap.set_and_exchange_all(true);
        snapshot.invert();
        for slot in snapshot.iter() {
            self.list.push(Entry { attached_idx: idx, bit_offset: slot as u16 });
            if self.is_full() {
                break;
            }
        }
    }

    /// Round-robins through the attached mini-heaps, refilling from the
    /// next one that still has free slots (reference's `localRefill`).
    pub fn local_refill(&mut self, pool: &MiniHeapPool) -> bool {
        let n = self.attached.len();
        if n == 0 {
            return false;
        }
        for step in 0..n {
            let idx = (self.attached_off + step) % n;
            let id = self.attached[idx];
            let mh = unsafe { &*pool.ptr(id.0) };
            if !mh.is_full() {
                self.refill_from(pool, idx as u8, id);
                self.attached_off = (idx + 1) % n;
                if !self.is_exhausted() {
                    return true;
                }
            }
        }
        false
    }

    /// Shuffles the attached list and rebuilds the entry cache from
    /// scratch — called whenever the attachment set changes.
    pub fn reinit(&mut self, pool: &MiniHeapPool, prng: &mut Mwc) {
        self.list.clear();
        prng.shuffle(&mut self.attached);
        self.attached_off = 0;
        self.local_refill(pool);
    }

    fn ptr_from_entry(&self, pool: &MiniHeapPool, entry: Entry) -> *mut u8 {
        let id = self.attached[entry.attached_idx as usize];
        let mh = unsafe { &*pool.ptr(id.0) };
        let start = mh.span_start(self.arena_begin, self.page_size);
        (start + entry.bit_offset as usize * self.object_size) as *mut u8
    }

    /// Pops a cached free slot, returning its pointer and marking it live
    /// in the owning mini-heap's bitmap.
    pub fn malloc(&mut self, pool: &MiniHeapPool) -> Option<*mut u8> {
        let entry = self.list.pop()?;
        let id = self.attached[entry.attached_idx as usize];
        let mh = unsafe { &*pool.ptr(id.0) };
        mh.bitmap.try_to_set(entry.bit_offset as usize);
        Some(self.ptr_from_entry(pool, entry))
    }

    pub fn free(&mut self, pool: &MiniHeapPool, id: MiniHeapId, ptr: *const u8) {
        let attached_idx = match self.attached.iter().position(|&a| a == id) {
            Some(i) => i as u8,
            None => return,
        };
        let mh = unsafe { &*pool.ptr(id.0) };
        let offset = ptr as usize - mh.span_start(self.arena_begin, self.page_size);
        let slot = size_classes::compute_index(offset, mh.size_class());
        if self.is_full() {
            self.refill_full_slowpath(mh, slot);
            return;
        }
        self.list.push(Entry { attached_idx, bit_offset: slot as u16 });
    }

    /// The cache has no room for the freed slot: push it straight back onto
    /// the owning mini-heap's bitmap instead of growing the cache past its
    /// configured cap (reference's `refillFullSlowpath`).
    fn refill_full_slowpath(&self, mh: &crate::mini_heap::MiniHeap, slot: usize) {
        mh.bitmap.unset(slot);
    }
}

impl Default for ShuffleVector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cheap_heap::CheapHeap;
    use crate::mini_heap::{MiniHeap, Span};

    #[test]
    fn refill_then_malloc_round_trips_through_owning_bitmap() {
        let pool: MiniHeapPool = CheapHeap::new(8);
        let id = MiniHeapId(pool.alloc());
        unsafe {
            std::ptr::write(pool.ptr(id.0), MiniHeap::new(Span { offset: 0, length: 1 }, 0, 4));
        }
        let mut sv = ShuffleVector::new();
        sv.initial_init(0x1000, 4096, 0);
        sv.attach(id);
        sv.refill_from(&pool, 0, id);
        assert_eq!(sv.length(), 4);
        let ptr = sv.malloc(&pool).expect("cache should yield a slot");
        assert!(!ptr.is_null());
        assert_eq!(sv.length(), 3);
    }

    #[test]
    fn free_pushes_slot_back_when_cache_has_room() {
        let pool: MiniHeapPool = CheapHeap::new(8);
        let id = MiniHeapId(pool.alloc());
        unsafe {
            std::ptr::write(pool.ptr(id.0), MiniHeap::new(Span { offset: 0, length: 1 }, 0, 4));
        }
        let mut sv = ShuffleVector::new();
        sv.initial_init(0x1000, 4096, 0);
        sv.attach(id);
        sv.refill_from(&pool, 0, id);
        let ptr = sv.malloc(&pool).unwrap();
        sv.free(&pool, id, ptr);
        assert_eq!(sv.length(), 4);
    }
}
