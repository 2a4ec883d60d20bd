//! Per-thread allocation fast path (spec.md §2 component 12, §4.9).
//!
//! Grounded on `original_source/src/thread_local_heap.h`. Keeps the
//! reference's `realloc` ping-pong avoidance (`lowerBoundToGrow`/
//! `upperBoundToShrink`) and `calloc` overflow check verbatim in spirit;
//! `memalign`'s page-aligned path is deferred to `GlobalHeap` via
//! `MeshableArena::page_aligned_alloc`. Frees are dispatched through the
//! arena's page index (`MeshableArena::lookup`) rather than a scan of this
//! thread's attached shuffle vectors, since a pointer allocated on one
//! thread is routinely freed on another (spec.md §2/§3).
use crate::global_heap::GlobalHeap;
use crate::mini_heap::MiniHeapId;
use crate::options;
use crate::rng::Mwc;
use crate::shuffle_vector::ShuffleVector;
use crate::size_classes;
use crate::stats::GlobalHeapStats;

pub struct ThreadLocalHeap {
    global: *const GlobalHeap,
    shuffle_vector: Vec<ShuffleVector>,
    current: u32,
    prng: Mwc,
    stats: GlobalHeapStats,
}

impl ThreadLocalHeap {
    pub fn new(global: &GlobalHeap, thread_id: u32) -> Self {
        let mut shuffle_vector = Vec::with_capacity(size_classes::NUM_BINS);
        for class in 0..size_classes::NUM_BINS {
            let mut sv = ShuffleVector::new();
            sv.initial_init(global.arena_begin(), global.page_size(), class);
            shuffle_vector.push(sv);
        }
        ThreadLocalHeap { global: global as *const GlobalHeap, shuffle_vector, current: thread_id, prng: Mwc::from_os_entropy(), stats: GlobalHeapStats::default() }
    }

    // `self.global` points at the process-wide `GlobalHeap` inside
    // `Runtime`, which lives in a `OnceLock` for the rest of the process's
    // life and is never moved or dropped (see `lib.rs`), so handing out a
    // `'static` borrow here is sound and lets callers hold it across
    // `&mut self` calls without fighting the borrow checker over a
    // lifetime that would otherwise (conservatively, and incorrectly) be
    // tied to `self`.
    fn global(&self) -> &'static GlobalHeap {
        unsafe { &*self.global }
    }

    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        let class = match size_classes::get_size_class(size) {
            Some(c) => c,
            None => return self.global().malloc_large(size),
        };
        if let Some(ptr) = self.shuffle_vector[class].malloc(self.global().pool()) {
            self.stats.record_alloc(size_classes::byte_size_for_class(class));
            return ptr;
        }
        self.small_alloc_slowpath(class)
    }

    fn small_alloc_slowpath(&mut self, class: usize) -> *mut u8 {
        let global = self.global();
        if !self.shuffle_vector[class].local_refill(global.pool()) {
            let goal = options::get().miniheap_refill_goal_size;
            let object_size = size_classes::byte_size_for_class(class).max(1);
            let count = (goal / object_size).max(1).min(options::get().max_miniheaps_per_shuffle_vector);
            self.release_attached(class);
            for id in global.alloc_small_miniheaps(class, count) {
                self.attach(class, id);
            }
            self.shuffle_vector[class].reinit(global.pool(), &mut self.prng);
        }
        match self.shuffle_vector[class].malloc(global.pool()) {
            Some(ptr) => {
                self.stats.record_alloc(size_classes::byte_size_for_class(class));
                ptr
            }
            None => std::ptr::null_mut(),
        }
    }

    fn attach(&mut self, class: usize, id: MiniHeapId) {
        let mh = unsafe { &*self.global().pool().ptr(id.0) };
        mh.set_attached(self.current);
        self.shuffle_vector[class].attach(id);
    }

    /// Detaches every mini-heap currently attached to this shuffle vector
    /// and republishes it to the size class's tracker, instead of simply
    /// dropping it from the attached list (reference's `releaseAll`).
    /// Without this, a mini-heap rotated out by a refill stays `Attached`
    /// with live objects but sits in no shuffle vector and no tracker bin
    /// — never freeable and never reusable.
    fn release_attached(&mut self, class: usize) {
        let global = self.global();
        let ids: Vec<MiniHeapId> = self.shuffle_vector[class].attached().to_vec();
        for id in ids {
            let mh = unsafe { &*global.pool().ptr(id.0) };
            mh.detach();
            global.tracker_for(class).add(global.pool(), id, &mut self.prng);
        }
        self.shuffle_vector[class].clear_attached();
    }

    /// Resolves `ptr` through the arena's page index rather than scanning
    /// this thread's attached shuffle vectors — the scan can never find a
    /// mini-heap another thread allocated, which used to make cross-thread
    /// frees silently vanish. When the pointer's mini-heap happens to still
    /// be attached to this thread, free it straight into the shuffle
    /// vector's cache; otherwise fall through to `GlobalHeap::free_for`.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let global = self.global();
        if global.is_large(ptr) {
            global.free_large(ptr);
            return;
        }
        if global.free_aligned(ptr) {
            return;
        }
        let id = match global.arena().lookup(ptr) {
            Some(id) => id,
            None => {
                log::debug!("free: pointer not owned by any known mini-heap: {:p}", ptr);
                return;
            }
        };
        let (owned_locally, meshed) = {
            let mh = unsafe { &*global.pool().ptr(id.0) };
            (mh.current() == self.current, mh.is_meshed())
        };
        if owned_locally && !meshed {
            if let Some(class) = self.local_class_for(id) {
                self.stats.record_free(size_classes::byte_size_for_class(class));
                self.shuffle_vector[class].free(global.pool(), id, ptr);
                return;
            }
        }
        global.free_for(ptr);
    }

    /// Index of the shuffle vector `id` is currently attached to, if any.
    fn local_class_for(&self, id: MiniHeapId) -> Option<usize> {
        self.shuffle_vector.iter().position(|sv| sv.attached().contains(&id))
    }

    pub fn get_size(&self, ptr: *mut u8) -> usize {
        let global = self.global();
        if global.is_large(ptr) {
            return global.get_size_large(ptr);
        }
        if let Some(size) = global.get_size_aligned(ptr) {
            return size;
        }
        match global.arena().lookup(ptr) {
            Some(id) => unsafe { &*global.pool().ptr(id.0) }.object_size(),
            None => 0,
        }
    }

    /// `calloc` with the reference's overflow guard: `count > SIZE_MAX /
    /// size` is checked before the multiply, not after.
    pub fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        if size != 0 && count > usize::MAX / size {
            return std::ptr::null_mut();
        }
        let total = count * size;
        let ptr = self.malloc(total);
        if !ptr.is_null() {
            unsafe {
                std::ptr::write_bytes(ptr, 0, total);
            }
        }
        ptr
    }

    /// tcmalloc-style resizing-ping-pong avoidance: only actually
    /// reallocates when `new_size` falls outside
    /// `[oldSize/2, oldSize + oldSize/4]`.
    pub fn realloc(&mut self, old_ptr: *mut u8, new_size: usize) -> *mut u8 {
        if old_ptr.is_null() {
            return self.malloc(new_size);
        }
        let old_size = self.get_size(old_ptr);
        let lower_bound_to_grow = old_size + old_size / 4;
        let upper_bound_to_shrink = old_size / 2;
        if new_size <= lower_bound_to_grow && new_size >= upper_bound_to_shrink {
            return old_ptr;
        }
        let new_ptr = self.malloc(new_size);
        if !new_ptr.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(old_ptr, new_ptr, old_size.min(new_size));
            }
            self.free(old_ptr);
        }
        new_ptr
    }

    /// Page-aligned slow path for `posix_memalign`/C++ aligned `new`:
    /// sub-page alignments that still fit a size class are served from
    /// the ordinary small-object path (every size-class slot is already
    /// naturally aligned to its own size); anything coarser goes straight
    /// to the arena's over-reserve-and-trim allocator.
    pub fn memalign(&mut self, alignment: usize, size: usize) -> *mut u8 {
        if alignment <= std::mem::align_of::<usize>() {
            return self.malloc(size);
        }
        if !alignment.is_power_of_two() {
            return std::ptr::null_mut();
        }
        if let Some(class) = size_classes::get_size_class(size) {
            let object_size = size_classes::byte_size_for_class(class);
            if object_size % alignment == 0 {
                return self.malloc(size);
            }
        }
        let global = self.global();
        let page_size = global.page_size();
        let alignment_pages = (alignment / page_size).max(1) as u32;
        let page_count = ((size + page_size - 1) / page_size).max(1) as u32;
        global.alloc_aligned(alignment_pages, page_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_heap::GlobalHeap;

    fn leaked_heap() -> &'static GlobalHeap {
        Box::leak(Box::new(GlobalHeap::new().expect("heap creation")))
    }

    #[test]
    fn same_thread_alloc_and_free_round_trips() {
        let global = leaked_heap();
        let mut heap = ThreadLocalHeap::new(global, 1);
        let ptr = heap.malloc(64);
        assert!(!ptr.is_null());
        heap.free(ptr);
    }

    #[test]
    fn pointer_freed_by_a_different_thread_local_heap_is_accepted() {
        let global = leaked_heap();
        let mut producer = ThreadLocalHeap::new(global, 1);
        let mut consumer = ThreadLocalHeap::new(global, 2);
        let ptr = producer.malloc(64);
        assert!(!ptr.is_null());
        // `producer`'s shuffle vector still holds this mini-heap attached,
        // but `consumer` has never seen it locally — it must resolve
        // through the arena index rather than being silently dropped.
        consumer.free(ptr);
    }

    #[test]
    fn release_attached_republishes_to_the_tracker() {
        let global = leaked_heap();
        let mut heap = ThreadLocalHeap::new(global, 1);
        let ptr = heap.malloc(64);
        assert!(!ptr.is_null());
        let class = size_classes::get_size_class(64).unwrap();
        heap.release_attached(class);
        assert!(heap.shuffle_vector[class].attached().is_empty());
        assert!(global.tracker_for(class).select_for_reuse().is_some());
    }
}
