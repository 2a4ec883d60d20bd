//! Process-wide allocator state: owns the arena, the mini-heap pool, one
//! occupancy tracker per size class, and the meshing control loop (spec.md
//! §2 component 11, §4.8).
//!
//! Grounded on `original_source/src/global_heap.h` and
//! `global_heap_impl.h`'s `GlobalHeap<PageSize>::malloc/free/mallctl/
//! meshLocked/meshSizeClassLocked/meshAllSizeClassesLocked`. The
//! reference keeps `meshAllSizeClassesLocked`'s scratch arrays (merge set,
//! left/right split) as function-local `static` buffers, which spec.md §9
//! flags as non-reentrant; here they're ordinary local `Vec`s allocated on
//! the stack of the call that needs them, which removes the hazard
//! entirely instead of just documenting it (see DESIGN.md).
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::arena::MeshableArena;
use crate::cheap_heap::CheapHeap;
use crate::error::MeshError;
use crate::meshing;
use crate::mini_heap::{MiniHeap, MiniHeapId, MiniHeapPool};
use crate::mmap_heap::MmapHeap;
use crate::options;
use crate::rng::Mwc;
use crate::size_classes;
use crate::stats::GlobalHeapStats;
use crate::tracker::StripedTracker;

/// Monotonic counter bumped around mesh operations so the segfault
/// handler (`Runtime::okToProceed`, spec.md §5) can tell a faulting
/// reader whether the racing mesh has already finished.
pub struct EpochLock {
    epoch: AtomicU64,
}

impl EpochLock {
    fn new() -> Self {
        EpochLock { epoch: AtomicU64::new(0) }
    }

    pub fn current(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Exposes the raw counter for the segfault handler to poll, which
    /// cannot take any lock or call back into `GlobalHeap` (signal-safety).
    pub fn inner(&self) -> &AtomicU64 {
        &self.epoch
    }

    fn begin(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn end(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// True if no mesh was in flight (even epoch) at `observed`, or the
    /// epoch hasn't moved since — the read that faulted is safe to retry.
    pub fn ok_to_proceed(&self, observed: u64) -> bool {
        observed % 2 == 0 || self.epoch.load(Ordering::Acquire) == observed
    }
}

pub struct GlobalHeap {
    arena: MeshableArena,
    pool: MiniHeapPool,
    trackers: Vec<StripedTracker>,
    large: MmapHeap,
    stats: GlobalHeapStats,
    prng: Mutex<Mwc>,
    mesh_lock: Mutex<()>,
    epoch: EpochLock,
    /// Spans handed out by `alloc_aligned` (over-alignment requests that
    /// bypass the mini-heap machinery) — tracked separately since they
    /// have no owning mini-heap to carry their size.
    aligned: Mutex<HashMap<usize, crate::mini_heap::Span>>,
}

impl GlobalHeap {
    pub fn new() -> Result<Self, MeshError> {
        let arena = MeshableArena::new()?;
        let mut trackers = Vec::with_capacity(size_classes::NUM_BINS);
        trackers.resize_with(size_classes::NUM_BINS, StripedTracker::new);
        Ok(GlobalHeap {
            arena,
            pool: CheapHeap::new(options::get().max_miniheap_count as u32),
            trackers,
            large: MmapHeap::new(),
            stats: GlobalHeapStats::default(),
            prng: Mutex::new(Mwc::from_os_entropy()),
            mesh_lock: Mutex::new(()),
            epoch: EpochLock::new(),
            aligned: Mutex::new(HashMap::new()),
        })
    }

    /// Serves an over-alignment request directly from the arena
    /// (`memalign`'s slow path — spec.md §4.9), tracking the span so a
    /// later `free`/`get_size` can find it even though it has no owning
    /// mini-heap.
    pub fn alloc_aligned(&self, alignment_pages: u32, page_count: u32) -> *mut u8 {
        let span = self.arena.page_aligned_alloc(alignment_pages, page_count);
        let ptr = self.arena.span_start(&span);
        self.aligned.lock().unwrap().insert(ptr as usize, span);
        self.stats.record_alloc(span.length as usize * self.page_size());
        ptr
    }

    pub fn is_aligned_alloc(&self, ptr: *mut u8) -> bool {
        self.aligned.lock().unwrap().contains_key(&(ptr as usize))
    }

    pub fn free_aligned(&self, ptr: *mut u8) -> bool {
        if let Some(span) = self.aligned.lock().unwrap().remove(&(ptr as usize)) {
            self.stats.record_free(span.length as usize * self.page_size());
            self.arena.free(span);
            true
        } else {
            false
        }
    }

    pub fn get_size_aligned(&self, ptr: *mut u8) -> Option<usize> {
        self.aligned.lock().unwrap().get(&(ptr as usize)).map(|s| s.length as usize * self.page_size())
    }

    pub fn arena_begin(&self) -> usize {
        self.arena.arena_begin()
    }

    pub fn page_size(&self) -> usize {
        self.arena.page_size()
    }

    pub fn pool(&self) -> &MiniHeapPool {
        &self.pool
    }

    pub fn arena(&self) -> &MeshableArena {
        &self.arena
    }

    pub fn epoch(&self) -> &EpochLock {
        &self.epoch
    }

    /// Large-object path: anything bigger than the largest size class
    /// skips mini-heaps entirely and goes straight to `mmap` (spec.md
    /// §4.8 Non-goals — large allocations are never meshed).
    pub fn malloc_large(&self, size: usize) -> *mut u8 {
        let ptr = self.large.malloc(size);
        if !ptr.is_null() {
            self.stats.record_alloc(size);
        }
        ptr
    }

    pub fn free_large(&self, ptr: *mut u8) {
        let size = self.large.get_size(ptr);
        self.large.free(ptr);
        self.stats.record_free(size);
    }

    pub fn is_large(&self, ptr: *mut u8) -> bool {
        self.large.in_bounds(ptr)
    }

    pub fn get_size_large(&self, ptr: *mut u8) -> usize {
        self.large.get_size(ptr)
    }

    /// Finds (or builds) a mini-heap with a free slot for `size_class`,
    /// attaches it to the caller, and returns its id (reference's
    /// `allocMiniheapLocked`).
    pub fn alloc_miniheap_locked(&self, size_class: usize) -> MiniHeapId {
        if let Some(id) = self.trackers[size_class].select_for_reuse() {
            // `select_for_reuse` leaves `id` sitting in its tracker bin;
            // the caller is about to mark it Attached, so evict it here or
            // it stays both Attached and bin-resident forever (`remove` is
            // a no-op once `freelist_id()` reads back as Attached).
            self.trackers[size_class].remove(&self.pool, id);
            return id;
        }
        let object_size = size_classes::byte_size_for_class(size_class);
        let page_size = self.page_size();
        // `allocSmallMiniheaps` (spec.md §4.7): size the span in bytes, not
        // pages — classes whose object size exceeds a page (8192/16384
        // bytes) still route through this "small" path and need more than
        // one page, with exactly one object per mini-heap.
        let (page_count, max_count) = if object_size <= page_size {
            (1u32, (page_size / object_size.max(1)).max(1) as u32)
        } else {
            (((object_size + page_size - 1) / page_size) as u32, 1u32)
        };
        let span = self.arena.page_alloc(page_count);
        let id = MiniHeapId(self.pool.alloc());
        unsafe {
            std::ptr::write(self.pool.ptr(id.0), MiniHeap::new(span, size_class, max_count));
        }
        self.arena.stamp(&span, id);
        let mh = unsafe { &*self.pool.ptr(id.0) };
        mh.set_attached(1);
        self.stats.record_alloc(0);
        id
    }

    /// Builds `count` fresh mini-heaps for `size_class` in one pass
    /// (`allocSmallMiniheaps` — refilling a `ShuffleVector` one mini-heap
    /// at a time would repeatedly take/drop the tracker lock).
    pub fn alloc_small_miniheaps(&self, size_class: usize, count: usize) -> Vec<MiniHeapId> {
        (0..count).map(|_| self.alloc_miniheap_locked(size_class)).collect()
    }

    /// Slow-path free: the calling thread doesn't own the pointer's
    /// mini-heap locally (meshed away or allocated on another thread), so
    /// resolve it through the arena index and update it directly under the
    /// tracker's accounting (reference's `freeFor(mh, ptr, startEpoch)`).
    ///
    /// A mesh running concurrently on this mini-heap's size class can
    /// change which id `ptr`'s page resolves to mid-flight (`finalize_mesh`
    /// re-stamps the loser's pages onto the survivor). `free_for` samples
    /// the epoch before and after touching the bitmap and retries the
    /// whole lookup-and-clear if it saw an in-flight or completed mesh,
    /// so it never clears a bit on a mini-heap that's mid-mesh or stale.
    pub fn free_for(&self, ptr: *const u8) {
        loop {
            let start_epoch = self.epoch.current();
            let id = match self.arena.lookup(ptr as *mut u8) {
                Some(id) => id,
                None => {
                    log::debug!("free: pointer not owned by any known mini-heap: {:p}", ptr);
                    return;
                }
            };
            let mh = unsafe { &*self.pool.ptr(id.0) };
            let page_size = self.page_size();
            let cleared = mh.clear_if_not_free(self.arena_begin(), page_size, ptr);
            let end_epoch = self.epoch.current();
            if start_epoch % 2 == 1 || end_epoch != start_epoch {
                std::hint::spin_loop();
                continue;
            }
            if !cleared {
                log::debug!("double free or invalid pointer: {:p}", ptr);
                return;
            }
            self.stats.record_free(mh.object_size());
            let size_class = mh.size_class();
            let mut prng = self.prng.lock().unwrap();
            let empty_cap = options::get().max_dirty_page_threshold;
            self.trackers[size_class].post_free(&self.pool, id, &mut prng, empty_cap);
            return;
        }
    }

    /// Mesh `loser` into `survivor`: read-only-protect `loser`'s span,
    /// copy its live objects into `survivor`, then remap `loser`'s
    /// virtual range onto `survivor`'s physical frames (spec.md §4.7/§4.8
    /// `meshLocked`).
    ///
    /// # Safety
    /// Caller must hold `mesh_lock` and ensure `survivor` and `loser`
    /// belong to the same size class and are not already meshed together.
    unsafe fn mesh_locked(&self, survivor_id: MiniHeapId, loser_id: MiniHeapId) -> Result<(), MeshError> {
        let survivor = &*self.pool.ptr(survivor_id.0);
        let loser = &*self.pool.ptr(loser_id.0);
        let epoch = self.epoch.begin();
        let result = (|| {
            self.arena.begin_mesh(&loser.span)?;
            let page_size = self.page_size();
            survivor.consume(&self.pool, survivor_id, loser, loser_id, self.arena_begin(), page_size);
            self.arena.finalize_mesh(survivor_id, &survivor.span, &loser.span)
        })();
        self.epoch.end();
        debug_assert!(epoch % 2 == 1);
        self.trackers[survivor.size_class()].remove(&self.pool, loser_id);
        self.stats.record_mesh(1);
        result
    }

    /// Finds and merges meshable pairs within one size class (reference's
    /// `meshSizeClassLocked`).
    fn mesh_size_class_locked(&self, size_class: usize) -> usize {
        let opts = options::get();
        let candidates = self.trackers[size_class].meshing_candidates(opts.occupancy_cutoff);
        if candidates.len() < 2 {
            return 0;
        }
        let mut prng = self.prng.lock().unwrap();
        let pairs = meshing::shifted_splitting(&self.pool, &candidates, &mut prng, opts.max_meshes_per_iteration);
        drop(prng);
        let mut merged = 0;
        for (survivor, loser) in pairs {
            unsafe {
                if self.mesh_locked(survivor, loser).is_ok() {
                    merged += 1;
                }
            }
        }
        merged
    }

    /// Sweeps every size class for meshing opportunities (reference's
    /// `meshAllSizeClassesLocked`), bounded by `maxMeshesPerIteration`.
    pub fn mesh_all_size_classes_locked(&self) -> usize {
        let _guard = self.mesh_lock.lock().unwrap();
        let budget = options::get().max_meshes_per_iteration;
        let mut total = 0;
        for class in 0..size_classes::NUM_BINS {
            if total >= budget {
                break;
            }
            total += self.mesh_size_class_locked(class);
        }
        total
    }

    /// Called periodically by the background thread: mesh if the arena's
    /// dirty-page fraction crosses the configured threshold (spec.md §9).
    pub fn maybe_mesh(&self) {
        if self.arena.above_mesh_threshold() {
            self.mesh_all_size_classes_locked();
        }
        self.arena.scavenge(false);
    }

    pub fn scavenge_locked(&self, full: bool) {
        self.arena.scavenge(full);
    }

    /// `mesh_mallctl`-equivalent dispatch surface (spec.md §6): recognizes
    /// the same handful of names the reference's `mallctl` does.
    pub fn mallctl(&self, name: &str) -> Option<i64> {
        match name {
            "mesh.scavenge" => {
                self.scavenge_locked(true);
                Some(0)
            }
            "mesh.compact" => Some(self.mesh_all_size_classes_locked() as i64),
            "mesh.check_period" => Some(options::get().mesh_period_ms as i64),
            "arena" => Some(0),
            "stats.resident" => Some(self.stats.allocated_high_water() as i64),
            "stats.active" => Some(self.stats.outstanding() as i64),
            "stats.allocated" => Some(self.stats.outstanding() as i64),
            _ => None,
        }
    }

    pub fn dump_stats(&self) {
        self.stats.dump(self.page_size());
    }

    pub fn tracker_for(&self, size_class: usize) -> &StripedTracker {
        &self.trackers[size_class]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_large_is_tracked_and_freeable() {
        let heap = GlobalHeap::new().expect("heap creation");
        let ptr = heap.malloc_large(1 << 20);
        assert!(!ptr.is_null());
        assert!(heap.is_large(ptr));
        heap.free_large(ptr);
        assert!(!heap.is_large(ptr));
    }

    #[test]
    fn alloc_miniheap_locked_produces_usable_span() {
        let heap = GlobalHeap::new().expect("heap creation");
        let class = size_classes::get_size_class(32).unwrap();
        let id = heap.alloc_miniheap_locked(class);
        let mh = unsafe { &*heap.pool().ptr(id.0) };
        assert_eq!(mh.size_class(), class);
        assert!(mh.is_attached());
    }

    #[test]
    fn unknown_mallctl_name_returns_none() {
        let heap = GlobalHeap::new().expect("heap creation");
        assert!(heap.mallctl("not.a.real.name").is_none());
        assert_eq!(heap.mallctl("arena"), Some(0));
    }

    #[test]
    fn large_small_object_class_gets_a_multi_page_span() {
        let heap = GlobalHeap::new().expect("heap creation");
        let class = size_classes::get_size_class(8192).unwrap();
        let id = heap.alloc_miniheap_locked(class);
        let mh = unsafe { &*heap.pool().ptr(id.0) };
        let object_size = size_classes::byte_size_for_class(class);
        let span_bytes = mh.span.length as usize * heap.page_size();
        assert!(span_bytes >= object_size, "span of {} bytes can't hold an {}-byte object", span_bytes, object_size);
        assert_eq!(mh.max_count(), 1);
    }

    #[test]
    fn reused_miniheap_is_removed_from_its_tracker_bin() {
        let heap = GlobalHeap::new().expect("heap creation");
        let class = size_classes::get_size_class(32).unwrap();
        let id = heap.alloc_miniheap_locked(class);
        // Return it to the tracker as if a thread released it, then ask
        // for a reuse — the reused id must come back out of the bin, not
        // stay resident in it.
        heap.tracker_for(class).add(heap.pool(), id, &mut heap.prng.lock().unwrap());
        let reused = heap.alloc_miniheap_locked(class);
        assert_eq!(reused, id);
        assert!(heap.tracker_for(class).select_for_reuse().is_none());
    }

    #[test]
    fn newly_allocated_miniheap_is_stamped_in_the_arena_index() {
        let heap = GlobalHeap::new().expect("heap creation");
        let class = size_classes::get_size_class(32).unwrap();
        let id = heap.alloc_miniheap_locked(class);
        let mh = unsafe { &*heap.pool().ptr(id.0) };
        let ptr = heap.arena().span_start(&mh.span);
        assert_eq!(heap.arena().lookup(ptr), Some(id));
    }

    #[test]
    fn epoch_moves_on_mesh_and_is_even_afterward() {
        let heap = GlobalHeap::new().expect("heap creation");
        let class = size_classes::get_size_class(32).unwrap();
        let a = heap.alloc_miniheap_locked(class);
        let b = heap.alloc_miniheap_locked(class);
        unsafe {
            let _ = heap.mesh_locked(a, b);
        }
        assert_eq!(heap.epoch().current() % 2, 0);
    }
}
