//! Virtual-to-physical indirection (spec.md §2 component 6): one big
//! `memfd`-backed `mmap` arena, span bookkeeping, and the `mesh`/`freePhys`
//! primitives meshing is built on.
//!
//! Grounded on `original_source/src/meshable_arena.h`. The reference keeps
//! per-length free lists up to a small span-class cap plus an overflow
//! path for larger runs; this crate mirrors that bucketing but folds the
//! "clean" vs "dirty" distinction (has the kernel already reclaimed the
//! physical pages?) into two parallel bucket sets rather than the
//! reference's `_dirty`/`_clean` members with separate accounting — same
//! shape, fewer fields.
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::MeshError;
use crate::mini_heap::{MiniHeapId, Span};
use crate::options;
use crate::os;

/// Span lengths up to this many pages get their own freelist bucket;
/// longer runs fall into the overflow map keyed by exact length.
const MAX_SPAN_CLASS: usize = 256;

#[derive(Default)]
struct FreeLists {
    buckets: Vec<VecDeque<Span>>,
    overflow: BTreeMap<u32, VecDeque<Span>>,
}

impl FreeLists {
    fn new() -> Self {
        let mut buckets = Vec::with_capacity(MAX_SPAN_CLASS + 1);
        buckets.resize_with(MAX_SPAN_CLASS + 1, VecDeque::new);
        FreeLists { buckets, overflow: BTreeMap::new() }
    }

    fn push(&mut self, span: Span) {
        let len = span.length as usize;
        if len <= MAX_SPAN_CLASS {
            self.buckets[len].push_back(span);
        } else {
            self.overflow.entry(span.length).or_default().push_back(span);
        }
    }

    fn pop_exact(&mut self, page_count: u32) -> Option<Span> {
        let len = page_count as usize;
        if len <= MAX_SPAN_CLASS {
            if let Some(span) = self.buckets[len].pop_front() {
                return Some(span);
            }
        }
        if let Some(list) = self.overflow.get_mut(&page_count) {
            if let Some(span) = list.pop_front() {
                if list.is_empty() {
                    self.overflow.remove(&page_count);
                }
                return Some(span);
            }
        }
        None
    }

    /// First-fit over larger buckets, to be split by the caller.
    fn pop_at_least(&mut self, page_count: u32) -> Option<Span> {
        for len in (page_count as usize + 1)..=MAX_SPAN_CLASS {
            if let Some(span) = self.buckets[len].pop_front() {
                return Some(span);
            }
        }
        let mut found_key = None;
        for (&len, list) in self.overflow.iter() {
            if len >= page_count && !list.is_empty() {
                found_key = Some(len);
                break;
            }
        }
        if let Some(key) = found_key {
            let list = self.overflow.get_mut(&key).unwrap();
            let span = list.pop_front();
            if list.is_empty() {
                self.overflow.remove(&key);
            }
            return span;
        }
        None
    }

    fn drain(&mut self) -> Vec<Span> {
        let mut all = Vec::new();
        for bucket in self.buckets.iter_mut() {
            all.extend(bucket.drain(..));
        }
        for (_, list) in self.overflow.iter_mut() {
            all.extend(list.drain(..));
        }
        self.overflow.clear();
        all
    }
}

/// One big `MAP_SHARED` region backed by an unlinked file, subdivided
/// into page-granularity spans. Two spans mapped at different offsets of
/// the same file can be made to alias the same physical frames — that
/// aliasing operation is meshing (spec.md §4.3).
pub struct MeshableArena {
    base: *mut u8,
    fd: AtomicI32,
    arena_size_pages: u32,
    high_water_mark: AtomicU32,
    dirty: Mutex<FreeLists>,
    clean: Mutex<FreeLists>,
    /// One entry per arena page, holding the `MiniHeapId` that currently
    /// owns it (spec.md §3 "arena index"). `lookup` is the sole mechanism
    /// the free path uses to resolve a bare pointer back to its mini-heap.
    index: Vec<AtomicU32>,
}

// SAFETY: `base`/`fd` are fixed for the arena's lifetime; all mutable
// state lives behind the two mutexes.
unsafe impl Send for MeshableArena {}
unsafe impl Sync for MeshableArena {}

impl MeshableArena {
    pub fn new() -> Result<Self, MeshError> {
        let opts = options::get();
        let page_size = os::page_size();
        let arena_size = os::align_up(opts.arena_size, page_size);
        let fd = os::create_backing_file(arena_size)?;
        let base = match os::mmap_shared(arena_size, libc::PROT_READ | libc::PROT_WRITE, fd) {
            Ok(ptr) => ptr,
            Err(e) => {
                unsafe {
                    libc::close(fd);
                }
                return Err(e);
            }
        };
        let arena_size_pages = (arena_size / page_size) as u32;
        let mut index = Vec::with_capacity(arena_size_pages as usize);
        index.resize_with(arena_size_pages as usize, || AtomicU32::new(MiniHeapId::NULL.0));
        Ok(MeshableArena {
            base,
            fd: AtomicI32::new(fd),
            arena_size_pages,
            high_water_mark: AtomicU32::new(0),
            dirty: Mutex::new(FreeLists::new()),
            clean: Mutex::new(FreeLists::new()),
            index,
        })
    }

    pub fn arena_begin(&self) -> usize {
        self.base as usize
    }

    pub fn page_size(&self) -> usize {
        os::page_size()
    }

    pub fn span_start(&self, span: &Span) -> *mut u8 {
        unsafe { self.base.add(span.offset as usize * self.page_size()) }
    }

    /// Returns a span of at least `page_count` pages, splitting a larger
    /// free span or extending the high-water mark as needed.
    pub fn page_alloc(&self, page_count: u32) -> Span {
        if let Some(span) = self.find_pages(page_count) {
            return span;
        }
        self.reserve_pages(page_count)
    }

    fn find_pages(&self, page_count: u32) -> Option<Span> {
        if let Some(span) = self.dirty.lock().unwrap().pop_exact(page_count) {
            return Some(span);
        }
        if let Some(span) = self.clean.lock().unwrap().pop_exact(page_count) {
            return Some(span);
        }
        if let Some(span) = self.find_pages_inner(&self.dirty, page_count) {
            return Some(span);
        }
        self.find_pages_inner(&self.clean, page_count)
    }

    fn find_pages_inner(&self, lists: &Mutex<FreeLists>, page_count: u32) -> Option<Span> {
        let mut lists = lists.lock().unwrap();
        let found = lists.pop_at_least(page_count)?;
        if found.length > page_count {
            let remainder = Span { offset: found.offset + page_count, length: found.length - page_count };
            lists.push(remainder);
        }
        Some(Span { offset: found.offset, length: page_count })
    }

    fn reserve_pages(&self, page_count: u32) -> Span {
        let offset = self.high_water_mark.fetch_add(page_count, Ordering::AcqRel);
        hard_assert!(offset + page_count <= self.arena_size_pages, "mesh arena exhausted");
        Span { offset, length: page_count }
    }

    /// Page-aligned allocation for large objects: over-reserves so the
    /// returned pointer can be trimmed to exactly `page_count` pages with
    /// unused pages returned to the dirty list, mirroring the reference's
    /// over-reserve-and-trim strategy for alignment requests.
    pub fn page_aligned_alloc(&self, alignment_pages: u32, page_count: u32) -> Span {
        if alignment_pages <= 1 {
            return self.page_alloc(page_count);
        }
        let over = self.page_alloc(page_count + alignment_pages);
        let aligned_offset = os::align_up(over.offset as usize, alignment_pages as usize) as u32;
        let head = aligned_offset - over.offset;
        if head > 0 {
            self.free(Span { offset: over.offset, length: head });
        }
        let tail_offset = aligned_offset + page_count;
        let tail = (over.offset + over.length) - tail_offset;
        if tail > 0 {
            self.free(Span { offset: tail_offset, length: tail });
        }
        Span { offset: aligned_offset, length: page_count }
    }

    /// Returns a span to the dirty freelist. Actual physical reclaim is
    /// deferred to `scavenge` (spec.md §4.3 — freeing is decoupled from
    /// hole-punching so the background thread can batch it).
    pub fn free(&self, span: Span) {
        self.unstamp(&span);
        self.dirty.lock().unwrap().push(span);
    }

    fn stamp_range(&self, span: &Span, id: u32) {
        for page in span.offset..span.offset + span.length {
            self.index[page as usize].store(id, Ordering::Release);
        }
    }

    /// Publishes `id` as the owner of every page in `span` in the arena-wide
    /// index (spec.md §3), the structure `lookup` walks to resolve a bare
    /// pointer back to its owning mini-heap.
    pub fn stamp(&self, span: &Span, id: MiniHeapId) {
        self.stamp_range(span, id.0);
    }

    fn unstamp(&self, span: &Span) {
        self.stamp_range(span, MiniHeapId::NULL.0);
    }

    /// Resolves `ptr` to the mini-heap that currently owns its page, or
    /// `None` if it falls outside any stamped span (spec.md §2: "computes
    /// the mini-heap for the pointer from the arena index").
    pub fn lookup(&self, ptr: *mut u8) -> Option<MiniHeapId> {
        let addr = ptr as usize;
        let begin = self.arena_begin();
        if addr < begin {
            return None;
        }
        let page = (addr - begin) / self.page_size();
        let id = self.index.get(page)?.load(Ordering::Acquire);
        if id == MiniHeapId::NULL.0 {
            None
        } else {
            Some(MiniHeapId(id))
        }
    }

    /// Hole-punches every dirty span and moves it to the clean list.
    /// `partial` scavenges must call this repeatedly from the background
    /// thread rather than doing the whole arena at once.
    pub fn scavenge(&self, full: bool) {
        let drained = if full {
            self.dirty.lock().unwrap().drain()
        } else {
            let mut dirty = self.dirty.lock().unwrap();
            let budget = (dirty.buckets.len() / 4).max(1);
            let mut taken = Vec::new();
            for bucket in dirty.buckets.iter_mut() {
                if taken.len() >= budget {
                    break;
                }
                if let Some(span) = bucket.pop_front() {
                    taken.push(span);
                }
            }
            taken
        };
        let page_size = self.page_size();
        let fd = self.fd.load(Ordering::Acquire);
        for span in drained {
            let byte_off = span.offset as i64 * page_size as i64;
            let byte_len = span.length as i64 * page_size as i64;
            if let Err(e) = os::punch_hole(fd, byte_off, byte_len) {
                log::debug!("scavenge: punch_hole failed: {}", e);
            }
            self.clean.lock().unwrap().push(span);
        }
    }

    /// Releases the physical pages backing `span` without touching the
    /// freelists — used after a mesh to drop the loser's now-unreferenced
    /// backing pages immediately (spec.md §4.3 `freePhys`).
    pub fn free_phys(&self, span: &Span) {
        let page_size = self.page_size();
        let byte_off = span.offset as i64 * page_size as i64;
        let byte_len = span.length as i64 * page_size as i64;
        let fd = self.fd.load(Ordering::Acquire);
        if let Err(e) = os::punch_hole(fd, byte_off, byte_len) {
            log::debug!("free_phys: punch_hole failed: {}", e);
        }
    }

    /// Marks `span`'s virtual range read-only so concurrent writers fault
    /// into the runtime's segfault handler during the copy phase of a
    /// mesh (spec.md §4.3/§5).
    pub fn begin_mesh(&self, span: &Span) -> Result<(), MeshError> {
        let page_size = self.page_size();
        os::protect_read_only(self.span_start(span), span.length as usize * page_size)
    }

    /// Remaps `loser`'s virtual address range onto `survivor`'s backing
    /// file offset so both spans alias the same physical frames, then
    /// restores read-write access. This is the actual "mesh": two
    /// distinct virtual ranges, one physical frame set. Also stamps the
    /// loser's former index entries with `survivor_id` (spec.md §4.3: "stamp
    /// the arena index entries of the removed span with the survivor's id"),
    /// so a later free of a pointer in the loser's range resolves to the
    /// survivor mini-heap rather than the one that no longer owns any pages.
    pub fn finalize_mesh(&self, survivor_id: MiniHeapId, survivor: &Span, loser: &Span) -> Result<(), MeshError> {
        let page_size = self.page_size();
        let len = survivor.length as usize * page_size;
        let dst_addr = self.span_start(loser);
        let offset = survivor.offset as i64 * page_size as i64;
        let fd = self.fd.load(Ordering::Acquire);
        os::mmap_fixed_shared(dst_addr, len, libc::PROT_READ | libc::PROT_WRITE, fd, offset)?;
        self.free_phys(loser);
        self.stamp(loser, survivor_id);
        Ok(())
    }

    /// Rebuilds the backing file after `fork()`. Parent and child share one
    /// `memfd` across the call, so without this every write on either side
    /// aliases the same physical pages (spec.md §4.10, §5 scenario 5 "fork
    /// consistency"). Allocates a fresh file, copies every page handed out
    /// so far, and remaps the (unchanged) virtual base onto it.
    pub fn rebuild_after_fork(&self) -> Result<(), MeshError> {
        let page_size = self.page_size();
        let used_bytes = self.high_water_mark.load(Ordering::Acquire) as usize * page_size;
        let total_bytes = self.arena_size_pages as usize * page_size;
        let old_fd = self.fd.load(Ordering::Acquire);
        let new_fd = os::create_backing_file(total_bytes)?;
        if used_bytes > 0 {
            let snapshot = unsafe { std::slice::from_raw_parts(self.base, used_bytes) };
            if let Err(e) = os::pwrite_all(new_fd, snapshot, 0) {
                unsafe {
                    libc::close(new_fd);
                }
                return Err(e);
            }
        }
        os::mmap_fixed_shared(self.base, total_bytes, libc::PROT_READ | libc::PROT_WRITE, new_fd, 0)?;
        self.fd.store(new_fd, Ordering::Release);
        unsafe {
            libc::close(old_fd);
        }
        Ok(())
    }

    pub fn above_mesh_threshold(&self) -> bool {
        let dirty_pages: usize = {
            let dirty = self.dirty.lock().unwrap();
            dirty.buckets.iter().map(|b| b.iter().map(|s| s.length as usize).sum::<usize>()).sum::<usize>()
                + dirty.overflow.values().flat_map(|l| l.iter()).map(|s| s.length as usize).sum::<usize>()
        };
        dirty_pages >= options::get().max_dirty_page_threshold
    }
}

impl Drop for MeshableArena {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd.load(Ordering::Acquire));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alloc_never_overlaps_within_one_arena() {
        let arena = MeshableArena::new().expect("arena creation");
        let a = arena.page_alloc(4);
        let b = arena.page_alloc(4);
        assert!(a.offset + a.length <= b.offset || b.offset + b.length <= a.offset);
    }

    #[test]
    fn freed_span_is_reused_by_exact_fit() {
        let arena = MeshableArena::new().expect("arena creation");
        let span = arena.page_alloc(8);
        arena.free(span);
        let reused = arena.page_alloc(8);
        assert_eq!(reused.offset, span.offset);
    }

    #[test]
    fn oversized_free_span_splits_on_reuse() {
        let arena = MeshableArena::new().expect("arena creation");
        let span = arena.page_alloc(16);
        arena.free(span);
        let small = arena.page_alloc(4);
        assert_eq!(small.offset, span.offset);
        assert_eq!(small.length, 4);
    }

    #[test]
    fn stamped_span_resolves_through_lookup_on_every_page() {
        let arena = MeshableArena::new().expect("arena creation");
        let span = arena.page_alloc(2);
        let id = MiniHeapId(7);
        arena.stamp(&span, id);
        let start = arena.span_start(&span);
        assert_eq!(arena.lookup(start), Some(id));
        let second_page = unsafe { start.add(arena.page_size()) };
        assert_eq!(arena.lookup(second_page), Some(id));
    }

    #[test]
    fn freeing_a_span_clears_its_index_entries() {
        let arena = MeshableArena::new().expect("arena creation");
        let span = arena.page_alloc(1);
        arena.stamp(&span, MiniHeapId(3));
        let ptr = arena.span_start(&span);
        arena.free(span);
        assert_eq!(arena.lookup(ptr), None);
    }

    #[test]
    fn unstamped_pointer_does_not_resolve() {
        let arena = MeshableArena::new().expect("arena creation");
        let span = arena.page_alloc(1);
        let ptr = arena.span_start(&span);
        assert_eq!(arena.lookup(ptr), None);
    }
}
