//! A meshing memory allocator: a drop-in `GlobalAlloc` that transparently
//! reclaims physical memory fragmented across many partially-used pages
//! by remapping two virtually-distinct, physically-compatible spans onto
//! one physical frame set (spec.md §1).
//!
//! Module layout follows the dependency order components are built in:
//! primitives (`bitmap`, `rng`, `size_classes`) first, then the arena and
//! mini-heap metadata, then the per-size-class tracker and shuffle
//! vector, then the meshing search itself, and finally the two
//! allocator-facing layers (`global_heap`, `thread_local_heap`) wired
//! together by `runtime`.
#[macro_use]
mod error;

mod arena;
mod bitmap;
mod cheap_heap;
mod global_heap;
mod internal;
mod meshing;
mod mini_heap;
mod mmap_heap;
mod options;
mod os;
mod rng;
mod runtime;
mod shuffle_vector;
mod size_classes;
mod stats;
mod thread_local_heap;
mod tracker;

use std::alloc::{GlobalAlloc, Layout};
use std::cell::UnsafeCell;

use thread_local_heap::ThreadLocalHeap;

pub struct Mesh;

struct PerThread {
    heap: UnsafeCell<Option<ThreadLocalHeap>>,
}

// SAFETY: a `PerThread` is only ever reached through its own
// `thread_local!` cell, so the `UnsafeCell` is never touched from two
// threads at once.
unsafe impl Sync for PerThread {}

thread_local! {
    static LOCAL: PerThread = PerThread { heap: UnsafeCell::new(None) };
}

fn with_local_heap<R>(f: impl FnOnce(&mut ThreadLocalHeap) -> R) -> R {
    runtime::ensure_started();
    LOCAL.with(|local| {
        let slot = unsafe { &mut *local.heap.get() };
        if slot.is_none() {
            let thread_id = internal::next_thread_id();
            *slot = Some(ThreadLocalHeap::new(runtime::runtime().heap(), thread_id));
        }
        f(slot.as_mut().unwrap())
    })
}

unsafe impl GlobalAlloc for Mesh {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > std::mem::align_of::<usize>() {
            return with_local_heap(|h| h.memalign(layout.align(), layout.size()));
        }
        with_local_heap(|h| h.malloc(layout.size()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        with_local_heap(|h| h.free(ptr));
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        with_local_heap(|h| h.realloc(ptr, new_size))
    }
}

/// `xxmalloc`-equivalent entry point for callers that want the allocator
/// directly rather than through `GlobalAlloc` (spec.md §6).
pub fn mesh_malloc(size: usize) -> *mut u8 {
    with_local_heap(|h| h.malloc(size))
}

pub fn mesh_free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    with_local_heap(|h| h.free(ptr));
}

pub fn mesh_calloc(count: usize, size: usize) -> *mut u8 {
    with_local_heap(|h| h.calloc(count, size))
}

pub fn mesh_realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    with_local_heap(|h| h.realloc(ptr, new_size))
}

pub fn mesh_memalign(alignment: usize, size: usize) -> *mut u8 {
    with_local_heap(|h| h.memalign(alignment, size))
}

pub fn mesh_usable_size(ptr: *mut u8) -> usize {
    with_local_heap(|h| h.get_size(ptr))
}

/// `mesh_in_bounds`: true if `ptr` was handed out by this allocator
/// (spec.md §6), used by callers that need to distinguish our pointers
/// from ones owned by another allocator sharing the process.
pub fn mesh_in_bounds(ptr: *mut u8) -> bool {
    runtime::ensure_started();
    let heap = runtime::runtime().heap();
    let begin = heap.arena_begin();
    let end = begin + heap.arena().page_size() * usable_arena_pages();
    let addr = ptr as usize;
    heap.is_large(ptr) || (addr >= begin && addr < end)
}

fn usable_arena_pages() -> usize {
    options::get().arena_size / os::page_size()
}

/// `mallctl`-equivalent control surface (spec.md §6): `mesh.scavenge`,
/// `mesh.compact`, `mesh.check_period`, `arena`, `stats.resident`,
/// `stats.active`, `stats.allocated`.
pub fn mesh_mallctl(name: &str) -> Option<i64> {
    runtime::ensure_started();
    runtime::runtime().heap().mallctl(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_free_round_trip_does_not_crash() {
        let ptr = mesh_malloc(64);
        assert!(!ptr.is_null());
        assert!(mesh_in_bounds(ptr));
        mesh_free(ptr);
    }

    #[test]
    fn calloc_zeroes_memory() {
        let ptr = mesh_calloc(16, 8);
        assert!(!ptr.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(ptr, 128) };
        assert!(bytes.iter().all(|&b| b == 0));
        mesh_free(ptr);
    }

    #[test]
    fn unrecognized_mallctl_name_is_none() {
        assert!(mesh_mallctl("totally.unknown").is_none());
    }
}
