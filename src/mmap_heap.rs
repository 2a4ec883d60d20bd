//! Large-block `mmap` providers (spec.md §2 component 5).
//!
//! Grounded on `original_source/src/one_way_mmap_heap.h` and
//! `original_source/src/mmap_heap.h`.
use std::collections::HashMap;
use std::sync::Mutex;

use crate::os;

/// Allocates address space through `mmap` and never unmaps it. Backs
/// `CheapHeap`'s metadata arena.
pub struct OneWayMmapHeap;

impl OneWayMmapHeap {
    pub fn new() -> Self {
        OneWayMmapHeap
    }

    pub fn malloc(&self, sz: usize) -> *mut u8 {
        if sz == 0 {
            return std::ptr::null_mut();
        }
        let rounded = os::align_up(sz, os::page_size());
        match os::mmap_anon(rounded, libc::PROT_READ | libc::PROT_WRITE) {
            Ok(ptr) => ptr,
            Err(e) => {
                log::error!("OneWayMmapHeap::malloc failed: {}", e);
                std::process::abort();
            }
        }
    }
}

impl Default for OneWayMmapHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Extends `OneWayMmapHeap` by tracking allocation sizes so it can
/// `munmap` on free — used for the large-alloc path (objects bigger than
/// `kMaxSize`, each living in its own mini-heap with `maxCount == 1`).
pub struct MmapHeap {
    inner: OneWayMmapHeap,
    vma_map: Mutex<HashMap<usize, usize>>,
}

impl MmapHeap {
    pub fn new() -> Self {
        MmapHeap { inner: OneWayMmapHeap::new(), vma_map: Mutex::new(HashMap::new()) }
    }

    pub fn malloc(&self, sz: usize) -> *mut u8 {
        let ptr = self.inner.malloc(sz);
        if !ptr.is_null() {
            let rounded = os::align_up(sz, os::page_size());
            self.vma_map.lock().unwrap().insert(ptr as usize, rounded);
        }
        ptr
    }

    pub fn get_size(&self, ptr: *mut u8) -> usize {
        *self.vma_map.lock().unwrap().get(&(ptr as usize)).unwrap_or(&0)
    }

    pub fn in_bounds(&self, ptr: *mut u8) -> bool {
        self.vma_map.lock().unwrap().contains_key(&(ptr as usize))
    }

    pub fn free(&self, ptr: *mut u8) {
        let sz = self.vma_map.lock().unwrap().remove(&(ptr as usize));
        match sz {
            Some(sz) => os::munmap(ptr, sz),
            None => log::debug!("mmap: invalid free, possibly from memalign: {:p}", ptr),
        }
    }

    pub fn arena_size(&self) -> usize {
        self.vma_map.lock().unwrap().values().sum()
    }
}

impl Default for MmapHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_and_frees_allocations() {
        let heap = MmapHeap::new();
        let ptr = heap.malloc(10_000);
        assert!(!ptr.is_null());
        assert!(heap.get_size(ptr) >= 10_000);
        assert!(heap.in_bounds(ptr));
        heap.free(ptr);
        assert!(!heap.in_bounds(ptr));
    }
}
