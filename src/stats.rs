//! Process-wide allocator counters.
//!
//! Grounded on the teacher's `stats.rs` (`_stat_increase`/`_stat_update`
//! pattern: atomic counters updated without a lock) and the reference's
//! `GlobalHeapStats` (`global_heap.h`).
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct GlobalHeapStats {
    pub mesh_count: AtomicUsize,
    pub mh_alloc_count: AtomicUsize,
    pub mh_free_count: AtomicUsize,
    pub mh_high_water_mark: AtomicUsize,
    bytes_allocated: AtomicUsize,
    bytes_freed: AtomicUsize,
}

impl GlobalHeapStats {
    /// Records one mini-heap (or large-object) allocation of `size`
    /// bytes; `size` of `0` is used for internal mini-heap bookkeeping
    /// that has no single associated object size.
    pub fn record_alloc(&self, size: usize) {
        let prev = self.mh_alloc_count.fetch_add(1, Ordering::Relaxed);
        let outstanding = (prev + 1).saturating_sub(self.mh_free_count.load(Ordering::Relaxed));
        self.bump_high_water_mark(outstanding);
        self.bytes_allocated.fetch_add(size, Ordering::Relaxed);
    }

    pub fn record_free(&self, size: usize) {
        self.mh_free_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_freed.fetch_add(size, Ordering::Relaxed);
    }

    pub fn record_mesh(&self, count: usize) {
        self.mesh_count.fetch_add(count, Ordering::Relaxed);
    }

    /// Bytes allocated minus bytes freed — `stats.allocated`/`stats.active`
    /// in `mallctl` (spec.md §6).
    pub fn outstanding(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed).saturating_sub(self.bytes_freed.load(Ordering::Relaxed))
    }

    /// Peak outstanding mini-heap count times the page size is used as a
    /// cheap stand-in for `stats.resident` (an exact PSS read requires
    /// parsing `/proc/self/smaps_rollup`, which this crate doesn't do).
    pub fn allocated_high_water(&self) -> usize {
        self.mh_high_water_mark.load(Ordering::Relaxed)
    }

    fn bump_high_water_mark(&self, candidate: usize) {
        let mut cur = self.mh_high_water_mark.load(Ordering::Relaxed);
        while candidate > cur {
            match self.mh_high_water_mark.compare_exchange_weak(
                cur,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn dump(&self, page_size: usize) {
        let mesh_count = self.mesh_count.load(Ordering::Relaxed);
        log::debug!("MESH COUNT:         {}", mesh_count);
        log::debug!(
            "Meshed MB (total):  {:.1}",
            mesh_count as f64 * page_size as f64 / 1024.0 / 1024.0
        );
        log::debug!("MH Alloc Count:     {}", self.mh_alloc_count.load(Ordering::Relaxed));
        log::debug!("MH Free  Count:     {}", self.mh_free_count.load(Ordering::Relaxed));
        log::debug!(
            "MH High Water Mark: {}",
            self.mh_high_water_mark.load(Ordering::Relaxed)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_mark_tracks_peak_outstanding() {
        let stats = GlobalHeapStats::default();
        stats.record_alloc(0);
        stats.record_alloc(0);
        stats.record_alloc(0);
        stats.record_free(0);
        stats.record_free(0);
        assert_eq!(stats.mh_high_water_mark.load(Ordering::Relaxed), 3);
    }
}
