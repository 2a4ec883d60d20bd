//! Per-span metadata: occupancy bitmap, freelist state machine, mesh
//! chain (spec.md §2 component 7, §3, §4.2).
//!
//! Grounded on `original_source/src/mini_heap.h`. `MiniHeapID` mirrors the
//! reference's dense 32-bit index into the metadata `CheapHeap` rather
//! than a raw pointer, exactly per spec.md §9 and §3: ids are stable
//! across fork and CAS cleanly inside the 32-bit arena-index array and the
//! mesh/freelist links.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::bitmap::AtomicBitmap;
use crate::cheap_heap::CheapHeap;
use crate::size_classes;

pub type MiniHeapPool = CheapHeap<MiniHeap>;

/// Dense index into the `MiniHeap` metadata pool. `0` is the null
/// sentinel; `u32::MAX` is the intrusive-list head sentinel (spec.md §3).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct MiniHeapId(pub u32);

impl MiniHeapId {
    pub const NULL: MiniHeapId = MiniHeapId(0);
    pub const HEAD: MiniHeapId = MiniHeapId(u32::MAX);

    pub fn has_value(self) -> bool {
        self != MiniHeapId::NULL
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Span {
    pub offset: u32,
    pub length: u32,
}

impl Span {
    pub fn byte_length(&self, page_size: usize) -> usize {
        self.length as usize * page_size
    }
}

/// Packed flags word: `sizeClass(6) | freelistId(2) | svOffset(8) |
/// maxCount(11) | pending(1) | meshed(1)` — spec.md §3.
const SIZE_CLASS_BITS: u32 = 6;
const FREELIST_ID_SHIFT: u32 = SIZE_CLASS_BITS;
const FREELIST_ID_BITS: u32 = 2;
const SV_OFFSET_SHIFT: u32 = FREELIST_ID_SHIFT + FREELIST_ID_BITS;
const SV_OFFSET_BITS: u32 = 8;
const MAX_COUNT_SHIFT: u32 = SV_OFFSET_SHIFT + SV_OFFSET_BITS;
const MAX_COUNT_BITS: u32 = 11;
const PENDING_SHIFT: u32 = MAX_COUNT_SHIFT + MAX_COUNT_BITS;
const MESHED_SHIFT: u32 = PENDING_SHIFT + 1;

fn mask(bits: u32) -> u32 {
    (1u32 << bits) - 1
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum FreelistId {
    Empty = 0,
    Partial = 1,
    Full = 2,
    Attached = 3,
}

impl FreelistId {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => FreelistId::Empty,
            1 => FreelistId::Partial,
            2 => FreelistId::Full,
            _ => FreelistId::Attached,
        }
    }
}

#[derive(Clone, Copy)]
struct FlagsSnapshot(u32);

impl FlagsSnapshot {
    fn size_class(self) -> usize {
        (self.0 & mask(SIZE_CLASS_BITS)) as usize
    }
    fn freelist_id(self) -> FreelistId {
        FreelistId::from_u32((self.0 >> FREELIST_ID_SHIFT) & mask(FREELIST_ID_BITS))
    }
    fn sv_offset(self) -> u8 {
        ((self.0 >> SV_OFFSET_SHIFT) & mask(SV_OFFSET_BITS)) as u8
    }
    fn max_count(self) -> u32 {
        (self.0 >> MAX_COUNT_SHIFT) & mask(MAX_COUNT_BITS)
    }
    fn pending(self) -> bool {
        (self.0 >> PENDING_SHIFT) & 1 != 0
    }
    fn meshed(self) -> bool {
        (self.0 >> MESHED_SHIFT) & 1 != 0
    }
}

fn pack(size_class: usize, freelist_id: FreelistId, sv_offset: u8, max_count: u32, pending: bool, meshed: bool) -> u32 {
    (size_class as u32 & mask(SIZE_CLASS_BITS))
        | ((freelist_id as u32) << FREELIST_ID_SHIFT)
        | ((sv_offset as u32) << SV_OFFSET_SHIFT)
        | ((max_count & mask(MAX_COUNT_BITS)) << MAX_COUNT_SHIFT)
        | ((pending as u32) << PENDING_SHIFT)
        | ((meshed as u32) << MESHED_SHIFT)
}

/// `(bin, offset)` token the striped tracker stamps on a mini-heap so it
/// can remove it from its current bin in O(1) (`striped_tracker.h`).
pub mod bin_token {
    pub const FLAG_FULL: u32 = u32::MAX;
    pub const FLAG_EMPTY: u32 = u32::MAX - 1;
    pub const FLAG_NO_OFF: u32 = u32::MAX;
}

#[derive(Clone, Copy)]
pub struct BinToken {
    pub bin: u32,
    pub off: u32,
}

impl BinToken {
    pub fn full() -> Self {
        BinToken { bin: bin_token::FLAG_FULL, off: bin_token::FLAG_NO_OFF }
    }
    fn pack(self) -> u64 {
        (self.bin as u64) << 32 | self.off as u64
    }
    fn unpack(v: u64) -> Self {
        BinToken { bin: (v >> 32) as u32, off: v as u32 }
    }
}

pub struct MiniHeap {
    pub span: Span,
    freelist_prev: AtomicU32,
    freelist_next: AtomicU32,
    current: AtomicU32,
    flags: AtomicU32,
    next_meshed: AtomicU32,
    pending_next: AtomicU32,
    bin_token: AtomicU64,
    pub bitmap: AtomicBitmap,
}

impl MiniHeap {
    pub fn new(span: Span, size_class: usize, max_count: u32) -> Self {
        MiniHeap {
            span,
            freelist_prev: AtomicU32::new(MiniHeapId::NULL.0),
            freelist_next: AtomicU32::new(MiniHeapId::NULL.0),
            current: AtomicU32::new(0),
            flags: AtomicU32::new(pack(size_class, FreelistId::Attached, 0, max_count, false, false)),
            next_meshed: AtomicU32::new(MiniHeapId::NULL.0),
            pending_next: AtomicU32::new(MiniHeapId::NULL.0),
            bin_token: AtomicU64::new(BinToken::full().pack()),
            bitmap: AtomicBitmap::new(max_count as usize),
        }
    }

    fn flags(&self) -> FlagsSnapshot {
        FlagsSnapshot(self.flags.load(Ordering::Acquire))
    }

    pub fn size_class(&self) -> usize {
        self.flags().size_class()
    }

    pub fn max_count(&self) -> u32 {
        self.flags().max_count()
    }

    pub fn object_size(&self) -> usize {
        size_classes::byte_size_for_class(self.size_class())
    }

    pub fn sv_offset(&self) -> u8 {
        self.flags().sv_offset()
    }

    pub fn set_sv_offset(&self, off: u8) {
        self.update_flags(|f| {
            pack(f.size_class(), f.freelist_id(), off, f.max_count(), f.pending(), f.meshed())
        });
    }

    pub fn freelist_id(&self) -> FreelistId {
        self.flags().freelist_id()
    }

    pub fn set_freelist_id(&self, id: FreelistId) {
        self.update_flags(|f| pack(f.size_class(), id, f.sv_offset(), f.max_count(), f.pending(), f.meshed()));
    }

    pub fn is_attached(&self) -> bool {
        self.current.load(Ordering::Acquire) != 0
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    pub fn set_attached(&self, tid: u32) {
        self.current.store(tid, Ordering::Release);
        self.set_freelist_id(FreelistId::Attached);
    }

    pub fn detach(&self) {
        self.current.store(0, Ordering::Release);
    }

    pub fn is_meshed(&self) -> bool {
        self.flags().meshed()
    }

    pub fn is_pending(&self) -> bool {
        self.flags().pending()
    }

    pub fn is_full(&self) -> bool {
        self.in_use_count() as u32 == self.max_count()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use_count() == 0
    }

    pub fn is_large_alloc(&self) -> bool {
        self.max_count() == 1
    }

    pub fn is_meshing_candidate(&self) -> bool {
        !self.is_large_alloc() && !self.is_meshed() && !self.is_attached()
    }

    pub fn fullness(&self) -> f64 {
        self.in_use_count() as f64 / self.max_count() as f64
    }

    pub fn in_use_count(&self) -> usize {
        self.bitmap.in_use_count()
    }

    fn update_flags(&self, f: impl Fn(FlagsSnapshot) -> u32) {
        let mut cur = self.flags.load(Ordering::Acquire);
        loop {
            let new = f(FlagsSnapshot(cur));
            match self.flags.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    /// CAS: stays `Full`, sets the pending bit. Used by the lock-free
    /// free path's Full → (Pending →) Partial transition (spec.md §4.5).
    pub fn try_set_pending_from_full(&self) -> bool {
        let mut cur = self.flags.load(Ordering::Acquire);
        loop {
            let snap = FlagsSnapshot(cur);
            if snap.freelist_id() != FreelistId::Full || snap.pending() {
                return false;
            }
            let new = pack(snap.size_class(), FreelistId::Full, snap.sv_offset(), snap.max_count(), true, snap.meshed());
            match self.flags.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn clear_pending(&self) {
        self.update_flags(|f| pack(f.size_class(), f.freelist_id(), f.sv_offset(), f.max_count(), false, f.meshed()));
    }

    fn set_meshed(&self) {
        self.update_flags(|f| pack(f.size_class(), f.freelist_id(), f.sv_offset(), f.max_count(), f.pending(), true));
    }

    pub fn get_bin_token(&self) -> BinToken {
        BinToken::unpack(self.bin_token.load(Ordering::Acquire))
    }

    pub fn set_bin_token(&self, tok: BinToken) {
        self.bin_token.store(tok.pack(), Ordering::Release);
    }

    pub fn pending_next(&self) -> MiniHeapId {
        MiniHeapId(self.pending_next.load(Ordering::Acquire))
    }

    pub fn set_pending_next(&self, id: MiniHeapId) {
        self.pending_next.store(id.0, Ordering::Release);
    }

    pub fn freelist_next(&self) -> MiniHeapId {
        MiniHeapId(self.freelist_next.load(Ordering::Acquire))
    }

    pub fn set_freelist_next(&self, id: MiniHeapId) {
        self.freelist_next.store(id.0, Ordering::Release);
    }

    pub fn freelist_prev(&self) -> MiniHeapId {
        MiniHeapId(self.freelist_prev.load(Ordering::Acquire))
    }

    pub fn set_freelist_prev(&self, id: MiniHeapId) {
        self.freelist_prev.store(id.0, Ordering::Release);
    }

    pub fn next_meshed(&self) -> MiniHeapId {
        MiniHeapId(self.next_meshed.load(Ordering::Acquire))
    }

    /// Virtual start address of *this* mini-heap's own span (not
    /// alias-chain-aware — see `span_start` for that).
    pub fn span_start(&self, arena_begin: usize, page_size: usize) -> usize {
        arena_begin + self.span.offset as usize * page_size
    }

    pub fn malloc_at(&self, arena_begin: usize, page_size: usize, slot: usize) -> *mut u8 {
        self.bitmap.try_to_set(slot);
        (self.span_start(arena_begin, page_size) + slot * self.object_size()) as *mut u8
    }

    fn slot_for(&self, arena_begin: usize, page_size: usize, ptr: *const u8) -> usize {
        let offset = ptr as usize - self.span_start(arena_begin, page_size);
        size_classes::compute_index(offset, self.size_class())
    }

    pub fn free(&self, arena_begin: usize, page_size: usize, ptr: *const u8) {
        let slot = self.slot_for(arena_begin, page_size, ptr);
        self.bitmap.unset(slot);
    }

    /// Variant that reports whether the bit was actually set (used to
    /// break the race with meshing — spec.md §4.2).
    pub fn clear_if_not_free(&self, arena_begin: usize, page_size: usize, ptr: *const u8) -> bool {
        let slot = self.slot_for(arena_begin, page_size, ptr);
        self.bitmap.unset(slot)
    }

    pub fn free_off(&self, slot: usize) {
        self.bitmap.unset(slot);
    }

    /// True iff `other` shares a mesh chain with `self` (same root after
    /// following `next_meshed`, checked by the caller via the pool).
    pub fn meshed_with(&self, pool: &MiniHeapPool, self_id: MiniHeapId, other_id: MiniHeapId) -> bool {
        let mut found = false;
        for_each_meshed(pool, self_id, |id| {
            if id == other_id {
                found = true;
                true
            } else {
                false
            }
        });
        found
    }

    pub fn mesh_count(&self, pool: &MiniHeapPool, self_id: MiniHeapId) -> usize {
        let mut count = 0usize;
        for_each_meshed(pool, self_id, |_| {
            count += 1;
            false
        });
        count
    }

    /// Survivor side of a mesh: absorb `src`'s live objects and splice
    /// it onto this mini-heap's chain (spec.md §4.2 `consume`).
    ///
    /// # Safety
    /// Caller must hold the epoch lock and have already called
    /// `beginMesh`/`mprotect(READ)` on every span in `src`'s chain.
    pub unsafe fn consume(
        &self,
        pool: &MiniHeapPool,
        self_id: MiniHeapId,
        src: &MiniHeap,
        src_id: MiniHeapId,
        arena_begin: usize,
        page_size: usize,
    ) {
        d_assert!(self.size_class() == src.size_class());
        d_assert!(self.max_count() == src.max_count());

        src.set_meshed();
        let drained = src.bitmap.set_and_exchange_all(true);

        let object_size = self.object_size();
        let dst_start = self.span_start(arena_begin, page_size);
        let src_start = src.span_start(arena_begin, page_size);

        for slot in drained.iter() {
            let from = (src_start + slot * object_size) as *const u8;
            let to = (dst_start + slot * object_size) as *mut u8;
            std::ptr::copy_nonoverlapping(from, to, object_size);
            self.bitmap.try_to_set(slot);
        }

        track_meshed_span(pool, self_id, src_id);
    }

    pub fn for_each_meshed(&self, pool: &MiniHeapPool, self_id: MiniHeapId, mut cb: impl FnMut(MiniHeapId) -> bool) {
        for_each_meshed(pool, self_id, |id| cb(id));
    }
}

fn for_each_meshed(pool: &MiniHeapPool, start: MiniHeapId, mut cb: impl FnMut(MiniHeapId) -> bool) {
    if cb(start) {
        return;
    }
    let mut cur = unsafe { &*pool.ptr(start.0) }.next_meshed();
    while cur.has_value() {
        if cb(cur) {
            return;
        }
        cur = unsafe { &*pool.ptr(cur.0) }.next_meshed();
    }
}

/// Walk to the chain tail starting at `dst_id` and splice `src_id` on.
fn track_meshed_span(pool: &MiniHeapPool, dst_id: MiniHeapId, src_id: MiniHeapId) {
    let mut cur_id = dst_id;
    loop {
        let cur = unsafe { &*pool.ptr(cur_id.0) };
        let next = cur.next_meshed();
        if !next.has_value() {
            cur.next_meshed.store(src_id.0, Ordering::Release);
            return;
        }
        cur_id = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(offset: u32, length: u32) -> Span {
        Span { offset, length }
    }

    #[test]
    fn flags_round_trip_through_cas_updates() {
        let mh = MiniHeap::new(span(0, 1), 8, 32);
        assert_eq!(mh.size_class(), 8);
        assert_eq!(mh.max_count(), 32);
        mh.set_sv_offset(5);
        assert_eq!(mh.sv_offset(), 5);
        assert_eq!(mh.size_class(), 8, "unrelated field must survive update");
    }

    #[test]
    fn large_alloc_is_never_a_meshing_candidate() {
        let mh = MiniHeap::new(span(0, 4), 0, 1);
        assert!(mh.is_large_alloc());
        assert!(!mh.is_meshing_candidate());
    }

    #[test]
    fn full_and_empty_track_bitmap_state() {
        let mh = MiniHeap::new(span(0, 1), 0, 4);
        assert!(mh.is_empty());
        for i in 0..4 {
            mh.bitmap.try_to_set(i);
        }
        assert!(mh.is_full());
    }

    #[test]
    fn pending_cas_only_succeeds_once_from_full() {
        let mh = MiniHeap::new(span(0, 1), 0, 4);
        mh.set_freelist_id(FreelistId::Full);
        assert!(mh.try_set_pending_from_full());
        assert!(!mh.try_set_pending_from_full());
        assert!(mh.is_pending());
    }

    #[test]
    fn mesh_chain_walks_in_link_order() {
        let pool: MiniHeapPool = CheapHeap::new(8);
        let a_id = MiniHeapId(pool.alloc());
        let b_id = MiniHeapId(pool.alloc());
        unsafe {
            std::ptr::write(pool.ptr(a_id.0), MiniHeap::new(span(0, 1), 0, 4));
            std::ptr::write(pool.ptr(b_id.0), MiniHeap::new(span(1, 1), 0, 4));
        }
        track_meshed_span(&pool, a_id, b_id);
        let mut seen = Vec::new();
        let a = unsafe { &*pool.ptr(a_id.0) };
        a.for_each_meshed(&pool, a_id, |id| {
            seen.push(id);
            false
        });
        assert_eq!(seen, vec![a_id, b_id]);
    }
}
