//! Immutable byte-size ⇄ class-index table (spec.md §2 component 3).
//!
//! Grounded on `original_source/src/common.h`'s tcmalloc-derived `SizeMap`
//! and `original_source/src/size_class_reciprocals.h`'s float-reciprocal
//! table (both list the same 25-entry size sequence, with class 0 and
//! class 1 both mapping to 16 bytes — class 0 is effectively reserved,
//! matching the reference's convention that a zero-byte request is
//! rounded up to `ByteSizeForClass(1)`). The reference computes the class
//! index via two precomputed stride arrays (linear below 1024 bytes,
//! 128-byte-stride above); this crate uses a binary search over the same
//! 25-entry table, which gives the identical mapping with far less code —
//! at only 25 entries the asymptotic difference is immaterial.
pub const NUM_BINS: usize = 25;

pub const CLASS_SIZES: [usize; NUM_BINS] = [
    16, 16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640, 768, 896, 1024, 2048, 4096,
    8192, 16384,
];

pub const RECIPROCALS: [f32; NUM_BINS] = [
    1.0 / 16.0,
    1.0 / 16.0,
    1.0 / 32.0,
    1.0 / 48.0,
    1.0 / 64.0,
    1.0 / 80.0,
    1.0 / 96.0,
    1.0 / 112.0,
    1.0 / 128.0,
    1.0 / 160.0,
    1.0 / 192.0,
    1.0 / 224.0,
    1.0 / 256.0,
    1.0 / 320.0,
    1.0 / 384.0,
    1.0 / 448.0,
    1.0 / 512.0,
    1.0 / 640.0,
    1.0 / 768.0,
    1.0 / 896.0,
    1.0 / 1024.0,
    1.0 / 2048.0,
    1.0 / 4096.0,
    1.0 / 8192.0,
    1.0 / 16384.0,
];

pub const MAX_SIZE: usize = CLASS_SIZES[NUM_BINS - 1];

/// Returns the smallest class index (skipping the reserved class 0) whose
/// byte size is `>= sz`, or `None` if `sz` exceeds `MAX_SIZE` (a large
/// allocation, handled by `GlobalHeap::malloc` directly).
pub fn get_size_class(sz: usize) -> Option<usize> {
    if sz == 0 {
        return Some(1);
    }
    if sz > MAX_SIZE {
        return None;
    }
    let idx = CLASS_SIZES[1..].partition_point(|&s| s < sz) + 1;
    Some(idx)
}

pub fn byte_size_for_class(class: usize) -> usize {
    CLASS_SIZES[class]
}

pub fn reciprocal_for_class(class: usize) -> f32 {
    RECIPROCALS[class]
}

/// `floor(byte_offset * reciprocal[class])` — the reference's
/// reciprocal-multiplication slot math (see SPEC_FULL.md "Supplemented
/// features"), used on the free-path instead of integer division.
pub fn compute_index(byte_offset: usize, class: usize) -> usize {
    (byte_offset as f32 * RECIPROCALS[class]) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_covers_every_size_up_to_max() {
        for sz in 0..=MAX_SIZE {
            let class = get_size_class(sz).expect("must be representable");
            assert!(byte_size_for_class(class) >= sz, "class {} size {} < sz {}", class, byte_size_for_class(class), sz);
        }
    }

    #[test]
    fn above_max_size_is_large_alloc() {
        assert_eq!(get_size_class(MAX_SIZE + 1), None);
    }

    #[test]
    fn zero_byte_request_maps_to_class_one() {
        assert_eq!(get_size_class(0), Some(1));
        assert_eq!(byte_size_for_class(1), 16);
    }

    #[test]
    fn compute_index_matches_division() {
        let class = get_size_class(64).unwrap();
        let sz = byte_size_for_class(class);
        for slot in 0..10usize {
            let offset = slot * sz;
            assert_eq!(compute_index(offset, class), slot);
        }
    }
}
