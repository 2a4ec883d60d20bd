//! Small shared helpers that don't belong to any one component.
//!
//! Grounded on `original_source/src/internal.h`'s `internal::` namespace
//! (the reference's `seed()`/`mwcShuffle` free functions live here; this
//! crate's equivalents are methods on `rng::Mwc` instead, so only the OS
//! entropy source and the thread-id helper remain).
use std::sync::atomic::{AtomicU32, Ordering};

/// One 64-bit word of OS entropy, used to seed a fresh `Mwc` (reference's
/// `internal::seed()`, which reads `/dev/urandom` via a raw `read`).
pub fn os_entropy_u64() -> u64 {
    let mut buf = [0u8; 8];
    if unsafe { libc::getentropy(buf.as_mut_ptr() as *mut libc::c_void, buf.len()) } == 0 {
        return u64::from_ne_bytes(buf);
    }
    // getentropy is unavailable (old kernel/libc); fall back to reading
    // /dev/urandom directly rather than failing seed generation.
    use std::io::Read;
    if let Ok(mut f) = std::fs::File::open("/dev/urandom") {
        if f.read_exact(&mut buf).is_ok() {
            return u64::from_ne_bytes(buf);
        }
    }
    // Last resort: mix the address of a stack local with the current
    // time, which is still unpredictable enough to avoid every thread
    // starting with an identical shuffle order.
    let stack_addr = &buf as *const _ as u64;
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    stack_addr ^ nanos.rotate_left(17)
}

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

/// Dense, process-wide thread identifier (distinct from the OS tid) used
/// to stamp `MiniHeap::current` — small enough to fit the ownership
/// check on the free fast path as a plain integer compare.
pub fn next_thread_id() -> u32 {
    NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_are_distinct_and_nonzero() {
        let a = next_thread_id();
        let b = next_thread_id();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }

    #[test]
    fn os_entropy_is_not_trivially_constant() {
        let a = os_entropy_u64();
        let b = os_entropy_u64();
        assert_ne!(a, b, "two consecutive draws collided — entropy source is broken");
    }
}
