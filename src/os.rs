//! POSIX memory-mapping primitives: mmap/mprotect/madvise/hole-punch.
//!
//! Grounded on the teacher's `os.rs` (unix branch — it already called
//! straight into libc despite the crate's `#![no_std]` declaration) and
//! `original_source/src/meshable_arena.h`'s `freePhys`/`beginMesh`/
//! `finalizeMesh`, which is the production code that actually needs these
//! wrappers. Only the POSIX paths survive the transform (spec.md §1 scopes
//! the core to POSIX primitives; `winapi` is dropped, see DESIGN.md).
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::OnceLock;

use crate::error::MeshError;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| unsafe {
        let sz = libc::sysconf(libc::_SC_PAGESIZE);
        if sz <= 0 {
            4096
        } else {
            sz as usize
        }
    })
}

pub fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

fn errno_now() -> errno::Errno {
    errno::errno()
}

/// Anonymous mapping, `MAP_PRIVATE|MAP_ANONYMOUS` (used by `OneWayMmapHeap`
/// for internal metadata and scratch arrays).
pub fn mmap_anon(len: usize, prot: i32) -> Result<*mut u8, MeshError> {
    mmap_raw(ptr::null_mut(), len, prot, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, -1, 0)
}

/// Shared file-backed mapping at a fixed address — the primitive behind
/// both the arena's initial creation and meshing's `finalizeMesh` remap.
pub fn mmap_fixed_shared(addr: *mut u8, len: usize, prot: i32, fd: RawFd, offset: i64) -> Result<*mut u8, MeshError> {
    mmap_raw(addr, len, prot, libc::MAP_SHARED | libc::MAP_FIXED, fd, offset)
}

/// Shared file-backed mapping at an address chosen by the kernel (used
/// once, for the arena's initial reservation).
pub fn mmap_shared(len: usize, prot: i32, fd: RawFd) -> Result<*mut u8, MeshError> {
    mmap_raw(ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0)
}

fn mmap_raw(addr: *mut u8, len: usize, prot: i32, flags: i32, fd: RawFd, offset: i64) -> Result<*mut u8, MeshError> {
    let ptr = unsafe { libc::mmap(addr as *mut libc::c_void, len, prot, flags, fd, offset as libc::off_t) };
    if ptr == libc::MAP_FAILED {
        return Err(MeshError::Mmap(errno_now()));
    }
    Ok(ptr as *mut u8)
}

pub fn munmap(addr: *mut u8, len: usize) {
    unsafe {
        libc::munmap(addr as *mut libc::c_void, len);
    }
}

/// `mprotect(addr, len, PROT_READ)` — marks a span read-only during
/// `beginMesh` so late writers fault and are gated by the runtime's
/// segfault handler (spec.md §4.3/§5).
pub fn protect_read_only(addr: *mut u8, len: usize) -> Result<(), MeshError> {
    mprotect(addr, len, libc::PROT_READ)
}

pub fn protect_read_write(addr: *mut u8, len: usize) -> Result<(), MeshError> {
    mprotect(addr, len, libc::PROT_READ | libc::PROT_WRITE)
}

fn mprotect(addr: *mut u8, len: usize, prot: i32) -> Result<(), MeshError> {
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) };
    if rc != 0 {
        return Err(MeshError::Mprotect(errno_now()));
    }
    Ok(())
}

pub fn madvise_dontneed(addr: *mut u8, len: usize) {
    unsafe {
        libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED);
    }
}

pub fn madvise_free(addr: *mut u8, len: usize) {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::madvise(addr as *mut libc::c_void, len, libc::MADV_FREE);
    }
    #[cfg(not(target_os = "linux"))]
    madvise_dontneed(addr, len);
}

/// Platform hole-punch: returns physical pages backing `[offset, offset+len)`
/// of `fd` to the kernel without changing the file's mapping or length
/// (spec.md §4.3 `freePhys`).
#[cfg(target_os = "linux")]
pub fn punch_hole(fd: RawFd, offset: i64, len: i64) -> Result<(), MeshError> {
    let rc = unsafe {
        libc::fallocate(
            fd,
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset,
            len,
        )
    };
    if rc != 0 {
        return Err(MeshError::Arena(format!("fallocate(PUNCH_HOLE) failed: {}", errno_now())));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
pub fn punch_hole(fd: RawFd, offset: i64, len: i64) -> Result<(), MeshError> {
    #[repr(C)]
    struct FPunchhole {
        fp_flags: u32,
        reserved: u32,
        fp_offset: libc::off_t,
        fp_length: libc::off_t,
    }
    const F_PUNCHHOLE: i32 = 99;
    let arg = FPunchhole { fp_flags: 0, reserved: 0, fp_offset: offset as libc::off_t, fp_length: len as libc::off_t };
    let rc = unsafe { libc::fcntl(fd, F_PUNCHHOLE, &arg) };
    if rc != 0 {
        return Err(MeshError::Arena(format!("fcntl(F_PUNCHHOLE) failed: {}", errno_now())));
    }
    Ok(())
}

#[cfg(target_os = "freebsd")]
pub fn punch_hole(fd: RawFd, offset: i64, len: i64) -> Result<(), MeshError> {
    // fspacectl(2): SPACECTL_DEALLOC
    #[repr(C)]
    struct SpacectlRange {
        r_offset: libc::off_t,
        r_len: libc::off_t,
    }
    const SPACECTL_DEALLOC: i32 = 1;
    let mut range = SpacectlRange { r_offset: offset as libc::off_t, r_len: len as libc::off_t };
    let rc = unsafe {
        libc::syscall(
            libc::SYS_fspacectl,
            fd,
            SPACECTL_DEALLOC,
            &mut range as *mut SpacectlRange,
            0,
            &mut range as *mut SpacectlRange,
        )
    };
    if rc != 0 {
        return Err(MeshError::Arena(format!("fspacectl failed: {}", errno_now())));
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
pub fn punch_hole(_fd: RawFd, _offset: i64, _len: i64) -> Result<(), MeshError> {
    Err(MeshError::Arena("hole-punching not supported on this platform".into()))
}

/// `memfd_create("mesh_arena")`, falling back to an unlinked tempfile under
/// `/dev/shm` or `/tmp` on platforms without `memfd_create` (spec.md §3).
pub fn create_backing_file(size: usize) -> Result<RawFd, MeshError> {
    #[cfg(target_os = "linux")]
    {
        let name = std::ffi::CString::new("mesh_arena").unwrap();
        let fd = unsafe { libc::syscall(libc::SYS_memfd_create, name.as_ptr(), 0) };
        if fd >= 0 {
            let fd = fd as RawFd;
            truncate_and_return(fd, size)?;
            return Ok(fd);
        }
        log::debug!("memfd_create failed ({}), falling back to unlinked tempfile", errno_now());
    }
    create_unlinked_tempfile(size)
}

fn create_unlinked_tempfile(size: usize) -> Result<RawFd, MeshError> {
    for dir in ["/dev/shm", "/tmp"] {
        let template = format!("{}/mesh_arena.XXXXXX\0", dir);
        let mut bytes = template.into_bytes();
        let fd = unsafe { libc::mkstemp(bytes.as_mut_ptr() as *mut libc::c_char) };
        if fd >= 0 {
            unsafe {
                libc::unlink(bytes.as_ptr() as *const libc::c_char);
            }
            truncate_and_return(fd, size)?;
            return Ok(fd);
        }
    }
    Err(MeshError::BackingFile(io::Error::last_os_error()))
}

/// Writes all of `buf` to `fd` at `offset`, looping over short writes
/// (used by `MeshableArena::rebuild_after_fork` to seed a fresh backing
/// file with the pages the old one already held).
pub fn pwrite_all(fd: RawFd, mut buf: &[u8], mut offset: i64) -> Result<(), MeshError> {
    while !buf.is_empty() {
        let n = unsafe { libc::pwrite(fd, buf.as_ptr() as *const libc::c_void, buf.len(), offset as libc::off_t) };
        if n < 0 {
            return Err(MeshError::Arena(format!("pwrite failed: {}", errno_now())));
        }
        if n == 0 {
            break;
        }
        buf = &buf[n as usize..];
        offset += n as i64;
    }
    Ok(())
}

fn truncate_and_return(fd: RawFd, size: usize) -> Result<(), MeshError> {
    let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    if rc != 0 {
        let err = errno_now();
        unsafe {
            libc::close(fd);
        }
        return Err(MeshError::Arena(format!("ftruncate failed: {}", err)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers_round_correctly() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4097, 4096), 4096);
    }

    #[test]
    fn page_size_is_positive_power_of_two() {
        let sz = page_size();
        assert!(sz > 0);
        assert_eq!(sz & (sz - 1), 0);
    }
}
