//! Assertion and error plumbing shared by every module.
//!
//! The core never propagates exceptions and never returns null from the
//! hot allocation path (spec.md §7): unrecoverable conditions abort, and
//! misuse (invalid free, double free) is logged and ignored. `MeshError`
//! exists only for the small set of non-hot-path fallible operations
//! (opening the arena backing file, parsing tunables).
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum MeshError {
    BackingFile(io::Error),
    Mmap(errno::Errno),
    Mprotect(errno::Errno),
    Arena(String),
    Config(String),
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshError::BackingFile(e) => write!(f, "could not create arena backing file: {}", e),
            MeshError::Mmap(e) => write!(f, "mmap failed: {}", e),
            MeshError::Mprotect(e) => write!(f, "mprotect failed: {}", e),
            MeshError::Arena(s) => write!(f, "arena error: {}", s),
            MeshError::Config(s) => write!(f, "config error: {}", s),
        }
    }
}

impl std::error::Error for MeshError {}

/// Active only in debug builds; logs and aborts. Mirrors the reference's
/// `d_assert`.
#[macro_export]
macro_rules! d_assert {
    ($cond:expr) => {
        if cfg!(debug_assertions) && !($cond) {
            log::error!("assertion failed: {} at {}:{}", stringify!($cond), file!(), line!());
            std::process::abort();
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(debug_assertions) && !($cond) {
            log::error!("assertion failed: {} ({}) at {}:{}", stringify!($cond), format_args!($($arg)+), file!(), line!());
            std::process::abort();
        }
    };
}

/// Active unconditionally; used for conditions that indicate corruption
/// regardless of build profile. Mirrors the reference's `hard_assert`.
#[macro_export]
macro_rules! hard_assert {
    ($cond:expr) => {
        if !($cond) {
            log::error!("hard assertion failed: {} at {}:{}", stringify!($cond), file!(), line!());
            std::process::abort();
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            log::error!("hard assertion failed: {} ({}) at {}:{}", stringify!($cond), format_args!($($arg)+), file!(), line!());
            std::process::abort();
        }
    };
}
