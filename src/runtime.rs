//! Process-wide entry point: owns the `GlobalHeap` singleton, the
//! background scavenge/mesh thread, and the fault-gated quiescence
//! mechanism meshing depends on (spec.md §2 component 10, §5).
//!
//! Grounded on `original_source/src/runtime.h`/`runtime_impl.h` (the
//! `runtime()` singleton accessor, `startBgThread`, `installSegfaultHandler`)
//! and the teacher's `init.rs` (the process/thread lifecycle shape this
//! crate no longer needs as a separate file once folded in here). The
//! background scavenger uses `std::sync::mpsc` for its shutdown signal
//! instead of the reference's hand-rolled lock-free ring buffer of
//! `FreeCmd*` — the ring buffer exists there to cross a signal-handler
//! boundary safely; this crate's signal handler never touches the
//! background thread directly, so a channel is sufficient and far
//! simpler (see DESIGN.md).
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::MeshError;
use crate::global_heap::GlobalHeap;
use crate::options;

static ARENA_BEGIN: AtomicUsize = AtomicUsize::new(0);
static ARENA_END: AtomicUsize = AtomicUsize::new(0);
static EPOCH_PTR: AtomicUsize = AtomicUsize::new(0);

/// Installed once, before any thread can fault inside the arena. Spins
/// until the racing mesh's epoch goes even (i.e. `finalizeMesh` has
/// completed its remap) and then returns, letting the kernel retry the
/// faulting instruction against the now-writable mapping.
///
/// Signal-safety: touches only relaxed atomics, no locks, no allocation.
extern "C" fn segfault_handler(_sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let fault_addr = unsafe { (*info).si_addr() as usize };
    let begin = ARENA_BEGIN.load(Ordering::Relaxed);
    let end = ARENA_END.load(Ordering::Relaxed);
    if fault_addr < begin || fault_addr >= end {
        reraise_default(_sig);
        return;
    }
    let epoch_ptr = EPOCH_PTR.load(Ordering::Relaxed) as *const std::sync::atomic::AtomicU64;
    if epoch_ptr.is_null() {
        reraise_default(_sig);
        return;
    }
    let epoch = unsafe { &*epoch_ptr };
    for _ in 0..1_000_000 {
        if epoch.load(Ordering::Acquire) % 2 == 0 {
            return;
        }
        std::hint::spin_loop();
    }
    reraise_default(_sig);
}

fn reraise_default(sig: libc::c_int) {
    unsafe {
        let mut default: libc::sigaction = std::mem::zeroed();
        default.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(sig, &default, std::ptr::null_mut());
        libc::raise(sig);
    }
}

fn install_segfault_handler(arena_begin: usize, arena_len: usize, epoch: &std::sync::atomic::AtomicU64) {
    ARENA_BEGIN.store(arena_begin, Ordering::Relaxed);
    ARENA_END.store(arena_begin + arena_len, Ordering::Relaxed);
    EPOCH_PTR.store(epoch as *const _ as usize, Ordering::Relaxed);
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_flags = libc::SA_SIGINFO;
        action.sa_sigaction = segfault_handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut());
    }
}

/// Process-wide singleton: the heap plus its background maintenance
/// thread (reference's `runtime()` free function).
pub struct Runtime {
    heap: GlobalHeap,
    big_lock: Mutex<()>,
    bg_shutdown: Mutex<Option<mpsc::Sender<()>>>,
    bg_handle: Mutex<Option<JoinHandle<()>>>,
    bg_running: AtomicBool,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

impl Runtime {
    fn new() -> Result<Self, MeshError> {
        Ok(Runtime {
            heap: GlobalHeap::new()?,
            big_lock: Mutex::new(()),
            bg_shutdown: Mutex::new(None),
            bg_handle: Mutex::new(None),
            bg_running: AtomicBool::new(false),
        })
    }

    pub fn heap(&self) -> &GlobalHeap {
        &self.heap
    }

    /// Takes the big lock that serializes calls into `GlobalHeap` from
    /// `malloc`/`free`'s slow paths and the background thread alike.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.big_lock.lock().unwrap()
    }

    /// Spawns the periodic scavenge/mesh thread. Idempotent — a second
    /// call is a no-op (reference's `startBgThread` guards the same way
    /// via `_freeThreadRunning`).
    pub fn start_bg_thread(&'static self) {
        if self.bg_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let (tx, rx) = mpsc::channel::<()>();
        *self.bg_shutdown.lock().unwrap() = Some(tx);
        let period = Duration::from_millis(options::get().mesh_period_ms);
        let handle = std::thread::Builder::new()
            .name("mesh-bg".into())
            .spawn(move || loop {
                match rx.recv_timeout(period) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        let _guard = self.lock();
                        self.heap().maybe_mesh();
                    }
                }
            })
            .expect("failed to spawn mesh background thread");
        *self.bg_handle.lock().unwrap() = Some(handle);
    }

    pub fn stop_bg_thread(&self) {
        if let Some(tx) = self.bg_shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.bg_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.bg_running.store(false, Ordering::Release);
    }

    /// Registers the `SIGDUMP` occupancy-dump signal via `signal-hook`'s
    /// flag API — this one is a plain async notification, not a
    /// synchronous fault, so the high-level crate API is the right tool
    /// (unlike the SIGSEGV/SIGBUS path above).
    pub fn install_dump_handler(&'static self) {
        use std::sync::Arc;
        let flag = Arc::new(AtomicBool::new(false));
        const SIGDUMP: libc::c_int = libc::SIGUSR2;
        if signal_hook::flag::register(SIGDUMP, flag.clone()).is_err() {
            log::warn!("failed to install SIGDUMP handler");
            return;
        }
        std::thread::Builder::new()
            .name("mesh-dump".into())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_millis(200));
                if flag.swap(false, Ordering::AcqRel) {
                    self.heap().dump_stats();
                }
            })
            .expect("failed to spawn dump-signal watcher thread");
    }

    /// `pthread_atfork` triple: take the big lock before `fork()` so the
    /// child never inherits it mid-mutation, then release it in whichever
    /// of `parent`/`child` runs next (spec.md §5 — fork consistency). The
    /// held guard is stashed in a thread-local because `prepare` and its
    /// matching `parent`/`child` callback always run on the forking
    /// thread.
    fn install_fork_hooks(&'static self) {
        extern "C" fn prepare() {
            if let Some(rt) = RUNTIME.get() {
                FORK_GUARD.with(|cell| *cell.borrow_mut() = Some(rt.big_lock.lock().unwrap()));
            }
        }
        extern "C" fn parent() {
            FORK_GUARD.with(|cell| cell.borrow_mut().take());
        }
        extern "C" fn child() {
            // The arena is `MAP_SHARED` over a `memfd`, which `fork()`
            // duplicates rather than copies — left alone, the child and
            // parent alias the same physical pages and a write on either
            // side corrupts the other's heap (spec.md §4.10, §5 scenario 5
            // "fork consistency"). Rebuild onto a private backing file
            // before anything else in the child touches the allocator.
            if let Some(rt) = RUNTIME.get() {
                if let Err(e) = rt.heap().arena().rebuild_after_fork() {
                    log::error!("fork: failed to rebuild arena in child: {}", e);
                }
                rt.bg_running.store(false, Ordering::Release);
            }
            FORK_GUARD.with(|cell| cell.borrow_mut().take());
        }
        unsafe {
            libc::pthread_atfork(Some(prepare), Some(parent), Some(child));
        }
    }
}

thread_local! {
    static FORK_GUARD: std::cell::RefCell<Option<std::sync::MutexGuard<'static, ()>>> = std::cell::RefCell::new(None);
}

/// Returns the process-wide runtime, constructing it (and installing the
/// segfault handler and fork hooks) on first access.
pub fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| Runtime::new().expect("failed to initialize mesh runtime"))
}

/// Finishes one-time setup that needs a `'static` reference to the
/// already-constructed singleton: the segfault handler, fork hooks, and
/// background thread. Idempotent and safe to call from every allocating
/// thread's first allocation (`lib.rs`'s lazy `ThreadLocalHeap` init).
pub fn ensure_started() {
    static STARTED: OnceLock<()> = OnceLock::new();
    STARTED.get_or_init(|| {
        let rt = runtime();
        install_segfault_handler(rt.heap().arena_begin(), options::get().arena_size, rt.heap().epoch().inner());
        rt.install_fork_hooks();
        rt.start_bg_thread();
        rt.install_dump_handler();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_singleton_is_stable_across_calls() {
        let a = runtime() as *const Runtime;
        let b = runtime() as *const Runtime;
        assert_eq!(a, b);
    }
}
