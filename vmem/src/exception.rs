// Process-wide and per-image exception handling.
//
// On Linux the per-image handler is a no-op (there is no function-table
// unwind registration the way there is on Windows); only the
// process-wide SIGSEGV handler matters, and it is installed once for
// the whole process.
//
// Austin Shafer - 2024
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use utils::log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    Unknown,
    AccessViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessViolationType {
    Unknown,
    Read,
    Write,
    Execute,
}

#[derive(Debug, Clone, Copy)]
pub struct ExceptionInfo {
    pub exception_type: ExceptionType,
    pub access_violation_type: AccessViolationType,
    pub faulting_vaddr: u64,
    pub fault_pc: u64,
    pub caller_rbp: u64,
    pub platform_code: u32,
}

pub type HandlerFn = Arc<dyn Fn(&ExceptionInfo) -> bool + Send + Sync>;

static GLOBAL_HANDLER: OnceLock<Mutex<Option<HandlerFn>>> = OnceLock::new();
static INSTALLED: AtomicPtr<()> = AtomicPtr::new(std::ptr::null_mut());

fn global_slot() -> &'static Mutex<Option<HandlerFn>> {
    GLOBAL_HANDLER.get_or_init(|| Mutex::new(None))
}

/// A per-image handler registration.
///
/// On Linux this only records the image's `[base, base+size)` range
/// for stack-trace attribution (see `triton::diagnostics`); the actual
/// fault dispatch is handled by the one process-wide vectored handler
/// installed via `install_process_handler`.
pub struct ExceptionHandler {
    base_address: u64,
    image_size: u64,
}

impl ExceptionHandler {
    pub fn new() -> Self {
        Self {
            base_address: 0,
            image_size: 0,
        }
    }

    /// `Install(base_address, image_size, callback)`. The callback
    /// resolves the fault (returns `true`) or signals the caller
    /// should terminate (returns `false`); termination itself is the
    /// caller's responsibility (see `triton::diagnostics::abort`).
    pub fn install(&mut self, base_address: u64, image_size: u64, callback: HandlerFn) -> bool {
        self.base_address = base_address;
        self.image_size = image_size;
        install_process_handler(callback);
        true
    }

    pub fn uninstall(&mut self) -> bool {
        self.base_address = 0;
        self.image_size = 0;
        true
    }
}

impl Default for ExceptionHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the process-wide SIGSEGV handler exactly once. Later
/// calls replace the callback that gets consulted (the runtime only
/// ever has one logical owner of this at a time: the dirty-page
/// watcher wired up by `triton::Runtime`).
pub fn install_process_handler(callback: HandlerFn) {
    *global_slot().lock().unwrap() = Some(callback);

    if INSTALLED
        .compare_exchange(
            std::ptr::null_mut(),
            std::ptr::null_mut::<()>().wrapping_add(1),
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_ok()
    {
        unsafe { install_sigaction() };
    }
}

#[cfg(target_os = "linux")]
unsafe fn install_sigaction() {
    let mut sa: libc::sigaction = std::mem::zeroed();
    sa.sa_sigaction = handle_sigsegv as usize;
    sa.sa_flags = libc::SA_SIGINFO;
    libc::sigemptyset(&mut sa.sa_mask);
    libc::sigaction(libc::SIGSEGV, &sa, std::ptr::null_mut());
}

#[cfg(not(target_os = "linux"))]
unsafe fn install_sigaction() {
    log::error!("exception handler: no SIGSEGV backend for this platform");
}

#[cfg(target_os = "linux")]
extern "C" fn handle_sigsegv(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let faulting_vaddr = unsafe { (*info).si_addr() as u64 };
    let (fault_pc, caller_rbp) = unsafe { decode_ucontext(ctx) };

    let access_type = unsafe { classify_access(ctx) };

    let exc_info = ExceptionInfo {
        exception_type: ExceptionType::AccessViolation,
        access_violation_type: access_type,
        faulting_vaddr,
        fault_pc,
        caller_rbp,
        platform_code: sig as u32,
    };

    let resolved = global_slot()
        .lock()
        .ok()
        .and_then(|g| g.as_ref().map(|cb| cb(&exc_info)))
        .unwrap_or(false);

    if !resolved {
        // A real access violation: this is the one place the process
        // is allowed to fall through to the default disposition.
        unsafe {
            libc::signal(libc::SIGSEGV, libc::SIG_DFL);
            libc::raise(libc::SIGSEGV);
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn decode_ucontext(ctx: *mut libc::c_void) -> (u64, u64) {
    // `ucontext_t::uc_mcontext.gregs` holds the saved register file;
    // REG_RIP/REG_RBP are defined by the glibc ucontext headers that
    // `libc` mirrors.
    let ucontext = ctx as *mut libc::ucontext_t;
    let gregs = (*ucontext).uc_mcontext.gregs;
    let rip = gregs[libc::REG_RIP as usize] as u64;
    let rbp = gregs[libc::REG_RBP as usize] as u64;
    (rip, rbp)
}

#[cfg(target_os = "linux")]
unsafe fn classify_access(ctx: *mut libc::c_void) -> AccessViolationType {
    let ucontext = ctx as *mut libc::ucontext_t;
    let err = (*ucontext).uc_mcontext.gregs[libc::REG_ERR as usize];
    // x86-64 page-fault error code bit 1 is the write bit.
    if err & 0x2 != 0 {
        AccessViolationType::Write
    } else {
        AccessViolationType::Read
    }
}
