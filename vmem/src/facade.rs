// Virtual-memory facade: reserve/commit/protect/free page ranges at
// chosen addresses, and patch single qwords in executable pages.
//
// Austin Shafer - 2024
use crate::error::{VmError, VmResult};
use std::collections::BTreeMap;
use std::sync::Mutex;

use utils::log;

pub const PAGE_SIZE: u64 = 0x1000;

/// Low range searched first when `AllocAligned` is asked for an
/// OS-managed address (`address == 0`) -- this mirrors the "system
/// reserved" range the runtime linker carves its own sentinel page
/// out of.
const SYSTEM_RANGE: (u64, u64) = (0x40_0000, 0x7FFF_FFFF);
/// General-purpose search range for everything else (image
/// reservations, GPU scratch allocations, ...).
const USER_RANGE: (u64, u64) = (0x10_0000_0000, 0xFBFF_FFFFFF);

lazy_static::lazy_static! {
    /// address -> size, so `free()` can recover the mapping length it
    /// was never handed.
    static ref ALLOCATIONS: Mutex<BTreeMap<u64, u64>> = Mutex::new(BTreeMap::new());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    NoAccess,
    Read,
    Write,
    ReadWrite,
    Execute,
    ExecuteRead,
    ExecuteWrite,
    ExecuteReadWrite,
}

impl Mode {
    pub fn is_executable(&self) -> bool {
        matches!(
            self,
            Mode::Execute | Mode::ExecuteRead | Mode::ExecuteWrite | Mode::ExecuteReadWrite
        )
    }

    fn to_prot(self) -> i32 {
        use libc::{PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE};
        match self {
            Mode::NoAccess => PROT_NONE,
            Mode::Read => PROT_READ,
            Mode::Write | Mode::ReadWrite => PROT_READ | PROT_WRITE,
            Mode::Execute => PROT_EXEC,
            Mode::ExecuteRead => PROT_EXEC | PROT_READ,
            Mode::ExecuteWrite | Mode::ExecuteReadWrite => PROT_EXEC | PROT_READ | PROT_WRITE,
        }
    }

    fn from_prot(prot: i32) -> Mode {
        use libc::{PROT_EXEC, PROT_READ, PROT_WRITE};
        match prot & (PROT_EXEC | PROT_READ | PROT_WRITE) {
            0 => Mode::NoAccess,
            p if p == PROT_READ => Mode::Read,
            p if p == PROT_WRITE => Mode::Write,
            p if p == (PROT_READ | PROT_WRITE) => Mode::ReadWrite,
            p if p == PROT_EXEC => Mode::Execute,
            p if p == (PROT_EXEC | PROT_READ) => Mode::ExecuteRead,
            p if p == (PROT_EXEC | PROT_WRITE) => Mode::ExecuteWrite,
            _ => Mode::ExecuteReadWrite,
        }
    }
}

pub fn align_up(val: u64, align: u64) -> u64 {
    utils::align_up(val, align)
}

fn record_alloc(addr: u64, size: u64) {
    ALLOCATIONS.lock().unwrap().insert(addr, size);
}

/// Maps `size` bytes at `addr` with `MAP_FIXED_NOREPLACE`, so the
/// kernel refuses instead of silently clobbering an existing mapping.
fn mmap_fixed(addr: u64, size: u64, mode: Mode) -> VmResult<u64> {
    let prot = mode.to_prot();
    let ptr = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            size as usize,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        let errno = std::io::Error::last_os_error();
        return match errno.raw_os_error() {
            Some(libc::EEXIST) | Some(libc::EINVAL) => Err(VmError::AddressConflict(addr)),
            _ => Err(VmError::HardFailure(errno.to_string())),
        };
    }
    let got = ptr as u64;
    record_alloc(got, size);
    Ok(got)
}

/// `Alloc`: try the fixed address first; on conflict fall back to an
/// aligned search starting from address 0.
pub fn vm_alloc(address: u64, size: u64, mode: Mode) -> VmResult<u64> {
    if address != 0 {
        match mmap_fixed(address, size, mode) {
            Ok(a) => return Ok(a),
            Err(VmError::AddressConflict(_)) => {
                log::debug!("Alloc: {:#x} busy, falling back to search", address);
            }
            Err(e) => return Err(e),
        }
    }
    vm_alloc_aligned(0, size, mode, PAGE_SIZE)
}

/// `AllocAligned`: search a fixed range for a free, aligned slot. When
/// `address != 0` the caller is asking for that exact address (used by
/// the runtime linker's deterministic address plan); we still retry
/// with doubled alignment on conflict, matching the observed behavior
/// of the platform allocator on `ERROR_INVALID_PARAMETER`.
pub fn vm_alloc_aligned(address: u64, size: u64, mode: Mode, alignment: u64) -> VmResult<u64> {
    let mut align = alignment.max(PAGE_SIZE);
    let aligned_size = align_up(size, PAGE_SIZE);

    loop {
        let result = if address != 0 {
            mmap_fixed(align_up(address, align), aligned_size, mode)
        } else {
            search_range(SYSTEM_RANGE, aligned_size, align, mode)
                .or_else(|_| search_range(USER_RANGE, aligned_size, align, mode))
        };

        match result {
            Ok(a) => return Ok(a),
            Err(VmError::AddressConflict(_)) => {
                let (_, range_end) = if address != 0 { (0, u64::MAX) } else { USER_RANGE };
                align *= 2;
                if align > range_end {
                    return Err(VmError::HardFailure(format!(
                        "AllocAligned: exhausted address space for size={:#x} align={:#x}",
                        size, align
                    )));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn search_range(range: (u64, u64), size: u64, align: u64, mode: Mode) -> VmResult<u64> {
    let (mut candidate, end) = range;
    candidate = align_up(candidate, align);
    while candidate + size <= end {
        match mmap_fixed(candidate, size, mode) {
            Ok(a) => return Ok(a),
            Err(VmError::AddressConflict(_)) => candidate += align,
            Err(e) => return Err(e),
        }
    }
    Err(VmError::AddressConflict(range.0))
}

/// `AllocFixed`: demand an exact address, no fallback search.
pub fn vm_alloc_fixed(address: u64, size: u64, mode: Mode) -> VmResult<()> {
    mmap_fixed(address, align_up(size, PAGE_SIZE), mode).map(|_| ())
}

/// `Free`.
pub fn free(address: u64) -> VmResult<()> {
    let size = ALLOCATIONS
        .lock()
        .unwrap()
        .remove(&address)
        .ok_or(VmError::FreeFailed(address))?;
    let rc = unsafe { libc::munmap(address as *mut libc::c_void, size as usize) };
    if rc != 0 {
        return Err(VmError::FreeFailed(address));
    }
    Ok(())
}

/// `Protect`: returns the previous mode.
///
/// Linux has no direct "query current protection" syscall, so like
/// the platform's own Linux backend we track what we last set and
/// trust it; `mprotect` only ever fails loudly if the range was never
/// mapped by us.
pub fn protect(address: u64, size: u64, mode: Mode) -> VmResult<Mode> {
    let old = current_protection_hint(address).unwrap_or(Mode::ReadWrite);
    let rc = unsafe {
        libc::mprotect(
            address as *mut libc::c_void,
            size as usize,
            mode.to_prot(),
        )
    };
    if rc != 0 {
        return Err(VmError::ProtectFailed {
            addr: address,
            size,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    record_protection_hint(address, mode);
    Ok(old)
}

lazy_static::lazy_static! {
    static ref PROT_HINTS: Mutex<BTreeMap<u64, Mode>> = Mutex::new(BTreeMap::new());
}

fn current_protection_hint(addr: u64) -> Option<Mode> {
    PROT_HINTS.lock().unwrap().get(&addr).copied()
}

fn record_protection_hint(addr: u64, mode: Mode) {
    PROT_HINTS.lock().unwrap().insert(addr, mode);
}

/// `FlushInstructionCache`. On x86-64 the instruction cache is kept
/// coherent with the data cache by hardware; this is a no-op that
/// exists so the patch path reads correctly and so non-x86 ports have
/// an obvious place to add a real flush.
pub fn flush_instruction_cache(_address: u64, _size: u64) -> VmResult<()> {
    Ok(())
}

/// `PatchReplace`: atomically overwrite one qword of executable
/// memory. Returns `true` iff the stored value changed.
///
/// Steps: snapshot protection, enable write,
/// overwrite, restore protection, flush icache if the old protection
/// was executable.
pub fn patch_replace(vaddr: u64, value: u64) -> VmResult<bool> {
    let page = vaddr & !(PAGE_SIZE - 1);
    let old_mode = current_protection_hint(page).unwrap_or(Mode::ExecuteRead);

    protect(page, PAGE_SIZE, Mode::ReadWrite)?;

    let ptr = vaddr as *mut u64;
    let changed = unsafe {
        let current = ptr.read_unaligned();
        if current != value {
            ptr.write_unaligned(value);
            true
        } else {
            false
        }
    };

    protect(page, PAGE_SIZE, old_mode)?;

    if old_mode.is_executable() {
        flush_instruction_cache(page, PAGE_SIZE)?;
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_protect_free_roundtrip() {
        let addr = vm_alloc(0, PAGE_SIZE, Mode::ReadWrite).unwrap();
        assert_eq!(addr % PAGE_SIZE, 0);

        unsafe {
            (addr as *mut u64).write(0x1122_3344_5566_7788);
        }

        let old = protect(addr, PAGE_SIZE, Mode::Read).unwrap();
        assert_eq!(old, Mode::ReadWrite);

        protect(addr, PAGE_SIZE, Mode::ReadWrite).unwrap();
        free(addr).unwrap();
    }

    #[test]
    fn patch_replace_reports_change_once() {
        let addr = vm_alloc(0, PAGE_SIZE, Mode::ReadWrite).unwrap();
        record_protection_hint(addr, Mode::ReadWrite);

        let first = patch_replace(addr, 42).unwrap();
        let second = patch_replace(addr, 42).unwrap();
        assert!(first);
        assert!(!second);

        free(addr).unwrap();
    }
}
