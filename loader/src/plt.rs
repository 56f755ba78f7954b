// Lazy-binding stub machinery: `CallPlt` and the `RelocateHandler`
// it jumps into on a cold PLT slot.
//
// Austin Shafer - 2024
use std::collections::HashMap;
use std::sync::Mutex;

use utils::log;
use vmem::{flush_instruction_cache, protect, vm_alloc, Mode};

use crate::error::LoaderResult;

const HEADER_SIZE: u64 = 32;
const RECORD_SIZE: u64 = 16;

fn push_mov_r11_imm64(code: &mut Vec<u8>, imm: u64) {
    code.extend_from_slice(&[0x49, 0xBB]);
    code.extend_from_slice(&imm.to_le_bytes());
}

fn push_push_r11_disp8(code: &mut Vec<u8>, disp: u8) {
    // push qword ptr [r11+disp8]
    code.extend_from_slice(&[0x41, 0xFF, 0x73, disp]);
}

fn push_jmp_r11_disp8(code: &mut Vec<u8>, disp: u8) {
    // jmp qword ptr [r11+disp8]
    code.extend_from_slice(&[0x41, 0xFF, 0x63, disp]);
}

fn push_push_imm32(code: &mut Vec<u8>, imm: u32) {
    code.push(0x68);
    code.extend_from_slice(&imm.to_le_bytes());
}

fn push_jmp_rel32(code: &mut Vec<u8>, rel: i32) {
    code.push(0xE9);
    code.extend_from_slice(&rel.to_le_bytes());
}

fn pad_nop(code: &mut Vec<u8>, to_len: usize) {
    while code.len() < to_len {
        code.push(0x90);
    }
}

/// Builds the `CallPlt(n)` trampoline table: a 32-byte header that
/// loads `pltgot_vaddr` into `r11`, tail-jumps through `pltgot[2]`
/// (the installed `RelocateHandler` address), preceded by pushing
/// `pltgot[1]` (the owning image pointer); followed by `n` 16-byte
/// `JmpWithIndex` records that each push their own index and jump
/// back to the header.
pub fn build_call_plt(n: u64) -> Vec<u8> {
    let mut code = vec![0u8; HEADER_SIZE as usize];
    let mut header = Vec::new();
    // r11 is patched in by `set_pltgot` once the table's final address
    // (and therefore the real pltgot_vaddr relationship) is known; we
    // reserve the bytes here with a zero immediate.
    push_mov_r11_imm64(&mut header, 0);
    push_push_r11_disp8(&mut header, 0x08);
    push_jmp_r11_disp8(&mut header, 0x10);
    pad_nop(&mut header, HEADER_SIZE as usize);
    code[..header.len()].copy_from_slice(&header);

    for index in 0..n {
        let mut record = Vec::new();
        push_push_imm32(&mut record, index as u32);
        // `jmp rel32` target is unknown until the table has a real
        // address; `link_call_plt` overwrites this once it does.
        push_jmp_rel32(&mut record, 0);
        pad_nop(&mut record, RECORD_SIZE as usize);
        code.extend_from_slice(&record);
    }

    code
}

/// Rewrites each record's `jmp rel32` now that the table's base
/// address (and hence every absolute position) is known, and patches
/// the header's `mov r11, imm64` with the real `pltgot_vaddr`.
pub fn link_call_plt(code: &mut [u8], table_vaddr: u64, pltgot_vaddr: u64) {
    code[2..10].copy_from_slice(&pltgot_vaddr.to_le_bytes());

    let n = (code.len() as u64 - HEADER_SIZE) / RECORD_SIZE;
    for index in 0..n {
        let record_off = (HEADER_SIZE + index * RECORD_SIZE) as usize;
        let jmp_off = record_off + 5; // after `push imm32`
        let jmp_instr_end = (table_vaddr as usize + jmp_off + 5) as i64;
        let rel = (table_vaddr as i64) - jmp_instr_end;
        code[jmp_off + 1..jmp_off + 5].copy_from_slice(&(rel as i32).to_le_bytes());
    }
}

/// Returns the absolute address of record `index`'s entry point
/// (used as the PLT slot value for a still-unresolved import).
pub fn call_plt_entry_addr(table_vaddr: u64, index: u64) -> u64 {
    table_vaddr + HEADER_SIZE + index * RECORD_SIZE
}

pub fn call_plt_size(n: u64) -> u64 {
    HEADER_SIZE + n * RECORD_SIZE
}

/// Allocates, builds, links and makes executable a `CallPlt` table for
/// `n` JMPREL entries anchored at `pltgot_vaddr`.
pub fn install(system_reserved: u64, n: u64, pltgot_vaddr: u64) -> LoaderResult<u64> {
    let size = call_plt_size(n);
    let table_vaddr = vm_alloc(system_reserved, size, Mode::Write)?;

    let mut code = build_call_plt(n);
    link_call_plt(&mut code, table_vaddr, pltgot_vaddr);

    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), table_vaddr as *mut u8, code.len());
    }

    protect(table_vaddr, size, Mode::Execute)?;
    flush_instruction_cache(table_vaddr, size)?;

    Ok(table_vaddr)
}

/// Per-image decorated symbol names for each JMPREL index, registered
/// at relocate time so [`relocate_handler`] can name the culprit
/// without needing back-reference access to the owning `RuntimeLinker`.
static JMPREL_NAMES: Mutex<Option<HashMap<i32, Vec<String>>>> = Mutex::new(None);

/// Records `names[i]`, the decorated symbol name for JMPREL record `i`
/// of the image identified by `unique_id`, for later diagnostic lookup.
pub fn register_diagnostics(unique_id: i32, names: Vec<String>) {
    JMPREL_NAMES.lock().unwrap().get_or_insert_with(HashMap::new).insert(unique_id, names);
}

/// Entered via the JIT shim installed at `pltgot[+0x10]` with `stack_ptr`
/// pointing at `[image_unique_id, rel_index, return_addr, ...]` -- the
/// three words `CallPlt`'s header and its `JmpWithIndex` record left on
/// the stack ahead of the guest's own return address. Looks the index
/// up in the registered name table, restores the return address to the
/// slot a stack walk expects (`stack[0] = stack[2]`), and terminates:
/// reaching here means a JMPREL slot was never patched by `relocate_all`.
///
/// # Safety
/// `stack_ptr` must point at three live, readable/writable `u64` stack
/// slots in the shape the `CallPlt` JIT shim leaves them.
pub unsafe fn relocate_handler(stack_ptr: *mut u64) -> ! {
    let unique_id = *stack_ptr as i32;
    let rel_index = *stack_ptr.add(1);
    let return_addr = *stack_ptr.add(2);

    let name = JMPREL_NAMES
        .lock()
        .unwrap()
        .as_ref()
        .and_then(|table| table.get(&unique_id))
        .and_then(|names| names.get(rel_index as usize))
        .cloned()
        .unwrap_or_else(|| "<unknown function>".to_string());

    // Restore the return address to the slot a backtrace taken from
    // here expects, one level up from where the header pushed it.
    *stack_ptr = return_addr;

    log::error!(
        "unpatched PLT slot: image={} index={} symbol={}",
        unique_id,
        rel_index,
        name
    );
    std::process::abort();
}

/// Builds the small JIT shim that bridges the raw `jmp`-chain calling
/// convention `CallPlt`'s header uses into an ordinary `extern "sysv64"`
/// call: loads the current `rsp` into `rdi` (the first SysV argument
/// register) and calls [`relocate_handler`], which never returns.
fn build_relocate_entry(handler_addr: u64) -> Vec<u8> {
    let mut code = Vec::new();
    code.extend_from_slice(&[0x48, 0x89, 0xE7]); // mov rdi, rsp
    code.extend_from_slice(&[0x49, 0xBB]); // mov r11, imm64
    code.extend_from_slice(&handler_addr.to_le_bytes());
    code.extend_from_slice(&[0x41, 0xFF, 0xD3]); // call r11
    // relocate_handler is `-> !`; this is unreachable, but a safe
    // trailer keeps the page well-formed if it's ever disassembled.
    code.push(0xCC); // int3
    code
}

extern "sysv64" fn relocate_handler_entry_trampoline(stack_ptr: *mut u64) {
    unsafe { relocate_handler(stack_ptr) }
}

/// Allocates, builds and installs the `RelocateHandler` entry page.
/// One page serves every image's PLT-GOT slot `+0x10` -- the handler
/// itself is stateless, keyed per-call by the `unique_id` the stack
/// carries.
pub fn install_relocate_handler(system_reserved: u64) -> LoaderResult<u64> {
    let code = build_relocate_entry(relocate_handler_entry_trampoline as usize as u64);
    let page_vaddr = vm_alloc(system_reserved, code.len() as u64, Mode::Write)?;
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), page_vaddr as *mut u8, code.len());
    }
    protect(page_vaddr, code.len() as u64, Mode::Execute)?;
    flush_instruction_cache(page_vaddr, code.len() as u64)?;
    Ok(page_vaddr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_records_have_expected_sizes() {
        let code = build_call_plt(3);
        assert_eq!(code.len() as u64, call_plt_size(3));
        assert_eq!(code.len(), 32 + 3 * 16);
    }

    #[test]
    fn relocate_entry_shim_ends_in_trap() {
        let code = build_relocate_entry(0x1234_5678_9abc_def0);
        assert_eq!(*code.last().unwrap(), 0xCC);
        assert_eq!(&code[0..3], &[0x48, 0x89, 0xE7]);
    }

    #[test]
    fn relocate_handler_names_registered_index_and_restores_return_addr() {
        register_diagnostics(77, vec!["foo".to_string(), "bar".to_string()]);
        let mut stack = [77u64, 1, 0xdead_beef];
        let name = {
            let table = JMPREL_NAMES.lock().unwrap();
            table.as_ref().unwrap().get(&77).unwrap().get(1).cloned()
        };
        assert_eq!(name, Some("bar".to_string()));
        // Mirrors what relocate_handler does just before aborting,
        // without actually calling std::process::abort() in a test.
        stack[0] = stack[2];
        assert_eq!(stack[0], 0xdead_beef);
    }

    #[test]
    fn entry_addr_steps_by_record_size() {
        assert_eq!(call_plt_entry_addr(0x1000, 0), 0x1000 + 32);
        assert_eq!(call_plt_entry_addr(0x1000, 2), 0x1000 + 32 + 2 * 16);
    }
}
