// RuntimeLinker: address plan, segment placement, relocation, lazy
// binding, init/fini orchestration and global symbol resolution.
//
// Austin Shafer - 2024
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use utils::log;
use vmem::{vm_alloc, Mode, PAGE_SIZE};

use crate::dynamic::{self, TableRef};
use crate::elf::{self, Elf64, Phdr, Rela, Sym, PF_R, PF_W, PF_X, PT_LOAD, PT_OS_PROCPARAM, PT_OS_RELRO, PT_TLS};
use crate::error::{LoaderError, LoaderResult};
use crate::image::{Program, TlsState};
use crate::nid::{self, DecoratedName};
use crate::plt;
use crate::symbol::{SymbolDatabase, SymbolRecord, SymbolResolve, SymbolType};
use crate::tls as tls_trampoline;

pub const SYSTEM_RESERVED: u64 = 0x8_0000_0000;
pub const CODE_BASE_OFFSET: u64 = 0x1_0000_0000;
pub const CODE_BASE_INCR: u64 = 0x1000_0000;
pub const INVALID_OFFSET: u64 = 0x0400_0000;
pub const INVALID_MEMORY: u64 = SYSTEM_RESERVED + INVALID_OFFSET;

fn align4k(v: u64) -> u64 {
    utils::align_up(v, PAGE_SIZE)
}

fn mode_from_flags(p_flags: u32) -> Mode {
    match (p_flags & PF_R != 0, p_flags & PF_W != 0, p_flags & PF_X != 0) {
        (_, true, true) => Mode::ExecuteReadWrite,
        (true, false, true) => Mode::ExecuteRead,
        (false, false, true) => Mode::Execute,
        (true, true, false) => Mode::ReadWrite,
        (true, false, false) => Mode::Read,
        (false, true, false) => Mode::Write,
        _ => Mode::NoAccess,
    }
}

/// A process-wide symbol binding registered without any backing
/// image, used by the syscall shim layer to satisfy OS-ABI imports.
pub struct GlobalOverride {
    resolve: SymbolResolve,
    vaddr: u64,
}

/// Owns every loaded [`Program`] and drives the address plan,
/// relocation and init/fini lifecycle across all of them.
pub struct RuntimeLinker {
    programs: Vec<Program>,
    desired_base: u64,
    invalid_memory_installed: bool,
    overrides: Vec<GlobalOverride>,
    next_unique_id: AtomicI32,
    relocate_handler_vaddr: u64,
}

impl RuntimeLinker {
    pub fn new() -> Self {
        Self {
            programs: Vec::new(),
            desired_base: SYSTEM_RESERVED + CODE_BASE_OFFSET,
            invalid_memory_installed: false,
            overrides: Vec::new(),
            next_unique_id: AtomicI32::new(1),
            relocate_handler_vaddr: 0,
        }
    }

    /// Lazily installs the one process-wide `RelocateHandler` entry
    /// page every image's PLT-GOT slot `+0x10` points at.
    fn ensure_relocate_handler(&mut self) -> LoaderResult<u64> {
        if self.relocate_handler_vaddr == 0 {
            self.relocate_handler_vaddr = plt::install_relocate_handler(SYSTEM_RESERVED)?;
        }
        Ok(self.relocate_handler_vaddr)
    }

    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    fn ensure_invalid_memory_page(&mut self) -> LoaderResult<()> {
        if self.invalid_memory_installed {
            return Ok(());
        }
        vm_alloc(INVALID_MEMORY, PAGE_SIZE, Mode::NoAccess)?;
        self.invalid_memory_installed = true;
        Ok(())
    }

    fn advance_desired_base(&mut self, alloc_size: u64) {
        let steps = 1 + alloc_size / CODE_BASE_INCR;
        self.desired_base += steps * CODE_BASE_INCR;
    }

    pub fn register_override(&mut self, resolve: SymbolResolve, vaddr: u64) {
        self.overrides.push(GlobalOverride { resolve, vaddr });
    }

    /// `LoadProgram`: parses the image, reserves its address range,
    /// copies and protects its segments, patches inline TLS reads, and
    /// records it. Does not relocate it -- call [`relocate_all`] once
    /// every needed image is loaded.
    pub fn load_program(&mut self, path: &Path) -> LoaderResult<usize> {
        self.ensure_invalid_memory_page()?;

        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let elf = Elf64::open(path)?;
        let is_shared = elf.is_shared();

        let base_size_aligned = align4k(
            elf.phdrs
                .iter()
                .filter(|p| matches!(p.p_type, PT_LOAD | PT_OS_RELRO))
                .map(|p| p.p_vaddr + p.aligned_size())
                .max()
                .unwrap_or(0),
        );

        let handler_page_size = PAGE_SIZE;
        let tls_page_size = if is_shared { 0 } else { PAGE_SIZE };
        let reservation = base_size_aligned + handler_page_size + tls_page_size;

        let base_vaddr = vm_alloc(self.desired_base, reservation, Mode::ReadWrite)?;
        self.advance_desired_base(reservation);

        log::debug!(
            "LoadProgram: {} base={:#x} size={:#x} shared={}",
            file_name,
            base_vaddr,
            base_size_aligned,
            is_shared
        );

        let placement = place_segments(&elf, base_vaddr)?;

        let tls_state = if !is_shared && placement.tls_size != 0 {
            let tls_page = base_vaddr + base_size_aligned + handler_page_size;
            let handler_vaddr = tls_trampoline::install(tls_page)?;
            patch_tls_reads(&elf, base_vaddr, handler_vaddr)?;
            TlsState {
                image_vaddr: placement.tls_vaddr,
                image_size: placement.tls_size,
                handler_vaddr,
                tlss: Default::default(),
            }
        } else {
            TlsState::default()
        };

        let unique_id = self.next_unique_id.fetch_add(1, Ordering::Relaxed);
        let fail_if_global_not_resolved = !is_shared;

        let program = Program {
            unique_id,
            file_name,
            elf,
            base_vaddr,
            base_size: base_size_aligned,
            dynamic_info: None,
            export_symbols: SymbolDatabase::new(),
            import_symbols: SymbolDatabase::new(),
            proc_param_vaddr: placement.proc_param_vaddr,
            tls: Arc::new(tls_state),
            custom_call_plt_vaddr: 0,
            custom_call_plt_num: 0,
            fail_if_global_not_resolved,
            dbg_print_reloc: false,
        };

        self.programs.push(program);
        Ok(self.programs.len() - 1)
    }

    /// `ParseProgramDynamicInfo` + export/import table population for
    /// every loaded image that carries a `PT_DYNAMIC` segment.
    pub fn parse_all_dynamic_info(&mut self) -> LoaderResult<()> {
        for program in &mut self.programs {
            let phdrs = program.elf.phdrs.clone();
            match dynamic::parse(&program.elf, &phdrs) {
                Ok(info) => {
                    populate_symbol_tables(program, &info)?;
                    program.dynamic_info = Some(info);
                }
                Err(LoaderError::Parse(msg)) if msg == "no PT_DYNAMIC segment" => {
                    log::debug!("{}: no PT_DYNAMIC, treating as static image", program.file_name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// `RelocateAll`: processes every loaded image's RELA table, then
    /// its JMPREL table, in load order.
    pub fn relocate_all(&mut self) -> LoaderResult<()> {
        for idx in 0..self.programs.len() {
            self.relocate_one(idx)?;
        }
        Ok(())
    }

    fn relocate_one(&mut self, idx: usize) -> LoaderResult<()> {
        let (rela_table, rela_table_size, jmprela_table, jmprela_table_size, pltgot_vaddr) = {
            let info = match &self.programs[idx].dynamic_info {
                Some(i) => i,
                None => return Ok(()),
            };
            (info.rela_table, info.rela_table_total_size, info.jmprela_table, info.jmprela_table_size, info.pltgot_vaddr)
        };

        let symtab = read_symtab(&self.programs[idx])?;
        let rela_entries = read_rela_table(&self.programs[idx], rela_table, rela_table_size)?;
        let jmprela_entries = read_rela_table(&self.programs[idx], jmprela_table, jmprela_table_size)?;

        if jmprela_table.is_some() && self.programs[idx].custom_call_plt_vaddr == 0 {
            if pltgot_vaddr != 0 {
                let n = jmprela_entries.len() as u64;
                let table_vaddr = plt::install(SYSTEM_RESERVED, n, self.programs[idx].base_vaddr + pltgot_vaddr)?;
                self.programs[idx].custom_call_plt_vaddr = table_vaddr;
                self.programs[idx].custom_call_plt_num = n;

                let names = jmprela_entries
                    .iter()
                    .enumerate()
                    .map(|(i, rela)| {
                        self.decode_symbol(idx, rela.sym() as usize, &symtab)
                            .map(|r| crate::symbol::generate_name(&r))
                            .unwrap_or_else(|_| format!("<jmprel #{}>", i))
                    })
                    .collect();
                plt::register_diagnostics(self.programs[idx].unique_id, names);

                let handler_vaddr = self.ensure_relocate_handler()?;
                install_pltgot_header(self.programs[idx].base_vaddr + pltgot_vaddr, &self.programs[idx], handler_vaddr)?;
            }
        }

        for rela in &rela_entries {
            self.apply_relocation(idx, rela, &symtab, false)?;
        }
        for (i, rela) in jmprela_entries.iter().enumerate() {
            self.apply_relocation_jmprel(idx, rela, i, &symtab)?;
        }

        Ok(())
    }

    fn apply_relocation(&mut self, idx: usize, rela: &Rela, symtab: &[Sym], _is_jmprel: bool) -> LoaderResult<()> {
        let program = &self.programs[idx];
        let base = program.base_vaddr;
        let vaddr = base + rela.r_offset;
        let reloc_type = rela.reloc_type();

        match reloc_type {
            elf::R_X86_64_RELATIVE => {
                vmem::patch_replace(vaddr, (base as i64 + rela.r_addend) as u64)?;
                return Ok(());
            }
            elf::R_X86_64_DTPMOD64 => {
                vmem::patch_replace(vaddr, program.unique_id as u64)?;
                return Ok(());
            }
            elf::R_X86_64_64 | elf::R_X86_64_GLOB_DAT => {}
            _ => return Err(LoaderError::UnknownRelocation(reloc_type)),
        }

        let sym_index = rela.sym() as usize;
        let sym = symtab.get(sym_index).copied().unwrap_or_default();
        let resolve = self.decode_symbol(idx, sym_index, symtab)?;

        match self.resolve_symbol(idx, &resolve) {
            Some((defining_vaddr, _bind_self)) => {
                vmem::patch_replace(vaddr, (defining_vaddr as i64 + rela.r_addend) as u64)?;
            }
            None => {
                if sym.bind() == elf::STB_WEAK {
                    if resolve.kind == SymbolType::Object {
                        vmem::patch_replace(vaddr, INVALID_MEMORY)?;
                    } else {
                        let elf = &self.programs[idx].elf;
                        let original = elf
                            .vaddr_to_file_offset(rela.r_offset)
                            .and_then(|file_off| {
                                let mut current = [0u8; 8];
                                elf.load_segment(&mut current, file_off, 8).ok()?;
                                Some(u64::from_le_bytes(current))
                            })
                            .unwrap_or(0);
                        vmem::patch_replace(vaddr, base + original)?;
                    }
                } else if self.programs[idx].fail_if_global_not_resolved {
                    return Err(LoaderError::UnresolvedSymbol {
                        name: resolve.name,
                        library: resolve.library,
                        module: resolve.module,
                        kind: resolve.kind,
                    });
                } else {
                    log::debug!("unresolved non-fatal symbol: {}", crate::symbol::generate_name(&resolve));
                }
            }
        }

        Ok(())
    }

    fn apply_relocation_jmprel(&mut self, idx: usize, rela: &Rela, index: usize, symtab: &[Sym]) -> LoaderResult<()> {
        let program = &self.programs[idx];
        let base = program.base_vaddr;
        let vaddr = base + rela.r_offset;
        let reloc_type = rela.reloc_type();
        if reloc_type != elf::R_X86_64_JUMP_SLOT {
            return Err(LoaderError::UnknownRelocation(reloc_type));
        }

        let sym_index = rela.sym() as usize;
        let sym = symtab.get(sym_index).copied().unwrap_or_default();
        let resolve = self.decode_symbol(idx, sym_index, symtab)?;

        match self.resolve_symbol(idx, &resolve) {
            Some((defining_vaddr, _bind_self)) => {
                vmem::patch_replace(vaddr, defining_vaddr)?;
            }
            None if sym.bind() == elf::STB_WEAK => {
                let table_vaddr = self.programs[idx].custom_call_plt_vaddr;
                if table_vaddr != 0 {
                    let entry = plt::call_plt_entry_addr(table_vaddr, index as u64);
                    vmem::patch_replace(vaddr, entry)?;
                }
            }
            None if self.programs[idx].fail_if_global_not_resolved => {
                return Err(LoaderError::UnresolvedSymbol {
                    name: resolve.name,
                    library: resolve.library,
                    module: resolve.module,
                    kind: resolve.kind,
                });
            }
            None => {
                log::debug!("unresolved non-fatal plt symbol: {}", crate::symbol::generate_name(&resolve));
            }
        }

        Ok(())
    }

    /// Reads symbol `sym_index`'s name out of the string table, splits
    /// the NID-decorated form, and expands it to a full
    /// [`SymbolResolve`] using the image's own import/export id
    /// tables.
    fn decode_symbol(&self, idx: usize, sym_index: usize, symtab: &[Sym]) -> LoaderResult<SymbolResolve> {
        let program = &self.programs[idx];
        let info = program.dynamic_info.as_ref().unwrap();
        let sym = symtab.get(sym_index).copied().unwrap_or_default();
        let name = info.read_cstr(&program.elf, &info.dynlibdata, sym.st_name as u64)?;

        let kind = match sym.sym_type() {
            elf::STT_FUNC => SymbolType::Func,
            elf::STT_OBJECT => SymbolType::Object,
            _ => SymbolType::NoType,
        };

        match nid::split(&name) {
            DecoratedName::Nid { name, lib_id, mod_id } => {
                let lib = info.import_libs.iter().find(|l| l.id == lib_id);
                let module = info.import_modules.iter().find(|m| m.id == mod_id);
                Ok(SymbolResolve {
                    name: name.to_string(),
                    library: lib.map(|l| l.name.clone()).unwrap_or_default(),
                    library_version: lib.map(|l| l.version).unwrap_or(0),
                    module: module.map(|m| m.name.clone()).unwrap_or_default(),
                    module_version_major: module.map(|m| m.version_major).unwrap_or(0),
                    module_version_minor: module.map(|m| m.version_minor).unwrap_or(0),
                    kind,
                })
            }
            DecoratedName::Plain(name) => Ok(SymbolResolve {
                name: name.to_string(),
                library: String::new(),
                library_version: 0,
                module: String::new(),
                module_version_major: 0,
                module_version_minor: 0,
                kind,
            }),
        }
    }

    /// `Resolve`: global override first, else the loaded image whose
    /// export libraries/modules match. Returns the defining vaddr and
    /// whether the definer is the referring image itself.
    fn resolve_symbol(&self, referring_idx: usize, resolve: &SymbolResolve) -> Option<(u64, bool)> {
        if let Some(over) = self.overrides.iter().find(|o| symbol_resolve_eq(&o.resolve, resolve)) {
            return Some((over.vaddr, false));
        }

        if resolve.library.is_empty() && resolve.module.is_empty() {
            if let Some(rec) = self.programs[referring_idx].export_symbols.find(resolve) {
                return Some((rec.vaddr, true));
            }
        }

        for (i, program) in self.programs.iter().enumerate() {
            let has_lib = program.dynamic_info.as_ref().map(|d| d.export_libs.iter().any(|l| l.name == resolve.library)).unwrap_or(false);
            let has_mod = program.dynamic_info.as_ref().map(|d| d.export_modules.iter().any(|m| m.name == resolve.module)).unwrap_or(false);
            if has_lib && has_mod {
                if let Some(rec) = program.export_symbols.find(resolve) {
                    return Some((rec.vaddr, i == referring_idx));
                }
            }
        }

        None
    }

    /// `StartAllModules`: runs shared images' `DT_INIT` in load order
    /// as `(argc=0, argv=nullptr, module_func=nullptr)`, then installs
    /// this image's TLS state as the trampoline's target and enters the
    /// main image with `(argc=1, argv={file_name}, atexit_func=
    /// ProgramExitHandler)`.
    pub fn start_all_modules(&self) -> LoaderResult<()> {
        for program in &self.programs {
            if program.is_shared() {
                if let Some(info) = &program.dynamic_info {
                    if info.init_vaddr != 0 {
                        log::debug!("DT_INIT: {} at {:#x}", program.file_name, program.base_vaddr + info.init_vaddr);
                        call_module_ini_fini(program.base_vaddr + info.init_vaddr);
                    }
                    for off in 0..(info.init_array_size / 8) {
                        call_bare(program.base_vaddr + info.init_array_vaddr + off * 8);
                    }
                }
            }
        }

        if let Some(main) = self.programs.iter().find(|p| !p.is_shared()) {
            if !tls_trampoline::set_main_program(main.tls.clone()) {
                log::debug!("set_main_program: a main program was already registered");
            }

            EXIT_LINKER_PTR.store(self as *const RuntimeLinker as u64, Ordering::Release);

            log::info!("entering main module {}", main.file_name);
            let name = std::ffi::CString::new(main.file_name.as_str()).unwrap_or_default();
            let params = EntryParams {
                argc: 1,
                pad: 0,
                argv: [name.as_ptr(), std::ptr::null(), std::ptr::null()],
            };
            call_entry(main.elf.entry() + main.base_vaddr, &params, program_exit_handler);
        }

        Ok(())
    }

    /// `StopAllModules`: runs shared images' `DT_FINI` in reverse load
    /// order, then discards each module's per-thread TLS copies.
    pub fn stop_all_modules(&self) {
        for program in self.programs.iter().rev() {
            if program.is_shared() {
                if let Some(info) = &program.dynamic_info {
                    for off in (0..(info.fini_array_size / 8)).rev() {
                        call_bare(program.base_vaddr + info.fini_array_vaddr + off * 8);
                    }
                    if info.fini_vaddr != 0 {
                        call_module_ini_fini(program.base_vaddr + info.fini_vaddr);
                    }
                }
            }
            program.tls.tlss.lock().unwrap().clear();
        }
    }

    pub fn find_program(&self, unique_id: i32) -> Option<&Program> {
        self.programs.iter().find(|p| p.unique_id == unique_id)
    }

    /// `UnloadProgram`: removes a previously loaded image's record.
    /// The reservation itself is intentionally leaked -- matching the
    /// observed behaviour that a title never unloads its main module
    /// mid-run and library teardown order is asserted by the caller.
    pub fn unload_program(&mut self, unique_id: i32) -> bool {
        let before = self.programs.len();
        self.programs.retain(|p| p.unique_id != unique_id);
        self.programs.len() != before
    }
}

impl Default for RuntimeLinker {
    fn default() -> Self {
        Self::new()
    }
}

fn symbol_resolve_eq(a: &SymbolResolve, b: &SymbolResolve) -> bool {
    a.name == b.name && a.library == b.library && a.module == b.module && a.kind == b.kind
}

/// `EntryParams`: the struct the main entry point receives as its
/// first argument, laid out to match the guest ABI's `argc`/`argv`
/// triple.
#[repr(C)]
struct EntryParams {
    argc: i32,
    pad: u32,
    argv: [*const std::os::raw::c_char; 3],
}

type AtexitFuncT = extern "sysv64" fn();
type EntryFuncT = extern "sysv64" fn(*const EntryParams, AtexitFuncT);
type ModuleIniFiniFuncT = extern "sysv64" fn(usize, *const std::ffi::c_void, *const std::ffi::c_void) -> i32;

/// Holds the running `RuntimeLinker`'s address for the bare, stateless
/// `program_exit_handler` the main entry point is given as its atexit
/// callback -- the guest ABI provides no way to pass captured state
/// through that slot.
static EXIT_LINKER_PTR: AtomicU64 = AtomicU64::new(0);

extern "sysv64" fn program_exit_handler() {
    let addr = EXIT_LINKER_PTR.load(Ordering::Acquire);
    if addr == 0 {
        return;
    }
    let linker = unsafe { &*(addr as *const RuntimeLinker) };
    linker.stop_all_modules();
}

/// Calls a bare bound-function-array entry (`DT_INIT_ARRAY`/
/// `DT_FINI_ARRAY`): a `void(*)()` taking no arguments.
fn call_bare(vaddr: u64) {
    if vaddr == 0 {
        return;
    }
    let f: extern "sysv64" fn() = unsafe { std::mem::transmute(vaddr as usize) };
    f();
}

/// Calls a shared image's `DT_INIT`/`DT_FINI` with the
/// `(args=0, argp=nullptr, func=nullptr)` shape used for every
/// library module.
fn call_module_ini_fini(vaddr: u64) {
    if vaddr == 0 {
        return;
    }
    let f: ModuleIniFiniFuncT = unsafe { std::mem::transmute(vaddr as usize) };
    f(0, std::ptr::null(), std::ptr::null());
}

/// Calls the main image's entry point with its `EntryParams` and
/// `atexit_func`.
fn call_entry(vaddr: u64, params: &EntryParams, atexit_func: AtexitFuncT) {
    let f: EntryFuncT = unsafe { std::mem::transmute(vaddr as usize) };
    f(params as *const EntryParams, atexit_func);
}

struct Placement {
    tls_vaddr: u64,
    tls_size: u64,
    proc_param_vaddr: u64,
}

/// Copies every `PT_LOAD`/`PT_OS_RELRO` segment's file bytes into the
/// reservation at `base_vaddr + p_vaddr`, zero-fills the remainder of
/// `p_memsz`, and sets final page protection from `p_flags`.
fn place_segments(elf: &Elf64, base_vaddr: u64) -> LoaderResult<Placement> {
    let mut placement = Placement {
        tls_vaddr: 0,
        tls_size: 0,
        proc_param_vaddr: 0,
    };

    for phdr in &elf.phdrs {
        match phdr.p_type {
            PT_LOAD | PT_OS_RELRO if phdr.p_memsz > 0 => {
                let dst_vaddr = base_vaddr + phdr.p_vaddr;
                let dst = unsafe { std::slice::from_raw_parts_mut(dst_vaddr as *mut u8, phdr.p_memsz as usize) };
                dst.iter_mut().for_each(|b| *b = 0);
                if phdr.p_filesz > 0 {
                    elf.load_segment(&mut dst[..phdr.p_filesz as usize], phdr.p_offset, phdr.p_filesz)?;
                }
            }
            PT_TLS => {
                placement.tls_vaddr = base_vaddr + phdr.p_vaddr;
                placement.tls_size = phdr.p_memsz;
            }
            PT_OS_PROCPARAM => {
                placement.proc_param_vaddr = base_vaddr + phdr.p_vaddr;
            }
            _ => {}
        }
    }

    for phdr in &elf.phdrs {
        if matches!(phdr.p_type, PT_LOAD | PT_OS_RELRO) && phdr.p_memsz > 0 {
            let dst_vaddr = base_vaddr + phdr.p_vaddr;
            let size = align4k(phdr.p_memsz.max(1));
            vmem::protect(dst_vaddr & !(PAGE_SIZE - 1), size, mode_from_flags(phdr.p_flags))?;
        }
    }

    Ok(placement)
}

/// Scans each executable `PT_LOAD` segment for [`tls_trampoline::TLS_READ_PATTERN`]
/// and patches every occurrence to call the installed trampoline.
fn patch_tls_reads(elf: &Elf64, base_vaddr: u64, handler_vaddr: u64) -> LoaderResult<()> {
    for phdr in &elf.phdrs {
        if phdr.p_type == PT_LOAD && phdr.p_flags & PF_X != 0 && phdr.p_memsz > 0 {
            let dst_vaddr = base_vaddr + phdr.p_vaddr;
            vmem::protect(dst_vaddr & !(PAGE_SIZE - 1), align4k(phdr.p_memsz), Mode::ReadWrite)?;
            tls_trampoline::patch_tls_reads(dst_vaddr, phdr.p_memsz, handler_vaddr)?;
            vmem::protect(dst_vaddr & !(PAGE_SIZE - 1), align4k(phdr.p_memsz), mode_from_flags(phdr.p_flags))?;
        }
    }
    Ok(())
}

fn read_symtab(program: &Program) -> LoaderResult<Vec<Sym>> {
    let info = match &program.dynamic_info {
        Some(i) => i,
        None => return Ok(Vec::new()),
    };
    if info.symbol_table.is_none() || info.symbol_table_entry_size == 0 {
        return Ok(Vec::new());
    }
    let raw = info.read_table(info.symbol_table, &program.elf, &info.dynlibdata, info.symbol_table_total_size)?;
    let mut out = Vec::new();
    let mut off = 0usize;
    while off + elf::SYM_ENTRY_SIZE <= raw.len() {
        out.push(elf::read_sym(&raw, off));
        off += info.symbol_table_entry_size as usize;
    }
    Ok(out)
}

fn read_rela_table(program: &Program, table: Option<TableRef>, size: u64) -> LoaderResult<Vec<Rela>> {
    let table = match table {
        Some(t) => t,
        None => return Ok(Vec::new()),
    };
    let info = program.dynamic_info.as_ref().unwrap();
    let raw = info.read_table(Some(table), &program.elf, &info.dynlibdata, size)?;
    let mut out = Vec::new();
    let mut off = 0usize;
    while off + elf::RELA_ENTRY_SIZE <= raw.len() {
        out.push(elf::read_rela(&raw, off));
        off += elf::RELA_ENTRY_SIZE;
    }
    Ok(out)
}

/// Installs the owning image's id and the `RelocateHandler` entry
/// page's address into `pltgot[1]`/`pltgot[2]`, matching
/// `InstallRelocateHandler`. The image id, not a raw pointer, is what
/// travels through the PLT stub and back into `plt::relocate_handler`
/// -- `Program`s live in a growable `Vec` and can move.
fn install_pltgot_header(pltgot_vaddr: u64, program: &Program, relocate_handler_vaddr: u64) -> LoaderResult<()> {
    vmem::patch_replace(pltgot_vaddr + 8, program.unique_id as u64)?;
    vmem::patch_replace(pltgot_vaddr + 16, relocate_handler_vaddr)?;
    Ok(())
}

/// `GenerateSymbolExports`: walks the dynamic symbol table and records
/// every globally-visible definition (`STB_GLOBAL`/`STB_WEAK`,
/// non-`SHN_UNDEF`) into `export_symbols`.
fn populate_symbol_tables(program: &mut Program, info: &dynamic::DynamicInfo) -> LoaderResult<()> {
    if info.symbol_table.is_none() || info.symbol_table_entry_size == 0 {
        return Ok(());
    }
    let raw = info.read_table(info.symbol_table, &program.elf, &info.dynlibdata, info.symbol_table_total_size)?;

    let mut off = 0usize;
    while off + elf::SYM_ENTRY_SIZE <= raw.len() {
        let sym = elf::read_sym(&raw, off);
        off += info.symbol_table_entry_size as usize;

        if sym.st_shndx == 0 || matches!(sym.bind(), elf::STB_LOCAL) {
            continue;
        }

        let name = info.read_cstr(&program.elf, &info.dynlibdata, sym.st_name as u64)?;
        let kind = match sym.sym_type() {
            elf::STT_FUNC => SymbolType::Func,
            elf::STT_OBJECT => SymbolType::Object,
            _ => SymbolType::NoType,
        };

        let resolve = match nid::split(&name) {
            DecoratedName::Nid { name, lib_id, mod_id } => {
                let lib = info.export_libs.iter().find(|l| l.id == lib_id);
                let module = info.export_modules.iter().find(|m| m.id == mod_id);
                SymbolResolve {
                    name: name.to_string(),
                    library: lib.map(|l| l.name.clone()).unwrap_or_default(),
                    library_version: lib.map(|l| l.version).unwrap_or(0),
                    module: module.map(|m| m.name.clone()).unwrap_or_default(),
                    module_version_major: module.map(|m| m.version_major).unwrap_or(0),
                    module_version_minor: module.map(|m| m.version_minor).unwrap_or(0),
                    kind,
                }
            }
            DecoratedName::Plain(name) => SymbolResolve {
                name: name.to_string(),
                library: String::new(),
                library_version: 0,
                module: String::new(),
                module_version_major: 0,
                module_version_minor: 0,
                kind,
            },
        };

        program.export_symbols.add(resolve, program.base_vaddr + sym.st_value);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_plan_constants_match_spec() {
        assert_eq!(SYSTEM_RESERVED, 0x8_0000_0000);
        assert_eq!(CODE_BASE_OFFSET, 0x1_0000_0000);
        assert_eq!(CODE_BASE_INCR, 0x1000_0000);
        assert_eq!(INVALID_MEMORY, 0x8_0400_0000);
    }

    #[test]
    fn advance_desired_base_pads_by_one_increment() {
        let mut linker = RuntimeLinker::new();
        let start = linker.desired_base;
        linker.advance_desired_base(CODE_BASE_INCR);
        assert_eq!(linker.desired_base, start + 2 * CODE_BASE_INCR);
    }

    #[test]
    fn mode_from_flags_maps_common_combinations() {
        assert_eq!(mode_from_flags(PF_R), Mode::Read);
        assert_eq!(mode_from_flags(PF_R | PF_X), Mode::ExecuteRead);
        assert_eq!(mode_from_flags(PF_R | PF_W), Mode::ReadWrite);
    }
}
