// The loaded-image record.
//
// Austin Shafer - 2024
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::dynamic::DynamicInfo;
use crate::elf::Elf64;
use crate::symbol::SymbolDatabase;

/// Per-thread TLS copy: a private buffer the size of the image's TLS
/// template, allocated lazily on a thread's first access.
pub struct TlsCopy {
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct TlsState {
    pub image_vaddr: u64,
    pub image_size: u64,
    /// Absolute address of this image's TLS trampoline entry point;
    /// zero until `linker::setup_tls_handler` runs (non-shared images
    /// only).
    pub handler_vaddr: u64,
    /// Per-thread copies keyed by the thread's unique id. Owned by the
    /// image; destroyed when the thread or the image dies.
    pub tlss: Mutex<HashMap<u64, TlsCopy>>,
}

/// One loaded foreign ELF image.
pub struct Program {
    pub unique_id: i32,
    pub file_name: String,
    pub elf: Elf64,

    pub base_vaddr: u64,
    pub base_size: u64,

    pub dynamic_info: Option<DynamicInfo>,

    pub export_symbols: SymbolDatabase,
    pub import_symbols: SymbolDatabase,

    pub proc_param_vaddr: u64,
    /// Shared so the process-wide TLS trampoline handler (which has no
    /// other way to reach this `Program`) can hold its own handle.
    pub tls: Arc<TlsState>,

    /// Address of the JIT-built `CallPlt` trampoline table, or 0 if
    /// the image shipped one of its own (or has none).
    pub custom_call_plt_vaddr: u64,
    pub custom_call_plt_num: u64,

    /// False for the main (non-shared) image and for modules living
    /// under a `_module/` directory -- system libraries relax the
    /// "must resolve" requirement the main image is held to.
    pub fail_if_global_not_resolved: bool,

    pub dbg_print_reloc: bool,
}

impl Program {
    pub fn is_shared(&self) -> bool {
        self.elf.is_shared()
    }
}
