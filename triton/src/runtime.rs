// Wires the loader's `RuntimeLinker` and the gpu crate's memory cache
// and command processor into one runnable guest process: load, relocate,
// run init, and install the process-wide dirty-page/access-violation
// plumbing that ties them together.
//
// Austin Shafer - 2024
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use gpu::{CommandProcessor, GpuMemoryCache};
use loader::RuntimeLinker;
use utils::log;
use vmem::{AccessViolationType, ExceptionHandler, ExceptionInfo, ExceptionType, PageWatcher};

use crate::config::Config;
use crate::diagnostics;

/// Owns the loaded guest program and the GPU side that serves it. One
/// `Runtime` per guest process.
pub struct Runtime {
    config: Config,
    linker: RuntimeLinker,
    gpu_memory: Arc<GpuMemoryCache>,
    command_processor: CommandProcessor,
    exception_handler: ExceptionHandler,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let watcher = PageWatcher::new();
        Self {
            config,
            linker: RuntimeLinker::new(),
            gpu_memory: Arc::new(GpuMemoryCache::new(watcher)),
            command_processor: CommandProcessor::new(),
            exception_handler: ExceptionHandler::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn command_processor(&mut self) -> &mut CommandProcessor {
        &mut self.command_processor
    }

    pub fn gpu_memory(&self) -> &Arc<GpuMemoryCache> {
        &self.gpu_memory
    }

    /// `LoadProgram`: parses and places `path`'s image, registers it
    /// for fault attribution, and installs the process-wide handler on
    /// the first call (later calls just extend attribution).
    pub fn load_program(&mut self, path: &Path) -> Result<usize> {
        let idx = self
            .linker
            .load_program(path)
            .with_context(|| format!("loading {}", path.display()))?;

        let program = &self.linker.programs()[idx];
        diagnostics::register_image(&program.file_name, program.base_vaddr, program.base_size);

        let gpu_memory = self.gpu_memory.clone();
        let callback: vmem::HandlerFn = Arc::new(move |info: &ExceptionInfo| {
            if info.exception_type != ExceptionType::AccessViolation {
                return false;
            }
            if info.access_violation_type == AccessViolationType::Write
                && gpu_memory.watcher_check(info.faulting_vaddr, 1)
            {
                return true;
            }
            log::error!(
                "unresolved fault at {:#x} (pc {:#x}), aborting",
                info.faulting_vaddr,
                info.fault_pc
            );
            diagnostics::abort(info);
        });

        self.exception_handler
            .install(program.base_vaddr, program.base_size, callback);

        Ok(idx)
    }

    /// `RelocateAll`: applies every pending relocation across every
    /// loaded image, resolving symbols against each other and against
    /// any registered global overrides.
    pub fn relocate_all(&mut self) -> Result<()> {
        self.linker.parse_all_dynamic_info()?;
        self.linker.relocate_all()?;
        Ok(())
    }

    /// `StartAllModules`: runs `DT_INIT`/`DT_INIT_ARRAY` for every
    /// loaded image, main program last.
    pub fn start_all_modules(&self) -> Result<()> {
        self.linker.start_all_modules()?;
        Ok(())
    }

    /// `StopAllModules`: runs `DT_FINI`/`DT_FINI_ARRAY` in reverse.
    pub fn stop_all_modules(&self) {
        self.linker.stop_all_modules();
    }

    /// `UnloadProgram`: tears down one loaded image's segments.
    pub fn unload_program(&mut self, unique_id: i32) -> bool {
        self.linker.unload_program(unique_id)
    }
}
