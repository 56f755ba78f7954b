// Virtual-memory facade and the dirty-page watcher built on top of it.
//
// Austin Shafer - 2024
mod error;
mod exception;
mod facade;
mod watcher;

pub use error::{VmError, VmResult};
pub use exception::{AccessViolationType, ExceptionHandler, ExceptionInfo, ExceptionType, HandlerFn};
pub use facade::{
    align_up, flush_instruction_cache, free, patch_replace, protect, vm_alloc, vm_alloc_aligned,
    vm_alloc_fixed, Mode, PAGE_SIZE,
};
pub use watcher::{PageWatcher, WatchCallback, WatchedRegion};
