// Austin Shafer - 2024
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmError {
    /// The kernel refused the fixed address we asked for. Callers
    /// should retry with `address = 0` (a search), not propagate.
    #[error("address conflict at {0:#x}")]
    AddressConflict(u64),
    /// Anything else from the OS allocator: out of memory, invalid
    /// alignment once doubling exceeds the available search space, etc.
    #[error("virtual memory allocation failed: {0}")]
    HardFailure(String),
    #[error("protect failed at {addr:#x}+{size:#x}: {reason}")]
    ProtectFailed { addr: u64, size: u64, reason: String },
    #[error("free failed at {0:#x}")]
    FreeFailed(u64),
}

pub type VmResult<T> = Result<T, VmError>;
