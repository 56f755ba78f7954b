// Austin Shafer - 2024
#![allow(non_camel_case_types)]
use thiserror::Error;

/// Unit variants named after the failing operation rather than a
/// message-carrying payload.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuError {
    #[error("invalid argument")]
    INVALID,
    #[error("unsupported pixel/buffer format")]
    INVALID_FORMAT,
    #[error("could not create vulkan instance")]
    COULD_NOT_CREATE_INSTANCE,
    #[error("could not create vulkan device")]
    COULD_NOT_CREATE_DEVICE,
    #[error("could not create pipeline")]
    COULD_NOT_CREATE_PIPELINE,
    #[error("could not create image")]
    COULD_NOT_CREATE_IMAGE,
    #[error("could not create framebuffer")]
    COULD_NOT_CREATE_FRAMEBUFFER,
    #[error("could not create descriptor pool")]
    COULD_NOT_CREATE_DESCRIPTOR_POOL,
    #[error("not all required vulkan extensions are available")]
    VK_NOT_ALL_EXTENSIONS_AVAILABLE,
    #[error("unknown PM4 packet opcode")]
    UNKNOWN_PM4_OPCODE,
    #[error("command ring overrun")]
    RING_OVERRUN,
    #[error("unrecognised ACQUIRE_MEM cache action")]
    UNKNOWN_CACHE_ACTION,
    #[error("command buffer submission failed")]
    SUBMIT_FAILED,
    #[error("unsupported depth/stencil tile configuration")]
    UNSUPPORTED_TILE_MODE,
    #[error("unknown end-of-pipe label")]
    UNKNOWN_LABEL,
}

pub type GpuResult<T> = Result<T, GpuError>;
