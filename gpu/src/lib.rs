// GPU command processing, object cache, Vulkan render engine and
// detiling.
//
// Austin Shafer - 2024
pub mod asyncjob;
pub mod context;
pub mod error;
pub mod label;
pub mod objcache;
pub mod pm4;
pub mod render;
pub mod ring;
pub mod tiler;

pub use error::{GpuError, GpuResult};
pub use label::LabelManager;
pub use objcache::{GpuMemoryCache, ObjectFactory, ObjectKind};
pub use ring::CommandProcessor;
