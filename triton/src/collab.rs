// External interfaces: the collaborators this crate's core
// depends on but does not implement — shader recompilation, kernel
// event delivery, video-out presentation, and the windowing/device
// context a real platform integration supplies. Exposed as traits so
// they're pluggable ports rather than free functions the core calls
// directly.
//
// Austin Shafer - 2024
use anyhow::Result;

/// Recompiles a guest shader binary (GCN/RDNA bytecode) into SPIR-V the
/// render engine's pipeline cache can hand to `ash`.
pub trait ShaderRecompiler: Send + Sync {
    fn recompile(&self, guest_bytecode: &[u8]) -> Result<Vec<u32>>;
}

/// Delivers asynchronous kernel-side events (EqueueEvent-style
/// notifications) back to whatever is driving the guest's syscall
/// loop.
pub trait KernelEventQueue: Send + Sync {
    fn post(&self, event_id: u64, data: u64) -> Result<()>;
}

/// Presents a completed frame. The tiler hands this a linear buffer;
/// what happens after (blit to a window, write to a capture file) is
/// entirely up to the integration.
pub trait VideoOut: Send + Sync {
    fn present(&self, width: u32, height: u32, pitch: u32, pixels: &[u8]) -> Result<()>;
}

/// Owns the platform window and Vulkan device/instance the render
/// engine draws into. Kept as a trait so headless test integrations
/// can stand in a fake device without linking a real windowing system.
pub trait GraphicContext: Send + Sync {
    fn device(&self) -> &ash::Device;
    fn physical_device(&self) -> ash::vk::PhysicalDevice;
    fn queue(&self) -> ash::vk::Queue;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct RecordingEventQueue {
        last: AtomicU64,
    }

    impl KernelEventQueue for RecordingEventQueue {
        fn post(&self, event_id: u64, _data: u64) -> Result<()> {
            self.last.store(event_id, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn trait_object_is_usable_behind_a_box() {
        let queue: Box<dyn KernelEventQueue> = Box::new(RecordingEventQueue { last: AtomicU64::new(0) });
        queue.post(42, 0).unwrap();
    }
}
