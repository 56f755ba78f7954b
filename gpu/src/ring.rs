// The command processor: ring submission, the DE (draw engine) and CE
// (constant engine) split on the graphics ring, and up to 64 compute
// rings addressed by (pipe_id, queue_id).
//
// Austin Shafer - 2024
use std::sync::{Condvar, Mutex};

use ash::{vk, Device};

use utils::log;

use crate::context::ContextRegisters;
use crate::error::{GpuError, GpuResult};
use crate::label;
use crate::pm4::{Opcode, Pm4Reader};
use crate::render::{ComputePipelineKey, PipelineCache, PipelineKey};

pub const MAX_COMPUTE_RINGS: usize = 64;

/// A bound Vulkan backend for a `CommandBufferPool`: one command
/// buffer and fence per rotation slot. Attached post-construction,
/// mirroring `BufferInit`'s lazy on-first-need allocation, so
/// `CommandProcessor::new` stays Vulkan-handle-free like the rest of
/// this crate's caches.
struct Backend {
    device: Device,
    queue: vk::Queue,
    command_buffers: Vec<vk::CommandBuffer>,
    fences: Vec<vk::Fence>,
}

/// `GraphicsRunMapComputeQueue`'s backend command-buffer round robin:
/// a small pool of backend command buffers a ring cycles through so
/// the backend can record the next frame while the previous one is
/// still in flight.
pub struct CommandBufferPool {
    buffers: Vec<bool>,
    next: usize,
    backend: Option<Backend>,
}

impl CommandBufferPool {
    pub fn new(depth: usize) -> Self {
        Self {
            buffers: vec![false; depth.max(1)],
            next: 0,
            backend: None,
        }
    }

    /// Attaches a real Vulkan backend so `flush`/`wait_done` submit
    /// and wait on an actual queue instead of just bookkeeping.
    /// `command_buffers`/`fences` must have one entry per rotation
    /// slot (the `depth` passed to `new`).
    pub fn bind_backend(&mut self, device: Device, queue: vk::Queue, command_buffers: Vec<vk::CommandBuffer>, fences: Vec<vk::Fence>) {
        debug_assert_eq!(command_buffers.len(), self.buffers.len());
        debug_assert_eq!(fences.len(), self.buffers.len());
        self.backend = Some(Backend { device, queue, command_buffers, fences });
    }

    /// `BufferInit`: claims the next buffer in the rotation, blocking
    /// (from the caller's point of view — here signalled by returning
    /// `None`) if it's still marked in-flight.
    pub fn buffer_init(&mut self) -> Option<usize> {
        let idx = self.next;
        if self.buffers[idx] {
            return None;
        }
        self.buffers[idx] = true;
        self.next = (self.next + 1) % self.buffers.len();
        Some(idx)
    }

    /// `BufferFlush`: ends and submits the claimed buffer's recorded
    /// commands to the bound queue. A no-op bookkeeping pass with no
    /// backend attached.
    pub fn flush(&mut self, idx: usize) -> GpuResult<()> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        let cmd = backend.command_buffers[idx];
        unsafe {
            backend.device.end_command_buffer(cmd).map_err(|_| GpuError::SUBMIT_FAILED)?;
            let cmds = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&cmds).build();
            backend
                .device
                .queue_submit(backend.queue, &[submit_info], backend.fences[idx])
                .map_err(|_| GpuError::SUBMIT_FAILED)?;
        }
        Ok(())
    }

    /// `BufferWait`: blocks on the claimed buffer's fence, then resets
    /// the fence and command buffer for its next rotation, freeing the
    /// slot for `buffer_init` to hand out again.
    pub fn wait_done(&mut self, idx: usize) -> GpuResult<()> {
        if let Some(backend) = &self.backend {
            unsafe {
                backend
                    .device
                    .wait_for_fences(&[backend.fences[idx]], true, u64::MAX)
                    .map_err(|_| GpuError::SUBMIT_FAILED)?;
                backend.device.reset_fences(&[backend.fences[idx]]).map_err(|_| GpuError::SUBMIT_FAILED)?;
                backend
                    .device
                    .reset_command_buffer(backend.command_buffers[idx], vk::CommandBufferResetFlags::empty())
                    .map_err(|_| GpuError::SUBMIT_FAILED)?;
            }
        }
        self.buffers[idx] = false;
        Ok(())
    }
}

#[derive(Default)]
struct RingState {
    read_ptr: u32,
}

/// One ring's submit/doorbell bookkeeping, shared between the
/// submitting thread and the ring worker.
struct RingSync {
    state: Mutex<RingState>,
    doorbell: Condvar,
}

impl RingSync {
    fn new() -> Self {
        Self {
            state: Mutex::new(RingState::default()),
            doorbell: Condvar::new(),
        }
    }

    /// `DingDong`: the guest poking the doorbell to say "there's new
    /// work up to offset_dw"; wakes the ring worker.
    fn ding_dong(&self, offset_dw: u32) {
        let mut state = self.state.lock().unwrap();
        state.read_ptr = offset_dw;
        self.doorbell.notify_one();
    }
}

/// A single compute ring, identified by `(pipe_id, queue_id)`.
pub struct ComputeRing {
    pub pipe_id: u32,
    pub queue_id: u32,
    sync: RingSync,
    buffers: CommandBufferPool,
}

/// `RecursionLimit`: a guard against a malformed/hostile indirect
/// buffer chain pointing back at itself, since the ring decode has no
/// other way to detect a cycle.
const MAX_INDIRECT_DEPTH: u32 = 8;

/// The graphics command processor: one DE ring plus the CE ring it
/// hands constant-update packets to, and the registered compute rings.
pub struct CommandProcessor {
    pub regs: ContextRegisters,
    de_sync: RingSync,
    ce_sync: RingSync,
    buffers: CommandBufferPool,
    compute_rings: Vec<Option<ComputeRing>>,
    frame_num: u32,
    submits_allowed: bool,
    /// `m_de_counter`/`m_ce_counter`: since this port runs the CE ring
    /// fully before the DE ring within one `submit`, a later submit's
    /// CE work can never race a still-pending wait from an earlier
    /// one. `WaitCe`/`WaitDeDiff` are therefore immediate checks
    /// against the already-final counters rather than real blocking.
    ce_counter: u32,
    de_counter: u32,
    pipeline_cache: PipelineCache<PipelineKey>,
    compute_pipeline_cache: PipelineCache<ComputePipelineKey>,
    indirect_depth: u32,
}

impl CommandProcessor {
    pub fn new() -> Self {
        Self {
            regs: ContextRegisters::new(),
            de_sync: RingSync::new(),
            ce_sync: RingSync::new(),
            buffers: CommandBufferPool::new(3),
            compute_rings: (0..MAX_COMPUTE_RINGS).map(|_| None).collect(),
            frame_num: 0,
            submits_allowed: true,
            ce_counter: 0,
            de_counter: 0,
            pipeline_cache: PipelineCache::new(),
            compute_pipeline_cache: PipelineCache::new(),
            indirect_depth: 0,
        }
    }

    /// `GraphicsRunSubmit`: decodes `draw` on the DE ring and `consts`
    /// on the CE ring. The DE waits on the CE only where a real
    /// dependency exists (const-buffer writes visible to a later draw);
    /// this port instead drains both fully before returning, since
    /// parsing is synchronous here rather than running on its own
    /// worker thread.
    pub fn submit(&mut self, draw: &[u32], consts: &[u32]) -> GpuResult<()> {
        if !self.submits_allowed {
            return Ok(());
        }
        self.run_ring(consts, RingKind::Ce)?;
        self.run_ring(draw, RingKind::De)?;
        self.frame_num += 1;
        Ok(())
    }

    fn run_ring(&mut self, words: &[u32], kind: RingKind) -> GpuResult<()> {
        let mut reader = Pm4Reader::new(words);
        while let Some(packet) = reader.next_packet()? {
            let (op, body) = packet;
            self.dispatch(kind, op, body)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, kind: RingKind, op: Opcode, body: &[u32]) -> GpuResult<()> {
        match op {
            Opcode::Nop => {}
            Opcode::SetContextReg => self.regs.set_context_reg(body[0], &body[1..]),
            Opcode::SetShReg => self.regs.set_sh_reg(body[0], &body[1..]),
            Opcode::SetUconfigReg => self.regs.set_uconfig_reg(body[0], &body[1..]),
            Opcode::IndirectBuffer => self.indirect_buffer(kind, body)?,
            Opcode::DrawIndex2 | Opcode::DrawIndexAuto => self.draw(kind)?,
            Opcode::EventWrite => {
                if body.is_empty() {
                    return Err(GpuError::RING_OVERRUN);
                }
                let event_type = body[0] & 0x3f;
                let event_index = (body[0] >> 8) & 0x7;
                label::trigger_event(event_type, event_index)?;
            }
            Opcode::EventWriteEop => {
                label::signal(&label::decode_event_write_eop(body)?);
            }
            Opcode::EventWriteEos => {
                label::signal(&label::decode_event_write_eos(body)?);
            }
            Opcode::ReleaseMem => {
                label::signal(&label::decode_release_mem(body)?);
            }
            Opcode::IncrementCeCounter => {
                self.ce_counter += 1;
                log::verbose!("command processor: ce_counter -> {}", self.ce_counter);
            }
            Opcode::IncrementDeCounter => {
                // `IncremenetDe` also flushes/waits the in-flight vk
                // command buffer in the original; here that lifecycle
                // is already driven explicitly by the submission's
                // own buffer_init/flush/wait_done calls, so only the
                // counter needs updating.
                self.de_counter += 1;
                log::verbose!("command processor: de_counter -> {}", self.de_counter);
            }
            Opcode::WaitOnCeCounter => {
                if !(self.ce_counter > self.de_counter) {
                    log::error!(
                        "command processor: WaitOnCeCounter unmet (ce={}, de={}); no later thread will satisfy it in this synchronous port",
                        self.ce_counter,
                        self.de_counter
                    );
                }
            }
            Opcode::WaitOnDeCounterDiff => {
                if body.is_empty() {
                    return Err(GpuError::RING_OVERRUN);
                }
                let diff = body[0];
                if !(self.ce_counter.wrapping_sub(self.de_counter) < diff) {
                    log::error!(
                        "command processor: WaitOnDeCounterDiff unmet (ce={}, de={}, diff={})",
                        self.ce_counter,
                        self.de_counter,
                        diff
                    );
                }
            }
            Opcode::AcquireMem => self.acquire_mem(body)?,
            _ => {}
        }
        Ok(())
    }

    /// `cp_op_indirect_buffer`: chases a guest-memory command buffer
    /// and recurses into it on the same ring, bounded by
    /// `MAX_INDIRECT_DEPTH` against a cyclic/malformed chain.
    fn indirect_buffer(&mut self, kind: RingKind, body: &[u32]) -> GpuResult<()> {
        if body.len() < 3 {
            return Err(GpuError::RING_OVERRUN);
        }
        let addr = (body[0] as u64) | ((body[1] as u64 & 0xffff) << 32);
        let num_dw = (body[2] & 0xf_ffff) as usize;
        if addr == 0 || num_dw == 0 {
            return Err(GpuError::RING_OVERRUN);
        }
        if self.indirect_depth >= MAX_INDIRECT_DEPTH {
            log::error!("command processor: indirect buffer chain too deep, aborting chase");
            return Err(GpuError::RING_OVERRUN);
        }
        let words = unsafe { std::slice::from_raw_parts(addr as *const u32, num_dw) };
        self.indirect_depth += 1;
        let result = self.run_ring(words, kind);
        self.indirect_depth -= 1;
        result
    }

    /// Lowers the current register state into a `PipelineKey` and
    /// resolves it against the pipeline cache. With no backend bound
    /// this only exercises the cache bookkeeping (`create` builds a
    /// null `vk::Pipeline`); a real render backend supplies the
    /// `create` closure's shader-module/render-pass wiring.
    fn draw(&mut self, kind: RingKind) -> GpuResult<()> {
        log::verbose!("command processor: draw packet on {:?} ring", kind);
        let (vs_shader, ps_shader) = self.regs.shader_hashes();
        let state = &self.regs.state;
        let key = PipelineKey {
            render_pass_id: 0,
            vertex_shader: vs_shader,
            pixel_shader: ps_shader,
            viewport_scale: [state.viewport_xscale[0], 0, 0],
            viewport_offset: [0; 3],
            scissor_ltrb: [0; 4],
            topology: 0,
            color_mask: state.color_info[0],
            cull_front: false,
            cull_back: false,
            depth_test_enable: state.depth_control & 0x1 != 0,
            depth_write_enable: state.depth_control & 0x2 != 0,
            depth_compare_op: (state.depth_control >> 4) & 0x7,
            depth_bounds_test_enable: state.depth_control & 0x4 != 0,
            stencil_test_enable: state.depth_control & 0x1 != 0,
            color_srcblend: (state.blend_control[0] & 0x1f) as u8,
            color_comb_fcn: ((state.blend_control[0] >> 5) & 0x7) as u8,
            color_destblend: ((state.blend_control[0] >> 8) & 0x1f) as u8,
            alpha_srcblend: ((state.blend_control[0] >> 16) & 0x1f) as u8,
            alpha_comb_fcn: ((state.blend_control[0] >> 21) & 0x7) as u8,
            alpha_destblend: ((state.blend_control[0] >> 24) & 0x1f) as u8,
            separate_alpha_blend: state.blend_control[0] & 0x20_0000 != 0,
            blend_enable: state.blend_control[0] & 0x1 != 0,
        };
        self.pipeline_cache.get_or_create(key, || vk::Pipeline::null());
        Ok(())
    }

    /// `cp_op_acquire_mem`: only the cache-action bitfield
    /// combinations actually observed in practice are handled; an
    /// unrecognised combination aborts rather than attempting to
    /// generalise a meaning for it.
    fn acquire_mem(&mut self, body: &[u32]) -> GpuResult<()> {
        if body.is_empty() {
            return Err(GpuError::RING_OVERRUN);
        }
        let cache_action = body[0] & 0x7fff_ffff;
        match cache_action {
            0x02c4_0040 | 0x02c4_3fc0 | 0x02c4_7fc0 => {
                log::debug!("acquire_mem: render texture barrier + write back ({:#x})", cache_action);
            }
            0x0200_3fc0 => {
                log::debug!("acquire_mem: render texture barrier ({:#x})", cache_action);
            }
            0x00c4_0000 => {
                log::debug!("acquire_mem: memory barrier + write back");
            }
            0x0040_0000 => {
                log::debug!("acquire_mem: invalidate L1");
            }
            _ => {
                log::error!("acquire_mem: unrecognised cache_action {:#x}", cache_action);
                return Err(GpuError::UNKNOWN_CACHE_ACTION);
            }
        }
        Ok(())
    }

    /// `GraphicsRunDingDong` on the graphics ring.
    pub fn ding_dong_graphics(&self, offset_dw: u32) {
        self.de_sync.ding_dong(offset_dw);
    }

    /// `GraphicsRunMapComputeQueue`: registers a compute ring at a
    /// free `(pipe_id, queue_id)` slot and returns its ring id.
    pub fn map_compute_queue(&mut self, pipe_id: u32, queue_id: u32) -> GpuResult<u32> {
        let slot = self
            .compute_rings
            .iter()
            .position(|r| r.is_none())
            .ok_or(GpuError::RING_OVERRUN)?;
        self.compute_rings[slot] = Some(ComputeRing {
            pipe_id,
            queue_id,
            sync: RingSync::new(),
            buffers: CommandBufferPool::new(3),
        });
        Ok(slot as u32)
    }

    pub fn unmap_compute_queue(&mut self, ring_id: u32) {
        if let Some(slot) = self.compute_rings.get_mut(ring_id as usize) {
            *slot = None;
        }
    }

    /// `GraphicsRunDingDong` on a compute ring.
    pub fn ding_dong_compute(&self, ring_id: u32, offset_dw: u32) {
        if let Some(Some(ring)) = self.compute_rings.get(ring_id as usize) {
            ring.sync.ding_dong(offset_dw);
        }
    }

    pub fn submit_compute(&mut self, ring_id: u32, words: &[u32]) -> GpuResult<()> {
        self.run_ring(words, RingKind::Compute(ring_id))
    }

    pub fn frame_num(&self) -> u32 {
        self.frame_num
    }

    pub fn submits_allowed(&self) -> bool {
        self.submits_allowed
    }

    pub fn set_submits_allowed(&mut self, allowed: bool) {
        self.submits_allowed = allowed;
    }

    pub fn buffer_init(&mut self) -> Option<usize> {
        self.buffers.buffer_init()
    }

    /// Resident compute pipelines. The PM4 decode table has no
    /// dedicated dispatch opcode yet (compute shaders are scheduled
    /// through the separate kernel event queue path), so this cache
    /// is populated by a render backend directly rather than from
    /// `dispatch`.
    pub fn compute_pipeline_cache(&mut self) -> &mut PipelineCache<ComputePipelineKey> {
        &mut self.compute_pipeline_cache
    }

    pub fn flush(&mut self, idx: usize) -> GpuResult<()> {
        self.buffers.flush(idx)
    }

    pub fn wait_done(&mut self, idx: usize) -> GpuResult<()> {
        self.buffers.wait_done(idx)
    }

    /// Attaches a real Vulkan backend to the graphics ring's command
    /// buffer pool; see `CommandBufferPool::bind_backend`.
    pub fn bind_backend(&mut self, device: Device, queue: vk::Queue, command_buffers: Vec<vk::CommandBuffer>, fences: Vec<vk::Fence>) {
        self.buffers.bind_backend(device, queue, command_buffers, fences);
    }
}

impl Default for CommandProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum RingKind {
    De,
    Ce,
    Compute(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm4::make_type3_header;

    #[test]
    fn submit_routes_context_reg_writes() {
        let mut cp = CommandProcessor::new();
        let draw = [make_type3_header(Opcode::SetContextReg, 2), 0x200, 0x7];
        cp.submit(&draw, &[]).unwrap();
        assert_eq!(cp.regs.context_reg(0x200), 0x7);
    }

    #[test]
    fn acquire_mem_allows_known_cache_action() {
        let mut cp = CommandProcessor::new();
        let draw = [make_type3_header(Opcode::AcquireMem, 6), 0x02c40040, 0, 0, 0x1000, 0, 10];
        cp.submit(&draw, &[]).unwrap();
    }

    #[test]
    fn acquire_mem_rejects_unknown_cache_action() {
        let mut cp = CommandProcessor::new();
        let draw = [make_type3_header(Opcode::AcquireMem, 6), 0xdead_beef & 0x7fff_ffff, 0, 0, 0x1000, 0, 10];
        assert!(cp.submit(&draw, &[]).is_err());
    }

    #[test]
    fn map_compute_queue_assigns_distinct_slots() {
        let mut cp = CommandProcessor::new();
        let a = cp.map_compute_queue(0, 0).unwrap();
        let b = cp.map_compute_queue(0, 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unmap_frees_slot_for_reuse() {
        let mut cp = CommandProcessor::new();
        let id = cp.map_compute_queue(1, 0).unwrap();
        cp.unmap_compute_queue(id);
        let again = cp.map_compute_queue(1, 0).unwrap();
        assert_eq!(id, again);
    }

    #[test]
    fn buffer_pool_round_robins_and_blocks_when_full() {
        let mut pool = CommandBufferPool::new(2);
        let a = pool.buffer_init().unwrap();
        let b = pool.buffer_init().unwrap();
        assert!(pool.buffer_init().is_none());
        pool.wait_done(a).unwrap();
        assert!(pool.buffer_init().is_some());
        pool.wait_done(b).unwrap();
    }

    #[test]
    fn draw_packet_populates_pipeline_cache() {
        let mut cp = CommandProcessor::new();
        let draw = [make_type3_header(Opcode::DrawIndexAuto, 0)];
        cp.submit(&draw, &[]).unwrap();
        assert_eq!(cp.pipeline_cache.len(), 1);
    }

    #[test]
    fn indirect_buffer_chases_guest_memory() {
        let mut cp = CommandProcessor::new();
        let inner: Vec<u32> = vec![make_type3_header(Opcode::SetContextReg, 2), 0x200, 0x55];
        let addr = inner.as_ptr() as u64;
        let ib = [
            make_type3_header(Opcode::IndirectBuffer, 3),
            addr as u32,
            (addr >> 32) as u32,
            inner.len() as u32,
        ];
        cp.submit(&ib, &[]).unwrap();
        assert_eq!(cp.regs.context_reg(0x200), 0x55);
    }

    #[test]
    fn ce_counter_increments_independently_of_de() {
        let mut cp = CommandProcessor::new();
        let consts = [make_type3_header(Opcode::IncrementCeCounter, 0)];
        cp.submit(&[], &consts).unwrap();
        assert_eq!(cp.ce_counter, 1);
        assert_eq!(cp.de_counter, 0);
    }

    #[test]
    fn event_write_eop_writes_guest_memory() {
        let mut cp = CommandProcessor::new();
        let mut dest: u64 = 0;
        let addr = &mut dest as *mut u64 as u64;
        let body = [
            make_type3_header(Opcode::EventWriteEop, 5),
            0,
            addr as u32,
            (addr >> 32) as u32 & 0xffff,
            0xbeef,
            0,
        ];
        cp.submit(&body, &[]).unwrap();
        assert_eq!(dest, 0xbeef);
    }
}
