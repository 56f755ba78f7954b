// The context-register file a SET_CONTEXT_REG/SET_SH_REG/SET_UCONFIG_REG
// packet writes into, plus the subset of offsets that have a dedicated
// handler because the render engine needs to react immediately rather
// than just remember the raw value.
//
// Austin Shafer - 2024
use std::collections::HashMap;

use utils::log;

/// Register-space sizes. Context registers are the largest block;
/// shader (SH) and user-config registers get their own flat arrays so
/// an SH write can never alias a context-register offset.
const CONTEXT_REG_COUNT: usize = 0x400;
const SH_REG_COUNT: usize = 0x400;
const UCONFIG_REG_COUNT: usize = 0x400;

/// A handler invoked the instant its offset is written, mirroring the
/// original's per-offset `g_hw_ctx_func` table. Offsets with no
/// handler are simply stored for later readback by the draw path.
pub type CtxHandler = fn(&mut RenderState, offset: u32, value: u32);

pub const CB_COLOR0_BASE: u32 = 0x0318;
pub const CB_COLOR0_INFO: u32 = 0x0319;
pub const CB_COLOR_STRIDE_SLOT: u32 = 15;
pub const CB_BLEND0_CONTROL: u32 = 0x01e0;
pub const PA_SC_VPORT_ZMIN_0: u32 = 0x0282;
pub const PA_CL_VPORT_XSCALE: u32 = 0x02b0;
pub const DB_DEPTH_CONTROL: u32 = 0x0200;
pub const DB_Z_INFO: u32 = 0x0010;

/// Render-target/viewport/depth state the dispatch handlers fold
/// into, read by the render engine when it lowers a draw packet.
#[derive(Default, Debug, Clone)]
pub struct RenderState {
    pub color_base: [u32; 8],
    pub color_info: [u32; 8],
    pub blend_control: [u32; 8],
    pub viewport_zmin: [u32; 16],
    pub viewport_zmax: [u32; 16],
    pub viewport_xscale: [u32; 16],
    pub depth_control: u32,
    pub depth_info: u32,
}

fn hw_ctx_set_render_target(state: &mut RenderState, offset: u32, value: u32) {
    let slot = ((offset - CB_COLOR0_BASE) / CB_COLOR_STRIDE_SLOT) as usize;
    if slot < state.color_base.len() {
        state.color_base[slot] = value;
    }
}

fn hw_ctx_set_color_info(state: &mut RenderState, offset: u32, value: u32) {
    let slot = ((offset - CB_COLOR0_INFO) / CB_COLOR_STRIDE_SLOT) as usize;
    if slot < state.color_info.len() {
        state.color_info[slot] = value;
    }
}

fn hw_ctx_set_blend_control(state: &mut RenderState, offset: u32, value: u32) {
    let slot = (offset - CB_BLEND0_CONTROL) as usize;
    if slot < state.blend_control.len() {
        state.blend_control[slot] = value;
    }
}

fn hw_ctx_set_viewport_z(state: &mut RenderState, offset: u32, value: u32) {
    let idx = ((offset - PA_SC_VPORT_ZMIN_0) / 2) as usize;
    if idx >= state.viewport_zmin.len() {
        return;
    }
    if (offset - PA_SC_VPORT_ZMIN_0) % 2 == 0 {
        state.viewport_zmin[idx] = value;
    } else {
        state.viewport_zmax[idx] = value;
    }
}

fn hw_ctx_set_viewport_scale_offset(state: &mut RenderState, offset: u32, value: u32) {
    let idx = ((offset - PA_CL_VPORT_XSCALE) / 6) as usize;
    if idx < state.viewport_xscale.len() {
        state.viewport_xscale[idx] = value;
    }
}

fn hw_ctx_set_depth_control(state: &mut RenderState, _offset: u32, value: u32) {
    state.depth_control = value;
}

fn hw_ctx_set_z_info(state: &mut RenderState, _offset: u32, value: u32) {
    state.depth_info = value;
}

fn build_handler_table() -> HashMap<u32, CtxHandler> {
    let mut table: HashMap<u32, CtxHandler> = HashMap::new();
    for slot in 0..8u32 {
        table.insert(CB_COLOR0_BASE + slot * CB_COLOR_STRIDE_SLOT, hw_ctx_set_render_target);
        table.insert(CB_COLOR0_INFO + slot * CB_COLOR_STRIDE_SLOT, hw_ctx_set_color_info);
        table.insert(CB_BLEND0_CONTROL + slot, hw_ctx_set_blend_control);
    }
    for viewport in 0..16u32 {
        table.insert(PA_SC_VPORT_ZMIN_0 + viewport * 2, hw_ctx_set_viewport_z);
        table.insert(PA_SC_VPORT_ZMIN_0 + viewport * 2 + 1, hw_ctx_set_viewport_z);
        table.insert(PA_CL_VPORT_XSCALE + viewport * 6, hw_ctx_set_viewport_scale_offset);
    }
    table.insert(DB_DEPTH_CONTROL, hw_ctx_set_depth_control);
    table.insert(DB_Z_INFO, hw_ctx_set_z_info);
    table
}

/// Backs `IT_SET_CONTEXT_REG`/`IT_SET_SH_REG`/`IT_SET_UCONFIG_REG`: a
/// flat register file per space plus the offset-keyed handler table
/// for the subset of registers the render engine must react to
/// immediately.
pub struct ContextRegisters {
    context: Vec<u32>,
    sh: Vec<u32>,
    uconfig: Vec<u32>,
    handlers: HashMap<u32, CtxHandler>,
    pub state: RenderState,
}

impl ContextRegisters {
    pub fn new() -> Self {
        Self {
            context: vec![0; CONTEXT_REG_COUNT],
            sh: vec![0; SH_REG_COUNT],
            uconfig: vec![0; UCONFIG_REG_COUNT],
            handlers: build_handler_table(),
            state: RenderState::default(),
        }
    }

    pub fn set_context_reg(&mut self, offset: u32, values: &[u32]) {
        for (i, &value) in values.iter().enumerate() {
            let reg = offset + i as u32;
            if let Some(slot) = self.context.get_mut(reg as usize) {
                *slot = value;
            } else {
                log::debug!("set_context_reg: offset {:#x} out of range", reg);
                continue;
            }
            if let Some(handler) = self.handlers.get(&reg) {
                handler(&mut self.state, reg, value);
            }
        }
    }

    pub fn set_sh_reg(&mut self, offset: u32, values: &[u32]) {
        for (i, &value) in values.iter().enumerate() {
            if let Some(slot) = self.sh.get_mut(offset as usize + i) {
                *slot = value;
            }
        }
    }

    pub fn set_uconfig_reg(&mut self, offset: u32, values: &[u32]) {
        for (i, &value) in values.iter().enumerate() {
            if let Some(slot) = self.uconfig.get_mut(offset as usize + i) {
                *slot = value;
            }
        }
    }

    pub fn context_reg(&self, offset: u32) -> u32 {
        self.context.get(offset as usize).copied().unwrap_or(0)
    }

    /// Stand-in for `ShaderGetIdVS`/`ShaderGetIdPS`: this port doesn't
    /// recompile shader binaries, so the pipeline cache keys on a hash
    /// of the SH register file instead of a real shader identity,
    /// split in half between the vertex and pixel stage's registers.
    pub fn shader_hashes(&self) -> (u64, u64) {
        let mid = self.sh.len() / 2;
        let vs_bytes: Vec<u8> = self.sh[..mid].iter().flat_map(|w| w.to_le_bytes()).collect();
        let ps_bytes: Vec<u8> = self.sh[mid..].iter().flat_map(|w| w.to_le_bytes()).collect();
        (xxhash_rust::xxh3::xxh3_64(&vs_bytes), xxhash_rust::xxh3::xxh3_64(&ps_bytes))
    }
}

impl Default for ContextRegisters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_target_base_routes_to_slot() {
        let mut regs = ContextRegisters::new();
        regs.set_context_reg(CB_COLOR0_BASE + CB_COLOR_STRIDE_SLOT * 2, &[0xdead_beef]);
        assert_eq!(regs.state.color_base[2], 0xdead_beef);
        assert_eq!(regs.context_reg(CB_COLOR0_BASE + CB_COLOR_STRIDE_SLOT * 2), 0xdead_beef);
    }

    #[test]
    fn depth_control_updates_render_state() {
        let mut regs = ContextRegisters::new();
        regs.set_context_reg(DB_DEPTH_CONTROL, &[0x1]);
        assert_eq!(regs.state.depth_control, 0x1);
    }

    #[test]
    fn unhandled_offset_is_still_stored() {
        let mut regs = ContextRegisters::new();
        regs.set_context_reg(0x100, &[0x42]);
        assert_eq!(regs.context_reg(0x100), 0x42);
    }
}
