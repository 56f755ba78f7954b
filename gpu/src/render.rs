// The render engine's three caches: pipelines (random eviction once
// full), descriptor sets (pool doubling, eager invalidation) and
// framebuffers (dummy color-attachment synthesis for depth-only
// passes).
//
// Austin Shafer - 2024
use std::collections::HashMap;
use std::hash::Hash;

use ash::vk::Handle;
use ash::{vk, Device};

use utils::log;

use crate::error::{GpuError, GpuResult};

/// Default descriptor-pool batch size.
const POOL_SIZE: u32 = 4;

/// Hard cap on resident pipelines; once hit, `PipelineCache::get`
/// evicts one at random rather than tracking real LRU/usage stats,
/// since a miss just costs one pipeline rebuild.
pub const MAX_PIPELINES: usize = 16;

/// A small xorshift so eviction is deterministic across runs without
/// pulling in a `rand` dependency this workspace doesn't otherwise need.
struct SplitMix64(u64);

impl SplitMix64 {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}

/// A fully-resolved graphics pipeline description, hashed to form the
/// cache key: the fixed-function state a `GraphicsRender` draw call
/// depends on. Mirrors `GraphicsRender.cpp`'s `PipelineCache::Pipeline`
/// (`render_pass_id`/`vs_shader_id`/`ps_shader_id`) plus its
/// `PipelineParameters` fixed-function block; float fields are stored
/// as their bit patterns so the key can derive `Eq`/`Hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub render_pass_id: u64,
    pub vertex_shader: u64,
    pub pixel_shader: u64,
    pub viewport_scale: [u32; 3],
    pub viewport_offset: [u32; 3],
    pub scissor_ltrb: [i32; 4],
    pub topology: u32,
    pub color_mask: u32,
    pub cull_front: bool,
    pub cull_back: bool,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: u32,
    pub depth_bounds_test_enable: bool,
    pub stencil_test_enable: bool,
    pub color_srcblend: u8,
    pub color_comb_fcn: u8,
    pub color_destblend: u8,
    pub alpha_srcblend: u8,
    pub alpha_comb_fcn: u8,
    pub alpha_destblend: u8,
    pub separate_alpha_blend: bool,
    pub blend_enable: bool,
}

/// A compute pipeline description: just the shader id, since compute
/// dispatch carries no fixed-function rasterizer/blend state. Mirrors
/// `PipelineCache::CreatePipeline(ShaderComputeInputInfo*, ...)`'s
/// separate, smaller key from the graphics path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputePipelineKey {
    pub cs_shader_id: u64,
}

/// One resident `vk::Pipeline` cache, evicting at random once full
/// rather than tracking real LRU/usage stats since a miss just costs
/// one pipeline rebuild. Generic over the key so the graphics and
/// compute paths get independent caches without duplicating the
/// eviction machinery.
pub struct PipelineCache<K> {
    entries: HashMap<K, vk::Pipeline>,
    order: Vec<K>,
    rng: SplitMix64,
}

impl<K: Eq + Hash + Clone> PipelineCache<K> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            rng: SplitMix64(0x1234_5678_9abc_def0),
        }
    }

    /// Looks up `key`, building via `create` on a miss. Evicts a
    /// random resident entry first if the cache is full; the victim's
    /// `vk::Pipeline` is returned to the caller so it can be destroyed
    /// against the device.
    pub fn get_or_create<F>(&mut self, key: K, create: F) -> (vk::Pipeline, Option<vk::Pipeline>)
    where
        F: FnOnce() -> vk::Pipeline,
    {
        if let Some(&pipeline) = self.entries.get(&key) {
            return (pipeline, None);
        }

        let mut evicted = None;
        if self.entries.len() >= MAX_PIPELINES {
            let victim_idx = (self.rng.next() as usize) % self.order.len();
            let victim_key = self.order.swap_remove(victim_idx);
            evicted = self.entries.remove(&victim_key);
            log::debug!("pipeline cache full, evicting one entry at random");
        }

        let pipeline = create();
        self.entries.insert(key.clone(), pipeline);
        self.order.push(key);
        (pipeline, evicted)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for PipelineCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// A pool of descriptor pools, growing by whole `POOL_SIZE`-set
/// batches, generalized to an arbitrary descriptor type/count per
/// allocation.
pub struct DescriptorCache {
    layout: vk::DescriptorSetLayout,
    ty: vk::DescriptorType,
    pools: Vec<vk::DescriptorPool>,
    capacities: Vec<u32>,
    live: HashMap<u64, (usize, vk::DescriptorSet)>,
}

impl DescriptorCache {
    pub fn new(layout: vk::DescriptorSetLayout, ty: vk::DescriptorType) -> Self {
        Self {
            layout,
            ty,
            pools: Vec::new(),
            capacities: Vec::new(),
            live: HashMap::new(),
        }
    }

    fn add_pool(&mut self, device: &Device) -> GpuResult<usize> {
        let sizes = [vk::DescriptorPoolSize::builder().ty(self.ty).descriptor_count(POOL_SIZE).build()];
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(POOL_SIZE);

        let pool = unsafe { device.create_descriptor_pool(&info, None) }
            .map_err(|_| GpuError::COULD_NOT_CREATE_DESCRIPTOR_POOL)?;

        self.pools.push(pool);
        self.capacities.push(0);
        Ok(self.pools.len() - 1)
    }

    fn ideal_pool(&mut self, device: &Device) -> GpuResult<usize> {
        for (i, cap) in self.capacities.iter().enumerate() {
            if *cap < POOL_SIZE {
                return Ok(i);
            }
        }
        self.add_pool(device)
    }

    /// Looks up a cached descriptor set for `key`, allocating a fresh
    /// one from whichever pool has room if it's not already cached.
    pub fn get_or_allocate(&mut self, device: &Device, key: u64) -> GpuResult<vk::DescriptorSet> {
        if let Some((_, set)) = self.live.get(&key) {
            return Ok(*set);
        }
        if self.pools.is_empty() {
            self.add_pool(device)?;
        }
        let pool_idx = self.ideal_pool(device)?;

        let layouts = [self.layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pools[pool_idx])
            .set_layouts(&layouts);

        let sets = unsafe { device.allocate_descriptor_sets(&info) }.map_err(|_| GpuError::COULD_NOT_CREATE_DESCRIPTOR_POOL)?;
        self.capacities[pool_idx] += 1;
        let set = sets[0];
        self.live.insert(key, (pool_idx, set));
        Ok(set)
    }

    /// Eager invalidation: the moment backing memory a descriptor set
    /// points at changes, the set is freed immediately rather than
    /// waiting for an LRU sweep, since a stale sampler binding is a
    /// correctness bug, not a perf one.
    pub fn invalidate(&mut self, device: &Device, key: u64) {
        if let Some((pool_idx, set)) = self.live.remove(&key) {
            unsafe {
                let _ = device.free_descriptor_sets(self.pools[pool_idx], &[set]);
            }
            self.capacities[pool_idx] = self.capacities[pool_idx].saturating_sub(1);
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }
}

/// A framebuffer keyed by its color/depth attachment identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub color_views: Vec<u64>,
    pub depth_view: Option<u64>,
    pub width: u32,
    pub height: u32,
}

pub struct FramebufferCache {
    entries: HashMap<FramebufferKey, vk::Framebuffer>,
    /// A 1x1 dummy color attachment synthesized for depth-only render
    /// passes, since every supported render pass layout expects at
    /// least one color attachment slot.
    dummy_color_view: Option<vk::ImageView>,
}

impl FramebufferCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            dummy_color_view: None,
        }
    }

    pub fn set_dummy_color_view(&mut self, view: vk::ImageView) {
        self.dummy_color_view = Some(view);
    }

    /// Builds a `FramebufferKey` for a depth-only pass, substituting
    /// the synthesized dummy color view so the key still has the
    /// shape every other framebuffer has.
    pub fn depth_only_key(&self, depth_view: u64, width: u32, height: u32) -> GpuResult<FramebufferKey> {
        let dummy = self.dummy_color_view.ok_or(GpuError::COULD_NOT_CREATE_FRAMEBUFFER)?;
        Ok(FramebufferKey {
            color_views: vec![dummy.as_raw()],
            depth_view: Some(depth_view),
            width,
            height,
        })
    }

    pub fn get_or_create<F>(&mut self, key: FramebufferKey, create: F) -> GpuResult<vk::Framebuffer>
    where
        F: FnOnce() -> GpuResult<vk::Framebuffer>,
    {
        if let Some(&fb) = self.entries.get(&key) {
            return Ok(fb);
        }
        let fb = create()?;
        self.entries.insert(key, fb);
        Ok(fb)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for FramebufferCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `RenderDepthInfo`/`RenderColorInfo`: the draw-time attachment
/// description the command processor's register file lowers into
/// before handing off to the framebuffer/pipeline caches.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderDepthInfo {
    pub vaddr: u64,
    pub width: u32,
    pub height: u32,
    pub z_format: u32,
    pub tile_mode_index: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderColorInfo {
    pub vaddr: u64,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub tile_mode_index: u32,
}

/// Byte sizes (and scanout pitch) of a depth/stencil/htile allocation
/// for a given surface configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepthSize {
    pub depth_size: u32,
    pub htile_size: u32,
    pub stencil_size: u32,
    pub pitch: u32,
}

struct DepthSizeEntry {
    width: u32,
    height: u32,
    z_format: u32,
    stencil_format: u32,
    htile: bool,
    pitch: u32,
    stencil_size: u32,
    htile_size: u32,
    depth_size: u32,
}

/// `TileGetDepthSize`'s lookup table for the two standard scanout
/// resolutions, non-NEO. Configurations outside this table are not
/// yet supported by the tiler and are rejected rather than guessed at.
const DEPTH_SIZES_BASE: &[DepthSizeEntry] = &[
    DepthSizeEntry { width: 1920, height: 1080, z_format: 3, stencil_format: 0, htile: true, pitch: 2048, stencil_size: 0, htile_size: 196608, depth_size: 9437184 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 3, stencil_format: 0, htile: false, pitch: 2048, stencil_size: 0, htile_size: 0, depth_size: 9437184 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 3, stencil_format: 0, htile: true, pitch: 1280, stencil_size: 0, htile_size: 98304, depth_size: 3932160 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 3, stencil_format: 0, htile: false, pitch: 1280, stencil_size: 0, htile_size: 0, depth_size: 3932160 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 1, stencil_format: 0, htile: true, pitch: 2048, stencil_size: 0, htile_size: 196608, depth_size: 4718592 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 1, stencil_format: 0, htile: false, pitch: 2048, stencil_size: 0, htile_size: 0, depth_size: 4718592 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 1, stencil_format: 0, htile: true, pitch: 1280, stencil_size: 0, htile_size: 98304, depth_size: 1966080 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 1, stencil_format: 0, htile: false, pitch: 1280, stencil_size: 0, htile_size: 0, depth_size: 1966080 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 0, stencil_format: 1, htile: true, pitch: 2048, stencil_size: 2359296, htile_size: 196608, depth_size: 0 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 0, stencil_format: 1, htile: false, pitch: 2048, stencil_size: 2359296, htile_size: 0, depth_size: 0 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 0, stencil_format: 1, htile: true, pitch: 1280, stencil_size: 983040, htile_size: 98304, depth_size: 0 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 0, stencil_format: 1, htile: false, pitch: 1280, stencil_size: 983040, htile_size: 0, depth_size: 0 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 3, stencil_format: 1, htile: true, pitch: 2048, stencil_size: 2359296, htile_size: 196608, depth_size: 9437184 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 3, stencil_format: 1, htile: false, pitch: 2048, stencil_size: 2359296, htile_size: 0, depth_size: 9437184 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 3, stencil_format: 1, htile: true, pitch: 1280, stencil_size: 983040, htile_size: 98304, depth_size: 3932160 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 3, stencil_format: 1, htile: false, pitch: 1280, stencil_size: 983040, htile_size: 0, depth_size: 3932160 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 1, stencil_format: 1, htile: true, pitch: 2048, stencil_size: 2359296, htile_size: 196608, depth_size: 4718592 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 1, stencil_format: 1, htile: false, pitch: 2048, stencil_size: 2359296, htile_size: 0, depth_size: 4718592 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 1, stencil_format: 1, htile: true, pitch: 1280, stencil_size: 983040, htile_size: 98304, depth_size: 1966080 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 1, stencil_format: 1, htile: false, pitch: 1280, stencil_size: 983040, htile_size: 0, depth_size: 1966080 },
];

/// Same table for the Neo (boosted) console's larger tile pitches.
const DEPTH_SIZES_NEO: &[DepthSizeEntry] = &[
    DepthSizeEntry { width: 1920, height: 1080, z_format: 3, stencil_format: 0, htile: true, pitch: 1920, stencil_size: 0, htile_size: 196608, depth_size: 8847360 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 3, stencil_format: 0, htile: false, pitch: 1920, stencil_size: 0, htile_size: 0, depth_size: 8847360 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 3, stencil_format: 0, htile: true, pitch: 1280, stencil_size: 0, htile_size: 131072, depth_size: 3932160 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 3, stencil_format: 0, htile: false, pitch: 1280, stencil_size: 0, htile_size: 0, depth_size: 3932160 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 1, stencil_format: 0, htile: true, pitch: 2048, stencil_size: 0, htile_size: 196608, depth_size: 4718592 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 1, stencil_format: 0, htile: false, pitch: 2048, stencil_size: 0, htile_size: 0, depth_size: 4718592 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 1, stencil_format: 0, htile: true, pitch: 1280, stencil_size: 0, htile_size: 131072, depth_size: 1966080 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 1, stencil_format: 0, htile: false, pitch: 1280, stencil_size: 0, htile_size: 0, depth_size: 1966080 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 0, stencil_format: 1, htile: true, pitch: 2048, stencil_size: 2359296, htile_size: 196608, depth_size: 0 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 0, stencil_format: 1, htile: false, pitch: 2048, stencil_size: 2359296, htile_size: 0, depth_size: 0 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 0, stencil_format: 1, htile: true, pitch: 1280, stencil_size: 983040, htile_size: 131072, depth_size: 0 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 0, stencil_format: 1, htile: false, pitch: 1280, stencil_size: 983040, htile_size: 0, depth_size: 0 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 3, stencil_format: 1, htile: true, pitch: 2048, stencil_size: 2359296, htile_size: 196608, depth_size: 9437184 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 3, stencil_format: 1, htile: false, pitch: 2048, stencil_size: 2359296, htile_size: 0, depth_size: 9437184 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 3, stencil_format: 1, htile: true, pitch: 1280, stencil_size: 983040, htile_size: 131072, depth_size: 3932160 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 3, stencil_format: 1, htile: false, pitch: 1280, stencil_size: 983040, htile_size: 0, depth_size: 3932160 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 1, stencil_format: 1, htile: true, pitch: 2048, stencil_size: 2359296, htile_size: 196608, depth_size: 4718592 },
    DepthSizeEntry { width: 1920, height: 1080, z_format: 1, stencil_format: 1, htile: false, pitch: 2048, stencil_size: 2359296, htile_size: 0, depth_size: 4718592 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 1, stencil_format: 1, htile: true, pitch: 1280, stencil_size: 983040, htile_size: 131072, depth_size: 1966080 },
    DepthSizeEntry { width: 1280, height: 720, z_format: 1, stencil_format: 1, htile: false, pitch: 1280, stencil_size: 983040, htile_size: 0, depth_size: 1966080 },
];

/// `TileGetDepthSize`: looks up a depth/stencil surface's encoded
/// allocation sizes and scanout pitch by its full configuration.
/// Unrecognised `(width, height, z_format, stencil_format, htile)`
/// tuples are reported rather than defaulted to a guessed size, since
/// a wrong size silently corrupts the object cache's hash ranges.
pub fn tile_get_depth_size(width: u32, height: u32, z_format: u32, stencil_format: u32, htile: bool, neo: bool) -> GpuResult<DepthSize> {
    let table = if neo { DEPTH_SIZES_NEO } else { DEPTH_SIZES_BASE };
    table
        .iter()
        .find(|e| e.width == width && e.height == height && e.z_format == z_format && e.stencil_format == stencil_format && e.htile == htile)
        .map(|e| DepthSize {
            depth_size: e.depth_size,
            htile_size: e.htile_size,
            stencil_size: e.stencil_size,
            pitch: e.pitch,
        })
        .ok_or(GpuError::UNSUPPORTED_TILE_MODE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(vertex_shader: u64, pixel_shader: u64) -> PipelineKey {
        PipelineKey {
            render_pass_id: 1,
            vertex_shader,
            pixel_shader,
            viewport_scale: [0; 3],
            viewport_offset: [0; 3],
            scissor_ltrb: [0; 4],
            topology: 0,
            color_mask: 0xf,
            cull_front: false,
            cull_back: false,
            depth_test_enable: true,
            depth_write_enable: true,
            depth_compare_op: 0,
            depth_bounds_test_enable: false,
            stencil_test_enable: false,
            color_srcblend: 0,
            color_comb_fcn: 0,
            color_destblend: 0,
            alpha_srcblend: 0,
            alpha_comb_fcn: 0,
            alpha_destblend: 0,
            separate_alpha_blend: false,
            blend_enable: false,
        }
    }

    #[test]
    fn pipeline_cache_reuses_existing_key() {
        let mut cache = PipelineCache::new();
        let key = test_key(1, 2);
        let (first, evicted) = cache.get_or_create(key, || vk::Pipeline::null());
        assert!(evicted.is_none());
        let (second, evicted2) = cache.get_or_create(key, || panic!("should not rebuild"));
        assert_eq!(first, second);
        assert!(evicted2.is_none());
    }

    #[test]
    fn pipeline_cache_evicts_once_full() {
        let mut cache = PipelineCache::new();
        for i in 0..MAX_PIPELINES {
            cache.get_or_create(test_key(i as u64, 0), || vk::Pipeline::null());
        }
        assert_eq!(cache.len(), MAX_PIPELINES);

        cache.get_or_create(test_key(999, 0), || vk::Pipeline::null());
        assert_eq!(cache.len(), MAX_PIPELINES);
    }

    #[test]
    fn compute_pipeline_cache_is_independent_of_graphics() {
        let mut cache = PipelineCache::new();
        let key = ComputePipelineKey { cs_shader_id: 7 };
        let (first, evicted) = cache.get_or_create(key, || vk::Pipeline::null());
        assert!(evicted.is_none());
        let (second, _) = cache.get_or_create(key, || panic!("should not rebuild"));
        assert_eq!(first, second);
    }

    #[test]
    fn tile_depth_size_known_mode() {
        let size = tile_get_depth_size(1280, 720, 3, 0, true, false).unwrap();
        assert_eq!(size.pitch, 1280);
        assert_eq!(size.depth_size, 3932160);
    }

    #[test]
    fn tile_depth_size_rejects_unknown_configuration() {
        assert_eq!(tile_get_depth_size(640, 480, 3, 0, true, false), Err(GpuError::UNSUPPORTED_TILE_MODE));
    }
}
