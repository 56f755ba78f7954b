// Detiling: the GPU's macro/micro-tiled surface layouts reduced to a
// linear buffer the render engine (or a video-out consumer) can treat
// as a plain 2D image.
//
// Austin Shafer - 2024
use crate::asyncjob::AsyncJob;

fn int_log2(i: u32) -> u32 {
    31 - (i | 1).leading_zeros()
}

/// The 2D-tiled (`TileMode::TextureTiled`/`VideoOutTiled`) surface
/// addressing scheme: macro tiles assigned to banks/pipes, with a
/// `neo` (PS4 Pro) row that widens the pipe/bank counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tiler32 {
    pub macro_tile_height: u32,
    pub bank_height: u32,
    pub num_banks: u32,
    pub num_pipes: u32,
    pub padded_width: u32,
    pub padded_height: u32,
    pub pipe_bits: u32,
    pub bank_bits: u32,
}

impl Tiler32 {
    pub fn init(width: u32, height: u32, neo: bool) -> Self {
        let padded_height = match height {
            1080 => {
                if neo {
                    1152
                } else {
                    1088
                }
            }
            720 => 768,
            other => other,
        };

        Self {
            macro_tile_height: if neo { 128 } else { 64 },
            bank_height: if neo { 2 } else { 1 },
            num_banks: if neo { 8 } else { 16 },
            num_pipes: if neo { 16 } else { 8 },
            padded_width: width,
            padded_height,
            pipe_bits: if neo { 4 } else { 3 },
            bank_bits: if neo { 3 } else { 4 },
        }
    }

    pub fn element_index(x: u32, y: u32) -> u32 {
        let mut elem = 0u32;
        elem |= ((x >> 0) & 0x1) << 0;
        elem |= ((x >> 1) & 0x1) << 1;
        elem |= ((y >> 0) & 0x1) << 2;
        elem |= ((x >> 2) & 0x1) << 3;
        elem |= ((y >> 1) & 0x1) << 4;
        elem |= ((y >> 2) & 0x1) << 5;
        elem
    }

    pub fn pipe_index(x: u32, y: u32, neo: bool) -> u32 {
        let mut pipe = 0u32;
        pipe |= (((x >> 3) ^ (y >> 3) ^ (x >> 4)) & 0x1) << 0;
        pipe |= (((x >> 4) ^ (y >> 4)) & 0x1) << 1;
        pipe |= (((x >> 5) ^ (y >> 5)) & 0x1) << 2;
        if neo {
            pipe |= (((x >> 6) ^ (y >> 5)) & 0x1) << 3;
        }
        pipe
    }

    pub fn bank_index(x: u32, y: u32, bank_width: u32, bank_height: u32, num_banks: u32, num_pipes: u32) -> u32 {
        let x_shift_offset = int_log2(bank_width * num_pipes);
        let y_shift_offset = int_log2(bank_height.max(1));
        let xs = x >> x_shift_offset;
        let ys = y >> y_shift_offset;
        (xs ^ ys) & (num_banks.max(1) - 1)
    }
}

/// The 1D-tiled (thin, non-macro-tiled) addressing scheme: rows packed
/// serially into fixed-size micro tiles, no bank/pipe swizzle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tiler1d {
    pub micro_tile_width: u32,
    pub micro_tile_height: u32,
    pub padded_width: u32,
}

impl Tiler1d {
    pub fn init(width: u32, micro_tile_width: u32, micro_tile_height: u32) -> Self {
        let padded_width = (width + micro_tile_width - 1) / micro_tile_width * micro_tile_width;
        Self {
            micro_tile_width,
            micro_tile_height,
            padded_width,
        }
    }

    /// Offset of texel (x, y) within the detiled row-major buffer,
    /// given the surface's padded pitch.
    pub fn linear_offset(&self, x: u32, y: u32, bytes_per_element: u32) -> u64 {
        (y as u64 * self.padded_width as u64 + x as u64) * bytes_per_element as u64
    }
}

/// Drives the detiling of a video-out frame across two `AsyncJob`s,
/// splitting the image into top/bottom halves so both halves convert
/// concurrently -- this is the same top/bottom split the original
/// original keeps two dedicated job slots per `Tiler` instance for
/// exactly this).
pub struct VideoOutConverter {
    job_top: AsyncJob,
    job_bottom: AsyncJob,
}

impl VideoOutConverter {
    pub fn new() -> Self {
        Self {
            job_top: AsyncJob::new(),
            job_bottom: AsyncJob::new(),
        }
    }

    /// Converts `src` (tiled) into `dst` (linear), splitting the rows
    /// across the two background jobs and waiting for both.
    pub fn convert_tiled_to_linear<F>(&self, height: u32, convert_row_range: F)
    where
        F: Fn(u32, u32) + Send + Clone + 'static,
    {
        let mid = height / 2;
        let top = convert_row_range.clone();
        self.job_top.execute(move || top(0, mid));
        let bottom = convert_row_range;
        self.job_bottom.execute(move || bottom(mid, height));
        self.job_top.wait();
        self.job_bottom.wait();
    }
}

impl Default for VideoOutConverter {
    fn default() -> Self {
        Self::new()
    }
}

/// `TileGetVideoOutSize`: total byte size and row pitch for a video-out
/// surface of `width`x`height`, 32 bits per pixel.
pub fn tile_get_video_out_size(width: u32, height: u32, tiled: bool, neo: bool) -> (u32, u32) {
    const BYTES_PER_PIXEL: u32 = 4;
    if !tiled {
        let pitch = width * BYTES_PER_PIXEL;
        return (pitch * height, pitch);
    }
    let t = Tiler32::init(width, height, neo);
    let pitch = t.padded_width * BYTES_PER_PIXEL;
    (pitch * t.padded_height, pitch)
}

/// Mip levels of a tiled texture must be detiled one at a time, in
/// order, since each level's tiler parameters (padded dimensions)
/// depend on the previous level's rounding.
pub fn tile_get_texture_level_sizes(width: u32, height: u32, levels: u32, bytes_per_element: u32) -> Vec<u32> {
    let mut sizes = Vec::with_capacity(levels as usize);
    let mut w = width.max(1);
    let mut h = height.max(1);
    for _ in 0..levels {
        let tiler = Tiler1d::init(w, 8, 8);
        sizes.push(tiler.padded_width * h * bytes_per_element);
        w = (w / 2).max(1);
        h = (h / 2).max(1);
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiler32_init_matches_known_1080p_row() {
        let t = Tiler32::init(1920, 1080, false);
        assert_eq!(t.padded_height, 1088);
        assert_eq!(t.num_pipes, 8);
        let neo = Tiler32::init(1920, 1080, true);
        assert_eq!(neo.padded_height, 1152);
        assert_eq!(neo.num_pipes, 16);
    }

    #[test]
    fn element_index_is_a_bit_interleave() {
        assert_eq!(Tiler32::element_index(0, 0), 0);
        assert_eq!(Tiler32::element_index(1, 0), 1);
        assert_eq!(Tiler32::element_index(0, 1), 4);
    }

    #[test]
    fn tile_get_video_out_size_linear_vs_tiled() {
        let (linear_size, linear_pitch) = tile_get_video_out_size(1920, 1080, false, false);
        assert_eq!(linear_pitch, 1920 * 4);
        assert_eq!(linear_size, 1920 * 4 * 1080);

        let (tiled_size, _) = tile_get_video_out_size(1920, 1080, true, false);
        assert!(tiled_size >= linear_size);
    }

    #[test]
    fn mip_level_sizes_shrink_monotonically() {
        let sizes = tile_get_texture_level_sizes(256, 256, 4, 4);
        assert_eq!(sizes.len(), 4);
        assert!(sizes.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn video_out_converter_runs_both_halves() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let rows_done = Arc::new(AtomicU32::new(0));
        let conv = VideoOutConverter::new();
        let rd = rows_done.clone();
        conv.convert_tiled_to_linear(100, move |start, end| {
            rd.fetch_add(end - start, Ordering::SeqCst);
        });
        assert_eq!(rows_done.load(Ordering::SeqCst), 100);
    }
}
