//! Decaying crowd density grid.
//!
//! The buffer is a downsampled copy of the frame (one cell per `cell_size`
//! pixels). Each processed frame first attenuates every cell, then stamps a
//! Gaussian kernel at every person centroid. Values stay within
//! `[0, max_intensity]` and drop to exactly zero once negligible.

use image::{Rgb, RgbImage};

use crate::crowd::{config::HeatmapSettings, data::PersonPosition};

/// Read-only view of the accumulated density.
pub(crate) struct HeatmapBuffer {
    width: usize,
    height: usize,
    cells: Vec<f32>,
}

impl HeatmapBuffer {
    #[cfg(test)]
    pub(crate) fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    #[cfg(test)]
    pub(crate) fn cells(&self) -> &[f32] {
        &self.cells
    }

    pub(crate) fn get(&self, x: usize, y: usize) -> f32 {
        self.cells[y * self.width + x]
    }

    pub(crate) fn peak(&self) -> f32 {
        self.cells.iter().copied().fold(0.0, f32::max)
    }
}

pub(crate) struct HeatmapAccumulator {
    settings: HeatmapSettings,
    frame_dims: (u32, u32),
    buffer: HeatmapBuffer,
    /// Row-major `(2r+1)^2` kernel weights.
    kernel: Vec<f32>,
}

impl HeatmapAccumulator {
    pub(crate) fn new(settings: HeatmapSettings, frame_dims: (u32, u32)) -> Self {
        let cell = settings.cell_size.max(1);
        let width = frame_dims.0.div_ceil(cell).max(1) as usize;
        let height = frame_dims.1.div_ceil(cell).max(1) as usize;
        Self {
            kernel: gaussian_kernel(settings.kernel_radius, settings.hit_intensity),
            settings,
            frame_dims,
            buffer: HeatmapBuffer {
                width,
                height,
                cells: vec![0.0; width * height],
            },
        }
    }

    /// Decay the grid, then add one kernel per position. Runs once per
    /// processed frame; decay applies even when `positions` is empty.
    pub(crate) fn accumulate(
        &mut self,
        positions: &[PersonPosition],
        frame_dims: (u32, u32),
    ) -> &HeatmapBuffer {
        if frame_dims != self.frame_dims {
            *self = Self::new(self.settings, frame_dims);
        }

        let floor = self.settings.negligible();
        for value in &mut self.buffer.cells {
            *value *= self.settings.decay_factor;
            if *value < floor {
                *value = 0.0;
            }
        }

        let cell = self.settings.cell_size.max(1) as f32;
        let radius = self.settings.kernel_radius as isize;
        let span = (2 * radius + 1) as usize;
        let (grid_w, grid_h) = (self.buffer.width as isize, self.buffer.height as isize);
        let max = self.settings.max_intensity;

        for position in positions {
            if !position.x.is_finite() || !position.y.is_finite() {
                continue;
            }
            let cx = ((position.x / cell).floor() as isize).clamp(0, grid_w - 1);
            let cy = ((position.y / cell).floor() as isize).clamp(0, grid_h - 1);
            for dy in -radius..=radius {
                let y = cy + dy;
                if y < 0 || y >= grid_h {
                    continue;
                }
                for dx in -radius..=radius {
                    let x = cx + dx;
                    if x < 0 || x >= grid_w {
                        continue;
                    }
                    let weight = self.kernel[((dy + radius) as usize) * span + (dx + radius) as usize];
                    if weight <= 0.0 {
                        continue;
                    }
                    let idx = (y * grid_w + x) as usize;
                    self.buffer.cells[idx] = (self.buffer.cells[idx] + weight).min(max);
                }
            }
        }

        &self.buffer
    }

    /// Blend the colour-mapped grid over `image` at the configured alpha.
    /// Leaves the buffer untouched.
    pub(crate) fn render(&self, image: &mut RgbImage) {
        let alpha = self.settings.alpha.clamp(0.0, 1.0);
        if alpha <= 0.0 || self.buffer.peak() <= 0.0 {
            return;
        }
        let cell = self.settings.cell_size.max(1);
        let max = self.settings.max_intensity;
        let (grid_w, grid_h) = (self.buffer.width as u32, self.buffer.height as u32);

        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let gx = (x / cell).min(grid_w - 1) as usize;
            let gy = (y / cell).min(grid_h - 1) as usize;
            let value = self.buffer.get(gx, gy);
            if value <= 0.0 {
                continue;
            }
            let overlay = jet(value / max);
            *pixel = blend(*pixel, overlay, alpha);
        }
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &HeatmapBuffer {
        &self.buffer
    }
}

fn gaussian_kernel(radius: u32, peak: f32) -> Vec<f32> {
    let r = radius as i32;
    let sigma = (radius as f32 / 2.0).max(0.5);
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut kernel = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
    for dy in -r..=r {
        for dx in -r..=r {
            let dist_sq = (dx * dx + dy * dy) as f32;
            if dist_sq > (r * r) as f32 {
                kernel.push(0.0);
            } else {
                kernel.push(peak * (-dist_sq / two_sigma_sq).exp());
            }
        }
    }
    kernel
}

/// Classic blue → cyan → yellow → red ramp for `t` in `[0, 1]`.
fn jet(t: f32) -> Rgb<u8> {
    let t = t.clamp(0.0, 1.0);
    let channel = |offset: f32| ((1.5 - (4.0 * t - offset).abs()).clamp(0.0, 1.0) * 255.0) as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

fn blend(base: Rgb<u8>, overlay: Rgb<u8>, alpha: f32) -> Rgb<u8> {
    let mix = |b: u8, o: u8| (b as f32 * (1.0 - alpha) + o as f32 * alpha).round() as u8;
    Rgb([
        mix(base[0], overlay[0]),
        mix(base[1], overlay[1]),
        mix(base[2], overlay[2]),
    ])
}
