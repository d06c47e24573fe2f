// src/cv/scalar.rs
#![allow(clippy::needless_range_loop)]

use crate::core::frame::PixelFormat;
use crate::cv::ComputerVision;
use crate::{ImageBuffer, Point2f};

/// Portable implementation of the Computer Vision operations.
pub struct ScalarCV;

impl ComputerVision for ScalarCV {
    /// Integer luma `(3R + 4G + B) >> 3`, the weighting used by the AR.js
    /// binding for every color layout.
    fn luma(src: &[u8], format: PixelFormat, dst: &mut [u8]) {
        let bpp = format.bytes_per_pixel();
        let Some((ro, go, bo)) = format.rgb_offsets() else {
            let n = dst.len().min(src.len());
            dst[..n].copy_from_slice(&src[..n]);
            return;
        };

        for (j, px) in src.chunks_exact(bpp).enumerate() {
            if j >= dst.len() {
                break;
            }
            let r = px[ro] as u32;
            let g = px[go] as u32;
            let b = px[bo] as u32;
            dst[j] = ((r + r + r + b + g + g + g + g) >> 3) as u8;
        }
    }

    fn threshold(src: &[u8], dst: &mut [u8], threshold: u8) {
        let len = src.len();
        let mut tab = [0u8; 256];

        // Build lookup table
        for i in 0..256 {
            tab[i] = if (i as u8) <= threshold { 0 } else { 255 };
        }

        for i in 0..len {
            dst[i] = tab[src[i] as usize];
        }
    }

    fn otsu(src: &[u8]) -> u8 {
        let len = src.len();
        let mut hist = [0u32; 256];
        let mut threshold = 0;
        let mut sum = 0.0;
        let mut sum_b = 0.0;
        let mut w_b = 0.0;
        let mut max = 0.0;

        for &pixel in src.iter() {
            hist[pixel as usize] += 1;
        }

        for i in 0..256 {
            sum += (hist[i] as f64) * (i as f64);
        }

        for i in 0..256 {
            w_b += hist[i] as f64;
            if w_b != 0.0 {
                let w_f = (len as f64) - w_b;
                if w_f == 0.0 {
                    break;
                }

                sum_b += (hist[i] as f64) * (i as f64);

                let mu = sum_b / w_b - (sum - sum_b) / w_f;
                let between = w_b * w_f * mu * mu;

                if between > max {
                    max = between;
                    threshold = i as u8;
                }
            }
        }

        threshold
    }

    fn median(src: &[u8]) -> u8 {
        if src.is_empty() {
            return 0;
        }
        let mut hist = [0usize; 256];
        for &pixel in src {
            hist[pixel as usize] += 1;
        }
        let half = (src.len() + 1) / 2;
        let mut acc = 0;
        for (value, &count) in hist.iter().enumerate() {
            acc += count;
            if acc >= half {
                return value as u8;
            }
        }
        255
    }

    fn stack_box_blur(src: &ImageBuffer, dst: &mut [u8], kernel_size: usize) {
        const STACK_BOX_BLUR_MULT: [u32; 16] = [
            1, 171, 205, 293, 57, 373, 79, 137, 241, 27, 391, 357, 41, 19, 283, 265,
        ];
        const STACK_BOX_BLUR_SHIFT: [u32; 16] =
            [0, 9, 10, 11, 9, 12, 10, 11, 12, 9, 13, 13, 10, 9, 13, 13];

        let kernel_size = kernel_size.min(15);
        let src_data = src.data;
        let height = src.height as usize;
        let width = src.width as usize;
        if width == 0 || height == 0 {
            return;
        }
        let height_minus_1 = height - 1;
        let width_minus_1 = width - 1;
        let size = kernel_size * 2 + 1;
        let radius = kernel_size + 1;
        let mult = STACK_BOX_BLUR_MULT[kernel_size];
        let shift = STACK_BOX_BLUR_SHIFT[kernel_size];

        let mut stack = [0u8; 31];

        // Horizontal pass
        for y in 0..height {
            let start = y * width;
            let color = src_data[start] as u32;
            let mut sum = (radius as u32) * color;

            let mut sp = 0;
            for _ in 0..radius {
                stack[sp] = color as u8;
                sp = (sp + 1) % size;
            }
            for i in 1..radius {
                let c = src_data[start + i.min(width_minus_1)];
                stack[sp] = c;
                sum += c as u32;
                sp = (sp + 1) % size;
            }

            let mut stack_start = 0;
            for x in 0..width {
                dst[start + x] = ((sum * mult) >> shift) as u8;

                let p = start + (x + radius).min(width_minus_1);
                sum -= stack[stack_start] as u32;
                let c = src_data[p];
                sum += c as u32;

                stack[stack_start] = c;
                stack_start = (stack_start + 1) % size;
            }
        }

        // Vertical pass
        for x in 0..width {
            let color = dst[x] as u32;
            let mut sum = (radius as u32) * color;

            let mut sp = 0;
            for _ in 0..radius {
                stack[sp] = color as u8;
                sp = (sp + 1) % size;
            }
            for i in 1..radius {
                let c = dst[x + i.min(height_minus_1) * width];
                stack[sp] = c;
                sum += c as u32;
                sp = (sp + 1) % size;
            }

            let mut stack_start = 0;
            for y in 0..height {
                dst[x + y * width] = ((sum * mult) >> shift) as u8;

                let p = x + (y + radius).min(height_minus_1) * width;
                sum -= stack[stack_start] as u32;
                let c = dst[p];
                sum += c as u32;

                stack[stack_start] = c;
                stack_start = (stack_start + 1) % size;
            }
        }
    }

    fn adaptive_threshold(
        src: &ImageBuffer,
        dst: &mut [u8],
        kernel_size: usize,
        threshold: u8,
        bright_foreground: bool,
    ) {
        let src_data = src.data;
        let len = src_data.len();
        let mut tab = [0u8; 768];

        Self::stack_box_blur(src, dst, kernel_size);

        // Indexed by `src - mean + 255`, covering -255..=510.
        for i in 0..768 {
            let val = i as i32 - 255;
            let hit = if bright_foreground {
                val >= threshold as i32
            } else {
                val <= -(threshold as i32)
            };
            tab[i] = if hit { 255 } else { 0 };
        }

        for i in 0..len {
            let idx = (src_data[i] as i32) - (dst[i] as i32) + 255;
            dst[i] = tab[idx as usize];
        }
    }

    fn warp(src: &ImageBuffer, dst: &mut [u8], quad: &[Point2f; 4], warp_size: usize) {
        let m = crate::cv::geometry::square2quad(quad);
        let step = 1.0 / warp_size as f64;
        let mut pos = 0;

        for i in 0..warp_size {
            let v = (i as f64 + 0.5) * step;
            for j in 0..warp_size {
                let u = (j as f64 + 0.5) * step;
                let w = m[6] * u + m[7] * v + m[8];
                let x = (m[0] * u + m[1] * v + m[2]) / w;
                let y = (m[3] * u + m[4] * v + m[5]) / w;
                let val = sample_bilinear(src.data, src.width, src.height, 1, 0, x, y);
                dst[pos] = val.round().clamp(0.0, 255.0) as u8;
                pos += 1;
            }
        }
    }

    fn half_sample(src: &ImageBuffer, dst: &mut [u8]) {
        let w = src.width as usize;
        let hw = w / 2;
        let hh = src.height as usize / 2;
        let data = src.data;
        for y in 0..hh {
            let r0 = 2 * y * w;
            let r1 = r0 + w;
            for x in 0..hw {
                let sum = data[r0 + 2 * x] as u32
                    + data[r0 + 2 * x + 1] as u32
                    + data[r1 + 2 * x] as u32
                    + data[r1 + 2 * x + 1] as u32;
                dst[y * hw + x] = ((sum + 2) >> 2) as u8;
            }
        }
    }
}

/// Bilinear sample of one channel of an interleaved buffer.
///
/// Coordinates are clamped to the image, pixel centers sit on integers.
pub fn sample_bilinear(
    data: &[u8],
    width: u32,
    height: u32,
    channels: usize,
    channel: usize,
    x: f64,
    y: f64,
) -> f64 {
    let width = width as usize;
    let height = height as usize;
    if width == 0 || height == 0 {
        return 0.0;
    }
    let x = x.clamp(0.0, (width - 1) as f64);
    let y = y.clamp(0.0, (height - 1) as f64);

    let sx1 = x as usize;
    let sx2 = if sx1 == width - 1 { sx1 } else { sx1 + 1 };
    let dx1 = x - sx1 as f64;
    let dx2 = 1.0 - dx1;

    let sy1 = y as usize;
    let sy2 = if sy1 == height - 1 { sy1 } else { sy1 + 1 };
    let dy1 = y - sy1 as f64;
    let dy2 = 1.0 - dy1;

    let at = |px: usize, py: usize| data[(py * width + px) * channels + channel] as f64;

    dy2 * (dx2 * at(sx1, sy1) + dx1 * at(sx2, sy1)) + dy1 * (dx2 * at(sx1, sy2) + dx1 * at(sx2, sy2))
}
