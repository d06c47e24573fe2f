// src/nft/descriptor.rs

//! Rotated 256-bit binary descriptor.
//!
//! Each bit compares two smoothed intensities sampled at a fixed pair of
//! offsets, rotated by the keypoint angle and scaled by its blur. The pair
//! layout comes from a fixed seed so reference datasets stay comparable
//! across builds.
use std::sync::OnceLock;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cv::pyramid::GrayImage;

/// 256-bit binary descriptor = 32 bytes
pub type Descriptor = [u8; 32];

pub const DESCRIPTOR_BITS: usize = 256;
const PATTERN_SEED: u64 = 0x4e46_545f_4252_4945;
/// Sampling radius in units of the keypoint's sigma.
pub const PATCH_RADIUS_SIGMAS: f32 = 6.0;

fn pattern() -> &'static [[f32; 4]; DESCRIPTOR_BITS] {
    static PATTERN: OnceLock<[[f32; 4]; DESCRIPTOR_BITS]> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut disc = || loop {
            let x: f32 = rng.gen_range(-1.0..=1.0);
            let y: f32 = rng.gen_range(-1.0..=1.0);
            if x * x + y * y <= 1.0 {
                break [x, y];
            }
        };
        let mut out = [[0.0; 4]; DESCRIPTOR_BITS];
        for pair in out.iter_mut() {
            let a = disc();
            let b = disc();
            *pair = [a[0], a[1], b[0], b[1]];
        }
        out
    })
}

/// Describes the keypoint at `(x, y)` of `image`.
///
/// `x`, `y` and `sigma` are in `image` pixels; `angle` is in radians,
/// image y down.
pub fn describe(image: &GrayImage, x: f32, y: f32, sigma: f32, angle: f32) -> Descriptor {
    let radius = PATCH_RADIUS_SIGMAS * sigma;
    let (s, c) = angle.sin_cos();
    let at = |u: f32, v: f32| {
        let dx = (c * u - s * v) * radius;
        let dy = (s * u + c * v) * radius;
        image.sample(x + dx, y + dy)
    };

    let mut out = [0u8; 32];
    for (bit, p) in pattern().iter().enumerate() {
        if at(p[0], p[1]) < at(p[2], p[3]) {
            out[bit / 8] |= 1 << (bit % 8);
        }
    }
    out
}

#[inline]
pub fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}
