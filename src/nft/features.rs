// src/nft/features.rs

//! Difference-of-Gaussian keypoints with orientation and binary descriptors.
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::cv::pyramid::{gradient_at, GrayImage, Octave, ScaleSpace, ScaleSpaceParams};
use crate::nft::descriptor::{describe, Descriptor, PATCH_RADIUS_SIGMAS};
use crate::Result;

const ORIENTATION_BINS: usize = 36;
const REFINE_STEPS: usize = 5;

/// Keypoint in input-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Blur sigma in input pixels.
    pub scale: f32,
    /// Dominant gradient direction in radians, image y down.
    pub angle: f32,
    /// Absolute DoG response after refinement.
    pub score: f32,
    pub octave: u32,
}

/// Detection thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureParams {
    /// Minimum |DoG| at the refined extremum, luma in [0, 1].
    pub contrast_threshold: f32,
    /// Principal curvature ratio above which a point counts as an edge.
    pub edge_ratio: f32,
    /// Hard cap on described features per image.
    pub max_features: usize,
    pub max_octaves: usize,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            contrast_threshold: 0.015,
            edge_ratio: 10.0,
            max_features: 600,
            max_octaves: 5,
        }
    }
}

/// Keypoints with one descriptor each.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
    /// Candidates found before the cap was applied.
    pub candidates: usize,
    /// True when candidates were dropped by the cap.
    pub overflow: bool,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

struct Candidate {
    keypoint: Keypoint,
    /// Position, sigma and Gaussian layer in octave pixels.
    ox: f32,
    oy: f32,
    osigma: f32,
    layer: usize,
}

/// Builds the scale space of `luma` and extracts up to
/// `params.max_features` described keypoints, strongest first.
pub fn extract(luma: &[u8], width: u32, height: u32, params: &FeatureParams) -> Result<FeatureSet> {
    let base = GrayImage::from_luma(luma, width, height);
    let space = ScaleSpace::build(
        &base,
        ScaleSpaceParams {
            max_octaves: params.max_octaves.max(1),
            ..ScaleSpaceParams::default()
        },
    )?;
    Ok(extract_from_space(&space, params))
}

pub fn extract_from_space(space: &ScaleSpace, params: &FeatureParams) -> FeatureSet {
    let mut candidates = Vec::new();
    for (o, octave) in space.octaves.iter().enumerate() {
        detect_octave(octave, o as u32, space.params.scales_per_octave, params, &mut candidates);
    }

    let found = candidates.len();
    candidates.sort_by(|a, b| b.keypoint.score.total_cmp(&a.keypoint.score));
    let overflow = found > params.max_features;
    candidates.truncate(params.max_features);

    let mut set = FeatureSet {
        keypoints: Vec::with_capacity(candidates.len()),
        descriptors: Vec::with_capacity(candidates.len()),
        candidates: found,
        overflow,
    };
    for c in candidates {
        let octave = &space.octaves[c.keypoint.octave as usize];
        let img = &octave.gaussians[c.layer];
        set.descriptors
            .push(describe(img, c.ox, c.oy, c.osigma, c.keypoint.angle));
        set.keypoints.push(c.keypoint);
    }
    set
}

fn detect_octave(
    octave: &Octave,
    index: u32,
    scales: usize,
    params: &FeatureParams,
    out: &mut Vec<Candidate>,
) {
    let dogs = &octave.dogs;
    let Some(first) = dogs.first() else {
        return;
    };
    let (w, h) = (first.width as i32, first.height as i32);
    let border = 5;
    if w <= 2 * border || h <= 2 * border {
        return;
    }
    let pre = 0.5 * params.contrast_threshold;

    for l in 1..=scales.min(dogs.len().saturating_sub(2)) {
        for y in border..h - border {
            for x in border..w - border {
                let v = dogs[l].get(x, y);
                if v.abs() < pre || !is_extremum(dogs, l, x, y, v) {
                    continue;
                }
                if let Some(c) = refine(octave, index, scales, l, x, y, params) {
                    out.push(c);
                }
            }
        }
    }
}

fn is_extremum(dogs: &[GrayImage], l: usize, x: i32, y: i32, v: f32) -> bool {
    let maximum = v > 0.0;
    for layer in &dogs[l - 1..=l + 1] {
        for dy in -1..=1 {
            for dx in -1..=1 {
                let n = layer.get(x + dx, y + dy);
                if std::ptr::eq(layer, &dogs[l]) && dx == 0 && dy == 0 {
                    continue;
                }
                if (maximum && n >= v) || (!maximum && n <= v) {
                    return false;
                }
            }
        }
    }
    true
}

/// Quadratic fit in (x, y, layer), contrast and edge rejection, orientation.
fn refine(
    octave: &Octave,
    index: u32,
    scales: usize,
    mut l: usize,
    mut x: i32,
    mut y: i32,
    params: &FeatureParams,
) -> Option<Candidate> {
    let dogs = &octave.dogs;
    let (w, h) = (dogs[0].width as i32, dogs[0].height as i32);
    let mut offset = Vector3::zeros();
    let mut gradient = Vector3::zeros();

    let mut settled = false;
    for _ in 0..REFINE_STEPS {
        let (d0, d1, d2) = (&dogs[l - 1], &dogs[l], &dogs[l + 1]);
        let v = d1.get(x, y);
        gradient = Vector3::new(
            (d1.get(x + 1, y) - d1.get(x - 1, y)) * 0.5,
            (d1.get(x, y + 1) - d1.get(x, y - 1)) * 0.5,
            (d2.get(x, y) - d0.get(x, y)) * 0.5,
        );
        let dxx = d1.get(x + 1, y) + d1.get(x - 1, y) - 2.0 * v;
        let dyy = d1.get(x, y + 1) + d1.get(x, y - 1) - 2.0 * v;
        let dss = d2.get(x, y) + d0.get(x, y) - 2.0 * v;
        let dxy = (d1.get(x + 1, y + 1) - d1.get(x - 1, y + 1) - d1.get(x + 1, y - 1)
            + d1.get(x - 1, y - 1))
            * 0.25;
        let dxs = (d2.get(x + 1, y) - d2.get(x - 1, y) - d0.get(x + 1, y) + d0.get(x - 1, y)) * 0.25;
        let dys = (d2.get(x, y + 1) - d2.get(x, y - 1) - d0.get(x, y + 1) + d0.get(x, y - 1)) * 0.25;
        let hessian = Matrix3::new(dxx, dxy, dxs, dxy, dyy, dys, dxs, dys, dss);
        offset = -(hessian.try_inverse()? * gradient);

        if offset.iter().all(|o| o.abs() < 0.5) {
            settled = true;
            break;
        }
        x += offset.x.round() as i32;
        y += offset.y.round() as i32;
        let nl = l as i32 + offset.z.round() as i32;
        if nl < 1 || nl as usize > scales.min(dogs.len() - 2) || x < 5 || y < 5 || x >= w - 5 || y >= h - 5
        {
            return None;
        }
        l = nl as usize;
    }
    if !settled {
        return None;
    }

    let d1 = &dogs[l];
    let response = d1.get(x, y) + 0.5 * gradient.dot(&offset);
    if response.abs() < params.contrast_threshold {
        return None;
    }

    // Edge rejection on the spatial Hessian.
    let v = d1.get(x, y);
    let dxx = d1.get(x + 1, y) + d1.get(x - 1, y) - 2.0 * v;
    let dyy = d1.get(x, y + 1) + d1.get(x, y - 1) - 2.0 * v;
    let dxy = (d1.get(x + 1, y + 1) - d1.get(x - 1, y + 1) - d1.get(x + 1, y - 1)
        + d1.get(x - 1, y - 1))
        * 0.25;
    let tr = dxx + dyy;
    let det = dxx * dyy - dxy * dxy;
    let r = params.edge_ratio;
    if det <= 0.0 || tr * tr * r >= (r + 1.0) * (r + 1.0) * det {
        return None;
    }

    let ox = x as f32 + offset.x;
    let oy = y as f32 + offset.y;
    let layer_pos = l as f32 + offset.z;
    let sigma0 = octave.sigmas[0];
    let osigma = sigma0 * 2f32.powf(layer_pos / scales as f32);
    let angle = dominant_orientation(&octave.gaussians[l], ox, oy, osigma);

    Some(Candidate {
        keypoint: Keypoint {
            x: ox * octave.scale,
            y: oy * octave.scale,
            scale: osigma * octave.scale,
            angle,
            score: response.abs(),
            octave: index,
        },
        ox,
        oy,
        osigma,
        layer: l,
    })
}

/// Peak of a 36-bin, Gaussian-weighted gradient histogram, parabola
/// interpolated.
fn dominant_orientation(img: &GrayImage, x: f32, y: f32, sigma: f32) -> f32 {
    let weight_sigma = 1.5 * sigma;
    let radius = (3.0 * weight_sigma).round().min(PATCH_RADIUS_SIGMAS * sigma) as i32;
    let (cx, cy) = (x.round() as i32, y.round() as i32);
    let mut hist = [0f32; ORIENTATION_BINS];
    let denom = 2.0 * weight_sigma * weight_sigma;

    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let r2 = (dx * dx + dy * dy) as f32;
            if r2 > (radius * radius) as f32 {
                continue;
            }
            let (gx, gy) = gradient_at(img, cx + dx, cy + dy);
            let mag = (gx * gx + gy * gy).sqrt();
            if mag <= 0.0 {
                continue;
            }
            let theta = gy.atan2(gx).rem_euclid(std::f32::consts::TAU);
            let bin = ((theta / std::f32::consts::TAU) * ORIENTATION_BINS as f32) as usize
                % ORIENTATION_BINS;
            hist[bin] += mag * (-r2 / denom).exp();
        }
    }

    // Two passes of [1 1 1] / 3 smoothing.
    for _ in 0..2 {
        let prev = hist;
        for i in 0..ORIENTATION_BINS {
            let l = prev[(i + ORIENTATION_BINS - 1) % ORIENTATION_BINS];
            let r = prev[(i + 1) % ORIENTATION_BINS];
            hist[i] = (l + prev[i] + r) / 3.0;
        }
    }

    let (peak, _) = hist
        .iter()
        .enumerate()
        .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
    let l = hist[(peak + ORIENTATION_BINS - 1) % ORIENTATION_BINS];
    let c = hist[peak];
    let r = hist[(peak + 1) % ORIENTATION_BINS];
    let denom = l - 2.0 * c + r;
    let shift = if denom.abs() > 1e-12 { 0.5 * (l - r) / denom } else { 0.0 };
    let bin = peak as f32 + 0.5 + shift;
    (bin / ORIENTATION_BINS as f32 * std::f32::consts::TAU).rem_euclid(std::f32::consts::TAU)
}
