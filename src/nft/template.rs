// src/nft/template.rs

//! Frame-to-frame continuity by template search.
//!
//! Tracking points of the reference page are projected with the previous
//! homography. Around each prediction a template is resampled from the
//! reference pyramid level closest in scale and searched for by normalized
//! cross-correlation in the current frame.
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::nft::dataset::NftDataset;
use crate::nft::homography::project;
use crate::ImageBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateParams {
    /// Template is `2 * half_size + 1` pixels square.
    pub half_size: i32,
    /// Search window half width around the prediction.
    pub search_radius: i32,
    pub min_ncc: f32,
    /// Tracking points tried per frame.
    pub max_points: usize,
}

impl Default for TemplateParams {
    fn default() -> Self {
        Self {
            half_size: 6,
            search_radius: 10,
            min_ncc: 0.7,
            max_points: 40,
        }
    }
}

/// Reference point (level-0 pixels) and where it was found in the frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateMatch {
    pub reference: [f64; 2],
    pub frame: [f64; 2],
    pub ncc: f32,
}

/// Frame pixels per reference pixel around `at`.
fn local_scale(h: &Matrix3<f64>, at: [f64; 2]) -> Option<f64> {
    let p = project(h, at[0], at[1])?;
    let px = project(h, at[0] + 1.0, at[1])?;
    let py = project(h, at[0], at[1] + 1.0)?;
    let det = (px[0] - p[0]) * (py[1] - p[1]) - (px[1] - p[1]) * (py[0] - p[0]);
    (det.abs() > 1e-12).then(|| det.abs().sqrt())
}

fn pick_level(dataset: &NftDataset, scale: f64) -> usize {
    let dpi0 = dataset.dpi() as f64;
    (0..dataset.levels.len())
        .min_by(|&a, &b| {
            let da = ((dataset.levels[a].dpi as f64 / dpi0).ln() - scale.ln()).abs();
            let db = ((dataset.levels[b].dpi as f64 / dpi0).ln() - scale.ln()).abs();
            da.total_cmp(&db)
        })
        .unwrap_or(0)
}

#[inline]
fn luma_at(frame: &ImageBuffer, x: i32, y: i32) -> f32 {
    frame.data[(y as u32 * frame.width + x as u32) as usize] as f32
}

/// Mean-removed template with its norm, or `None` for a flat patch.
fn build_template(
    dataset: &NftDataset,
    level: usize,
    h_inv: &Matrix3<f64>,
    center: [i32; 2],
    half: i32,
) -> Option<(Vec<f32>, f32)> {
    let lvl = &dataset.levels[level];
    let to_level = lvl.dpi as f64 / dataset.dpi() as f64;
    let mut values = Vec::with_capacity(((2 * half + 1) * (2 * half + 1)) as usize);
    for dy in -half..=half {
        for dx in -half..=half {
            let r = project(h_inv, (center[0] + dx) as f64, (center[1] + dy) as f64)?;
            values.push(lvl.sample((r[0] * to_level) as f32, (r[1] * to_level) as f32));
        }
    }
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    let mut norm = 0.0;
    for v in values.iter_mut() {
        *v -= mean;
        norm += *v * *v;
    }
    let norm = norm.sqrt();
    (norm > 1e-3 * values.len() as f32).then_some((values, norm))
}

fn ncc_at(frame: &ImageBuffer, template: &[f32], norm: f32, cx: i32, cy: i32, half: i32) -> f32 {
    let n = template.len() as f32;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut cross = 0.0;
    let mut i = 0;
    for y in cy - half..=cy + half {
        for x in cx - half..=cx + half {
            let v = luma_at(frame, x, y);
            sum += v;
            sum_sq += v * v;
            cross += v * template[i];
            i += 1;
        }
    }
    let var = sum_sq - sum * sum / n;
    if var <= 1e-6 {
        return 0.0;
    }
    // `template` is zero-mean so the frame mean drops out of `cross`.
    cross / (var.sqrt() * norm)
}

/// Sub-pixel offset of a parabola through three samples.
fn parabola_peak(l: f32, c: f32, r: f32) -> f32 {
    let denom = l - 2.0 * c + r;
    if denom.abs() < 1e-9 {
        0.0
    } else {
        (0.5 * (l - r) / denom).clamp(-0.5, 0.5)
    }
}

/// Searches for the page's tracking points around their positions under
/// `h_prev` (reference level-0 pixels to frame pixels).
pub fn track_templates(
    frame: &ImageBuffer,
    dataset: &NftDataset,
    h_prev: &Matrix3<f64>,
    params: &TemplateParams,
) -> Vec<TemplateMatch> {
    let Some(h_inv) = h_prev.try_inverse() else {
        return Vec::new();
    };
    let center = [dataset.width() as f64 * 0.5, dataset.height() as f64 * 0.5];
    let Some(scale) = local_scale(h_prev, center) else {
        return Vec::new();
    };
    let level = pick_level(dataset, scale);
    let Some(points) = dataset.tracking_points.get(level) else {
        return Vec::new();
    };
    let to_level0 = dataset.dpi() as f64 / dataset.levels[level].dpi as f64;

    let half = params.half_size.max(1);
    let reach = half + params.search_radius + 1;
    let (fw, fh) = (frame.width as i32, frame.height as i32);
    let mut out = Vec::new();

    for p in points.iter().take(params.max_points) {
        let reference = [p[0] as f64 * to_level0, p[1] as f64 * to_level0];
        let Some(pred) = project(h_prev, reference[0], reference[1]) else {
            continue;
        };
        let (qx, qy) = (pred[0].round() as i32, pred[1].round() as i32);
        if qx < reach || qy < reach || qx >= fw - reach || qy >= fh - reach {
            continue;
        }
        let Some((template, norm)) = build_template(dataset, level, &h_inv, [qx, qy], half) else {
            continue;
        };

        let r = params.search_radius;
        let side = (2 * r + 1) as usize;
        let mut scores = vec![0f32; side * side];
        let mut best = (f32::MIN, 0usize);
        for dy in -r..=r {
            for dx in -r..=r {
                let s = ncc_at(frame, &template, norm, qx + dx, qy + dy, half);
                let idx = ((dy + r) as usize) * side + (dx + r) as usize;
                scores[idx] = s;
                if s > best.0 {
                    best = (s, idx);
                }
            }
        }
        if best.0 < params.min_ncc {
            continue;
        }

        let (bx, by) = ((best.1 % side) as i32, (best.1 / side) as i32);
        let at = |x: i32, y: i32| scores[y as usize * side + x as usize];
        let sx = if bx > 0 && bx < 2 * r {
            parabola_peak(at(bx - 1, by), best.0, at(bx + 1, by))
        } else {
            0.0
        };
        let sy = if by > 0 && by < 2 * r {
            parabola_peak(at(bx, by - 1), best.0, at(bx, by + 1))
        } else {
            0.0
        };
        out.push(TemplateMatch {
            reference,
            frame: [
                (qx + bx - r) as f64 + sx as f64,
                (qy + by - r) as f64 + sy as f64,
            ],
            ncc: best.0,
        });
    }
    out
}

/// Homography for a pure scale-and-shift, handy for seeding and tests.
pub fn similarity(scale: f64, tx: f64, ty: f64) -> Matrix3<f64> {
    Matrix3::from_columns(&[
        Vector3::new(scale, 0.0, 0.0),
        Vector3::new(0.0, scale, 0.0),
        Vector3::new(tx, ty, 1.0),
    ])
}
