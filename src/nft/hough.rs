// src/nft/hough.rs

//! Similarity voting over feature matches.
//!
//! Every match implies a rotation, a scale and therefore a location for the
//! reference page's center in the query image. Matches that agree land in
//! the same 4D bin; the fullest bin is the consistent subset handed to
//! RANSAC.
use std::collections::HashMap;
use std::f32::consts::TAU;

use serde::{Deserialize, Serialize};

use crate::nft::cluster::FeatureMatch;
use crate::nft::features::Keypoint;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoughParams {
    /// Center bin width as a fraction of the query image's longer side.
    pub position_fraction: f32,
    pub angle_bins: usize,
    /// Scale bin width in octaves.
    pub scale_bin_log2: f32,
    pub min_votes: usize,
}

impl Default for HoughParams {
    fn default() -> Self {
        Self {
            position_fraction: 0.125,
            angle_bins: 12,
            scale_bin_log2: 1.0,
            min_votes: 4,
        }
    }
}

/// Parameters one match votes for, in continuous bin units.
fn bin_coordinates(
    q: &Keypoint,
    r: &Keypoint,
    ref_center: [f32; 2],
    bin_px: f32,
    params: &HoughParams,
) -> Option<[f32; 4]> {
    if r.scale <= 0.0 || q.scale <= 0.0 {
        return None;
    }
    let s = q.scale / r.scale;
    let theta = (q.angle - r.angle).rem_euclid(TAU);
    let (sn, cs) = theta.sin_cos();
    let vx = ref_center[0] - r.x;
    let vy = ref_center[1] - r.y;
    let cx = q.x + s * (cs * vx - sn * vy);
    let cy = q.y + s * (sn * vx + cs * vy);
    if !cx.is_finite() || !cy.is_finite() {
        return None;
    }
    Some([
        cx / bin_px,
        cy / bin_px,
        theta / TAU * params.angle_bins as f32,
        s.log2() / params.scale_bin_log2,
    ])
}

/// Indices into `matches` that agree on the dominant similarity, or an
/// empty list when no bin reaches `min_votes`.
pub fn consistent_matches(
    matches: &[FeatureMatch],
    query: &[Keypoint],
    reference: &[Keypoint],
    ref_center: [f32; 2],
    query_extent: f32,
    params: &HoughParams,
) -> Vec<usize> {
    let bin_px = (params.position_fraction * query_extent).max(1.0);
    let angle_bins = params.angle_bins.max(1) as i32;
    let mut votes: HashMap<[i32; 4], Vec<usize>> = HashMap::new();

    for (m, fm) in matches.iter().enumerate() {
        let (Some(q), Some(r)) = (query.get(fm.query), reference.get(fm.reference)) else {
            continue;
        };
        let Some(v) = bin_coordinates(q, r, ref_center, bin_px, params) else {
            continue;
        };
        // Each coordinate votes for its two nearest bins.
        let lo = v.map(|c| (c - 0.5).floor() as i32);
        for corner in 0..16u32 {
            let mut key = lo;
            for (d, k) in key.iter_mut().enumerate() {
                *k += ((corner >> d) & 1) as i32;
            }
            key[2] = key[2].rem_euclid(angle_bins);
            votes.entry(key).or_default().push(m);
        }
    }

    let best = votes
        .into_iter()
        .max_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| b.0.cmp(&a.0)));
    match best {
        Some((_, mut members)) if members.len() >= params.min_votes => {
            members.sort_unstable();
            members.dedup();
            members
        }
        _ => Vec::new(),
    }
}
