// src/nft/homography.rs

//! Plane-to-image homography estimation.
//!
//! Direct Linear Transform with Hartley normalization, and a seeded RANSAC
//! wrapper used to verify feature matches.
use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Project a 2D point through a 3x3 homography.
pub fn project(h: &Matrix3<f64>, x: f64, y: f64) -> Option<[f64; 2]> {
    let p = h * Vector3::new(x, y, 1.0);
    if p[2].abs() < 1e-15 {
        return None;
    }
    Some([p[0] / p[2], p[1] / p[2]])
}

/// Euclidean transfer error of one correspondence.
pub fn transfer_error(h: &Matrix3<f64>, src: &[f64; 2], dst: &[f64; 2]) -> f64 {
    match project(h, src[0], src[1]) {
        Some(p) => ((p[0] - dst[0]).powi(2) + (p[1] - dst[1]).powi(2)).sqrt(),
        None => f64::INFINITY,
    }
}

/// Translate the centroid to the origin and scale the mean distance to
/// sqrt(2).
fn normalize_points(pts: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = pts.len() as f64;
    let cx: f64 = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy: f64 = pts.iter().map(|p| p[1]).sum::<f64>() / n;

    let mean_dist: f64 = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts
        .iter()
        .map(|p| [s * (p[0] - cx), s * (p[1] - cy)])
        .collect();
    (t, normalized)
}

/// Homography from four or more correspondences, `dst ~ H * src`.
///
/// Returns `None` for fewer than four points, mismatched inputs or a
/// degenerate configuration.
pub fn fit_homography(src: &[[f64; 2]], dst: &[[f64; 2]]) -> Option<Matrix3<f64>> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return None;
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    let mut a = DMatrix::zeros(2 * n, 9);
    for i in 0..n {
        let (sx, sy) = (src_n[i][0], src_n[i][1]);
        let (dx, dy) = (dst_n[i][0], dst_n[i][1]);

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // Null vector of A: eigenvector of A^T A with the smallest eigenvalue.
    let eig = SymmetricEigen::new(a.transpose() * &a);
    let min_idx = eig.eigenvalues.imin();
    let h = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let h = t_dst.try_inverse()? * h_norm * t_src;
    let scale = h[(2, 2)];
    if !h.iter().all(|v| v.is_finite()) {
        return None;
    }
    if scale.abs() < 1e-15 {
        Some(h)
    } else {
        Some(h / scale)
    }
}

/// RANSAC parameters for match verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacConfig {
    pub max_iters: usize,
    /// Inlier threshold on transfer error, in destination units.
    pub inlier_threshold: f64,
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iters: 500,
            inlier_threshold: 4.0,
            min_inliers: 8,
            seed: 0,
        }
    }
}

/// Verified homography with its support.
#[derive(Debug, Clone)]
pub struct RansacResult {
    pub h: Matrix3<f64>,
    pub inlier_mask: Vec<bool>,
    pub n_inliers: usize,
}

/// Fit a homography with RANSAC, then refit on all inliers.
pub fn fit_homography_ransac(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    config: &RansacConfig,
) -> Option<RansacResult> {
    let n = src.len();
    if n < 4 || dst.len() != n || n < config.min_inliers {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best_inliers = 0usize;
    let mut best_mask = vec![false; n];
    let mut best_h = None;

    for _ in 0..config.max_iters {
        let mut indices = [0usize; 4];
        let mut filled = 0;
        let mut attempts = 0;
        while filled < 4 && attempts < 100 {
            let idx = rng.gen_range(0..n);
            if !indices[..filled].contains(&idx) {
                indices[filled] = idx;
                filled += 1;
            }
            attempts += 1;
        }
        if filled < 4 {
            continue;
        }

        let s4: Vec<[f64; 2]> = indices.iter().map(|&i| src[i]).collect();
        let d4: Vec<[f64; 2]> = indices.iter().map(|&i| dst[i]).collect();
        let Some(h) = fit_homography(&s4, &d4) else {
            continue;
        };

        let mask: Vec<bool> = (0..n)
            .map(|i| transfer_error(&h, &src[i], &dst[i]) < config.inlier_threshold)
            .collect();
        let count = mask.iter().filter(|&&m| m).count();

        if count > best_inliers {
            best_inliers = count;
            best_mask = mask;
            best_h = Some(h);

            // Early exit if >90% inliers
            if count * 10 > n * 9 {
                break;
            }
        }
    }

    let best_h = best_h?;
    if best_inliers < config.min_inliers {
        tracing::trace!(
            found = best_inliers,
            needed = config.min_inliers,
            "homography below inlier minimum"
        );
        return None;
    }

    let inlier_src: Vec<[f64; 2]> = (0..n).filter(|&i| best_mask[i]).map(|i| src[i]).collect();
    let inlier_dst: Vec<[f64; 2]> = (0..n).filter(|&i| best_mask[i]).map(|i| dst[i]).collect();
    let h = fit_homography(&inlier_src, &inlier_dst).unwrap_or(best_h);

    let inlier_mask: Vec<bool> = (0..n)
        .map(|i| transfer_error(&h, &src[i], &dst[i]) < config.inlier_threshold)
        .collect();
    let n_inliers = inlier_mask.iter().filter(|&&m| m).count();
    if n_inliers < config.min_inliers {
        return None;
    }

    Some(RansacResult {
        h,
        inlier_mask,
        n_inliers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_h() -> Matrix3<f64> {
        Matrix3::new(1.2, 0.1, 30.0, -0.05, 0.9, 12.0, 0.0004, -0.0002, 1.0)
    }

    fn grid() -> Vec<[f64; 2]> {
        let mut pts = Vec::new();
        for y in 0..6 {
            for x in 0..6 {
                pts.push([x as f64 * 20.0, y as f64 * 15.0]);
            }
        }
        pts
    }

    #[test]
    fn dlt_recovers_exact_homography() {
        let h = sample_h();
        let src = grid();
        let dst: Vec<_> = src.iter().map(|p| project(&h, p[0], p[1]).unwrap()).collect();
        let est = fit_homography(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            assert!(transfer_error(&est, s, d) < 1e-6);
        }
        assert_relative_eq!(est[(0, 2)], 30.0, epsilon = 1e-6);
    }

    #[test]
    fn too_few_points() {
        assert!(fit_homography(&[[0.0, 0.0]; 3], &[[0.0, 0.0]; 3]).is_none());
    }

    #[test]
    fn ransac_rejects_outliers() {
        let h = sample_h();
        let src = grid();
        let mut dst: Vec<_> = src.iter().map(|p| project(&h, p[0], p[1]).unwrap()).collect();
        for i in (0..dst.len()).step_by(6) {
            dst[i][0] += 80.0;
            dst[i][1] -= 55.0;
        }
        let res = fit_homography_ransac(&src, &dst, &RansacConfig::default()).unwrap();
        assert_eq!(res.n_inliers, 30);
        for i in (0..dst.len()).step_by(6) {
            assert!(!res.inlier_mask[i]);
        }
    }

    #[test]
    fn ransac_is_deterministic() {
        let h = sample_h();
        let src = grid();
        let mut dst: Vec<_> = src.iter().map(|p| project(&h, p[0], p[1]).unwrap()).collect();
        dst[3][0] += 40.0;
        let cfg = RansacConfig {
            seed: 7,
            ..RansacConfig::default()
        };
        let a = fit_homography_ransac(&src, &dst, &cfg).unwrap();
        let b = fit_homography_ransac(&src, &dst, &cfg).unwrap();
        assert_eq!(a.h, b.h);
    }
}
