// src/core/posit.rs

//! Coplanar POSIT (Oberkampf, DeMenthon and Davis) for square markers.
//!
//! Works on normalized image coordinates (unit focal length, origin at the
//! principal point, y down). It yields the two mirror-ambiguous poses of the
//! planar model; both seed the iterative refinement in
//! [`crate::core::transmat`].
use nalgebra::{Matrix3, Vector2, Vector3};

const MAX_ITERATIONS: usize = 100;
const CONVERGED_ERROR: f64 = 1e-10;

/// One POSIT pose hypothesis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseHypothesis {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// Mean squared reprojection error in normalized units.
    pub error: f64,
}

/// POSIT estimator for a square marker of a given side length.
pub struct Posit {
    model: [Vector3<f64>; 4],
    model_vectors: Matrix3<f64>,
    model_normal: Vector3<f64>,
    model_pseudo_inverse: Matrix3<f64>,
}

impl Posit {
    /// Square model `(-h, h), (h, h), (h, -h), (-h, -h)`: top-left first,
    /// clockwise as seen from the camera.
    pub fn new(model_size: f64) -> Self {
        let half = model_size / 2.0;
        let model = [
            Vector3::new(-half, half, 0.0),
            Vector3::new(half, half, 0.0),
            Vector3::new(half, -half, 0.0),
            Vector3::new(-half, -half, 0.0),
        ];

        let model_vectors = Matrix3::from_rows(&[
            (model[1] - model[0]).transpose(),
            (model[2] - model[0]).transpose(),
            (model[3] - model[0]).transpose(),
        ]);

        let svd = model_vectors.svd(true, true);
        let min_idx = svd.singular_values.imin();
        let model_normal = svd
            .v_t
            .as_ref()
            .map(|v_t| v_t.row(min_idx).transpose())
            .unwrap_or_else(Vector3::z);
        let model_pseudo_inverse = svd
            .pseudo_inverse(1e-12)
            .unwrap_or_else(|_| Matrix3::zeros());

        Self {
            model,
            model_vectors,
            model_normal,
            model_pseudo_inverse,
        }
    }

    pub fn model(&self) -> &[Vector3<f64>; 4] {
        &self.model
    }

    /// Both pose hypotheses, lower error first.
    pub fn pose(&self, points: &[Vector2<f64>; 4]) -> [PoseHypothesis; 2] {
        let ones = Vector3::new(1.0, 1.0, 1.0);
        let [first, second] = self.pos(points, &ones);
        let mut out = [self.iterate(points, first), self.iterate(points, second)];
        if out[1].error < out[0].error {
            out.swap(0, 1);
        }
        out
    }

    /// One POS step for the given perspective corrections.
    fn pos(&self, points: &[Vector2<f64>; 4], eps: &Vector3<f64>) -> [PoseHypothesis; 2] {
        let xi = Vector3::new(points[1].x, points[2].x, points[3].x);
        let yi = Vector3::new(points[1].y, points[2].y, points[3].y);

        let xs = xi.component_mul(eps).add_scalar(-points[0].x);
        let ys = yi.component_mul(eps).add_scalar(-points[0].y);

        let i0 = self.model_pseudo_inverse * xs;
        let j0 = self.model_pseudo_inverse * ys;

        let s = j0.norm_squared() - i0.norm_squared();
        let ij = i0.dot(&j0);

        let (r, theta) = if s == 0.0 {
            (
                (2.0 * ij).abs().sqrt(),
                if ij == 0.0 {
                    0.0
                } else {
                    -std::f64::consts::FRAC_PI_4 * ij.signum()
                },
            )
        } else {
            let mut theta = (-2.0 * ij / s).atan();
            if s < 0.0 {
                theta += std::f64::consts::PI;
            }
            ((s * s + 4.0 * ij * ij).sqrt().sqrt(), theta / 2.0)
        };

        let lambda = r * theta.cos();
        let mu = r * theta.sin();

        [1.0, -1.0].map(|sign| {
            let mut i = i0 + self.model_normal * (sign * lambda);
            let mut j = j0 + self.model_normal * (sign * mu);
            let inorm = i.normalize_mut();
            let jnorm = j.normalize_mut();
            let k = i.cross(&j);
            let rotation = Matrix3::from_rows(&[i.transpose(), j.transpose(), k.transpose()]);

            let scale = (inorm + jnorm) / 2.0;
            let temp = rotation * self.model[0];
            let translation = Vector3::new(
                points[0].x / scale - temp.x,
                points[0].y / scale - temp.y,
                1.0 / scale,
            );
            PoseHypothesis {
                rotation,
                translation,
                error: self.error(points, &rotation, &translation),
            }
        })
    }

    fn iterate(&self, points: &[Vector2<f64>; 4], mut best: PoseHypothesis) -> PoseHypothesis {
        for _ in 0..MAX_ITERATIONS {
            if best.error <= CONVERGED_ERROR || best.translation.z.abs() < 1e-12 {
                break;
            }
            let row2 = best.rotation.row(2).transpose();
            let eps = (self.model_vectors * row2 / best.translation.z).add_scalar(1.0);

            let [a, b] = self.pos(points, &eps);
            let candidate = if a.error < b.error { a } else { b };
            if !(candidate.error < best.error) {
                break;
            }
            best = candidate;
        }
        best
    }

    fn error(
        &self,
        points: &[Vector2<f64>; 4],
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) -> f64 {
        let mut acc = 0.0;
        for (m, p) in self.model.iter().zip(points) {
            let c = rotation * m + translation;
            if c.z <= 0.0 {
                return f64::INFINITY;
            }
            acc += (c.x / c.z - p.x).powi(2) + (c.y / c.z - p.y).powi(2);
        }
        acc / 4.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posit_frontal() {
        let model_size = 35.0;
        let posit = Posit::new(model_size);

        // 100 px wide at f = 500, y down: top-left is (-50, -50).
        let f = 500.0;
        let points = [
            Vector2::new(-50.0 / f, -50.0 / f),
            Vector2::new(50.0 / f, -50.0 / f),
            Vector2::new(50.0 / f, 50.0 / f),
            Vector2::new(-50.0 / f, 50.0 / f),
        ];

        let best = posit.pose(&points)[0];
        // 500 * 35 / 100 = 175
        assert!((best.translation.z - 175.0).abs() < 1.0);
        assert!(best.translation.x.abs() < 1e-6);
        assert!(best.translation.y.abs() < 1e-6);
        assert!((best.rotation[(1, 1)] + 1.0).abs() < 1e-6);
        assert!((best.rotation[(2, 2)] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_posit_tilted() {
        let posit = Posit::new(80.0);
        let r = nalgebra::Rotation3::from_euler_angles(std::f64::consts::PI + 0.35, 0.2, 0.1);
        let t = Vector3::new(10.0, -5.0, 300.0);
        let pts = posit.model().map(|m| {
            let c = r * m + t;
            Vector2::new(c.x / c.z, c.y / c.z)
        });
        let best = posit.pose(&pts)[0];
        assert!(best.error < 1e-4, "{}", best.error);
        assert!((best.translation - t).norm() < 15.0);
    }
}
