// src/core/transmat.rs

//! Camera-to-marker pose from image correspondences on a planar target.
//!
//! Square markers use four vertices. The absolute solve collects hypotheses
//! from homography decomposition and both POSIT branches, refines each with
//! Gauss-Newton on the reprojection error, and keeps the lowest error. The
//! continuous solve starts from the previous frame's pose instead.
use nalgebra::{Matrix2, Matrix2x3, Matrix3, Matrix6, Rotation3, Vector2, Vector3, Vector6};

use crate::core::camera::CameraParams;
use crate::core::posit::Posit;
use crate::cv::geometry::polygon_area;
use crate::nft::homography::fit_homography;
use crate::pose::TransMat;
use crate::MarkerCorners;

/// Iteration cap for every refinement loop.
pub const AR_MAX_LOOP_COUNT: usize = 10;
/// Mean squared reprojection error (px^2) below which refinement stops.
pub const AR_LOOP_BREAK_THRESH: f64 = 1e-4;
/// Relative improvement below which refinement is considered stalled.
const AR_LOOP_BREAK_RATIO: f64 = 0.99;
/// Continuous solves with a larger error fall back to the absolute solve.
pub const AR_CONT_MAX_ERROR: f64 = 1.0;
const MIN_QUAD_AREA: f32 = 1.0;

/// Result of one refinement run.
#[derive(Debug, Clone, Copy)]
pub struct RefinedPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// Mean squared reprojection error in pixels.
    pub error: f64,
    /// False when the loop hit [`AR_MAX_LOOP_COUNT`] without settling.
    pub converged: bool,
}

impl RefinedPose {
    pub fn trans_mat(&self) -> TransMat {
        TransMat::from_parts(&self.rotation, &self.translation)
    }
}

fn project(k: &Matrix3<f64>, c: &Vector3<f64>) -> Option<Vector2<f64>> {
    if c.z <= 1e-9 {
        return None;
    }
    let p = k * (c / c.z);
    Some(Vector2::new(p.x, p.y))
}

/// Mean squared reprojection error of `model` under `(rotation, translation)`.
pub fn reprojection_error(
    k: &Matrix3<f64>,
    model: &[Vector3<f64>],
    image: &[Vector2<f64>],
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
) -> f64 {
    if model.is_empty() {
        return f64::INFINITY;
    }
    let mut acc = 0.0;
    for (m, p) in model.iter().zip(image) {
        match project(k, &(rotation * m + translation)) {
            Some(q) => acc += (q - p).norm_squared(),
            None => return f64::INFINITY,
        }
    }
    acc / model.len() as f64
}

/// Gauss-Newton refinement with a small Levenberg damping term.
///
/// The rotation is updated by a left-multiplied axis-angle increment.
/// `image` holds undistorted pixel coordinates.
pub fn refine_pose(
    k: &Matrix3<f64>,
    model: &[Vector3<f64>],
    image: &[Vector2<f64>],
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
) -> RefinedPose {
    let k2 = Matrix2::new(k[(0, 0)], k[(0, 1)], 0.0, k[(1, 1)]);
    let mut best = RefinedPose {
        rotation: *rotation,
        translation: *translation,
        error: reprojection_error(k, model, image, rotation, translation),
        converged: false,
    };
    if !best.error.is_finite() {
        return best;
    }
    let mut damping = 1e-3;

    for _ in 0..AR_MAX_LOOP_COUNT {
        if best.error < AR_LOOP_BREAK_THRESH {
            best.converged = true;
            break;
        }

        let mut jtj = Matrix6::<f64>::zeros();
        let mut jtr = Vector6::<f64>::zeros();
        for (m, p) in model.iter().zip(image) {
            let rx = best.rotation * m;
            let c = rx + best.translation;
            let Some(q) = project(k, &c) else {
                return best;
            };
            let iz = 1.0 / c.z;
            let dproj = Matrix2x3::new(iz, 0.0, -c.x * iz * iz, 0.0, iz, -c.y * iz * iz);
            let jc = k2 * dproj;
            let j_omega = jc * -rx.cross_matrix();
            let mut j = nalgebra::Matrix2x6::<f64>::zeros();
            j.fixed_view_mut::<2, 3>(0, 0).copy_from(&j_omega);
            j.fixed_view_mut::<2, 3>(0, 3).copy_from(&jc);
            let r = p - q;
            jtj += j.transpose() * j;
            jtr += j.transpose() * r;
        }

        let mut stepped = false;
        for _ in 0..4 {
            let mut a = jtj;
            for i in 0..6 {
                a[(i, i)] += damping * (1.0 + jtj[(i, i)]);
            }
            let Some(delta) = a.cholesky().map(|ch| ch.solve(&jtr)) else {
                damping *= 10.0;
                continue;
            };
            let omega = Vector3::new(delta[0], delta[1], delta[2]);
            let rotation = Rotation3::new(omega).matrix() * best.rotation;
            let translation = best.translation + Vector3::new(delta[3], delta[4], delta[5]);
            let error = reprojection_error(k, model, image, &rotation, &translation);
            if error < best.error {
                let ratio = error / best.error;
                best = RefinedPose {
                    rotation,
                    translation,
                    error,
                    converged: false,
                };
                damping = (damping * 0.1).max(1e-9);
                stepped = true;
                if ratio > AR_LOOP_BREAK_RATIO {
                    best.converged = true;
                }
                break;
            }
            damping *= 10.0;
        }
        if !stepped || best.converged {
            best.converged = true;
            break;
        }
    }
    if best.error < AR_LOOP_BREAK_THRESH {
        best.converged = true;
    }
    best.rotation = orthonormalize(&best.rotation);
    best
}

/// Nearest rotation matrix.
fn orthonormalize(m: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = m.svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => {
            let mut r = u * v_t;
            if r.determinant() < 0.0 {
                let mut u = u;
                u.column_mut(2).neg_mut();
                r = u * v_t;
            }
            r
        }
        _ => *m,
    }
}

/// Metric pose from a plane-to-image homography, `image ~ H * (X, Y, 1)`.
pub fn decompose_homography(
    k: &Matrix3<f64>,
    h: &Matrix3<f64>,
) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    let m = k.try_inverse()? * h;
    let h1 = m.column(0).into_owned();
    let h2 = m.column(1).into_owned();
    let h3 = m.column(2).into_owned();
    let norm = (h1.norm() + h2.norm()) / 2.0;
    if norm < 1e-12 {
        return None;
    }
    let mut lambda = 1.0 / norm;
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }
    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let rotation = orthonormalize(&Matrix3::from_columns(&[r1, r2, r3]));
    Some((rotation, h3 * lambda))
}

/// Pose of a planar target from N >= 4 correspondences.
///
/// `model` holds plane coordinates (z = 0), `observed` the matching
/// distorted pixel positions. Returns the pose and its mean squared
/// reprojection error.
pub fn solve_planar(
    camera: &CameraParams,
    model: &[[f64; 2]],
    observed: &[[f64; 2]],
) -> Option<(TransMat, f64)> {
    if model.len() < 4 || model.len() != observed.len() {
        return None;
    }
    let k = camera.intrinsics();
    let ideal: Vec<[f64; 2]> = observed
        .iter()
        .map(|p| {
            let (x, y) = camera.observed_to_ideal(p[0], p[1]);
            [x, y]
        })
        .collect();
    let h = fit_homography(model, &ideal)?;
    let (rotation, translation) = decompose_homography(&k, &h)?;

    let model3: Vec<Vector3<f64>> = model.iter().map(|p| Vector3::new(p[0], p[1], 0.0)).collect();
    let image: Vec<Vector2<f64>> = ideal.iter().map(|p| Vector2::new(p[0], p[1])).collect();
    let refined = refine_pose(&k, &model3, &image, &rotation, &translation);
    refined
        .error
        .is_finite()
        .then(|| (refined.trans_mat(), refined.error))
}

fn square_model(width: f64) -> [Vector3<f64>; 4] {
    let h = width / 2.0;
    [
        Vector3::new(-h, h, 0.0),
        Vector3::new(h, h, 0.0),
        Vector3::new(h, -h, 0.0),
        Vector3::new(-h, -h, 0.0),
    ]
}

fn ideal_vertices(camera: &CameraParams, vertices: &MarkerCorners) -> [Vector2<f64>; 4] {
    vertices.map(|v| {
        let (x, y) = camera.observed_to_ideal(v.x as f64, v.y as f64);
        Vector2::new(x, y)
    })
}

/// Absolute pose of a square marker of side `width`.
///
/// `vertices` are clockwise in the image starting at the marker's top-left
/// corner. Returns `None` only for degenerate quads.
pub fn get_trans_mat_square(
    camera: &CameraParams,
    vertices: &MarkerCorners,
    width: f64,
) -> Option<(TransMat, f64)> {
    if polygon_area(vertices).abs() < MIN_QUAD_AREA || width <= 0.0 {
        return None;
    }
    let k = camera.intrinsics();
    let k_inv = k.try_inverse()?;
    let model = square_model(width);
    let image = ideal_vertices(camera, vertices);

    let mut seeds: Vec<(Matrix3<f64>, Vector3<f64>)> = Vec::with_capacity(3);

    let plane: Vec<[f64; 2]> = model.iter().map(|m| [m.x, m.y]).collect();
    let pixels: Vec<[f64; 2]> = image.iter().map(|p| [p.x, p.y]).collect();
    if let Some(h) = fit_homography(&plane, &pixels) {
        if let Some(seed) = decompose_homography(&k, &h) {
            seeds.push(seed);
        }
    }

    let normalized = image.map(|p| {
        let n = k_inv * Vector3::new(p.x, p.y, 1.0);
        Vector2::new(n.x / n.z, n.y / n.z)
    });
    for hyp in Posit::new(width).pose(&normalized) {
        if hyp.error.is_finite() {
            seeds.push((hyp.rotation, hyp.translation));
        }
    }

    seeds
        .iter()
        .map(|(r, t)| refine_pose(&k, &model, &image, r, t))
        .filter(|p| p.error.is_finite())
        .min_by(|a, b| a.error.total_cmp(&b.error))
        .map(|p| (p.trans_mat(), p.error))
}

/// Pose seeded by the previous frame's estimate.
///
/// Falls back to [`get_trans_mat_square`] when there is no previous pose,
/// the refinement does not settle within [`AR_MAX_LOOP_COUNT`] iterations,
/// or the error exceeds [`AR_CONT_MAX_ERROR`].
pub fn get_trans_mat_square_cont(
    camera: &CameraParams,
    vertices: &MarkerCorners,
    width: f64,
    previous: Option<&TransMat>,
) -> Option<(TransMat, f64)> {
    let Some(previous) = previous else {
        return get_trans_mat_square(camera, vertices, width);
    };
    let k = camera.intrinsics();
    let model = square_model(width);
    let image = ideal_vertices(camera, vertices);
    let refined = refine_pose(
        &k,
        &model,
        &image,
        &previous.rotation(),
        &previous.translation(),
    );
    if refined.converged && refined.error <= AR_CONT_MAX_ERROR {
        return Some((refined.trans_mat(), refined.error));
    }

    tracing::trace!(
        error = refined.error,
        converged = refined.converged,
        "continuous pose fell back to absolute solve"
    );
    match get_trans_mat_square(camera, vertices, width) {
        Some((abs, err)) if err <= refined.error || !refined.error.is_finite() => Some((abs, err)),
        Some(_) => Some((refined.trans_mat(), refined.error)),
        None => refined
            .error
            .is_finite()
            .then(|| (refined.trans_mat(), refined.error)),
    }
}
