// src/core/camera.rs

//! Camera calibration parameters in the ARToolKit layout.
//!
//! Binary files are big-endian: `i32 xsize, i32 ysize, f64 mat[3][4]` then
//! either 4 (version 1) or 9 (version 4) distortion factors.
use std::sync::Arc;

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::{ArError, Result};

const HEADER_BYTES: usize = 4 + 4 + 12 * 8;
const V1_BYTES: usize = HEADER_BYTES + 4 * 8;
const V4_BYTES: usize = HEADER_BYTES + 9 * 8;
const MAX_UNDISTORT_ITERATIONS: usize = 20;

/// Camera intrinsics plus lens distortion for one resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCameraParams", into = "RawCameraParams")]
pub struct CameraParams {
    pub xsize: u32,
    pub ysize: u32,
    /// Row-major 3x4 projection `[fx s cx 0; 0 fy cy 0; 0 0 1 0]`.
    pub mat: [[f64; 4]; 3],
    /// Version 1: `x0, y0, f, s`. Version 4: `k1, k2, p1, p2, fx, fy, x0, y0, s`.
    /// Unused trailing entries are zero.
    pub dist_factor: [f64; 9],
    pub dist_version: u8,
}

#[derive(Serialize, Deserialize)]
struct RawCameraParams {
    xsize: u32,
    ysize: u32,
    mat: [[f64; 4]; 3],
    dist_factor: Vec<f64>,
    #[serde(default)]
    dist_version: Option<u8>,
}

impl TryFrom<RawCameraParams> for CameraParams {
    type Error = ArError;

    fn try_from(raw: RawCameraParams) -> Result<Self> {
        let version = match (raw.dist_version, raw.dist_factor.len()) {
            (Some(1) | None, 4) => 1,
            (Some(4) | None, 9) => 4,
            (v, n) => {
                return Err(ArError::MalformedCamera(format!(
                    "distortion version {v:?} with {n} factors"
                )))
            }
        };
        let mut dist_factor = [0.0; 9];
        dist_factor[..raw.dist_factor.len()].copy_from_slice(&raw.dist_factor);
        let params = CameraParams {
            xsize: raw.xsize,
            ysize: raw.ysize,
            mat: raw.mat,
            dist_factor,
            dist_version: version,
        };
        params.validate()?;
        Ok(params)
    }
}

impl From<CameraParams> for RawCameraParams {
    fn from(p: CameraParams) -> Self {
        let n = if p.dist_version == 1 { 4 } else { 9 };
        RawCameraParams {
            xsize: p.xsize,
            ysize: p.ysize,
            mat: p.mat,
            dist_factor: p.dist_factor[..n].to_vec(),
            dist_version: Some(p.dist_version),
        }
    }
}

fn read_f64(bytes: &[u8], offset: usize) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    f64::from_be_bytes(buf)
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_be_bytes(buf)
}

impl CameraParams {
    /// Distortion-free parameters from plain intrinsics.
    pub fn from_intrinsics(xsize: u32, ysize: u32, fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        let mut dist_factor = [0.0; 9];
        dist_factor[4] = fx;
        dist_factor[5] = fy;
        dist_factor[6] = cx;
        dist_factor[7] = cy;
        dist_factor[8] = 1.0;
        CameraParams {
            xsize,
            ysize,
            mat: [[fx, 0.0, cx, 0.0], [0.0, fy, cy, 0.0], [0.0, 0.0, 1.0, 0.0]],
            dist_factor,
            dist_version: 4,
        }
    }

    /// Parses the binary calibration file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (count, version) = match bytes.len() {
            V1_BYTES => (4, 1),
            V4_BYTES => (9, 4),
            n => {
                return Err(ArError::MalformedCamera(format!(
                    "unexpected file size {n}, expected {V1_BYTES} or {V4_BYTES} bytes"
                )))
            }
        };

        let xsize = read_i32(bytes, 0);
        let ysize = read_i32(bytes, 4);
        if xsize <= 0 || ysize <= 0 {
            return Err(ArError::MalformedCamera(format!(
                "invalid image size {xsize}x{ysize}"
            )));
        }

        let mut mat = [[0.0; 4]; 3];
        for (r, row) in mat.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = read_f64(bytes, 8 + (r * 4 + c) * 8);
            }
        }
        let mut dist_factor = [0.0; 9];
        for (i, v) in dist_factor.iter_mut().take(count).enumerate() {
            *v = read_f64(bytes, HEADER_BYTES + i * 8);
        }

        let params = CameraParams {
            xsize: xsize as u32,
            ysize: ysize as u32,
            mat,
            dist_factor,
            dist_version: version,
        };
        params.validate()?;
        Ok(params)
    }

    /// Serializes back to the binary calibration layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let count = if self.dist_version == 1 { 4 } else { 9 };
        let mut out = Vec::with_capacity(HEADER_BYTES + count * 8);
        out.extend_from_slice(&(self.xsize as i32).to_be_bytes());
        out.extend_from_slice(&(self.ysize as i32).to_be_bytes());
        for row in &self.mat {
            for v in row {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        for v in &self.dist_factor[..count] {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    fn validate(&self) -> Result<()> {
        if self.xsize == 0 || self.ysize == 0 {
            return Err(ArError::MalformedCamera("zero image size".into()));
        }
        if !self.mat.iter().flatten().all(|v| v.is_finite())
            || !self.dist_factor.iter().all(|v| v.is_finite())
        {
            return Err(ArError::MalformedCamera("non-finite value".into()));
        }
        if self.mat[0][0] <= 0.0 || self.mat[1][1] <= 0.0 {
            return Err(ArError::MalformedCamera("focal length must be positive".into()));
        }
        // v1 divides by the scale factor when mapping back to pixels.
        if self.dist_version == 1 && self.dist_factor[3] <= 0.0 {
            return Err(ArError::MalformedCamera(
                "distortion scale factor must be positive".into(),
            ));
        }
        if self.dist_version == 4 && (self.dist_factor[4] <= 0.0 || self.dist_factor[5] <= 0.0) {
            return Err(ArError::MalformedCamera(
                "distortion focal length must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn fx(&self) -> f64 {
        self.mat[0][0]
    }

    pub fn fy(&self) -> f64 {
        self.mat[1][1]
    }

    pub fn cx(&self) -> f64 {
        self.mat[0][2]
    }

    pub fn cy(&self) -> f64 {
        self.mat[1][2]
    }

    /// The 3x3 intrinsic matrix.
    pub fn intrinsics(&self) -> Matrix3<f64> {
        let m = &self.mat;
        Matrix3::new(
            m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
        )
    }

    /// Rescales the parameters to a new image size.
    pub fn change_size(&self, xsize: u32, ysize: u32) -> Result<CameraParams> {
        if xsize == 0 || ysize == 0 {
            return Err(ArError::InvalidParameter(format!(
                "camera size must be non-zero, got {xsize}x{ysize}"
            )));
        }
        let sx = xsize as f64 / self.xsize as f64;
        let sy = ysize as f64 / self.ysize as f64;

        let mut out = self.clone();
        out.xsize = xsize;
        out.ysize = ysize;
        for c in 0..4 {
            out.mat[0][c] *= sx;
            out.mat[1][c] *= sy;
        }
        let d = &mut out.dist_factor;
        if self.dist_version == 1 {
            d[0] *= sx;
            d[1] *= sy;
            d[2] /= sx * sy;
        } else {
            d[4] *= sx;
            d[5] *= sy;
            d[6] *= sx;
            d[7] *= sy;
        }
        Ok(out)
    }

    /// Maps an undistorted (ideal) pixel to where the lens images it.
    pub fn ideal_to_observed(&self, ix: f64, iy: f64) -> (f64, f64) {
        let d = &self.dist_factor;
        if self.dist_version == 1 {
            let x = (ix - d[0]) * d[3];
            let y = (iy - d[1]) * d[3];
            if x == 0.0 && y == 0.0 {
                return (d[0], d[1]);
            }
            let r2 = x * x + y * y;
            let p = 1.0 - d[2] / 100_000_000.0 * r2;
            (x * p / d[3] + d[0], y * p / d[3] + d[1])
        } else {
            let (k1, k2, p1, p2) = (d[0], d[1], d[2], d[3]);
            let (fx, fy, x0, y0, s) = (d[4], d[5], d[6], d[7], d[8]);
            let x = (ix - x0) * s / fx;
            let y = (iy - y0) * s / fy;
            let r2 = x * x + y * y;
            let l = 1.0 + k1 * r2 + k2 * r2 * r2;
            let dx = x * l + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = y * l + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            (fx * dx / s + x0, fy * dy / s + y0)
        }
    }

    /// Inverse of [`ideal_to_observed`](Self::ideal_to_observed), by fixed-point
    /// iteration with a bounded loop count.
    pub fn observed_to_ideal(&self, ox: f64, oy: f64) -> (f64, f64) {
        let (mut ix, mut iy) = (ox, oy);
        for _ in 0..MAX_UNDISTORT_ITERATIONS {
            let (px, py) = self.ideal_to_observed(ix, iy);
            let (ex, ey) = (ox - px, oy - py);
            ix += ex;
            iy += ey;
            if ex * ex + ey * ey < 1e-12 {
                break;
            }
        }
        (ix, iy)
    }

    /// Column-major right-handed projection matrix for a renderer.
    pub fn projection_matrix(&self, near: f64, far: f64) -> [f64; 16] {
        let w = self.xsize as f64;
        let h = self.ysize as f64;
        let m = &self.mat;

        let mut p = [[0.0; 4]; 4];
        p[0][0] = 2.0 * m[0][0] / w;
        p[0][1] = 2.0 * m[0][1] / w;
        p[0][2] = -(2.0 * m[0][2] / w - 1.0);
        p[1][1] = 2.0 * m[1][1] / h;
        p[1][2] = 2.0 * m[1][2] / h - 1.0;
        p[2][2] = -(far + near) / (far - near);
        p[2][3] = -2.0 * far * near / (far - near);
        p[3][2] = -1.0;

        let mut out = [0.0; 16];
        for (r, row) in p.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                out[c * 4 + r] = *v;
            }
        }
        out
    }
}

/// Load-once handle around shared camera parameters.
#[derive(Debug, Default)]
pub struct CameraModel {
    params: Option<Arc<CameraParams>>,
}

impl CameraModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and stores parameters; a second load on the same handle fails.
    pub fn load(&mut self, bytes: &[u8]) -> Result<()> {
        if self.params.is_some() {
            return Err(ArError::AlreadyLoaded);
        }
        let params = CameraParams::from_bytes(bytes)?;
        tracing::info!(
            xsize = params.xsize,
            ysize = params.ysize,
            dist_version = params.dist_version,
            "camera parameters loaded"
        );
        self.params = Some(Arc::new(params));
        Ok(())
    }

    pub fn params(&self) -> Result<Arc<CameraParams>> {
        self.params.clone().ok_or(ArError::NotInitialized)
    }

    pub fn is_loaded(&self) -> bool {
        self.params.is_some()
    }

    /// Drops the parameters; calling it again is a no-op.
    pub fn dispose(&mut self) {
        self.params = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn v4_camera() -> CameraParams {
        let mut p = CameraParams::from_intrinsics(640, 480, 600.0, 610.0, 320.0, 240.0);
        p.dist_factor[0] = -0.12;
        p.dist_factor[1] = 0.05;
        p.dist_factor[2] = 0.001;
        p.dist_factor[3] = -0.0005;
        p
    }

    #[test]
    fn binary_round_trip_selects_version_by_size() {
        let p = v4_camera();
        let bytes = p.to_bytes();
        assert_eq!(bytes.len(), 176);
        assert_eq!(CameraParams::from_bytes(&bytes).unwrap(), p);

        let mut v1 = CameraParams::from_intrinsics(320, 240, 300.0, 300.0, 160.0, 120.0);
        v1.dist_version = 1;
        v1.dist_factor = [160.0, 120.0, 50.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(v1.to_bytes().len(), 136);
        assert_eq!(CameraParams::from_bytes(&v1.to_bytes()).unwrap(), v1);
    }

    #[test]
    fn malformed_inputs_rejected() {
        assert!(matches!(
            CameraParams::from_bytes(&[0u8; 100]),
            Err(ArError::MalformedCamera(_))
        ));
        let mut bytes = v4_camera().to_bytes();
        bytes[0..4].copy_from_slice(&(-5i32).to_be_bytes());
        assert!(CameraParams::from_bytes(&bytes).is_err());
    }

    #[test]
    fn v1_scale_factor_must_be_positive() {
        let mut v1 = CameraParams::from_intrinsics(320, 240, 300.0, 300.0, 160.0, 120.0);
        v1.dist_version = 1;
        v1.dist_factor = [160.0, 120.0, 50.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert!(matches!(
            CameraParams::from_bytes(&v1.to_bytes()),
            Err(ArError::MalformedCamera(_))
        ));
        v1.dist_factor[3] = -1.0;
        let text = serde_json::to_string(&v1).unwrap();
        assert!(CameraParams::from_json(&text).is_err());
        v1.dist_factor[3] = 0.98;
        assert!(CameraParams::from_bytes(&v1.to_bytes()).is_ok());
    }

    #[test]
    fn json_form_matches_binary() {
        let p = v4_camera();
        let text = serde_json::to_string(&p).unwrap();
        assert_eq!(CameraParams::from_json(&text).unwrap(), p);
        assert!(CameraParams::from_json(r#"{"xsize":1}"#).is_err());
    }

    #[test]
    fn undistort_inverts_distort() {
        let p = v4_camera();
        for &(x, y) in &[(10.0, 15.0), (320.0, 240.0), (600.0, 400.0)] {
            let (ox, oy) = p.ideal_to_observed(x, y);
            let (ix, iy) = p.observed_to_ideal(ox, oy);
            assert_relative_eq!(ix, x, epsilon = 1e-4);
            assert_relative_eq!(iy, y, epsilon = 1e-4);
        }
    }

    #[test]
    fn change_size_scales_intrinsics() {
        let p = v4_camera().change_size(320, 240).unwrap();
        assert_relative_eq!(p.fx(), 300.0);
        assert_relative_eq!(p.cy(), 120.0);
        assert_relative_eq!(p.dist_factor[6], 160.0);
    }

    #[test]
    fn projection_maps_principal_point_to_center() {
        let p = CameraParams::from_intrinsics(640, 480, 500.0, 500.0, 320.0, 240.0);
        let m = p.projection_matrix(0.1, 1000.0);
        assert_relative_eq!(m[0], 2.0 * 500.0 / 640.0);
        assert_relative_eq!(m[8], 0.0);
        assert_relative_eq!(m[9], 0.0);
        assert_relative_eq!(m[11], -1.0);
        assert_relative_eq!(m[15], 0.0);
    }

    #[test]
    fn model_loads_once() {
        let bytes = v4_camera().to_bytes();
        let mut model = CameraModel::new();
        assert!(matches!(model.params(), Err(ArError::NotInitialized)));
        model.load(&bytes).unwrap();
        assert!(matches!(model.load(&bytes), Err(ArError::AlreadyLoaded)));
        model.dispose();
        model.dispose();
        assert!(!model.is_loaded());
    }
}
