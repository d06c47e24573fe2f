// src/pose.rs

//! Marker pose representation and renderer matrix conversion.
//!
//! The native transform is a row-major 3x4 `[R | t]` in camera space with
//! x right, y down and z pointing away from the camera. Renderers want a
//! column-major 4x4 with y up and z towards the viewer; the two functions
//! here perform that conversion by copying and negating, never by any other
//! arithmetic, so results are exact.
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Row-major 3x4 rigid transform, marker frame to camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransMat(pub [[f64; 4]; 3]);

impl Default for TransMat {
    fn default() -> Self {
        Self::identity()
    }
}

impl TransMat {
    pub fn identity() -> Self {
        TransMat([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ])
    }

    pub fn from_parts(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Self {
        let mut m = [[0.0; 4]; 3];
        for (r, row) in m.iter_mut().enumerate() {
            for c in 0..3 {
                row[c] = rotation[(r, c)];
            }
            row[3] = translation[r];
        }
        TransMat(m)
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        let m = &self.0;
        Matrix3::new(
            m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
        )
    }

    pub fn translation(&self) -> Vector3<f64> {
        Vector3::new(self.0[0][3], self.0[1][3], self.0[2][3])
    }

    /// Applies the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation() * p + self.translation()
    }

    /// `self * other`, i.e. apply `other` first.
    pub fn compose(&self, other: &TransMat) -> TransMat {
        let r = self.rotation() * other.rotation();
        let t = self.rotation() * other.translation() + self.translation();
        TransMat::from_parts(&r, &t)
    }

    /// Inverse of a rigid transform (`R^T`, `-R^T t`).
    pub fn inverse(&self) -> TransMat {
        let rt = self.rotation().transpose();
        let t = -(rt * self.translation());
        TransMat::from_parts(&rt, &t)
    }

    pub fn to_quaternion(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&self.rotation()))
    }

    /// Angle in radians of the relative rotation between two transforms.
    pub fn rotation_angle_to(&self, other: &TransMat) -> f64 {
        self.to_quaternion().angle_to(&other.to_quaternion())
    }

    /// Flattened row-major 12 values, the layout hosts read back.
    pub fn to_array(&self) -> [f64; 12] {
        let mut out = [0.0; 12];
        for r in 0..3 {
            for c in 0..4 {
                out[r * 4 + c] = self.0[r][c];
            }
        }
        out
    }

    pub fn from_array(values: &[f64; 12]) -> Self {
        let mut m = [[0.0; 4]; 3];
        for r in 0..3 {
            for c in 0..4 {
                m[r][c] = values[r * 4 + c];
            }
        }
        TransMat(m)
    }
}

/// Converts the native 3x4 transform into a column-major 4x4.
///
/// When `scale` is given and non-zero the translation column is multiplied
/// by it (marker units to scene units).
pub fn to_render_matrix(trans: &TransMat, scale: Option<f64>) -> [f64; 16] {
    let t = &trans.0;
    let mut gl = [0.0; 16];
    for r in 0..3 {
        for c in 0..4 {
            gl[r + c * 4] = t[r][c];
        }
    }
    gl[3] = 0.0;
    gl[7] = 0.0;
    gl[11] = 0.0;
    gl[15] = 1.0;
    if let Some(s) = scale.filter(|s| *s != 0.0) {
        gl[12] *= s;
        gl[13] *= s;
        gl[14] *= s;
    }
    gl
}

/// Flips a column-major render matrix into the right-handed camera
/// convention by negating its Y and Z rows.
pub fn to_right_handed(gl: &[f64; 16], scale: Option<f64>) -> [f64; 16] {
    let mut rh = [0.0; 16];
    rh[0] = gl[0];
    rh[4] = gl[4];
    rh[8] = gl[8];
    rh[12] = gl[12];
    rh[1] = -gl[1];
    rh[5] = -gl[5];
    rh[9] = -gl[9];
    rh[13] = -gl[13];
    rh[2] = -gl[2];
    rh[6] = -gl[6];
    rh[10] = -gl[10];
    rh[14] = -gl[14];
    rh[3] = 0.0;
    rh[7] = 0.0;
    rh[11] = 0.0;
    rh[15] = 1.0;
    if let Some(s) = scale.filter(|s| *s != 0.0) {
        rh[12] *= s;
        rh[13] *= s;
        rh[14] *= s;
    }
    rh
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> TransMat {
        TransMat([
            [0.36, 0.48, -0.8, 12.5],
            [-0.8, 0.6, 0.0, -3.25],
            [0.48, 0.64, 0.6, 250.0],
        ])
    }

    #[test]
    fn render_matrix_is_column_major_copy() {
        let gl = to_render_matrix(&sample(), None);
        assert_eq!(gl[0], 0.36);
        assert_eq!(gl[1], -0.8);
        assert_eq!(gl[2], 0.48);
        assert_eq!(gl[4], 0.48);
        assert_eq!(gl[12], 12.5);
        assert_eq!(gl[13], -3.25);
        assert_eq!(gl[14], 250.0);
        assert_eq!(gl[15], 1.0);
        assert_eq!([gl[3], gl[7], gl[11]], [0.0, 0.0, 0.0]);
    }

    #[test]
    fn right_handed_negates_y_and_z_rows() {
        let gl = to_render_matrix(&sample(), None);
        let rh = to_right_handed(&gl, None);
        assert_eq!(rh[0], gl[0]);
        assert_eq!(rh[12], gl[12]);
        assert_eq!(rh[1], 0.8);
        assert_eq!(rh[13], 3.25);
        assert_eq!(rh[2], -0.48);
        assert_eq!(rh[14], -250.0);
    }

    #[test]
    fn conversion_is_repeatable_and_leaves_source_untouched() {
        let src = sample();
        let a = to_right_handed(&to_render_matrix(&src, None), None);
        let b = to_right_handed(&to_render_matrix(&src, None), None);
        assert_eq!(a, b);
        assert_eq!(src, sample());
    }

    #[test]
    fn scale_applies_to_translation_only() {
        let gl = to_render_matrix(&sample(), Some(0.5));
        assert_eq!(gl[12], 6.25);
        assert_eq!(gl[0], 0.36);
        let unscaled = to_render_matrix(&sample(), Some(0.0));
        assert_eq!(unscaled[14], 250.0);
    }

    #[test]
    fn inverse_composes_to_identity() {
        let r = Rotation3::from_euler_angles(0.3, -0.2, 0.9);
        let t = TransMat::from_parts(r.matrix(), &Vector3::new(4.0, -2.0, 100.0));
        let id = t.compose(&t.inverse());
        for (row, expected) in id.0.iter().zip(TransMat::identity().0.iter()) {
            for c in 0..4 {
                assert_relative_eq!(row[c], expected[c], epsilon = 1e-12);
            }
        }
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_relative_eq!(t.inverse().transform_point(&t.transform_point(&p)), p, epsilon = 1e-9);
    }

    #[test]
    fn flat_array_is_row_major() {
        let values = sample().to_array();
        assert_eq!(values[3], 12.5);
        assert_eq!(values[4], -0.8);
        assert_eq!(TransMat::from_array(&values), sample());
    }
}
