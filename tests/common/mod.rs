// tests/common/mod.rs
#![allow(dead_code)]

use artrack_rs::core::pattern::{Pattern, AR_PATT_SIZE};
use artrack_rs::{CameraParams, MatrixCodeType, TransMat};
use nalgebra::{Matrix3, Rotation3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 240;

pub fn camera() -> CameraParams {
    CameraParams::from_intrinsics(WIDTH, HEIGHT, 400.0, 400.0, 160.0, 120.0)
}

/// Frontal pose (marker facing the camera, upright) turned by `rx`, `ry`
/// degrees and placed at `t`.
pub fn marker_pose(rx: f64, ry: f64, t: [f64; 3]) -> TransMat {
    let frontal = Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, -1.0));
    let tilt = Rotation3::from_euler_angles(rx.to_radians(), ry.to_radians(), 0.0);
    TransMat::from_parts(&(tilt.into_inner() * frontal), &Vector3::new(t[0], t[1], t[2]))
}

/// Cells of an upright matrix marker, row-major, `true` = dark.
pub fn matrix_cells(code: MatrixCodeType, id: u32) -> Vec<bool> {
    let n = code.grid_size();
    let raw = code.encode(id).expect("id in range");
    let bits = code.raw_bits();
    let mut cells = vec![false; n * n];
    cells[0] = true;
    cells[n - 1] = true;
    let mut b = 0;
    for (idx, cell) in cells.iter_mut().enumerate() {
        if idx == 0 || idx == n - 1 || idx == n * (n - 1) {
            continue;
        }
        *cell = (raw >> (bits - 1 - b)) & 1 == 1;
        b += 1;
    }
    cells
}

/// Something planar that can be drawn: returns the luma at marker-plane
/// coordinates (millimetres, y up), or `None` outside.
pub trait Planar {
    fn shade(&self, x: f64, y: f64) -> Option<f64>;
}

/// Square matrix marker centred on the origin: 25% black border, code grid
/// in the inner half.
pub struct MatrixMarker {
    pub width: f64,
    pub cells: Vec<bool>,
    pub grid: usize,
}

impl MatrixMarker {
    pub fn new(code: MatrixCodeType, id: u32, width: f64) -> Self {
        Self {
            width,
            cells: matrix_cells(code, id),
            grid: code.grid_size(),
        }
    }
}

impl Planar for MatrixMarker {
    fn shade(&self, x: f64, y: f64) -> Option<f64> {
        let h = self.width / 2.0;
        if x < -h || x > h || y < -h || y > h {
            return None;
        }
        // Top-left origin, unit square.
        let u = (x + h) / self.width;
        let v = (h - y) / self.width;
        if !(0.25..0.75).contains(&u) || !(0.25..0.75).contains(&v) {
            return Some(0.0);
        }
        let cx = (((u - 0.25) / 0.5) * self.grid as f64) as usize;
        let cy = (((v - 0.25) / 0.5) * self.grid as f64) as usize;
        let dark = self.cells[cy.min(self.grid - 1) * self.grid + cx.min(self.grid - 1)];
        Some(if dark { 0.0 } else { 255.0 })
    }
}

/// Upright 16x16 template, row-major from the top. Dark blocks sit on the
/// top, left and centre of a 3x3 split and the corners stay white, so it
/// has no rotational symmetry and never reads as a matrix code.
pub fn asymmetric_pattern() -> Vec<u8> {
    let n = AR_PATT_SIZE;
    let mut luma = vec![255u8; n * n];
    for r in 1..n - 1 {
        for c in 1..n - 1 {
            let block = (r * 3 / n, c * 3 / n);
            if matches!(block, (0, 1) | (1, 0) | (1, 1)) {
                luma[r * n + c] = 0;
            }
        }
    }
    luma
}

/// Square template marker centred on the origin: 25% black border, the
/// pattern image in the inner half.
pub struct PatternMarker {
    pub width: f64,
    pub luma: Vec<u8>,
}

impl PatternMarker {
    pub fn new(luma: Vec<u8>, width: f64) -> Self {
        assert_eq!(luma.len(), AR_PATT_SIZE * AR_PATT_SIZE);
        Self { width, luma }
    }

    /// The `.patt` text a host would load for this marker.
    pub fn patt_text(&self) -> String {
        let rgb: Vec<u8> = self.luma.iter().flat_map(|&g| [g, g, g]).collect();
        Pattern::from_rgb(&rgb, AR_PATT_SIZE)
            .expect("pattern image")
            .to_patt_string()
    }
}

impl Planar for PatternMarker {
    fn shade(&self, x: f64, y: f64) -> Option<f64> {
        let h = self.width / 2.0;
        if x < -h || x > h || y < -h || y > h {
            return None;
        }
        let u = (x + h) / self.width;
        let v = (h - y) / self.width;
        if !(0.25..0.75).contains(&u) || !(0.25..0.75).contains(&v) {
            return Some(0.0);
        }
        let n = AR_PATT_SIZE;
        let cx = ((((u - 0.25) / 0.5) * n as f64) as usize).min(n - 1);
        let cy = ((((v - 0.25) / 0.5) * n as f64) as usize).min(n - 1);
        Some(self.luma[cy * n + cx] as f64)
    }
}

/// Projects a marker-plane point through the test camera.
pub fn project(pose: &TransMat, x: f64, y: f64) -> (f64, f64) {
    let cam = camera();
    let p = pose.transform_point(&Vector3::new(x, y, 0.0));
    (cam.fx() * p.x / p.z + cam.cx(), cam.fy() * p.y / p.z + cam.cy())
}

/// Grayscale image on the plane, origin at its bottom-left corner, y up.
pub struct PlanarImage<'a> {
    pub luma: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub mm_per_px: f64,
}

impl Planar for PlanarImage<'_> {
    fn shade(&self, x: f64, y: f64) -> Option<f64> {
        let px = x / self.mm_per_px;
        let py = self.height as f64 - y / self.mm_per_px;
        if px < 0.0 || py < 0.0 || px >= self.width as f64 || py >= self.height as f64 {
            return None;
        }
        Some(self.luma[py as usize * self.width as usize + px as usize] as f64)
    }
}

/// Ray-casts every pixel (4x4 supersampled) onto the planes, front to back
/// in list order. Background is white. Returns RGBA.
pub fn render(camera: &CameraParams, items: &[(&dyn Planar, TransMat)]) -> Vec<u8> {
    const SS: usize = 4;
    let (w, h) = (camera.xsize as usize, camera.ysize as usize);
    let k_inv = camera.intrinsics().try_inverse().expect("invertible");
    let prepared: Vec<(Matrix3<f64>, Vector3<f64>)> = items
        .iter()
        .map(|(_, pose)| {
            let rt = pose.rotation().transpose();
            (rt, -(rt * pose.translation()))
        })
        .collect();

    let mut out = vec![0u8; w * h * 4];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for sy in 0..SS {
                for sx in 0..SS {
                    let u = x as f64 - 0.5 + (sx as f64 + 0.5) / SS as f64;
                    let v = y as f64 - 0.5 + (sy as f64 + 0.5) / SS as f64;
                    let ray = k_inv * Vector3::new(u, v, 1.0);
                    let mut value = 255.0;
                    for ((item, _), (rt, origin)) in items.iter().zip(&prepared) {
                        let dir = rt * ray;
                        if dir.z.abs() < 1e-12 {
                            continue;
                        }
                        let lambda = -origin.z / dir.z;
                        if lambda <= 0.0 {
                            continue;
                        }
                        let p = origin + dir * lambda;
                        if let Some(s) = item.shade(p.x, p.y) {
                            value = s;
                            break;
                        }
                    }
                    acc += value;
                }
            }
            let g = (acc / (SS * SS) as f64).round().clamp(0.0, 255.0) as u8;
            out[(y * w + x) * 4..(y * w + x) * 4 + 4].copy_from_slice(&[g, g, g, 255]);
        }
    }
    out
}

/// Copies a luma image into a white RGBA frame at an offset.
pub fn paste_rgba(luma: &[u8], lw: u32, lh: u32, ox: u32, oy: u32) -> Vec<u8> {
    let mut out = vec![255u8; (WIDTH * HEIGHT * 4) as usize];
    for y in 0..lh {
        for x in 0..lw {
            let (fx, fy) = (x + ox, y + oy);
            if fx >= WIDTH || fy >= HEIGHT {
                continue;
            }
            let g = luma[(y * lw + x) as usize];
            let i = ((fy * WIDTH + fx) * 4) as usize;
            out[i..i + 4].copy_from_slice(&[g, g, g, 255]);
        }
    }
    out
}

pub fn blank_rgba(value: u8) -> Vec<u8> {
    let mut out = vec![value; (WIDTH * HEIGHT * 4) as usize];
    for px in out.chunks_exact_mut(4) {
        px[3] = 255;
    }
    out
}

/// Random dark rectangles on a light background.
pub fn textured_page(w: u32, h: u32, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = vec![230u8; (w * h) as usize];
    for _ in 0..(w * h / 400) {
        let (bw, bh) = (rng.gen_range(4..16), rng.gen_range(4..16));
        let (x0, y0) = (rng.gen_range(0..w - bw), rng.gen_range(0..h - bh));
        let v: u8 = rng.gen_range(0..160);
        for y in y0..y0 + bh {
            for x in x0..x0 + bw {
                img[(y * w + x) as usize] = v;
            }
        }
    }
    img
}

/// Full frame of dark Gaussian blobs centred in 16 px cells; every blob is
/// a scale-space extremum, so the frame carries a few hundred features.
pub fn blob_field_rgba() -> Vec<u8> {
    const CELL: i32 = 16;
    let mut out = blank_rgba(200);
    for y in 0..HEIGHT as i32 {
        for x in 0..WIDTH as i32 {
            let mut g = 200.0f32;
            for j in (y / CELL - 1)..=(y / CELL + 1) {
                for i in (x / CELL - 1)..=(x / CELL + 1) {
                    if i < 0 || j < 0 || i >= WIDTH as i32 / CELL || j >= HEIGHT as i32 / CELL {
                        continue;
                    }
                    let (cx, cy) = ((i * CELL + CELL / 2) as f32, (j * CELL + CELL / 2) as f32);
                    let sigma = 2.5 + ((i + j) % 3) as f32 * 0.5;
                    let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
                    g = g.min(200.0 - 150.0 * (-d2 / (2.0 * sigma * sigma)).exp());
                }
            }
            let p = ((y as u32 * WIDTH + x as u32) * 4) as usize;
            out[p..p + 3].fill(g as u8);
        }
    }
    out
}
