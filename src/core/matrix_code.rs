// src/core/matrix_code.rs

//! Matrix (barcode) marker decoding.
//!
//! The code grid fills the inner `patt_ratio` region of the marker. Three
//! corner cells fix the orientation: top-left and top-right are dark,
//! bottom-left is light. The remaining cells, bottom-right corner included,
//! carry data row-major with the most significant bit first. Dark cells
//! read as 1.
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::cv::geometry::inner_quad;
use crate::cv::scalar::ScalarCV;
use crate::cv::ComputerVision;
use crate::{ArError, ImageBuffer, MarkerCorners, Result};

/// Samples per cell side when reading the grid.
const CELL_SAMPLES: usize = 5;

/// Supported matrix code families (ARToolKit numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MatrixCodeType {
    #[default]
    Code3x3,
    Code3x3Parity65,
    Code3x3Hamming63,
    Code4x4,
    Code4x4Bch13_9_3,
    Code4x4Bch13_5_5,
}

impl MatrixCodeType {
    pub fn code(self) -> i32 {
        match self {
            MatrixCodeType::Code3x3 => 0x03,
            MatrixCodeType::Code3x3Parity65 => 0x103,
            MatrixCodeType::Code3x3Hamming63 => 0x203,
            MatrixCodeType::Code4x4 => 0x04,
            MatrixCodeType::Code4x4Bch13_9_3 => 0x304,
            MatrixCodeType::Code4x4Bch13_5_5 => 0x404,
        }
    }

    /// Cells per side of the code grid.
    pub fn grid_size(self) -> usize {
        match self {
            MatrixCodeType::Code3x3
            | MatrixCodeType::Code3x3Parity65
            | MatrixCodeType::Code3x3Hamming63 => 3,
            _ => 4,
        }
    }

    /// Data bits read from the grid (cells minus orientation corners).
    pub fn raw_bits(self) -> u32 {
        let n = self.grid_size() as u32;
        n * n - 3
    }

    /// Number of distinct ids the family can carry.
    pub fn id_count(self) -> u32 {
        match self {
            MatrixCodeType::Code3x3 => 64,
            MatrixCodeType::Code3x3Parity65 => 32,
            MatrixCodeType::Code3x3Hamming63 => 8,
            MatrixCodeType::Code4x4 => 8192,
            MatrixCodeType::Code4x4Bch13_9_3 => 512,
            MatrixCodeType::Code4x4Bch13_5_5 => 32,
        }
    }

    /// Bit errors the family corrects.
    pub fn correctable(self) -> u32 {
        match self {
            MatrixCodeType::Code3x3Hamming63 | MatrixCodeType::Code4x4Bch13_9_3 => 1,
            MatrixCodeType::Code4x4Bch13_5_5 => 2,
            _ => 0,
        }
    }

    /// Encodes an id into the raw grid bits.
    pub fn encode(self, id: u32) -> Option<u32> {
        if id >= self.id_count() {
            return None;
        }
        Some(match self {
            MatrixCodeType::Code3x3 | MatrixCodeType::Code4x4 => id,
            MatrixCodeType::Code3x3Parity65 => (id << 1) | (id.count_ones() & 1),
            MatrixCodeType::Code3x3Hamming63 => {
                let d0 = id & 1;
                let d1 = (id >> 1) & 1;
                let d2 = (id >> 2) & 1;
                (id << 3) | ((d1 ^ d2) << 2) | ((d0 ^ d2) << 1) | (d0 ^ d1)
            }
            MatrixCodeType::Code4x4Bch13_9_3 => bch_encode(id, 0b1_0011, 4),
            MatrixCodeType::Code4x4Bch13_5_5 => bch_encode(id, 0b1_1101_0001, 8),
        })
    }

    /// Decodes raw grid bits.
    ///
    /// # Returns
    /// `(id, corrected_bit_errors)`, or `None` when the word is invalid or
    /// equally close to two codewords.
    pub fn decode(self, raw: u32) -> Option<(u32, u32)> {
        match self {
            MatrixCodeType::Code3x3 | MatrixCodeType::Code4x4 => {
                Some((raw & ((1 << self.raw_bits()) - 1), 0))
            }
            MatrixCodeType::Code3x3Parity65 => {
                if raw.count_ones() % 2 == 0 {
                    Some((raw >> 1, 0))
                } else {
                    None
                }
            }
            _ => nearest_codeword(self.codebook(), raw, self.correctable()),
        }
    }

    fn codebook(self) -> &'static [u32] {
        static HAMMING63: OnceLock<Vec<u32>> = OnceLock::new();
        static BCH_9_3: OnceLock<Vec<u32>> = OnceLock::new();
        static BCH_5_5: OnceLock<Vec<u32>> = OnceLock::new();
        let cell = match self {
            MatrixCodeType::Code3x3Hamming63 => &HAMMING63,
            MatrixCodeType::Code4x4Bch13_9_3 => &BCH_9_3,
            MatrixCodeType::Code4x4Bch13_5_5 => &BCH_5_5,
            _ => return &[],
        };
        cell.get_or_init(|| {
            (0..self.id_count())
                .filter_map(|id| self.encode(id))
                .collect()
        })
    }
}

impl TryFrom<i32> for MatrixCodeType {
    type Error = ArError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0x03 => MatrixCodeType::Code3x3,
            0x103 => MatrixCodeType::Code3x3Parity65,
            0x203 => MatrixCodeType::Code3x3Hamming63,
            0x04 => MatrixCodeType::Code4x4,
            0x304 => MatrixCodeType::Code4x4Bch13_9_3,
            0x404 => MatrixCodeType::Code4x4Bch13_5_5,
            other => {
                return Err(ArError::InvalidParameter(format!(
                    "unknown matrix code type {other:#x}"
                )))
            }
        })
    }
}

/// Systematic cyclic encoding: data followed by the remainder modulo `poly`.
fn bch_encode(data: u32, poly: u32, degree: u32) -> u32 {
    let mut rem = data << degree;
    let top = 31 - poly.leading_zeros();
    while rem != 0 && 31 - rem.leading_zeros() >= top {
        let shift = (31 - rem.leading_zeros()) - top;
        rem ^= poly << shift;
    }
    (data << degree) | rem
}

fn nearest_codeword(book: &[u32], raw: u32, max_errors: u32) -> Option<(u32, u32)> {
    let mut best: Option<(u32, u32)> = None;
    let mut tied = false;
    for (id, &word) in book.iter().enumerate() {
        let d = (word ^ raw).count_ones();
        match best {
            Some((_, bd)) if d > bd => {}
            Some((_, bd)) if d == bd => tied = true,
            _ => {
                best = Some((id as u32, d));
                tied = false;
            }
        }
    }
    match best {
        Some((id, d)) if d <= max_errors && !tied => Some((id, d)),
        _ => None,
    }
}

/// Rotates a flat `dim` x `dim` grid by 90 degrees clockwise.
/// `src[i][j] -> dst[j][dim - 1 - i]`
pub fn rotate_grid(src: &[u8], dim: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dim * dim];
    for i in 0..dim {
        for j in 0..dim {
            dst[j * dim + (dim - 1 - i)] = src[i * dim + j];
        }
    }
    dst
}

/// A successfully read matrix marker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatrixMatch {
    pub id: u32,
    /// Clockwise quarter turns from the sampled grid to the marker's upright
    /// orientation; vertex `i` of the marker is quad vertex `(i + 4 - dir) % 4`.
    pub direction: usize,
    pub errors: u32,
    pub confidence: f32,
}

/// Samples the code grid inside `quad` and decodes it.
pub fn read_matrix(
    image: &ImageBuffer,
    quad: &MarkerCorners,
    code_type: MatrixCodeType,
    patt_ratio: f64,
    min_contrast: u8,
) -> Option<MatrixMatch> {
    let n = code_type.grid_size();
    let side = n * CELL_SAMPLES;
    let mut patch = vec![0u8; side * side];
    ScalarCV::warp(image, &mut patch, &inner_quad(quad, patt_ratio), side);

    // Average the central samples of each cell.
    let mut means = vec![0f32; n * n];
    for cy in 0..n {
        for cx in 0..n {
            let mut acc = 0u32;
            let mut cnt = 0u32;
            for sy in 1..CELL_SAMPLES - 1 {
                for sx in 1..CELL_SAMPLES - 1 {
                    acc += patch[(cy * CELL_SAMPLES + sy) * side + cx * CELL_SAMPLES + sx] as u32;
                    cnt += 1;
                }
            }
            means[cy * n + cx] = acc as f32 / cnt as f32;
        }
    }

    let lo = means.iter().copied().fold(f32::MAX, f32::min);
    let hi = means.iter().copied().fold(f32::MIN, f32::max);
    if hi - lo < min_contrast as f32 {
        tracing::trace!(contrast = hi - lo, "matrix candidate below contrast");
        return None;
    }
    let mid = (lo + hi) * 0.5;
    let mut grid: Vec<u8> = means.iter().map(|&m| (m < mid) as u8).collect();

    let tl = 0;
    let tr = n - 1;
    let bl = n * (n - 1);
    for direction in 0..4 {
        if grid[tl] == 1 && grid[tr] == 1 && grid[bl] == 0 {
            let mut raw = 0u32;
            for (idx, &bit) in grid.iter().enumerate() {
                if idx == tl || idx == tr || idx == bl {
                    continue;
                }
                raw = (raw << 1) | bit as u32;
            }
            let (id, errors) = code_type.decode(raw)?;
            return Some(MatrixMatch {
                id,
                direction,
                errors,
                confidence: 1.0 - 0.25 * errors as f32,
            });
        }
        grid = rotate_grid(&grid, n);
    }
    None
}
