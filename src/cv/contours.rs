// src/cv/contours.rs

//! Suzuki-Abe border following over a binarized frame.
use crate::{ImageBuffer, Point2i};

/// Copies `src` into `dst` surrounded by a one-pixel zero border, mapping
/// foreground to 1.
///
/// `dst` must hold `(width + 2) * (height + 2)` cells.
pub fn binary_border(src: &ImageBuffer, dst: &mut [i32]) {
    let width = src.width as usize;
    let padded = width + 2;

    dst[..padded].fill(0);
    for (y, row) in src.data.chunks_exact(width).enumerate() {
        let base = (y + 1) * padded;
        dst[base] = 0;
        for (x, &v) in row.iter().enumerate() {
            dst[base + 1 + x] = (v != 0) as i32;
        }
        dst[base + padded - 1] = 0;
    }
    let last = (src.height as usize + 1) * padded;
    dst[last..last + padded].fill(0);
}

/// Constant offsets for 8-directional sweeping (x, y).
pub const NEIGHBORHOOD: [[i32; 2]; 8] = [
    [1, 0],
    [1, -1],
    [0, -1],
    [-1, -1],
    [-1, 0],
    [-1, 1],
    [0, 1],
    [1, 1],
];

/// Flat-buffer offsets of [`NEIGHBORHOOD`] for a row stride, repeated twice
/// so a sweep can run past index 7 without wrapping.
pub fn neighborhood_deltas(stride: i32) -> [i32; 16] {
    let mut deltas = [0i32; 16];
    for (i, n) in NEIGHBORHOOD.iter().enumerate() {
        let delta = n[0] + n[1] * stride;
        deltas[i] = delta;
        deltas[i + 8] = delta;
    }
    deltas
}

/// A traced border.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contour {
    /// Border pixels in tracing order; the first one is where tracing began.
    pub points: Vec<Point2i>,
    /// Whether this border surrounds a hole.
    pub hole: bool,
}

/// Follows one border starting at `pos` and marks it with `nbd` in `src`.
pub fn border_following(
    src: &mut [i32],
    pos: usize,
    nbd: i32,
    mut point: Point2i,
    hole: bool,
    deltas: &[i32; 16],
) -> Contour {
    let mut contour = Contour {
        points: Vec::new(),
        hole,
    };

    let mut s: usize = if hole { 0 } else { 4 };
    let mut s_end = s;
    let mut pos1;

    loop {
        s = s.wrapping_sub(1) & 7;
        pos1 = (pos as isize + deltas[s] as isize) as usize;
        if src[pos1] != 0 || s == s_end {
            break;
        }
    }

    if s == s_end && src[pos1] == 0 {
        // Isolated pixel.
        src[pos] = -nbd;
        contour.points.push(point);
        return contour;
    }

    let mut pos3 = pos;
    loop {
        s_end = s;

        let pos4 = loop {
            s = (s + 1) & 15;
            let p = (pos3 as isize + deltas[s] as isize) as usize;
            if src[p] != 0 {
                break p;
            }
        };
        s &= 7;

        // Unsigned compare: `s - 1` wraps to a large value when s == 0.
        if (s.wrapping_sub(1) as u32) < s_end as u32 {
            src[pos3] = -nbd;
        } else if src[pos3] == 1 {
            src[pos3] = nbd;
        }

        contour.points.push(point);
        point.x += NEIGHBORHOOD[s][0];
        point.y += NEIGHBORHOOD[s][1];

        if pos4 == pos && pos3 == pos1 {
            break;
        }
        pos3 = pos4;
        s = (s + 4) & 7;
    }

    contour
}

/// Reusable contour extractor owning its padded scratch buffer.
#[derive(Debug, Clone)]
pub struct ContourTracer {
    width: u32,
    height: u32,
    scratch: Vec<i32>,
}

impl ContourTracer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            scratch: vec![0; ((width + 2) * (height + 2)) as usize],
        }
    }

    /// Traces every border of a binary image.
    ///
    /// With `outer_only`, hole borders are skipped (still marked so they are
    /// not revisited).
    pub fn trace(&mut self, image: &ImageBuffer, outer_only: bool) -> Vec<Contour> {
        if image.width != self.width || image.height != self.height {
            *self = ContourTracer::new(image.width, image.height);
        }
        let width = self.width as usize;
        let height = self.height as usize;
        let binary = &mut self.scratch;
        binary_border(image, binary);

        let deltas = neighborhood_deltas((width + 2) as i32);
        let mut contours = Vec::new();
        let mut pos = width + 3;
        let mut nbd = 1;

        for i in 0..height {
            for j in 0..width {
                let pix = binary[pos];
                if pix != 0 {
                    let outer = pix == 1 && binary[pos - 1] == 0;
                    let hole = !outer && pix >= 1 && binary[pos + 1] == 0;

                    if outer || hole {
                        nbd += 1;
                        let point = Point2i::new(j as i32, i as i32);
                        let contour = border_following(binary, pos, nbd, point, hole, &deltas);
                        if !(outer_only && hole) {
                            contours.push(contour);
                        }
                    }
                }
                pos += 1;
            }
            pos += 2;
        }

        contours
    }
}
