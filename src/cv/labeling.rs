// src/cv/labeling.rs

//! Connected-component labeling of a binarized frame.
//!
//! Two-pass raster scan with a union-find table of provisional labels. The
//! table is capped; once full, pixels that would need a fresh label stay
//! unlabeled and [`Labeling::overflow`] is raised.
use serde::{Deserialize, Serialize};

use crate::{ArError, Result};

/// Pixel neighbourhood used to join foreground pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Connectivity {
    Four,
    #[default]
    Eight,
}

impl Connectivity {
    pub fn code(self) -> i32 {
        match self {
            Connectivity::Four => 4,
            Connectivity::Eight => 8,
        }
    }
}

impl TryFrom<i32> for Connectivity {
    type Error = ArError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            4 => Ok(Connectivity::Four),
            8 => Ok(Connectivity::Eight),
            other => Err(ArError::InvalidParameter(format!(
                "connectivity must be 4 or 8, got {other}"
            ))),
        }
    }
}

/// Output of [`label_components`].
#[derive(Debug, Clone, Default)]
pub struct Labeling {
    /// Final label per pixel, 0 for background or unlabeled.
    pub labels: Vec<u32>,
    /// Pixel count per final label; `areas[l - 1]` for label `l`.
    pub areas: Vec<u32>,
    /// Sum of pixel coordinates per label, for centroids.
    pub sums: Vec<(u64, u64)>,
    /// True when the provisional label table filled up.
    pub overflow: bool,
}

impl Labeling {
    pub fn count(&self) -> usize {
        self.areas.len()
    }

    /// Label at `(x, y)`, 0 when outside or background.
    pub fn label_at(&self, x: i32, y: i32, width: u32) -> u32 {
        if x < 0 || y < 0 || x as u32 >= width {
            return 0;
        }
        self.labels
            .get(y as usize * width as usize + x as usize)
            .copied()
            .unwrap_or(0)
    }

    pub fn area(&self, label: u32) -> u32 {
        if label == 0 {
            return 0;
        }
        self.areas.get(label as usize - 1).copied().unwrap_or(0)
    }

    pub fn centroid(&self, label: u32) -> Option<(f32, f32)> {
        let area = self.area(label);
        if area == 0 {
            return None;
        }
        let (sx, sy) = self.sums[label as usize - 1];
        Some((sx as f32 / area as f32, sy as f32 / area as f32))
    }
}

fn find(parent: &mut [u32], mut x: u32) -> u32 {
    while parent[x as usize] != x {
        let p = parent[x as usize];
        parent[x as usize] = parent[p as usize];
        x = p;
    }
    x
}

fn unite(parent: &mut [u32], a: u32, b: u32) -> u32 {
    let ra = find(parent, a);
    let rb = find(parent, b);
    let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
    parent[hi as usize] = lo;
    lo
}

/// Labels non-zero pixels of `binary`.
///
/// # Arguments
/// * `binary` - `width * height` bytes, non-zero is foreground.
/// * `max_labels` - Cap on provisional labels for the frame.
pub fn label_components(
    binary: &[u8],
    width: u32,
    height: u32,
    connectivity: Connectivity,
    max_labels: usize,
) -> Labeling {
    let w = width as usize;
    let h = height as usize;
    let mut labels = vec![0u32; w * h];
    // parent[0] is the background sentinel.
    let mut parent: Vec<u32> = vec![0];
    let mut overflow = false;

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            if binary[idx] == 0 {
                continue;
            }

            let mut neighbours = [0u32; 4];
            let mut n = 0;
            if x > 0 {
                neighbours[n] = labels[idx - 1];
                n += 1;
            }
            if y > 0 {
                neighbours[n] = labels[idx - w];
                n += 1;
                if connectivity == Connectivity::Eight {
                    if x > 0 {
                        neighbours[n] = labels[idx - w - 1];
                        n += 1;
                    }
                    if x + 1 < w {
                        neighbours[n] = labels[idx - w + 1];
                        n += 1;
                    }
                }
            }

            let mut current = 0u32;
            for &l in neighbours[..n].iter().filter(|&&l| l != 0) {
                current = if current == 0 {
                    l
                } else {
                    unite(&mut parent, current, l)
                };
            }

            if current == 0 {
                if parent.len() > max_labels {
                    overflow = true;
                    continue;
                }
                current = parent.len() as u32;
                parent.push(current);
            }
            labels[idx] = current;
        }
    }

    // Flatten roots into consecutive final labels.
    let mut remap = vec![0u32; parent.len()];
    let mut next = 0u32;
    for l in 1..parent.len() as u32 {
        let root = find(&mut parent, l);
        if remap[root as usize] == 0 {
            next += 1;
            remap[root as usize] = next;
        }
        remap[l as usize] = remap[root as usize];
    }

    let mut areas = vec![0u32; next as usize];
    let mut sums = vec![(0u64, 0u64); next as usize];
    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let l = remap[labels[idx] as usize];
            labels[idx] = l;
            if l != 0 {
                areas[l as usize - 1] += 1;
                let s = &mut sums[l as usize - 1];
                s.0 += x as u64;
                s.1 += y as u64;
            }
        }
    }

    Labeling {
        labels,
        areas,
        sums,
        overflow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: &[&str]) -> (Vec<u8>, u32, u32) {
        let h = rows.len() as u32;
        let w = rows[0].len() as u32;
        let data = rows
            .iter()
            .flat_map(|r| r.bytes().map(|b| if b == b'#' { 255 } else { 0 }))
            .collect();
        (data, w, h)
    }

    #[test]
    fn diagonal_pixels_depend_on_connectivity() {
        let (data, w, h) = grid(&["#..", ".#.", "..#"]);
        let four = label_components(&data, w, h, Connectivity::Four, 100);
        assert_eq!(four.count(), 3);
        let eight = label_components(&data, w, h, Connectivity::Eight, 100);
        assert_eq!(eight.count(), 1);
        assert_eq!(eight.area(1), 3);
    }

    #[test]
    fn u_shape_merges_into_one_label() {
        let (data, w, h) = grid(&["#.#", "#.#", "###"]);
        let l = label_components(&data, w, h, Connectivity::Four, 100);
        assert_eq!(l.count(), 1);
        assert_eq!(l.area(1), 7);
        let (cx, cy) = l.centroid(1).unwrap();
        assert!((cx - 1.0).abs() < 1e-6);
        assert!((cy - 8.0 / 7.0).abs() < 1e-6);
    }

    #[test]
    fn cap_stops_new_components() {
        let (data, w, h) = grid(&["#.#.#.#"]);
        let l = label_components(&data, w, h, Connectivity::Eight, 2);
        assert!(l.overflow);
        assert_eq!(l.count(), 2);
        assert_eq!(l.label_at(4, 0, w), 0);
        assert_eq!(l.label_at(6, 0, w), 0);
    }

    #[test]
    fn connectivity_codes() {
        assert_eq!(Connectivity::try_from(4).unwrap(), Connectivity::Four);
        assert_eq!(Connectivity::Eight.code(), 8);
        assert!(Connectivity::try_from(6).is_err());
    }
}
