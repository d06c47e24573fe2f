// src/nft/dataset.rs

//! NFT reference datasets: image pyramid, template tracking points and
//! described keypoints, stored as three little-endian files next to each
//! other (`<prefix>.iset`, `<prefix>.fset`, `<prefix>.fset3`).
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::nft::descriptor::Descriptor;
use crate::nft::features::{extract, FeatureParams, Keypoint};
use crate::{ArError, Result};

const ISET_MAGIC: &[u8; 4] = b"ISET";
const FSET_MAGIC: &[u8; 4] = b"FSET";
const FSET3_MAGIC: &[u8; 4] = b"FST3";
const FORMAT_VERSION: u32 = 1;

/// One level of the reference image pyramid.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageLevel {
    pub width: u32,
    pub height: u32,
    pub dpi: f32,
    pub pixels: Vec<u8>,
}

impl ImageLevel {
    #[inline]
    pub fn get(&self, x: i32, y: i32) -> u8 {
        let x = x.clamp(0, self.width as i32 - 1) as u32;
        let y = y.clamp(0, self.height as i32 - 1) as u32;
        self.pixels[(y * self.width + x) as usize]
    }

    /// Bilinear sample in level pixels, clamped at the borders.
    pub fn sample(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let (fx, fy) = (x - x0, y - y0);
        let (xi, yi) = (x0 as i32, y0 as i32);
        let top = self.get(xi, yi) as f32 * (1.0 - fx) + self.get(xi + 1, yi) as f32 * fx;
        let bottom =
            self.get(xi, yi + 1) as f32 * (1.0 - fx) + self.get(xi + 1, yi + 1) as f32 * fx;
        top * (1.0 - fy) + bottom * fy
    }

    fn half(&self) -> ImageLevel {
        let (w, h) = (self.width / 2, self.height / 2);
        let mut pixels = Vec::with_capacity((w * h) as usize);
        for y in 0..h as i32 {
            for x in 0..w as i32 {
                let sum = self.get(2 * x, 2 * y) as u32
                    + self.get(2 * x + 1, 2 * y) as u32
                    + self.get(2 * x, 2 * y + 1) as u32
                    + self.get(2 * x + 1, 2 * y + 1) as u32;
                pixels.push(((sum + 2) / 4) as u8);
            }
        }
        ImageLevel {
            width: w,
            height: h,
            dpi: self.dpi * 0.5,
            pixels,
        }
    }
}

/// Raw contents of the three dataset files. `None` marks a missing file.
#[derive(Debug, Clone, Default)]
pub struct NftPageFiles {
    pub iset: Option<Vec<u8>>,
    pub fset: Option<Vec<u8>>,
    pub fset3: Option<Vec<u8>>,
}

impl NftPageFiles {
    /// Reads whichever of `<prefix>.iset/.fset/.fset3` exist.
    pub fn from_prefix(prefix: impl AsRef<Path>) -> Result<Self> {
        let prefix = prefix.as_ref();
        let read = |ext: &str| -> Result<Option<Vec<u8>>> {
            match std::fs::read(with_extension(prefix, ext)) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        };
        Ok(Self {
            iset: read("iset")?,
            fset: read("fset")?,
            fset3: read("fset3")?,
        })
    }

    /// Writes all present files under `prefix`.
    pub fn write_prefix(&self, prefix: impl AsRef<Path>) -> Result<()> {
        let prefix = prefix.as_ref();
        for (ext, bytes) in [("iset", &self.iset), ("fset", &self.fset), ("fset3", &self.fset3)] {
            if let Some(bytes) = bytes {
                std::fs::write(with_extension(prefix, ext), bytes)?;
            }
        }
        Ok(())
    }
}

fn with_extension(prefix: &Path, ext: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Settings for [`NftDataset::generate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetParams {
    /// Pyramid levels including the full-resolution image.
    pub levels: usize,
    /// Levels stop before either side drops under this.
    pub min_level_side: u32,
    pub features: FeatureParams,
    /// Template tracking points kept per level.
    pub tracking_points: usize,
    /// Minimum spacing between tracking points, level pixels.
    pub tracking_spacing: f32,
}

impl Default for DatasetParams {
    fn default() -> Self {
        Self {
            levels: 3,
            min_level_side: 32,
            features: FeatureParams {
                max_features: 1000,
                ..FeatureParams::default()
            },
            tracking_points: 60,
            tracking_spacing: 12.0,
        }
    }
}

/// A loaded NFT page.
#[derive(Debug, Clone)]
pub struct NftDataset {
    pub levels: Vec<ImageLevel>,
    /// Template tracking points per level, in that level's pixels.
    pub tracking_points: Vec<Vec<[f32; 2]>>,
    /// Reference keypoints in level-0 pixels; `octave` holds the level.
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl NftDataset {
    pub fn width(&self) -> u32 {
        self.levels[0].width
    }

    pub fn height(&self) -> u32 {
        self.levels[0].height
    }

    pub fn dpi(&self) -> f32 {
        self.levels[0].dpi
    }

    /// Builds a dataset from a reference luma image.
    pub fn generate(luma: &[u8], width: u32, height: u32, dpi: f32, params: &DatasetParams) -> Result<Self> {
        if luma.len() != (width as usize) * (height as usize) {
            return Err(ArError::InvalidBuffer {
                expected: (width as usize) * (height as usize),
                got: luma.len(),
            });
        }
        if !(dpi > 0.0 && dpi.is_finite()) {
            return Err(ArError::InvalidParameter(format!("dpi must be positive, got {dpi}")));
        }

        let features = extract(luma, width, height, &params.features)?;
        let mut levels = vec![ImageLevel {
            width,
            height,
            dpi,
            pixels: luma.to_vec(),
        }];
        while levels.len() < params.levels.max(1) {
            let next = levels[levels.len() - 1].half();
            if next.width < params.min_level_side || next.height < params.min_level_side {
                break;
            }
            levels.push(next);
        }

        let tracking_points = levels
            .iter()
            .map(|l| select_tracking_points(l, params.tracking_points, params.tracking_spacing))
            .collect();

        let dataset = Self {
            levels,
            tracking_points,
            keypoints: features.keypoints,
            descriptors: features.descriptors,
        };
        info!(
            width,
            height,
            dpi,
            levels = dataset.levels.len(),
            keypoints = dataset.keypoints.len(),
            "generated NFT dataset"
        );
        Ok(dataset)
    }

    /// Parses and cross-checks the three files.
    pub fn from_files(files: &NftPageFiles) -> Result<Self> {
        let iset = files.iset.as_deref().ok_or(ArError::IncompleteDataset("iset"))?;
        let fset = files.fset.as_deref().ok_or(ArError::IncompleteDataset("fset"))?;
        let fset3 = files.fset3.as_deref().ok_or(ArError::IncompleteDataset("fset3"))?;

        let levels = parse_iset(iset)?;
        let tracking_points = parse_fset(fset, &levels)?;
        let (keypoints, descriptors) = parse_fset3(fset3, &levels)?;
        debug!(
            levels = levels.len(),
            keypoints = keypoints.len(),
            "parsed NFT dataset"
        );
        Ok(Self {
            levels,
            tracking_points,
            keypoints,
            descriptors,
        })
    }

    pub fn load_prefix(prefix: impl AsRef<Path>) -> Result<Self> {
        Self::from_files(&NftPageFiles::from_prefix(prefix)?)
    }

    pub fn to_files(&self) -> NftPageFiles {
        let mut iset = Vec::new();
        iset.extend_from_slice(ISET_MAGIC);
        put_u32(&mut iset, FORMAT_VERSION);
        put_u32(&mut iset, self.levels.len() as u32);
        for l in &self.levels {
            put_u32(&mut iset, l.width);
            put_u32(&mut iset, l.height);
            iset.extend_from_slice(&l.dpi.to_le_bytes());
            iset.extend_from_slice(&l.pixels);
        }

        let mut fset = Vec::new();
        fset.extend_from_slice(FSET_MAGIC);
        put_u32(&mut fset, FORMAT_VERSION);
        put_u32(&mut fset, self.tracking_points.len() as u32);
        for points in &self.tracking_points {
            put_u32(&mut fset, points.len() as u32);
            for p in points {
                fset.extend_from_slice(&p[0].to_le_bytes());
                fset.extend_from_slice(&p[1].to_le_bytes());
            }
        }

        let mut fset3 = Vec::new();
        fset3.extend_from_slice(FSET3_MAGIC);
        put_u32(&mut fset3, FORMAT_VERSION);
        put_u32(&mut fset3, self.keypoints.len() as u32);
        for (k, d) in self.keypoints.iter().zip(&self.descriptors) {
            for v in [k.x, k.y, k.angle, k.scale] {
                fset3.extend_from_slice(&v.to_le_bytes());
            }
            put_u32(&mut fset3, k.octave);
            fset3.extend_from_slice(d);
        }

        NftPageFiles {
            iset: Some(iset),
            fset: Some(fset),
            fset3: Some(fset3),
        }
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Bounds-checked little-endian cursor.
struct LeReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    file: &'static str,
}

impl<'a> LeReader<'a> {
    fn new(bytes: &'a [u8], file: &'static str) -> Self {
        Self { bytes, pos: 0, file }
    }

    fn malformed(&self, what: impl std::fmt::Display) -> ArError {
        ArError::MalformedDataset(format!("{}: {what}", self.file))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len());
        let Some(end) = end else {
            return Err(self.malformed(format!("truncated at byte {}", self.pos)));
        };
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn f32(&mut self) -> Result<f32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        let v = f32::from_le_bytes(b);
        if !v.is_finite() {
            return Err(self.malformed("non-finite value"));
        }
        Ok(v)
    }

    fn header(&mut self, magic: &[u8; 4]) -> Result<u32> {
        if self.take(4)? != magic {
            return Err(self.malformed("bad magic"));
        }
        let version = self.u32()?;
        if version != FORMAT_VERSION {
            return Err(self.malformed(format!("unsupported version {version}")));
        }
        self.u32()
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.bytes.len() {
            return Err(self.malformed(format!("{} trailing bytes", self.bytes.len() - self.pos)));
        }
        Ok(())
    }
}

fn parse_iset(bytes: &[u8]) -> Result<Vec<ImageLevel>> {
    let mut r = LeReader::new(bytes, "iset");
    let count = r.header(ISET_MAGIC)?;
    if count == 0 {
        return Err(r.malformed("no image levels"));
    }
    let mut levels = Vec::new();
    for i in 0..count {
        let width = r.u32()?;
        let height = r.u32()?;
        let dpi = r.f32()?;
        if width == 0 || height == 0 || dpi <= 0.0 {
            return Err(r.malformed(format!("level {i} has size {width}x{height} at {dpi} dpi")));
        }
        let n = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| r.malformed(format!("level {i} is too large")))?;
        let pixels = r.take(n)?.to_vec();
        levels.push(ImageLevel {
            width,
            height,
            dpi,
            pixels,
        });
    }
    r.finish()?;
    Ok(levels)
}

fn parse_fset(bytes: &[u8], levels: &[ImageLevel]) -> Result<Vec<Vec<[f32; 2]>>> {
    let mut r = LeReader::new(bytes, "fset");
    let count = r.header(FSET_MAGIC)? as usize;
    if count != levels.len() {
        return Err(r.malformed(format!(
            "{count} point levels for {} image levels",
            levels.len()
        )));
    }
    let mut out = Vec::with_capacity(count);
    for (i, level) in levels.iter().enumerate() {
        let n = r.u32()? as usize;
        if n > bytes.len() / 8 {
            return Err(r.malformed(format!("level {i} claims {n} points")));
        }
        let mut points = Vec::with_capacity(n);
        for _ in 0..n {
            let x = r.f32()?;
            let y = r.f32()?;
            if x < 0.0 || y < 0.0 || x >= level.width as f32 || y >= level.height as f32 {
                return Err(r.malformed(format!("point ({x}, {y}) outside level {i}")));
            }
            points.push([x, y]);
        }
        out.push(points);
    }
    r.finish()?;
    Ok(out)
}

fn parse_fset3(bytes: &[u8], levels: &[ImageLevel]) -> Result<(Vec<Keypoint>, Vec<Descriptor>)> {
    let mut r = LeReader::new(bytes, "fset3");
    let count = r.header(FSET3_MAGIC)? as usize;
    if count > bytes.len() / 52 {
        return Err(r.malformed(format!("claims {count} keypoints")));
    }
    let (w, h) = (levels[0].width as f32, levels[0].height as f32);
    let mut keypoints = Vec::with_capacity(count);
    let mut descriptors = Vec::with_capacity(count);
    for _ in 0..count {
        let x = r.f32()?;
        let y = r.f32()?;
        let angle = r.f32()?;
        let scale = r.f32()?;
        let level = r.u32()?;
        if x < 0.0 || y < 0.0 || x > w || y > h || scale <= 0.0 {
            return Err(r.malformed(format!("keypoint ({x}, {y}) scale {scale} out of range")));
        }
        let mut d = [0u8; 32];
        d.copy_from_slice(r.take(32)?);
        keypoints.push(Keypoint {
            x,
            y,
            scale,
            angle,
            score: 0.0,
            octave: level,
        });
        descriptors.push(d);
    }
    r.finish()?;
    Ok((keypoints, descriptors))
}

/// Shi-Tomasi corners, strongest first, at least `spacing` apart.
fn select_tracking_points(level: &ImageLevel, max_points: usize, spacing: f32) -> Vec<[f32; 2]> {
    const WINDOW: i32 = 3;
    let border = 8;
    let (w, h) = (level.width as i32, level.height as i32);
    if w <= 2 * border || h <= 2 * border {
        return Vec::new();
    }

    let mut scored = Vec::new();
    for y in (border..h - border).step_by(2) {
        for x in (border..w - border).step_by(2) {
            let (mut sxx, mut syy, mut sxy) = (0f32, 0f32, 0f32);
            for dy in -WINDOW..=WINDOW {
                for dx in -WINDOW..=WINDOW {
                    let (px, py) = (x + dx, y + dy);
                    let gx = (level.get(px + 1, py) as f32 - level.get(px - 1, py) as f32) * 0.5;
                    let gy = (level.get(px, py + 1) as f32 - level.get(px, py - 1) as f32) * 0.5;
                    sxx += gx * gx;
                    syy += gy * gy;
                    sxy += gx * gy;
                }
            }
            let half_tr = 0.5 * (sxx + syy);
            let min_eig = half_tr - (0.25 * (sxx - syy).powi(2) + sxy * sxy).sqrt();
            if min_eig > 1.0 {
                scored.push((min_eig, x, y));
            }
        }
    }
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    let min_d2 = spacing * spacing;
    let mut out: Vec<[f32; 2]> = Vec::new();
    for (_, x, y) in scored {
        let p = [x as f32, y as f32];
        if out
            .iter()
            .all(|q| (q[0] - p[0]).powi(2) + (q[1] - p[1]).powi(2) >= min_d2)
        {
            out.push(p);
            if out.len() >= max_points {
                break;
            }
        }
    }
    out
}
