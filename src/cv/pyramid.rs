// src/cv/pyramid.rs

//! Float images and Gaussian / difference-of-Gaussian scale space.
use crate::{ArError, Result};

/// Smallest side accepted for scale-space construction.
pub const MIN_IMAGE_SIDE: u32 = 5;

/// A grayscale image stored as f32 values in [0, 1].
#[derive(Debug, Clone)]
pub struct GrayImage {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl GrayImage {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: vec![0.0; (width * height) as usize],
            width,
            height,
        }
    }

    pub fn from_luma(luma: &[u8], width: u32, height: u32) -> Self {
        let n = (width * height) as usize;
        Self {
            data: luma[..n].iter().map(|&v| v as f32 / 255.0).collect(),
            width,
            height,
        }
    }

    #[inline]
    pub fn get(&self, x: i32, y: i32) -> f32 {
        let x = x.clamp(0, self.width as i32 - 1) as u32;
        let y = y.clamp(0, self.height as i32 - 1) as u32;
        self.data[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, val: f32) {
        if x < self.width && y < self.height {
            self.data[(y * self.width + x) as usize] = val;
        }
    }

    /// Bilinear sample, clamped at the borders.
    pub fn sample(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (xi, yi) = (x0 as i32, y0 as i32);
        let top = self.get(xi, yi) * (1.0 - fx) + self.get(xi + 1, yi) * fx;
        let bottom = self.get(xi, yi + 1) * (1.0 - fx) + self.get(xi + 1, yi + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Keeps every other pixel in both directions.
    pub fn decimate(&self) -> GrayImage {
        let nw = (self.width / 2).max(1);
        let nh = (self.height / 2).max(1);
        let mut out = GrayImage::new(nw, nh);
        for y in 0..nh {
            for x in 0..nw {
                out.set(x, y, self.get((x * 2) as i32, (y * 2) as i32));
            }
        }
        out
    }
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (sigma * 3.0).ceil().max(1.0) as i32;
    let two_s2 = 2.0 * sigma * sigma;
    let mut k: Vec<f32> = (-radius..=radius)
        .map(|i| (-((i * i) as f32) / two_s2).exp())
        .collect();
    let sum: f32 = k.iter().sum();
    for v in k.iter_mut() {
        *v /= sum;
    }
    k
}

/// Separable Gaussian blur with clamped borders.
pub fn gaussian_blur(src: &GrayImage, sigma: f32) -> GrayImage {
    if sigma <= 0.0 {
        return src.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as i32;
    let (w, h) = (src.width, src.height);

    let mut tmp = GrayImage::new(w, h);
    for y in 0..h as i32 {
        for x in 0..w as i32 {
            let mut acc = 0.0;
            for (k, &kv) in kernel.iter().enumerate() {
                acc += kv * src.get(x + k as i32 - radius, y);
            }
            tmp.set(x as u32, y as u32, acc);
        }
    }

    let mut out = GrayImage::new(w, h);
    for y in 0..h as i32 {
        for x in 0..w as i32 {
            let mut acc = 0.0;
            for (k, &kv) in kernel.iter().enumerate() {
                acc += kv * tmp.get(x, y + k as i32 - radius);
            }
            out.set(x as u32, y as u32, acc);
        }
    }
    out
}

/// Scale-space layout parameters.
#[derive(Debug, Clone, Copy)]
pub struct ScaleSpaceParams {
    /// DoG layers searched per octave.
    pub scales_per_octave: usize,
    /// Blur of the first Gaussian in each octave.
    pub sigma0: f32,
    /// Blur already present in the input image.
    pub input_sigma: f32,
    pub max_octaves: usize,
    /// Octaves stop before either side drops under this.
    pub min_octave_side: u32,
}

impl Default for ScaleSpaceParams {
    fn default() -> Self {
        Self {
            scales_per_octave: 2,
            sigma0: 1.6,
            input_sigma: 0.5,
            max_octaves: 5,
            min_octave_side: 16,
        }
    }
}

/// One octave: `scales_per_octave + 3` Gaussians and one fewer DoG layers.
#[derive(Debug, Clone)]
pub struct Octave {
    pub gaussians: Vec<GrayImage>,
    pub dogs: Vec<GrayImage>,
    /// Sigma of each Gaussian layer relative to the octave's pixel grid.
    pub sigmas: Vec<f32>,
    /// Factor from octave pixels to input pixels (`2^octave`).
    pub scale: f32,
}

/// Gaussian and DoG scale space of one image.
#[derive(Debug, Clone)]
pub struct ScaleSpace {
    pub octaves: Vec<Octave>,
    pub params: ScaleSpaceParams,
}

impl ScaleSpace {
    pub fn build(base: &GrayImage, params: ScaleSpaceParams) -> Result<Self> {
        if base.width < MIN_IMAGE_SIDE || base.height < MIN_IMAGE_SIDE {
            return Err(ArError::ImageTooSmall {
                width: base.width,
                height: base.height,
                min: MIN_IMAGE_SIDE,
            });
        }

        let s = params.scales_per_octave.max(1);
        let layers = s + 3;
        let k = 2f32.powf(1.0 / s as f32);
        let sigmas: Vec<f32> = (0..layers).map(|i| params.sigma0 * k.powi(i as i32)).collect();

        let first_sigma =
            (params.sigma0 * params.sigma0 - params.input_sigma * params.input_sigma).max(0.01);
        let mut seed = gaussian_blur(base, first_sigma.sqrt());

        let mut octaves = Vec::new();
        let mut scale = 1.0;
        loop {
            let mut gaussians = Vec::with_capacity(layers);
            gaussians.push(seed.clone());
            for i in 1..layers {
                let inc = (sigmas[i] * sigmas[i] - sigmas[i - 1] * sigmas[i - 1]).sqrt();
                let next = gaussian_blur(&gaussians[i - 1], inc);
                gaussians.push(next);
            }

            let dogs = gaussians
                .windows(2)
                .map(|pair| {
                    let mut d = GrayImage::new(pair[0].width, pair[0].height);
                    for (o, (a, b)) in d.data.iter_mut().zip(pair[0].data.iter().zip(&pair[1].data)) {
                        *o = b - a;
                    }
                    d
                })
                .collect();

            // Layer `s` has twice the base sigma; it seeds the next octave.
            let next_seed = gaussians[s].decimate();
            octaves.push(Octave {
                gaussians,
                dogs,
                sigmas: sigmas.clone(),
                scale,
            });

            if octaves.len() >= params.max_octaves
                || next_seed.width < params.min_octave_side
                || next_seed.height < params.min_octave_side
            {
                break;
            }
            seed = next_seed;
            scale *= 2.0;
        }

        Ok(Self { octaves, params })
    }
}

/// Compute spatial gradients (Ix, Iy) using central differences.
#[inline]
pub fn gradient_at(img: &GrayImage, x: i32, y: i32) -> (f32, f32) {
    (
        (img.get(x + 1, y) - img.get(x - 1, y)) * 0.5,
        (img.get(x, y + 1) - img.get(x, y - 1)) * 0.5,
    )
}
