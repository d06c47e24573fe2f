// src/core/frame.rs

//! Per-session frame storage.
//!
//! Buffers are sized once for the session's resolution and overwritten in
//! place on every [`FrameArena::load_frame`].
use serde::{Deserialize, Serialize};

use crate::cv::scalar::ScalarCV;
use crate::cv::ComputerVision;
use crate::{ArError, ImageBuffer, Result};

/// Channel layout of an incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    #[default]
    Rgba,
    Bgra,
    Argb,
    Abgr,
    Rgb,
    Bgr,
    Mono,
}

impl PixelFormat {
    /// Parses the ARToolKit pixel format name (`"RGBA"`, `"BGR"`, `"MONO"`, ...).
    pub fn from_code(code: &str) -> Result<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "RGBA" => Ok(PixelFormat::Rgba),
            "BGRA" => Ok(PixelFormat::Bgra),
            "ARGB" => Ok(PixelFormat::Argb),
            "ABGR" => Ok(PixelFormat::Abgr),
            "RGB" => Ok(PixelFormat::Rgb),
            "BGR" => Ok(PixelFormat::Bgr),
            "MONO" | "LUMA" => Ok(PixelFormat::Mono),
            _ => Err(ArError::UnsupportedFormat(code.to_string())),
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra | PixelFormat::Argb | PixelFormat::Abgr => 4,
            PixelFormat::Rgb | PixelFormat::Bgr => 3,
            PixelFormat::Mono => 1,
        }
    }

    /// Byte offsets of R, G and B inside one pixel; `None` for mono.
    pub fn rgb_offsets(self) -> Option<(usize, usize, usize)> {
        match self {
            PixelFormat::Rgba => Some((0, 1, 2)),
            PixelFormat::Bgra => Some((2, 1, 0)),
            PixelFormat::Argb => Some((1, 2, 3)),
            PixelFormat::Abgr => Some((3, 2, 1)),
            PixelFormat::Rgb => Some((0, 1, 2)),
            PixelFormat::Bgr => Some((2, 1, 0)),
            PixelFormat::Mono => None,
        }
    }
}

/// Fixed-size frame buffers for one tracking session.
#[derive(Debug, Clone)]
pub struct FrameArena {
    width: u32,
    height: u32,
    format: PixelFormat,
    /// Normalised RGB of the current frame, 3 bytes per pixel.
    color: Vec<u8>,
    luma: Vec<u8>,
    /// Binarized image of the last square detection, filled in debug mode.
    debug: Vec<u8>,
    loaded: bool,
}

impl FrameArena {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(ArError::InvalidParameter(format!(
                "frame size must be non-zero, got {width}x{height}"
            )));
        }
        let n = width as usize * height as usize;
        Ok(Self {
            width,
            height,
            format: PixelFormat::default(),
            color: vec![0; n * 3],
            luma: vec![0; n],
            debug: vec![0; n],
            loaded: false,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Whether at least one frame has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Copies a frame in and derives its luma.
    ///
    /// Checks run before any byte is written, so a rejected frame leaves the
    /// previous contents intact.
    pub fn load_frame(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<()> {
        if width != self.width || height != self.height {
            return Err(ArError::FrameSizeMismatch {
                width: self.width,
                height: self.height,
                got_width: width,
                got_height: height,
            });
        }
        let n = width as usize * height as usize;
        let expected = n * format.bytes_per_pixel();
        if pixels.len() != expected {
            return Err(ArError::InvalidBuffer {
                expected,
                got: pixels.len(),
            });
        }

        ScalarCV::luma(pixels, format, &mut self.luma);

        match format.rgb_offsets() {
            Some((ro, go, bo)) => {
                for (dst, px) in self
                    .color
                    .chunks_exact_mut(3)
                    .zip(pixels.chunks_exact(format.bytes_per_pixel()))
                {
                    dst[0] = px[ro];
                    dst[1] = px[go];
                    dst[2] = px[bo];
                }
            }
            None => {
                for (dst, &v) in self.color.chunks_exact_mut(3).zip(pixels) {
                    dst.fill(v);
                }
            }
        }

        self.format = format;
        self.loaded = true;
        Ok(())
    }

    pub fn luma(&self) -> &[u8] {
        &self.luma
    }

    /// RGB triplets of the current frame.
    pub fn color(&self) -> &[u8] {
        &self.color
    }

    pub fn luma_image(&self) -> ImageBuffer<'_> {
        ImageBuffer {
            data: &self.luma,
            width: self.width,
            height: self.height,
        }
    }

    /// Owned copy of the luma plane.
    pub fn to_luma_buffer(&self) -> Vec<u8> {
        self.luma.clone()
    }

    pub fn debug_image(&self) -> &[u8] {
        &self.debug
    }

    pub(crate) fn debug_mut(&mut self) -> &mut [u8] {
        &mut self.debug
    }
}
