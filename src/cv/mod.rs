// Copyright (c) 2026 kalwalt and AR.js-org contributors
//
// This software is released under the MIT License.
// https://opensource.org/licenses/MIT
// See https://github.com/AR-js-org/aruco-rs/blob/main/LICENSE
// src/cv/mod.rs

use crate::core::frame::PixelFormat;
use crate::{ImageBuffer, Point2f};

/// Low-level image operations used by the square detector.
///
/// Kept as a trait so the detector stays generic over the implementation;
/// [`scalar::ScalarCV`] is the portable one.
pub trait ComputerVision {
    /// Converts a packed color (or mono) buffer to 8-bit luma.
    ///
    /// # Arguments
    /// * `src` - Raw pixels in `format` layout, `width * height * bpp` bytes.
    /// * `format` - Channel layout of `src`.
    /// * `dst` - Destination luma, one byte per pixel. Must be pre-allocated.
    fn luma(src: &[u8], format: PixelFormat, dst: &mut [u8]);

    /// Applies a global threshold: `<= threshold` -> 0, otherwise 255.
    fn threshold(src: &[u8], dst: &mut [u8], threshold: u8);

    /// Computes the Otsu threshold of a luma buffer.
    ///
    /// # Returns
    /// The threshold maximizing the between-class variance (0-255).
    fn otsu(src: &[u8]) -> u8;

    /// Median luma value, via a 256-bin histogram.
    fn median(src: &[u8]) -> u8;

    /// Computes a fast box blur using a stack algorithm.
    ///
    /// # Arguments
    /// * `src` - The source `ImageBuffer` containing pixels to blur.
    /// * `dst` - The destination buffer where the blurred image is placed.
    /// * `kernel_size` - Radius of the blur window, `< 16`.
    fn stack_box_blur(src: &ImageBuffer, dst: &mut [u8], kernel_size: usize);

    /// Local-mean threshold.
    ///
    /// A pixel is foreground (255) when it is darker than its box-blurred
    /// neighbourhood by at least `threshold`; with `bright_foreground` the
    /// comparison is mirrored.
    fn adaptive_threshold(
        src: &ImageBuffer,
        dst: &mut [u8],
        kernel_size: usize,
        threshold: u8,
        bright_foreground: bool,
    );

    /// Samples a `warp_size` x `warp_size` grid of cell centers inside a
    /// quadrilateral with bilinear interpolation.
    ///
    /// # Arguments
    /// * `src` - The source `ImageBuffer`.
    /// * `dst` - Output patch, `warp_size * warp_size` bytes.
    /// * `quad` - Corners in clockwise order starting at the patch's top-left.
    /// * `warp_size` - The dimensions of the output square.
    fn warp(src: &ImageBuffer, dst: &mut [u8], quad: &[Point2f; 4], warp_size: usize);

    /// Halves both dimensions by averaging 2x2 blocks (field processing).
    fn half_sample(src: &ImageBuffer, dst: &mut [u8]);
}

// Submodules for specific CV algorithms
pub mod contours;
pub mod geometry;
pub mod labeling;
pub mod pyramid;
pub mod scalar;
