// Copyright (c) 2026 kalwalt and AR.js-org contributors
//
// This software is released under the MIT License.
// https://opensource.org/licenses/MIT
// See https://github.com/AR-js-org/aruco-rs/blob/main/LICENSE

//! artrack-rs: square marker, barcode and NFT tracking for AR.js hosts.
//!
//! The host feeds one decoded video frame per call to [`Tracker::process`]
//! and receives a list of [`DetectionEvent`]s carrying marker identities and
//! pose matrices. Everything runs synchronously on the caller's thread.
//!
//! 1. **Frame arena**: fixed buffers for the color frame and derived luma.
//! 2. **Camera**: ARToolKit calibration parameters and distortion model.
//! 3. **Square detector**: thresholding, labeling, contour quads, pattern
//!    and matrix-code identification.
//! 4. **NFT**: scale-space features, clustered matching, Hough voting,
//!    RANSAC homography and pose.
//! 5. **Multi-marker**: sets of square markers with fixed offsets.
//! 6. **Pose**: 3x4 transforms to renderer matrices.
//! 7. **History**: per-marker continuity and debounced lost events.
use nalgebra::Vector2;
use thiserror::Error;

/// 2D point in image coordinates, sub-pixel precision.
pub type Point2f = Vector2<f32>;

/// 2D Point in pixel coordinates
pub type Point2i = Vector2<i32>;

/// The four corners of a detected marker
pub type MarkerCorners = [Point2f; 4];

/// Borrowed single-channel image view.
///
/// # Fields
/// * `data` - A slice representing a 1D contiguous array of 8-bit pixels.
/// * `width` - The logical width of the frame in pixels.
/// * `height` - The logical height of the frame in pixels.
pub struct ImageBuffer<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

/// Errors surfaced by load operations and contract violations.
///
/// Per-frame "nothing detected" outcomes are never errors; they show up as
/// missing entries in the event list.
#[derive(Error, Debug)]
pub enum ArError {
    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    #[error("frame buffer holds {got} bytes, expected {expected}")]
    InvalidBuffer { expected: usize, got: usize },

    #[error("frame is {got_width}x{got_height}, arena was created for {width}x{height}")]
    FrameSizeMismatch {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },

    #[error("malformed camera parameters: {0}")]
    MalformedCamera(String),

    #[error("malformed pattern file: {0}")]
    MalformedPattern(String),

    #[error("malformed multi-marker config (line {line}): {reason}")]
    MalformedMultiMarker { line: usize, reason: String },

    #[error("malformed NFT dataset: {0}")]
    MalformedDataset(String),

    #[error("incomplete NFT dataset: missing {0}")]
    IncompleteDataset(&'static str),

    #[error("image too small: {width}x{height}, both sides must be at least {min} px")]
    ImageTooSmall { width: u32, height: u32, min: u32 },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("camera parameters already loaded on this handle")]
    AlreadyLoaded,

    #[error("tracker used before initialization or after dispose")]
    NotInitialized,

    #[error("{kind} index {index} out of range ({count} registered)")]
    IndexOutOfRange {
        kind: &'static str,
        index: usize,
        count: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArError {
    /// True for host misuse (double load, use after dispose, bad index),
    /// as opposed to bad input data.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            ArError::AlreadyLoaded | ArError::NotInitialized | ArError::IndexOutOfRange { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ArError>;

pub mod config;
pub mod core;
pub mod cv;
pub mod nft;
pub mod pose;
pub mod tracker;

pub use config::{NftConfig, SquareConfig, TrackerConfig};
pub use core::camera::{CameraModel, CameraParams};
pub use core::detector::{
    ImageProcMode, LabelingMode, MatrixCodeType, PatternDetectionMode, ThresholdMode,
};
pub use core::frame::{FrameArena, PixelFormat};
pub use core::history::{NftTrackState, SquareMarkerDescriptor, SquareMarkerId};
pub use core::multi::{AggregatePose, MultiMarkerSet, MultiPosePolicy};
pub use cv::labeling::Connectivity;
pub use nft::dataset::{NftDataset, NftPageFiles};
pub use nft::tracker::NftMarkerDescriptor;
pub use pose::{to_render_matrix, to_right_handed, TransMat};
pub use tracker::{DetectionEvent, FrameDiagnostics, Tracker};
