// src/config.rs

//! Tracker settings, loadable from JSON.
//!
//! Every section has working defaults; a JSON document only needs the keys
//! it wants to change.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::detector::DetectorConfig;
use crate::core::frame::PixelFormat;
use crate::core::multi::MultiPosePolicy;
use crate::core::threshold::{ThresholdMode, DEFAULT_THRESHOLD};
use crate::nft::cluster::{IndexParams, MatchParams};
use crate::nft::features::FeatureParams;
use crate::nft::homography::RansacConfig;
use crate::nft::hough::HoughParams;
use crate::nft::template::TemplateParams;
use crate::{ArError, Result};

/// Square and barcode marker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SquareConfig {
    pub threshold_mode: ThresholdMode,
    pub threshold: u8,
    /// Frames between automatic threshold updates.
    pub auto_threshold_interval: u32,
    /// Distance of the outer bracketing candidates from the current value.
    pub bracket_offset: u8,
    /// Side length used for markers without an explicit width, millimetres.
    pub default_marker_width: f64,
    pub detector: DetectorConfig,
}

impl Default for SquareConfig {
    fn default() -> Self {
        Self {
            threshold_mode: ThresholdMode::Manual,
            threshold: DEFAULT_THRESHOLD,
            auto_threshold_interval: 5,
            bracket_offset: 16,
            default_marker_width: 80.0,
            detector: DetectorConfig::default(),
        }
    }
}

/// NFT page settings shared by all pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NftConfig {
    /// Continuous absence before a tracked page is reported lost.
    pub debounce_ms: u64,
    /// Frame feature extraction.
    pub features: FeatureParams,
    /// Reference index shape, applied when a page is loaded.
    pub index: IndexParams,
    pub matching: MatchParams,
    pub hough: HoughParams,
    pub ransac: RansacConfig,
    pub template: TemplateParams,
    /// Correspondences used for the metric pose.
    pub max_pose_points: usize,
}

impl Default for NftConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            features: FeatureParams::default(),
            index: IndexParams::default(),
            matching: MatchParams::default(),
            hough: HoughParams::default(),
            ransac: RansacConfig::default(),
            template: TemplateParams::default(),
            max_pose_points: 100,
        }
    }
}

impl NftConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Top-level tracker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Layout of the frames handed to `process`.
    pub pixel_format: PixelFormat,
    pub square: SquareConfig,
    pub nft: NftConfig,
    pub multi_policy: MultiPosePolicy,
    /// Projection near plane.
    pub near: f64,
    /// Projection far plane.
    pub far: f64,
    /// Keep the binarized image of the last frame for inspection.
    pub debug: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::Rgba,
            square: SquareConfig::default(),
            nft: NftConfig::default(),
            multi_policy: MultiPosePolicy::FirstVisible,
            near: 0.1,
            far: 1000.0,
            debug: false,
        }
    }
}

impl TrackerConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: TrackerConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.near > 0.0 && self.far > self.near) {
            return Err(ArError::InvalidParameter(format!(
                "projection planes must satisfy 0 < near < far, got {} / {}",
                self.near, self.far
            )));
        }
        let d = &self.square.detector;
        if !(d.patt_ratio > 0.0 && d.patt_ratio < 1.0) {
            return Err(ArError::InvalidParameter(format!(
                "pattern ratio {} outside (0, 1)",
                d.patt_ratio
            )));
        }
        if d.area_min > d.area_max {
            return Err(ArError::InvalidParameter(format!(
                "area_min {} exceeds area_max {}",
                d.area_min, d.area_max
            )));
        }
        if self.square.default_marker_width <= 0.0 {
            return Err(ArError::InvalidParameter("marker width must be positive".into()));
        }
        if self.nft.features.max_features == 0 {
            return Err(ArError::InvalidParameter("max_features must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::detector::PatternDetectionMode;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = TrackerConfig::from_json_str(
            r#"{
                "square": { "threshold_mode": "AutoOtsu", "detector": { "pattern_detection_mode": "Matrix" } },
                "nft": { "debounce_ms": 350 },
                "debug": true
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.square.threshold_mode, ThresholdMode::AutoOtsu);
        assert_eq!(cfg.square.threshold, DEFAULT_THRESHOLD);
        assert_eq!(cfg.square.detector.pattern_detection_mode, PatternDetectionMode::Matrix);
        assert_eq!(cfg.square.detector.area_min, 70);
        assert_eq!(cfg.nft.debounce(), Duration::from_millis(350));
        assert_eq!(cfg.nft.matching.max_distance, 64);
        assert!(cfg.debug);
    }

    #[test]
    fn serializes_back() {
        let cfg = TrackerConfig::default();
        let text = serde_json::to_string(&cfg).unwrap();
        assert_eq!(TrackerConfig::from_json_str(&text).unwrap(), cfg);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            TrackerConfig::from_json_str(r#"{ "near": 10.0, "far": 1.0 }"#),
            Err(ArError::InvalidParameter(_))
        ));
        assert!(matches!(
            TrackerConfig::from_json_str(r#"{ "square": { "detector": { "patt_ratio": 1.5 } } }"#),
            Err(ArError::InvalidParameter(_))
        ));
        assert!(matches!(
            TrackerConfig::from_json_str("{ not json"),
            Err(ArError::Json(_))
        ));
    }

    #[test]
    fn reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        std::fs::write(&path, r#"{ "far": 500.0 }"#).unwrap();
        let cfg = TrackerConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.far, 500.0);
        assert!(matches!(
            TrackerConfig::from_json_file(dir.path().join("missing.json")),
            Err(ArError::Io(_))
        ));
    }
}
