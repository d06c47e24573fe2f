// src/core/threshold.rs

//! Threshold selection and binarization for the square detector.
use serde::{Deserialize, Serialize};

use crate::cv::scalar::ScalarCV;
use crate::cv::ComputerVision;
use crate::{ArError, ImageBuffer, Result};

/// Default manual threshold.
pub const DEFAULT_THRESHOLD: u8 = 100;
/// Box-blur radius used by adaptive thresholding.
pub const ADAPTIVE_KERNEL: usize = 7;
/// Local contrast required by adaptive thresholding.
pub const ADAPTIVE_BIAS: u8 = 7;

/// How the binarization threshold is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThresholdMode {
    #[default]
    Manual,
    AutoMedian,
    AutoOtsu,
    AutoAdaptive,
    AutoBracketing,
}

impl ThresholdMode {
    pub fn code(self) -> i32 {
        match self {
            ThresholdMode::Manual => 0,
            ThresholdMode::AutoMedian => 1,
            ThresholdMode::AutoOtsu => 2,
            ThresholdMode::AutoAdaptive => 3,
            ThresholdMode::AutoBracketing => 4,
        }
    }
}

impl TryFrom<i32> for ThresholdMode {
    type Error = ArError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => ThresholdMode::Manual,
            1 => ThresholdMode::AutoMedian,
            2 => ThresholdMode::AutoOtsu,
            3 => ThresholdMode::AutoAdaptive,
            4 => ThresholdMode::AutoBracketing,
            other => {
                return Err(ArError::InvalidParameter(format!(
                    "unknown threshold mode {other}"
                )))
            }
        })
    }
}

/// Which side of the threshold counts as marker ink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LabelingMode {
    /// Bright regions on dark background.
    WhiteRegion,
    /// Dark regions on bright background.
    #[default]
    BlackRegion,
}

impl LabelingMode {
    pub fn code(self) -> i32 {
        match self {
            LabelingMode::WhiteRegion => 0,
            LabelingMode::BlackRegion => 1,
        }
    }
}

impl TryFrom<i32> for LabelingMode {
    type Error = ArError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(LabelingMode::WhiteRegion),
            1 => Ok(LabelingMode::BlackRegion),
            other => Err(ArError::InvalidParameter(format!(
                "unknown labeling mode {other}"
            ))),
        }
    }
}

/// Writes 255 for foreground pixels and 0 elsewhere.
pub fn binarize(luma: &[u8], dst: &mut [u8], threshold: u8, mode: LabelingMode) {
    ScalarCV::threshold(luma, dst, threshold);
    if mode == LabelingMode::BlackRegion {
        for v in dst.iter_mut() {
            *v = !*v;
        }
    }
}

/// Binarizes against the local mean instead of a global value.
pub fn binarize_adaptive(src: &ImageBuffer, dst: &mut [u8], mode: LabelingMode) {
    ScalarCV::adaptive_threshold(
        src,
        dst,
        ADAPTIVE_KERNEL,
        ADAPTIVE_BIAS,
        mode == LabelingMode::WhiteRegion,
    );
}

/// Picks among `[t - offset, t, t + offset]` by marker count.
///
/// The middle candidate wins every tie it takes part in; between the lower
/// and upper candidate the lower one wins.
pub fn pick_bracket(counts: [usize; 3]) -> usize {
    let best = counts.iter().copied().max().unwrap_or(0);
    if counts[1] == best {
        1
    } else if counts[0] == best {
        0
    } else {
        2
    }
}

/// Running threshold policy for one session.
#[derive(Debug, Clone)]
pub struct ThresholdState {
    pub mode: ThresholdMode,
    /// Manual value, or the latest automatic result.
    pub value: u8,
    /// Frames between automatic recomputations.
    pub interval: u32,
    pub bracket_offset: u8,
    frames_until_update: u32,
}

impl ThresholdState {
    pub fn new(mode: ThresholdMode, value: u8, interval: u32, bracket_offset: u8) -> Self {
        Self {
            mode,
            value,
            interval: interval.max(1),
            bracket_offset,
            frames_until_update: 0,
        }
    }

    pub fn set_mode(&mut self, mode: ThresholdMode) {
        self.mode = mode;
        self.frames_until_update = 0;
    }

    pub fn set_value(&mut self, value: u8) {
        self.value = value;
    }

    /// Global threshold for this frame; updates the automatic value when its
    /// interval has elapsed.
    pub fn frame_threshold(&mut self, luma: &[u8]) -> u8 {
        match self.mode {
            ThresholdMode::AutoMedian | ThresholdMode::AutoOtsu => {
                if self.frames_until_update == 0 {
                    self.value = if self.mode == ThresholdMode::AutoMedian {
                        ScalarCV::median(luma)
                    } else {
                        ScalarCV::otsu(luma)
                    };
                    self.frames_until_update = self.interval;
                }
                self.frames_until_update -= 1;
                self.value
            }
            _ => self.value,
        }
    }

    /// The three bracketing candidates around the current value.
    pub fn bracket(&self) -> [u8; 3] {
        [
            self.value.saturating_sub(self.bracket_offset),
            self.value,
            self.value.saturating_add(self.bracket_offset),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 0..5 {
            assert_eq!(ThresholdMode::try_from(code).unwrap().code(), code);
        }
        assert!(ThresholdMode::try_from(9).is_err());
        assert_eq!(LabelingMode::try_from(1).unwrap(), LabelingMode::BlackRegion);
    }

    #[test]
    fn black_region_marks_dark_pixels() {
        let luma = [10, 100, 101, 250];
        let mut dst = [0u8; 4];
        binarize(&luma, &mut dst, 100, LabelingMode::BlackRegion);
        assert_eq!(dst, [255, 255, 0, 0]);
        binarize(&luma, &mut dst, 100, LabelingMode::WhiteRegion);
        assert_eq!(dst, [0, 0, 255, 255]);
    }

    #[test]
    fn bracket_tie_break() {
        assert_eq!(pick_bracket([3, 3, 3]), 1);
        assert_eq!(pick_bracket([2, 1, 2]), 0);
        assert_eq!(pick_bracket([0, 1, 4]), 2);
        assert_eq!(pick_bracket([5, 5, 1]), 1);
    }

    #[test]
    fn auto_value_refreshes_on_interval() {
        let mut state = ThresholdState::new(ThresholdMode::AutoMedian, 100, 2, 40);
        assert_eq!(state.frame_threshold(&[10, 20, 30]), 20);
        // Not yet due: keeps the cached value.
        assert_eq!(state.frame_threshold(&[200, 200, 200]), 20);
        assert_eq!(state.frame_threshold(&[200, 200, 200]), 200);
    }

    #[test]
    fn bracket_saturates() {
        let state = ThresholdState::new(ThresholdMode::AutoBracketing, 20, 1, 40);
        assert_eq!(state.bracket(), [0, 20, 60]);
    }
}
