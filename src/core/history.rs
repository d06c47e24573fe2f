// src/core/history.rs

//! Per-marker tracking history.
//!
//! One record per marker identifier lives for the whole session. At the
//! start of every frame the visibility flags are swapped, never cleared
//! independently, so the continuous pose solver always sees exactly one
//! frame of history.
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pose::{to_render_matrix, to_right_handed, TransMat};
use crate::{MarkerCorners, Point2f};

/// Identifier of a square marker, namespaced by identification method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SquareMarkerId {
    /// Index into the loaded template patterns.
    Pattern(u32),
    /// Decoded matrix-code value.
    Matrix(u32),
}

impl SquareMarkerId {
    const MATRIX_BIT: u32 = 1 << 31;

    /// Stable 32-bit form: bit 31 marks the matrix namespace.
    pub fn raw(self) -> u32 {
        match self {
            SquareMarkerId::Pattern(id) => id & !Self::MATRIX_BIT,
            SquareMarkerId::Matrix(id) => id | Self::MATRIX_BIT,
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        if raw & Self::MATRIX_BIT != 0 {
            SquareMarkerId::Matrix(raw & !Self::MATRIX_BIT)
        } else {
            SquareMarkerId::Pattern(raw)
        }
    }
}

/// Everything known about one square marker, as of its last sighting.
#[derive(Debug, Clone, PartialEq)]
pub struct SquareMarkerDescriptor {
    pub id: SquareMarkerId,
    pub confidence: f32,
    /// Quarter turns applied to the detected quad; see
    /// [`crate::core::detector::DetectedSquare::direction`].
    pub direction: usize,
    /// Image-space area of the quad in pixels.
    pub area: f32,
    pub center: Point2f,
    /// Sub-pixel vertices, vertex 0 at the marker's top-left.
    pub vertices: MarkerCorners,
    /// Physical side length used for the pose.
    pub width: f64,
    pub trans: TransMat,
    /// Mean squared reprojection error of `trans` in pixels.
    pub error: f64,
    pub render_matrix: [f64; 16],
    pub render_matrix_rh: [f64; 16],
    pub seen_last_frame: bool,
    pub seen_this_frame: bool,
}

/// A fresh sighting handed to [`SquareHistory::record`].
#[derive(Debug, Clone, Copy)]
pub struct SquareSighting {
    pub id: SquareMarkerId,
    pub confidence: f32,
    pub direction: usize,
    pub area: f32,
    pub center: Point2f,
    pub vertices: MarkerCorners,
    pub width: f64,
    pub trans: TransMat,
    pub error: f64,
}

/// Sparse map of square-marker records keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct SquareHistory {
    records: BTreeMap<SquareMarkerId, SquareMarkerDescriptor>,
}

impl SquareHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rolls every record forward one frame.
    pub fn begin_frame(&mut self) {
        for rec in self.records.values_mut() {
            rec.seen_last_frame = rec.seen_this_frame;
            rec.seen_this_frame = false;
        }
    }

    /// Pose to seed the continuous solver, only when the marker was seen on
    /// the previous frame.
    pub fn previous_pose(&self, id: SquareMarkerId) -> Option<TransMat> {
        self.records
            .get(&id)
            .filter(|r| r.seen_last_frame)
            .map(|r| r.trans)
    }

    /// Stores a sighting for this frame and returns the updated record.
    pub fn record(&mut self, sighting: SquareSighting) -> &SquareMarkerDescriptor {
        let render_matrix = to_render_matrix(&sighting.trans, None);
        let render_matrix_rh = to_right_handed(&render_matrix, None);
        let rec = self
            .records
            .entry(sighting.id)
            .or_insert_with(|| SquareMarkerDescriptor {
                id: sighting.id,
                confidence: 0.0,
                direction: 0,
                area: 0.0,
                center: Point2f::zeros(),
                vertices: [Point2f::zeros(); 4],
                width: sighting.width,
                trans: TransMat::identity(),
                error: 0.0,
                render_matrix,
                render_matrix_rh,
                seen_last_frame: false,
                seen_this_frame: false,
            });
        rec.confidence = sighting.confidence;
        rec.direction = sighting.direction;
        rec.area = sighting.area;
        rec.center = sighting.center;
        rec.vertices = sighting.vertices;
        rec.width = sighting.width;
        rec.trans = sighting.trans;
        rec.error = sighting.error;
        rec.render_matrix = render_matrix;
        rec.render_matrix_rh = render_matrix_rh;
        rec.seen_this_frame = true;
        rec
    }

    pub fn get(&self, id: SquareMarkerId) -> Option<&SquareMarkerDescriptor> {
        self.records.get(&id)
    }

    /// Whether `id` was recorded during the current frame.
    pub fn seen_this_frame(&self, id: SquareMarkerId) -> bool {
        self.records.get(&id).is_some_and(|r| r.seen_this_frame)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Continuity state of one NFT page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NftTrackState {
    #[default]
    Unseen,
    /// Found this frame after not being tracked.
    Candidate,
    /// Found on consecutive frames.
    Tracked,
    /// Missing, but still inside the debounce window.
    Lost,
}

/// Event-worthy outcome of [`NftContinuity::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NftTransition {
    Found,
    Lost,
}

/// Debounced found/lost bookkeeping for one NFT page.
#[derive(Debug, Clone, Default)]
pub struct NftContinuity {
    pub state: NftTrackState,
    last_found: Option<Duration>,
}

impl NftContinuity {
    /// Folds one frame's result into the state.
    ///
    /// Found is reported on every frame the page is found. Lost is reported
    /// once, on the first absent frame at least `debounce` after the last
    /// sighting.
    pub fn observe(&mut self, found: bool, now: Duration, debounce: Duration) -> Option<NftTransition> {
        if found {
            self.state = match self.state {
                NftTrackState::Unseen => NftTrackState::Candidate,
                _ => NftTrackState::Tracked,
            };
            self.last_found = Some(now);
            return Some(NftTransition::Found);
        }

        match self.state {
            NftTrackState::Unseen => None,
            _ => {
                let since = self
                    .last_found
                    .map(|t| now.saturating_sub(t))
                    .unwrap_or(Duration::MAX);
                if since >= debounce {
                    self.state = NftTrackState::Unseen;
                    Some(NftTransition::Lost)
                } else {
                    self.state = NftTrackState::Lost;
                    None
                }
            }
        }
    }

    /// True when the page was found on the previous processed frame.
    pub fn tracked(&self) -> bool {
        matches!(self.state, NftTrackState::Candidate | NftTrackState::Tracked)
    }
}
