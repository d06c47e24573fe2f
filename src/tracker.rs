// src/tracker.rs

//! Session object tying the pipelines together.
//!
//! A [`Tracker`] owns every registry (patterns, matrix widths, NFT pages,
//! multi-marker sets) and the frame buffers for one video stream. All
//! mutating calls take `&mut self`; the tracker is `Send` but must not be
//! driven from several threads at once.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::TrackerConfig;
use crate::core::camera::CameraParams;
use crate::core::detector::{
    ImageProcMode, LabelingMode, MatrixCodeType, PatternDetectionMode, SquareDetector,
    ThresholdMode,
};
use crate::core::frame::{FrameArena, PixelFormat};
use crate::core::history::{
    NftTransition, SquareHistory, SquareMarkerDescriptor, SquareMarkerId, SquareSighting,
};
use crate::core::multi::{AggregatePose, MultiMarkerSet};
use crate::core::pattern::{Pattern, PatternSet};
use crate::core::threshold::ThresholdState;
use crate::core::transmat::get_trans_mat_square_cont;
use crate::cv::labeling::Connectivity;
use crate::nft::dataset::{NftDataset, NftPageFiles};
use crate::nft::tracker::{NftMarkerDescriptor, NftTracker};
use crate::pose::to_render_matrix;
use crate::{ArError, Result};

/// Per-frame counters, reset at the start of every `process`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameDiagnostics {
    /// Labeling hit `max_labels` and stopped creating components.
    pub labeling_overflow: bool,
    /// Frames whose feature extraction hit `max_features`; at most 1.
    pub feature_overflow: u32,
    pub square_candidates: usize,
    pub square_markers: usize,
    /// Global threshold used, `None` in adaptive mode.
    pub threshold: Option<u8>,
    /// Marker counts at the three bracketing thresholds.
    pub bracket_counts: Option<[usize; 3]>,
    pub nft_features: usize,
}

/// Something the host should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionEvent {
    SquareFound {
        marker: SquareMarkerDescriptor,
    },
    MultiMarkerFound {
        set_id: u32,
        pose: AggregatePose,
        render_matrix: [f64; 16],
    },
    NftFound {
        marker: NftMarkerDescriptor,
        render_matrix: [f64; 16],
    },
    NftLost {
        page_id: u32,
    },
}

struct Session {
    camera: Arc<CameraParams>,
    config: TrackerConfig,
    arena: FrameArena,
    detector: SquareDetector,
    patterns: PatternSet,
    widths: BTreeMap<SquareMarkerId, f64>,
    history: SquareHistory,
    nft: NftTracker,
    multi: Vec<MultiMarkerSet>,
    diagnostics: FrameDiagnostics,
    started: Instant,
}

/// One tracking session.
pub struct Tracker {
    session: Option<Session>,
}

impl Tracker {
    /// Creates a session for `width` x `height` frames. Camera parameters
    /// calibrated at another resolution are rescaled.
    pub fn new(width: u32, height: u32, camera: CameraParams, config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        let arena = FrameArena::new(width, height)?;
        let camera = if camera.xsize != width || camera.ysize != height {
            warn!(
                from_width = camera.xsize,
                from_height = camera.ysize,
                to_width = width,
                to_height = height,
                "camera parameters rescaled to frame size"
            );
            camera.change_size(width, height)?
        } else {
            camera
        };

        let sq = &config.square;
        let threshold = ThresholdState::new(
            sq.threshold_mode,
            sq.threshold,
            sq.auto_threshold_interval,
            sq.bracket_offset,
        );
        info!(width, height, "tracker created");
        Ok(Self {
            session: Some(Session {
                camera: Arc::new(camera),
                detector: SquareDetector::new(width, height, threshold),
                config,
                arena,
                patterns: PatternSet::new(),
                widths: BTreeMap::new(),
                history: SquareHistory::new(),
                nft: NftTracker::new(),
                multi: Vec::new(),
                diagnostics: FrameDiagnostics::default(),
                started: Instant::now(),
            }),
        })
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(ArError::NotInitialized)
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(ArError::NotInitialized)
    }

    /// Releases every buffer and registry. Later calls, except `dispose`
    /// itself, return [`ArError::NotInitialized`].
    pub fn dispose(&mut self) {
        if self.session.take().is_some() {
            info!("tracker disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.session.is_none()
    }

    // ---- loading ----

    /// Registers a `.patt` template marker and returns its pattern id. Loading
    /// a pattern that is already registered returns the existing id.
    pub fn load_square_marker(&mut self, patt: &[u8]) -> Result<u32> {
        let s = self.session_mut()?;
        let pattern = Pattern::parse(patt)?;
        let id = s.patterns.add(pattern);
        info!(id, "pattern marker loaded");
        Ok(id)
    }

    /// Selects the matrix code family and sets widths for the given ids.
    pub fn load_matrix_marker_config(
        &mut self,
        code_type: MatrixCodeType,
        ids_with_widths: &[(u32, f64)],
    ) -> Result<()> {
        let s = self.session_mut()?;
        for &(id, width) in ids_with_widths {
            if id >= code_type.id_count() {
                return Err(ArError::IndexOutOfRange {
                    kind: "matrix code",
                    index: id as usize,
                    count: code_type.id_count() as usize,
                });
            }
            check_width(width)?;
        }
        s.config.square.detector.matrix_code_type = code_type;
        for &(id, width) in ids_with_widths {
            s.widths.insert(SquareMarkerId::Matrix(id), width);
        }
        info!(?code_type, markers = ids_with_widths.len(), "matrix markers configured");
        Ok(())
    }

    pub fn set_marker_width(&mut self, id: SquareMarkerId, width: f64) -> Result<()> {
        let s = self.session_mut()?;
        check_width(width)?;
        if let SquareMarkerId::Pattern(p) = id {
            if p as usize >= s.patterns.len() {
                return Err(ArError::IndexOutOfRange {
                    kind: "pattern",
                    index: p as usize,
                    count: s.patterns.len(),
                });
            }
        }
        s.widths.insert(id, width);
        Ok(())
    }

    /// Registers an NFT page. Nothing is registered when the files are
    /// missing or inconsistent.
    pub fn load_nft_page(&mut self, files: NftPageFiles) -> Result<u32> {
        let s = self.session_mut()?;
        let dataset = NftDataset::from_files(&files)?;
        Ok(s.nft.add_page(dataset, &s.config.nft))
    }

    /// Registers an already built dataset, e.g. from [`NftDataset::generate`].
    pub fn add_nft_dataset(&mut self, dataset: NftDataset) -> Result<u32> {
        let s = self.session_mut()?;
        Ok(s.nft.add_page(dataset, &s.config.nft))
    }

    /// Parses a multi-marker definition; referenced pattern files are
    /// registered as template markers.
    pub fn load_multi_marker_set(
        &mut self,
        config: &str,
        pattern_files: &[(&str, &[u8])],
    ) -> Result<u32> {
        let s = self.session_mut()?;
        let code_type = s.config.square.detector.matrix_code_type;
        let set = MultiMarkerSet::parse(config, pattern_files, code_type, &mut s.patterns)?;
        for sub in &set.markers {
            s.widths.insert(sub.id, sub.width);
        }
        s.multi.push(set);
        Ok((s.multi.len() - 1) as u32)
    }

    // ---- processing ----

    /// Processes one frame, timestamped by the session clock.
    pub fn process(&mut self, pixels: &[u8]) -> Result<Vec<DetectionEvent>> {
        let now = self.session()?.started.elapsed();
        self.process_at(pixels, now)
    }

    /// Processes one frame taken at `timestamp`. Timestamps drive the NFT
    /// lost debounce and should not go backwards.
    pub fn process_at(&mut self, pixels: &[u8], timestamp: Duration) -> Result<Vec<DetectionEvent>> {
        let s = self.session_mut()?;
        let (width, height) = (s.arena.width(), s.arena.height());
        s.arena.load_frame(pixels, width, height, s.config.pixel_format)?;
        s.diagnostics = FrameDiagnostics::default();
        s.history.begin_frame();

        let mut events = Vec::new();

        // Square and matrix markers
        let squares = s.detector.detect(
            &s.arena,
            &s.config.square.detector,
            &s.patterns,
            &mut s.diagnostics,
        );
        if s.config.debug {
            copy_debug_image(&s.detector, &mut s.arena);
        }
        for square in squares {
            let width = s
                .widths
                .get(&square.id)
                .copied()
                .unwrap_or(s.config.square.default_marker_width);
            let previous = s.history.previous_pose(square.id);
            let Some((trans, error)) =
                get_trans_mat_square_cont(&s.camera, &square.vertices, width, previous.as_ref())
            else {
                trace!(id = ?square.id, "no pose for square");
                continue;
            };
            let marker = s
                .history
                .record(SquareSighting {
                    id: square.id,
                    confidence: square.confidence,
                    direction: square.direction,
                    area: square.area,
                    center: square.center,
                    vertices: square.vertices,
                    width,
                    trans,
                    error,
                })
                .clone();
            events.push(DetectionEvent::SquareFound { marker });
        }

        // NFT pages
        let updates = s.nft.process(
            &s.arena.luma_image(),
            &s.camera,
            &s.config.nft,
            timestamp,
            &mut s.diagnostics,
        );
        for update in updates {
            events.push(match update.transition {
                NftTransition::Found => DetectionEvent::NftFound {
                    render_matrix: to_render_matrix(&update.marker.trans, None),
                    marker: update.marker,
                },
                NftTransition::Lost => DetectionEvent::NftLost {
                    page_id: update.page_id,
                },
            });
        }

        // Multi-marker sets
        for (i, set) in s.multi.iter().enumerate() {
            if let Some(pose) = set.compute_pose(&s.history, s.config.multi_policy) {
                events.push(DetectionEvent::MultiMarkerFound {
                    set_id: i as u32,
                    render_matrix: to_render_matrix(&pose.trans, None),
                    pose,
                });
            }
        }

        debug!(
            squares = s.diagnostics.square_markers,
            candidates = s.diagnostics.square_candidates,
            events = events.len(),
            "frame processed"
        );
        Ok(events)
    }

    // ---- queries ----

    pub fn width(&self) -> Result<u32> {
        Ok(self.session()?.arena.width())
    }

    pub fn height(&self) -> Result<u32> {
        Ok(self.session()?.arena.height())
    }

    pub fn camera(&self) -> Result<Arc<CameraParams>> {
        Ok(Arc::clone(&self.session()?.camera))
    }

    pub fn config(&self) -> Result<&TrackerConfig> {
        Ok(&self.session()?.config)
    }

    pub fn square_marker(&self, id: SquareMarkerId) -> Result<Option<SquareMarkerDescriptor>> {
        Ok(self.session()?.history.get(id).cloned())
    }

    pub fn nft_marker(&self, page_id: u32) -> Result<Option<NftMarkerDescriptor>> {
        Ok(self.session()?.nft.marker(page_id).cloned())
    }

    pub fn pattern_count(&self) -> Result<usize> {
        Ok(self.session()?.patterns.len())
    }

    pub fn nft_page_count(&self) -> Result<usize> {
        Ok(self.session()?.nft.len())
    }

    pub fn multi_marker_count(&self) -> Result<usize> {
        Ok(self.session()?.multi.len())
    }

    pub fn multi_marker_sub_count(&self, set_id: u32) -> Result<usize> {
        let s = self.session()?;
        s.multi
            .get(set_id as usize)
            .map(MultiMarkerSet::len)
            .ok_or(ArError::IndexOutOfRange {
                kind: "multi-marker set",
                index: set_id as usize,
                count: s.multi.len(),
            })
    }

    /// Binarized image of the last frame, full resolution; `None` unless
    /// debug mode is on.
    pub fn processing_image(&self) -> Result<Option<&[u8]>> {
        let s = self.session()?;
        Ok(s.config.debug.then(|| s.arena.debug_image()))
    }

    /// Luma of the last frame.
    pub fn luma(&self) -> Result<&[u8]> {
        Ok(self.session()?.arena.luma())
    }

    /// Column-major, right-handed projection for the configured near/far.
    pub fn camera_projection_matrix(&self) -> Result<[f64; 16]> {
        let s = self.session()?;
        Ok(s.camera.projection_matrix(s.config.near, s.config.far))
    }

    pub fn diagnostics(&self) -> Result<&FrameDiagnostics> {
        Ok(&self.session()?.diagnostics)
    }

    // ---- settings ----

    pub fn set_pixel_format(&mut self, format: PixelFormat) -> Result<()> {
        self.session_mut()?.config.pixel_format = format;
        Ok(())
    }

    pub fn pixel_format(&self) -> Result<PixelFormat> {
        Ok(self.session()?.config.pixel_format)
    }

    pub fn set_threshold_mode(&mut self, mode: ThresholdMode) -> Result<()> {
        let s = self.session_mut()?;
        s.config.square.threshold_mode = mode;
        s.detector.threshold.set_mode(mode);
        Ok(())
    }

    pub fn threshold_mode(&self) -> Result<ThresholdMode> {
        Ok(self.session()?.detector.threshold.mode)
    }

    /// Sets the manual threshold; automatic modes overwrite it as they run.
    pub fn set_threshold(&mut self, value: u8) -> Result<()> {
        let s = self.session_mut()?;
        s.config.square.threshold = value;
        s.detector.threshold.set_value(value);
        Ok(())
    }

    /// Threshold currently in effect.
    pub fn threshold(&self) -> Result<u8> {
        Ok(self.session()?.detector.threshold.value)
    }

    pub fn set_labeling_mode(&mut self, mode: LabelingMode) -> Result<()> {
        self.session_mut()?.config.square.detector.labeling_mode = mode;
        Ok(())
    }

    pub fn labeling_mode(&self) -> Result<LabelingMode> {
        Ok(self.session()?.config.square.detector.labeling_mode)
    }

    pub fn set_connectivity(&mut self, connectivity: Connectivity) -> Result<()> {
        self.session_mut()?.config.square.detector.connectivity = connectivity;
        Ok(())
    }

    pub fn connectivity(&self) -> Result<Connectivity> {
        Ok(self.session()?.config.square.detector.connectivity)
    }

    pub fn set_pattern_detection_mode(&mut self, mode: PatternDetectionMode) -> Result<()> {
        self.session_mut()?.config.square.detector.pattern_detection_mode = mode;
        Ok(())
    }

    pub fn pattern_detection_mode(&self) -> Result<PatternDetectionMode> {
        Ok(self.session()?.config.square.detector.pattern_detection_mode)
    }

    pub fn set_matrix_code_type(&mut self, code_type: MatrixCodeType) -> Result<()> {
        self.session_mut()?.config.square.detector.matrix_code_type = code_type;
        Ok(())
    }

    pub fn matrix_code_type(&self) -> Result<MatrixCodeType> {
        Ok(self.session()?.config.square.detector.matrix_code_type)
    }

    pub fn set_image_proc_mode(&mut self, mode: ImageProcMode) -> Result<()> {
        self.session_mut()?.config.square.detector.image_proc_mode = mode;
        Ok(())
    }

    pub fn image_proc_mode(&self) -> Result<ImageProcMode> {
        Ok(self.session()?.config.square.detector.image_proc_mode)
    }

    pub fn set_pattern_ratio(&mut self, ratio: f64) -> Result<()> {
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(ArError::InvalidParameter(format!(
                "pattern ratio {ratio} outside (0, 1)"
            )));
        }
        self.session_mut()?.config.square.detector.patt_ratio = ratio;
        Ok(())
    }

    pub fn pattern_ratio(&self) -> Result<f64> {
        Ok(self.session()?.config.square.detector.patt_ratio)
    }

    pub fn set_debug_mode(&mut self, enabled: bool) -> Result<()> {
        self.session_mut()?.config.debug = enabled;
        Ok(())
    }

    pub fn debug_mode(&self) -> Result<bool> {
        Ok(self.session()?.config.debug)
    }

    pub fn set_projection_near_far(&mut self, near: f64, far: f64) -> Result<()> {
        if !(near > 0.0 && far > near) {
            return Err(ArError::InvalidParameter(format!(
                "projection planes must satisfy 0 < near < far, got {near} / {far}"
            )));
        }
        let s = self.session_mut()?;
        s.config.near = near;
        s.config.far = far;
        Ok(())
    }

    pub fn projection_near(&self) -> Result<f64> {
        Ok(self.session()?.config.near)
    }

    pub fn projection_far(&self) -> Result<f64> {
        Ok(self.session()?.config.far)
    }
}

fn check_width(width: f64) -> Result<()> {
    if width > 0.0 && width.is_finite() {
        Ok(())
    } else {
        Err(ArError::InvalidParameter(format!(
            "marker width must be positive, got {width}"
        )))
    }
}

/// Copies the detector's binary image into the arena, upsampling field
/// images back to full resolution.
fn copy_debug_image(detector: &SquareDetector, arena: &mut FrameArena) {
    let (w, h) = (arena.width(), arena.height());
    let bin = detector.binary_image();
    let dst = arena.debug_mut();
    if bin.width == w && bin.height == h {
        dst.copy_from_slice(bin.data);
        return;
    }
    for y in 0..h {
        let sy = (y * bin.height / h).min(bin.height.saturating_sub(1));
        for x in 0..w {
            let sx = (x * bin.width / w).min(bin.width.saturating_sub(1));
            dst[(y * w + x) as usize] = bin.data[(sy * bin.width + sx) as usize];
        }
    }
}
