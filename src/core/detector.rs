// src/core/detector.rs
#![allow(clippy::needless_range_loop)]

use serde::{Deserialize, Serialize};

use crate::core::frame::FrameArena;
use crate::core::history::SquareMarkerId;
use crate::core::matrix_code::read_matrix;
use crate::core::pattern::{PatternSet, PatternSource};
use crate::core::threshold::{binarize, binarize_adaptive, pick_bracket, ThresholdState};
use crate::cv::contours::{Contour, ContourTracer};
use crate::cv::geometry::{
    approx_poly_dp, fit_line, intersect_lines, is_contour_convex, min_edge_length, polygon_area,
    quad_center, Line,
};
use crate::cv::labeling::{label_components, Connectivity, Labeling};
use crate::cv::scalar::ScalarCV;
use crate::cv::ComputerVision;
use crate::tracker::FrameDiagnostics;
use crate::{ArError, ImageBuffer, MarkerCorners, Point2f, Point2i, Result};

pub use crate::core::matrix_code::MatrixCodeType;
pub use crate::core::threshold::{LabelingMode, ThresholdMode};

/// Full frames or 2x2-averaged half-resolution fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImageProcMode {
    #[default]
    FrameImage,
    FieldImage,
}

impl ImageProcMode {
    pub fn code(self) -> i32 {
        match self {
            ImageProcMode::FrameImage => 0,
            ImageProcMode::FieldImage => 1,
        }
    }
}

impl TryFrom<i32> for ImageProcMode {
    type Error = ArError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(ImageProcMode::FrameImage),
            1 => Ok(ImageProcMode::FieldImage),
            other => Err(ArError::InvalidParameter(format!(
                "unknown image processing mode {other}"
            ))),
        }
    }
}

/// How candidate squares are identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PatternDetectionMode {
    #[default]
    TemplateColor,
    TemplateMono,
    Matrix,
    TemplateColorAndMatrix,
    TemplateMonoAndMatrix,
}

impl PatternDetectionMode {
    pub fn code(self) -> i32 {
        match self {
            PatternDetectionMode::TemplateColor => 0,
            PatternDetectionMode::TemplateMono => 1,
            PatternDetectionMode::Matrix => 2,
            PatternDetectionMode::TemplateColorAndMatrix => 3,
            PatternDetectionMode::TemplateMonoAndMatrix => 4,
        }
    }

    pub fn uses_matrix(self) -> bool {
        matches!(
            self,
            PatternDetectionMode::Matrix
                | PatternDetectionMode::TemplateColorAndMatrix
                | PatternDetectionMode::TemplateMonoAndMatrix
        )
    }

    pub fn uses_template(self) -> bool {
        self != PatternDetectionMode::Matrix
    }

    pub fn uses_color(self) -> bool {
        matches!(
            self,
            PatternDetectionMode::TemplateColor | PatternDetectionMode::TemplateColorAndMatrix
        )
    }
}

impl TryFrom<i32> for PatternDetectionMode {
    type Error = ArError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => PatternDetectionMode::TemplateColor,
            1 => PatternDetectionMode::TemplateMono,
            2 => PatternDetectionMode::Matrix,
            3 => PatternDetectionMode::TemplateColorAndMatrix,
            4 => PatternDetectionMode::TemplateMonoAndMatrix,
            other => {
                return Err(ArError::InvalidParameter(format!(
                    "unknown pattern detection mode {other}"
                )))
            }
        })
    }
}

/// Square detector settings. Areas are in full-frame pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub labeling_mode: LabelingMode,
    pub connectivity: Connectivity,
    pub image_proc_mode: ImageProcMode,
    pub pattern_detection_mode: PatternDetectionMode,
    pub matrix_code_type: MatrixCodeType,
    /// Share of the marker side covered by the pattern or code grid.
    pub patt_ratio: f64,
    pub area_min: u32,
    pub area_max: u32,
    /// Provisional label cap per labeling pass.
    pub max_labels: usize,
    /// Polygon approximation tolerance, relative to the contour length.
    pub poly_epsilon: f64,
    pub min_edge_length: f64,
    pub min_confidence: f32,
    pub confidence_margin: f32,
    /// Minimum spread between the darkest and brightest code cell.
    pub matrix_min_contrast: u8,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            labeling_mode: LabelingMode::BlackRegion,
            connectivity: Connectivity::Eight,
            image_proc_mode: ImageProcMode::FrameImage,
            pattern_detection_mode: PatternDetectionMode::TemplateColor,
            matrix_code_type: MatrixCodeType::Code3x3,
            patt_ratio: 0.5,
            area_min: 70,
            area_max: 1_000_000,
            max_labels: 30_000,
            poly_epsilon: 0.05,
            min_edge_length: 8.0,
            min_confidence: 0.5,
            confidence_margin: 0.05,
            matrix_min_contrast: 30,
        }
    }
}

/// An identified square in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedSquare {
    pub id: SquareMarkerId,
    pub confidence: f32,
    /// Quarter turns between the traced quad and the marker's upright
    /// orientation. Already applied to `vertices`.
    pub direction: usize,
    /// Vertices clockwise from the marker's top-left corner.
    pub vertices: MarkerCorners,
    pub area: f32,
    pub center: Point2f,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    vertices: MarkerCorners,
    area: f32,
    center: Point2f,
}

/// Quad-marker detector owning its per-frame scratch buffers.
pub struct SquareDetector {
    pub threshold: ThresholdState,
    binary: Vec<u8>,
    field: Vec<u8>,
    proc_width: u32,
    proc_height: u32,
    tracer: ContourTracer,
}

impl SquareDetector {
    pub fn new(width: u32, height: u32, threshold: ThresholdState) -> Self {
        Self {
            threshold,
            binary: vec![0; (width * height) as usize],
            field: Vec::new(),
            proc_width: width,
            proc_height: height,
            tracer: ContourTracer::new(width, height),
        }
    }

    /// Binarized image of the last pass, at processing resolution.
    pub fn binary_image(&self) -> ImageBuffer<'_> {
        ImageBuffer {
            data: &self.binary[..(self.proc_width * self.proc_height) as usize],
            width: self.proc_width,
            height: self.proc_height,
        }
    }

    /// Primary pipeline: threshold -> label -> contours -> quads -> identify.
    pub fn detect(
        &mut self,
        arena: &FrameArena,
        config: &DetectorConfig,
        patterns: &PatternSet,
        diagnostics: &mut FrameDiagnostics,
    ) -> Vec<DetectedSquare> {
        let (width, height) = (arena.width(), arena.height());

        // 1. Optional field image
        let scale = match config.image_proc_mode {
            ImageProcMode::FieldImage if width >= 2 && height >= 2 => {
                self.proc_width = width / 2;
                self.proc_height = height / 2;
                self.field
                    .resize((self.proc_width * self.proc_height) as usize, 0);
                ScalarCV::half_sample(&arena.luma_image(), &mut self.field);
                2.0
            }
            _ => {
                self.proc_width = width;
                self.proc_height = height;
                1.0
            }
        };
        let n = (self.proc_width * self.proc_height) as usize;
        if self.binary.len() < n {
            self.binary.resize(n, 0);
        }

        // 2. Threshold policy
        let (markers, candidates) = match self.threshold.mode {
            ThresholdMode::AutoAdaptive => {
                self.binarize_adaptive(arena, config);
                diagnostics.threshold = None;
                self.run_pass(arena, config, patterns, scale, diagnostics)
            }
            ThresholdMode::AutoBracketing => {
                let bracket = self.threshold.bracket();
                let mut runs: Vec<(Vec<DetectedSquare>, usize)> = Vec::with_capacity(3);
                for &t in &bracket {
                    self.binarize_global(arena, config, t);
                    runs.push(self.run_pass(arena, config, patterns, scale, diagnostics));
                }
                let counts = [runs[0].0.len(), runs[1].0.len(), runs[2].0.len()];
                let pick = pick_bracket(counts);
                tracing::debug!(
                    thresholds = ?bracket,
                    counts = ?counts,
                    chosen = bracket[pick],
                    "bracketing threshold"
                );
                self.threshold.set_value(bracket[pick]);
                diagnostics.threshold = Some(bracket[pick]);
                diagnostics.bracket_counts = Some(counts);
                // Leave the chosen pass in the binary buffer.
                if pick != 2 {
                    self.binarize_global(arena, config, bracket[pick]);
                }
                runs.swap_remove(pick)
            }
            _ => {
                let t = if self.proc_width == arena.width() {
                    self.threshold.frame_threshold(arena.luma())
                } else {
                    self.threshold.frame_threshold(&self.field)
                };
                self.binarize_global(arena, config, t);
                diagnostics.threshold = Some(t);
                self.run_pass(arena, config, patterns, scale, diagnostics)
            }
        };

        diagnostics.square_candidates = candidates;
        diagnostics.square_markers = markers.len();
        markers
    }

    fn binarize_global(&mut self, arena: &FrameArena, config: &DetectorConfig, t: u8) {
        let n = (self.proc_width * self.proc_height) as usize;
        let luma: &[u8] = if self.proc_width == arena.width() {
            arena.luma()
        } else {
            &self.field
        };
        binarize(luma, &mut self.binary[..n], t, config.labeling_mode);
    }

    fn binarize_adaptive(&mut self, arena: &FrameArena, config: &DetectorConfig) {
        let n = (self.proc_width * self.proc_height) as usize;
        let src = ImageBuffer {
            data: if self.proc_width == arena.width() {
                arena.luma()
            } else {
                &self.field
            },
            width: self.proc_width,
            height: self.proc_height,
        };
        binarize_adaptive(&src, &mut self.binary[..n], config.labeling_mode);
    }

    /// Labels, traces and identifies the current binary image. Returns the
    /// markers and the number of quad candidates the pass produced.
    fn run_pass(
        &mut self,
        arena: &FrameArena,
        config: &DetectorConfig,
        patterns: &PatternSet,
        scale: f32,
        diagnostics: &mut FrameDiagnostics,
    ) -> (Vec<DetectedSquare>, usize) {
        let (pw, ph) = (self.proc_width, self.proc_height);
        let n = (pw * ph) as usize;

        // 3. Connected components
        let labeling = label_components(&self.binary[..n], pw, ph, config.connectivity, config.max_labels);
        if labeling.overflow && !diagnostics.labeling_overflow {
            tracing::warn!(
                max_labels = config.max_labels,
                "label table full, remaining components ignored this frame"
            );
            diagnostics.labeling_overflow = true;
        }

        // 4. Outer contours
        let binary = ImageBuffer {
            data: &self.binary[..n],
            width: pw,
            height: ph,
        };
        let contours = self.tracer.trace(&binary, true);

        // 5. Quad candidates
        let area_div = scale * scale;
        let mut candidates = find_candidates(&contours, &labeling, pw, ph, config, area_div);
        for c in candidates.iter_mut() {
            for v in c.vertices.iter_mut() {
                *v = *v * scale + Point2f::new(0.5, 0.5) * (scale - 1.0);
            }
            c.area *= area_div;
            c.center = quad_center(&c.vertices);
        }
        clockwise_corners(&mut candidates);
        let candidates = not_too_near(candidates);

        // 6. Identification
        let markers = identify(arena, config, patterns, &candidates);
        (dedupe(markers), candidates.len())
    }
}

/// Filters traced contours into convex quadrilaterals with sub-pixel corners.
fn find_candidates(
    contours: &[Contour],
    labeling: &Labeling,
    width: u32,
    height: u32,
    config: &DetectorConfig,
    area_div: f32,
) -> Vec<Candidate> {
    let area_min = (config.area_min as f32 / area_div) as u32;
    let area_max = (config.area_max as f32 / area_div) as u32;
    let mut candidates = Vec::new();

    for contour in contours {
        let Some(start) = contour.points.first() else {
            continue;
        };
        let label = labeling.label_at(start.x, start.y, width);
        let area = labeling.area(label);
        if area < area_min.max(1) || area > area_max {
            continue;
        }
        let touches_border = contour.points.iter().any(|p| {
            p.x <= 0 || p.y <= 0 || p.x as u32 >= width - 1 || p.y as u32 >= height - 1
        });
        if touches_border {
            continue;
        }

        let epsilon = (contour.points.len() as f64) * config.poly_epsilon;
        let idx = approx_poly_dp(&contour.points, epsilon);
        if idx.len() != 4 {
            continue;
        }
        let poly: Vec<Point2i> = idx.iter().map(|&i| contour.points[i]).collect();
        if !is_contour_convex(&poly) || min_edge_length(&poly) < config.min_edge_length {
            tracing::trace!(label, "quad rejected: concave or short edge");
            continue;
        }

        let vertices = refine_corners(&contour.points, &idx).unwrap_or([
            Point2f::new(poly[0].x as f32, poly[0].y as f32),
            Point2f::new(poly[1].x as f32, poly[1].y as f32),
            Point2f::new(poly[2].x as f32, poly[2].y as f32),
            Point2f::new(poly[3].x as f32, poly[3].y as f32),
        ]);
        candidates.push(Candidate {
            vertices,
            area: polygon_area(&vertices).abs(),
            center: quad_center(&vertices),
        });
    }
    candidates
}

/// Fits a line to the inner 90% of each side and intersects neighbours.
fn refine_corners(points: &[Point2i], idx: &[usize]) -> Option<MarkerCorners> {
    let n = points.len();
    let mut lines = [Line { a: 0.0, b: 0.0, c: 0.0 }; 4];
    for k in 0..4 {
        let from = idx[k];
        let to = idx[(k + 1) % 4];
        let len = (to + n - from) % n;
        let trim = len / 20;
        let side: Vec<Point2i> = (trim..=len.saturating_sub(trim))
            .map(|o| points[(from + o) % n])
            .collect();
        lines[k] = fit_line(&side)?;
    }

    let mut out = [Point2f::zeros(); 4];
    for k in 0..4 {
        let corner = intersect_lines(&lines[(k + 3) % 4], &lines[k])?;
        let raw = points[idx[k]];
        let raw = Point2f::new(raw.x as f32, raw.y as f32);
        // A far-off intersection means a bad fit; keep the polygon vertex.
        out[k] = if (corner - raw).norm() <= 3.0 { corner } else { raw };
    }
    Some(out)
}

/// Sorts candidate corners in clockwise order (image y down).
fn clockwise_corners(candidates: &mut [Candidate]) {
    for candidate in candidates.iter_mut() {
        let v = &mut candidate.vertices;
        let dx1 = v[1].x - v[0].x;
        let dy1 = v[1].y - v[0].y;
        let dx2 = v[2].x - v[0].x;
        let dy2 = v[2].y - v[0].y;

        if (dx1 * dy2 - dy1 * dx2) < 0.0 {
            v.swap(1, 3);
        }
    }
}

/// Drops the smaller of two candidates whose centers are closer than half
/// the side of the larger one.
fn not_too_near(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let len = candidates.len();
    let mut too_near_flags = vec![false; len];

    for i in 0..len {
        for j in (i + 1)..len {
            let (a, b) = (&candidates[i], &candidates[j]);
            let larger = a.area.max(b.area);
            if (a.center - b.center).norm() < larger.sqrt() / 2.0 {
                if a.area < b.area {
                    too_near_flags[i] = true;
                } else {
                    too_near_flags[j] = true;
                }
            }
        }
    }

    candidates
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !too_near_flags[*i])
        .map(|(_, c)| c)
        .collect()
}

/// Vertex `i` of the upright marker is quad vertex `(i + 4 - direction) % 4`.
fn reorder(vertices: &MarkerCorners, direction: usize) -> MarkerCorners {
    std::array::from_fn(|i| vertices[(i + 4 - direction % 4) % 4])
}

fn identify(
    arena: &FrameArena,
    config: &DetectorConfig,
    patterns: &PatternSet,
    candidates: &[Candidate],
) -> Vec<DetectedSquare> {
    let mode = config.pattern_detection_mode;
    let luma = arena.luma_image();
    let source = if mode.uses_color() {
        PatternSource::Color {
            rgb: arena.color(),
            width: arena.width(),
            height: arena.height(),
        }
    } else {
        PatternSource::Mono(&luma)
    };

    let mut out = Vec::new();
    for c in candidates {
        // Matrix first: it is the cheaper test.
        let matrix = mode
            .uses_matrix()
            .then(|| {
                read_matrix(
                    &luma,
                    &c.vertices,
                    config.matrix_code_type,
                    config.patt_ratio,
                    config.matrix_min_contrast,
                )
            })
            .flatten()
            .map(|m| (SquareMarkerId::Matrix(m.id), m.direction, m.confidence));

        let found = matrix.or_else(|| {
            if !mode.uses_template() || patterns.is_empty() {
                return None;
            }
            patterns
                .identify(
                    &source,
                    &c.vertices,
                    config.patt_ratio,
                    config.min_confidence,
                    config.confidence_margin,
                )
                .map(|m| (SquareMarkerId::Pattern(m.id), m.direction, m.confidence))
        });

        if let Some((id, direction, confidence)) = found {
            out.push(DetectedSquare {
                id,
                confidence,
                direction,
                vertices: reorder(&c.vertices, direction),
                area: c.area,
                center: c.center,
            });
        }
    }
    out
}

/// One detection per id per frame: the most confident wins.
fn dedupe(mut markers: Vec<DetectedSquare>) -> Vec<DetectedSquare> {
    markers.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut out: Vec<DetectedSquare> = Vec::with_capacity(markers.len());
    for m in markers {
        if out.iter().any(|o| o.id == m.id) {
            tracing::trace!(id = ?m.id, "duplicate marker id dropped");
            continue;
        }
        out.push(m);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::threshold::DEFAULT_THRESHOLD;

    fn candidate(vertices: MarkerCorners) -> Candidate {
        Candidate {
            vertices,
            area: polygon_area(&vertices).abs(),
            center: quad_center(&vertices),
        }
    }

    #[test]
    fn test_clockwise_corners() {
        let mut candidates = vec![candidate([
            Point2f::new(0.0, 0.0),
            Point2f::new(0.0, 10.0), // Flipped
            Point2f::new(10.0, 10.0),
            Point2f::new(10.0, 0.0),
        ])];

        clockwise_corners(&mut candidates);

        // Should have swapped index 1 and 3
        assert_eq!(candidates[0].vertices[1], Point2f::new(10.0, 0.0));
        assert_eq!(candidates[0].vertices[3], Point2f::new(0.0, 10.0));
    }

    #[test]
    fn test_not_too_near() {
        let c1 = [
            Point2f::new(0.0, 0.0),
            Point2f::new(10.0, 0.0),
            Point2f::new(10.0, 10.0),
            Point2f::new(0.0, 10.0),
        ];
        let c2 = [
            Point2f::new(3.0, 3.0),
            Point2f::new(7.0, 3.0),
            Point2f::new(7.0, 7.0),
            Point2f::new(3.0, 7.0),
        ];
        let far = [
            Point2f::new(40.0, 0.0),
            Point2f::new(44.0, 0.0),
            Point2f::new(44.0, 4.0),
            Point2f::new(40.0, 4.0),
        ];

        let filtered = not_too_near(vec![candidate(c2), candidate(c1), candidate(far)]);

        // The nested one goes, the distant small one stays.
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].vertices, c1);
        assert_eq!(filtered[1].vertices, far);
    }

    #[test]
    fn test_reorder() {
        let q = [
            Point2f::new(0.0, 0.0),
            Point2f::new(1.0, 0.0),
            Point2f::new(1.0, 1.0),
            Point2f::new(0.0, 1.0),
        ];
        assert_eq!(reorder(&q, 0), q);
        assert_eq!(reorder(&q, 1), [q[3], q[0], q[1], q[2]]);
        assert_eq!(reorder(&q, 3), [q[1], q[2], q[3], q[0]]);
    }

    #[test]
    fn test_dedupe_keeps_most_confident() {
        let q = [Point2f::zeros(); 4];
        let mk = |conf: f32, x: f32| DetectedSquare {
            id: SquareMarkerId::Matrix(4),
            confidence: conf,
            direction: 0,
            vertices: q,
            area: 1.0,
            center: Point2f::new(x, 0.0),
        };
        let out = dedupe(vec![mk(0.5, 1.0), mk(0.9, 2.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].center.x, 2.0);
    }

    #[test]
    fn mode_codes_round_trip() {
        for code in 0..5 {
            assert_eq!(PatternDetectionMode::try_from(code).unwrap().code(), code);
        }
        assert_eq!(ImageProcMode::try_from(1).unwrap(), ImageProcMode::FieldImage);
        assert!(PatternDetectionMode::try_from(7).is_err());
        assert!(PatternDetectionMode::TemplateMonoAndMatrix.uses_matrix());
        assert!(!PatternDetectionMode::Matrix.uses_template());
    }

    /// Solid dark square on white, 40 px side at (30, 20).
    fn square_frame() -> FrameArena {
        let (w, h) = (100u32, 80u32);
        let mut px = vec![255u8; (w * h) as usize];
        for y in 20..60 {
            for x in 30..70 {
                px[y * w as usize + x] = 0;
            }
        }
        let mut arena = FrameArena::new(w, h).unwrap();
        arena
            .load_frame(&px, w, h, crate::core::frame::PixelFormat::Mono)
            .unwrap();
        arena
    }

    #[test]
    fn finds_sub_pixel_quad() {
        let arena = square_frame();
        let mut det = SquareDetector::new(
            100,
            80,
            ThresholdState::new(ThresholdMode::Manual, DEFAULT_THRESHOLD, 1, 10),
        );
        let config = DetectorConfig::default();
        let mut diag = FrameDiagnostics::default();
        let t = det.threshold.frame_threshold(arena.luma());
        det.binarize_global(&arena, &config, t);
        let candidates = {
            let binary = det.binary_image();
            let labeling = label_components(binary.data, 100, 80, Connectivity::Eight, 1000);
            let contours = ContourTracer::new(100, 80).trace(&binary, true);
            find_candidates(&contours, &labeling, 100, 80, &config, 1.0)
        };
        assert_eq!(candidates.len(), 1);
        let c = candidates[0];
        assert!((c.center - Point2f::new(49.5, 39.5)).norm() < 0.5);
        assert!((c.area - 39.0 * 39.0).abs() < 40.0);

        // An unidentifiable square yields no markers.
        let found = det.detect(&arena, &config, &PatternSet::new(), &mut diag);
        assert!(found.is_empty());
        assert_eq!(diag.square_candidates, 1);
        assert_eq!(diag.threshold, Some(DEFAULT_THRESHOLD));
    }

    #[test]
    fn bracketing_counts_candidates_of_chosen_pass() {
        let arena = square_frame();
        let mut det = SquareDetector::new(
            100,
            80,
            ThresholdState::new(ThresholdMode::AutoBracketing, DEFAULT_THRESHOLD, 1, 10),
        );
        let mut diag = FrameDiagnostics::default();
        det.detect(&arena, &DetectorConfig::default(), &PatternSet::new(), &mut diag);
        // The square shows up at all three thresholds but is one candidate.
        assert_eq!(diag.square_candidates, 1);
        assert_eq!(diag.bracket_counts, Some([0, 0, 0]));
        assert_eq!(diag.threshold, Some(DEFAULT_THRESHOLD));
    }
}
