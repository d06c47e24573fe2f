// tests/tracker_pipeline.rs
mod common;

use artrack_rs::{
    DetectionEvent, MatrixCodeType, PatternDetectionMode, PixelFormat, SquareMarkerId, TrackerConfig,
    Tracker, TransMat,
};
use common::{
    asymmetric_pattern, camera, marker_pose, project, render, MatrixMarker, PatternMarker, Planar,
};

const MARKER_WIDTH: f64 = 80.0;

fn matrix_tracker() -> Tracker {
    let mut config = TrackerConfig::default();
    config.pixel_format = PixelFormat::Rgba;
    config.square.detector.pattern_detection_mode = PatternDetectionMode::Matrix;
    config.square.detector.matrix_code_type = MatrixCodeType::Code3x3;
    Tracker::new(common::WIDTH, common::HEIGHT, camera(), config).unwrap()
}

fn tracker_with_mode(mode: PatternDetectionMode) -> Tracker {
    let mut config = TrackerConfig::default();
    config.pixel_format = PixelFormat::Rgba;
    config.square.detector.pattern_detection_mode = mode;
    Tracker::new(common::WIDTH, common::HEIGHT, camera(), config).unwrap()
}

/// `pose` turned by a quarter turns about the marker normal.
fn turned(pose: &TransMat, quarters: u32) -> TransMat {
    let spin = nalgebra::Rotation3::from_axis_angle(
        &nalgebra::Vector3::z_axis(),
        std::f64::consts::FRAC_PI_2 * quarters as f64,
    );
    TransMat::from_parts(&(pose.rotation() * spin.into_inner()), &pose.translation())
}

/// Vertex 0 must sit on the marker's own top-left corner.
fn assert_top_left(marker: &artrack_rs::SquareMarkerDescriptor, truth: &TransMat, width: f64) {
    let (u, v) = project(truth, -width / 2.0, width / 2.0);
    let v0 = marker.vertices[0];
    let d = ((v0.x as f64 - u).powi(2) + (v0.y as f64 - v).powi(2)).sqrt();
    assert!(d < 2.0, "vertex 0 at {v0:?}, top-left projects to ({u}, {v})");
}

fn assert_pose_close(got: &TransMat, truth: &TransMat, width: f64) {
    let angle = got.rotation_angle_to(truth).to_degrees();
    assert!(angle < 2.0, "rotation off by {angle} deg");
    let dt = (got.translation() - truth.translation()).norm();
    assert!(dt < 0.02 * width, "translation off by {dt} mm");
}

fn square_events(events: &[DetectionEvent]) -> Vec<&artrack_rs::SquareMarkerDescriptor> {
    events
        .iter()
        .filter_map(|e| match e {
            DetectionEvent::SquareFound { marker } => Some(marker),
            _ => None,
        })
        .collect()
}

#[test]
fn matrix_marker_at_known_pose() {
    let mut tracker = matrix_tracker();
    tracker
        .load_matrix_marker_config(MatrixCodeType::Code3x3, &[(5, MARKER_WIDTH)])
        .unwrap();

    let truth = marker_pose(20.0, 10.0, [5.0, -3.0, 300.0]);
    let marker = MatrixMarker::new(MatrixCodeType::Code3x3, 5, MARKER_WIDTH);
    let frame = render(&camera(), &[(&marker as &dyn Planar, truth)]);

    let events = tracker.process(&frame).unwrap();
    let found = square_events(&events);
    assert_eq!(found.len(), 1, "{events:?}");
    assert_eq!(found[0].id, SquareMarkerId::Matrix(5));
    assert!(found[0].seen_this_frame);
    assert!(!found[0].seen_last_frame);
    assert_pose_close(&found[0].trans, &truth, MARKER_WIDTH);

    // Second frame takes the continuous path and stays on target.
    let events = tracker.process(&frame).unwrap();
    let found = square_events(&events);
    assert_eq!(found.len(), 1);
    assert!(found[0].seen_last_frame);
    assert_pose_close(&found[0].trans, &truth, MARKER_WIDTH);

    let diag = tracker.diagnostics().unwrap();
    assert_eq!(diag.square_markers, 1);
    assert!(!diag.labeling_overflow);
}

#[test]
fn rotated_marker_keeps_identity() {
    let mut tracker = matrix_tracker();
    // Upside down: the decoded direction must undo the half turn.
    let truth = {
        let base = marker_pose(0.0, 15.0, [-10.0, 5.0, 320.0]);
        let half_turn = nalgebra::Rotation3::from_axis_angle(&nalgebra::Vector3::z_axis(), std::f64::consts::PI);
        TransMat::from_parts(&(base.rotation() * half_turn.into_inner()), &base.translation())
    };
    let marker = MatrixMarker::new(MatrixCodeType::Code3x3, 17, MARKER_WIDTH);
    let frame = render(&camera(), &[(&marker as &dyn Planar, truth)]);

    let events = tracker.process(&frame).unwrap();
    let found = square_events(&events);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, SquareMarkerId::Matrix(17));
    assert_pose_close(&found[0].trans, &truth, MARKER_WIDTH);
}

#[test]
fn pattern_marker_at_known_pose() {
    let marker = PatternMarker::new(asymmetric_pattern(), MARKER_WIDTH);
    let patt = marker.patt_text();

    // Fresh session per turn so every frame takes the absolute pose path.
    for quarters in 0..4 {
        let mut tracker = tracker_with_mode(PatternDetectionMode::TemplateColor);
        let id = tracker.load_square_marker(patt.as_bytes()).unwrap();
        let truth = turned(&marker_pose(12.0, -8.0, [4.0, -6.0, 300.0]), quarters);
        let frame = render(&camera(), &[(&marker as &dyn Planar, truth)]);

        let events = tracker.process(&frame).unwrap();
        let found = square_events(&events);
        assert_eq!(found.len(), 1, "turn {quarters}: {events:?}");
        assert_eq!(found[0].id, SquareMarkerId::Pattern(id));
        assert!(found[0].confidence > 0.7, "confidence {}", found[0].confidence);
        assert_top_left(found[0], &truth, MARKER_WIDTH);
        assert_pose_close(&found[0].trans, &truth, MARKER_WIDTH);
    }
}

#[test]
fn template_and_matrix_markers_in_one_frame() {
    let mut tracker = tracker_with_mode(PatternDetectionMode::TemplateMonoAndMatrix);
    tracker
        .load_matrix_marker_config(MatrixCodeType::Code3x3, &[(9, 60.0)])
        .unwrap();
    let pattern = PatternMarker::new(asymmetric_pattern(), MARKER_WIDTH);
    let id = tracker.load_square_marker(pattern.patt_text().as_bytes()).unwrap();
    let matrix = MatrixMarker::new(MatrixCodeType::Code3x3, 9, 60.0);

    let pattern_pose = turned(&marker_pose(5.0, 10.0, [-65.0, 0.0, 360.0]), 1);
    let matrix_pose = marker_pose(-5.0, -10.0, [70.0, 5.0, 360.0]);
    let frame = render(
        &camera(),
        &[
            (&pattern as &dyn Planar, pattern_pose),
            (&matrix as &dyn Planar, matrix_pose),
        ],
    );

    let events = tracker.process(&frame).unwrap();
    let found = square_events(&events);
    assert_eq!(found.len(), 2, "{events:?}");
    let by_id = |want: SquareMarkerId| {
        found
            .iter()
            .find(|m| m.id == want)
            .unwrap_or_else(|| panic!("{want:?} missing: {events:?}"))
    };

    let p = by_id(SquareMarkerId::Pattern(id));
    assert_top_left(p, &pattern_pose, MARKER_WIDTH);
    assert_pose_close(&p.trans, &pattern_pose, MARKER_WIDTH);

    let m = by_id(SquareMarkerId::Matrix(9));
    assert_eq!(m.width, 60.0);
    assert_top_left(m, &matrix_pose, 60.0);
    assert_pose_close(&m.trans, &matrix_pose, 60.0);
}

#[test]
fn empty_frame_has_no_events() {
    let mut tracker = matrix_tracker();
    let events = tracker.process(&common::blank_rgba(255)).unwrap();
    assert!(events.is_empty());
    assert!(tracker.square_marker(SquareMarkerId::Matrix(5)).unwrap().is_none());
}

const MULTI: &str = "\
# two markers 120 mm apart
2

1
60.0
1 0 0 -60
0 1 0 0
0 0 1 0

2
60.0
1 0 0 60
0 1 0 0
0 0 1 0
";

#[test]
fn multi_marker_from_second_sub_marker() {
    let mut tracker = matrix_tracker();
    let set = tracker.load_multi_marker_set(MULTI, &[]).unwrap();
    assert_eq!(tracker.multi_marker_count().unwrap(), 1);
    assert_eq!(tracker.multi_marker_sub_count(set).unwrap(), 2);
    assert!(tracker.multi_marker_sub_count(9).is_err());

    let set_pose = marker_pose(10.0, -10.0, [-40.0, 0.0, 330.0]);
    let offset = TransMat::from_array(&[1.0, 0.0, 0.0, 60.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    let sub_pose = set_pose.compose(&offset);
    let marker = MatrixMarker::new(MatrixCodeType::Code3x3, 2, 60.0);
    let frame = render(&camera(), &[(&marker as &dyn Planar, sub_pose)]);

    let events = tracker.process(&frame).unwrap();
    let square_pos = events
        .iter()
        .position(|e| matches!(e, DetectionEvent::SquareFound { .. }))
        .expect("square event");
    let multi_pos = events
        .iter()
        .position(|e| matches!(e, DetectionEvent::MultiMarkerFound { .. }))
        .expect("multi event");
    assert!(square_pos < multi_pos);

    let DetectionEvent::MultiMarkerFound { set_id, pose, .. } = &events[multi_pos] else {
        unreachable!()
    };
    assert_eq!(*set_id, set);
    assert_eq!(pose.visible, 1);
    assert_eq!(pose.contributors, vec![1]);
    assert_pose_close(&pose.trans, &set_pose, 60.0);

    // Nothing visible: no set event.
    let events = tracker.process(&common::blank_rgba(255)).unwrap();
    assert!(events
        .iter()
        .all(|e| !matches!(e, DetectionEvent::MultiMarkerFound { .. })));
}
