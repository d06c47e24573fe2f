// tests/nft_pipeline.rs
mod common;

use std::time::Duration;

use artrack_rs::nft::dataset::DatasetParams;
use artrack_rs::{
    ArError, DetectionEvent, NftDataset, NftPageFiles, NftTrackState, Tracker, TrackerConfig,
};
use common::{camera, paste_rgba, textured_page, HEIGHT, WIDTH};

const PAGE_W: u32 = 192;
const PAGE_H: u32 = 144;
const DPI: f32 = 72.0;
const OFFSET: (u32, u32) = (64, 48);

fn page() -> (Vec<u8>, NftDataset) {
    let luma = textured_page(PAGE_W, PAGE_H, 7);
    let dataset = NftDataset::generate(&luma, PAGE_W, PAGE_H, DPI, &DatasetParams::default()).unwrap();
    (luma, dataset)
}

fn ms(v: f64) -> Duration {
    Duration::from_secs_f64(v / 1000.0)
}

fn nft_events(events: &[DetectionEvent]) -> (usize, usize) {
    let found = events
        .iter()
        .filter(|e| matches!(e, DetectionEvent::NftFound { .. }))
        .count();
    let lost = events
        .iter()
        .filter(|e| matches!(e, DetectionEvent::NftLost { .. }))
        .count();
    (found, lost)
}

#[test]
fn page_is_found_and_lost_after_debounce() {
    let (luma, dataset) = page();
    let mut tracker = Tracker::new(WIDTH, HEIGHT, camera(), TrackerConfig::default()).unwrap();

    // Through the file round trip, as a page loaded from disk would be.
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("page");
    dataset.to_files().write_prefix(&prefix).unwrap();
    let page_id = tracker
        .load_nft_page(NftPageFiles::from_prefix(&prefix).unwrap())
        .unwrap();
    assert_eq!(tracker.nft_page_count().unwrap(), 1);

    let visible = paste_rgba(&luma, PAGE_W, PAGE_H, OFFSET.0, OFFSET.1);
    let blank = common::blank_rgba(255);

    for t in [0.0, 16.7, 33.3] {
        let events = tracker.process_at(&visible, ms(t)).unwrap();
        assert_eq!(nft_events(&events), (1, 0), "frame at {t} ms");
    }

    let events = tracker.process_at(&visible, ms(40.0)).unwrap();
    let Some(DetectionEvent::NftFound { marker, .. }) = events
        .iter()
        .find(|e| matches!(e, DetectionEvent::NftFound { .. }))
    else {
        panic!("page not found: {events:?}");
    };
    assert_eq!(marker.page_id, page_id);
    assert_eq!(marker.state, NftTrackState::Tracked);
    // 1 frame pixel per page pixel at f = 400 px.
    let t = marker.trans.translation();
    let z = 400.0 * 25.4 / DPI as f64;
    assert!((t.z - z).abs() < 0.03 * z, "depth {}", t.z);
    let mm = 25.4 / DPI as f64;
    let x = (OFFSET.0 as f64 - 160.0) * z / 400.0;
    let y = ((OFFSET.1 + PAGE_H) as f64 - 120.0) * z / 400.0;
    assert!((t.x - x).abs() < 4.0 * mm, "x {} vs {x}", t.x);
    assert!((t.y - y).abs() < 4.0 * mm, "y {} vs {y}", t.y);
    assert!((marker.pose[2] - OFFSET.0 as f32).abs() < 1.5);
    assert!((marker.pose[5] - OFFSET.1 as f32).abs() < 1.5);

    // A single missing frame inside the window stays silent.
    let events = tracker.process_at(&blank, ms(50.0)).unwrap();
    assert_eq!(nft_events(&events), (0, 0));
    assert_eq!(tracker.nft_marker(page_id).unwrap().unwrap().state, NftTrackState::Lost);
    let events = tracker.process_at(&visible, ms(66.7)).unwrap();
    assert_eq!(nft_events(&events), (1, 0));

    // Absent for longer than 200 ms: exactly one lost event.
    let mut lost = 0;
    for t in [100.0, 150.0, 250.0, 300.0, 350.0, 400.0] {
        let events = tracker.process_at(&blank, ms(t)).unwrap();
        let (found, l) = nft_events(&events);
        assert_eq!(found, 0);
        if l == 1 {
            assert!(t - 66.7 >= 200.0, "lost too early at {t} ms");
        }
        lost += l;
    }
    assert_eq!(lost, 1);
    let marker = tracker.nft_marker(page_id).unwrap().unwrap();
    assert!(!marker.found);
    assert_eq!(marker.state, NftTrackState::Unseen);
}

#[test]
fn incomplete_dataset_registers_nothing() {
    let (_, dataset) = page();
    let mut tracker = Tracker::new(WIDTH, HEIGHT, camera(), TrackerConfig::default()).unwrap();

    let mut files = dataset.to_files();
    files.fset3 = None;
    assert!(matches!(
        tracker.load_nft_page(files),
        Err(ArError::IncompleteDataset("fset3"))
    ));

    let mut files = dataset.to_files();
    if let Some(iset) = files.iset.as_mut() {
        iset.truncate(iset.len() / 2);
    }
    assert!(matches!(
        tracker.load_nft_page(files),
        Err(ArError::MalformedDataset(_))
    ));
    assert_eq!(tracker.nft_page_count().unwrap(), 0);
}

#[test]
fn feature_cap_is_reported() {
    let (_, dataset) = page();
    let mut config = TrackerConfig::default();
    config.nft.features.max_features = 50;
    let mut tracker = Tracker::new(WIDTH, HEIGHT, camera(), config).unwrap();
    tracker.add_nft_dataset(dataset).unwrap();

    tracker.process_at(&common::blob_field_rgba(), Duration::ZERO).unwrap();
    let diag = tracker.diagnostics().unwrap();
    assert_eq!(diag.feature_overflow, 1);
    assert_eq!(diag.nft_features, 50);
}

#[test]
fn disposed_tracker_rejects_calls() {
    let mut tracker = Tracker::new(WIDTH, HEIGHT, camera(), TrackerConfig::default()).unwrap();
    tracker.dispose();
    tracker.dispose();
    assert!(tracker.is_disposed());
    assert!(tracker.process(&common::blank_rgba(0)).is_err());
    assert!(tracker.nft_page_count().is_err());
}
