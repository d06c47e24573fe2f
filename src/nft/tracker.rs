// src/nft/tracker.rs

//! Per-page NFT tracking: match, verify, fall back to templates, solve pose
//! and debounce the result.
use std::time::Duration;

use nalgebra::Matrix3;
use tracing::{debug, trace, warn};

use crate::config::NftConfig;
use crate::core::camera::CameraParams;
use crate::core::history::{NftContinuity, NftTrackState, NftTransition};
use crate::core::transmat::solve_planar;
use crate::nft::cluster::{match_features, FeatureIndex};
use crate::nft::dataset::NftDataset;
use crate::nft::features::{extract, FeatureSet};
use crate::nft::homography::{fit_homography_ransac, RansacResult};
use crate::nft::hough::consistent_matches;
use crate::nft::template::track_templates;
use crate::pose::TransMat;
use crate::tracker::FrameDiagnostics;
use crate::ImageBuffer;

const MM_PER_INCH: f64 = 25.4;

/// Public state of one NFT page.
#[derive(Debug, Clone, PartialEq)]
pub struct NftMarkerDescriptor {
    pub page_id: u32,
    /// Position among loaded pages.
    pub page_number: usize,
    pub found: bool,
    pub state: NftTrackState,
    /// Reference-pixel to frame-pixel homography, row-major with the last
    /// entry normalized to 1 and dropped.
    pub pose: [f32; 8],
    /// Camera from page, millimetres, origin at the page's bottom-left
    /// corner with y up.
    pub trans: TransMat,
    /// Mean squared reprojection error of the last pose, pixels.
    pub error: f64,
    pub inliers: usize,
}

/// How a page was found this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NftSource {
    Features,
    Templates,
}

/// One page's event for the frame.
#[derive(Debug, Clone)]
pub struct NftUpdate {
    pub page_id: u32,
    pub transition: NftTransition,
    pub marker: NftMarkerDescriptor,
}

struct NftPage {
    dataset: NftDataset,
    index: FeatureIndex,
    continuity: NftContinuity,
    homography: Option<Matrix3<f64>>,
    marker: NftMarkerDescriptor,
}

struct PageFit {
    h: Matrix3<f64>,
    trans: TransMat,
    error: f64,
    inliers: usize,
    source: NftSource,
}

/// All loaded NFT pages of one session.
#[derive(Default)]
pub struct NftTracker {
    pages: Vec<NftPage>,
    next_id: u32,
}

impl NftTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Registers a page and builds its descriptor index.
    pub fn add_page(&mut self, dataset: NftDataset, config: &NftConfig) -> u32 {
        let page_id = self.next_id;
        self.next_id += 1;
        let index = FeatureIndex::build(dataset.descriptors.clone(), &config.index);
        debug!(
            page_id,
            keypoints = dataset.keypoints.len(),
            levels = dataset.levels.len(),
            "indexed NFT page"
        );
        let marker = NftMarkerDescriptor {
            page_id,
            page_number: self.pages.len(),
            found: false,
            state: NftTrackState::Unseen,
            pose: [0.0; 8],
            trans: TransMat::identity(),
            error: 0.0,
            inliers: 0,
        };
        self.pages.push(NftPage {
            dataset,
            index,
            continuity: NftContinuity::default(),
            homography: None,
            marker,
        });
        page_id
    }

    pub fn marker(&self, page_id: u32) -> Option<&NftMarkerDescriptor> {
        self.pages
            .iter()
            .find(|p| p.marker.page_id == page_id)
            .map(|p| &p.marker)
    }

    pub fn dataset(&self, page_id: u32) -> Option<&NftDataset> {
        self.pages
            .iter()
            .find(|p| p.marker.page_id == page_id)
            .map(|p| &p.dataset)
    }

    /// Runs every page against one frame. Features are extracted once and
    /// shared; pages are independent after that.
    pub fn process(
        &mut self,
        frame: &ImageBuffer,
        camera: &CameraParams,
        config: &NftConfig,
        now: Duration,
        diagnostics: &mut FrameDiagnostics,
    ) -> Vec<NftUpdate> {
        if self.pages.is_empty() {
            return Vec::new();
        }

        let features = match extract(frame.data, frame.width, frame.height, &config.features) {
            Ok(features) => features,
            Err(e) => {
                trace!(error = %e, "no frame features");
                FeatureSet::default()
            }
        };
        if features.overflow {
            diagnostics.feature_overflow += 1;
            warn!(
                found = features.candidates,
                kept = features.keypoints.len(),
                "frame feature cap reached, weakest features dropped"
            );
        }
        diagnostics.nft_features = features.len();

        let debounce = config.debounce();
        let mut updates = Vec::new();
        for page in &mut self.pages {
            let fit = locate(page, &features, frame, camera, config);
            if let Some(fit) = &fit {
                page.homography = Some(fit.h);
                page.marker.pose = reduce_homography(&fit.h);
                page.marker.trans = fit.trans;
                page.marker.error = fit.error;
                page.marker.inliers = fit.inliers;
                trace!(
                    page_id = page.marker.page_id,
                    inliers = fit.inliers,
                    source = ?fit.source,
                    "NFT page located"
                );
            }
            let transition = page.continuity.observe(fit.is_some(), now, debounce);
            page.marker.found = fit.is_some();
            page.marker.state = page.continuity.state;
            if page.continuity.state == NftTrackState::Unseen {
                page.homography = None;
            }
            if let Some(transition) = transition {
                updates.push(NftUpdate {
                    page_id: page.marker.page_id,
                    transition,
                    marker: page.marker.clone(),
                });
            }
        }
        updates
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

fn locate(
    page: &NftPage,
    features: &FeatureSet,
    frame: &ImageBuffer,
    camera: &CameraParams,
    config: &NftConfig,
) -> Option<PageFit> {
    if let Some(fit) = locate_by_features(page, features, frame, camera, config) {
        return Some(fit);
    }
    let previous = page.homography.filter(|_| page.continuity.tracked())?;
    locate_by_templates(page, &previous, frame, camera, config)
}

fn locate_by_features(
    page: &NftPage,
    features: &FeatureSet,
    frame: &ImageBuffer,
    camera: &CameraParams,
    config: &NftConfig,
) -> Option<PageFit> {
    if features.is_empty() || page.index.is_empty() {
        return None;
    }
    let matches = match_features(&features.descriptors, &page.index, &config.matching);
    if matches.len() < config.ransac.min_inliers {
        trace!(page_id = page.marker.page_id, matches = matches.len(), "too few matches");
        return None;
    }

    let ds = &page.dataset;
    let center = [ds.width() as f32 * 0.5, ds.height() as f32 * 0.5];
    let extent = frame.width.max(frame.height) as f32;
    let kept = consistent_matches(
        &matches,
        &features.keypoints,
        &ds.keypoints,
        center,
        extent,
        &config.hough,
    );
    if kept.len() < config.ransac.min_inliers {
        trace!(page_id = page.marker.page_id, votes = kept.len(), "no consistent similarity");
        return None;
    }

    let (src, dst): (Vec<[f64; 2]>, Vec<[f64; 2]>) = kept
        .iter()
        .map(|&i| {
            let r = &ds.keypoints[matches[i].reference];
            let q = &features.keypoints[matches[i].query];
            ([r.x as f64, r.y as f64], [q.x as f64, q.y as f64])
        })
        .unzip();
    let fit = fit_homography_ransac(&src, &dst, &config.ransac)?;
    solve_page_pose(ds, camera, &src, &dst, fit, config, NftSource::Features)
}

fn locate_by_templates(
    page: &NftPage,
    previous: &Matrix3<f64>,
    frame: &ImageBuffer,
    camera: &CameraParams,
    config: &NftConfig,
) -> Option<PageFit> {
    let found = track_templates(frame, &page.dataset, previous, &config.template);
    if found.len() < config.ransac.min_inliers {
        trace!(page_id = page.marker.page_id, templates = found.len(), "template search failed");
        return None;
    }
    let (src, dst): (Vec<[f64; 2]>, Vec<[f64; 2]>) =
        found.iter().map(|m| (m.reference, m.frame)).unzip();
    let fit = fit_homography_ransac(&src, &dst, &config.ransac)?;
    solve_page_pose(&page.dataset, camera, &src, &dst, fit, config, NftSource::Templates)
}

/// Metric pose from the RANSAC inliers.
fn solve_page_pose(
    dataset: &NftDataset,
    camera: &CameraParams,
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    fit: RansacResult,
    config: &NftConfig,
    source: NftSource,
) -> Option<PageFit> {
    let mm = MM_PER_INCH / dataset.dpi() as f64;
    let height = dataset.height() as f64;
    let (model, observed): (Vec<[f64; 2]>, Vec<[f64; 2]>) = (0..src.len())
        .filter(|&i| fit.inlier_mask[i])
        .take(config.max_pose_points.max(4))
        .map(|i| ([src[i][0] * mm, (height - src[i][1]) * mm], dst[i]))
        .unzip();
    let (trans, error) = solve_planar(camera, &model, &observed)?;
    Some(PageFit {
        h: fit.h,
        trans,
        error,
        inliers: fit.n_inliers,
        source,
    })
}

fn reduce_homography(h: &Matrix3<f64>) -> [f32; 8] {
    let s = if h[(2, 2)].abs() > 1e-15 { h[(2, 2)] } else { 1.0 };
    let mut out = [0f32; 8];
    for (i, v) in out.iter_mut().enumerate() {
        *v = (h[(i / 3, i % 3)] / s) as f32;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduced_homography_drops_last_entry() {
        let h = Matrix3::new(2.0, 0.0, 10.0, 0.0, 2.0, 20.0, 0.0, 0.0, 2.0);
        assert_eq!(reduce_homography(&h), [1.0, 0.0, 5.0, 0.0, 1.0, 10.0, 0.0, 0.0]);
    }

    #[test]
    fn pages_get_sequential_ids() {
        let luma: Vec<u8> = (0..64 * 64).map(|i| ((i * 37) % 251) as u8).collect();
        let ds = NftDataset::generate(&luma, 64, 64, 72.0, &Default::default()).unwrap();
        let mut tracker = NftTracker::new();
        let config = NftConfig::default();
        assert_eq!(tracker.add_page(ds.clone(), &config), 0);
        assert_eq!(tracker.add_page(ds, &config), 1);
        assert_eq!(tracker.len(), 2);
        let m = tracker.marker(1).unwrap();
        assert_eq!(m.page_number, 1);
        assert!(!m.found);
        assert!(tracker.marker(5).is_none());
    }

    #[test]
    fn blank_frame_reports_nothing() {
        let luma: Vec<u8> = (0..96 * 96).map(|i| ((i * 31) % 253) as u8).collect();
        let ds = NftDataset::generate(&luma, 96, 96, 72.0, &Default::default()).unwrap();
        let mut tracker = NftTracker::new();
        let config = NftConfig::default();
        tracker.add_page(ds, &config);
        let blank = vec![128u8; 160 * 120];
        let frame = ImageBuffer {
            data: &blank,
            width: 160,
            height: 120,
        };
        let camera = CameraParams::from_intrinsics(160, 120, 150.0, 150.0, 80.0, 60.0);
        let mut diag = FrameDiagnostics::default();
        let updates = tracker.process(&frame, &camera, &config, Duration::ZERO, &mut diag);
        assert!(updates.is_empty());
        assert_eq!(diag.feature_overflow, 0);
        assert_eq!(tracker.marker(0).unwrap().state, NftTrackState::Unseen);
    }
}
