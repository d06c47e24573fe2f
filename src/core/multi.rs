// src/core/multi.rs

//! Multi-marker sets: square markers with fixed offsets in a shared frame.
//!
//! Config layout, one item per line, `#` comments and blank lines skipped:
//!
//! ```text
//! 2
//! patt.hiro          # pattern file name, or a decimal matrix-code id
//! 80.0               # marker width
//! 1 0 0 0            # three rows of the 3x4 offset
//! 0 1 0 0
//! 0 0 1 0
//! 5
//! 40.0
//! 1 0 0 100
//! 0 1 0 0
//! 0 0 1 0
//! ```
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::history::{SquareHistory, SquareMarkerId};
use crate::core::matrix_code::MatrixCodeType;
use crate::core::pattern::{Pattern, PatternSet};
use crate::pose::TransMat;
use crate::{ArError, Result};

/// How a set pose is derived from its visible sub-markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MultiPosePolicy {
    /// The first visible sub-marker, in config order, fixes the pose.
    #[default]
    FirstVisible,
    /// Confidence-weighted blend of every visible sub-marker.
    ConfidenceWeighted,
}

/// One member of a set.
#[derive(Debug, Clone, PartialEq)]
pub struct SubMarker {
    pub id: SquareMarkerId,
    pub width: f64,
    /// Pose of the sub-marker in the set frame.
    pub offset: TransMat,
}

/// An ordered set of square markers with known relative geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiMarkerSet {
    pub markers: Vec<SubMarker>,
}

/// Consensus pose of a set for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatePose {
    pub trans: TransMat,
    /// Number of sub-markers seen this frame.
    pub visible: usize,
    /// Indices of the sub-markers that contributed.
    pub contributors: Vec<usize>,
}

enum SubRef {
    Pattern(String),
    Matrix(u32),
}

struct Lines<'a> {
    inner: std::iter::Enumerate<std::str::Lines<'a>>,
    last: usize,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            inner: text.lines().enumerate(),
            last: 0,
        }
    }

    /// Next meaningful line with its 1-based number.
    fn next_item(&mut self, what: &str) -> Result<(usize, &'a str)> {
        for (i, raw) in self.inner.by_ref() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if !line.is_empty() {
                self.last = i + 1;
                return Ok((i + 1, line));
            }
        }
        Err(ArError::MalformedMultiMarker {
            line: self.last + 1,
            reason: format!("unexpected end of file, expected {what}"),
        })
    }

    fn numbers(&mut self, what: &str, count: usize) -> Result<Vec<f64>> {
        let (line, text) = self.next_item(what)?;
        let values: Vec<f64> = text
            .split_ascii_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| ArError::MalformedMultiMarker {
                line,
                reason: format!("{what}: {e}"),
            })?;
        if values.len() != count || values.iter().any(|v| !v.is_finite()) {
            return Err(ArError::MalformedMultiMarker {
                line,
                reason: format!("{what}: expected {count} finite numbers, got {}", values.len()),
            });
        }
        Ok(values)
    }
}

fn lookup<'a>(files: &[(&str, &'a [u8])], name: &str) -> Option<&'a [u8]> {
    let base = |s: &str| s.rsplit(['/', '\\']).next().unwrap_or(s).to_owned();
    files
        .iter()
        .find(|(n, _)| *n == name)
        .or_else(|| files.iter().find(|(n, _)| base(*n) == base(name)))
        .map(|(_, bytes)| *bytes)
}

impl MultiMarkerSet {
    /// Parses a set definition and registers its patterns.
    ///
    /// Pattern files referenced by name are looked up in `pattern_files`
    /// (exact name first, then file name without directories). Matrix ids
    /// must exist in `code_type`. Everything is checked before anything is
    /// added to `patterns`.
    pub fn parse(
        text: &str,
        pattern_files: &[(&str, &[u8])],
        code_type: MatrixCodeType,
        patterns: &mut PatternSet,
    ) -> Result<MultiMarkerSet> {
        let mut lines = Lines::new(text);
        let (line, count_text) = lines.next_item("sub-marker count")?;
        let count: usize = count_text
            .parse()
            .ok()
            .filter(|&c| c > 0)
            .ok_or_else(|| ArError::MalformedMultiMarker {
                line,
                reason: format!("invalid sub-marker count '{count_text}'"),
            })?;

        let mut parsed: Vec<(SubRef, f64, TransMat)> = Vec::with_capacity(count);
        let mut loaded: Vec<(String, Pattern)> = Vec::new();
        for _ in 0..count {
            let (line, reference) = lines.next_item("pattern reference")?;
            let sub = match reference.parse::<u32>() {
                Ok(id) if id >= code_type.id_count() => {
                    return Err(ArError::IndexOutOfRange {
                        kind: "matrix code",
                        index: id as usize,
                        count: code_type.id_count() as usize,
                    });
                }
                Ok(id) => SubRef::Matrix(id),
                Err(_) => {
                    let bytes = lookup(pattern_files, reference).ok_or_else(|| {
                        ArError::MalformedMultiMarker {
                            line,
                            reason: format!("pattern file '{reference}' not supplied"),
                        }
                    })?;
                    if !loaded.iter().any(|(n, _)| n == reference) {
                        let pattern = Pattern::parse(bytes).map_err(|e| ArError::MalformedMultiMarker {
                            line,
                            reason: e.to_string(),
                        })?;
                        loaded.push((reference.to_owned(), pattern));
                    }
                    SubRef::Pattern(reference.to_owned())
                }
            };

            let width = lines.numbers("marker width", 1)?[0];
            if width <= 0.0 {
                return Err(ArError::MalformedMultiMarker {
                    line: lines.last,
                    reason: format!("marker width must be positive, got {width}"),
                });
            }
            let mut rows = [[0.0; 4]; 3];
            for row in rows.iter_mut() {
                let values = lines.numbers("transform row", 4)?;
                row.copy_from_slice(&values);
            }
            parsed.push((sub, width, TransMat(rows)));
        }
        if let Ok((line, extra)) = lines.next_item("") {
            return Err(ArError::MalformedMultiMarker {
                line,
                reason: format!("trailing content '{extra}'"),
            });
        }

        // Commit.
        let before = patterns.len();
        let ids: Vec<(String, u32)> = loaded
            .into_iter()
            .map(|(name, pattern)| (name, patterns.add(pattern)))
            .collect();
        let markers = parsed
            .into_iter()
            .map(|(sub, width, offset)| {
                let id = match sub {
                    SubRef::Matrix(id) => SquareMarkerId::Matrix(id),
                    SubRef::Pattern(name) => SquareMarkerId::Pattern(
                        ids.iter()
                            .find(|(n, _)| *n == name)
                            .map(|(_, id)| *id)
                            .unwrap_or_default(),
                    ),
                };
                SubMarker { id, width, offset }
            })
            .collect::<Vec<_>>();

        tracing::info!(
            sub_markers = markers.len(),
            new_patterns = patterns.len() - before,
            "multi-marker set loaded"
        );
        Ok(MultiMarkerSet { markers })
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Pose of the set frame this frame, `None` when no sub-marker is
    /// visible.
    pub fn compute_pose(
        &self,
        history: &SquareHistory,
        policy: MultiPosePolicy,
    ) -> Option<AggregatePose> {
        let visible: Vec<(usize, TransMat, f32)> = self
            .markers
            .iter()
            .enumerate()
            .filter_map(|(i, sub)| {
                let rec = history.get(sub.id).filter(|r| r.seen_this_frame)?;
                Some((i, rec.trans.compose(&sub.offset.inverse()), rec.confidence))
            })
            .collect();
        let (first_idx, first, _) = visible.first().copied()?;

        match policy {
            MultiPosePolicy::FirstVisible => Some(AggregatePose {
                trans: first,
                visible: visible.len(),
                contributors: vec![first_idx],
            }),
            MultiPosePolicy::ConfidenceWeighted => {
                let reference = first.to_quaternion();
                let mut total = 0.0;
                let mut t = Vector3::zeros();
                let mut q = nalgebra::Vector4::zeros();
                for (_, pose, conf) in &visible {
                    let w = (*conf as f64).max(1e-6);
                    let mut qi = pose.to_quaternion().into_inner();
                    if qi.coords.dot(&reference.coords) < 0.0 {
                        qi = -qi;
                    }
                    q += qi.coords * w;
                    t += pose.translation() * w;
                    total += w;
                }
                let rotation = UnitQuaternion::from_quaternion(Quaternion::from(q / total));
                Some(AggregatePose {
                    trans: TransMat::from_parts(
                        &rotation.to_rotation_matrix().into_inner(),
                        &(t / total),
                    ),
                    visible: visible.len(),
                    contributors: visible.iter().map(|(i, _, _)| *i).collect(),
                })
            }
        }
    }
}
