// src/core/pattern.rs

//! Template ("pattern") markers.
//!
//! A `.patt` file is whitespace separated integers: four orientations, each
//! holding three color planes (B, G, R) of `size` x `size` values. Stored
//! orientation `h` is the upright pattern turned `h` quarter turns
//! counter-clockwise.
use std::fmt::Write as _;

use crate::cv::geometry::{inner_quad, map_point, square2quad};
use crate::cv::scalar::sample_bilinear;
use crate::{ArError, ImageBuffer, MarkerCorners, Result};

/// Pattern side used when none can be inferred.
pub const AR_PATT_SIZE: usize = 16;
/// Sub-samples per pattern cell side.
const SUBSAMPLES: usize = 3;

/// Mean-removed, unit-length template vector.
#[derive(Debug, Clone)]
struct Template {
    values: Vec<f32>,
}

impl Template {
    fn from_raw(raw: &[f32]) -> Option<Self> {
        let mean = raw.iter().sum::<f32>() / raw.len() as f32;
        let mut values: Vec<f32> = raw.iter().map(|v| v - mean).collect();
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < 1e-3 {
            return None;
        }
        for v in values.iter_mut() {
            *v /= norm;
        }
        Some(Self { values })
    }

    fn correlate(&self, other: &Template) -> f32 {
        self.values
            .iter()
            .zip(&other.values)
            .map(|(a, b)| a * b)
            .sum()
    }
}

/// One loaded template marker with its four orientations.
#[derive(Debug, Clone)]
pub struct Pattern {
    size: usize,
    /// Interleaved RGB per orientation, `size * size * 3` values.
    raw_color: [Vec<u8>; 4],
    color: [Option<Template>; 4],
    mono: [Option<Template>; 4],
}

fn rotate_ccw(src: &[u8], size: usize, channels: usize) -> Vec<u8> {
    // dst[size - 1 - j][i] = src[i][j]
    let mut dst = vec![0u8; src.len()];
    for i in 0..size {
        for j in 0..size {
            for c in 0..channels {
                dst[((size - 1 - j) * size + i) * channels + c] = src[(i * size + j) * channels + c];
            }
        }
    }
    dst
}

impl Pattern {
    fn from_orientations(size: usize, raw_color: [Vec<u8>; 4]) -> Self {
        let color = std::array::from_fn(|h| {
            let v: Vec<f32> = raw_color[h].iter().map(|&x| x as f32).collect();
            Template::from_raw(&v)
        });
        let mono = std::array::from_fn(|h| {
            let v: Vec<f32> = raw_color[h]
                .chunks_exact(3)
                .map(|px| (px[0] as f32 + px[1] as f32 + px[2] as f32) / 3.0)
                .collect();
            Template::from_raw(&v)
        });
        Self {
            size,
            raw_color,
            color,
            mono,
        }
    }

    /// Parses `.patt` text.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ArError::MalformedPattern("not valid UTF-8 text".into()))?;
        let values = text
            .split_ascii_whitespace()
            .map(|tok| {
                tok.parse::<u8>()
                    .map_err(|_| ArError::MalformedPattern(format!("bad value {tok:?}")))
            })
            .collect::<Result<Vec<u8>>>()?;

        let cells = values.len() / 12;
        let size = (cells as f64).sqrt().round() as usize;
        if size < 4 || size * size * 12 != values.len() {
            return Err(ArError::MalformedPattern(format!(
                "{} values do not form 4 x 3 square planes",
                values.len()
            )));
        }

        let plane = size * size;
        let raw_color: [Vec<u8>; 4] = std::array::from_fn(|h| {
            let block = &values[h * plane * 3..(h + 1) * plane * 3];
            let mut rgb = vec![0u8; plane * 3];
            for i in 0..plane {
                // planes are B, G, R
                rgb[i * 3] = block[2 * plane + i];
                rgb[i * 3 + 1] = block[plane + i];
                rgb[i * 3 + 2] = block[i];
            }
            rgb
        });

        let pattern = Self::from_orientations(size, raw_color);
        if pattern.color.iter().all(Option::is_none) {
            return Err(ArError::MalformedPattern("pattern has no contrast".into()));
        }
        Ok(pattern)
    }

    /// Builds a pattern from an upright RGB image of exactly `size * size`
    /// pixels.
    pub fn from_rgb(rgb: &[u8], size: usize) -> Result<Self> {
        if size < 4 || rgb.len() != size * size * 3 {
            return Err(ArError::InvalidParameter(format!(
                "pattern image must be {size}x{size} RGB"
            )));
        }
        let r0 = rgb.to_vec();
        let r1 = rotate_ccw(&r0, size, 3);
        let r2 = rotate_ccw(&r1, size, 3);
        let r3 = rotate_ccw(&r2, size, 3);
        Ok(Self::from_orientations(size, [r0, r1, r2, r3]))
    }

    /// Writes the pattern back in `.patt` text form.
    pub fn to_patt_string(&self) -> String {
        let mut out = String::new();
        for h in 0..4 {
            for channel in [2usize, 1, 0] {
                for row in 0..self.size {
                    let line: Vec<String> = (0..self.size)
                        .map(|col| {
                            format!("{:3}", self.raw_color[h][(row * self.size + col) * 3 + channel])
                        })
                        .collect();
                    let _ = writeln!(out, "{}", line.join(" "));
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Best template match for a candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternMatch {
    pub id: u32,
    pub direction: usize,
    pub confidence: f32,
}

/// Source pixels for sampling a candidate.
pub enum PatternSource<'a> {
    /// Interleaved RGB, 3 bytes per pixel.
    Color { rgb: &'a [u8], width: u32, height: u32 },
    Mono(&'a ImageBuffer<'a>),
}

/// Samples a `size` x `size` patch of the candidate's inner region.
pub fn sample_patch(
    source: &PatternSource,
    quad: &MarkerCorners,
    patt_ratio: f64,
    size: usize,
) -> Vec<f32> {
    let h = square2quad(&inner_quad(quad, patt_ratio));
    let channels = match source {
        PatternSource::Color { .. } => 3,
        PatternSource::Mono(_) => 1,
    };
    let mut out = vec![0f32; size * size * channels];
    let sub = (size * SUBSAMPLES) as f64;
    for row in 0..size {
        for col in 0..size {
            for sy in 0..SUBSAMPLES {
                for sx in 0..SUBSAMPLES {
                    let u = ((col * SUBSAMPLES + sx) as f64 + 0.5) / sub;
                    let v = ((row * SUBSAMPLES + sy) as f64 + 0.5) / sub;
                    let (x, y) = map_point(&h, u, v);
                    for c in 0..channels {
                        let val = match source {
                            PatternSource::Color { rgb, width, height } => {
                                sample_bilinear(rgb, *width, *height, 3, c, x, y)
                            }
                            PatternSource::Mono(img) => {
                                sample_bilinear(img.data, img.width, img.height, 1, 0, x, y)
                            }
                        };
                        out[(row * size + col) * channels + c] += val as f32;
                    }
                }
            }
        }
    }
    let norm = (SUBSAMPLES * SUBSAMPLES) as f32;
    for v in out.iter_mut() {
        *v /= norm;
    }
    out
}

/// Registered template markers.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pattern and returns its id. A pattern identical to one
    /// already registered gets the existing id; two equal templates would
    /// tie on every candidate and never pass the margin test.
    pub fn add(&mut self, pattern: Pattern) -> u32 {
        if let Some(id) = self.find(&pattern) {
            tracing::debug!(id, "pattern already registered, reusing id");
            return id;
        }
        self.patterns.push(pattern);
        (self.patterns.len() - 1) as u32
    }

    /// Id of a registered pattern with the same size and content.
    pub fn find(&self, pattern: &Pattern) -> Option<u32> {
        self.patterns
            .iter()
            .position(|p| p.size == pattern.size && p.raw_color == pattern.raw_color)
            .map(|i| i as u32)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&Pattern> {
        self.patterns.get(id as usize)
    }

    /// Identifies a candidate against every pattern and orientation.
    ///
    /// Accepts when the best correlation reaches `min_confidence` and beats
    /// the best *other* pattern by at least `margin`.
    pub fn identify(
        &self,
        source: &PatternSource,
        quad: &MarkerCorners,
        patt_ratio: f64,
        min_confidence: f32,
        margin: f32,
    ) -> Option<PatternMatch> {
        let color = matches!(source, PatternSource::Color { .. });
        let mut scores: Vec<PatternMatch> = Vec::with_capacity(self.patterns.len());
        let mut sampled: Option<(usize, Option<Template>)> = None;

        for (id, pattern) in self.patterns.iter().enumerate() {
            if sampled.as_ref().map(|(s, _)| *s) != Some(pattern.size) {
                let patch = sample_patch(source, quad, patt_ratio, pattern.size);
                sampled = Some((pattern.size, Template::from_raw(&patch)));
            }
            // A flat sample correlates with nothing.
            let Some((_, Some(sample))) = sampled.as_ref() else {
                return None;
            };

            let templates = if color { &pattern.color } else { &pattern.mono };
            let pattern_best = templates
                .iter()
                .enumerate()
                .filter_map(|(h, t)| t.as_ref().map(|t| (h, t.correlate(sample))))
                .max_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((direction, confidence)) = pattern_best {
                scores.push(PatternMatch {
                    id: id as u32,
                    direction,
                    confidence,
                });
            }
        }

        scores.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let best = *scores.first()?;
        if best.confidence < min_confidence {
            tracing::trace!(confidence = best.confidence, "pattern below confidence");
            return None;
        }
        if let Some(runner_up) = scores.get(1).map(|m| m.confidence) {
            if best.confidence - runner_up >= margin {
                return Some(best);
            }
            tracing::trace!(
                best = best.confidence,
                runner_up,
                "pattern match ambiguous"
            );
            return None;
        }
        Some(best)
    }
}
