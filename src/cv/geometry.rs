// src/cv/geometry.rs

use crate::{Point2f, Point2i};

/// Douglas-Peucker simplification of a closed contour.
///
/// The chain is split at two mutually distant points first so the result
/// does not depend on where the tracer started.
///
/// # Returns
/// Indices into `contour` of the kept vertices, in contour order.
pub fn approx_poly_dp(contour: &[Point2i], epsilon: f64) -> Vec<usize> {
    let len = contour.len();
    if len < 3 {
        return (0..len).collect();
    }

    let farthest = |from: usize| -> usize {
        let p = contour[from];
        let mut best = from;
        let mut best_d = -1i64;
        for (i, q) in contour.iter().enumerate() {
            let dx = (q.x - p.x) as i64;
            let dy = (q.y - p.y) as i64;
            let d = dx * dx + dy * dy;
            if d > best_d {
                best_d = d;
                best = i;
            }
        }
        best
    };

    let a = farthest(0);
    let b = farthest(a);
    if a == b {
        return vec![a];
    }
    let b_unwrapped = if b > a { b } else { b + len };

    let epsilon_sq = epsilon * epsilon;
    let mut kept = Vec::new();
    // (start, end) in unwrapped indices; left half is popped first.
    let mut stack = vec![(b_unwrapped, a + len), (a, b_unwrapped)];

    while let Some((start, end)) = stack.pop() {
        let sp = contour[start % len];
        let ep = contour[end % len];
        let dx = (ep.x - sp.x) as f64;
        let dy = (ep.y - sp.y) as f64;
        let seg_sq = dx * dx + dy * dy;

        let mut max_dist = 0.0;
        let mut split = start;
        for i in (start + 1)..end {
            let pt = contour[i % len];
            let dist = if seg_sq == 0.0 {
                let ex = (pt.x - sp.x) as f64;
                let ey = (pt.y - sp.y) as f64;
                (ex * ex + ey * ey).sqrt()
            } else {
                (((pt.y - sp.y) as f64) * dx - ((pt.x - sp.x) as f64) * dy).abs()
            };
            if dist > max_dist {
                max_dist = dist;
                split = i;
            }
        }

        let within = if seg_sq == 0.0 {
            max_dist * max_dist <= epsilon_sq
        } else {
            max_dist * max_dist <= epsilon_sq * seg_sq
        };

        if end <= start + 1 || within {
            kept.push(start % len);
        } else {
            stack.push((split, end));
            stack.push((start, split));
        }
    }

    kept
}

/// Calculates the perimeter of a closed polygon.
pub fn perimeter(poly: &[Point2i]) -> f64 {
    let len = poly.len();
    if len == 0 {
        return 0.0;
    }

    let mut p = 0.0;
    let mut j = len - 1;
    for i in 0..len {
        let dx = (poly[i].x - poly[j].x) as f64;
        let dy = (poly[i].y - poly[j].y) as f64;
        p += (dx * dx + dy * dy).sqrt();
        j = i;
    }
    p
}

/// Length of the shortest edge of a closed polygon.
pub fn min_edge_length(poly: &[Point2i]) -> f64 {
    let len = poly.len();
    if len <= 1 {
        return 0.0;
    }

    let mut min_d = f64::INFINITY;
    let mut j = len - 1;
    for i in 0..len {
        let dx = (poly[i].x - poly[j].x) as f64;
        let dy = (poly[i].y - poly[j].y) as f64;
        min_d = min_d.min(dx * dx + dy * dy);
        j = i;
    }
    min_d.sqrt()
}

/// Tests whether a closed polygon turns consistently in one direction.
pub fn is_contour_convex(contour: &[Point2i]) -> bool {
    let len = contour.len();
    if len < 3 {
        return false;
    }

    let mut orientation = 0;
    for i in 0..len {
        let p0 = contour[i];
        let p1 = contour[(i + 1) % len];
        let p2 = contour[(i + 2) % len];

        // i64 prevents cross-product overflow on large coordinates
        let cross = (p1.x - p0.x) as i64 * (p2.y - p1.y) as i64
            - (p1.y - p0.y) as i64 * (p2.x - p1.x) as i64;

        orientation |= match cross.signum() {
            1 => 1,
            -1 => 2,
            _ => 0,
        };
        if orientation == 3 {
            return false;
        }
    }
    orientation != 0
}

/// Signed shoelace area; positive for clockwise polygons in image
/// coordinates (y down).
pub fn polygon_area(poly: &[Point2f]) -> f32 {
    let n = poly.len();
    let mut acc = 0.0f64;
    for i in 0..n {
        let a = poly[i];
        let b = poly[(i + 1) % n];
        acc += (a.x as f64) * (b.y as f64) - (b.x as f64) * (a.y as f64);
    }
    (acc * 0.5) as f32
}

/// Centroid of the corner points.
pub fn quad_center(quad: &[Point2f; 4]) -> Point2f {
    (quad[0] + quad[1] + quad[2] + quad[3]) / 4.0
}

/// Line in implicit form `a*x + b*y + c = 0` with `a^2 + b^2 = 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

/// Total least-squares line through a point set.
///
/// Returns `None` for fewer than two points or a degenerate spread.
pub fn fit_line(points: &[Point2i]) -> Option<Line> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let (mut mx, mut my) = (0.0, 0.0);
    for p in points {
        mx += p.x as f64;
        my += p.y as f64;
    }
    mx /= n;
    my /= n;

    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for p in points {
        let dx = p.x as f64 - mx;
        let dy = p.y as f64 - my;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    if sxx + syy <= f64::EPSILON {
        return None;
    }

    // Principal axis angle of the 2x2 scatter matrix.
    let theta = 0.5 * (2.0 * sxy).atan2(sxx - syy);
    let (dir_y, dir_x) = theta.sin_cos();
    let a = -dir_y;
    let b = dir_x;
    Some(Line {
        a,
        b,
        c: -(a * mx + b * my),
    })
}

/// Intersection of two lines, `None` when (nearly) parallel.
pub fn intersect_lines(l1: &Line, l2: &Line) -> Option<Point2f> {
    let det = l1.a * l2.b - l2.a * l1.b;
    if det.abs() < 1e-9 {
        return None;
    }
    let x = (l1.b * l2.c - l2.b * l1.c) / det;
    let y = (l2.a * l1.c - l1.a * l2.c) / det;
    Some(Point2f::new(x as f32, y as f32))
}

/// Homography mapping the unit square onto `src`.
///
/// (0,0) -> `src[0]`, (1,0) -> `src[1]`, (1,1) -> `src[2]`, (0,1) -> `src[3]`;
/// row-major `[a b c; d e f; g h 1]`.
pub fn square2quad(src: &[Point2f; 4]) -> [f64; 9] {
    let mut sq = [0.0; 9];
    let px = (src[0].x - src[1].x + src[2].x - src[3].x) as f64;
    let py = (src[0].y - src[1].y + src[2].y - src[3].y) as f64;

    if px == 0.0 && py == 0.0 {
        sq[0] = (src[1].x - src[0].x) as f64;
        sq[1] = (src[2].x - src[1].x) as f64;
        sq[2] = src[0].x as f64;
        sq[3] = (src[1].y - src[0].y) as f64;
        sq[4] = (src[2].y - src[1].y) as f64;
        sq[5] = src[0].y as f64;
        sq[6] = 0.0;
        sq[7] = 0.0;
        sq[8] = 1.0;
    } else {
        let dx1 = (src[1].x - src[2].x) as f64;
        let dx2 = (src[3].x - src[2].x) as f64;
        let dy1 = (src[1].y - src[2].y) as f64;
        let dy2 = (src[3].y - src[2].y) as f64;
        let den = dx1 * dy2 - dx2 * dy1;

        sq[6] = (px * dy2 - dx2 * py) / den;
        sq[7] = (dx1 * py - px * dy1) / den;
        sq[8] = 1.0;
        sq[0] = (src[1].x - src[0].x) as f64 + sq[6] * (src[1].x as f64);
        sq[1] = (src[3].x - src[0].x) as f64 + sq[7] * (src[3].x as f64);
        sq[2] = src[0].x as f64;
        sq[3] = (src[1].y - src[0].y) as f64 + sq[6] * (src[1].y as f64);
        sq[4] = (src[3].y - src[0].y) as f64 + sq[7] * (src[3].y as f64);
        sq[5] = src[0].y as f64;
    }
    sq
}

/// Applies a row-major 3x3 homography to `(u, v)`.
#[inline]
pub fn map_point(h: &[f64; 9], u: f64, v: f64) -> (f64, f64) {
    let w = h[6] * u + h[7] * v + h[8];
    ((h[0] * u + h[1] * v + h[2]) / w, (h[3] * u + h[4] * v + h[5]) / w)
}

/// The centered sub-square covering `ratio` of a quad's side, mapped
/// through the quad's perspective.
pub fn inner_quad(quad: &[Point2f; 4], ratio: f64) -> [Point2f; 4] {
    let h = square2quad(quad);
    let a = (1.0 - ratio) * 0.5;
    let b = 1.0 - a;
    let at = |u: f64, v: f64| {
        let (x, y) = map_point(&h, u, v);
        Point2f::new(x as f32, y as f32)
    };
    [at(a, a), at(b, a), at(b, b), at(a, b)]
}
