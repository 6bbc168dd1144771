//! Tip-quality scoring from a tip-shaping imprint.
//!
//! A light tip-shaping pulse leaves a small mark on clean metal whose outline
//! mirrors the tip apex. The assessor finds the outline around the expected
//! location and scores it:
//!
//! 1. Sobel gradient magnitude of the lightly smoothed imprint
//! 2. Edge mask: gradient above a fraction of its maximum
//! 3. Holes enclosed by edges are filled, so each mark becomes one region
//! 4. The region containing the expected location is traced (Moore neighbor)
//! 5. `size` is the traced polygon's area in nm², `symmetry` its circularity
//!    `4π·area / perimeter²`

use crate::drift::PixelSize;
use crate::filters::{gaussian_blur, gradient_magnitude};
use ndarray::Array2;
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::frame::Point;
use scanbot_core::hooks::TipQuality;
use std::collections::VecDeque;
use std::f64::consts::PI;
use tracing::debug;

/// Assessor tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssessorConfig {
    /// Edge threshold as a fraction of the maximum gradient
    pub edge_threshold: f64,
    /// Smoothing before the gradient (pixels)
    pub smoothing_sigma: f64,
}

impl Default for AssessorConfig {
    fn default() -> Self {
        Self {
            edge_threshold: 0.3,
            smoothing_sigma: 1.0,
        }
    }
}

/// Area, perimeter and circularity of a traced region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeMetrics {
    /// Enclosed area (m²)
    pub area: f64,
    /// Outline length (m)
    pub perimeter: f64,
    /// `4π·area / perimeter²`, in [0, 1]
    pub symmetry: f64,
}

// Clockwise (on screen) starting west, as (row, column) steps.
const DIRECTIONS: [(isize, isize); 8] = [
    (0, -1),
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
    (1, 0),
    (1, -1),
];

/// Score the imprint around `expected`.
///
/// `expected` is relative to the frame center in the unrotated frame (m).
/// Returns [`ScanbotError::ContourNotFound`] when no outline encloses it.
pub fn assess_imprint(
    imprint: &Array2<f64>,
    pixel_size: PixelSize,
    expected: Point,
    config: &AssessorConfig,
) -> ScanbotResult<TipQuality> {
    if imprint.iter().any(|v| !v.is_finite()) {
        return Err(ScanbotError::InvalidParameter(
            "imprint image contains unscanned lines".into(),
        ));
    }
    let (rows, cols) = imprint.dim();
    if rows < 3 || cols < 3 {
        return Err(ScanbotError::ContourNotFound);
    }

    let gradient = gradient_magnitude(&gaussian_blur(imprint, config.smoothing_sigma));
    let max = gradient.iter().cloned().fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return Err(ScanbotError::ContourNotFound);
    }
    let cutoff = config.edge_threshold * max;
    let edges = gradient.mapv(|g| g > cutoff);
    let regions = fill_holes(&edges);

    let col = (expected.x / pixel_size.x + cols as f64 / 2.0).floor();
    let row = (rows as f64 / 2.0 - expected.y / pixel_size.y).floor();
    if col < 0.0 || row < 0.0 || col >= cols as f64 || row >= rows as f64 {
        return Err(ScanbotError::ContourNotFound);
    }
    let seed = (row as usize, col as usize);

    let metrics = measure_region(&regions, seed, pixel_size).ok_or(ScanbotError::ContourNotFound)?;
    let quality = TipQuality {
        symmetry: metrics.symmetry,
        size: metrics.area * 1e18,
    };
    debug!(
        symmetry = quality.symmetry,
        size_nm2 = quality.size,
        perimeter_nm = metrics.perimeter * 1e9,
        "Imprint assessed"
    );
    Ok(quality)
}

/// Like [`assess_imprint`], reporting a missing contour as the negative size sentinel.
pub fn assess_or_sentinel(
    imprint: &Array2<f64>,
    pixel_size: PixelSize,
    expected: Point,
    config: &AssessorConfig,
) -> ScanbotResult<TipQuality> {
    match assess_imprint(imprint, pixel_size, expected, config) {
        Err(ScanbotError::ContourNotFound) => Ok(TipQuality::NOT_FOUND),
        other => other,
    }
}

/// Mark every pixel not reachable from the border through non-edge pixels.
pub fn fill_holes(edges: &Array2<bool>) -> Array2<bool> {
    let (rows, cols) = edges.dim();
    let mut outside = Array2::from_elem((rows, cols), false);
    let mut queue = VecDeque::new();

    for r in 0..rows {
        for c in 0..cols {
            let border = r == 0 || c == 0 || r + 1 == rows || c + 1 == cols;
            if border && !edges[[r, c]] {
                outside[[r, c]] = true;
                queue.push_back((r, c));
            }
        }
    }
    while let Some((r, c)) = queue.pop_front() {
        for (dr, dc) in [(-1isize, 0isize), (1, 0), (0, -1), (0, 1)] {
            let (nr, nc) = (r as isize + dr, c as isize + dc);
            if nr < 0 || nc < 0 || nr >= rows as isize || nc >= cols as isize {
                continue;
            }
            let (nr, nc) = (nr as usize, nc as usize);
            if !edges[[nr, nc]] && !outside[[nr, nc]] {
                outside[[nr, nc]] = true;
                queue.push_back((nr, nc));
            }
        }
    }
    outside.mapv(|o| !o)
}

/// Trace the 8-connected region of `mask` containing `seed` and measure it.
///
/// Returns `None` when `seed` is not part of the mask.
pub fn measure_region(
    mask: &Array2<bool>,
    seed: (usize, usize),
    pixel_size: PixelSize,
) -> Option<ShapeMetrics> {
    let region = connected_region(mask, seed)?;
    let contour = trace_outline(&region);

    let points: Vec<(f64, f64)> = contour
        .iter()
        .map(|&(r, c)| (c as f64 * pixel_size.x, -(r as f64) * pixel_size.y))
        .collect();

    let n = points.len();
    let mut twice_area = 0.0;
    let mut perimeter = 0.0;
    for i in 0..n {
        let (x0, y0) = points[i];
        let (x1, y1) = points[(i + 1) % n];
        twice_area += x0 * y1 - x1 * y0;
        perimeter += ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();
    }
    let area = twice_area.abs() / 2.0;
    let symmetry = if perimeter > 0.0 {
        (4.0 * PI * area / (perimeter * perimeter)).clamp(0.0, 1.0)
    } else {
        0.0
    };

    Some(ShapeMetrics {
        area,
        perimeter,
        symmetry,
    })
}

fn connected_region(mask: &Array2<bool>, seed: (usize, usize)) -> Option<Array2<bool>> {
    let (rows, cols) = mask.dim();
    if seed.0 >= rows || seed.1 >= cols || !mask[seed] {
        return None;
    }
    let mut region = Array2::from_elem((rows, cols), false);
    let mut queue = VecDeque::from([seed]);
    region[seed] = true;

    while let Some((r, c)) = queue.pop_front() {
        for (dr, dc) in DIRECTIONS {
            let (nr, nc) = (r as isize + dr, c as isize + dc);
            if nr < 0 || nc < 0 || nr >= rows as isize || nc >= cols as isize {
                continue;
            }
            let next = (nr as usize, nc as usize);
            if mask[next] && !region[next] {
                region[next] = true;
                queue.push_back(next);
            }
        }
    }
    Some(region)
}

/// Moore-neighbor tracing of the outer outline, as (row, column) pixels.
fn trace_outline(region: &Array2<bool>) -> Vec<(usize, usize)> {
    let (rows, cols) = region.dim();
    let inside = |r: isize, c: isize| {
        r >= 0 && c >= 0 && r < rows as isize && c < cols as isize && region[[r as usize, c as usize]]
    };

    let Some(start) = region
        .indexed_iter()
        .find(|(_, &v)| v)
        .map(|((r, c), _)| (r as isize, c as isize))
    else {
        return Vec::new();
    };

    let pixel_count = region.iter().filter(|v| **v).count();
    let mut contour = vec![start];
    let mut current = start;
    let mut backtrack = (start.0, start.1 - 1);

    for _ in 0..(4 * pixel_count + 8) {
        let from = (backtrack.0 - current.0, backtrack.1 - current.1);
        let Some(d) = DIRECTIONS.iter().position(|&dir| dir == from) else {
            break;
        };

        let mut step = None;
        for i in 1..=8 {
            let k = (d + i) % 8;
            let candidate = (current.0 + DIRECTIONS[k].0, current.1 + DIRECTIONS[k].1);
            if inside(candidate.0, candidate.1) {
                let prev = DIRECTIONS[(k + 7) % 8];
                step = Some((candidate, (current.0 + prev.0, current.1 + prev.1)));
                break;
            }
        }
        let Some((next, next_backtrack)) = step else {
            break; // isolated pixel
        };
        if current == start && contour.len() > 1 && next == contour[1] {
            break;
        }
        current = next;
        backtrack = next_backtrack;
        contour.push(current);
    }

    if contour.len() > 1 && contour.last() == Some(&start) {
        contour.pop();
    }
    contour
        .into_iter()
        .map(|(r, c)| (r as usize, c as usize))
        .collect()
}
