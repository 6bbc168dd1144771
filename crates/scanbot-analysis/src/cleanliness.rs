//! Surface cleanliness checks used before tip shaping.
//!
//! A surface is judged on its high-pass residual (image minus a wide Gaussian
//! background). Three tiers of roughness are counted as areas and compared
//! against an allowance that grows with the frame size:
//!
//! | residual        | allowed area        |
//! |-----------------|---------------------|
//! | `> threshold`   | `allowance`         |
//! | `> 2 threshold` | `allowance / 2`     |
//! | `> 3 threshold` | `allowance / 5`     |
//!
//! Unscanned (non-finite) lines are ignored, so partial images can be judged
//! while the scan is still running.

use crate::filters::{complete_rows, gaussian_blur, highpass};
use ndarray::Array2;
use scanbot_core::frame::Point;
use tracing::debug;

/// Background width removed before judging roughness (pixels).
const BACKGROUND_SIGMA: f64 = 20.0;

/// Local-variance window for [`clean_coordinate`] (pixels).
const FLATNESS_SIGMA: f64 = 2.0;

/// Default roughness threshold (m).
pub const DEFAULT_THRESHOLD: f64 = 0.3e-9;

/// Roughness judge parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleanlinessCriteria {
    /// Residual height counted as unclean (m)
    pub threshold: f64,
    /// Larger is less tolerant
    pub sensitivity: f64,
}

impl Default for CleanlinessCriteria {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            sensitivity: 1.0,
        }
    }
}

impl CleanlinessCriteria {
    /// Unclean area tolerated in a frame `frame_size` metres wide (m²).
    pub fn allowance(&self, frame_size: f64) -> f64 {
        (1e9 * frame_size / 10.0) * self.threshold.powi(2) / self.sensitivity.max(f64::EPSILON)
    }
}

/// Whether `image` of a `frame_size`-wide frame is clean.
///
/// Images with fewer than three complete lines are reported clean; there is
/// nothing to judge yet.
pub fn is_clean(image: &Array2<f64>, frame_size: f64, criteria: &CleanlinessCriteria) -> bool {
    let valid = complete_rows(image);
    if valid.nrows() < 3 || image.nrows() == 0 {
        return true;
    }

    let pixel_area = (frame_size / image.nrows() as f64).powi(2);
    let allowance = criteria.allowance(frame_size);
    let residual = highpass(&valid, BACKGROUND_SIGMA);

    let area_over = |factor: f64| {
        let limit = factor * criteria.threshold;
        residual.iter().filter(|v| v.abs() > limit).count() as f64 * pixel_area
    };
    let (unclean, unscannable, extreme) = (area_over(1.0), area_over(2.0), area_over(3.0));

    let clean = unclean <= allowance && unscannable <= allowance / 2.0 && extreme <= allowance / 5.0;
    debug!(unclean, unscannable, extreme, allowance, clean, "Cleanliness assessed");
    clean
}

/// Flattest interior spot of `image`, relative to the frame center (m).
///
/// Falls back to the center for images too small to have an interior.
pub fn clean_coordinate(image: &Array2<f64>, frame_size: f64) -> Point {
    let (rows, cols) = image.dim();
    if rows < 5 || cols < 5 || image.iter().any(|v| !v.is_finite()) {
        return Point::default();
    }

    let mean = gaussian_blur(image, FLATNESS_SIGMA);
    let mean_sq = gaussian_blur(&image.mapv(|v| v * v), FLATNESS_SIGMA);
    let margin_r = rows / 4;
    let margin_c = cols / 4;

    let mut best = (rows / 2, cols / 2);
    let mut best_var = f64::INFINITY;
    for r in margin_r..rows - margin_r {
        for c in margin_c..cols - margin_c {
            let var = mean_sq[[r, c]] - mean[[r, c]].powi(2);
            if var < best_var {
                best_var = var;
                best = (r, c);
            }
        }
    }

    let px = frame_size / cols as f64;
    let py = frame_size / rows as f64;
    // row 0 is the top of the frame
    Point::new(
        (best.1 as f64 + 0.5 - cols as f64 / 2.0) * px,
        (rows as f64 / 2.0 - best.0 as f64 - 0.5) * py,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: f64 = 10e-9;

    fn terraced(step: f64) -> Array2<f64> {
        Array2::from_shape_fn((64, 64), |(r, c)| {
            let slope = 1e-12 * c as f64;
            let island = ((r as f64 - 32.0).powi(2) + (c as f64 - 32.0).powi(2)) < 100.0;
            slope + if island { step } else { 0.0 }
        })
    }

    #[test]
    fn test_flat_surface_is_clean() {
        assert!(is_clean(&terraced(0.0), FRAME, &CleanlinessCriteria::default()));
    }

    #[test]
    fn test_tall_cluster_is_unclean() {
        assert!(!is_clean(&terraced(2e-9), FRAME, &CleanlinessCriteria::default()));
    }

    #[test]
    fn test_partial_scan_ignores_unscanned_lines() {
        let mut image = terraced(0.0);
        for r in 40..64 {
            image.row_mut(r).fill(f64::NAN);
        }
        assert!(is_clean(&image, FRAME, &CleanlinessCriteria::default()));
    }

    #[test]
    fn test_almost_empty_scan_is_clean() {
        let image = Array2::from_elem((32, 32), f64::NAN);
        assert!(is_clean(&image, FRAME, &CleanlinessCriteria::default()));
    }

    #[test]
    fn test_sensitivity_shrinks_allowance() {
        let loose = CleanlinessCriteria::default();
        let strict = CleanlinessCriteria {
            sensitivity: 4.0,
            ..loose
        };
        assert!(strict.allowance(FRAME) < loose.allowance(FRAME));
    }

    #[test]
    fn test_clean_coordinate_avoids_rough_corner() {
        let image = Array2::from_shape_fn((32, 32), |(r, c)| {
            if r < 16 && c < 16 {
                if (r + c) % 2 == 0 {
                    1e-9
                } else {
                    -1e-9
                }
            } else {
                0.0
            }
        });
        let spot = clean_coordinate(&image, FRAME);
        // anywhere outside the top-left quadrant
        assert!(spot.x >= 0.0 || spot.y <= 0.0, "{spot:?}");
        assert!(spot.x.abs() <= FRAME / 2.0 && spot.y.abs() <= FRAME / 2.0);
    }

    #[test]
    fn test_clean_coordinate_small_image_is_center() {
        let image = Array2::zeros((3, 3));
        assert_eq!(clean_coordinate(&image, FRAME), Point::default());
    }
}
