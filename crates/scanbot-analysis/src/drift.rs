//! Drift offset estimation by normalized cross-correlation.
//!
//! Both images are lightly smoothed and differentiated along the fast axis,
//! which removes the line-to-line offsets typical of STM topography. The
//! derivatives are normalized, mirror-extended (symmetric boundary) and
//! cross-correlated through a 2-D FFT. The correlation peak gives the pixel
//! displacement, which is scaled by the pixel size and rotated into
//! frame-relative coordinates.
//!
//! # Sign Convention
//!
//! The returned offset is the displacement of the sample frame relative to
//! the surface. Subtracting it from the frame center puts the frame back
//! over the reference area.

use crate::filters::{diff_columns, gaussian_blur, normalized, symmetric_index};
use ndarray::Array2;
use num_complex::Complex;
use rustfft::FftPlanner;
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::frame::Point;
use tracing::debug;

/// Pre-smoothing applied before differentiation (pixels).
const SMOOTHING_SIGMA: f64 = 0.5;

/// Physical size of one pixel (m).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelSize {
    /// Column spacing (m)
    pub x: f64,
    /// Row spacing (m)
    pub y: f64,
}

impl PixelSize {
    /// Pixel size of a `width` x `height` frame sampled at `pixels` x `lines`.
    pub fn of_frame(width: f64, height: f64, pixels: u32, lines: u32) -> Self {
        Self {
            x: width / f64::from(pixels.max(1)),
            y: height / f64::from(lines.max(1)),
        }
    }
}

/// Estimate the offset of `sample` relative to `reference`.
///
/// `rotation_deg` is the frame rotation; the pixel displacement is rotated by
/// its negative. Images without structure yield a zero offset.
pub fn estimate_offset(
    reference: &Array2<f64>,
    sample: &Array2<f64>,
    pixel_size: PixelSize,
    rotation_deg: f64,
) -> ScanbotResult<Point> {
    if reference.dim() != sample.dim() {
        return Err(ScanbotError::InvalidParameter(format!(
            "drift images differ in shape: {:?} vs {:?}",
            reference.dim(),
            sample.dim()
        )));
    }
    let (rows, cols) = reference.dim();
    if rows < 2 || cols < 3 {
        return Err(ScanbotError::InvalidParameter(format!(
            "drift images too small: {rows}x{cols}"
        )));
    }
    if reference.iter().chain(sample.iter()).any(|v| !v.is_finite()) {
        return Err(ScanbotError::InvalidParameter(
            "drift images contain unscanned lines".into(),
        ));
    }

    let prepare = |image: &Array2<f64>| normalized(&diff_columns(&gaussian_blur(image, SMOOTHING_SIGMA)));
    let (Some(a), Some(b)) = (prepare(reference), prepare(sample)) else {
        debug!("Drift images carry no structure, reporting zero offset");
        return Ok(Point::default());
    };

    let (lag_rows, lag_cols) = correlation_peak(&a, &b);
    let offset = Point::new(
        lag_cols as f64 * pixel_size.x,
        -(lag_rows as f64) * pixel_size.y,
    );
    let rotated = offset.rotated_about(Point::default(), -rotation_deg);
    debug!(
        lag_rows,
        lag_cols,
        dx = rotated.x,
        dy = rotated.y,
        "Drift offset estimated"
    );
    Ok(rotated)
}

/// Signed (row, column) lag maximizing `sum(a[n + k] * b[n])`.
fn correlation_peak(a: &Array2<f64>, b: &Array2<f64>) -> (isize, isize) {
    let (rows, cols) = a.dim();
    let (ext_rows, ext_cols) = (2 * rows, 2 * cols);

    let mut planner = FftPlanner::<f64>::new();
    let fa = fft2(&mirror_extend(a), &mut planner, false);
    let fb = fft2(&mirror_extend(b), &mut planner, false);

    let product = Array2::from_shape_fn((ext_rows, ext_cols), |idx| fa[idx] * fb[idx].conj());
    let correlation = fft2(&product, &mut planner, true);

    let mut best = (0usize, 0usize);
    let mut best_value = f64::NEG_INFINITY;
    // Lag zero is visited first so equal peaks resolve to "no shift".
    for r in 0..ext_rows {
        for c in 0..ext_cols {
            let value = correlation[[r, c]].re;
            if value > best_value {
                best_value = value;
                best = (r, c);
            }
        }
    }

    let signed = |i: usize, n: usize| -> isize {
        if i < n {
            i as isize
        } else {
            i as isize - 2 * n as isize
        }
    };
    (signed(best.0, rows), signed(best.1, cols))
}

fn mirror_extend(image: &Array2<f64>) -> Array2<Complex<f64>> {
    let (rows, cols) = image.dim();
    Array2::from_shape_fn((2 * rows, 2 * cols), |(r, c)| {
        let v = image[[
            symmetric_index(r as isize, rows),
            symmetric_index(c as isize, cols),
        ]];
        Complex::new(v, 0.0)
    })
}

fn fft2(
    input: &Array2<Complex<f64>>,
    planner: &mut FftPlanner<f64>,
    inverse: bool,
) -> Array2<Complex<f64>> {
    let (rows, cols) = input.dim();
    let row_fft = if inverse {
        planner.plan_fft_inverse(cols)
    } else {
        planner.plan_fft_forward(cols)
    };
    let col_fft = if inverse {
        planner.plan_fft_inverse(rows)
    } else {
        planner.plan_fft_forward(rows)
    };

    let mut out = input.clone();
    let mut buffer = vec![Complex::new(0.0, 0.0); cols.max(rows)];

    for r in 0..rows {
        let line = &mut buffer[..cols];
        for (c, slot) in line.iter_mut().enumerate() {
            *slot = out[[r, c]];
        }
        row_fft.process(line);
        for (c, value) in line.iter().enumerate() {
            out[[r, c]] = *value;
        }
    }
    for c in 0..cols {
        let line = &mut buffer[..rows];
        for (r, slot) in line.iter_mut().enumerate() {
            *slot = out[[r, c]];
        }
        col_fft.process(line);
        for (r, value) in line.iter().enumerate() {
            out[[r, c]] = *value;
        }
    }
    out
}

/// Drift reference retained for the lifetime of one run.
///
/// The first observed calibration image becomes the reference; every later
/// image is compared against it. Offsets are also accumulated so tracked
/// absolute positions (the tip in constant-height runs) can follow the frame.
#[derive(Debug, Clone, Default)]
pub struct DriftCorrector {
    reference: Option<Array2<f64>>,
    total: Point,
}

impl DriftCorrector {
    /// Corrector without a reference.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a reference image has been captured.
    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Offset of `image` relative to the reference; the first call stores it.
    pub fn observe(
        &mut self,
        image: &Array2<f64>,
        pixel_size: PixelSize,
        rotation_deg: f64,
    ) -> ScanbotResult<Point> {
        let reference = self.reference.get_or_insert_with(|| image.clone());
        let offset = estimate_offset(reference, image, pixel_size, rotation_deg)?;
        self.total = self.total + offset;
        Ok(offset)
    }

    /// Sum of all offsets reported so far.
    pub fn total(&self) -> Point {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PX: PixelSize = PixelSize { x: 1e-9, y: 1e-9 };

    /// Gaussian blobs at fixed surface positions, viewed through a frame
    /// whose center has moved by (`shift_x`, `shift_y`) pixels.
    fn surface(shift_x: f64, shift_y: f64) -> Array2<f64> {
        let blobs = [(20.0, 18.0, 3.0), (40.0, 30.0, 2.5), (28.0, 44.0, 4.0), (46.0, 12.0, 2.0)];
        Array2::from_shape_fn((64, 64), |(r, c)| {
            // frame +x moves features left, frame +y moves features down
            let x = c as f64 + shift_x;
            let y = r as f64 - shift_y;
            blobs
                .iter()
                .map(|(bx, by, s)| {
                    let d2 = (x - bx).powi(2) + (y - by).powi(2);
                    (-d2 / (2.0 * s * s)).exp()
                })
                .sum::<f64>()
        })
    }

    #[test]
    fn test_self_offset_is_zero_for_any_rotation() {
        let image = surface(0.0, 0.0);
        for angle in [0.0, 15.0, 90.0, -135.0] {
            let offset = estimate_offset(&image, &image, PX, angle).unwrap();
            assert!(offset.x.abs() < PX.x && offset.y.abs() < PX.y, "{angle}: {offset:?}");
        }
    }

    #[test]
    fn test_recovers_known_shift() {
        let reference = surface(0.0, 0.0);
        let shifted = surface(3.0, -2.0);
        let offset = estimate_offset(&reference, &shifted, PX, 0.0).unwrap();
        assert!((offset.x - 3e-9).abs() <= PX.x, "{offset:?}");
        assert!((offset.y - (-2e-9)).abs() <= PX.y, "{offset:?}");
    }

    #[test]
    fn test_rotation_applied_to_offset() {
        let reference = surface(0.0, 0.0);
        let shifted = surface(4.0, 0.0);
        let offset = estimate_offset(&reference, &shifted, PX, 90.0).unwrap();
        // rotating (4, 0) nm by -90 degrees gives (0, -4) nm
        assert!(offset.x.abs() <= PX.x, "{offset:?}");
        assert!((offset.y + 4e-9).abs() <= PX.y, "{offset:?}");
    }

    #[test]
    fn test_flat_images_report_zero() {
        let flat = Array2::from_elem((16, 16), 1e-10);
        assert_eq!(estimate_offset(&flat, &flat, PX, 0.0).unwrap(), Point::default());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let a = Array2::zeros((16, 16));
        let b = Array2::zeros((16, 32));
        assert!(estimate_offset(&a, &b, PX, 0.0).is_err());
    }

    #[test]
    fn test_corrector_first_image_is_reference() {
        let mut corrector = DriftCorrector::new();
        let first = corrector.observe(&surface(0.0, 0.0), PX, 0.0).unwrap();
        assert!(first.x.abs() < PX.x && first.y.abs() < PX.y);
        assert!(corrector.has_reference());

        let second = corrector.observe(&surface(2.0, 0.0), PX, 0.0).unwrap();
        assert!((second.x - 2e-9).abs() <= PX.x);
        assert!((corrector.total().x - 2e-9).abs() <= PX.x);
    }
}
