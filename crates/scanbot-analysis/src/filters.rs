//! Small image filters shared by the analysis routines.
//!
//! All filters use symmetric (mirror) boundaries: `d c b a | a b c d`.

use ndarray::{s, Array2, Axis};

/// Mirror an out-of-range index back into `0..n`.
pub fn symmetric_index(i: isize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let n = n as isize;
    let period = 2 * n;
    let mut m = i.rem_euclid(period);
    if m >= n {
        m = period - 1 - m;
    }
    m as usize
}

fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (4.0 * sigma).ceil().max(1.0) as isize;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|i| {
            let x = i as f64;
            (-0.5 * x * x / (sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

fn convolve_axis(image: &Array2<f64>, kernel: &[f64], axis: Axis) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let radius = (kernel.len() / 2) as isize;
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        kernel
            .iter()
            .enumerate()
            .map(|(k, w)| {
                let offset = k as isize - radius;
                let v = if axis == Axis(0) {
                    image[[symmetric_index(r as isize + offset, rows), c]]
                } else {
                    image[[r, symmetric_index(c as isize + offset, cols)]]
                };
                w * v
            })
            .sum()
    })
}

/// Separable Gaussian blur with standard deviation `sigma` pixels.
pub fn gaussian_blur(image: &Array2<f64>, sigma: f64) -> Array2<f64> {
    if sigma <= 0.0 || image.is_empty() {
        return image.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let rows_done = convolve_axis(image, &kernel, Axis(1));
    convolve_axis(&rows_done, &kernel, Axis(0))
}

/// Image minus its Gaussian-blurred background.
pub fn highpass(image: &Array2<f64>, sigma: f64) -> Array2<f64> {
    image - &gaussian_blur(image, sigma)
}

/// Forward difference along each row; one column narrower than the input.
pub fn diff_columns(image: &Array2<f64>) -> Array2<f64> {
    if image.ncols() < 2 {
        return Array2::zeros((image.nrows(), 0));
    }
    &image.slice(s![.., 1..]) - &image.slice(s![.., ..-1])
}

/// Sobel gradient magnitude.
pub fn gradient_magnitude(image: &Array2<f64>) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let at = |r: isize, c: isize| {
        image[[symmetric_index(r, rows), symmetric_index(c, cols)]]
    };
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let (r, c) = (r as isize, c as isize);
        let gx = (at(r - 1, c + 1) + 2.0 * at(r, c + 1) + at(r + 1, c + 1))
            - (at(r - 1, c - 1) + 2.0 * at(r, c - 1) + at(r + 1, c - 1));
        let gy = (at(r + 1, c - 1) + 2.0 * at(r + 1, c) + at(r + 1, c + 1))
            - (at(r - 1, c - 1) + 2.0 * at(r - 1, c) + at(r - 1, c + 1));
        (gx * gx + gy * gy).sqrt()
    })
}

/// Rows in which every value is finite, in original order.
pub fn complete_rows(image: &Array2<f64>) -> Array2<f64> {
    let keep: Vec<usize> = image
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, row)| row.iter().all(|v| v.is_finite()))
        .map(|(i, _)| i)
        .collect();
    image.select(Axis(0), &keep)
}

/// Reverse the row order (upward scans are recorded bottom row first).
pub fn flip_rows(image: &Array2<f64>) -> Array2<f64> {
    image.slice(s![..;-1, ..]).to_owned()
}

/// Zero-mean copy scaled to unit Euclidean norm; `None` for flat images.
pub fn normalized(image: &Array2<f64>) -> Option<Array2<f64>> {
    let mean = image.mean()?;
    let centered = image.mapv(|v| v - mean);
    let norm = centered.iter().map(|v| v * v).sum::<f64>().sqrt();
    if !norm.is_finite() || norm <= f64::EPSILON {
        return None;
    }
    Some(centered / norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_symmetric_index_mirrors_edges() {
        assert_eq!(symmetric_index(-1, 4), 0);
        assert_eq!(symmetric_index(-2, 4), 1);
        assert_eq!(symmetric_index(4, 4), 3);
        assert_eq!(symmetric_index(5, 4), 2);
        assert_eq!(symmetric_index(2, 4), 2);
        assert_eq!(symmetric_index(7, 1), 0);
    }

    #[test]
    fn test_blur_preserves_constant_image() {
        let image = Array2::from_elem((8, 8), 3.0);
        let blurred = gaussian_blur(&image, 1.5);
        assert!(blurred.iter().all(|v| (v - 3.0).abs() < 1e-12));
    }

    #[test]
    fn test_diff_columns() {
        let image = array![[1.0, 2.0, 4.0], [0.0, 0.0, 1.0]];
        assert_eq!(diff_columns(&image), array![[1.0, 2.0], [0.0, 1.0]]);
    }

    #[test]
    fn test_complete_rows_drops_unscanned_lines() {
        let image = array![[1.0, 2.0], [f64::NAN, f64::NAN], [3.0, 4.0]];
        assert_eq!(complete_rows(&image), array![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn test_gradient_peaks_on_step() {
        let image = Array2::from_shape_fn((6, 6), |(_, c)| if c < 3 { 0.0 } else { 1.0 });
        let grad = gradient_magnitude(&image);
        assert_eq!(grad[[2, 0]], 0.0);
        assert!(grad[[2, 2]] > 0.0 && grad[[2, 3]] > 0.0);
    }

    #[test]
    fn test_normalized_rejects_flat_image() {
        assert!(normalized(&Array2::from_elem((4, 4), 1.0)).is_none());
        let n = normalized(&array![[0.0, 1.0], [2.0, 3.0]]).unwrap();
        let norm: f64 = n.iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-12);
    }
}
