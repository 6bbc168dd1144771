//! Scan-frame geometry.
//!
//! All lengths are in meters and angles in degrees, matching the controller.
//! Image arrays are indexed `[row, column]` with row 0 at the top of the frame
//! (largest y) and column 0 at the left (smallest x).

use crate::error::{ScanbotError, ScanbotResult};
use crate::limits::PIXEL_MULTIPLE;
use serde::{Deserialize, Serialize};

/// A position in the frame plane (m).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    /// x coordinate (m)
    pub x: f64,
    /// y coordinate (m)
    pub y: f64,
}

impl Point {
    /// Create a point.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Rotate around `origin` by `angle_deg` (counter-clockwise positive).
    pub fn rotated_about(self, origin: Point, angle_deg: f64) -> Point {
        let (sin, cos) = angle_deg.to_radians().sin_cos();
        let dx = self.x - origin.x;
        let dy = self.y - origin.y;
        Point {
            x: origin.x + cos * dx - sin * dy,
            y: origin.y + sin * dx + cos * dy,
        }
    }
}

impl std::ops::Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Scan window: center, size and rotation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanFrame {
    /// Center x (m)
    pub center_x: f64,
    /// Center y (m)
    pub center_y: f64,
    /// Width (m), strictly positive
    pub width: f64,
    /// Height (m), strictly positive
    pub height: f64,
    /// Rotation (degrees)
    pub angle_deg: f64,
}

impl ScanFrame {
    /// Create a validated frame.
    pub fn new(
        center_x: f64,
        center_y: f64,
        width: f64,
        height: f64,
        angle_deg: f64,
    ) -> ScanbotResult<Self> {
        let frame = Self {
            center_x,
            center_y,
            width,
            height,
            angle_deg,
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Square, unrotated frame.
    pub fn square(center: Point, size: f64) -> ScanbotResult<Self> {
        Self::new(center.x, center.y, size, size, 0.0)
    }

    /// Reject non-positive or non-finite dimensions.
    pub fn validate(&self) -> ScanbotResult<()> {
        let finite = [
            self.center_x,
            self.center_y,
            self.width,
            self.height,
            self.angle_deg,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite || self.width <= 0.0 || self.height <= 0.0 {
            return Err(ScanbotError::InvalidParameter(format!(
                "scan frame must have finite, positive size (got {:.3e} x {:.3e} m)",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Frame center.
    pub fn center(&self) -> Point {
        Point::new(self.center_x, self.center_y)
    }

    /// Copy of the frame moved to `center`.
    pub fn with_center(mut self, center: Point) -> Self {
        self.center_x = center.x;
        self.center_y = center.y;
        self
    }

    /// Copy of the frame shifted by `delta`.
    pub fn shifted(self, delta: Point) -> Self {
        let c = self.center() + delta;
        self.with_center(c)
    }

    /// Left edge midpoint in absolute coordinates, honoring rotation.
    pub fn left_edge(&self) -> Point {
        let edge = Point::new(self.center_x - self.width / 2.0, self.center_y);
        edge.rotated_about(self.center(), self.angle_deg)
    }

    /// Whether `point` lies inside the (rotated) frame.
    pub fn contains(&self, point: Point) -> bool {
        let local = point.rotated_about(self.center(), -self.angle_deg) - self.center();
        local.x.abs() <= self.width / 2.0 && local.y.abs() <= self.height / 2.0
    }
}

/// Range reachable by the scan piezo (m), centered on zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PiezoRange {
    /// Full range along x (m)
    pub x: f64,
    /// Full range along y (m)
    pub y: f64,
    /// Full range along z (m)
    pub z: f64,
}

impl PiezoRange {
    /// Whether `frame` fits entirely inside the range.
    pub fn fits(&self, frame: &ScanFrame) -> bool {
        let half_w = frame.width / 2.0;
        let half_h = frame.height / 2.0;
        frame.center_x.abs() + half_w <= self.x / 2.0
            && frame.center_y.abs() + half_h <= self.y / 2.0
    }
}

/// Position of a frame in a planned grid.
///
/// `row` 0 is the bottom row (smallest y); `col` 0 is the left column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCell {
    /// Row index, increasing with y
    pub row: usize,
    /// Column index, increasing with x
    pub col: usize,
}

/// Round a pixel count up to the next multiple of 16 (minimum 16).
pub fn round_up_pixels(pixels: u32) -> u32 {
    let blocks = pixels.div_ceil(PIXEL_MULTIPLE).max(1);
    blocks * PIXEL_MULTIPLE
}

/// Lines matching the frame aspect ratio for `pixels` columns.
pub fn lines_for_aspect(pixels: u32, frame: &ScanFrame) -> u32 {
    let lines = (f64::from(pixels) * frame.height / frame.width).round();
    (lines as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rejects_non_positive_size() {
        assert!(ScanFrame::new(0.0, 0.0, 0.0, 1e-9, 0.0).is_err());
        assert!(ScanFrame::new(0.0, 0.0, 1e-9, -1e-9, 0.0).is_err());
        assert!(ScanFrame::new(0.0, 0.0, f64::NAN, 1e-9, 0.0).is_err());
        assert!(ScanFrame::new(0.0, 0.0, 1e-9, 1e-9, 30.0).is_ok());
    }

    #[test]
    fn test_pixel_rounding() {
        assert_eq!(round_up_pixels(0), 16);
        assert_eq!(round_up_pixels(16), 16);
        assert_eq!(round_up_pixels(17), 32);
        assert_eq!(round_up_pixels(100), 112);
        assert_eq!(round_up_pixels(256), 256);
    }

    #[test]
    fn test_contains_honors_rotation() {
        let frame = ScanFrame::new(0.0, 0.0, 10e-9, 2e-9, 90.0).unwrap();
        assert!(frame.contains(Point::new(0.0, 4e-9)));
        assert!(!frame.contains(Point::new(4e-9, 0.0)));
    }

    #[test]
    fn test_range_fit_uses_half_extent() {
        let range = PiezoRange {
            x: 40e-9,
            y: 40e-9,
            z: 1e-6,
        };
        let inside = ScanFrame::square(Point::new(10e-9, -10e-9), 10e-9).unwrap();
        let outside = ScanFrame::square(Point::new(18e-9, 0.0), 10e-9).unwrap();
        assert!(range.fits(&inside));
        assert!(!range.fits(&outside));
    }

    #[test]
    fn test_left_edge() {
        let frame = ScanFrame::new(1e-9, 2e-9, 10e-9, 10e-9, 0.0).unwrap();
        let edge = frame.left_edge();
        assert!((edge.x - (-4e-9)).abs() < 1e-18);
        assert!((edge.y - 2e-9).abs() < 1e-18);
    }
}
