//! Simulated sample surface.
//!
//! Heights are evaluated in absolute piezo coordinates. Features are Gaussian
//! bumps; imprints are hard-edged elliptical pits left by tip-shaping pulses.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scanbot_core::frame::{Point, ScanFrame};

/// Gaussian bump on the surface (adsorbate, island, cluster).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feature {
    /// Absolute center (m)
    pub center: Point,
    /// Gaussian width (m)
    pub radius: f64,
    /// Peak height (m)
    pub height: f64,
}

impl Feature {
    /// Bump of `height` and width `radius` at `center`.
    pub fn new(center: Point, radius: f64, height: f64) -> Self {
        Self {
            center,
            radius,
            height,
        }
    }

    fn height_at(&self, p: Point) -> f64 {
        let d2 = (p.x - self.center.x).powi(2) + (p.y - self.center.y).powi(2);
        self.height * (-d2 / (2.0 * self.radius * self.radius)).exp()
    }
}

/// Mark left by a tip-shaping pulse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Imprint {
    /// Absolute center (m)
    pub center: Point,
    /// Semi-axis along x (m)
    pub semi_x: f64,
    /// Semi-axis along y (m)
    pub semi_y: f64,
    /// Pit depth (m)
    pub depth: f64,
}

impl Imprint {
    fn contains(&self, p: Point) -> bool {
        let dx = (p.x - self.center.x) / self.semi_x;
        let dy = (p.y - self.center.y) / self.semi_y;
        dx * dx + dy * dy <= 1.0
    }
}

/// Surface model sampled by the simulated scanner.
#[derive(Debug, Clone, Default)]
pub struct Surface {
    features: Vec<Feature>,
    imprints: Vec<Imprint>,
    noise: f64,
    seed: u64,
}

impl Surface {
    /// Flat surface.
    pub fn flat() -> Self {
        Self::default()
    }

    /// Add a feature.
    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.features.push(feature);
        self
    }

    /// Add uniform measurement noise of amplitude `amplitude` (m).
    pub fn with_noise(mut self, amplitude: f64, seed: u64) -> Self {
        self.noise = amplitude.abs();
        self.seed = seed;
        self
    }

    /// Record an imprint.
    pub fn add_imprint(&mut self, imprint: Imprint) {
        self.imprints.push(imprint);
    }

    /// Imprints made so far.
    pub fn imprints(&self) -> &[Imprint] {
        &self.imprints
    }

    /// Height at absolute position `p` (m).
    pub fn height_at(&self, p: Point) -> f64 {
        let bumps: f64 = self.features.iter().map(|f| f.height_at(p)).sum();
        let pits = self
            .imprints
            .iter()
            .filter(|i| i.contains(p))
            .map(|i| i.depth)
            .fold(0.0_f64, f64::max);
        bumps - pits
    }

    /// Image of `frame` sampled at `pixels` x `lines`, row 0 at the top.
    ///
    /// `drift` is how far the sample has crept since the run started; the
    /// scanner sees the surface displaced by it.
    pub fn render(
        &self,
        frame: &ScanFrame,
        pixels: u32,
        lines: u32,
        drift: Point,
        frame_index: u64,
    ) -> Array2<f64> {
        let (cols, rows) = (pixels.max(1) as usize, lines.max(1) as usize);
        let px = frame.width / cols as f64;
        let py = frame.height / rows as f64;
        let mut image = Array2::from_shape_fn((rows, cols), |(r, c)| {
            let local = Point::new(
                frame.center_x - frame.width / 2.0 + (c as f64 + 0.5) * px,
                frame.center_y + frame.height / 2.0 - (r as f64 + 0.5) * py,
            );
            let absolute = local.rotated_about(frame.center(), frame.angle_deg);
            self.height_at(absolute - drift)
        });
        if self.noise > 0.0 {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(frame_index));
            let noise = self.noise;
            image.mapv_inplace(|v| v + rng.gen_range(-noise..noise));
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_orientation() {
        let surface = Surface::flat().with_feature(Feature::new(Point::new(2e-9, 2e-9), 0.5e-9, 1e-9));
        let frame = ScanFrame::square(Point::default(), 8e-9).unwrap();
        let image = surface.render(&frame, 16, 16, Point::default(), 0);
        // feature at +x, +y appears top right
        let (mut best, mut at) = (f64::MIN, (0, 0));
        for ((r, c), v) in image.indexed_iter() {
            if *v > best {
                best = *v;
                at = (r, c);
            }
        }
        assert!(at.0 < 8 && at.1 >= 8, "{at:?}");
    }

    #[test]
    fn test_imprint_is_a_pit() {
        let mut surface = Surface::flat();
        surface.add_imprint(Imprint {
            center: Point::default(),
            semi_x: 1e-9,
            semi_y: 1e-9,
            depth: 1e-10,
        });
        assert_eq!(surface.height_at(Point::default()), -1e-10);
        assert_eq!(surface.height_at(Point::new(3e-9, 0.0)), 0.0);
    }
}
