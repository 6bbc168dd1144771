//! Frame and grid planning.
//!
//! Pure functions: nothing here touches the instrument. Every plan is built
//! and range-checked before a procedure issues its first hardware command.
//!
//! # Grid layout
//!
//! ```text
//!   row 1   (3) <-- (2)        y
//!                    ^         ^
//!   row 0   (0) --> (1)        +--> x
//! ```
//!
//! Rows are visited bottom to top and alternate direction (snake order).
//! `reverse` walks the same path backwards.

use scanbot_core::capabilities::MotorDirection;
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::frame::{GridCell, PiezoRange, Point, ScanFrame};
use serde::{Deserialize, Serialize};

/// Parameters of an n x n grid of square frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    /// Frames per side
    pub n: usize,
    /// Center-to-center spacing (m)
    pub pitch: f64,
    /// Frame width and height (m)
    pub size: f64,
    /// Absolute offset of the grid center (m)
    pub origin: Point,
    /// Walk the snake backwards
    pub reverse: bool,
}

/// Ordered frames of a survey plus the index of the next frame to acquire.
#[derive(Debug, Clone, PartialEq)]
pub struct SurveyPlan {
    frames: Vec<ScanFrame>,
    cells: Vec<GridCell>,
    resume: usize,
}

impl SurveyPlan {
    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the plan has no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames in acquisition order.
    pub fn frames(&self) -> &[ScanFrame] {
        &self.frames
    }

    /// Grid cell of each frame, in acquisition order.
    pub fn cells(&self) -> &[GridCell] {
        &self.cells
    }

    /// Frame and cell at `index`.
    pub fn get(&self, index: usize) -> Option<(ScanFrame, GridCell)> {
        Some((*self.frames.get(index)?, *self.cells.get(index)?))
    }

    /// Index of the next frame to acquire.
    pub fn resume_index(&self) -> usize {
        self.resume
    }

    /// Move the resume index, clamped to the plan length.
    pub fn set_resume_index(&mut self, index: usize) {
        self.resume = index.min(self.frames.len());
    }

    /// Whether every frame has been handed out.
    pub fn finished(&self) -> bool {
        self.resume >= self.frames.len()
    }
}

fn axis_offsets(n: usize, pitch: f64) -> Vec<f64> {
    let mid = (n as f64 - 1.0) / 2.0;
    (0..n).map(|i| (i as f64 - mid) * pitch).collect()
}

/// Snake-ordered grid of frames.
///
/// Fails with [`ScanbotError::GridExceedsRange`] when any frame would leave
/// `range`.
pub fn plan_grid(spec: &GridSpec, range: &PiezoRange) -> ScanbotResult<SurveyPlan> {
    if spec.n == 0 {
        return Err(ScanbotError::InvalidParameter(
            "grid needs at least one frame per side".into(),
        ));
    }
    if spec.n > 1 && !(spec.pitch.is_finite() && spec.pitch > 0.0) {
        return Err(ScanbotError::InvalidParameter(format!(
            "grid pitch must be positive (got {:e} m)",
            spec.pitch
        )));
    }

    let offsets = axis_offsets(spec.n, spec.pitch);
    let mut frames = Vec::with_capacity(spec.n * spec.n);
    let mut cells = Vec::with_capacity(spec.n * spec.n);
    for row in 0..spec.n {
        for k in 0..spec.n {
            let col = if row % 2 == 0 { k } else { spec.n - 1 - k };
            let center = spec.origin + Point::new(offsets[col], offsets[row]);
            let frame = ScanFrame::square(center, spec.size)?;
            if !range.fits(&frame) {
                return Err(ScanbotError::GridExceedsRange {
                    x: center.x,
                    y: center.y,
                    half_extent: spec.size / 2.0,
                    range_x: range.x,
                    range_y: range.y,
                });
            }
            frames.push(frame);
            cells.push(GridCell { row, col });
        }
    }
    if spec.reverse {
        frames.reverse();
        cells.reverse();
    }

    Ok(SurveyPlan {
        frames,
        cells,
        resume: 0,
    })
}

/// Outer grid of a multi-site survey, in coarse motor steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSpec {
    /// Sites along x
    pub nx: usize,
    /// Sites along y
    pub ny: usize,
    /// Motor steps between sites along x; the sign picks the first direction
    pub x_steps: i32,
    /// Motor steps between rows of sites; the sign picks the direction
    pub y_steps: i32,
}

/// One stop of a multi-site survey.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteVisit {
    /// Row of sites (loop order)
    pub y: usize,
    /// Position within the row (loop order)
    pub x: usize,
    /// Walk the inner survey backwards at this site
    pub reverse_inner: bool,
    /// Coarse move to make after this site, if any
    pub then_move: Option<(MotorDirection, u32)>,
}

/// Visits of an `nx` x `ny` site grid.
///
/// The x direction flips on every row so the coarse motor snakes too, and
/// the inner survey alternates direction at every site so consecutive
/// surveys start where the previous one ended.
pub fn plan_sites(spec: &SiteSpec) -> ScanbotResult<Vec<SiteVisit>> {
    if spec.nx == 0 || spec.ny == 0 {
        return Err(ScanbotError::InvalidParameter(
            "multi-site survey needs at least one site along x and y".into(),
        ));
    }
    let x_steps = if spec.nx == 1 { 0 } else { spec.x_steps };
    let y_steps = if spec.ny == 1 { 0 } else { spec.y_steps };
    let y_dir = if y_steps < 0 {
        MotorDirection::YMinus
    } else {
        MotorDirection::YPlus
    };
    let mut x_dir = if x_steps < 0 {
        MotorDirection::XMinus
    } else {
        MotorDirection::XPlus
    };

    let mut visits = Vec::with_capacity(spec.nx * spec.ny);
    let mut reverse = false;
    for y in 0..spec.ny {
        for x in 0..spec.nx {
            let then_move = if x + 1 < spec.nx {
                Some((x_dir, x_steps.unsigned_abs()))
            } else if y + 1 < spec.ny {
                Some((y_dir, y_steps.unsigned_abs()))
            } else {
                None
            };
            visits.push(SiteVisit {
                y,
                x,
                reverse_inner: reverse,
                then_move,
            });
            reverse = !reverse;
        }
        x_dir = x_dir.reversed();
    }
    Ok(visits)
}

/// `count` evenly spaced values from `first` to `last` inclusive.
pub fn linspace(first: f64, last: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![first],
        _ => {
            let step = (last - first) / (count - 1) as f64;
            (0..count).map(|i| first + step * i as f64).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANGE: PiezoRange = PiezoRange {
        x: 1e-6,
        y: 1e-6,
        z: 1e-6,
    };

    fn spec(n: usize) -> GridSpec {
        GridSpec {
            n,
            pitch: 20e-9,
            size: 10e-9,
            origin: Point::default(),
            reverse: false,
        }
    }

    fn centers(plan: &SurveyPlan) -> Vec<(f64, f64)> {
        plan.frames()
            .iter()
            .map(|f| ((f.center_x * 1e9).round(), (f.center_y * 1e9).round()))
            .collect()
    }

    #[test]
    fn test_two_by_two_snake() {
        let plan = plan_grid(&spec(2), &RANGE).unwrap();
        assert_eq!(
            centers(&plan),
            vec![(-10.0, -10.0), (10.0, -10.0), (10.0, 10.0), (-10.0, 10.0)]
        );
        assert_eq!(plan.cells()[2], GridCell { row: 1, col: 1 });
        assert_eq!(plan.resume_index(), 0);
    }

    #[test]
    fn test_every_size_is_full_and_snaked() {
        for n in 1..=6 {
            let plan = plan_grid(&spec(n), &RANGE).unwrap();
            assert_eq!(plan.len(), n * n);
            assert!(plan.frames().iter().all(|f| RANGE.fits(f)));
            for row in 1..n {
                let prev: Vec<usize> = plan.cells()[(row - 1) * n..row * n].iter().map(|c| c.col).collect();
                let mut this: Vec<usize> = plan.cells()[row * n..(row + 1) * n].iter().map(|c| c.col).collect();
                this.reverse();
                assert_eq!(prev, this, "row {row} of n = {n}");
            }
        }
    }

    #[test]
    fn test_reverse_walks_backwards() {
        let forward = plan_grid(&spec(3), &RANGE).unwrap();
        let backward = plan_grid(&GridSpec { reverse: true, ..spec(3) }, &RANGE).unwrap();
        let mut expected = forward.cells().to_vec();
        expected.reverse();
        assert_eq!(backward.cells(), expected.as_slice());
    }

    #[test]
    fn test_origin_offsets_the_grid() {
        let plan = plan_grid(
            &GridSpec {
                origin: Point::new(100e-9, -50e-9),
                ..spec(1)
            },
            &RANGE,
        )
        .unwrap();
        assert_eq!(centers(&plan), vec![(100.0, -50.0)]);
    }

    #[test]
    fn test_grid_exceeding_range_is_rejected() {
        let small = PiezoRange {
            x: 40e-9,
            y: 40e-9,
            z: 1e-6,
        };
        let err = plan_grid(&spec(3), &small).unwrap_err();
        assert!(matches!(err, ScanbotError::GridExceedsRange { .. }));
        assert!(plan_grid(&spec(0), &RANGE).is_err());
    }

    #[test]
    fn test_resume_index_is_clamped() {
        let mut plan = plan_grid(&spec(2), &RANGE).unwrap();
        plan.set_resume_index(3);
        assert!(!plan.finished());
        plan.set_resume_index(10);
        assert_eq!(plan.resume_index(), 4);
        assert!(plan.finished());
    }

    #[test]
    fn test_sites_snake_and_alternate() {
        let visits = plan_sites(&SiteSpec {
            nx: 2,
            ny: 2,
            x_steps: 100,
            y_steps: -50,
        })
        .unwrap();
        let moves: Vec<_> = visits.iter().map(|v| v.then_move).collect();
        assert_eq!(
            moves,
            vec![
                Some((MotorDirection::XPlus, 100)),
                Some((MotorDirection::YMinus, 50)),
                Some((MotorDirection::XMinus, 100)),
                None,
            ]
        );
        let reverse: Vec<bool> = visits.iter().map(|v| v.reverse_inner).collect();
        assert_eq!(reverse, vec![false, true, false, true]);
    }

    #[test]
    fn test_single_column_has_no_x_moves() {
        let visits = plan_sites(&SiteSpec {
            nx: 1,
            ny: 3,
            x_steps: 100,
            y_steps: 20,
        })
        .unwrap();
        assert!(visits
            .iter()
            .filter_map(|v| v.then_move)
            .all(|(dir, steps)| dir == MotorDirection::YPlus && steps == 20));
        assert_eq!(visits.len(), 3);
    }

    #[test]
    fn test_linspace() {
        assert_eq!(linspace(-1.0, 1.0, 3), vec![-1.0, 0.0, 1.0]);
        assert_eq!(linspace(0.5, 2.0, 1), vec![0.5]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }
}
