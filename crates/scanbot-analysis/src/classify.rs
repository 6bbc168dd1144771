//! Built-in tip-change classifier.
//!
//! A tip change shows up as a horizontal discontinuity: one line is offset
//! from the next along most of its length. The detector squares the
//! line-to-line derivative, flags lines where a long enough run of pixels
//! exceeds a 3-sigma threshold, and groups flagged lines that are at most two
//! lines apart into one event.

use crate::filters::complete_rows;
use ndarray::{Array2, Axis};
use scanbot_core::hooks::{Classification, ImageClassifier};

/// Tip changes above which a scan counts as bad.
pub const BAD_SCAN_TIP_CHANGES: usize = 5;

/// Consecutive bad scans that trigger tip shaping.
pub const BAD_SCANS_BEFORE_RESHAPE: usize = 5;

/// A line is flagged when at least this fraction of it is discontinuous.
const MIN_LINE_FRACTION: f64 = 1.0 / 8.0;

/// Flagged lines closer than this belong to the same event.
const MAX_GROUP_GAP: usize = 2;

/// Count tip changes in `image`; unscanned lines are ignored.
pub fn count_tip_changes(image: &Array2<f64>) -> usize {
    let valid = complete_rows(image);
    if valid.nrows() < 2 || valid.ncols() == 0 {
        return 0;
    }

    let rows = valid.nrows() - 1;
    let diff = Array2::from_shape_fn((rows, valid.ncols()), |(r, c)| {
        (valid[[r + 1, c]] - valid[[r, c]]).powi(2)
    });

    let n = diff.len() as f64;
    let mean = diff.sum() / n;
    let sigma = (diff.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    if !sigma.is_finite() || sigma == 0.0 {
        return 0;
    }
    let limit = mean + 3.0 * sigma;

    let min_run = (valid.ncols() as f64 * MIN_LINE_FRACTION).max(1.0);
    let flagged: Vec<usize> = diff
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, line)| line.iter().filter(|v| **v > limit).count() as f64 >= min_run)
        .map(|(r, _)| r)
        .collect();

    let Some(first) = flagged.first() else {
        return 0;
    };
    let mut events = 1;
    let mut last = *first;
    for &r in &flagged[1..] {
        if r - last > MAX_GROUP_GAP {
            events += 1;
        }
        last = r;
    }
    events
}

/// Tip-change detector with a consecutive-bad-scans reshape rule.
///
/// The current image and the history are walked newest first. Incomplete
/// scans are skipped, a good scan ends the walk, and tip shaping is requested
/// once [`BAD_SCANS_BEFORE_RESHAPE`] bad scans are seen in a row.
#[derive(Debug, Clone, Copy, Default)]
pub struct TipChangeClassifier;

impl TipChangeClassifier {
    fn needs_reshape<'a>(newest_first: impl Iterator<Item = &'a Classification>) -> bool {
        let mut bad = 0;
        for scan in newest_first {
            if scan.incomplete {
                continue;
            }
            if scan.tip_changes <= BAD_SCAN_TIP_CHANGES {
                return false;
            }
            bad += 1;
            if bad >= BAD_SCANS_BEFORE_RESHAPE {
                return true;
            }
        }
        false
    }
}

impl ImageClassifier for TipChangeClassifier {
    fn classify(
        &self,
        image: &Array2<f64>,
        history: &[Classification],
    ) -> anyhow::Result<Classification> {
        let mut current = Classification {
            tip_changes: count_tip_changes(image),
            incomplete: image.iter().any(|v| !v.is_finite()),
            needs_tip_shape: false,
        };
        current.needs_tip_shape =
            Self::needs_reshape(std::iter::once(&current).chain(history.iter().rev()));
        Ok(current)
    }
}
