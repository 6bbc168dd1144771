//! Survey stitching.
//!
//! Tiles are placed by their grid cell, not by acquisition order, so the
//! result does not depend on snake direction, reverse flag or grid parity.
//! Grid row 0 is the bottom of the survey and ends up in the last block of
//! image rows. Cells that were never acquired stay NaN.

use ndarray::{s, Array2};
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::frame::GridCell;

/// Assemble `tiles` of an `n` x `n` survey into one image.
pub fn stitch(tiles: &[(GridCell, Array2<f64>)], n: usize) -> ScanbotResult<Array2<f64>> {
    let Some((_, first)) = tiles.first() else {
        return Err(ScanbotError::InvalidParameter("nothing to stitch".into()));
    };
    let (h, w) = first.dim();

    let mut out = Array2::from_elem((n * h, n * w), f64::NAN);
    for (cell, tile) in tiles {
        if tile.dim() != (h, w) {
            return Err(ScanbotError::InvalidParameter(format!(
                "tile {cell:?} is {:?}, expected {:?}",
                tile.dim(),
                (h, w)
            )));
        }
        if cell.row >= n || cell.col >= n {
            return Err(ScanbotError::InvalidParameter(format!(
                "tile {cell:?} outside a {n}x{n} grid"
            )));
        }
        let top = (n - 1 - cell.row) * h;
        let left = cell.col * w;
        out.slice_mut(s![top..top + h, left..left + w]).assign(tile);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(value: f64) -> Array2<f64> {
        Array2::from_elem((2, 3), value)
    }

    #[test]
    fn test_cells_land_by_position() {
        let tiles = vec![
            (GridCell { row: 0, col: 0 }, tile(1.0)),
            (GridCell { row: 0, col: 1 }, tile(2.0)),
            (GridCell { row: 1, col: 1 }, tile(3.0)),
            (GridCell { row: 1, col: 0 }, tile(4.0)),
        ];
        let image = stitch(&tiles, 2).unwrap();
        assert_eq!(image.dim(), (4, 6));
        // bottom-left, bottom-right, top-right, top-left
        assert_eq!(image[[3, 0]], 1.0);
        assert_eq!(image[[3, 5]], 2.0);
        assert_eq!(image[[0, 5]], 3.0);
        assert_eq!(image[[0, 0]], 4.0);
    }

    #[test]
    fn test_order_does_not_matter() {
        let forward = vec![
            (GridCell { row: 0, col: 0 }, tile(1.0)),
            (GridCell { row: 1, col: 0 }, tile(2.0)),
        ];
        let mut backward = forward.clone();
        backward.reverse();
        assert_eq!(stitch(&forward, 2).unwrap().iter().filter(|v| v.is_finite()).count(), 12);
        let a = stitch(&forward, 2).unwrap();
        let b = stitch(&backward, 2).unwrap();
        assert!(a.iter().zip(b.iter()).all(|(x, y)| x == y || (x.is_nan() && y.is_nan())));
    }

    #[test]
    fn test_missing_cells_stay_nan() {
        let tiles = vec![(GridCell { row: 0, col: 0 }, tile(1.0))];
        let image = stitch(&tiles, 2).unwrap();
        assert!(image[[0, 0]].is_nan());
        assert_eq!(image[[2, 0]], 1.0);
    }

    #[test]
    fn test_rejects_mismatched_tiles() {
        let tiles = vec![
            (GridCell { row: 0, col: 0 }, tile(1.0)),
            (GridCell { row: 0, col: 1 }, Array2::zeros((3, 3))),
        ];
        assert!(stitch(&tiles, 2).is_err());
        assert!(stitch(&[], 2).is_err());
    }
}
