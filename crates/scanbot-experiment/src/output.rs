//! Processed data written to disk.

use ndarray::Array2;
use scanbot_core::error::{ScanbotError, ScanbotResult};
use std::path::{Path, PathBuf};
use tracing::info;

/// Write `image` as headerless CSV, one image row per record.
///
/// Unscanned pixels are written as `NaN`. Parent directories are created.
pub fn write_csv(path: &Path, image: &Array2<f64>) -> ScanbotResult<PathBuf> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|e| ScanbotError::Storage(e.to_string()))?;
        }
    }

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| ScanbotError::Storage(format!("Failed to create CSV file: {}", e)))?;
    for row in image.rows() {
        writer
            .write_record(row.iter().map(|v| v.to_string()))
            .map_err(|e| ScanbotError::Storage(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| ScanbotError::Storage(e.to_string()))?;

    info!(path = %path.display(), rows = image.nrows(), cols = image.ncols(), "Wrote CSV");
    Ok(path.to_path_buf())
}

/// Path of the stitched image of survey `suffix` in `data_dir`.
pub fn stitched_path(data_dir: &Path, suffix: &str) -> PathBuf {
    data_dir.join(format!("{suffix}_stitch.csv"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_write_csv_with_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = stitched_path(&dir.path().join("nested"), "demo");
        let image = array![[1.0, f64::NAN], [0.5, -2e-10]];

        let written = write_csv(&path, &image).unwrap();
        let text = std::fs::read_to_string(written).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["1,NaN", "0.5,-0.0000000002"]);
    }
}
