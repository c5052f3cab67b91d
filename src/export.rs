//! Writes result matrices to CSV, the crate's array-serialization surface.
//! Embeddings and denoised matrices stay plain `ndarray` values in memory;
//! this is only for handing them to external tools.

use std::path::Path;

use ndarray::ArrayView2;

use crate::error::FormatError;
use crate::RaspFloat;

/// Writes a dense matrix as headerless CSV, one row per record.
pub fn write_matrix_csv<T: RaspFloat, P: AsRef<Path>>(
    path: P,
    matrix: ArrayView2<T>,
) -> Result<(), FormatError> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path).map_err(|source| FormatError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    for row in matrix.rows() {
        let record: Vec<String> = row.iter().map(|v| format!("{v}")).collect();
        writer
            .write_record(&record)
            .map_err(|source| FormatError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
    }
    writer.flush().map_err(|source| FormatError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_round_trip() {
        let dir = std::env::temp_dir().join("rasp_export_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("embedding.csv");

        let matrix = array![[1.5, -2.0], [0.0, 3.25]];
        write_matrix_csv(&path, matrix.view()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = contents.lines().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], "1.5,-2");
        assert_eq!(rows[1], "0,3.25");

        std::fs::remove_dir_all(&dir).ok();
    }
}
