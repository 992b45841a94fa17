//! 平坦化ピクセルCSV（HMNIST 28x28 RGB）の読み込み

use csv::ReaderBuilder;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::DataIntegrityError;
use crate::ml::dataset::{LabeledImage, Provenance};
use crate::taxonomy::{LesionClass, NUM_TABULAR_CLASSES};

/// CSVを読み込み、表形式由来のラベル付き画像を返す
///
/// 各行は `image_size * image_size * 3` 個のピクセル値（HWC順）と `label` 列を持ちます。
/// `label` 列が無い場合は最後の列をラベルとして扱います。
pub fn load_csv(path: &Path, image_size: usize) -> Result<Vec<LabeledImage>, DataIntegrityError> {
    if !path.exists() {
        return Err(DataIntegrityError::MissingSource {
            path: path.to_path_buf(),
        });
    }

    let csv_err = |source| DataIntegrityError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_err)?;

    let headers = reader.headers().map_err(csv_err)?.clone();
    let expected_pixels = image_size * image_size * 3;
    let label_col = headers
        .iter()
        .position(|h| h.trim() == "label")
        .unwrap_or_else(|| headers.len().saturating_sub(1));

    let mut images = Vec::new();

    for result in reader.records() {
        let record = result.map_err(csv_err)?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        if record.len() != expected_pixels + 1 {
            return Err(DataIntegrityError::MalformedRow {
                line,
                reason: format!(
                    "expected {} columns, found {}",
                    expected_pixels + 1,
                    record.len()
                ),
            });
        }

        let label: i64 = record
            .get(label_col)
            .ok_or_else(|| DataIntegrityError::MalformedRow {
                line,
                reason: "missing label".to_string(),
            })?
            .trim()
            .parse()
            .map_err(|e| DataIntegrityError::MalformedRow {
                line,
                reason: format!("label is not an integer: {e}"),
            })?;

        let class = usize::try_from(label)
            .ok()
            .filter(|id| *id < NUM_TABULAR_CLASSES)
            .and_then(LesionClass::from_id)
            .ok_or(DataIntegrityError::LabelOutOfRange { line, label })?;

        let mut pixels = Vec::with_capacity(expected_pixels);
        for (i, field) in record.iter().enumerate() {
            if i == label_col {
                continue;
            }
            let value: u8 = field.trim().parse().map_err(|_| DataIntegrityError::MalformedRow {
                line,
                reason: format!("column {i} value '{field}' is not a pixel in 0..=255"),
            })?;
            pixels.push(value);
        }

        images.push(LabeledImage::new(
            Arc::from(pixels),
            class,
            Provenance::Tabular,
        ));
    }

    info!("CSVから {} 件を読み込みました: {}", images.len(), path.display());
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(rows: &[(u8, i64)], image_size: usize) -> tempfile::NamedTempFile {
        let n = image_size * image_size * 3;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let header: Vec<String> = (0..n)
            .map(|i| format!("pixel{i:04}"))
            .chain(std::iter::once("label".to_string()))
            .collect();
        writeln!(file, "{}", header.join(",")).unwrap();
        for (value, label) in rows {
            let row: Vec<String> = (0..n)
                .map(|_| value.to_string())
                .chain(std::iter::once(label.to_string()))
                .collect();
            writeln!(file, "{}", row.join(",")).unwrap();
        }
        file
    }

    #[test]
    fn test_load_csv_reads_pixels_and_labels() {
        let file = write_csv(&[(10, 0), (200, 6)], 2);
        let images = load_csv(file.path(), 2).unwrap();

        assert_eq!(images.len(), 2);
        assert_eq!(images[0].label(), LesionClass::Akiec);
        assert_eq!(images[1].label(), LesionClass::Mel);
        assert_eq!(images[1].pixels().len(), 12);
        assert!(images[1].pixels().iter().all(|&p| p == 200));
        assert_eq!(images[0].provenance(), Provenance::Tabular);
    }

    #[test]
    fn test_label_seven_is_rejected_in_tabular_source() {
        let file = write_csv(&[(10, 7)], 2);
        let err = load_csv(file.path(), 2).unwrap_err();
        assert!(matches!(err, DataIntegrityError::LabelOutOfRange { label: 7, .. }));
    }

    #[test]
    fn test_wrong_column_count_is_malformed() {
        let file = write_csv(&[(10, 1)], 2);
        let err = load_csv(file.path(), 3).unwrap_err();
        assert!(matches!(err, DataIntegrityError::MalformedRow { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = load_csv(Path::new("/nonexistent/hmnist.csv"), 28).unwrap_err();
        assert!(matches!(err, DataIntegrityError::MissingSource { .. }));
    }
}
