//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス順序、前処理、学習記録など）
//! - model.bin       - モデルの重み（バイナリ）

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tracing::info;

use crate::error::{ArtifactError, ModelLoadError};
use crate::ml::ml_model::SkinLesionClassifier;
use crate::model::model_metadata::ArtifactMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// モデルの重みをバイト列へ記録（f32精度）
pub fn encode_weights<B: Backend>(model: SkinLesionClassifier<B>) -> Result<Vec<u8>, ArtifactError> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    recorder
        .record(model.into_record(), ())
        .map_err(|e| ArtifactError::Record(format!("{e:?}")))
}

/// 保存先パス（`.gz` で終わらなければ `.tar.gz` を付ける）
pub fn artifact_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 書き込みに失敗した場合は途中までのファイルを削除します。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ArtifactMetadata,
    model_binary: &[u8],
) -> Result<PathBuf, ArtifactError> {
    let tar_gz_path = artifact_path(output_path);
    let io_err = |source| ArtifactError::Io {
        path: tar_gz_path.clone(),
        source,
    };

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let json_str = metadata.to_json_string()?;

    let result = write_archive(&tar_gz_path, json_str.as_bytes(), model_binary).map_err(io_err);
    if result.is_err() {
        std::fs::remove_file(&tar_gz_path).ok();
    }
    result?;

    info!("モデルを保存しました: {}", tar_gz_path.display());
    Ok(tar_gz_path)
}

fn write_archive(path: &Path, metadata_json: &[u8], model_binary: &[u8]) -> std::io::Result<()> {
    let tar_gz_file = File::create(path)?;
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    for (name, bytes) in [(METADATA_ENTRY, metadata_json), (MODEL_ENTRY, model_binary)] {
        let mut header = tar::Header::new_gnu();
        header.set_path(name)?;
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar_builder.append(&header, bytes)?;
    }

    let encoder = tar_builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>, ModelLoadError> {
    if !tar_gz_path.exists() {
        return Err(ModelLoadError::NotFound {
            path: tar_gz_path.to_path_buf(),
        });
    }
    let tar_gz_file = File::open(tar_gz_path).map_err(|source| ModelLoadError::Archive {
        path: tar_gz_path.to_path_buf(),
        source,
    })?;
    Ok(Archive::new(GzDecoder::new(tar_gz_file)))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ArtifactMetadata, ModelLoadError> {
    let archive_err = |source| ModelLoadError::Archive {
        path: tar_gz_path.to_path_buf(),
        source,
    };
    let mut archive = open_archive(tar_gz_path)?;

    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let is_metadata = entry.path().map_err(archive_err)?.to_str() == Some(METADATA_ENTRY);
        if is_metadata {
            let mut json_str = String::new();
            entry.read_to_string(&mut json_str).map_err(archive_err)?;
            return Ok(ArtifactMetadata::from_json_string(&json_str)?);
        }
    }

    Err(ModelLoadError::MissingEntry {
        entry: METADATA_ENTRY,
    })
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(
    tar_gz_path: &Path,
) -> Result<(ArtifactMetadata, Vec<u8>), ModelLoadError> {
    let archive_err = |source| ModelLoadError::Archive {
        path: tar_gz_path.to_path_buf(),
        source,
    };
    let mut archive = open_archive(tar_gz_path)?;

    let mut metadata_opt: Option<ArtifactMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let name = entry
            .path()
            .map_err(archive_err)?
            .to_str()
            .map(str::to_owned);

        match name.as_deref() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str).map_err(archive_err)?;
                metadata_opt = Some(ArtifactMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer).map_err(archive_err)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(ModelLoadError::MissingEntry {
            entry: METADATA_ENTRY,
        }),
        (_, None) => Err(ModelLoadError::MissingEntry { entry: MODEL_ENTRY }),
    }
}

/// メタデータをログに出力
pub fn print_metadata_info(metadata: &ArtifactMetadata) {
    info!("=== モデルメタデータ ===");
    info!("形式バージョン: {}", metadata.format_version);
    info!("クラス: {}", metadata.class_codes.join(", "));
    info!(
        "モデル入力サイズ: {}x{}",
        metadata.architecture.image_size, metadata.architecture.image_size
    );
    info!(
        "前処理: rescale={} rotation=±{}° zoom=±{} shift=±{}/±{}",
        metadata.preprocess.rescale,
        metadata.preprocess.rotation_range_deg,
        metadata.preprocess.zoom_range,
        metadata.preprocess.width_shift_range,
        metadata.preprocess.height_shift_range
    );
    info!(
        "正則化: dropout={} l1={} l2={}",
        metadata.architecture.dropout, metadata.regularization.l1, metadata.regularization.l2
    );
    info!(
        "学習: epochs={} batch={} lr={} (Adamax β1={} β2={} ε={})",
        metadata.optimizer.num_epochs,
        metadata.optimizer.batch_size,
        metadata.optimizer.learning_rate,
        metadata.optimizer.adamax.beta_1,
        metadata.optimizer.adamax.beta_2,
        metadata.optimizer.adamax.epsilon
    );
    for record in &metadata.training_log {
        info!(
            "  エポック {:>2}: loss={:.4} acc={:.4} val_loss={:.4} val_acc={:.4} lr={:.2e}",
            record.epoch,
            record.train_loss,
            record.train_accuracy,
            record.val_loss,
            record.val_accuracy,
            record.learning_rate
        );
    }
    if let Some(evaluation) = &metadata.evaluation {
        evaluation.log();
    }
    info!("学習日時: {}", metadata.trained_at);
    info!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::model_metadata::tests::sample_metadata;

    #[test]
    fn test_save_then_load_restores_entries() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = sample_metadata();
        let path = save_model_with_metadata(&dir.path().join("nested/model"), &metadata, b"weights")
            .unwrap();
        assert!(path.to_string_lossy().ends_with("model.tar.gz"));

        let (loaded, binary) = load_model_with_metadata(&path).unwrap();
        assert_eq!(binary, b"weights");
        assert_eq!(loaded.class_codes, metadata.class_codes);
        assert_eq!(load_metadata(&path).unwrap().trained_at, metadata.trained_at);
    }

    #[test]
    fn test_missing_artifact_is_not_found() {
        let err = load_metadata(Path::new("/nonexistent/model.tar.gz")).unwrap_err();
        assert!(matches!(err, ModelLoadError::NotFound { .. }));
    }

    #[test]
    fn test_archive_without_weights_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.tar.gz");
        let json = sample_metadata().to_json_string().unwrap();

        let file = File::create(&path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_path(METADATA_ENTRY).unwrap();
        header.set_size(json.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, json.as_bytes()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        assert!(matches!(
            load_model_with_metadata(&path),
            Err(ModelLoadError::MissingEntry { entry: "model.bin" })
        ));
    }

    #[test]
    fn test_garbage_file_is_an_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tar.gz");
        std::fs::write(&path, b"not a tarball").unwrap();
        assert!(matches!(
            load_model_with_metadata(&path),
            Err(ModelLoadError::Archive { .. })
        ));
    }
}
