//! エラー型
//!
//! データ組み立て・学習・アーティファクト・推論サービスの各段階ごとに分けています。
//! 学習系は致命的（実行を中断しアーティファクトを作らない）、
//! 推論系はリクエスト単位で回復可能です。

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::taxonomy::LesionClass;

/// データセット組み立て時のエラー（その実行に対して致命的）
#[derive(Debug, Error)]
pub enum DataIntegrityError {
    #[error("Source not found: {path}")]
    MissingSource { path: PathBuf },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse CSV {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },

    #[error("Malformed row at line {line}: {reason}")]
    MalformedRow { line: u64, reason: String },

    #[error("Label {label} at line {line} is outside the tabular class range 0..=6")]
    LabelOutOfRange { line: u64, label: i64 },

    #[error("Corrupt image {path}: {source}")]
    CorruptImage {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("Class {class} has no instances")]
    EmptyClass { class: LesionClass },
}

/// 設定・ハイパーパラメータのエラー
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Dataset has {available} training instances, fewer than one batch of {batch_size}")]
    DatasetTooSmall { available: usize, batch_size: usize },

    #[error("Invalid value for {name}: {reason}")]
    InvalidHyperparameter { name: &'static str, reason: String },

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ConfigurationError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidHyperparameter {
            name,
            reason: reason.into(),
        }
    }
}

/// モデル読み込み時のエラー（サービスは縮退モードで継続）
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("Model artifact not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to read model artifact {path}: {source}")]
    Archive {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{entry} not found in model artifact")]
    MissingEntry { entry: &'static str },

    #[error("Invalid artifact metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Unsupported artifact format version {found} (expected {expected})")]
    FormatVersion { expected: u32, found: u32 },

    #[error("Artifact class space {found:?} does not match taxonomy {expected:?}")]
    ClassSpaceMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Invalid architecture in artifact: {0}")]
    Architecture(#[from] ConfigurationError),

    #[error("Failed to restore model weights: {0}")]
    Weights(String),
}

/// アップロード画像のデコードエラー
#[derive(Debug, Error)]
pub enum ImageDecodeError {
    #[error("Image is empty")]
    Empty,

    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// 前処理・順伝播中のエラー
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Model input has {found} values, expected {expected}")]
    InputShape { expected: usize, found: usize },

    #[error("Model produced {found} probabilities, expected {expected}")]
    OutputShape { expected: usize, found: usize },

    #[error("Model produced a non-finite probability")]
    NonFinite,

    #[error("Model lock poisoned by an earlier panic")]
    Poisoned,

    #[error("Inference worker failed: {0}")]
    Worker(String),

    #[error("Inference exceeded {0:?}")]
    Timeout(Duration),
}

/// アーティファクト保存時のエラー
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Failed to write artifact {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Failed to record model weights: {0}")]
    Record(String),
}

/// 学習実行全体のエラー
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Data(#[from] DataIntegrityError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Loss diverged at epoch {epoch} (train {train_loss}, validation {val_loss})")]
    DivergentLoss {
        epoch: usize,
        train_loss: f64,
        val_loss: f64,
    },

    #[error("Learning-rate policy received epoch {got} after epoch {last}")]
    EpochOutOfOrder { last: usize, got: usize },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// サービス境界のエラー
///
/// HTTPアダプタはこれを状態シグナル（400/404/413/503/500）へ変換します。
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("File exceeds the {limit} byte upload limit")]
    PayloadTooLarge { limit: usize },

    #[error("Model not loaded. Please contact administrator.")]
    Unavailable,

    #[error("Image not found")]
    NotFound,

    #[error(transparent)]
    Decode(#[from] ImageDecodeError),

    #[error("Image analysis failed: {0}")]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// サービス結果の状態シグナル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSignal {
    Success,
    ValidationRejected,
    NotFound,
    ServiceUnavailable,
    ServerError,
}

impl ServiceError {
    pub fn signal(&self) -> StatusSignal {
        match self {
            ServiceError::Validation(_)
            | ServiceError::PayloadTooLarge { .. }
            | ServiceError::Decode(_) => StatusSignal::ValidationRejected,
            ServiceError::NotFound => StatusSignal::NotFound,
            ServiceError::Unavailable | ServiceError::ModelLoad(_) => {
                StatusSignal::ServiceUnavailable
            }
            ServiceError::Inference(_) | ServiceError::Storage(_) => StatusSignal::ServerError,
        }
    }
}
