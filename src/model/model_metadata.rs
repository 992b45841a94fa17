//! モデルアーティファクトのメタデータ
//!
//! 学習時の設定と結果を記録し、推論側はこの値だけを頼りに前処理とモデルを再構築します。

use serde::{Deserialize, Serialize};

use crate::error::ModelLoadError;
use crate::ml::adamax::AdamaxConfig;
use crate::ml::evaluation::{EvaluationReport, Regularization};
use crate::ml::ml_model::ModelConfig;
use crate::ml::training::EpochRecord;
use crate::model::config::{PlateauSettings, PreprocessSettings};
use crate::taxonomy::LesionClass;

/// 現在のアーティファクト形式
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// 学習に使ったオプティマイザ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub adamax: AdamaxConfig,
    pub learning_rate: f64,
    pub plateau: PlateauSettings,
    pub batch_size: usize,
    pub num_epochs: usize,
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub format_version: u32,

    /// クラスコード（ID順）
    pub class_codes: Vec<String>,

    /// 前処理設定（縮尺係数を含む）
    pub preprocess: PreprocessSettings,

    pub architecture: ModelConfig,

    pub regularization: Regularization,

    pub optimizer: OptimizerSettings,

    /// エポックごとの学習記録
    #[serde(default)]
    pub training_log: Vec<EpochRecord>,

    #[serde(default)]
    pub evaluation: Option<EvaluationReport>,

    /// 学習時刻（RFC 3339）
    pub trained_at: String,
}

impl ArtifactMetadata {
    /// 新しいメタデータを作成（クラスコードと学習時刻は自動設定）
    pub fn new(
        preprocess: PreprocessSettings,
        architecture: ModelConfig,
        regularization: Regularization,
        optimizer: OptimizerSettings,
        training_log: Vec<EpochRecord>,
        evaluation: Option<EvaluationReport>,
    ) -> Self {
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            class_codes: LesionClass::canonical_codes(),
            preprocess,
            architecture,
            regularization,
            optimizer,
            training_log,
            evaluation,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// 推論に使えるかを検証
    pub fn validate(&self) -> Result<(), ModelLoadError> {
        if self.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ModelLoadError::FormatVersion {
                expected: ARTIFACT_FORMAT_VERSION,
                found: self.format_version,
            });
        }
        let expected = LesionClass::canonical_codes();
        if self.class_codes != expected {
            return Err(ModelLoadError::ClassSpaceMismatch {
                expected,
                found: self.class_codes.clone(),
            });
        }
        self.architecture.validate()?;
        if self.preprocess.image_size != self.architecture.image_size {
            return Err(ModelLoadError::Architecture(
                crate::error::ConfigurationError::invalid(
                    "preprocess.image_size",
                    format!(
                        "{} differs from the network input size {}",
                        self.preprocess.image_size, self.architecture.image_size
                    ),
                ),
            ));
        }
        Ok(())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_metadata() -> ArtifactMetadata {
        ArtifactMetadata::new(
            PreprocessSettings::default(),
            ModelConfig::new(),
            Regularization { l1: 0.01, l2: 0.01 },
            OptimizerSettings {
                adamax: AdamaxConfig::new(),
                learning_rate: 1e-3,
                plateau: PlateauSettings::default(),
                batch_size: 128,
                num_epochs: 25,
            },
            Vec::new(),
            None,
        )
    }

    #[test]
    fn test_new_metadata_is_valid() {
        let metadata = sample_metadata();
        assert_eq!(metadata.class_codes.len(), 8);
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn test_json_keeps_rescale() {
        let mut metadata = sample_metadata();
        metadata.preprocess.rescale = 0.5;
        let json = metadata.to_json_string().unwrap();
        let parsed = ArtifactMetadata::from_json_string(&json).unwrap();
        assert_eq!(parsed.preprocess.rescale, 0.5);
        assert_eq!(parsed.architecture, metadata.architecture);
    }

    #[test]
    fn test_reordered_classes_are_rejected() {
        let mut metadata = sample_metadata();
        metadata.class_codes.swap(0, 7);
        assert!(matches!(
            metadata.validate(),
            Err(ModelLoadError::ClassSpaceMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_format_version_is_rejected() {
        let mut metadata = sample_metadata();
        metadata.format_version = 99;
        assert!(matches!(
            metadata.validate(),
            Err(ModelLoadError::FormatVersion { expected: 1, found: 99 })
        ));
    }

    #[test]
    fn test_mismatched_input_size_is_rejected() {
        let mut metadata = sample_metadata();
        metadata.preprocess.image_size = 32;
        assert!(matches!(
            metadata.validate(),
            Err(ModelLoadError::Architecture(_))
        ));
    }
}
