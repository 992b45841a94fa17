//! モデルメタデータから推論用の設定を取り出す

use crate::error::ModelLoadError;
use crate::ml::augment::Augmentor;
use crate::ml::ml_model::ModelConfig;
use crate::model::config::PreprocessSettings;
use crate::model::model_metadata::ArtifactMetadata;

/// 推論に必要な情報
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// クラスコード（ID順）
    pub class_codes: Vec<String>,

    /// 学習時の前処理設定
    pub preprocess: PreprocessSettings,

    /// ネットワーク構成
    pub architecture: ModelConfig,

    pub trained_at: String,
}

impl InferenceConfig {
    /// 検証済みメタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ArtifactMetadata) -> Result<Self, ModelLoadError> {
        metadata.validate()?;
        Ok(Self {
            class_codes: metadata.class_codes.clone(),
            preprocess: metadata.preprocess,
            architecture: metadata.architecture.clone(),
            trained_at: metadata.trained_at.clone(),
        })
    }

    /// 学習時と同じ縮尺係数を使う推論用前処理
    pub fn serve_augmentor(&self) -> Augmentor {
        Augmentor::serve(&self.preprocess)
    }

    /// モデル入力サイズ
    pub fn input_size(&self) -> usize {
        self.architecture.image_size
    }

    pub fn num_classes(&self) -> usize {
        self.class_codes.len()
    }
}
