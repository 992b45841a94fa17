//! モデル推論機能

use std::path::Path;
use std::sync::Mutex;

use burn::{
    backend::NdArray,
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::Tensor,
};
use tracing::info;

use crate::error::{InferenceError, ModelLoadError};
use crate::ml::augment::Augmentor;
use crate::ml::ml_model::SkinLesionClassifier;
use crate::model::{load_model_with_metadata, ArtifactMetadata, InferenceConfig};
use crate::taxonomy::NUM_CLASSES;

/// 推論用バックエンド（CPU）
pub type InferenceBackend = NdArray<f32>;

/// 前処理済み入力から8クラスの確率分布を返す予測器
pub trait LesionPredictor: Send + Sync {
    /// `input` は (C, H, W) 順の1枚分
    fn predict(&self, input: &[f32]) -> Result<Vec<f32>, InferenceError>;
}

/// 推論エンジン
///
/// 順伝播はモデル単位のロックで直列化されます。
pub struct InferenceEngine {
    model: Mutex<SkinLesionClassifier<InferenceBackend>>,
    config: InferenceConfig,
    device: <InferenceBackend as burn::tensor::backend::Backend>::Device,
}

impl InferenceEngine {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self, ModelLoadError> {
        let (metadata, model_binary) = load_model_with_metadata(model_path.as_ref())?;
        let engine = Self::from_parts(&metadata, model_binary)?;
        info!(
            "モデルを読み込みました: {} (学習日時 {})",
            model_path.as_ref().display(),
            engine.config.trained_at
        );
        Ok(engine)
    }

    /// メタデータと重みバイナリから初期化
    pub fn from_parts(
        metadata: &ArtifactMetadata,
        model_binary: Vec<u8>,
    ) -> Result<Self, ModelLoadError> {
        let config = InferenceConfig::from_metadata(metadata)?;
        let device = Default::default();

        // 推論時はドロップアウトなし
        let model = config
            .architecture
            .clone()
            .with_dropout(0.0)
            .init::<InferenceBackend>(&device)?;

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(model_binary, &device)
            .map_err(|e| ModelLoadError::Weights(format!("{e:?}")))?;
        let model = model.load_record(record);

        Ok(Self {
            model: Mutex::new(model),
            config,
            device,
        })
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// 学習時の設定で作った推論用前処理
    pub fn serve_augmentor(&self) -> Augmentor {
        self.config.serve_augmentor()
    }

    /// HWC順の `u8` ピクセルを前処理して分類
    pub fn classify_pixels(&self, pixels: &[u8]) -> Result<Vec<f32>, InferenceError> {
        let input = self.serve_augmentor().apply_deterministic(pixels);
        self.predict(&input)
    }
}

impl LesionPredictor for InferenceEngine {
    fn predict(&self, input: &[f32]) -> Result<Vec<f32>, InferenceError> {
        let size = self.config.input_size();
        let expected = 3 * size * size;
        if input.len() != expected {
            return Err(InferenceError::InputShape {
                expected,
                found: input.len(),
            });
        }

        let tensor = Tensor::<InferenceBackend, 1>::from_floats(input, &self.device)
            .reshape([1, 3, size, size]);

        let probabilities = {
            let model = self.model.lock().map_err(|_| InferenceError::Poisoned)?;
            model.forward_probabilities(tensor)
        };

        let values: Vec<f32> = probabilities.into_data().iter::<f32>().collect();
        if values.len() != NUM_CLASSES {
            return Err(InferenceError::OutputShape {
                expected: NUM_CLASSES,
                found: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(InferenceError::NonFinite);
        }
        Ok(values)
    }
}
