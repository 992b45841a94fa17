//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、データソース、前処理、学習、推論サービスの設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ConfigurationError;
use crate::ml::image_io::SUPPORTED_EXTENSIONS;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 学習データソース設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// 平坦化ピクセルのCSV（HMNIST 28x28 RGB）
    pub tabular_csv: PathBuf,
    /// 非がん画像のディレクトリ
    pub non_cancer_dir: PathBuf,
    /// テストデータの割合
    pub test_ratio: f32,
    /// 分割用シード
    pub split_seed: u64,
    /// オーバーサンプリング用シード
    pub oversample_seed: u64,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            tabular_csv: PathBuf::from("hmnist_28_28_RGB.csv"),
            non_cancer_dir: PathBuf::from("melanoma_cancer_dataset/train/benign"),
            test_ratio: 0.25,
            split_seed: 49,
            oversample_seed: 42,
        }
    }
}

/// 前処理設定
///
/// 学習時と推論時の前処理はこの1つの値から作られます。
/// `rescale` は両方で共有される唯一の定数です。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PreprocessSettings {
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// ピクセル値に掛ける係数
    pub rescale: f32,
    /// 回転範囲（度）
    pub rotation_range_deg: f32,
    /// ズーム範囲（割合）
    pub zoom_range: f32,
    /// 水平シフト範囲（幅に対する割合）
    pub width_shift_range: f32,
    /// 垂直シフト範囲（高さに対する割合）
    pub height_shift_range: f32,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            image_size: 28,
            rescale: 1.0 / 255.0,
            rotation_range_deg: 10.0,
            zoom_range: 0.1,
            width_shift_range: 0.1,
            height_shift_range: 0.1,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 使用するモデルファイルのパス
    pub model_path: PathBuf,
    /// ドロップアウト率
    pub dropout: f64,
    /// 最終隠れ層のL1係数（0で無効）
    pub l1: f64,
    /// 最終隠れ層のL2係数（0で無効）
    pub l2: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/skin_lesion_classifier.tar.gz"),
            dropout: 0.2,
            l1: 0.0,
            l2: 0.0,
        }
    }
}

/// 学習率プラトー制御の設定
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PlateauSettings {
    /// 改善なしを許容するエポック数
    pub patience: usize,
    /// 減衰係数
    pub factor: f64,
    /// 学習率の下限
    pub min_lr: f64,
    /// 改善とみなす最小差分
    pub min_delta: f64,
}

impl Default for PlateauSettings {
    fn default() -> Self {
        Self {
            patience: 2,
            factor: 0.5,
            min_lr: 1e-5,
            min_delta: 1e-4,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード（シャッフル・データ拡張）
    pub seed: u64,
    /// 学習率プラトー制御
    #[serde(default)]
    pub plateau: PlateauSettings,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 25,
            batch_size: 128,
            learning_rate: 1e-3,
            seed: 42,
            plateau: PlateauSettings::default(),
        }
    }
}

/// 推論サービス設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingSettings {
    /// 待ち受けアドレス
    pub bind_addr: String,
    /// アップロード画像の保存先
    pub upload_dir: PathBuf,
    /// アップロードの最大サイズ（バイト）
    pub max_upload_bytes: usize,
    /// 受け付ける拡張子（小文字）
    pub allowed_extensions: Vec<String>,
    /// デコード＋推論のタイムアウト（ミリ秒）
    pub request_timeout_ms: u64,
}

impl Default for ServingSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:2500".to_string(),
            upload_dir: PathBuf::from("static/uploads"),
            max_upload_bytes: 10 * 1024 * 1024,
            allowed_extensions: SUPPORTED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            request_timeout_ms: 30_000,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// 学習データソース
    #[serde(default)]
    pub data: DataSettings,
    /// 前処理
    #[serde(default)]
    pub preprocess: PreprocessSettings,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
    /// 推論サービス設定
    #[serde(default)]
    pub serving: ServingSettings,
}

impl AppConfig {
    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("設定ファイルの読み込みに失敗しました: {e}");
                    warn!("デフォルト設定を使用します");
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigurationError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).map_err(|source| {
            ConfigurationError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        fs::write(path, content).map_err(|source| ConfigurationError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// ハイパーパラメータの妥当性を検証
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let t = &self.training;
        if t.num_epochs == 0 {
            return Err(ConfigurationError::invalid("num_epochs", "must be at least 1"));
        }
        if t.batch_size == 0 {
            return Err(ConfigurationError::invalid("batch_size", "must be at least 1"));
        }
        if !(t.learning_rate.is_finite() && t.learning_rate > 0.0) {
            return Err(ConfigurationError::invalid(
                "learning_rate",
                format!("{} is not a positive number", t.learning_rate),
            ));
        }
        let p = &t.plateau;
        if p.patience == 0 {
            return Err(ConfigurationError::invalid("plateau.patience", "must be at least 1"));
        }
        if !(p.factor > 0.0 && p.factor < 1.0) {
            return Err(ConfigurationError::invalid(
                "plateau.factor",
                format!("{} is outside (0, 1)", p.factor),
            ));
        }
        if !(p.min_lr >= 0.0 && p.min_lr <= t.learning_rate) {
            return Err(ConfigurationError::invalid(
                "plateau.min_lr",
                format!("{} must be within [0, learning_rate]", p.min_lr),
            ));
        }
        let ratio = self.data.test_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(ConfigurationError::invalid(
                "data.test_ratio",
                format!("{ratio} is outside (0, 1)"),
            ));
        }
        if !(self.preprocess.rescale.is_finite() && self.preprocess.rescale > 0.0) {
            return Err(ConfigurationError::invalid(
                "preprocess.rescale",
                "must be a positive number",
            ));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(ConfigurationError::invalid(
                "model.dropout",
                format!("{} is outside [0, 1)", self.model.dropout),
            ));
        }
        if self.model.l1 < 0.0 || self.model.l2 < 0.0 {
            return Err(ConfigurationError::invalid("model.l1/l2", "must not be negative"));
        }
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        info!("=== アプリケーション設定 ===");
        info!("計算デバイス: {}", self.device_type);
        info!("モデルパス: {}", self.model.model_path.display());
        info!("表形式データ: {}", self.data.tabular_csv.display());
        info!("非がん画像: {}", self.data.non_cancer_dir.display());
        info!(
            "エポック数: {}, バッチサイズ: {}, 学習率: {}",
            self.training.num_epochs, self.training.batch_size, self.training.learning_rate
        );
        info!(
            "入力サイズ: {}x{}, rescale: {}",
            self.preprocess.image_size, self.preprocess.image_size, self.preprocess.rescale
        );
    }
}
