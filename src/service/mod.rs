//! 推論サービス
//!
//! 読み込み済みモデルを1つだけ保持し、画像ごとのリクエストに並行して応答します。
//! モデルの差し替えは `Arc` の入れ替えで行い、処理中のリクエストは古いモデルのまま完了します。

pub mod upload;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{InferenceError, ModelLoadError, ServiceError};
use crate::ml::augment::Augmentor;
use crate::ml::image_io;
use crate::ml::inference::{InferenceEngine, LesionPredictor};
use crate::model::config::AppConfig;
use crate::taxonomy::{taxonomy, LesionClass, Severity, TaxonomyEntry, NUM_CLASSES};

use upload::{content_type_for, extension_of, sanitize_filename, UploadStore};

/// サービス設定
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub model_path: PathBuf,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    /// 小文字の拡張子
    pub allowed_extensions: Vec<String>,
    pub request_timeout: Duration,
}

impl ServiceSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model_path: config.model.model_path.clone(),
            upload_dir: config.serving.upload_dir.clone(),
            max_upload_bytes: config.serving.max_upload_bytes,
            allowed_extensions: config
                .serving
                .allowed_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            request_timeout: Duration::from_millis(config.serving.request_timeout_ms),
        }
    }

    fn invalid_type_message(&self) -> String {
        let allowed: Vec<String> = self
            .allowed_extensions
            .iter()
            .map(|e| e.to_ascii_uppercase())
            .collect();
        format!("Invalid file type. Allowed types: {}", allowed.join(", "))
    }
}

/// 読み込み済みモデルと、それに対応する推論用前処理
pub struct ModelContext {
    predictor: Arc<dyn LesionPredictor>,
    augmentor: Augmentor,
    source: Option<PathBuf>,
    loaded_at: DateTime<Local>,
}

impl ModelContext {
    pub fn new(
        predictor: Arc<dyn LesionPredictor>,
        augmentor: Augmentor,
        source: Option<PathBuf>,
    ) -> Self {
        Self {
            predictor,
            augmentor,
            source,
            loaded_at: Local::now(),
        }
    }

    /// アーティファクトから読み込む（前処理はアーティファクトの記録値を使う）
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let engine = InferenceEngine::load(path)?;
        let augmentor = engine.serve_augmentor();
        Ok(Self::new(
            Arc::new(engine),
            augmentor,
            Some(path.to_path_buf()),
        ))
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn loaded_at(&self) -> DateTime<Local> {
        self.loaded_at
    }

    /// デコード → 前処理 → 順伝播
    fn classify(&self, bytes: &[u8]) -> Result<PredictionResult, ServiceError> {
        let pixels = image_io::decode_bytes(bytes, self.augmentor.image_size())?;
        let input = self.augmentor.apply_deterministic(&pixels);
        let probabilities = self.predictor.predict(&input)?;
        Ok(PredictionResult::from_distribution(&probabilities)?)
    }
}

/// 1枚の画像に対する分類結果
#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    pub diagnosis_class: usize,
    pub diagnosis: &'static str,
    pub confidence: f32,
    pub severity: Severity,
    pub description: &'static str,
    pub recommendation: &'static str,
    /// クラス名 → 確率
    pub probabilities: BTreeMap<&'static str, f32>,
    /// ID順の確率分布
    pub distribution: Vec<f32>,
}

impl PredictionResult {
    /// 8クラスの確率分布から結果を作る（同率なら小さいID）
    pub fn from_distribution(probabilities: &[f32]) -> Result<Self, InferenceError> {
        if probabilities.len() != NUM_CLASSES {
            return Err(InferenceError::OutputShape {
                expected: NUM_CLASSES,
                found: probabilities.len(),
            });
        }
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(InferenceError::NonFinite);
        }

        let (best_id, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });
        let class = LesionClass::from_id(best_id).ok_or(InferenceError::OutputShape {
            expected: NUM_CLASSES,
            found: best_id + 1,
        })?;

        let by_name = LesionClass::ALL
            .iter()
            .zip(probabilities)
            .map(|(c, p)| (c.name(), *p))
            .collect();

        Ok(Self {
            diagnosis_class: class.id(),
            diagnosis: class.name(),
            confidence,
            severity: class.severity(),
            description: class.description(),
            recommendation: class.recommendation(),
            probabilities: by_name,
            distribution: probabilities.to_vec(),
        })
    }
}

/// 保存済み画像の情報
#[derive(Debug, Clone, Serialize)]
pub struct StoredImage {
    pub filename: String,
    pub original_filename: String,
    pub url: String,
    pub upload_time: String,
}

/// 分析レスポンス
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResponse {
    pub success: bool,
    #[serde(flatten)]
    pub prediction: PredictionResult,
    pub image: StoredImage,
}

/// ヘルスチェック結果
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub model_loaded: bool,
    /// 現在のモデルを読み込んだ時刻
    pub model_loaded_at: Option<String>,
    pub timestamp: String,
    pub version: &'static str,
}

/// アップロードされたファイル
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// 推論サービス本体
pub struct InferenceService {
    settings: ServiceSettings,
    store: UploadStore,
    context: RwLock<Option<Arc<ModelContext>>>,
}

impl InferenceService {
    /// モデル未読み込みの状態で作成
    pub fn new(settings: ServiceSettings) -> Self {
        let store = UploadStore::new(settings.upload_dir.clone());
        Self {
            settings,
            store,
            context: RwLock::new(None),
        }
    }

    /// 設定のモデルパスから読み込みを試みて作成
    ///
    /// 読み込みに失敗しても縮退モードで起動します。
    pub async fn start(settings: ServiceSettings) -> Self {
        let service = Self::new(settings);
        if let Err(e) = service.store.ensure_dir().await {
            warn!(
                "アップロードディレクトリを作成できません {}: {}",
                service.store.dir().display(),
                e
            );
        }
        if let Err(e) = service.reload().await {
            error!("モデルを読み込めませんでした。縮退モードで起動します: {}", e);
        }
        service
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// 現在のモデルコンテキスト
    pub fn current(&self) -> Option<Arc<ModelContext>> {
        self.context
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.current().is_some()
    }

    /// モデルコンテキストを差し替える
    pub fn install(&self, context: ModelContext) {
        let mut slot = self
            .context
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(Arc::new(context));
    }

    /// 設定のモデルパスから再読み込み
    pub async fn reload(&self) -> Result<(), ModelLoadError> {
        let path = self.settings.model_path.clone();
        self.reload_from(path).await
    }

    /// 指定パスから再読み込み（失敗時は現在のモデルを維持）
    pub async fn reload_from(&self, path: PathBuf) -> Result<(), ModelLoadError> {
        let display_path = path.display().to_string();
        let loaded = tokio::task::spawn_blocking(move || ModelContext::load(&path))
            .await
            .map_err(|e| ModelLoadError::Weights(format!("loader task failed: {e}")))?;

        match loaded {
            Ok(context) => {
                self.install(context);
                info!("モデルを読み込みました: {}", display_path);
                Ok(())
            }
            Err(e) => {
                warn!("モデルの読み込みに失敗しました {}: {}", display_path, e);
                Err(e)
            }
        }
    }

    pub fn health(&self) -> HealthReport {
        let context = self.current();
        let model_loaded = context.is_some();
        HealthReport {
            status: if model_loaded { "healthy" } else { "degraded" },
            model_loaded,
            model_loaded_at: context.map(|c| c.loaded_at().to_rfc3339()),
            timestamp: Local::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn classifications(&self) -> Vec<TaxonomyEntry> {
        taxonomy()
    }

    /// 保存済み画像を取得（バイト列とContent-Type）
    pub async fn image(&self, filename: &str) -> Result<(Vec<u8>, &'static str), ServiceError> {
        let bytes = self.store.read(filename).await.ok_or(ServiceError::NotFound)?;
        Ok((bytes, content_type_for(filename)))
    }

    /// 画像を分析
    ///
    /// 検証 → 保存 → デコード・推論（タイムアウト付き）の順に処理し、
    /// 保存後に失敗した場合は保存したファイルを削除します。
    pub async fn analyze(&self, upload: Upload) -> Result<AnalysisResponse, ServiceError> {
        let context = self.current().ok_or(ServiceError::Unavailable)?;

        if upload.filename.is_empty() {
            return Err(ServiceError::Validation("No file selected.".to_string()));
        }
        if upload.bytes.len() > self.settings.max_upload_bytes {
            return Err(ServiceError::PayloadTooLarge {
                limit: self.settings.max_upload_bytes,
            });
        }
        let extension = extension_of(&upload.filename)
            .filter(|ext| self.settings.allowed_extensions.contains(ext))
            .ok_or_else(|| ServiceError::Validation(self.settings.invalid_type_message()))?;

        let original_filename = sanitize_filename(&upload.filename);
        let stored = self.store.save(&extension, &upload.bytes).await?;
        info!("ファイルを保存しました: {}", stored.filename());

        let bytes = upload.bytes;
        let task = tokio::task::spawn_blocking(move || context.classify(&bytes));
        let prediction = match tokio::time::timeout(self.settings.request_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(InferenceError::Worker(join_error.to_string()).into()),
            Err(_) => Err(InferenceError::Timeout(self.settings.request_timeout).into()),
        };
        let prediction = prediction.map_err(|e| {
            warn!("分析に失敗しました {}: {}", stored.filename(), e);
            e
        })?;

        let filename = stored.commit();
        Ok(AnalysisResponse {
            success: true,
            prediction,
            image: StoredImage {
                url: format!("/api/images/{filename}"),
                filename,
                original_filename,
                upload_time: Local::now().to_rfc3339(),
            },
        })
    }
}
