//! 皮膚病変画像の8クラス分類
//!
//! - 学習: 表形式ピクセルCSVと非がん画像ディレクトリからデータセットを組み立て、CNNを学習
//! - 推論: 学習済みアーティファクトを読み込み、HTTP経由で画像ごとに分類

pub mod api;
pub mod csv_loader;
pub mod error;
pub mod logging;
pub mod ml;
pub mod model;
pub mod service;
pub mod taxonomy;

pub use api::create_router;
pub use error::{
    ConfigurationError, DataIntegrityError, ImageDecodeError, InferenceError, ModelLoadError,
    ServiceError, StatusSignal, TrainingError,
};
pub use model::config::AppConfig;
pub use service::{InferenceService, ModelContext, ServiceSettings};
pub use taxonomy::{LesionClass, Severity};
