//! モデルアーティファクトの確認ツール
//!
//! メタデータを表示し、画像が指定されていれば分類結果も表示します。

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use dermascan::logging;
use dermascan::ml::image_io;
use dermascan::ml::InferenceEngine;
use dermascan::model::{load_metadata, print_metadata_info, InferenceConfig};
use dermascan::service::PredictionResult;

#[derive(Parser, Debug)]
#[command(version, about = "Show model artifact metadata and optionally classify images")]
struct Args {
    /// モデルアーティファクト
    model: PathBuf,

    /// 分類する画像
    #[arg(short, long)]
    image: Vec<PathBuf>,
}

fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let metadata = load_metadata(&args.model)
        .with_context(|| format!("メタデータを読み込めません: {}", args.model.display()))?;
    print_metadata_info(&metadata);

    let config = InferenceConfig::from_metadata(&metadata).context("メタデータが不正です")?;
    info!(
        "推論設定: 入力 {}x{}, {} クラス, 縮尺係数 {}",
        config.input_size(),
        config.input_size(),
        config.num_classes(),
        config.preprocess.rescale
    );

    if args.image.is_empty() {
        return Ok(());
    }

    let engine = InferenceEngine::load(&args.model).context("モデルを読み込めません")?;
    let size = engine.config().input_size();
    for path in &args.image {
        let pixels = image_io::load_file(path, size)
            .with_context(|| format!("画像を読み込めません: {}", path.display()))?;
        let probabilities = engine.classify_pixels(&pixels)?;
        let result = PredictionResult::from_distribution(&probabilities)?;
        info!(
            "{}: {} (class {}, confidence {:.3}, severity {})",
            path.display(),
            result.diagnosis,
            result.diagnosis_class,
            result.confidence,
            result.severity
        );
    }
    Ok(())
}
