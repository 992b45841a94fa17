//! 学習ジョブ全体
//!
//! データ組み立て → 分割 → 学習 → 評価 → アーティファクト保存 を順に実行します。
//! 途中で失敗した場合アーティファクトは作られません。

use std::path::PathBuf;

use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use tracing::info;

use crate::error::TrainingError;
use crate::ml::adamax::AdamaxConfig;
use crate::ml::augment::Augmentor;
use crate::ml::dataset::DatasetAssembler;
use crate::ml::evaluation::{EvaluationReport, EvaluationReporter, Regularization};
use crate::ml::ml_model::ModelConfig;
use crate::ml::training::{EpochRecord, TrainingController};
use crate::model::config::AppConfig;
use crate::model::model_metadata::{ArtifactMetadata, OptimizerSettings};
use crate::model::model_storage::{encode_weights, save_model_with_metadata};

/// 学習ジョブの結果
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub artifact_path: PathBuf,
    pub history: Vec<EpochRecord>,
    pub report: EvaluationReport,
}

/// 設定に従って学習ジョブを実行
pub fn run_training<B: AutodiffBackend>(
    config: &AppConfig,
    device: B::Device,
    observer: impl FnMut(&EpochRecord),
) -> Result<TrainingOutcome, TrainingError> {
    config.validate()?;

    let model_config = ModelConfig::new()
        .with_dropout(config.model.dropout)
        .with_image_size(config.preprocess.image_size);
    model_config.validate()?;
    let regularization = Regularization::from(&config.model);

    let dataset = DatasetAssembler::new(&config.data, config.preprocess.image_size).assemble()?;
    let split = dataset.split(config.data.test_ratio, config.data.split_seed);
    info!(
        "分割: 学習 {} 件 / テスト {} 件 (seed {})",
        split.train.len(),
        split.test.len(),
        config.data.split_seed
    );

    let model = model_config.init::<B>(&device)?;
    let trained = TrainingController::<B>::new(
        config.training.clone(),
        config.preprocess,
        regularization,
        device.clone(),
    )
    .with_observer(observer)
    .fit(model, &dataset, &split)?;

    let model = trained.model.valid();
    let report = EvaluationReporter::new(
        &model,
        Augmentor::serve(&config.preprocess),
        config.training.batch_size,
        regularization,
        device,
    )
    .report(&dataset, &split, &trained.history);
    report.log();

    let metadata = ArtifactMetadata::new(
        config.preprocess,
        model_config,
        regularization,
        OptimizerSettings {
            adamax: AdamaxConfig::new(),
            learning_rate: config.training.learning_rate,
            plateau: config.training.plateau,
            batch_size: config.training.batch_size,
            num_epochs: config.training.num_epochs,
        },
        trained.history.clone(),
        Some(report.clone()),
    );

    let binary = encode_weights(model)?;
    let artifact_path = save_model_with_metadata(&config.model.model_path, &metadata, &binary)?;

    Ok(TrainingOutcome {
        artifact_path,
        history: trained.history,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataIntegrityError;
    use crate::ml::inference::InferenceEngine;
    use crate::model::config::{DataSettings, TrainingSettings};
    use burn::backend::{Autodiff, NdArray};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Write;
    use std::path::Path;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn write_sources(dir: &Path) -> DataSettings {
        let csv_path = dir.join("hmnist_28_28_RGB.csv");
        let mut csv = std::fs::File::create(&csv_path).unwrap();
        let n = 28 * 28 * 3;
        let header: Vec<String> = (0..n).map(|i| format!("pixel{i:04}")).collect();
        writeln!(csv, "{},label", header.join(",")).unwrap();
        for label in 0..7u8 {
            for k in 0..3u8 {
                let value = (label * 30 + k).to_string();
                let row = vec![value; n];
                writeln!(csv, "{},{}", row.join(","), label).unwrap();
            }
        }

        let benign = dir.join("benign");
        std::fs::create_dir(&benign).unwrap();
        for k in 0..3u8 {
            let img = RgbImage::from_pixel(40, 40, Rgb([250 - k, 240, 230]));
            DynamicImage::ImageRgb8(img)
                .save_with_format(benign.join(format!("{k}.png")), ImageFormat::Png)
                .unwrap();
        }

        DataSettings {
            tabular_csv: csv_path,
            non_cancer_dir: benign,
            ..DataSettings::default()
        }
    }

    #[test]
    fn test_run_training_writes_loadable_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.data = write_sources(dir.path());
        config.model.model_path = dir.path().join("out/model.tar.gz");
        config.training = TrainingSettings {
            num_epochs: 1,
            batch_size: 4,
            ..TrainingSettings::default()
        };

        let mut epochs = 0;
        let outcome =
            run_training::<TestBackend>(&config, Default::default(), |_| epochs += 1).unwrap();
        assert_eq!(epochs, 1);
        assert_eq!(outcome.history.len(), 1);
        assert_eq!(outcome.report.confusion_matrix.total(), 6);
        assert!(outcome.artifact_path.exists());

        let engine = InferenceEngine::load(&outcome.artifact_path).unwrap();
        let probabilities = engine.classify_pixels(&vec![128u8; 28 * 28 * 3]).unwrap();
        assert_eq!(probabilities.len(), 8);
    }

    #[test]
    fn test_missing_directory_source_produces_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.data = write_sources(dir.path());
        config.data.non_cancer_dir = dir.path().join("missing");
        config.model.model_path = dir.path().join("model.tar.gz");

        let err = run_training::<TestBackend>(&config, Default::default(), |_| {}).unwrap_err();
        assert!(matches!(
            err,
            TrainingError::Data(DataIntegrityError::MissingSource { .. })
        ));
        assert!(!config.model.model_path.exists());
    }
}
