//! 学習後の評価
//!
//! 損失・精度の集計、ベストエポックの特定、8x8混同行列とクラス別再現率を提供します。

use std::fmt;

use burn::data::dataloader::DataLoaderBuilder;
use burn::tensor::{backend::Backend, ElementConversion};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ml::augment::Augmentor;
use crate::ml::dataset::{LesionBatcher, LesionDataset, PartitionDataset, Split};
use crate::ml::ml_model::SkinLesionClassifier;
use crate::ml::training::EpochRecord;
use crate::model::config::ModelSettings;
use crate::taxonomy::{LesionClass, NUM_CLASSES};

/// L1/L2 正則化係数
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Regularization {
    pub l1: f64,
    pub l2: f64,
}

impl From<&ModelSettings> for Regularization {
    fn from(settings: &ModelSettings) -> Self {
        Self {
            l1: settings.l1,
            l2: settings.l2,
        }
    }
}

/// 1パーティションの評価結果
#[derive(Debug, Clone)]
pub struct PartitionMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub predictions: Vec<usize>,
    pub targets: Vec<usize>,
}

/// 推論用ポリシーでパーティション全体を評価
///
/// 損失は平均交差エントロピーに正則化項を加えた値です。
pub fn evaluate_partition<B: Backend>(
    model: &SkinLesionClassifier<B>,
    partition: PartitionDataset,
    augmentor: Augmentor,
    batch_size: usize,
    regularization: Regularization,
    device: &B::Device,
) -> PartitionMetrics {
    let batcher = LesionBatcher::<B>::new(device.clone(), augmentor, 0);
    let loader = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .num_workers(0)
        .build(partition);

    let mut loss_sum = 0.0f64;
    let mut predictions = Vec::new();
    let mut targets = Vec::new();

    for batch in loader.iter() {
        let batch_len = batch.targets.dims()[0];
        let output = model.forward_classification(batch.images, batch.targets);
        let loss: f64 = output.loss.into_scalar().elem();
        loss_sum += loss * batch_len as f64;

        let predicted = output.output.argmax(1).reshape([batch_len]);
        predictions.extend(predicted.into_data().iter::<i64>().map(|v| v as usize));
        targets.extend(output.targets.into_data().iter::<i64>().map(|v| v as usize));
    }

    let total = targets.len();
    let correct = predictions
        .iter()
        .zip(&targets)
        .filter(|(p, t)| p == t)
        .count();
    let penalty: f64 = model
        .regularization_penalty(regularization.l1, regularization.l2)
        .into_scalar()
        .elem();

    let (loss, accuracy) = if total == 0 {
        (f64::NAN, f64::NAN)
    } else {
        (
            loss_sum / total as f64 + penalty,
            correct as f64 / total as f64,
        )
    };

    PartitionMetrics {
        loss,
        accuracy,
        predictions,
        targets,
    }
}

/// 混同行列（行=正解ID、列=予測ID）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: [[usize; NUM_CLASSES]; NUM_CLASSES],
}

impl ConfusionMatrix {
    /// 予測と正解のIDの組から作成（範囲外のIDは無視）
    pub fn from_pairs(targets: &[usize], predictions: &[usize]) -> Self {
        let mut counts = [[0usize; NUM_CLASSES]; NUM_CLASSES];
        for (&t, &p) in targets.iter().zip(predictions) {
            if t < NUM_CLASSES && p < NUM_CLASSES {
                counts[t][p] += 1;
            }
        }
        Self { counts }
    }

    pub fn get(&self, actual: LesionClass, predicted: LesionClass) -> usize {
        self.counts[actual.id()][predicted.id()]
    }

    pub fn rows(&self) -> &[[usize; NUM_CLASSES]; NUM_CLASSES] {
        &self.counts
    }

    /// 各行の合計（= 正解ラベルごとの件数）
    pub fn row_sums(&self) -> [usize; NUM_CLASSES] {
        let mut sums = [0usize; NUM_CLASSES];
        for (sum, row) in sums.iter_mut().zip(&self.counts) {
            *sum = row.iter().sum();
        }
        sums
    }

    pub fn total(&self) -> usize {
        self.row_sums().iter().sum()
    }

    /// クラス別再現率（正解が0件のクラスは `None`）
    pub fn per_class_recall(&self) -> [Option<f64>; NUM_CLASSES] {
        let sums = self.row_sums();
        let mut recall = [None; NUM_CLASSES];
        for (i, r) in recall.iter_mut().enumerate() {
            if sums[i] > 0 {
                *r = Some(self.counts[i][i] as f64 / sums[i] as f64);
            }
        }
        recall
    }

    /// クラス別適合率（予測が0件のクラスは `None`）
    pub fn per_class_precision(&self) -> [Option<f64>; NUM_CLASSES] {
        let mut precision = [None; NUM_CLASSES];
        for (j, p) in precision.iter_mut().enumerate() {
            let predicted: usize = self.counts.iter().map(|row| row[j]).sum();
            if predicted > 0 {
                *p = Some(self.counts[j][j] as f64 / predicted as f64);
            }
        }
        precision
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>7}", "")?;
        for class in LesionClass::ALL {
            write!(f, "{:>7}", class.code())?;
        }
        writeln!(f)?;
        for class in LesionClass::ALL {
            write!(f, "{:>7}", class.code())?;
            for count in &self.counts[class.id()] {
                write!(f, "{count:>7}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// 損失と精度
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossAccuracy {
    pub loss: f64,
    pub accuracy: f64,
}

impl From<&PartitionMetrics> for LossAccuracy {
    fn from(metrics: &PartitionMetrics) -> Self {
        Self {
            loss: metrics.loss,
            accuracy: metrics.accuracy,
        }
    }
}

/// 検証損失が最小のエポック（1始まり、同値なら早い方）
pub fn best_epoch_by_val_loss(history: &[EpochRecord]) -> Option<usize> {
    history
        .iter()
        .filter(|r| r.val_loss.is_finite())
        .fold(None::<&EpochRecord>, |best, r| match best {
            Some(b) if b.val_loss <= r.val_loss => Some(b),
            _ => Some(r),
        })
        .map(|r| r.epoch)
}

/// 検証精度が最大のエポック（1始まり、同値なら早い方）
pub fn best_epoch_by_val_accuracy(history: &[EpochRecord]) -> Option<usize> {
    history
        .iter()
        .filter(|r| r.val_accuracy.is_finite())
        .fold(None::<&EpochRecord>, |best, r| match best {
            Some(b) if b.val_accuracy >= r.val_accuracy => Some(b),
            _ => Some(r),
        })
        .map(|r| r.epoch)
}

/// 評価レポート（アーティファクトにも記録される）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub train: LossAccuracy,
    pub test: LossAccuracy,
    pub best_epoch_by_val_loss: Option<usize>,
    pub best_epoch_by_val_accuracy: Option<usize>,
    pub confusion_matrix: ConfusionMatrix,
    pub per_class_recall: [Option<f64>; NUM_CLASSES],
    pub per_class_precision: [Option<f64>; NUM_CLASSES],
}

impl EvaluationReport {
    /// ログへ出力
    pub fn log(&self) {
        info!("=== 評価結果 ===");
        info!(
            "学習: loss={:.4} accuracy={:.4}",
            self.train.loss, self.train.accuracy
        );
        info!(
            "テスト: loss={:.4} accuracy={:.4}",
            self.test.loss, self.test.accuracy
        );
        if let Some(epoch) = self.best_epoch_by_val_loss {
            info!("検証損失が最小のエポック: {}", epoch);
        }
        if let Some(epoch) = self.best_epoch_by_val_accuracy {
            info!("検証精度が最大のエポック: {}", epoch);
        }
        info!("混同行列（行=正解, 列=予測）:\n{}", self.confusion_matrix);
        for class in LesionClass::ALL {
            let fmt_opt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"));
            info!(
                "  {:>5}: recall={} precision={}",
                class.code(),
                fmt_opt(self.per_class_recall[class.id()]),
                fmt_opt(self.per_class_precision[class.id()])
            );
        }
    }
}

/// 評価レポート作成
pub struct EvaluationReporter<'a, B: Backend> {
    model: &'a SkinLesionClassifier<B>,
    augmentor: Augmentor,
    batch_size: usize,
    regularization: Regularization,
    device: B::Device,
}

impl<'a, B: Backend> EvaluationReporter<'a, B> {
    /// `augmentor` は推論用ポリシーであること
    pub fn new(
        model: &'a SkinLesionClassifier<B>,
        augmentor: Augmentor,
        batch_size: usize,
        regularization: Regularization,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            augmentor,
            batch_size,
            regularization,
            device,
        }
    }

    /// 学習・テスト両パーティションを評価し、学習履歴と合わせてレポートを作る
    pub fn report(
        &self,
        dataset: &LesionDataset,
        split: &Split,
        history: &[EpochRecord],
    ) -> EvaluationReport {
        let train = self.evaluate(dataset.partition(&split.train));
        let test = self.evaluate(dataset.partition(&split.test));
        let confusion_matrix = ConfusionMatrix::from_pairs(&test.targets, &test.predictions);

        EvaluationReport {
            train: LossAccuracy::from(&train),
            test: LossAccuracy::from(&test),
            best_epoch_by_val_loss: best_epoch_by_val_loss(history),
            best_epoch_by_val_accuracy: best_epoch_by_val_accuracy(history),
            per_class_recall: confusion_matrix.per_class_recall(),
            per_class_precision: confusion_matrix.per_class_precision(),
            confusion_matrix,
        }
    }

    fn evaluate(&self, partition: PartitionDataset) -> PartitionMetrics {
        evaluate_partition(
            self.model,
            partition,
            self.augmentor,
            self.batch_size,
            self.regularization,
            &self.device,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(epoch: usize, val_loss: f64, val_accuracy: f64) -> EpochRecord {
        EpochRecord {
            epoch,
            train_loss: 1.0,
            train_accuracy: 0.5,
            val_loss,
            val_accuracy,
            learning_rate: 1e-3,
        }
    }

    #[test]
    fn test_default_settings_score_plain_cross_entropy() {
        use crate::ml::ml_model::ModelConfig;
        use crate::ml::training::tests::tiny_dataset;
        use crate::model::config::PreprocessSettings;
        use burn::backend::NdArray;
        use burn::data::dataloader::batcher::Batcher;
        use burn::data::dataset::Dataset;

        type TestBackend = NdArray<f32>;

        let regularization = Regularization::from(&ModelSettings::default());
        assert_eq!(regularization, Regularization::default());

        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device).unwrap();
        let penalty: f64 = model
            .regularization_penalty(regularization.l1, regularization.l2)
            .into_scalar()
            .elem();
        assert_eq!(penalty, 0.0);

        let dataset = tiny_dataset(2);
        let indices: Vec<usize> = (0..dataset.len()).collect();
        let augmentor = Augmentor::serve(&PreprocessSettings::default());

        let partition = dataset.partition(&indices);
        let items: Vec<_> = (0..partition.len()).filter_map(|i| partition.get(i)).collect();
        let batch = LesionBatcher::<TestBackend>::new(device.clone(), augmentor, 0)
            .batch(items, &device);
        let expected: f64 = model
            .forward_classification(batch.images, batch.targets)
            .loss
            .into_scalar()
            .elem();

        let metrics = evaluate_partition(
            &model,
            dataset.partition(&indices),
            augmentor,
            indices.len(),
            regularization,
            &device,
        );

        assert_eq!(metrics.targets.len(), indices.len());
        assert!((metrics.loss - expected).abs() < 1e-6);
    }

    #[test]
    fn test_confusion_matrix_rows_match_true_label_counts() {
        let targets = vec![0, 0, 1, 7, 7, 7, 6];
        let predictions = vec![0, 1, 1, 7, 0, 7, 6];
        let matrix = ConfusionMatrix::from_pairs(&targets, &predictions);

        assert_eq!(matrix.rows().len(), 8);
        assert_eq!(matrix.row_sums(), [2, 1, 0, 0, 0, 0, 1, 3]);
        assert_eq!(matrix.total(), targets.len());
        assert_eq!(matrix.get(LesionClass::Nc, LesionClass::Akiec), 1);
        assert_eq!(matrix.get(LesionClass::Akiec, LesionClass::Bcc), 1);
    }

    #[test]
    fn test_per_class_recall_and_precision() {
        let targets = vec![0, 0, 1, 7, 7, 7];
        let predictions = vec![0, 1, 1, 7, 0, 7];
        let matrix = ConfusionMatrix::from_pairs(&targets, &predictions);

        let recall = matrix.per_class_recall();
        assert_eq!(recall[0], Some(0.5));
        assert_eq!(recall[1], Some(1.0));
        assert_eq!(recall[2], None);
        assert!((recall[7].unwrap() - 2.0 / 3.0).abs() < 1e-12);

        let precision = matrix.per_class_precision();
        assert_eq!(precision[0], Some(0.5));
        assert_eq!(precision[1], Some(0.5));
        assert_eq!(precision[7], Some(1.0));
        assert_eq!(precision[3], None);
    }

    #[test]
    fn test_display_lists_codes_in_canonical_order() {
        let matrix = ConfusionMatrix::from_pairs(&[0], &[0]);
        let text = matrix.to_string();
        let header = text.lines().next().unwrap();
        let codes: Vec<&str> = header.split_whitespace().collect();
        assert_eq!(codes, LesionClass::canonical_codes());
        assert_eq!(text.lines().count(), 9);
    }

    #[test]
    fn test_best_epochs_are_one_based_and_prefer_earliest() {
        let history = vec![
            record(1, 1.2, 0.40),
            record(2, 0.8, 0.55),
            record(3, 0.8, 0.61),
            record(4, 0.9, 0.61),
        ];
        assert_eq!(best_epoch_by_val_loss(&history), Some(2));
        assert_eq!(best_epoch_by_val_accuracy(&history), Some(3));
        assert_eq!(best_epoch_by_val_loss(&[]), None);
    }
}
