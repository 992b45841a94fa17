//! モデル学習
//!
//! エポック単位の状態機械で学習ループを回し、各エポック後に検証と学習率制御を行います。

use std::fmt;

use burn::{
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConfigurationError, TrainingError};
use crate::ml::adamax::AdamaxConfig;
use crate::ml::augment::Augmentor;
use crate::ml::dataset::{LesionBatcher, LesionDataset, Split};
use crate::ml::evaluation::{evaluate_partition, Regularization};
use crate::ml::lr_policy::PlateauPolicy;
use crate::ml::ml_model::SkinLesionClassifier;
use crate::model::config::{PreprocessSettings, TrainingSettings};

/// 学習の進行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Initialized,
    Training { epoch: usize },
    Evaluating { epoch: usize },
    Completed,
}

impl fmt::Display for TrainingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingState::Initialized => write!(f, "initialized"),
            TrainingState::Training { epoch } => write!(f, "training (epoch {epoch})"),
            TrainingState::Evaluating { epoch } => write!(f, "evaluating (epoch {epoch})"),
            TrainingState::Completed => write!(f, "completed"),
        }
    }
}

/// 1エポック分の記録
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1始まり
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    /// このエポックで使った学習率
    pub learning_rate: f64,
}

/// 学習結果
pub struct TrainedModel<B: AutodiffBackend> {
    pub model: SkinLesionClassifier<B>,
    pub history: Vec<EpochRecord>,
}

type EpochObserver<'a> = Box<dyn FnMut(&EpochRecord) + 'a>;

/// 学習ループの制御
pub struct TrainingController<'a, B: AutodiffBackend> {
    settings: TrainingSettings,
    preprocess: PreprocessSettings,
    regularization: Regularization,
    device: B::Device,
    state: TrainingState,
    observer: Option<EpochObserver<'a>>,
}

impl<'a, B: AutodiffBackend> TrainingController<'a, B> {
    pub fn new(
        settings: TrainingSettings,
        preprocess: PreprocessSettings,
        regularization: Regularization,
        device: B::Device,
    ) -> Self {
        Self {
            settings,
            preprocess,
            regularization,
            device,
            state: TrainingState::Initialized,
            observer: None,
        }
    }

    /// 各エポック完了時に呼ばれるコールバックを登録
    pub fn with_observer(mut self, observer: impl FnMut(&EpochRecord) + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    fn validate(&self, train_len: usize) -> Result<(), ConfigurationError> {
        let s = &self.settings;
        if s.num_epochs == 0 {
            return Err(ConfigurationError::invalid("num_epochs", "must be at least 1"));
        }
        if s.batch_size == 0 {
            return Err(ConfigurationError::invalid("batch_size", "must be at least 1"));
        }
        if !(s.learning_rate.is_finite() && s.learning_rate > 0.0) {
            return Err(ConfigurationError::invalid(
                "learning_rate",
                format!("{} is not a positive number", s.learning_rate),
            ));
        }
        if train_len < s.batch_size {
            return Err(ConfigurationError::DatasetTooSmall {
                available: train_len,
                batch_size: s.batch_size,
            });
        }
        Ok(())
    }

    /// 学習を実行
    ///
    /// 検証には分割のテスト側を推論用ポリシーで使います。
    /// 損失が有限でなくなった時点で中断します。
    pub fn fit(
        &mut self,
        mut model: SkinLesionClassifier<B>,
        dataset: &LesionDataset,
        split: &Split,
    ) -> Result<TrainedModel<B>, TrainingError> {
        self.validate(split.train.len())?;

        let batch_size = self.settings.batch_size;
        let train_augmentor = Augmentor::train(&self.preprocess);
        let serve_augmentor = Augmentor::serve(&self.preprocess);

        let batcher_train =
            LesionBatcher::<B>::new(self.device.clone(), train_augmentor, self.settings.seed);
        let dataloader_train = DataLoaderBuilder::new(batcher_train)
            .batch_size(batch_size)
            .shuffle(self.settings.seed)
            .num_workers(0)
            .build(dataset.partition(&split.train));

        let mut optim = AdamaxConfig::new().init::<B, SkinLesionClassifier<B>>();
        let mut policy = PlateauPolicy::new(self.settings.learning_rate, self.settings.plateau);
        let mut history = Vec::with_capacity(self.settings.num_epochs);

        info!(
            "学習を開始します: エポック数 {}, バッチサイズ {}, 学習率 {}, 学習 {} 件 / 検証 {} 件",
            self.settings.num_epochs,
            batch_size,
            self.settings.learning_rate,
            split.train.len(),
            split.test.len()
        );

        for epoch in 1..=self.settings.num_epochs {
            self.state = TrainingState::Training { epoch };
            let lr = policy.current_lr();

            let mut loss_sum = 0.0f64;
            let mut correct = 0usize;
            let mut seen = 0usize;

            for batch in dataloader_train.iter() {
                let batch_len = batch.targets.dims()[0];
                let output = model.forward_classification(batch.images, batch.targets);
                let penalty = model
                    .regularization_penalty(self.regularization.l1, self.regularization.l2);
                let loss = output.loss + penalty;

                let loss_value: f64 = loss.clone().into_scalar().elem();
                let predicted = output.output.argmax(1).reshape([batch_len]);
                let batch_correct: i64 = predicted
                    .equal(output.targets)
                    .int()
                    .sum()
                    .into_scalar()
                    .elem();

                loss_sum += loss_value * batch_len as f64;
                correct += batch_correct as usize;
                seen += batch_len;

                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optim.step(lr, model, grads);
            }

            let train_loss = loss_sum / seen.max(1) as f64;
            let train_accuracy = correct as f64 / seen.max(1) as f64;
            debug!("エポック {} の学習が完了しました", epoch);

            self.state = TrainingState::Evaluating { epoch };
            let val = evaluate_partition(
                &model.valid(),
                dataset.partition(&split.test),
                serve_augmentor,
                batch_size,
                self.regularization,
                &self.device,
            );

            if !train_loss.is_finite() || !val.loss.is_finite() {
                return Err(TrainingError::DivergentLoss {
                    epoch,
                    train_loss,
                    val_loss: val.loss,
                });
            }

            let record = EpochRecord {
                epoch,
                train_loss,
                train_accuracy,
                val_loss: val.loss,
                val_accuracy: val.accuracy,
                learning_rate: lr,
            };
            info!(
                "エポック {}/{}: loss={:.4} accuracy={:.4} val_loss={:.4} val_accuracy={:.4} lr={:.2e}",
                epoch,
                self.settings.num_epochs,
                record.train_loss,
                record.train_accuracy,
                record.val_loss,
                record.val_accuracy,
                record.learning_rate
            );

            policy.observe(epoch, val.accuracy)?;
            if let Some(observer) = self.observer.as_mut() {
                observer(&record);
            }
            history.push(record);
        }

        self.state = TrainingState::Completed;
        match policy.best() {
            Some(best) => info!(
                "学習が完了しました: 最良の検証精度 {:.4}, 最終学習率 {:.2e}",
                best,
                policy.current_lr()
            ),
            None => info!("学習が完了しました"),
        }

        Ok(TrainedModel { model, history })
    }
}
