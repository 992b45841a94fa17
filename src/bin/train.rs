//! 学習ジョブ
//!
//! 設定ファイル（とコマンドライン引数による上書き）に従ってデータセットを組み立てて学習し、
//! 評価結果を含むモデルアーティファクトを書き出します。

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, ValueEnum};
use tracing::info;

use dermascan::logging;
use dermascan::ml::{run_training, EpochRecord, TrainingOutcome};
use dermascan::model::{AppConfig, DeviceType};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceArg {
    Wgpu,
    Cpu,
}

#[derive(Parser, Debug)]
#[command(version, about = "Train the skin lesion classifier")]
struct Args {
    /// 設定ファイル
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// 平坦化ピクセルCSV
    #[arg(long)]
    csv: Option<PathBuf>,

    /// 非がん画像ディレクトリ
    #[arg(long)]
    images: Option<PathBuf>,

    /// 出力アーティファクト
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// 計算デバイス
    #[arg(long, value_enum)]
    device: Option<DeviceArg>,

    /// 上書き後の設定を書き出すパス
    #[arg(long)]
    write_config: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(csv) = &self.csv {
            config.data.tabular_csv = csv.clone();
        }
        if let Some(images) = &self.images {
            config.data.non_cancer_dir = images.clone();
        }
        if let Some(output) = &self.output {
            config.model.model_path = output.clone();
        }
        if let Some(epochs) = self.epochs {
            config.training.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(lr) = self.learning_rate {
            config.training.learning_rate = lr;
        }
        match self.device {
            Some(DeviceArg::Wgpu) => config.device_type = DeviceType::Wgpu,
            Some(DeviceArg::Cpu) => config.device_type = DeviceType::Cpu,
            None => {}
        }
    }
}

/// エポックをまたいだ進捗（学習率の変化と val_loss 最小のエポック）
#[derive(Debug, Default)]
struct Progress {
    /// (エポック, val_loss)
    best: Option<(usize, f64)>,
    previous_lr: Option<f64>,
}

#[derive(Debug, Default, PartialEq)]
struct ProgressUpdate {
    lr_changed_from: Option<f64>,
    /// 置き換えられた最良エポック
    replaced_best: Option<(usize, f64)>,
}

impl Progress {
    fn observe(&mut self, record: &EpochRecord) -> ProgressUpdate {
        let mut update = ProgressUpdate {
            lr_changed_from: self.previous_lr.filter(|&lr| lr != record.learning_rate),
            ..ProgressUpdate::default()
        };
        self.previous_lr = Some(record.learning_rate);

        // 同値なら先のエポックを残す
        if self.best.map_or(true, |(_, loss)| record.val_loss < loss) {
            update.replaced_best = self.best;
            self.best = Some((record.epoch, record.val_loss));
        }
        update
    }
}

fn run<B: AutodiffBackend>(config: &AppConfig, device: B::Device) -> Result<TrainingOutcome> {
    let mut progress = Progress::default();
    let outcome = run_training::<B>(config, device, |record: &EpochRecord| {
        let update = progress.observe(record);
        if let Some(lr) = update.lr_changed_from {
            info!(
                "エポック {} から学習率が変わりました: {:.2e} -> {:.2e}",
                record.epoch, lr, record.learning_rate
            );
        }
        if let Some((epoch, loss)) = update.replaced_best {
            info!(
                "これまでの最良エポックを更新: {} (val_loss={:.4}) -> {} (val_loss={:.4})",
                epoch, loss, record.epoch, record.val_loss
            );
        }
    })
    .context("学習に失敗しました")?;
    if let Some((epoch, loss)) = progress.best {
        info!("val_loss 最小のエポック: {} ({:.4})", epoch, loss);
    }
    Ok(outcome)
}

#[cfg(feature = "wgpu")]
fn run_wgpu(config: &AppConfig) -> Result<TrainingOutcome> {
    use burn::backend::wgpu::WgpuDevice;
    use burn::backend::Wgpu;

    run::<Autodiff<Wgpu>>(config, WgpuDevice::default())
}

#[cfg(not(feature = "wgpu"))]
fn run_wgpu(config: &AppConfig) -> Result<TrainingOutcome> {
    tracing::warn!("wgpu 機能が無効なため CPU で学習します");
    run::<Autodiff<NdArray>>(config, NdArrayDevice::default())
}

fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let mut config = AppConfig::load_or_default_from(&args.config);
    args.apply(&mut config);
    config.validate().context("設定が不正です")?;
    config.display();

    if let Some(path) = &args.write_config {
        config.save(path).context("設定を書き出せませんでした")?;
        info!("設定を書き出しました: {}", path.display());
    }

    let outcome = match config.device_type {
        DeviceType::Wgpu => run_wgpu(&config)?,
        DeviceType::Cpu => run::<Autodiff<NdArray>>(&config, NdArrayDevice::default())?,
    };

    info!(
        "学習完了: {} に保存しました (テスト精度 {:.4})",
        outcome.artifact_path.display(),
        outcome.report.test.accuracy
    );
    Ok(())
}
