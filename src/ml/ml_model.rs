//! 皮膚病変分類CNN
//!
//! 28x28 RGB画像を8クラスの確率分布へ写像する固定トポロジーのネットワークです。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, Linear, LinearConfig,
        PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use tracing::debug;

use crate::error::ConfigurationError;
use crate::taxonomy::NUM_CLASSES;

/// 受け付ける最小入力サイズ（4回のプーリング後に1x1以上残る）
pub const MIN_IMAGE_SIZE: usize = 16;

/// 最終畳み込みブロックのチャネル数
const LAST_CONV_CHANNELS: usize = 256;

/// モデル設定
#[derive(Config, Debug, PartialEq)]
pub struct ModelConfig {
    /// 分類クラス数
    #[config(default = 8)]
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.2)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 28)]
    pub image_size: usize,
}

impl ModelConfig {
    /// 設定値の検証
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.image_size < MIN_IMAGE_SIZE {
            return Err(ConfigurationError::invalid(
                "image_size",
                format!("{} px is below the minimum of {MIN_IMAGE_SIZE} px", self.image_size),
            ));
        }
        if self.num_classes != NUM_CLASSES {
            return Err(ConfigurationError::invalid(
                "num_classes",
                format!("expected {NUM_CLASSES}, got {}", self.num_classes),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigurationError::invalid(
                "dropout",
                format!("{} is outside [0, 1)", self.dropout),
            ));
        }
        Ok(())
    }

    /// 4回の2x2プーリング後の特徴マップ一辺
    fn feature_map_size(&self) -> usize {
        (0..4).fold(self.image_size, |size, _| size / 2)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<SkinLesionClassifier<B>, ConfigurationError> {
        self.validate()?;

        let side = self.feature_map_size();
        let flat = LAST_CONV_CHANNELS * side * side;
        debug!(
            "入力 {}x{} -> 特徴マップ {}x{}x{} -> flatten {}",
            self.image_size, self.image_size, LAST_CONV_CHANNELS, side, side, flat
        );

        Ok(SkinLesionClassifier {
            conv1: conv(3, 32, device),
            bn1: BatchNormConfig::new(32).init(device),

            conv2a: conv(32, 64, device),
            conv2b: conv(64, 64, device),
            bn2: BatchNormConfig::new(64).init(device),

            conv3a: conv(64, 128, device),
            conv3b: conv(128, 128, device),
            bn3: BatchNormConfig::new(128).init(device),

            conv4a: conv(128, 256, device),
            conv4b: conv(256, 256, device),

            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),

            dense256: dense(flat, 256, device),
            bn256: BatchNormConfig::new(256).init(device),
            dense128: dense(256, 128, device),
            bn128: BatchNormConfig::new(128).init(device),
            dense64: dense(128, 64, device),
            bn64: BatchNormConfig::new(64).init(device),
            dense32: dense(64, 32, device),

            output: LinearConfig::new(32, self.num_classes)
                .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                .init(device),

            activation: Relu::new(),
        })
    }
}

fn he_normal() -> Initializer {
    Initializer::KaimingNormal {
        gain: 2f64.sqrt(),
        fan_out_only: false,
    }
}

fn conv<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([1, 1])
        .with_padding(PaddingConfig2d::Same)
        .with_initializer(he_normal())
        .init(device)
}

fn dense<B: Backend>(d_input: usize, d_output: usize, device: &B::Device) -> Linear<B> {
    LinearConfig::new(d_input, d_output)
        .with_initializer(he_normal())
        .init(device)
}

/// 皮膚病変分類用CNNモデル
///
/// # アーキテクチャ
/// - Conv(32) → MaxPool → BN
/// - Conv(64) x2 → MaxPool → BN
/// - Conv(128) x2 → MaxPool → BN
/// - Conv(256) x2 → MaxPool
/// - Flatten → Dropout
/// - Dense 256 + BN → Dense 128 + BN → Dense 64 + BN → Dense 32（L1/L2正則化）
/// - Dense 8 → Softmax（確率が必要な場合）
///
/// 畳み込みはすべて3x3・sameパディング・ReLU。
#[derive(Module, Debug)]
pub struct SkinLesionClassifier<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,

    conv2a: Conv2d<B>,
    conv2b: Conv2d<B>,
    bn2: BatchNorm<B>,

    conv3a: Conv2d<B>,
    conv3b: Conv2d<B>,
    bn3: BatchNorm<B>,

    conv4a: Conv2d<B>,
    conv4b: Conv2d<B>,

    pool: MaxPool2d,
    dropout: Dropout,

    dense256: Linear<B>,
    bn256: BatchNorm<B>,
    dense128: Linear<B>,
    bn128: BatchNorm<B>,
    dense64: Linear<B>,
    bn64: BatchNorm<B>,
    dense32: Linear<B>,

    output: Linear<B>,

    activation: Relu,
}

impl<B: Backend> SkinLesionClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.relu_conv(&self.conv1, images);
        let x = self.bn1.forward(self.pool.forward(x));

        let x = self.relu_conv(&self.conv2a, x);
        let x = self.relu_conv(&self.conv2b, x);
        let x = self.bn2.forward(self.pool.forward(x));

        let x = self.relu_conv(&self.conv3a, x);
        let x = self.relu_conv(&self.conv3b, x);
        let x = self.bn3.forward(self.pool.forward(x));

        let x = self.relu_conv(&self.conv4a, x);
        let x = self.relu_conv(&self.conv4b, x);
        let x = self.pool.forward(x);

        // Flatten
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);
        let x = self.dropout.forward(x);

        let x = self.dense_bn(&self.dense256, &self.bn256, x);
        let x = self.dense_bn(&self.dense128, &self.bn128, x);
        let x = self.dense_bn(&self.dense64, &self.bn64, x);
        let x = self.activation.forward(self.dense32.forward(x));

        self.output.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]（各行の和は1）
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// Dense 32層の重みに対するL1/L2ペナルティ
    pub fn regularization_penalty(&self, l1: f64, l2: f64) -> Tensor<B, 1> {
        let weight = self.dense32.weight.val();
        let l1_term = weight.clone().abs().sum().mul_scalar(l1);
        let l2_term = weight.powf_scalar(2.0).sum().mul_scalar(l2);
        l1_term + l2_term
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// 損失は交差エントロピーのみで、正則化項は含みません。
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    fn relu_conv(&self, layer: &Conv2d<B>, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.activation.forward(layer.forward(x))
    }

    /// Dense + ReLU + BN（BNは [batch, features, 1] として適用）
    fn dense_bn(&self, layer: &Linear<B>, norm: &BatchNorm<B>, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.activation.forward(layer.forward(x));
        let [batch_size, features] = x.dims();
        let x: Tensor<B, 3> = x.reshape([batch_size, features, 1]);
        norm.forward(x).reshape([batch_size, features])
    }
}
