//! 学習データセットの組み立て
//!
//! 表形式ピクセルCSVと非がん画像ディレクトリを1つの8クラスデータセットへ統合し、
//! 学習用・テスト用に分割します。

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::tensor::{backend::Backend, Int, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::csv_loader::load_csv;
use crate::error::DataIntegrityError;
use crate::ml::augment::Augmentor;
use crate::ml::image_io;
use crate::model::config::DataSettings;
use crate::taxonomy::{LesionClass, NUM_CLASSES};

/// 画像の出どころ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// 平坦化ピクセルCSV
    Tabular,
    /// 画像ディレクトリ
    Directory,
}

/// ラベル付き画像（生成後は不変）
///
/// ピクセルはHWC順の `u8`。オーバーサンプリングによる複製は `Arc` を共有します。
#[derive(Debug, Clone)]
pub struct LabeledImage {
    pixels: Arc<[u8]>,
    label: LesionClass,
    provenance: Provenance,
}

impl LabeledImage {
    pub fn new(pixels: Arc<[u8]>, label: LesionClass, provenance: Provenance) -> Self {
        Self {
            pixels,
            label,
            provenance,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn label(&self) -> LesionClass {
        self.label
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }
}

/// クラス別件数（ID順）
pub fn class_counts(images: &[LabeledImage]) -> [usize; NUM_CLASSES] {
    let mut counts = [0usize; NUM_CLASSES];
    for image in images {
        counts[image.label().id()] += 1;
    }
    counts
}

/// 表形式の7クラスを最大件数まで復元抽出で水増しする
///
/// 非がんクラスの画像が含まれていても対象外としてそのまま残します。
/// 追加分はクラス順に末尾へ追加され、既存の順序は変わりません。
pub fn oversample_tabular<R: Rng + ?Sized>(
    mut images: Vec<LabeledImage>,
    rng: &mut R,
) -> Result<Vec<LabeledImage>, DataIntegrityError> {
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); NUM_CLASSES];
    for (i, image) in images.iter().enumerate() {
        by_class[image.label().id()].push(i);
    }

    let tabular: Vec<LesionClass> = LesionClass::ALL
        .iter()
        .copied()
        .filter(|c| c.is_tabular())
        .collect();

    if let Some(empty) = tabular.iter().find(|c| by_class[c.id()].is_empty()) {
        return Err(DataIntegrityError::EmptyClass { class: *empty });
    }

    let target = tabular
        .iter()
        .map(|c| by_class[c.id()].len())
        .max()
        .unwrap_or(0);

    for class in tabular {
        let members = &by_class[class.id()];
        let missing = target - members.len();
        if missing > 0 {
            debug!("{}: {} -> {} 件へ水増し", class.code(), members.len(), target);
        }
        for _ in 0..missing {
            let pick = members[rng.gen_range(0..members.len())];
            let copy = images[pick].clone();
            images.push(copy);
        }
    }

    Ok(images)
}

/// ディレクトリ内の画像を読み込み、非がんラベルを付ける
///
/// ファイル名順に走査し、隠しファイルと画像以外の拡張子はスキップします。
/// 読み込めない画像が1枚でもあればエラーです。
pub fn load_directory_images(
    dir: &Path,
    image_size: usize,
) -> Result<Vec<LabeledImage>, DataIntegrityError> {
    if !dir.is_dir() {
        return Err(DataIntegrityError::MissingSource {
            path: dir.to_path_buf(),
        });
    }

    let io_err = |source| DataIntegrityError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if !path.is_file() {
            continue;
        }
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        let is_image = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .map(|ext| image_io::SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false);
        if !hidden && is_image {
            paths.push(path);
        }
    }
    paths.sort();

    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let pixels = image_io::load_file(&path, image_size)
            .map_err(|source| DataIntegrityError::CorruptImage { path, source })?;
        images.push(LabeledImage::new(
            Arc::from(pixels),
            LesionClass::NON_CANCER,
            Provenance::Directory,
        ));
    }

    info!("ディレクトリから {} 枚を読み込みました: {}", images.len(), dir.display());
    Ok(images)
}

/// 8クラスのデータセット
#[derive(Debug, Clone)]
pub struct LesionDataset {
    images: Arc<[LabeledImage]>,
}

impl LesionDataset {
    /// 全クラスに1件以上あることを確認して構築
    pub fn new(images: Vec<LabeledImage>) -> Result<Self, DataIntegrityError> {
        let counts = class_counts(&images);
        if let Some(empty) = LesionClass::ALL.iter().find(|c| counts[c.id()] == 0) {
            return Err(DataIntegrityError::EmptyClass { class: *empty });
        }
        Ok(Self {
            images: Arc::from(images),
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&LabeledImage> {
        self.images.get(index)
    }

    pub fn images(&self) -> &[LabeledImage] {
        &self.images
    }

    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        class_counts(&self.images)
    }

    /// テスト割合とシードで分割する（テスト件数は切り上げ）
    pub fn split(&self, test_ratio: f32, seed: u64) -> Split {
        let total = self.len();
        let mut indices: Vec<usize> = (0..total).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        let test_len = ((total as f64 * test_ratio as f64).ceil() as usize).min(total);
        let train = indices.split_off(test_len);
        Split {
            train,
            test: indices,
        }
    }

    /// 指定インデックスのビュー（burnのDatasetとして使う）
    pub fn partition(&self, indices: &[usize]) -> PartitionDataset {
        PartitionDataset {
            images: self.images.clone(),
            indices: Arc::from(indices),
        }
    }

    /// ログ用のクラス構成
    pub fn log_composition(&self) {
        let counts = self.class_counts();
        info!("データセット: {} 件", self.len());
        for class in LesionClass::ALL {
            info!("  クラス {} {}: {} 件", class.id(), class.code(), counts[class.id()]);
        }
    }
}

/// 学習用・テスト用の分割（元データセットへのインデックス）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// 2つのデータソースから8クラスデータセットを組み立てる
pub struct DatasetAssembler<'a> {
    settings: &'a DataSettings,
    image_size: usize,
}

impl<'a> DatasetAssembler<'a> {
    pub fn new(settings: &'a DataSettings, image_size: usize) -> Self {
        Self {
            settings,
            image_size,
        }
    }

    /// CSV読み込み → 7クラス均衡化 → 非がん画像を追加
    ///
    /// どの段階で失敗しても部分的なデータセットは返しません。
    pub fn assemble(&self) -> Result<LesionDataset, DataIntegrityError> {
        let tabular = load_csv(&self.settings.tabular_csv, self.image_size)?;
        let before = class_counts(&tabular);
        let mut rng = StdRng::seed_from_u64(self.settings.oversample_seed);
        let mut images = oversample_tabular(tabular, &mut rng)?;
        let after = class_counts(&images);
        info!(
            "表形式7クラスを均衡化しました: {:?} -> {:?}",
            &before[..7],
            &after[..7]
        );

        let non_cancer = load_directory_images(&self.settings.non_cancer_dir, self.image_size)?;
        images.extend(non_cancer);

        let dataset = LesionDataset::new(images)?;
        dataset.log_composition();
        Ok(dataset)
    }
}

/// 分割後のビュー
#[derive(Debug, Clone)]
pub struct PartitionDataset {
    images: Arc<[LabeledImage]>,
    indices: Arc<[usize]>,
}

impl PartitionDataset {
    pub fn labels(&self) -> Vec<usize> {
        self.indices
            .iter()
            .map(|&i| self.images[i].label().id())
            .collect()
    }
}

impl Dataset<LabeledImage> for PartitionDataset {
    fn get(&self, index: usize) -> Option<LabeledImage> {
        let actual_index = *self.indices.get(index)?;
        self.images.get(actual_index).cloned()
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

/// バッチャー
///
/// 学習用ポリシーではバッチごとに独立した乱数列で拡張します。
#[derive(Clone)]
pub struct LesionBatcher<B: Backend> {
    device: B::Device,
    augmentor: Augmentor,
    seed: u64,
    counter: Arc<AtomicU64>,
}

impl<B: Backend> LesionBatcher<B> {
    pub fn new(device: B::Device, augmentor: Augmentor, seed: u64) -> Self {
        Self {
            device,
            augmentor,
            seed,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct LesionBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, LabeledImage, LesionBatch<B>> for LesionBatcher<B> {
    fn batch(&self, items: Vec<LabeledImage>, _device: &B::Device) -> LesionBatch<B> {
        let batch_size = items.len();
        let size = self.augmentor.image_size();
        let batch_index = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(batch_index));

        let mut all_pixels = Vec::with_capacity(batch_size * self.augmentor.input_len());
        let mut targets_vec = Vec::with_capacity(batch_size);
        for item in &items {
            all_pixels.extend(self.augmentor.apply(item.pixels(), &mut rng));
            targets_vec.push(item.label().id() as i64);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        LesionBatch { images, targets }
    }
}
