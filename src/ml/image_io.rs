//! 画像のデコードとリサイズ
//!
//! 学習データ組み立て（ディレクトリ画像）と推論サービス（アップロード画像）は
//! 必ずこのモジュールの関数を通してモデル入力サイズへ変換します。

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use std::path::Path;

use crate::error::ImageDecodeError;

/// 学習データとアップロードの両方で受け付ける拡張子（小文字）
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];

/// リサイズに使うフィルタ
const RESIZE_FILTER: FilterType = FilterType::CatmullRom;

/// RGB 3チャネル・正方形へ変換し、HWC順の `u8` ピクセル列を返す
pub fn to_model_pixels(img: DynamicImage, image_size: usize) -> Vec<u8> {
    let rgb: RgbImage = img.to_rgb8();
    let size = image_size as u32;
    let resized = if rgb.dimensions() == (size, size) {
        rgb
    } else {
        image::imageops::resize(&rgb, size, size, RESIZE_FILTER)
    };
    resized.into_raw()
}

/// メモリ上の画像バイト列をデコードしてモデル入力サイズへ変換
pub fn decode_bytes(bytes: &[u8], image_size: usize) -> Result<Vec<u8>, ImageDecodeError> {
    if bytes.is_empty() {
        return Err(ImageDecodeError::Empty);
    }
    let img = image::load_from_memory(bytes)?;
    Ok(to_model_pixels(img, image_size))
}

/// 画像ファイルを読み込んでモデル入力サイズへ変換
pub fn load_file(path: &Path, image_size: usize) -> Result<Vec<u8>, image::ImageError> {
    let img = image::open(path)?;
    Ok(to_model_pixels(img, image_size))
}
