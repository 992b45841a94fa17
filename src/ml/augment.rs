//! 学習時・推論時の前処理ポリシー
//!
//! どちらのポリシーも同じ [`PreprocessSettings`] から生成され、
//! ピクセルの縮尺係数 `rescale` を共有します。
//! 出力はネットワークが受け取る (C, H, W) 順の `f32` です。

use rand::Rng;

use crate::model::config::PreprocessSettings;

/// 幾何変換のランダム範囲
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometricJitter {
    pub rotation_deg: f32,
    pub zoom: f32,
    pub width_shift: f32,
    pub height_shift: f32,
}

impl GeometricJitter {
    fn is_identity(&self) -> bool {
        self.rotation_deg == 0.0
            && self.zoom == 0.0
            && self.width_shift == 0.0
            && self.height_shift == 0.0
    }
}

/// 1枚の画像に適用するアフィン変換（出力座標→入力座標）
#[derive(Debug, Clone, Copy)]
struct AffineSample {
    cos: f32,
    sin: f32,
    zoom_x: f32,
    zoom_y: f32,
    shift_x: f32,
    shift_y: f32,
}

impl AffineSample {
    fn draw<R: Rng + ?Sized>(jitter: &GeometricJitter, size: usize, rng: &mut R) -> Self {
        let theta = symmetric(rng, jitter.rotation_deg).to_radians();
        let zoom_x = 1.0 + symmetric(rng, jitter.zoom);
        let zoom_y = 1.0 + symmetric(rng, jitter.zoom);
        let shift_x = symmetric(rng, jitter.width_shift) * size as f32;
        let shift_y = symmetric(rng, jitter.height_shift) * size as f32;
        Self {
            cos: theta.cos(),
            sin: theta.sin(),
            zoom_x,
            zoom_y,
            shift_x,
            shift_y,
        }
    }

    /// 出力ピクセル中心 (x, y) に対応する入力座標
    fn source(&self, x: f32, y: f32, center: f32) -> (f32, f32) {
        let u = (x - center) * self.zoom_x;
        let v = (y - center) * self.zoom_y;
        let sx = self.cos * u - self.sin * v + center + self.shift_x;
        let sy = self.sin * u + self.cos * v + center + self.shift_y;
        (sx, sy)
    }
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

/// 前処理ポリシー
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AugmentPolicy {
    /// 縮尺＋ランダム幾何変換
    Train(GeometricJitter),
    /// 縮尺のみ
    Serve,
}

/// 前処理器
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Augmentor {
    image_size: usize,
    rescale: f32,
    policy: AugmentPolicy,
}

impl Augmentor {
    /// 学習用ポリシー
    pub fn train(settings: &PreprocessSettings) -> Self {
        Self {
            image_size: settings.image_size,
            rescale: settings.rescale,
            policy: AugmentPolicy::Train(GeometricJitter {
                rotation_deg: settings.rotation_range_deg,
                zoom: settings.zoom_range,
                width_shift: settings.width_shift_range,
                height_shift: settings.height_shift_range,
            }),
        }
    }

    /// 評価・推論用ポリシー
    pub fn serve(settings: &PreprocessSettings) -> Self {
        Self {
            image_size: settings.image_size,
            rescale: settings.rescale,
            policy: AugmentPolicy::Serve,
        }
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn rescale(&self) -> f32 {
        self.rescale
    }

    pub fn policy(&self) -> AugmentPolicy {
        self.policy
    }

    /// 1枚分の入力要素数
    pub fn input_len(&self) -> usize {
        3 * self.image_size * self.image_size
    }

    /// HWC順の `u8` ピクセルを前処理して (C, H, W) 順の `f32` を返す
    ///
    /// 推論用ポリシーでは `rng` は使われません。
    pub fn apply<R: Rng + ?Sized>(&self, pixels: &[u8], rng: &mut R) -> Vec<f32> {
        match self.policy {
            AugmentPolicy::Serve => self.rescale_only(pixels),
            AugmentPolicy::Train(jitter) if jitter.is_identity() => self.rescale_only(pixels),
            AugmentPolicy::Train(jitter) => {
                let sample = AffineSample::draw(&jitter, self.image_size, rng);
                self.warp(pixels, &sample)
            }
        }
    }

    /// 決定的な前処理（縮尺のみ）
    pub fn apply_deterministic(&self, pixels: &[u8]) -> Vec<f32> {
        self.rescale_only(pixels)
    }

    fn rescale_only(&self, pixels: &[u8]) -> Vec<f32> {
        let size = self.image_size;
        let plane = size * size;
        let mut out = vec![0.0f32; 3 * plane];
        for (i, px) in pixels.chunks_exact(3).enumerate().take(plane) {
            for c in 0..3 {
                out[c * plane + i] = px[c] as f32 * self.rescale;
            }
        }
        out
    }

    /// 双線形補間＋端の値で埋める（nearest）アフィン変換
    fn warp(&self, pixels: &[u8], sample: &AffineSample) -> Vec<f32> {
        let size = self.image_size;
        let plane = size * size;
        let max = (size - 1) as f32;
        let center = max / 2.0;
        let at = |x: usize, y: usize, c: usize| pixels[(y * size + x) * 3 + c] as f32;

        let mut out = vec![0.0f32; 3 * plane];
        for y in 0..size {
            for x in 0..size {
                let (sx, sy) = sample.source(x as f32, y as f32, center);
                let sx = sx.clamp(0.0, max);
                let sy = sy.clamp(0.0, max);
                let x0 = sx.floor() as usize;
                let y0 = sy.floor() as usize;
                let x1 = (x0 + 1).min(size - 1);
                let y1 = (y0 + 1).min(size - 1);
                let fx = sx - x0 as f32;
                let fy = sy - y0 as f32;
                for c in 0..3 {
                    let top = at(x0, y0, c) * (1.0 - fx) + at(x1, y0, c) * fx;
                    let bottom = at(x0, y1, c) * (1.0 - fx) + at(x1, y1, c) * fx;
                    let value = top * (1.0 - fy) + bottom * fy;
                    out[c * plane + y * size + x] = value * self.rescale;
                }
            }
        }
        out
    }
}
