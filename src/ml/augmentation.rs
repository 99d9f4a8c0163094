//! 学習データの拡張
//!
//! 学習ストリームのみに適用し、検証・テストには適用しません。
//!
//! - 回転・せん断・ズームを1つのアフィン変換として中心まわりに適用（双線形補間、範囲外は端の画素で補完）
//! - 水平・垂直反転（各50%）
//! - 明るさ・コントラストの揺らぎ

use image::{imageops, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::Rng;

use crate::model::config::AugmentationSettings;

/// データ拡張器
#[derive(Debug, Clone)]
pub struct Augmenter {
    settings: AugmentationSettings,
}

impl Augmenter {
    pub fn new(settings: AugmentationSettings) -> Self {
        Self { settings }
    }

    /// ランダムな拡張を適用
    pub fn augment(&self, img: RgbImage, rng: &mut StdRng) -> RgbImage {
        let s = &self.settings;
        let ratio = s.transformation_ratio.max(0.0);

        let mut result = if ratio > 0.0 {
            let rotation = rng.gen_range(-ratio..=ratio).to_radians();
            let shear = rng.gen_range(-ratio..=ratio).to_radians();
            let zoom_x = rng.gen_range(1.0 - ratio..=1.0 + ratio);
            let zoom_y = rng.gen_range(1.0 - ratio..=1.0 + ratio);
            affine(&img, rotation, shear, zoom_x, zoom_y)
        } else {
            img
        };

        if s.horizontal_flip && rng.gen_bool(0.5) {
            imageops::flip_horizontal_in_place(&mut result);
        }
        if s.vertical_flip && rng.gen_bool(0.5) {
            imageops::flip_vertical_in_place(&mut result);
        }

        if s.brightness_delta > 0.0 {
            let delta = rng.gen_range(-s.brightness_delta..=s.brightness_delta);
            adjust_brightness(&mut result, delta);
        }
        if s.contrast_delta > 0.0 {
            let factor = 1.0 + rng.gen_range(-s.contrast_delta..=s.contrast_delta);
            adjust_contrast(&mut result, factor);
        }

        result
    }
}

/// 中心まわりのアフィン変換
///
/// 出力画素ごとに入力座標を逆算して標本化します（回転 * せん断 * ズーム）。
pub fn affine(img: &RgbImage, rotation: f32, shear: f32, zoom_x: f32, zoom_y: f32) -> RgbImage {
    let (width, height) = img.dimensions();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    let (sin_r, cos_r) = rotation.sin_cos();
    let (sin_s, cos_s) = shear.sin_cos();

    // [[cos_r, -sin_r], [sin_r, cos_r]] * [[1, -sin_s], [0, cos_s]] * diag(zoom_x, zoom_y)
    let m00 = cos_r * zoom_x;
    let m01 = (-cos_r * sin_s - sin_r * cos_s) * zoom_y;
    let m10 = sin_r * zoom_x;
    let m11 = (-sin_r * sin_s + cos_r * cos_s) * zoom_y;

    RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let src_x = cx + m00 * dx + m01 * dy;
        let src_y = cy + m10 * dx + m11 * dy;
        bilinear_sample(img, src_x, src_y)
    })
}

/// 双線形補間で標本化（範囲外は端の画素）
fn bilinear_sample(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// 明るさを加算（delta は 0..1 の画素値に対する量）
fn adjust_brightness(img: &mut RgbImage, delta: f32) {
    let offset = delta * 255.0;
    for pixel in img.pixels_mut() {
        for c in pixel.0.iter_mut() {
            *c = (*c as f32 + offset).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// 平均輝度を中心にコントラストを拡大・縮小
fn adjust_contrast(img: &mut RgbImage, factor: f32) {
    let count = (img.width() * img.height()).max(1) as f32;
    let mean = img
        .pixels()
        .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
        .sum::<f32>()
        / count;

    for pixel in img.pixels_mut() {
        for c in pixel.0.iter_mut() {
            *c = (mean + (*c as f32 - mean) * factor).round().clamp(0.0, 255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn gradient(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| Rgb([(x * 20) as u8, (y * 20) as u8, 100]))
    }

    #[test]
    fn test_identity_affine_keeps_pixels() {
        let img = gradient(8);
        let out = affine(&img, 0.0, 0.0, 1.0, 1.0);
        assert_eq!(out, img);
    }

    #[test]
    fn test_augment_preserves_dimensions() {
        let augmenter = Augmenter::new(AugmentationSettings::default());
        let mut rng = StdRng::seed_from_u64(9);
        let img = RgbImage::from_pixel(12, 7, Rgb([10, 20, 30]));

        let out = augmenter.augment(img, &mut rng);
        assert_eq!(out.dimensions(), (12, 7));
    }

    #[test]
    fn test_augment_is_deterministic_for_seed() {
        let augmenter = Augmenter::new(AugmentationSettings::default());
        let a = augmenter.augment(gradient(8), &mut StdRng::seed_from_u64(9));
        let b = augmenter.augment(gradient(8), &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn test_disabled_augmentation_is_identity() {
        let settings = AugmentationSettings {
            transformation_ratio: 0.0,
            horizontal_flip: false,
            vertical_flip: false,
            brightness_delta: 0.0,
            contrast_delta: 0.0,
            save_preview: false,
        };
        let augmenter = Augmenter::new(settings);
        let img = gradient(8);
        let out = augmenter.augment(img.clone(), &mut StdRng::seed_from_u64(1));
        assert_eq!(out, img);
    }

    #[test]
    fn test_brightness_clamps() {
        let mut img = RgbImage::from_pixel(2, 2, Rgb([250, 5, 128]));
        adjust_brightness(&mut img, 0.1);
        assert_eq!(img.get_pixel(0, 0), &Rgb([255, 31, 154]));
    }

    #[test]
    fn test_contrast_on_flat_image_is_noop() {
        let mut img = RgbImage::from_pixel(3, 3, Rgb([90, 90, 90]));
        adjust_contrast(&mut img, 1.5);
        assert_eq!(img.get_pixel(1, 1), &Rgb([90, 90, 90]));
    }
}
