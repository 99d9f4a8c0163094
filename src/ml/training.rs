//! 学習データの読み込みとバッチ化
//!
//! `split_dir/<class>/*` 形式のディレクトリから画像パスとクラスIDを列挙し、
//! バッチャーで読み込み・リサイズ・1/255へのスケーリング・（学習時のみ）データ拡張を行います。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use image::{imageops::FilterType, ImageFormat, ImageReader, RgbImage};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::dataset::{class_files, class_names};
use crate::ml::augmentation::Augmenter;

/// 学習対象とする画像の拡張子
const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "gif", "tiff"];

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// 画像フォルダのデータセット（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    samples: Vec<ImageItem>,
    class_names: Vec<String>,
}

impl ImageFolderDataset {
    /// ディレクトリから読み込む（クラスIDはクラス名の昇順）
    pub fn from_directory(split_dir: &Path) -> Result<Self> {
        let classes = class_names(split_dir)
            .with_context(|| format!("クラスディレクトリを列挙できません: {}", split_dir.display()))?;
        if classes.is_empty() {
            anyhow::bail!("クラスディレクトリがありません: {}", split_dir.display());
        }
        Self::with_classes(split_dir, &classes)
    }

    /// 指定されたクラス順序で読み込む
    ///
    /// ディレクトリ内のクラス集合が `class_order` と一致しない場合はエラーになります。
    pub fn with_classes(split_dir: &Path, class_order: &[String]) -> Result<Self> {
        let found = class_names(split_dir)
            .with_context(|| format!("クラスディレクトリを列挙できません: {}", split_dir.display()))?;

        let missing: Vec<&String> = class_order.iter().filter(|c| !found.contains(c)).collect();
        let extra: Vec<&String> = found.iter().filter(|c| !class_order.contains(c)).collect();
        if !missing.is_empty() || !extra.is_empty() {
            anyhow::bail!(
                "クラス構成が一致しません ({}): 不足 {:?}, 余分 {:?}",
                split_dir.display(),
                missing,
                extra
            );
        }

        let mut samples = Vec::new();
        for (label, class) in class_order.iter().enumerate() {
            let files = class_files(&split_dir.join(class))
                .with_context(|| format!("画像を列挙できません: {}/{}", split_dir.display(), class))?;
            samples.extend(
                files
                    .into_iter()
                    .filter(|path| is_image_file(path))
                    .map(|path| ImageItem { path, label }),
            );
        }

        tracing::info!(
            "{}: {}クラス, {}枚",
            split_dir.display(),
            class_order.len(),
            samples.len()
        );
        for (label, class) in class_order.iter().enumerate() {
            let count = samples.iter().filter(|s| s.label == label).count();
            tracing::debug!("  クラス {}: {} ({}枚)", label, class, count);
        }

        Ok(Self {
            samples,
            class_names: class_order.to_vec(),
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// [batch_size, 3, size, size]（画素値は 0..1）
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// データ拡張の設定（学習ストリームのみ）
#[derive(Clone)]
struct AugmentationStream {
    augmenter: Augmenter,
    seed: u64,
    /// 処理済み画像数（画像ごとの乱数シード、プレビューの連番）
    counter: Arc<AtomicU64>,
    preview_dir: Option<PathBuf>,
}

/// バッチャー
#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    augmentation: Option<AugmentationStream>,
}

impl<B: Backend> ImageBatcher<B> {
    /// 検証・テスト用（拡張なし）
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self {
            device,
            image_size,
            augmentation: None,
        }
    }

    /// 学習用（データ拡張あり）
    ///
    /// `preview_dir` を指定すると拡張後の画像を `aug_<番号>.jpeg` として保存します。
    pub fn with_augmentation(mut self, augmenter: Augmenter, seed: u64, preview_dir: Option<PathBuf>) -> Self {
        self.augmentation = Some(AugmentationStream {
            augmenter,
            seed,
            counter: Arc::new(AtomicU64::new(0)),
            preview_dir,
        });
        self
    }

    /// 1枚読み込んでCHW順の 0..1 の値に変換
    fn load_item(&self, item: &ImageItem) -> Result<Vec<f32>> {
        let size = self.image_size as u32;
        let img = ImageReader::open(&item.path)?
            .with_guessed_format()?
            .decode()?
            .resize_exact(size, size, FilterType::Nearest)
            .to_rgb8();

        let img = match &self.augmentation {
            Some(stream) => augment(stream, img),
            None => img,
        };

        Ok(to_chw(&img))
    }
}

fn augment(stream: &AugmentationStream, img: RgbImage) -> RgbImage {
    let n = stream.counter.fetch_add(1, Ordering::Relaxed);
    let mut rng = StdRng::seed_from_u64(stream.seed.wrapping_add(n));
    let img = stream.augmenter.augment(img, &mut rng);

    if let Some(dir) = &stream.preview_dir {
        let path = dir.join(format!("aug_{}.jpeg", n));
        if let Err(e) = img.save_with_format(&path, ImageFormat::Jpeg) {
            tracing::warn!("プレビュー画像を保存できません {}: {}", path.display(), e);
        }
    }

    img
}

/// RGB画像をCHW順に平坦化し 1/255 でスケーリング
pub fn to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);
    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                data.push(img.get_pixel(x, y)[channel] as f32 / 255.0);
            }
        }
    }
    data
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, _device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets = Vec::with_capacity(batch_size);

        for item in items {
            match self.load_item(&item) {
                Ok(data) => pixels.extend_from_slice(&data),
                Err(e) => {
                    tracing::warn!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    // 読めない画像はゼロで埋める
                    pixels.extend(std::iter::repeat(0.0f32).take(3 * size * size));
                }
            }
            targets.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        ImageBatch { images, targets }
    }
}
