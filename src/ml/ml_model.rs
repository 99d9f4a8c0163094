//! 画像分類モデルの定義
//!
//! Xceptionバックボーンに全体平均プーリングと全結合層（クラス数）を接続した分類モデルです。
//! ソフトマックスは損失計算・予測時に適用します。
//!
//! 凍結境界は [`ClassifierConfig::layer_names`] の層リストに対する番号で指定します。
//! バックボーンの層に続いて `global_pool`、`dense` の2層があります。

use std::ops::Range;
use std::path::Path;

use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Linear, LinearConfig,
    },
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
    train::ClassificationOutput,
};

use crate::ml::xception::{Xception, XceptionConfig};
use crate::model::config::ModelSettings;

/// モデル設定
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 299)]
    pub image_size: usize,
    /// バックボーン構成
    pub backbone: XceptionConfig,
}

impl ClassifierConfig {
    /// アプリケーション設定から作成
    pub fn from_settings(settings: &ModelSettings) -> Self {
        let backbone = &settings.backbone;
        let backbone = XceptionConfig::new()
            .with_stem_channels(backbone.stem_channels.to_vec())
            .with_entry_channels(backbone.entry_channels.clone())
            .with_middle_blocks(backbone.middle_blocks)
            .with_exit_block_channels(backbone.exit_block_channels)
            .with_exit_channels(backbone.exit_channels.to_vec());

        ClassifierConfig::new(settings.num_classes, backbone).with_image_size(settings.image_size)
    }

    /// ヘッドを含む全層数
    pub fn num_layers(&self) -> usize {
        self.backbone.num_layers() + 2
    }

    /// 層名の一覧（層番号順）
    pub fn layer_names(&self) -> Vec<String> {
        let mut names = self.backbone.layer_names();
        names.push("global_pool".to_string());
        names.push("dense".to_string());
        names
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> XceptionClassifier<B> {
        let backbone = self.backbone.init(device);
        let features = self.backbone.output_channels();

        tracing::debug!(
            "[Model] 入力: {}x{}, バックボーン: {}層, 特徴次元: {}, クラス数: {}",
            self.image_size,
            self.image_size,
            backbone.num_layers(),
            features,
            self.num_classes
        );

        XceptionClassifier {
            backbone,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dense: LinearConfig::new(features, self.num_classes).init(device),
        }
    }
}

/// 層の間を流れる中間値
///
/// バックボーン内は特徴マップ、プーリング以降は2次元テンソルです。
#[derive(Debug, Clone)]
pub enum Activation<B: Backend> {
    /// 特徴マップ [batch_size, channels, h, w]
    Spatial(Tensor<B, 4>),
    /// プーリング後の特徴 [batch_size, channels]
    Pooled(Tensor<B, 2>),
    /// ロジット [batch_size, num_classes]
    Logits(Tensor<B, 2>),
}

impl<B: Backend> Activation<B> {
    /// 出力層まで到達していればロジットを返す
    pub fn into_logits(self) -> Option<Tensor<B, 2>> {
        match self {
            Activation::Logits(logits) => Some(logits),
            _ => None,
        }
    }
}

impl<B: AutodiffBackend> Activation<B> {
    /// 勾配を追跡しない内部バックエンドの値を自動微分バックエンドへ移す
    pub fn from_inner(inner: Activation<B::InnerBackend>) -> Self {
        match inner {
            Activation::Spatial(x) => Activation::Spatial(Tensor::from_inner(x)),
            Activation::Pooled(x) => Activation::Pooled(Tensor::from_inner(x)),
            Activation::Logits(x) => Activation::Logits(Tensor::from_inner(x)),
        }
    }
}

/// Xception + 全体平均プーリング + 全結合層
#[derive(Module, Debug)]
pub struct XceptionClassifier<B: Backend> {
    pub(crate) backbone: Xception<B>,
    pool: AdaptiveAvgPool2d,
    pub(crate) dense: Linear<B>,
}

impl<B: Backend> XceptionClassifier<B> {
    /// ヘッドを含む全層数
    pub fn num_layers(&self) -> usize {
        self.backbone.num_layers() + 2
    }

    /// バックボーンの層数（ヘッド学習時の凍結境界）
    pub fn backbone_layers(&self) -> usize {
        self.backbone.num_layers()
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]（画素値は 0..1）
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.dense.forward(self.global_pool(features))
    }

    fn global_pool(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, _, _] = x.dims();
        self.pool.forward(x).reshape([batch_size, channels])
    }

    /// 指定範囲の層のみ順伝播
    ///
    /// 範囲を分けて呼び出しても、連続していれば [`forward`](Self::forward) と同じ結果になります。
    pub fn forward_layers(&self, x: Activation<B>, layers: Range<usize>) -> Activation<B> {
        layers.fold(x, |x, index| self.forward_layer(index, x))
    }

    fn forward_layer(&self, index: usize, x: Activation<B>) -> Activation<B> {
        let pool_index = self.backbone.num_layers();
        match x {
            Activation::Spatial(x) if index < pool_index => {
                Activation::Spatial(self.backbone.forward_layer(index, x))
            }
            Activation::Spatial(x) if index == pool_index => Activation::Pooled(self.global_pool(x)),
            Activation::Pooled(x) if index == pool_index + 1 => Activation::Logits(self.dense.forward(x)),
            other => other,
        }
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - (予測クラスID, ロジット)
    pub fn predict(&self, images: Tensor<B, 4>) -> (Tensor<B, 2, Int>, Tensor<B, 2>) {
        let output = self.forward(images);
        let predictions = output.clone().argmax(1);
        (predictions, output)
    }

    /// 順伝播と損失計算
    ///
    /// # 戻り値
    /// - ClassificationOutput（損失、出力、ターゲット）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        classification_output(output, targets)
    }

    /// 学習済みバックボーン重みを読み込む
    pub fn load_backbone(mut self, path: &Path, device: &B::Device) -> Result<Self> {
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        self.backbone = self
            .backbone
            .load_file(path, &recorder, device)
            .with_context(|| format!("バックボーン重みの読み込みに失敗しました: {}", path.display()))?;
        Ok(self)
    }
}

/// ロジットとターゲットから交差エントロピー損失を計算
pub fn classification_output<B: Backend>(
    output: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> ClassificationOutput<B> {
    let loss = CrossEntropyLossConfig::new()
        .init(&output.device())
        .forward(output.clone(), targets.clone());

    ClassificationOutput::new(loss, output, targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::BackboneSettings;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> ClassifierConfig {
        let settings = ModelSettings {
            num_classes: 3,
            image_size: 32,
            freeze_boundary: 0,
            backbone_weights: None,
            backbone: BackboneSettings::tiny(),
        };
        ClassifierConfig::from_settings(&settings)
    }

    #[test]
    fn test_layer_names_match_layer_count() {
        let config = tiny_config();
        let names = config.layer_names();
        assert_eq!(names.len(), config.num_layers());
        assert_eq!(names[names.len() - 2], "global_pool");
        assert_eq!(names[names.len() - 1], "dense");

        let model = config.init::<TestBackend>(&NdArrayDevice::Cpu);
        assert_eq!(model.num_layers(), config.num_layers());
        assert_eq!(model.backbone_layers() + 2, model.num_layers());
    }

    #[test]
    fn test_default_settings_layer_count() {
        let config = ClassifierConfig::from_settings(&ModelSettings::default());
        assert_eq!(config.num_layers(), 18);
        assert_eq!(config.num_classes, 149);
        assert_eq!(config.image_size, 299);
    }

    #[test]
    fn test_split_forward_matches_full_forward() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random(
            [2, 3, 32, 32],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );

        let full = model.forward(images.clone());

        for boundary in [0, 3, model.backbone_layers(), model.num_layers() - 1] {
            let head = model.forward_layers(Activation::Spatial(images.clone()), 0..boundary);
            let split = model
                .forward_layers(head, boundary..model.num_layers())
                .into_logits()
                .expect("logits");
            let diff: f32 = (full.clone() - split).abs().max().into_scalar();
            assert!(diff < 1e-4, "boundary {}: diff {}", boundary, diff);
        }
    }

    #[test]
    fn test_partial_range_has_no_logits() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);

        let features = model.forward_layers(Activation::Spatial(images), 0..model.backbone_layers());
        assert!(features.into_logits().is_none());
    }

    #[test]
    fn test_forward_classification_shapes() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 2], &device);

        let output = model.forward_classification(images.clone(), targets);
        assert_eq!(output.output.dims(), [2, 3]);
        assert_eq!(output.loss.dims(), [1]);

        let (predictions, _) = model.predict(images);
        assert_eq!(predictions.dims(), [2, 1]);
    }
}
