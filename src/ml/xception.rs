//! Xceptionバックボーン
//!
//! 深さ方向分離畳み込み（depthwise + pointwise）と残差接続からなる特徴抽出器です。
//! ファインチューニングで層単位の凍結を行うため、ネットワークを以下の層リストとして扱います。
//!
//! | 番号 | 層 |
//! |------|----|
//! | 0, 1 | ステム畳み込み |
//! | 2..  | エントリーフローのブロック |
//! |      | ミドルフローのブロック |
//! |      | エグジットフローのブロック |
//! | 末尾2つ | エグジットフローの分離畳み込み |

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// バックボーン構成
#[derive(Config, Debug)]
pub struct XceptionConfig {
    /// ステムの畳み込みチャネル数
    #[config(default = "vec![32, 64]")]
    pub stem_channels: Vec<usize>,
    /// エントリーフローの各ブロックの出力チャネル数
    #[config(default = "vec![128, 256, 728]")]
    pub entry_channels: Vec<usize>,
    /// ミドルフローのブロック数（チャネル数はエントリーフロー最終ブロックと同じ）
    #[config(default = 8)]
    pub middle_blocks: usize,
    #[config(default = 1024)]
    pub exit_block_channels: usize,
    /// エグジットフロー末尾の分離畳み込みチャネル数
    #[config(default = "vec![1536, 2048]")]
    pub exit_channels: Vec<usize>,
}

impl XceptionConfig {
    /// 層数（凍結境界の単位）
    pub fn num_layers(&self) -> usize {
        self.stem_channels.len()
            + self.entry_channels.len()
            + self.middle_blocks
            + 1
            + self.exit_channels.len()
    }

    /// 層名の一覧（層番号順）
    pub fn layer_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.num_layers());
        names.extend((1..=self.stem_channels.len()).map(|i| format!("stem_conv{}", i)));
        names.extend((1..=self.entry_channels.len()).map(|i| format!("entry_block{}", i)));
        names.extend((1..=self.middle_blocks).map(|i| format!("middle_block{}", i)));
        names.push("exit_block".to_string());
        names.extend((1..=self.exit_channels.len()).map(|i| format!("exit_sepconv{}", i)));
        names
    }

    /// 最終特徴マップのチャネル数
    pub fn output_channels(&self) -> usize {
        self.exit_channels
            .last()
            .copied()
            .unwrap_or(self.exit_block_channels)
    }

    /// バックボーンを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Xception<B> {
        let mut stem = Vec::with_capacity(self.stem_channels.len());
        let mut channels = 3;
        for (i, &out) in self.stem_channels.iter().enumerate() {
            // 1層目のみストライド2、いずれもパディングなし
            let stride = if i == 0 { 2 } else { 1 };
            stem.push(StemConv::new(channels, out, stride, device));
            channels = out;
        }

        let mut blocks = Vec::new();
        for (i, &out) in self.entry_channels.iter().enumerate() {
            blocks.push(XceptionBlock::downsample(channels, &[out, out], i > 0, device));
            channels = out;
        }
        for _ in 0..self.middle_blocks {
            blocks.push(XceptionBlock::identity(channels, 3, device));
        }
        blocks.push(XceptionBlock::downsample(
            channels,
            &[channels, self.exit_block_channels],
            true,
            device,
        ));
        channels = self.exit_block_channels;

        let mut exit_convs = Vec::with_capacity(self.exit_channels.len());
        for &out in &self.exit_channels {
            exit_convs.push(SeparableUnit::new(channels, out, false, device));
            channels = out;
        }

        Xception {
            stem,
            blocks,
            exit_convs,
            activation: Relu::new(),
        }
    }
}

/// 深さ方向分離畳み込み: 3x3 depthwise（チャネルごと）+ 1x1 pointwise
#[derive(Module, Debug)]
pub struct SeparableConv2d<B: Backend> {
    pub(crate) depthwise: Conv2d<B>,
    pub(crate) pointwise: Conv2d<B>,
}

impl<B: Backend> SeparableConv2d<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            depthwise: Conv2dConfig::new([in_channels, in_channels], [3, 3])
                .with_groups(in_channels)
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            pointwise: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pointwise.forward(self.depthwise.forward(x))
    }
}

/// [ReLU] -> 分離畳み込み -> BatchNorm
#[derive(Module, Debug)]
pub struct SeparableUnit<B: Backend> {
    pre_activation: Option<Relu>,
    pub(crate) conv: SeparableConv2d<B>,
    pub(crate) norm: BatchNorm<B>,
}

impl<B: Backend> SeparableUnit<B> {
    fn new(in_channels: usize, out_channels: usize, pre_activation: bool, device: &B::Device) -> Self {
        Self {
            pre_activation: pre_activation.then(Relu::new),
            conv: SeparableConv2d::new(in_channels, out_channels, device),
            norm: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.pre_activation {
            Some(relu) => relu.forward(x),
            None => x,
        };
        self.norm.forward(self.conv.forward(x))
    }
}

/// 通常の畳み込み -> BatchNorm -> ReLU
#[derive(Module, Debug)]
pub struct StemConv<B: Backend> {
    pub(crate) conv: Conv2d<B>,
    pub(crate) norm: BatchNorm<B>,
    activation: Relu,
}

impl<B: Backend> StemConv<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(out_channels).init(device),
            activation: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.activation.forward(self.norm.forward(self.conv.forward(x)))
    }
}

/// 残差側の射影: 1x1畳み込み（ストライド2）-> BatchNorm
#[derive(Module, Debug)]
pub struct Shortcut<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B>,
}

impl<B: Backend> Shortcut<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([2, 2])
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }
}

/// 残差ブロック
///
/// 射影なし・プーリングなしの場合はミドルフローの恒等残差ブロックになります。
#[derive(Module, Debug)]
pub struct XceptionBlock<B: Backend> {
    shortcut: Option<Shortcut<B>>,
    pub(crate) units: Vec<SeparableUnit<B>>,
    pool: Option<MaxPool2d>,
}

impl<B: Backend> XceptionBlock<B> {
    /// 解像度を半分にするブロック（エントリー・エグジットフロー）
    fn downsample(
        in_channels: usize,
        unit_channels: &[usize],
        activate_first: bool,
        device: &B::Device,
    ) -> Self {
        let mut units = Vec::with_capacity(unit_channels.len());
        let mut channels = in_channels;
        for (i, &out) in unit_channels.iter().enumerate() {
            units.push(SeparableUnit::new(channels, out, i > 0 || activate_first, device));
            channels = out;
        }

        Self {
            shortcut: Some(Shortcut::new(in_channels, channels, device)),
            units,
            // 3x3 / ストライド2 / パディング1: 射影側の出力サイズ ceil(n/2) と一致
            pool: Some(
                MaxPool2dConfig::new([3, 3])
                    .with_strides([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(),
            ),
        }
    }

    /// 解像度・チャネル数を保つブロック（ミドルフロー）
    fn identity(channels: usize, depth: usize, device: &B::Device) -> Self {
        Self {
            shortcut: None,
            units: (0..depth)
                .map(|_| SeparableUnit::new(channels, channels, true, device))
                .collect(),
            pool: None,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = match &self.shortcut {
            Some(shortcut) => shortcut.forward(x.clone()),
            None => x.clone(),
        };

        let mut x = x;
        for unit in &self.units {
            x = unit.forward(x);
        }
        if let Some(pool) = &self.pool {
            x = pool.forward(x);
        }

        x + residual
    }
}

/// Xceptionバックボーン（分類層なし）
#[derive(Module, Debug)]
pub struct Xception<B: Backend> {
    pub(crate) stem: Vec<StemConv<B>>,
    pub(crate) blocks: Vec<XceptionBlock<B>>,
    pub(crate) exit_convs: Vec<SeparableUnit<B>>,
    activation: Relu,
}

impl<B: Backend> Xception<B> {
    pub fn num_layers(&self) -> usize {
        self.stem.len() + self.blocks.len() + self.exit_convs.len()
    }

    /// 1層分の順伝播（範囲外の番号は恒等写像）
    pub fn forward_layer(&self, index: usize, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let stem_end = self.stem.len();
        let blocks_end = stem_end + self.blocks.len();

        if let Some(stem) = self.stem.get(index) {
            stem.forward(x)
        } else if let Some(block) = self.blocks.get(index.wrapping_sub(stem_end)) {
            block.forward(x)
        } else if let Some(conv) = self.exit_convs.get(index.wrapping_sub(blocks_end)) {
            self.activation.forward(conv.forward(x))
        } else {
            x
        }
    }

    /// 全層の順伝播
    ///
    /// # 引数
    /// - `images`: [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - 特徴マップ [batch_size, channels, h, w]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        (0..self.num_layers()).fold(images, |x, index| self.forward_layer(index, x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn tiny() -> XceptionConfig {
        XceptionConfig::new()
            .with_stem_channels(vec![4, 8])
            .with_entry_channels(vec![8, 8, 16])
            .with_middle_blocks(1)
            .with_exit_block_channels(16)
            .with_exit_channels(vec![16, 16])
    }

    #[test]
    fn test_default_layer_list() {
        let config = XceptionConfig::new();
        let names = config.layer_names();
        assert_eq!(config.num_layers(), 16);
        assert_eq!(names.len(), 16);
        assert_eq!(names[0], "stem_conv1");
        assert_eq!(names[2], "entry_block1");
        assert_eq!(names[13], "exit_block");
        assert_eq!(names[14], "exit_sepconv1");
        assert_eq!(config.output_channels(), 2048);
    }

    #[test]
    fn test_tiny_forward_shape() {
        let device = NdArrayDevice::Cpu;
        let config = tiny();
        let model = config.init::<TestBackend>(&device);
        assert_eq!(model.num_layers(), config.num_layers());

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let features = model.forward(images);

        // 32 -> 15 -> 13 -> 7 -> 4 -> 2 -> (middle) 2 -> (exit) 1
        assert_eq!(features.dims(), [2, 16, 1, 1]);
    }

    #[test]
    fn test_layer_out_of_range_is_identity() {
        let device = NdArrayDevice::Cpu;
        let model = tiny().init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::ones([1, 16, 1, 1], &device);

        let y = model.forward_layer(model.num_layers(), x.clone());
        assert_eq!(y.into_data(), x.into_data());
    }
}
