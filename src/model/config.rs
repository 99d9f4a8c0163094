//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・モデル・学習・データ拡張の設定をJSON形式で読み込みます。
//! クラス数や凍結境界などバックボーンに依存する値もここで明示的に設定し、起動時に検証します。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// バックボーン（Xception）の構成
///
/// 既定値はImageNet学習済みXceptionと同じチャネル数・ブロック数です。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackboneSettings {
    /// ステムの畳み込みチャネル数 [conv1, conv2]
    pub stem_channels: [usize; 2],
    /// エントリーフローの各ブロックの出力チャネル数
    pub entry_channels: Vec<usize>,
    /// ミドルフローのブロック数（チャネル数はエントリーフロー最終ブロックと同じ）
    pub middle_blocks: usize,
    /// エグジットフローのブロック出力チャネル数
    pub exit_block_channels: usize,
    /// エグジットフロー末尾の分離畳み込みチャネル数
    pub exit_channels: [usize; 2],
}

impl Default for BackboneSettings {
    fn default() -> Self {
        Self {
            stem_channels: [32, 64],
            entry_channels: vec![128, 256, 728],
            middle_blocks: 8,
            exit_block_channels: 1024,
            exit_channels: [1536, 2048],
        }
    }
}

impl BackboneSettings {
    /// テストや動作確認用の小さな構成
    pub fn tiny() -> Self {
        Self {
            stem_channels: [4, 8],
            entry_channels: vec![8, 8, 16],
            middle_blocks: 1,
            exit_block_channels: 16,
            exit_channels: [16, 16],
        }
    }

    /// バックボーンの層数（凍結境界の指定単位）
    ///
    /// stem(2) + entry + middle + exit block(1) + exit conv(2)
    pub fn num_layers(&self) -> usize {
        2 + self.entry_channels.len() + self.middle_blocks + 1 + 2
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 分類クラス数（学習データのクラスディレクトリ数と一致する必要がある）
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// この層番号より前の層をファインチューニング時に凍結する
    pub freeze_boundary: usize,
    /// 学習済みバックボーン重みファイル（Burnのレコード形式）
    #[serde(default)]
    pub backbone_weights: Option<PathBuf>,
    /// バックボーン構成
    #[serde(default)]
    pub backbone: BackboneSettings,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            num_classes: 149,
            image_size: 299,
            // エグジットフロー末尾の分離畳み込み以降（最終ブロック + ヘッド）を再学習
            freeze_boundary: 14,
            backbone_weights: None,
            backbone: BackboneSettings::default(),
        }
    }
}

impl ModelSettings {
    /// ヘッドを含む全層数: バックボーン + プーリング + 全結合
    pub fn num_layers(&self) -> usize {
        self.backbone.num_layers() + 2
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数（ファインチューニング段階）
    pub num_epochs: usize,
    /// ヘッド学習段階のエポック数 = num_epochs / top_epoch_divisor
    pub top_epoch_divisor: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// ヘッド学習段階の学習率
    pub learning_rate: f64,
    /// ファインチューニング段階の学習率
    pub fine_tune_learning_rate: f64,
    /// 早期終了の猶予エポック数
    pub patience: usize,
    /// ランダムシード
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 50,
            top_epoch_divisor: 5,
            batch_size: 32,
            num_workers: 4,
            learning_rate: 1e-3,
            fine_tune_learning_rate: 1e-4,
            patience: 5,
            seed: 9,
        }
    }
}

impl TrainingSettings {
    /// ヘッド学習段階のエポック数（最低1）
    pub fn top_epochs(&self) -> usize {
        (self.num_epochs / self.top_epoch_divisor.max(1)).max(1)
    }
}

/// データ拡張設定（学習データのみに適用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentationSettings {
    /// 回転角・せん断角の最大値（度）とズーム幅（1.0 ± ratio）
    pub transformation_ratio: f32,
    pub horizontal_flip: bool,
    pub vertical_flip: bool,
    /// 明るさの変動幅（±）
    pub brightness_delta: f32,
    /// コントラストの変動幅（1.0 ± delta）
    pub contrast_delta: f32,
    /// 拡張後の画像を preview ディレクトリへ保存する
    #[serde(default)]
    pub save_preview: bool,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            transformation_ratio: 0.05,
            horizontal_flip: true,
            vertical_flip: true,
            brightness_delta: 0.1,
            contrast_delta: 0.1,
            save_preview: false,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// データ拡張設定
    #[serde(default)]
    pub augmentation: AugmentationSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む
    ///
    /// パスを明示した場合は読み込みに失敗するとエラーになります。
    /// 省略時はデフォルトパスを読み、存在しないか読めない場合はデフォルト設定を返します。
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let config = Self::load(path)
                    .with_context(|| format!("設定ファイルを読み込めません: {}", path.display()))?;
                tracing::info!("設定ファイルを読み込みました: {}", path.display());
                Ok(config)
            }
            None => Ok(Self::load_or_default()),
        }
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}. デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 値の整合性を検証
    pub fn validate(&self) -> anyhow::Result<()> {
        let model = &self.model;
        let training = &self.training;

        if model.num_classes < 2 {
            anyhow::bail!("num_classes は2以上である必要があります: {}", model.num_classes);
        }
        // ストライド2の層が4つあるため 1/16 以下になっても1ピクセル残るサイズが必要
        if model.image_size < 32 {
            anyhow::bail!("image_size が小さすぎます: {} (最小32)", model.image_size);
        }
        if model.freeze_boundary > model.num_layers() {
            anyhow::bail!(
                "freeze_boundary ({}) が層数 ({}) を超えています",
                model.freeze_boundary,
                model.num_layers()
            );
        }
        if model.backbone.entry_channels.is_empty() {
            anyhow::bail!("entry_channels が空です");
        }
        if let Some(ref weights) = model.backbone_weights {
            if !weights.exists() {
                anyhow::bail!("バックボーン重みファイルが見つかりません: {}", weights.display());
            }
        }
        if training.num_epochs == 0 || training.batch_size == 0 {
            anyhow::bail!("num_epochs と batch_size は1以上である必要があります");
        }
        if training.top_epoch_divisor == 0 {
            anyhow::bail!("top_epoch_divisor は1以上である必要があります");
        }
        if !(training.learning_rate > 0.0 && training.fine_tune_learning_rate > 0.0) {
            anyhow::bail!("学習率は正の値である必要があります");
        }
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        tracing::info!("=== アプリケーション設定 ===");
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::info!("分類クラス数: {}", self.model.num_classes);
        tracing::info!("入力サイズ: {}x{}", self.model.image_size, self.model.image_size);
        tracing::info!(
            "凍結境界: {} / {} 層",
            self.model.freeze_boundary,
            self.model.num_layers()
        );
        match self.model.backbone_weights {
            Some(ref path) => tracing::info!("バックボーン重み: {}", path.display()),
            None => tracing::info!("バックボーン重み: なし（ランダム初期化）"),
        }
        tracing::info!(
            "エポック数: {} (ヘッド学習: {})",
            self.training.num_epochs,
            self.training.top_epochs()
        );
        tracing::info!("バッチサイズ: {}", self.training.batch_size);
        tracing::info!(
            "学習率: {} / ファインチューニング: {}",
            self.training.learning_rate,
            self.training.fine_tune_learning_rate
        );
        tracing::info!("シード: {}", self.training.seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.model.num_classes, 149);
        assert_eq!(config.model.image_size, 299);
        assert_eq!(config.training.num_epochs, 50);
        assert_eq!(config.training.top_epochs(), 10);
        assert_eq!(config.training.patience, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_layer_count() {
        let model = ModelSettings::default();
        // stem 2 + entry 3 + middle 8 + exit block 1 + exit conv 2 + pool + dense
        assert_eq!(model.backbone.num_layers(), 16);
        assert_eq!(model.num_layers(), 18);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.model.num_classes, deserialized.model.num_classes);
        assert_eq!(config.model.backbone, deserialized.model.backbone);
    }

    #[test]
    fn test_validate_rejects_boundary_past_output() {
        let mut config = AppConfig::default();
        config.model.freeze_boundary = config.model.num_layers() + 1;
        assert!(config.validate().is_err());

        config.model.freeze_boundary = config.model.num_layers();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_weights() {
        let mut config = AppConfig::default();
        config.model.backbone_weights = Some(PathBuf::from("/nonexistent/xception.mpk"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_top_epochs_at_least_one() {
        let training = TrainingSettings {
            num_epochs: 3,
            ..Default::default()
        };
        assert_eq!(training.top_epochs(), 1);
    }

    #[test]
    fn test_resolve_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.device_type = DeviceType::Cpu;
        config.model.num_classes = 2;
        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = AppConfig::resolve(Some(&path)).unwrap();
        assert_eq!(loaded.device_type, DeviceType::Cpu);
        assert_eq!(loaded.model.num_classes, 2);
    }

    #[test]
    fn test_resolve_missing_explicit_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::resolve(Some(&dir.path().join("missing.json")));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_malformed_explicit_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ \"model\": ").unwrap();
        assert!(AppConfig::resolve(Some(&path)).is_err());
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
