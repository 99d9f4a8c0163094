//! アーキテクチャ記述（model.json）
//!
//! ファインチューニング完了後に1回だけ書き出します。重みは含まず、
//! 構成・層リスト・各層の学習可否・クラス名を記録します。

use serde::{Deserialize, Serialize};

use crate::model::config::BackboneSettings;

/// 層の記述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDescription {
    pub index: usize,
    pub name: String,
    /// ファインチューニング段階で学習対象だったか
    pub trainable: bool,
}

/// モデルのアーキテクチャ記述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectureDescription {
    /// "Xception"
    pub architecture: String,
    pub num_classes: usize,
    pub image_size: usize,
    /// クラス名（クラスID順）
    pub class_names: Vec<String>,
    pub freeze_boundary: usize,
    pub backbone: BackboneSettings,
    pub layers: Vec<LayerDescription>,
    /// パラメータ総数
    pub num_params: usize,
    /// 書き出し時刻（RFC3339形式）
    pub trained_at: String,
}

impl ArchitectureDescription {
    /// 新しい記述を作成
    ///
    /// `freeze_boundary` 以降の層を学習対象として記録します。
    pub fn new(
        class_names: Vec<String>,
        image_size: usize,
        freeze_boundary: usize,
        backbone: BackboneSettings,
        layer_names: Vec<String>,
        num_params: usize,
    ) -> Self {
        let layers = layer_names
            .into_iter()
            .enumerate()
            .map(|(index, name)| LayerDescription {
                index,
                name,
                trainable: index >= freeze_boundary,
            })
            .collect();

        Self {
            architecture: "Xception".to_string(),
            num_classes: class_names.len(),
            image_size,
            class_names,
            freeze_boundary,
            backbone,
            layers,
            num_params,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// 学習対象の層数
    pub fn trainable_layers(&self) -> usize {
        self.layers.iter().filter(|l| l.trainable).count()
    }

    /// 記述内容をログに出力
    pub fn log_summary(&self) {
        tracing::info!("=== モデル構成 ===");
        tracing::info!("アーキテクチャ: {}", self.architecture);
        tracing::info!("クラス数: {}", self.num_classes);
        tracing::info!("入力サイズ: {}x{}", self.image_size, self.image_size);
        tracing::info!(
            "学習対象: {} / {} 層 (境界: {})",
            self.trainable_layers(),
            self.layers.len(),
            self.freeze_boundary
        );
        tracing::info!("パラメータ数: {} ({:.2}M)", self.num_params, self.num_params as f64 / 1e6);
    }
}
