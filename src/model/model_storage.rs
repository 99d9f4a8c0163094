//! 学習成果物の保存・読み込み
//!
//! モデル出力ディレクトリの構成:
//! - top_model_weights.mpk   - ヘッド学習段階の最良重み
//! - model_weights.mpk       - ファインチューニング段階の最良重み
//! - model.json              - アーキテクチャ記述
//! - training_history.json   - エポックごとの指標

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(feature = "ml")]
use burn::{
    module::Module,
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::backend::Backend,
};

/// モデル出力ディレクトリ内の成果物パス
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    model_dir: PathBuf,
}

impl ArtifactPaths {
    pub fn new<P: AsRef<Path>>(model_dir: P) -> Self {
        Self {
            model_dir: model_dir.as_ref().to_path_buf(),
        }
    }

    /// 出力ディレクトリを作成
    pub fn create_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.model_dir)
            .with_context(|| format!("出力ディレクトリを作成できません: {}", self.model_dir.display()))
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn top_weights(&self) -> PathBuf {
        self.model_dir.join("top_model_weights.mpk")
    }

    pub fn final_weights(&self) -> PathBuf {
        self.model_dir.join("model_weights.mpk")
    }

    pub fn architecture(&self) -> PathBuf {
        self.model_dir.join("model.json")
    }

    pub fn history(&self) -> PathBuf {
        self.model_dir.join("training_history.json")
    }
}

/// JSONとして書き出す
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("JSONへの変換に失敗しました")?;
    fs::write(path, json).with_context(|| format!("書き込みに失敗しました: {}", path.display()))
}

/// JSONを読み込む
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("読み込みに失敗しました: {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("JSONの解析に失敗しました: {}", path.display()))
}

/// モデルの重みを保存
///
/// DefaultFileRecorderでf32精度のまま保存します（CompactRecorderはf16で保存してしまう）。
#[cfg(feature = "ml")]
pub fn save_weights<B: Backend, M: Module<B>>(model: &M, path: &Path) -> Result<()> {
    model
        .clone()
        .save_file(path, &DefaultFileRecorder::<FullPrecisionSettings>::new())
        .with_context(|| format!("重みの保存に失敗しました: {}", path.display()))
}

/// 保存済みの重みをモデルへ読み込む
#[cfg(feature = "ml")]
pub fn load_weights<B: Backend, M: Module<B>>(model: M, path: &Path, device: &B::Device) -> Result<M> {
    if !path.exists() {
        anyhow::bail!("重みファイルが存在しません: {}", path.display());
    }
    model
        .load_file(path, &DefaultFileRecorder::<FullPrecisionSettings>::new(), device)
        .with_context(|| format!("重みの読み込みに失敗しました: {}", path.display()))
}
