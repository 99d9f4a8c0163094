//! 画像データセットの準備と、Xceptionの2段階ファインチューニングによる画像分類器の学習
//!
//! - [`dataset`]: 破損画像の修復・リネーム・不要ファイル削除・リネームの取り消し
//! - [`ml`]: ヘッド学習 → ファインチューニングの転移学習（`ml` フィーチャー）
//! - [`model`]: 設定と学習成果物

#![recursion_limit = "256"]

pub mod dataset;
pub mod error;
pub mod logging;
pub mod model;
#[cfg(feature = "ml")]
pub mod ml;

pub use error::{PrepareError, PrepareResult};
