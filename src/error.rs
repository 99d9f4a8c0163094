//! データセット準備処理のエラー型
//!
//! 画像1枚ごとの失敗はパス付きの型付きエラーとして報告され、処理全体は継続します。

use std::path::{Path, PathBuf};

use thiserror::Error;

/// データセット準備中に発生するエラー
#[derive(Error, Debug)]
pub enum PrepareError {
    /// ラスター画像としてデコードできない
    #[error("画像のデコードに失敗しました '{path}': {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// SVGとして解釈・ラスタライズできない
    #[error("ベクター画像のラスタライズに失敗しました '{path}': {reason}")]
    Rasterize { path: PathBuf, reason: String },

    /// JPEGとして保存できない（RGB変換後の再試行も失敗）
    #[error("JPEGへのエンコードに失敗しました '{path}': {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// ファイルシステム操作の失敗
    #[error("ファイル操作に失敗しました '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PrepareError {
    pub fn decode(path: &Path, source: image::ImageError) -> Self {
        Self::Decode {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn rasterize(path: &Path, reason: impl Into<String>) -> Self {
        Self::Rasterize {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn encode(path: &Path, source: image::ImageError) -> Self {
        Self::Encode {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// 問題のあったファイルのパス
    pub fn path(&self) -> &Path {
        match self {
            Self::Decode { path, .. }
            | Self::Rasterize { path, .. }
            | Self::Encode { path, .. }
            | Self::Io { path, .. } => path,
        }
    }

    /// 診断出力用の短い種別名
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "decode",
            Self::Rasterize { .. } => "rasterize",
            Self::Encode { .. } => "encode",
            Self::Io { .. } => "io",
        }
    }
}

pub type PrepareResult<T> = std::result::Result<T, PrepareError>;
