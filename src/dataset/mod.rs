//! データセット準備
//!
//! クラスごとのサブディレクトリに画像が置かれたディレクトリツリーに対して、
//! 破損画像の修復・リネーム・不要ファイル削除・リネームの取り消しを行います。
//!
//! ```text
//! data/dataset/
//!     Abra/
//!         Abra_0.jpeg
//!         ...
//!     Pikachu/
//!         ...
//! ```
//!
//! いずれの処理もトランザクションではありません。ファイル単位の失敗は
//! [`PassReport`] に記録してログに出力し、そのファイルをスキップして続行します。

pub mod rename;
pub mod repair;

pub use rename::{cleanup_all, cleanup_class, is_rename_output, rename_all, rename_class, rollback};
pub use repair::{collect_class_images, rasterize_svg, scan_and_repair, ClassImages, ImageRecord, RepairedImage, ScanReport};

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{PrepareError, PrepareResult};

/// 1回の処理パスの結果
#[derive(Debug, Default)]
pub struct PassReport {
    /// 正常に処理したファイル数
    pub processed: usize,
    /// スキップしたファイルとその理由
    pub skipped: Vec<PrepareError>,
}

impl PassReport {
    /// 他のパスの結果を統合
    pub fn merge(&mut self, other: PassReport) {
        self.processed += other.processed;
        self.skipped.extend(other.skipped);
    }

    pub(crate) fn skip(&mut self, err: PrepareError) {
        report(&err);
        self.skipped.push(err);
    }
}

/// 診断をログに出力（例外にはしない）
pub(crate) fn report(err: &PrepareError) {
    tracing::warn!(path = %err.path().display(), kind = err.kind(), "{}", err);
}

/// 隠しファイル・システムファイル（`.DS_Store` など）かどうか
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// ルート直下のクラスディレクトリ名を名前順で取得
pub fn class_names(root: &Path) -> PrepareResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| PrepareError::io(root, e.into()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_hidden(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

/// クラスディレクトリ内の通常ファイル（隠しファイルを除く）を名前順で取得
///
/// 列挙順はファイルシステムに依存しないよう名前でソートします。
pub fn class_files(class_dir: &Path) -> PrepareResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(class_dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| PrepareError::io(class_dir, e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if is_hidden(&entry.file_name().to_string_lossy()) {
            continue;
        }
        files.push(entry.into_path());
    }
    Ok(files)
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
