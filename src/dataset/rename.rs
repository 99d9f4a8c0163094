//! リネーム・削除・取り消し
//!
//! - リネーム: クラス内の全画像を `{class}_{index}.jpeg` としてJPEGで保存し直す
//! - クリーンアップ: クラス名で始まらないファイル（リネーム前の元画像）を削除
//! - ロールバック: リネームで作成したファイルを全クラスから削除

use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageError, ImageFormat, ImageReader};
use tracing::{debug, info};

use super::{class_files, class_names, file_name, is_hidden, PassReport};
use crate::error::{PrepareError, PrepareResult};

/// リネーム後のファイル名
pub fn renamed_file_name(class: &str, index: usize) -> String {
    format!("{}_{}.jpeg", class, index)
}

/// リネームで作成されたファイル名か（`{class}_{数字}.jpeg`）
pub fn is_rename_output(class: &str, name: &str) -> bool {
    name.strip_prefix(class)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix(".jpeg"))
        .map(|index| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

fn decode(path: &Path) -> PrepareResult<DynamicImage> {
    ImageReader::open(path)
        .map_err(|e| PrepareError::io(path, e))?
        .with_guessed_format()
        .map_err(|e| PrepareError::io(path, e))?
        .decode()
        .map_err(|e| PrepareError::decode(path, e))
}

/// JPEGで保存
///
/// カラーモードがJPEGに対応していない場合（アルファ付きなど）はRGBへ変換して1回だけ再試行します。
pub fn save_jpeg(img: &DynamicImage, path: &Path) -> PrepareResult<()> {
    match img.save_with_format(path, ImageFormat::Jpeg) {
        Ok(()) => Ok(()),
        Err(ImageError::IoError(e)) => Err(PrepareError::io(path, e)),
        Err(first) => {
            debug!(
                "JPEG保存に失敗したためRGBへ変換して再試行します ({:?}): {}",
                img.color(),
                first
            );
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.save_with_format(path, ImageFormat::Jpeg).map_err(|e| match e {
                ImageError::IoError(io) => PrepareError::io(path, io),
                other => PrepareError::encode(path, other),
            })
        }
    }
}

/// 1クラス分の画像をリネームして保存
///
/// 出力はまず隠しファイルとして書き出し、クラス内の全画像を読み終えてから
/// 正式な名前へ移動します。そのため元画像が出力名と重なっていても読む前に上書きされません。
pub fn rename_class(root: &Path, class: &str) -> PrepareResult<PassReport> {
    let class_dir = root.join(class);
    let mut pass = PassReport::default();
    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();

    info!("リネーム中: {}", class);

    for (index, path) in class_files(&class_dir)?.into_iter().enumerate() {
        let img = match decode(&path) {
            Ok(img) => img,
            Err(e) => {
                pass.skip(e);
                continue;
            }
        };

        let target = class_dir.join(renamed_file_name(class, index));
        let staging = class_dir.join(format!(".{}.partial", renamed_file_name(class, index)));

        match save_jpeg(&img, &staging) {
            Ok(()) => staged.push((staging, target)),
            Err(e) => {
                fs::remove_file(&staging).ok();
                pass.skip(e);
            }
        }
    }

    for (staging, target) in staged {
        match fs::rename(&staging, &target) {
            Ok(()) => pass.processed += 1,
            Err(e) => {
                fs::remove_file(&staging).ok();
                pass.skip(PrepareError::io(&target, e));
            }
        }
    }

    Ok(pass)
}

/// 全クラスの画像をリネーム
pub fn rename_all(root: &Path) -> PrepareResult<PassReport> {
    let mut pass = PassReport::default();
    for class in class_names(root)? {
        pass.merge(rename_class(root, &class)?);
    }
    info!("リネーム完了: {}件, スキップ {}件", pass.processed, pass.skipped.len());
    Ok(pass)
}

/// クラス名で始まらないファイルを削除（隠しファイルは残す）
pub fn cleanup_class(root: &Path, class: &str) -> PrepareResult<PassReport> {
    let class_dir = root.join(class);
    let mut pass = PassReport::default();

    for path in class_files(&class_dir)? {
        let name = file_name(&path);
        if name.starts_with(class) || is_hidden(&name) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("削除: {}", path.display());
                pass.processed += 1;
            }
            Err(e) => pass.skip(PrepareError::io(&path, e)),
        }
    }

    Ok(pass)
}

/// 全クラスでクラス名で始まらないファイルを削除
pub fn cleanup_all(root: &Path) -> PrepareResult<PassReport> {
    let mut pass = PassReport::default();
    for class in class_names(root)? {
        pass.merge(cleanup_class(root, &class)?);
    }
    info!("クリーンアップ完了: {}件削除", pass.processed);
    Ok(pass)
}

/// リネームで作成したファイルを全クラスから削除（リネームの手動取り消し）
pub fn rollback(root: &Path) -> PrepareResult<PassReport> {
    let mut pass = PassReport::default();

    for class in class_names(root)? {
        for path in class_files(&root.join(&class))? {
            if !is_rename_output(&class, &file_name(&path)) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => pass.processed += 1,
                Err(e) => pass.skip(PrepareError::io(&path, e)),
            }
        }
    }

    info!("ロールバック完了: {}件削除", pass.processed);
    Ok(pass)
}
