//! 画像の走査と修復
//!
//! ラスター画像としてデコードできないファイルをSVGとして解釈し、
//! 同名のPNGへラスタライズして元ファイルを削除します。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::{ColorType, ImageReader};
use resvg::{tiny_skia, usvg};
use tracing::{debug, info};

use super::{class_files, class_names, report};
use crate::error::{PrepareError, PrepareResult};

/// デコード済み画像の情報
///
/// 画像本体はファイルごとに開いてすぐ解放し、寸法とカラーモードのみ保持します。
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub color: ColorType,
}

/// クラス名 -> 読み込み可能な画像一覧
pub type ClassImages = BTreeMap<String, Vec<ImageRecord>>;

/// SVGから修復した画像
#[derive(Debug, Clone, PartialEq)]
pub struct RepairedImage {
    /// 元のベクター画像（削除済み）
    pub original: PathBuf,
    /// ラスタライズ後のPNG
    pub rasterized: PathBuf,
}

/// 走査・修復の結果
#[derive(Debug, Default)]
pub struct ScanReport {
    pub classes: ClassImages,
    pub repaired: Vec<RepairedImage>,
    /// 修復できなかったファイル（スキップ済み）
    pub irrecoverable: Vec<PrepareError>,
}

impl ScanReport {
    pub fn num_images(&self) -> usize {
        self.classes.values().map(|v| v.len()).sum()
    }
}

/// 画像を開いて情報を取得
///
/// 形式は拡張子ではなく内容から判定します。
pub fn open_image(path: &Path) -> PrepareResult<ImageRecord> {
    let reader = ImageReader::open(path)
        .map_err(|e| PrepareError::io(path, e))?
        .with_guessed_format()
        .map_err(|e| PrepareError::io(path, e))?;
    let img = reader.decode().map_err(|e| PrepareError::decode(path, e))?;

    Ok(ImageRecord {
        path: path.to_path_buf(),
        width: img.width(),
        height: img.height(),
        color: img.color(),
    })
}

/// SVGファイルをPNGへラスタライズ
///
/// 出力サイズはSVGの宣言サイズに従います。
pub fn rasterize_svg(svg_path: &Path, png_path: &Path) -> PrepareResult<()> {
    let data = fs::read(svg_path).map_err(|e| PrepareError::io(svg_path, e))?;

    let options = usvg::Options::default();
    let tree = usvg::Tree::from_data(&data, &options)
        .map_err(|e| PrepareError::rasterize(svg_path, e.to_string()))?;

    let size = tree.size().to_int_size();
    let mut pixmap = tiny_skia::Pixmap::new(size.width(), size.height()).ok_or_else(|| {
        PrepareError::rasterize(
            svg_path,
            format!("描画先を確保できません: {}x{}", size.width(), size.height()),
        )
    })?;

    resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());

    pixmap
        .save_png(png_path)
        .map_err(|e| PrepareError::rasterize(svg_path, e.to_string()))?;

    Ok(())
}

/// デコード失敗時のフォールバック: SVGとして修復
fn repair_vector(path: &Path) -> PrepareResult<(ImageRecord, RepairedImage)> {
    let png_path = rasterized_path(path);
    rasterize_svg(path, &png_path)?;

    if png_path != path {
        fs::remove_file(path).map_err(|e| PrepareError::io(path, e))?;
    }

    let record = open_image(&png_path)?;
    Ok((
        record,
        RepairedImage {
            original: path.to_path_buf(),
            rasterized: png_path,
        },
    ))
}

/// ラスタライズ先のパス
///
/// 通常は拡張子を `.png` に変えたパスです。別の画像が既にその名前で存在する場合は
/// `{stem}_{n}.png` のうち空いている名前を使います。
fn rasterized_path(path: &Path) -> PathBuf {
    let png_path = path.with_extension("png");
    if png_path == path || !png_path.exists() {
        return png_path;
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut n = 1;
    loop {
        let candidate = path.with_file_name(format!("{}_{}.png", stem, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// 全クラスの画像を読み込んで一覧を返す（修復は行わない）
///
/// デコードできないファイルは診断として返し、一覧には含めません。
pub fn collect_class_images(root: &Path) -> PrepareResult<(ClassImages, Vec<PrepareError>)> {
    let mut classes = ClassImages::new();
    let mut problems = Vec::new();

    for class in class_names(root)? {
        let mut records = Vec::new();
        for path in class_files(&root.join(&class))? {
            match open_image(&path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    report(&e);
                    problems.push(e);
                }
            }
        }
        classes.insert(class, records);
    }

    Ok((classes, problems))
}

/// 全クラスの画像を走査し、壊れたベクター画像を修復
pub fn scan_and_repair(root: &Path) -> PrepareResult<ScanReport> {
    let mut scan = ScanReport::default();

    for class in class_names(root)? {
        let class_dir = root.join(&class);
        let mut records = Vec::new();

        for path in class_files(&class_dir)? {
            match open_image(&path) {
                Ok(record) => records.push(record),
                Err(PrepareError::Decode { .. }) => {
                    debug!("ラスター画像として読めないためSVGとして修復します: {}", path.display());
                    match repair_vector(&path) {
                        Ok((record, repaired)) => {
                            info!(
                                "修復しました: {} -> {}",
                                repaired.original.display(),
                                repaired.rasterized.display()
                            );
                            records.push(record);
                            scan.repaired.push(repaired);
                        }
                        Err(e) => {
                            report(&e);
                            scan.irrecoverable.push(e);
                        }
                    }
                }
                Err(e) => {
                    report(&e);
                    scan.irrecoverable.push(e);
                }
            }
        }

        scan.classes.insert(class, records);
    }

    info!(
        "走査完了: {}クラス, {}枚, 修復 {}件, 修復不能 {}件",
        scan.classes.len(),
        scan.num_images(),
        scan.repaired.len(),
        scan.irrecoverable.len()
    );

    Ok(scan)
}
