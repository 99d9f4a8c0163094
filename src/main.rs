//! 転移学習CLI
//!
//! ```text
//! image_finetune <data_dir> <model_dir> [--config config.json] [-v]
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use image_finetune_lib::logging::{init_logging, LogConfig, LogLevel};
use image_finetune_lib::ml::run_on_configured_device;
use image_finetune_lib::model::config::AppConfig;

/// Xceptionの2段階ファインチューニングで画像分類器を学習
#[derive(Parser, Debug)]
#[command(name = "image_finetune")]
#[command(about = "Two-stage Xception fine-tuning on an image folder dataset", long_about = None)]
struct Cli {
    /// train/ val/ test/ を含むデータディレクトリ
    data_dir: PathBuf,

    /// 重みとモデル記述の出力先
    model_dir: PathBuf,

    /// 設定ファイル（省略時は ./config.json、なければデフォルト設定。指定したファイルが読めない場合はエラー）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 詳細ログを出力
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// ログレベル（trace, debug, info, warn, error）。`RUST_LOG` が優先されます
    #[arg(long)]
    log_level: Option<LogLevel>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = if cli.verbose { LogConfig::verbose() } else { LogConfig::default() }
        .with_level(cli.log_level);
    if let Err(e) = init_logging(&log_config) {
        eprintln!("{}", e);
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("学習に失敗しました: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = AppConfig::resolve(cli.config.as_deref())?;
    config.display();
    config.validate()?;

    let preview_dir = cli.data_dir.join("preview");
    std::fs::create_dir_all(&preview_dir)
        .with_context(|| format!("ディレクトリを作成できません: {}", preview_dir.display()))?;
    std::fs::create_dir_all(&cli.model_dir)
        .with_context(|| format!("ディレクトリを作成できません: {}", cli.model_dir.display()))?;

    let history = run_on_configured_device(&config, &cli.data_dir, &cli.model_dir)?;

    for stage in &history.stages {
        info!(
            "{}: {}エポック, 最良 val_acc {}",
            stage.name,
            stage.epochs.len(),
            stage
                .best_val_accuracy
                .map(|a| format!("{:.2}%", a * 100.0))
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}
