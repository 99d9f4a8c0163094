//! データセット準備CLI
//!
//! ```text
//! prepare scan     [--data-dir DIR]
//! prepare rename   [--data-dir DIR] [--class NAME]
//! prepare cleanup  [--data-dir DIR] [--class NAME]
//! prepare rollback [--data-dir DIR]
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use image_finetune_lib::dataset::{self, PassReport};
use image_finetune_lib::logging::{init_logging, LogConfig, LogLevel};
use image_finetune_lib::PrepareResult;

#[derive(Parser, Debug)]
#[command(name = "prepare")]
#[command(about = "Repair, rename and clean an image-per-class dataset", long_about = None)]
struct Cli {
    /// クラスごとのサブディレクトリを含むデータセットのルート
    #[arg(long, global = true, default_value = "../data/dataset")]
    data_dir: PathBuf,

    /// 詳細ログを出力
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    /// ログレベル（trace, debug, info, warn, error）。`RUST_LOG` が優先されます
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 全画像を開いて検査し、壊れたベクター画像をPNGに修復
    Scan,

    /// 画像を `<class>_<n>.jpeg` として保存し直す
    Rename {
        /// 対象クラス（省略時は全クラス）
        #[arg(long)]
        class: Option<String>,
    },

    /// クラス名で始まらないファイルを削除
    Cleanup {
        /// 対象クラス（省略時は全クラス）
        #[arg(long)]
        class: Option<String>,
    },

    /// リネームで作成したファイルを削除
    Rollback,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = if cli.verbose { LogConfig::verbose() } else { LogConfig::default() }
        .with_level(cli.log_level);
    if let Err(e) = init_logging(&log_config) {
        eprintln!("{}", e);
    }

    match run(&cli.data_dir, &cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(root: &Path, command: &Commands) -> PrepareResult<()> {
    info!("データセット: {}", root.display());

    match command {
        Commands::Scan => {
            let scan = dataset::scan_and_repair(root)?;
            for (class, images) in &scan.classes {
                info!("{}: {}枚", class, images.len());
            }
        }
        Commands::Rename { class } => {
            let pass = match class {
                Some(class) => dataset::rename_class(root, class)?,
                None => dataset::rename_all(root)?,
            };
            summarize("リネーム", &pass);
        }
        Commands::Cleanup { class } => {
            let pass = match class {
                Some(class) => dataset::cleanup_class(root, class)?,
                None => dataset::cleanup_all(root)?,
            };
            summarize("削除", &pass);
        }
        Commands::Rollback => {
            let pass = dataset::rollback(root)?;
            summarize("取り消し", &pass);
        }
    }
    Ok(())
}

fn summarize(action: &str, pass: &PassReport) {
    info!("{}: {}件, スキップ {}件", action, pass.processed, pass.skipped.len());
}
