//! ログ出力の初期化
//!
//! `tracing` によるログ出力を設定します。`RUST_LOG` が設定されていればそちらを優先します。

use std::time::Instant;

use tracing_subscriber::EnvFilter;

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 表示する最小ログレベル
    pub level: LogLevel,
    /// モジュールパスを表示するか
    pub include_target: bool,
    /// ANSIカラーを使用するか
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// デバッグ用の詳細ログ設定
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            ansi_colors: true,
        }
    }

    /// レベルが指定されていれば上書き
    pub fn with_level(mut self, level: Option<LogLevel>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        self
    }
}

/// ログレベル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    /// `RUST_LOG` と同じレベル名（大文字小文字は区別しない）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("不明なログレベルです: {}", other)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// ログ出力を初期化
///
/// 既にグローバルなsubscriberが設定済みの場合はエラーメッセージを返します。
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("ログの初期化に失敗しました: {}", e))
}

/// エポック単位の学習進捗ログ
pub struct TrainingLogger {
    stage: String,
    epoch: usize,
    total_epochs: usize,
    epoch_start: Instant,
    training_start: Instant,
}

impl TrainingLogger {
    pub fn new(stage: &str, total_epochs: usize) -> Self {
        Self {
            stage: stage.to_string(),
            epoch: 0,
            total_epochs,
            epoch_start: Instant::now(),
            training_start: Instant::now(),
        }
    }

    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_start = Instant::now();
        tracing::info!("[{}] エポック {}/{} 開始", self.stage, epoch + 1, self.total_epochs);
    }

    pub fn end_epoch(&self, train_loss: f64, train_accuracy: f64, val_loss: f64, val_accuracy: f64) {
        let epoch_time = self.epoch_start.elapsed();
        tracing::info!(
            "[{}] エポック {}/{} 完了 ({:.1}s) | loss: {:.4} | acc: {:.2}% | val_loss: {:.4} | val_acc: {:.2}%",
            self.stage,
            self.epoch + 1,
            self.total_epochs,
            epoch_time.as_secs_f64(),
            train_loss,
            train_accuracy * 100.0,
            val_loss,
            val_accuracy * 100.0
        );
    }

    pub fn log_early_stop(&self, patience: usize) {
        tracing::warn!(
            "[{}] {}エポック改善がないため早期終了します",
            self.stage,
            patience
        );
    }

    pub fn log_complete(&self, epochs_run: usize, best_accuracy: Option<f64>) {
        let total_time = self.training_start.elapsed();
        tracing::info!(
            "[{}] 学習完了: {}エポック ({:.1}s), 最良val_acc: {}",
            self.stage,
            epochs_run,
            total_time.as_secs_f64(),
            best_accuracy
                .map(|a| format!("{:.2}%", a * 100.0))
                .unwrap_or_else(|| "-".to_string())
        );
    }
}
