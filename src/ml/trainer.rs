//! 2段階の転移学習
//!
//! 1. ヘッド学習: バックボーン全体を凍結し、プーリング + 全結合層のみ学習
//! 2. ファインチューニング: 凍結境界より前の層を凍結し、以降の層を低い学習率で学習
//!
//! 凍結した層は勾配を追跡しない内部バックエンド上で推論モードのまま実行するため、
//! 重みとBatchNormの統計量は学習前後でビット単位で変化しません。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::logging::TrainingLogger;
use crate::ml::augmentation::Augmenter;
use crate::ml::ml_model::{classification_output, Activation, ClassifierConfig, XceptionClassifier};
use crate::ml::training::{ImageBatch, ImageBatcher, ImageFolderDataset};
use crate::model::config::AppConfig;
use crate::model::{load_weights, save_weights, write_json, ArchitectureDescription, ArtifactPaths};

/// 画像バッチのデータローダー
///
/// 学習用は自動微分バックエンド、評価用はその内部バックエンドで作成します。
pub type ImageLoader<B> = Arc<dyn DataLoader<B, ImageBatch<B>>>;

/// 早期終了の監視対象
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Monitor {
    ValAccuracy,
    ValLoss,
}

impl Monitor {
    fn improved(&self, current: f64, best: f64) -> bool {
        match self {
            Monitor::ValAccuracy => current > best,
            Monitor::ValLoss => current < best,
        }
    }
}

/// 1段階分の学習計画
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub name: String,
    pub epochs: usize,
    /// この層番号より前を凍結
    pub freeze_boundary: usize,
    pub learning_rate: f64,
    /// 最良重みの保存先
    pub checkpoint: PathBuf,
    pub early_stop: Monitor,
    pub patience: usize,
}

/// 評価結果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
}

/// 1エポック分の指標
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    /// このエポックで重みを保存したか
    pub checkpointed: bool,
}

/// 1段階分の履歴
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageHistory {
    pub name: String,
    pub freeze_boundary: usize,
    pub learning_rate: f64,
    pub epochs: Vec<EpochMetrics>,
    pub best_val_accuracy: Option<f64>,
    pub stopped_early: bool,
}

/// 学習全体の履歴（training_history.json）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub class_names: Vec<String>,
    pub stages: Vec<StageHistory>,
    /// テストデータでの評価（test/ がない場合は None）
    pub test: Option<EvalMetrics>,
}

/// エポックごとの判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochOutcome {
    /// 最良重みを保存する
    pub checkpoint: bool,
    /// 早期終了する
    pub stop: bool,
}

/// チェックポイント保存と早期終了の判定
///
/// - 保存: 検証精度が過去最良を厳密に上回ったとき（初回は必ず保存）
/// - 早期終了: 監視対象が `patience` エポック連続で改善しなかったとき
#[derive(Debug, Clone)]
pub struct EpochMonitor {
    early_stop: Monitor,
    patience: usize,
    best_accuracy: Option<f64>,
    best_monitored: Option<f64>,
    wait: usize,
}

impl EpochMonitor {
    pub fn new(early_stop: Monitor, patience: usize) -> Self {
        Self {
            early_stop,
            patience,
            best_accuracy: None,
            best_monitored: None,
            wait: 0,
        }
    }

    pub fn observe(&mut self, val_loss: f64, val_accuracy: f64) -> EpochOutcome {
        let checkpoint = match self.best_accuracy {
            None => true,
            Some(best) => val_accuracy > best,
        };
        if checkpoint {
            self.best_accuracy = Some(val_accuracy);
        }

        let current = match self.early_stop {
            Monitor::ValAccuracy => val_accuracy,
            Monitor::ValLoss => val_loss,
        };
        let improved = match self.best_monitored {
            None => true,
            Some(best) => self.early_stop.improved(current, best),
        };

        let stop = if improved {
            self.best_monitored = Some(current);
            self.wait = 0;
            false
        } else {
            self.wait += 1;
            self.wait >= self.patience
        };

        EpochOutcome { checkpoint, stop }
    }

    pub fn best_accuracy(&self) -> Option<f64> {
        self.best_accuracy
    }
}

fn count_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = output.dims();
    let predictions = output.argmax(1).reshape([batch_size]);
    let correct: i64 = predictions.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}

/// 集計用
#[derive(Default)]
struct Accumulator {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl Accumulator {
    fn add(&mut self, loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += loss * batch_size as f64;
        self.correct += correct;
        self.samples += batch_size;
    }

    fn finish(&self) -> EvalMetrics {
        if self.samples == 0 {
            return EvalMetrics {
                loss: 0.0,
                accuracy: 0.0,
                samples: 0,
            };
        }
        EvalMetrics {
            loss: self.loss_sum / self.samples as f64,
            accuracy: self.correct as f64 / self.samples as f64,
            samples: self.samples,
        }
    }
}

/// 1エポック学習（データを1周）
///
/// `freeze_boundary` より前の層は凍結し、以降の層のみ更新します。
/// 境界が層数以上の場合は損失・精度の計算のみ行います。
pub fn train_epoch<B, O>(
    mut model: XceptionClassifier<B>,
    optimizer: &mut O,
    loader: &dyn DataLoader<B, ImageBatch<B>>,
    freeze_boundary: usize,
    learning_rate: f64,
) -> Result<(XceptionClassifier<B>, EvalMetrics)>
where
    B: AutodiffBackend,
    O: Optimizer<XceptionClassifier<B>, B>,
{
    let num_layers = model.num_layers();
    let boundary = freeze_boundary.min(num_layers);
    // 凍結部分の重みはエポック中に変化しない
    let frozen = model.valid();
    let mut acc = Accumulator::default();

    for batch in loader.iter() {
        let batch_size = batch.targets.dims()[0];

        let features = frozen.forward_layers(Activation::Spatial(batch.images.inner()), 0..boundary);
        let logits = model
            .forward_layers(Activation::from_inner(features), boundary..num_layers)
            .into_logits()
            .context("順伝播が出力層に到達しませんでした")?;

        let output = classification_output(logits, batch.targets);
        let loss_value: f64 = output.loss.clone().into_scalar().elem();
        acc.add(loss_value, count_correct(output.output, output.targets), batch_size);

        if boundary < num_layers {
            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(learning_rate, model, grads);
        }
    }

    Ok((model, acc.finish()))
}

/// 評価（推論モード）
pub fn evaluate<B: Backend>(
    model: &XceptionClassifier<B>,
    loader: &dyn DataLoader<B, ImageBatch<B>>,
) -> EvalMetrics {
    let mut acc = Accumulator::default();

    for batch in loader.iter() {
        let batch_size = batch.targets.dims()[0];
        let output = model.forward_classification(batch.images, batch.targets);
        let loss_value: f64 = output.loss.into_scalar().elem();
        acc.add(loss_value, count_correct(output.output, output.targets), batch_size);
    }

    acc.finish()
}

/// 1段階分の学習を実行
///
/// 検証精度が改善したエポックの重みを `plan.checkpoint` に保存します。
pub fn run_stage<B: AutodiffBackend>(
    model: XceptionClassifier<B>,
    plan: &StagePlan,
    train: &ImageLoader<B>,
    val: &ImageLoader<B::InnerBackend>,
) -> Result<(XceptionClassifier<B>, StageHistory)> {
    info!(
        "[{}] 開始: {}エポック, 凍結境界 {} / {} 層, 学習率 {}",
        plan.name,
        plan.epochs,
        plan.freeze_boundary,
        model.num_layers(),
        plan.learning_rate
    );

    let mut optimizer = AdamConfig::new().init::<B, XceptionClassifier<B>>();
    let mut monitor = EpochMonitor::new(plan.early_stop, plan.patience);
    let mut logger = TrainingLogger::new(&plan.name, plan.epochs);
    let mut history = StageHistory {
        name: plan.name.clone(),
        freeze_boundary: plan.freeze_boundary,
        learning_rate: plan.learning_rate,
        epochs: Vec::new(),
        best_val_accuracy: None,
        stopped_early: false,
    };

    let mut model = model;
    for epoch in 0..plan.epochs {
        logger.start_epoch(epoch);

        let (trained, train_metrics) = train_epoch(
            model,
            &mut optimizer,
            train.as_ref(),
            plan.freeze_boundary,
            plan.learning_rate,
        )?;
        model = trained;

        let val_metrics = evaluate(&model.valid(), val.as_ref());
        logger.end_epoch(
            train_metrics.loss,
            train_metrics.accuracy,
            val_metrics.loss,
            val_metrics.accuracy,
        );

        let outcome = monitor.observe(val_metrics.loss, val_metrics.accuracy);
        if outcome.checkpoint {
            save_weights(&model, &plan.checkpoint)?;
            info!(
                "[{}] val_acc {:.4} で重みを保存しました: {}",
                plan.name,
                val_metrics.accuracy,
                plan.checkpoint.display()
            );
        }

        history.epochs.push(EpochMetrics {
            epoch,
            train_loss: train_metrics.loss,
            train_accuracy: train_metrics.accuracy,
            val_loss: val_metrics.loss,
            val_accuracy: val_metrics.accuracy,
            checkpointed: outcome.checkpoint,
        });

        if outcome.stop {
            logger.log_early_stop(plan.patience);
            history.stopped_early = true;
            break;
        }
    }

    history.best_val_accuracy = monitor.best_accuracy();
    logger.log_complete(history.epochs.len(), monitor.best_accuracy());

    Ok((model, history))
}

fn eval_loader<B: Backend>(
    dataset: ImageFolderDataset,
    device: &B::Device,
    config: &AppConfig,
) -> ImageLoader<B> {
    DataLoaderBuilder::new(ImageBatcher::<B>::new(device.clone(), config.model.image_size))
        .batch_size(config.training.batch_size)
        .num_workers(config.training.num_workers)
        .build(dataset)
}

/// 2段階の転移学習を実行
///
/// `data_dir/train`, `data_dir/val`（必須）と `data_dir/test`（任意）を読み込み、
/// 成果物を `model_dir` に書き出します。
pub fn run_transfer_learning<B: AutodiffBackend>(
    config: &AppConfig,
    data_dir: &Path,
    model_dir: &Path,
    device: &B::Device,
) -> Result<TrainingHistory> {
    config.validate()?;

    let paths = ArtifactPaths::new(model_dir);
    paths.create_dir()?;

    // === データセット ===
    let train_dataset = ImageFolderDataset::from_directory(&data_dir.join("train"))?;
    let class_names = train_dataset.class_names().to_vec();
    if class_names.len() != config.model.num_classes {
        anyhow::bail!(
            "num_classes ({}) が学習データのクラス数 ({}) と一致しません",
            config.model.num_classes,
            class_names.len()
        );
    }
    let val_dataset = ImageFolderDataset::with_classes(&data_dir.join("val"), &class_names)?;
    let test_dir = data_dir.join("test");
    let test_dataset = if test_dir.is_dir() {
        Some(ImageFolderDataset::with_classes(&test_dir, &class_names)?)
    } else {
        warn!("テストデータが存在しません: {}", test_dir.display());
        None
    };

    if train_dataset.is_empty() || val_dataset.is_empty() {
        anyhow::bail!("学習データまたは検証データに画像がありません: {}", data_dir.display());
    }

    // === データローダー ===
    let preview_dir = if config.augmentation.save_preview {
        let dir = data_dir.join("preview");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("プレビューディレクトリを作成できません: {}", dir.display()))?;
        Some(dir)
    } else {
        None
    };
    let train_batcher = ImageBatcher::<B>::new(device.clone(), config.model.image_size).with_augmentation(
        Augmenter::new(config.augmentation.clone()),
        config.training.seed,
        preview_dir,
    );
    let train_loader: ImageLoader<B> = DataLoaderBuilder::new(train_batcher)
        .batch_size(config.training.batch_size)
        .shuffle(config.training.seed)
        .num_workers(config.training.num_workers)
        .build(train_dataset);
    let val_loader = eval_loader::<B::InnerBackend>(val_dataset, device, config);
    let test_loader = test_dataset.map(|dataset| eval_loader::<B::InnerBackend>(dataset, device, config));

    // === モデル ===
    let model_config = ClassifierConfig::from_settings(&config.model);
    let mut model = model_config.init::<B>(device);
    match config.model.backbone_weights {
        Some(ref weights) => {
            model = model.load_backbone(weights, device)?;
            info!("学習済みバックボーンを読み込みました: {}", weights.display());
        }
        None => warn!("バックボーン重みが指定されていません。ランダム初期化から学習します"),
    }
    info!("パラメータ数: {}", model.num_params());

    // === ヘッド学習 ===
    let head_plan = StagePlan {
        name: "ヘッド学習".to_string(),
        epochs: config.training.top_epochs(),
        freeze_boundary: model.backbone_layers(),
        learning_rate: config.training.learning_rate,
        checkpoint: paths.top_weights(),
        early_stop: Monitor::ValAccuracy,
        patience: config.training.patience,
    };
    let (model, head_history) = run_stage(model, &head_plan, &train_loader, &val_loader)?;

    // 最後のエポックではなく最良エポックの重みから再開
    let model = load_weights(model, &paths.top_weights(), device)?;

    // === ファインチューニング ===
    let fine_plan = StagePlan {
        name: "ファインチューニング".to_string(),
        epochs: config.training.num_epochs,
        freeze_boundary: config.model.freeze_boundary,
        learning_rate: config.training.fine_tune_learning_rate,
        checkpoint: paths.final_weights(),
        early_stop: Monitor::ValLoss,
        patience: config.training.patience,
    };
    let (model, fine_history) = run_stage(model, &fine_plan, &train_loader, &val_loader)?;

    let description = ArchitectureDescription::new(
        class_names.clone(),
        config.model.image_size,
        config.model.freeze_boundary,
        config.model.backbone.clone(),
        model_config.layer_names(),
        model.num_params(),
    );
    description.log_summary();
    write_json(&paths.architecture(), &description)?;

    // === テスト評価 ===
    let test = match test_loader {
        Some(loader) => {
            let best = load_weights(model, &paths.final_weights(), device)?;
            let metrics = evaluate(&best.valid(), loader.as_ref());
            info!(
                "テスト: loss {:.4}, acc {:.2}% ({}枚)",
                metrics.loss,
                metrics.accuracy * 100.0,
                metrics.samples
            );
            Some(metrics)
        }
        None => None,
    };

    let history = TrainingHistory {
        class_names,
        stages: vec![head_history, fine_history],
        test,
    };
    write_json(&paths.history(), &history)?;

    info!("学習完了: {} に保存しました", paths.model_dir().display());
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{BackboneSettings, ModelSettings};
    use burn::tensor::TensorData;
    use burn_autodiff::Autodiff;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{Rgb, RgbImage};
    use std::fs;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn write_pattern(path: &Path, seed: u32) {
        let img = RgbImage::from_fn(8, 8, |x, y| {
            Rgb([(x * 31 + seed * 17) as u8, (y * 29 + seed * 7) as u8, ((x + y) * 13) as u8])
        });
        img.save(path).unwrap();
    }

    fn split_dir(root: &Path, name: &str, per_class: u32) {
        for (c, class) in ["ant", "bee"].iter().enumerate() {
            let dir = root.join(name).join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                write_pattern(&dir.join(format!("{}_{}.png", class, i)), i + c as u32 * 5);
            }
        }
    }

    fn tiny_model() -> XceptionClassifier<TestBackend> {
        let settings = ModelSettings {
            num_classes: 2,
            image_size: 32,
            freeze_boundary: 0,
            backbone_weights: None,
            backbone: BackboneSettings::tiny(),
        };
        ClassifierConfig::from_settings(&settings).init(&NdArrayDevice::Cpu)
    }

    fn train_loader(root: &Path) -> ImageLoader<TestBackend> {
        let dataset = ImageFolderDataset::from_directory(&root.join("train")).unwrap();
        DataLoaderBuilder::new(ImageBatcher::<TestBackend>::new(NdArrayDevice::Cpu, 32))
            .batch_size(4)
            .build(dataset)
    }

    fn stem_weight(model: &XceptionClassifier<TestBackend>) -> TensorData {
        model.backbone.stem[0].conv.weight.val().into_data()
    }

    fn stem_running_mean(model: &XceptionClassifier<TestBackend>) -> TensorData {
        model.backbone.stem[0].norm.running_mean.value().into_data()
    }

    fn last_conv_weight(model: &XceptionClassifier<TestBackend>) -> TensorData {
        let last = model.backbone.exit_convs.len() - 1;
        model.backbone.exit_convs[last].conv.pointwise.weight.val().into_data()
    }

    fn dense_weight(model: &XceptionClassifier<TestBackend>) -> TensorData {
        model.dense.weight.val().into_data()
    }

    fn one_epoch(boundary: usize) -> (XceptionClassifier<TestBackend>, XceptionClassifier<TestBackend>) {
        let dir = tempfile::tempdir().unwrap();
        split_dir(dir.path(), "train", 3);
        let loader = train_loader(dir.path());

        let before = tiny_model();
        let mut optimizer = AdamConfig::new().init::<TestBackend, XceptionClassifier<TestBackend>>();
        let (after, metrics) = train_epoch(before.clone(), &mut optimizer, loader.as_ref(), boundary, 1e-2).unwrap();

        assert_eq!(metrics.samples, 6);
        assert!((0.0..=1.0).contains(&metrics.accuracy));
        (before, after)
    }

    #[test]
    fn test_head_stage_keeps_backbone_bit_identical() {
        let model = tiny_model();
        let (before, after) = one_epoch(model.backbone_layers());

        assert_eq!(stem_weight(&before), stem_weight(&after));
        assert_eq!(stem_running_mean(&before), stem_running_mean(&after));
        assert_eq!(last_conv_weight(&before), last_conv_weight(&after));
        assert_ne!(dense_weight(&before), dense_weight(&after));
    }

    #[test]
    fn test_partial_boundary_updates_only_tail() {
        let model = tiny_model();
        let (before, after) = one_epoch(model.backbone_layers() - 1);

        assert_eq!(stem_weight(&before), stem_weight(&after));
        assert_ne!(last_conv_weight(&before), last_conv_weight(&after));
        assert_ne!(dense_weight(&before), dense_weight(&after));
    }

    #[test]
    fn test_boundary_zero_updates_all_layers() {
        let (before, after) = one_epoch(0);

        assert_ne!(stem_weight(&before), stem_weight(&after));
        assert_ne!(last_conv_weight(&before), last_conv_weight(&after));
        assert_ne!(dense_weight(&before), dense_weight(&after));
    }

    #[test]
    fn test_fully_frozen_model_is_unchanged() {
        let model = tiny_model();
        let (before, after) = one_epoch(model.num_layers());

        assert_eq!(stem_weight(&before), stem_weight(&after));
        assert_eq!(dense_weight(&before), dense_weight(&after));
    }

    #[test]
    fn test_checkpoint_only_on_strict_improvement() {
        let mut monitor = EpochMonitor::new(Monitor::ValAccuracy, 5);

        assert!(monitor.observe(1.0, 0.5).checkpoint);
        assert!(!monitor.observe(0.9, 0.5).checkpoint);
        assert!(!monitor.observe(0.8, 0.4).checkpoint);
        assert!(monitor.observe(0.7, 0.6).checkpoint);
        assert_eq!(monitor.best_accuracy(), Some(0.6));
    }

    #[test]
    fn test_first_epoch_always_checkpoints() {
        let mut monitor = EpochMonitor::new(Monitor::ValLoss, 5);
        assert!(monitor.observe(f64::MAX, 0.0).checkpoint);
    }

    #[test]
    fn test_early_stop_on_accuracy_plateau() {
        let mut monitor = EpochMonitor::new(Monitor::ValAccuracy, 2);

        assert!(!monitor.observe(1.0, 0.5).stop);
        assert!(!monitor.observe(1.0, 0.5).stop);
        assert!(monitor.observe(1.0, 0.4).stop);
    }

    #[test]
    fn test_early_stop_on_loss_ignores_accuracy() {
        let mut monitor = EpochMonitor::new(Monitor::ValLoss, 2);

        assert!(!monitor.observe(1.0, 0.1).stop);
        // 精度は改善しているが損失は改善していない
        let outcome = monitor.observe(1.5, 0.2);
        assert!(outcome.checkpoint);
        assert!(!outcome.stop);
        assert!(monitor.observe(1.2, 0.3).stop);
    }

    #[test]
    fn test_loss_improvement_resets_patience() {
        let mut monitor = EpochMonitor::new(Monitor::ValLoss, 2);

        monitor.observe(1.0, 0.0);
        assert!(!monitor.observe(1.1, 0.0).stop);
        assert!(!monitor.observe(0.9, 0.0).stop);
        assert!(!monitor.observe(1.0, 0.0).stop);
        assert!(monitor.observe(1.0, 0.0).stop);
    }

    #[test]
    fn test_run_stage_writes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        split_dir(dir.path(), "train", 10);
        split_dir(dir.path(), "val", 4);
        let train = train_loader(dir.path());
        let val_dataset = ImageFolderDataset::from_directory(&dir.path().join("val")).unwrap();
        let val: ImageLoader<NdArray<f32>> =
            DataLoaderBuilder::new(ImageBatcher::<NdArray<f32>>::new(NdArrayDevice::Cpu, 32))
                .batch_size(4)
                .build(val_dataset);

        let model = tiny_model();
        let plan = StagePlan {
            name: "head".to_string(),
            epochs: 1,
            freeze_boundary: model.backbone_layers(),
            learning_rate: 1e-3,
            checkpoint: dir.path().join("top_model_weights.mpk"),
            early_stop: Monitor::ValAccuracy,
            patience: 5,
        };

        let (_, history) = run_stage(model, &plan, &train, &val).unwrap();

        assert!(plan.checkpoint.exists());
        assert_eq!(history.epochs.len(), 1);
        assert!(history.epochs[0].checkpointed);
        let val_accuracy = history.epochs[0].val_accuracy;
        assert!((0.0..=1.0).contains(&val_accuracy));
        assert_eq!(history.best_val_accuracy, Some(val_accuracy));
    }
}
