pub mod augmentation;
pub mod backend;
pub mod ml_model;
pub mod trainer;
pub mod training;
pub mod xception;

pub use augmentation::Augmenter;
pub use backend::{run_on_configured_device, CpuBackend, CpuTrainBackend, GpuBackend, GpuTrainBackend};
pub use ml_model::{Activation, ClassifierConfig, XceptionClassifier};
pub use trainer::{
    evaluate, run_stage, run_transfer_learning, train_epoch, EpochMetrics, EpochMonitor, EvalMetrics,
    Monitor, StageHistory, StagePlan, TrainingHistory,
};
pub use training::{ImageBatch, ImageBatcher, ImageFolderDataset, ImageItem};
pub use xception::{Xception, XceptionConfig};
