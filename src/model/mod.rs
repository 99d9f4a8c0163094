pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, AugmentationSettings, BackboneSettings, DeviceType, ModelSettings, TrainingSettings};
pub use model_metadata::{ArchitectureDescription, LayerDescription};
pub use model_storage::{read_json, write_json, ArtifactPaths};
#[cfg(feature = "ml")]
pub use model_storage::{load_weights, save_weights};
