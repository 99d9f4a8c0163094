//! 計算バックエンドの選択
//!
//! 設定の `device_type` に応じて WGPU (GPU) または NdArray (CPU) で学習します。

use std::path::Path;

use anyhow::Result;
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};

use crate::ml::trainer::{run_transfer_learning, TrainingHistory};
use crate::model::config::{AppConfig, DeviceType};

pub type GpuBackend = Wgpu;
pub type CpuBackend = NdArray<f32>;
pub type GpuTrainBackend = Autodiff<GpuBackend>;
pub type CpuTrainBackend = Autodiff<CpuBackend>;

/// 設定されたデバイスで転移学習を実行
pub fn run_on_configured_device(config: &AppConfig, data_dir: &Path, model_dir: &Path) -> Result<TrainingHistory> {
    match config.device_type {
        DeviceType::Wgpu => {
            let device = WgpuDevice::default();
            tracing::info!("使用デバイス: {:?}", device);
            run_transfer_learning::<GpuTrainBackend>(config, data_dir, model_dir, &device)
        }
        DeviceType::Cpu => {
            let device = NdArrayDevice::Cpu;
            tracing::info!("使用デバイス: {:?}", device);
            run_transfer_learning::<CpuTrainBackend>(config, data_dir, model_dir, &device)
        }
    }
}
