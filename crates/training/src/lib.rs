#![recursion_limit = "256"]

pub mod accumulate;
pub mod amp;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod evaluator;
pub mod iou;
pub mod loss;
pub mod metrics;
pub mod scheduler;
pub mod targets;
pub mod trainer;
pub mod util;

pub use checkpoint::{CheckpointEnvelope, CheckpointError, CheckpointManager};
pub use config::{DataType, DetectorConfig};
pub use dataset::{collate, VolumeBatch, VolumeDataset, VolumeSample};
pub use evaluator::{EvalSettings, Evaluator};
pub use loss::{LossOutput, YoloLoss3d};
pub use metrics::{ConfidenceProbe, JsonlMetrics, MetricsSink, NullMetrics, RunningLoss};
pub use models::{Yolo3d, Yolo3dConfig};
pub use scheduler::CosineDecayLr;
pub use trainer::{TrainOptions, TrainReport, TrainState, Trainer};
pub use util::{run_eval, run_train, EvalArgs, TrainArgs};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
