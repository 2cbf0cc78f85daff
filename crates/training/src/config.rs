//! Detector configuration: a TOML file with `[model]`, `[train]` and `[val]`
//! sections. Every field has a default, so partial files are fine.

use crate::evaluator::EvalSettings;
use froc::FrocConfig;
use models::{Yolo3dConfig, STRIDES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable consulted when no config path is given.
pub const CONFIG_ENV: &str = "VOLDET_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Dataset flavour; decides whether an epoch ends with validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Abus,
    Voc,
    Coco,
}

impl DataType {
    pub fn requires_validation(self) -> bool {
        matches!(self, DataType::Abus | DataType::Voc)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    pub ciou: f32,
    pub conf: f32,
    pub cls: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            ciou: 1.0,
            conf: 1.0,
            cls: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainSection {
    pub data_root: PathBuf,
    pub data_type: DataType,
    /// Network input `[D, H, W]`; each a multiple of 32.
    pub input_size: [usize; 3],
    pub batch_size: usize,
    pub epochs: usize,
    pub lr_init: f64,
    pub lr_end: f64,
    pub warmup_epochs: usize,
    pub momentum: f64,
    pub weight_decay: f64,
    /// Predictions overlapping any box above this IoU are not penalized as background.
    pub iou_threshold_loss: f32,
    pub max_boxes: usize,
    pub label_smoothing: f32,
    pub loss_weights: LossWeights,
    pub shuffle: bool,
    pub seed: u64,
    pub log_every: usize,
    /// Every 10 batches, resample to a random cube edge of `k * 32` voxels
    /// with `k` drawn from this inclusive range. Off when unset.
    pub multi_scale: Option<[usize; 2]>,
}

impl Default for TrainSection {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("datasets/abus"),
            data_type: DataType::Abus,
            input_size: [96, 96, 96],
            batch_size: 1,
            epochs: 50,
            lr_init: 1e-4,
            lr_end: 1e-6,
            warmup_epochs: 2,
            momentum: 0.9,
            weight_decay: 5e-4,
            iou_threshold_loss: 0.5,
            max_boxes: 32,
            label_smoothing: 0.01,
            loss_weights: LossWeights::default(),
            shuffle: true,
            seed: 0,
            log_every: 10,
            multi_scale: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValSection {
    pub input_size: [usize; 3],
    pub conf_thresh: f32,
    /// Greedy 3D NMS IoU; values >= 1 disable suppression.
    pub nms_thresh: f32,
    pub box_top_k: usize,
    /// Map boxes from network input voxels back to original volume voxels.
    /// FROC scoring needs this on.
    pub scale_to_original: bool,
    /// Cap on validation volumes per evaluation; `None` uses all of them.
    pub max_volumes: Option<usize>,
    /// Rank of the raw objectness tracked per volume (8 = 8th highest).
    pub confidence_rank: usize,
    pub confidence_percentile: f64,
    pub size_threshold: f32,
    pub th_step: f32,
    pub small_lesion_mm: f32,
    pub large_lesion_mm: f32,
    pub fp_range: (f64, f64),
}

impl Default for ValSection {
    fn default() -> Self {
        let froc = FrocConfig::default();
        Self {
            input_size: [96, 96, 96],
            conf_thresh: 0.01,
            nms_thresh: 0.45,
            box_top_k: 256,
            scale_to_original: true,
            max_volumes: Some(100),
            confidence_rank: 8,
            confidence_percentile: 50.0,
            size_threshold: froc.size_threshold,
            th_step: froc.th_step,
            small_lesion_mm: froc.small_lesion_mm,
            large_lesion_mm: froc.large_lesion_mm,
            fp_range: froc.fp_range,
        }
    }
}

impl ValSection {
    pub fn eval_settings(&self) -> EvalSettings {
        EvalSettings {
            conf_thresh: self.conf_thresh,
            nms_thresh: self.nms_thresh,
            box_top_k: self.box_top_k,
            scale_to_original: self.scale_to_original,
            confidence_rank: self.confidence_rank,
            confidence_percentile: self.confidence_percentile,
        }
    }

    pub fn froc_config(&self, volume_ids: Option<Vec<String>>) -> FrocConfig {
        FrocConfig {
            template: volume_contracts::PREDICTION_TEMPLATE.to_string(),
            size_threshold: self.size_threshold,
            th_step: self.th_step,
            small_lesion_mm: self.small_lesion_mm,
            large_lesion_mm: self.large_lesion_mm,
            fp_range: self.fp_range,
            volume_ids,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub model: Yolo3dConfig,
    pub train: TrainSection,
    pub val: ValSection,
}

impl DetectorConfig {
    /// Load from `path`, else from `$VOLDET_CONFIG`, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let cfg = match path {
            Some(p) => Self::from_path(p)?,
            None => match std::env::var(CONFIG_ENV) {
                Ok(p) if !p.trim().is_empty() => Self::from_path(Path::new(&p))?,
                _ => Self::default(),
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let coarsest = STRIDES[STRIDES.len() - 1];
        for (name, size) in [
            ("train.input_size", self.train.input_size),
            ("val.input_size", self.val.input_size),
        ] {
            if size.iter().any(|d| *d == 0 || d % coarsest != 0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} {size:?} must be positive multiples of {coarsest}"
                )));
            }
        }
        if self.model.num_classes == 0 {
            return Err(ConfigError::Invalid("model.num_classes must be > 0".into()));
        }
        if self.train.batch_size == 0 || self.train.max_boxes == 0 {
            return Err(ConfigError::Invalid(
                "train.batch_size and train.max_boxes must be > 0".into(),
            ));
        }
        if self.train.lr_end > self.train.lr_init {
            return Err(ConfigError::Invalid("train.lr_end exceeds train.lr_init".into()));
        }
        if let Some([lo, hi]) = self.train.multi_scale {
            if lo == 0 || lo > hi {
                return Err(ConfigError::Invalid(format!(
                    "train.multi_scale [{lo}, {hi}] must be a non-empty range of positive multiples"
                )));
            }
        }
        if !self.val.scale_to_original {
            return Err(ConfigError::Invalid(
                "val.scale_to_original must be true: FROC scores against lesion boxes in original volume voxels"
                    .into(),
            ));
        }
        if self.val.box_top_k == 0 || self.val.confidence_rank == 0 {
            return Err(ConfigError::Invalid(
                "val.box_top_k and val.confidence_rank must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = DetectorConfig::from_toml_str(
            r#"
            [train]
            epochs = 3
            data_type = "COCO"

            [val]
            box_top_k = 64
            "#,
        )
        .unwrap();
        assert_eq!(cfg.train.epochs, 3);
        assert!(!cfg.train.data_type.requires_validation());
        assert_eq!(cfg.val.box_top_k, 64);
        assert_eq!(cfg.train.input_size, [96, 96, 96]);
        assert_eq!(cfg.model.num_classes, 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn input_size_must_align_with_coarsest_stride() {
        let mut cfg = DetectorConfig::default();
        cfg.train.input_size = [96, 100, 96];
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn input_space_predictions_are_rejected() {
        let cfg = DetectorConfig::from_toml_str(
            r#"
            [val]
            scale_to_original = false
            "#,
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn multi_scale_range_is_checked() {
        let mut cfg = DetectorConfig::from_toml_str(
            r#"
            [train]
            multi_scale = [2, 4]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.train.multi_scale, Some([2, 4]));
        cfg.validate().unwrap();
        cfg.train.multi_scale = Some([3, 2]);
        assert!(cfg.validate().is_err());
        cfg.train.multi_scale = Some([0, 2]);
        assert!(cfg.validate().is_err());
    }
}
