//! Free-response ROC scoring for volumetric lesion detections.
//!
//! Predictions are read back from the per-volume files written by the evaluator,
//! matched against annotated lesions at every confidence threshold of a fixed
//! sweep, and summarized as sensitivity vs. false positives per volume. Two size
//! classes are scored: lesions at least 10 mm and at least 15 mm in equivalent
//! diameter. Smaller lesions are "don't care" for the class being scored.

pub mod curve;
pub mod plot;
pub mod sweep;

pub use curve::{FrocCurve, FrocPoint};
pub use sweep::{sweep_thresholds, threshold_grid, ScoredVolume};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use volume_contracts::{prediction_path, read_predictions, AnnotationSet, ContractError};

pub type FrocResult<T> = Result<T, FrocError>;

#[derive(Debug, Error)]
pub enum FrocError {
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("prediction file missing for volume {id}: {path}")]
    MissingPrediction { id: String, path: PathBuf },
    #[error("volume {0} not found in ground truth")]
    UnknownVolume(String),
    #[error("threshold step must lie in (0, 1], got {0}")]
    InvalidStep(f32),
    #[error("false-positive range must be increasing, got {0:?}")]
    InvalidFpRange((f64, f64)),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write csv {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to render plot {path}: {message}")]
    Plot { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrocConfig {
    /// Prediction file name template; `{}` is replaced by the volume id.
    pub template: String,
    /// Lesions whose largest voxel extent is below this are ignored entirely.
    pub size_threshold: f32,
    /// Confidence threshold step for the 0..=1 sweep.
    pub th_step: f32,
    pub small_lesion_mm: f32,
    pub large_lesion_mm: f32,
    /// False positives per volume range the area is integrated over.
    pub fp_range: (f64, f64),
    /// Restrict scoring to these volumes; `None` scores every annotated volume.
    pub volume_ids: Option<Vec<String>>,
}

impl Default for FrocConfig {
    fn default() -> Self {
        Self {
            template: volume_contracts::PREDICTION_TEMPLATE.to_string(),
            size_threshold: 20.0,
            th_step: 0.01,
            small_lesion_mm: 10.0,
            large_lesion_mm: 15.0,
            fp_range: (0.0, 8.0),
            volume_ids: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrocReport {
    /// Area for lesions >= `small_lesion_mm`.
    pub area_small: f64,
    /// Area for lesions >= `large_lesion_mm`.
    pub area_big: f64,
    pub small: FrocCurve,
    pub big: FrocCurve,
    pub fp_range: (f64, f64),
}

impl FrocReport {
    /// Render both curves into one PNG.
    pub fn save_plot(&self, path: &Path) -> FrocResult<()> {
        plot::save_plot(path, &[&self.small, &self.big], self.fp_range)
    }
}

/// Score the prediction files in `pred_dir` against `annotations.json` under `gt_root`.
pub fn calculate_froc(gt_root: &Path, pred_dir: &Path, cfg: &FrocConfig) -> FrocResult<FrocReport> {
    let annotations = AnnotationSet::load_root(gt_root)?;
    calculate_froc_with(&annotations, pred_dir, cfg)
}

pub fn calculate_froc_with(
    annotations: &AnnotationSet,
    pred_dir: &Path,
    cfg: &FrocConfig,
) -> FrocResult<FrocReport> {
    if !(cfg.fp_range.1 > cfg.fp_range.0) {
        return Err(FrocError::InvalidFpRange(cfg.fp_range));
    }
    let thresholds = threshold_grid(cfg.th_step)?;

    let selected: Vec<_> = match &cfg.volume_ids {
        Some(ids) => ids
            .iter()
            .map(|id| {
                annotations
                    .get(id)
                    .ok_or_else(|| FrocError::UnknownVolume(id.clone()))
            })
            .collect::<FrocResult<_>>()?,
        None => annotations.volumes.iter().collect(),
    };

    let mut volumes = Vec::with_capacity(selected.len());
    for ann in selected {
        let path = prediction_path(pred_dir, &cfg.template, &ann.id);
        if !path.exists() {
            return Err(FrocError::MissingPrediction {
                id: ann.id.clone(),
                path,
            });
        }
        let detections = read_predictions(&path)?;
        debug!(volume = %ann.id, detections = detections.len(), lesions = ann.lesions.len(), "loaded predictions");
        volumes.push(ScoredVolume::new(ann, detections));
    }

    let small = sweep_thresholds(
        &volumes,
        &thresholds,
        cfg.size_threshold,
        cfg.small_lesion_mm,
        format!("{}mm", cfg.small_lesion_mm),
    );
    let big = sweep_thresholds(
        &volumes,
        &thresholds,
        cfg.size_threshold,
        cfg.large_lesion_mm,
        format!("{}mm", cfg.large_lesion_mm),
    );
    let area_small = small.area(cfg.fp_range);
    let area_big = big.area(cfg.fp_range);
    info!(
        volumes = volumes.len(),
        lesions_small = small.total_lesions,
        lesions_big = big.total_lesions,
        area_small,
        area_big,
        "froc computed"
    );

    Ok(FrocReport {
        area_small,
        area_big,
        small,
        big,
        fp_range: cfg.fp_range,
    })
}
