use crate::{BoxZyx, ContractError, ContractResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default file name template for per-volume prediction files; `{}` is the volume id.
pub const PREDICTION_TEMPLATE: &str = "{}.json";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bbox: BoxZyx,
    pub objectness: f32,
    pub class_id: usize,
    pub class_score: f32,
    /// `objectness * class_score`; the value thresholds are swept over.
    pub score: f32,
}

impl Detection {
    pub fn new(bbox: BoxZyx, objectness: f32, class_id: usize, class_score: f32) -> Self {
        Self {
            bbox,
            objectness,
            class_id,
            class_score,
            score: objectness * class_score,
        }
    }

    pub fn validate(&self) -> ContractResult<()> {
        if !self.bbox.is_valid() {
            return Err(ContractError::InvalidBox(self.bbox));
        }
        for v in [self.objectness, self.class_score, self.score] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(ContractError::InvalidScore(v));
            }
        }
        Ok(())
    }
}

/// Resolve `template` (with `{}` standing for the volume id) inside `dir`.
pub fn prediction_path(dir: &Path, template: &str, volume_id: &str) -> PathBuf {
    dir.join(template.replace("{}", volume_id))
}

/// Write one volume's detections, replacing any earlier file at that path.
pub fn write_predictions(path: &Path, detections: &[Detection]) -> ContractResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ContractError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let json = serde_json::to_vec(detections).map_err(|source| ContractError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(|source| ContractError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_predictions(path: &Path) -> ContractResult<Vec<Detection>> {
    let bytes = fs::read(path).map_err(|source| ContractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let detections: Vec<Detection> =
        serde_json::from_slice(&bytes).map_err(|source| ContractError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    for det in &detections {
        det.validate()?;
    }
    Ok(detections)
}
