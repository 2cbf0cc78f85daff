//! Shared data contracts for volumetric lesion detection: boxes, lesion
//! annotations, and persisted per-volume predictions.

pub mod annotation;
pub mod boxes;
pub mod prediction;

pub use annotation::{AnnotationSet, LesionAnnotation, Split, VolumeAnnotation};
pub use boxes::BoxZyx;
pub use prediction::{
    prediction_path, read_predictions, write_predictions, Detection, PREDICTION_TEMPLATE,
};

use std::path::PathBuf;
use thiserror::Error;

pub type ContractResult<T> = Result<T, ContractError>;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid box {0:?}")]
    InvalidBox(BoxZyx),
    #[error("volume {id}: {msg}")]
    InvalidVolume { id: String, msg: String },
    #[error("detection score out of range: {0}")]
    InvalidScore(f32),
}
