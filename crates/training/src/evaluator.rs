//! Inference over held-out volumes: candidate extraction, top-K, confidence
//! threshold, clipping, optional 3D NMS, and per-volume prediction files.

use crate::dataset::{VolumeDataset, VolumeSample};
use crate::metrics::ConfidenceProbe;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use models::{Yolo3d, BOX_CHANNELS};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use volume_contracts::{
    prediction_path, write_predictions, BoxZyx, ContractResult, Detection, PREDICTION_TEMPLATE,
};

#[derive(Debug, Clone)]
pub struct EvalSettings {
    pub conf_thresh: f32,
    /// Values >= 1 disable suppression.
    pub nms_thresh: f32,
    pub box_top_k: usize,
    pub scale_to_original: bool,
    pub confidence_rank: usize,
    pub confidence_percentile: f64,
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self {
            conf_thresh: 0.01,
            nms_thresh: 0.45,
            box_top_k: 256,
            scale_to_original: true,
            confidence_rank: 8,
            confidence_percentile: 50.0,
        }
    }
}

/// One decoded anchor prediction before filtering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub bbox: BoxZyx,
    pub objectness: f32,
    pub class_id: usize,
    pub class_score: f32,
}

impl Candidate {
    pub fn score(&self) -> f32 {
        self.objectness * self.class_score
    }
}

/// Flatten the decoded heads of a single-volume forward pass into candidates.
pub fn extract_candidates<B: Backend>(decoded: &[Tensor<B, 6>]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for t in decoded {
        let f = t.dims()[5];
        let values = match t.clone().into_data().convert::<f32>().to_vec::<f32>() {
            Ok(values) => values,
            Err(err) => {
                warn!(?err, "decoded head unreadable; no candidates taken from it");
                continue;
            }
        };
        for row in values.chunks_exact(f) {
            let (class_id, class_score) = row[BOX_CHANNELS..]
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::MIN), |best, (i, s)| if s > best.1 { (i, s) } else { best });
            out.push(Candidate {
                bbox: BoxZyx::new([row[0], row[1], row[2]], [row[3], row[4], row[5]]),
                objectness: row[6],
                class_id,
                class_score,
            });
        }
    }
    out
}

/// Greedy per-class NMS over detections sorted by descending score.
pub fn nms_3d(detections: Vec<Detection>, iou_thresh: f32) -> Vec<Detection> {
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) > iou_thresh);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

#[derive(Debug, Clone)]
pub struct VolumePrediction {
    pub id: String,
    pub detections: Vec<Detection>,
    /// Ranked raw objectness for the confidence probe.
    pub ranked_objectness: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct EvalSummary {
    pub volume_ids: Vec<String>,
    pub detections: usize,
    /// Percentile of the per-volume ranked objectness across the set.
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct Evaluator {
    pub settings: EvalSettings,
    pred_dir: PathBuf,
    template: String,
}

impl Evaluator {
    pub fn new(settings: EvalSettings, pred_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            pred_dir: pred_dir.into(),
            template: PREDICTION_TEMPLATE.to_string(),
        }
    }

    pub fn pred_dir(&self) -> &Path {
        &self.pred_dir
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Remove predictions from earlier runs and recreate the directory.
    pub fn clear_predictions(&self) -> std::io::Result<()> {
        if self.pred_dir.exists() {
            fs::remove_dir_all(&self.pred_dir)?;
        }
        fs::create_dir_all(&self.pred_dir)
    }

    /// Top-K by score, confidence threshold, optional rescale, clip, drop
    /// empty boxes, then NMS. Never returns more than `box_top_k` detections.
    pub fn filter(
        &self,
        mut candidates: Vec<Candidate>,
        input_size: [usize; 3],
        original_shape: [usize; 3],
    ) -> Vec<Detection> {
        let s = &self.settings;
        candidates.sort_by(|a, b| b.score().total_cmp(&a.score()));
        candidates.truncate(s.box_top_k);

        let (factor, bounds) = if s.scale_to_original {
            let factor = [0, 1, 2].map(|a| original_shape[a] as f32 / input_size[a] as f32);
            (Some(factor), original_shape)
        } else {
            (None, input_size)
        };

        let detections: Vec<Detection> = candidates
            .into_iter()
            .filter(|c| c.score() >= s.conf_thresh)
            .filter_map(|c| {
                let bbox = match factor {
                    Some(f) => c.bbox.scaled(f),
                    None => c.bbox,
                };
                let bbox = bbox.clipped(bounds);
                bbox.is_valid().then(|| {
                    Detection::new(
                        bbox,
                        c.objectness.clamp(0.0, 1.0),
                        c.class_id,
                        c.class_score.clamp(0.0, 1.0),
                    )
                })
            })
            .collect();

        if s.nms_thresh < 1.0 {
            nms_3d(detections, s.nms_thresh)
        } else {
            detections
        }
    }

    pub fn predict_volume<B: Backend>(
        &self,
        model: &Yolo3d<B>,
        sample: &VolumeSample,
        device: &B::Device,
    ) -> VolumePrediction {
        let [d, h, w] = sample.input_size;
        let input = Tensor::<B, 5>::from_data(
            TensorData::new(sample.image.clone(), [1, 1, d, h, w]),
            device,
        );
        let outputs = model.forward(input);
        let decoded: Vec<Tensor<B, 6>> = outputs.into_iter().map(|o| o.decoded).collect();
        let candidates = extract_candidates(&decoded);
        let objectness: Vec<f32> = candidates.iter().map(|c| c.objectness).collect();
        let ranked_objectness =
            crate::metrics::ranked_value(&objectness, self.settings.confidence_rank);
        let detections = self.filter(candidates, sample.input_size, sample.original_shape);
        debug!(id = %sample.id, detections = detections.len(), "predicted volume");
        VolumePrediction {
            id: sample.id.clone(),
            detections,
            ranked_objectness,
        }
    }

    pub fn store(&self, prediction: &VolumePrediction) -> ContractResult<PathBuf> {
        let path = prediction_path(&self.pred_dir, &self.template, &prediction.id);
        write_predictions(&path, &prediction.detections)?;
        Ok(path)
    }

    /// Predict and store every volume of `dataset`.
    pub fn evaluate<B: Backend>(
        &self,
        model: &Yolo3d<B>,
        dataset: &VolumeDataset,
        device: &B::Device,
    ) -> ContractResult<EvalSummary> {
        let mut probe = ConfidenceProbe::new(self.settings.confidence_rank);
        let mut volume_ids = Vec::with_capacity(dataset.len());
        let mut detections = 0;
        for sample in dataset.samples() {
            let prediction = self.predict_volume(model, sample, device);
            if let Some(v) = prediction.ranked_objectness {
                probe.observe(&[v]);
            }
            detections += prediction.detections.len();
            self.store(&prediction)?;
            volume_ids.push(prediction.id);
        }
        let confidence = probe.percentile(self.settings.confidence_percentile);
        info!(
            volumes = volume_ids.len(),
            detections,
            ?confidence,
            rank = self.settings.confidence_rank,
            "evaluation complete"
        );
        Ok(EvalSummary {
            volume_ids,
            detections,
            confidence,
        })
    }
}
