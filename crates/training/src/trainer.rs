//! Epoch driver. The loop moves through explicit states so resume, validation
//! and checkpointing happen at well-defined epoch boundaries:
//!
//! `Initializing -> EpochRunning -> (Validating -> Checkpointing ->)? EpochRunning ... -> Finished`

use crate::accumulate::StepAccumulator;
use crate::amp::LossScaler;
use crate::checkpoint::CheckpointManager;
use crate::config::DetectorConfig;
use crate::dataset::VolumeDataset;
use crate::evaluator::Evaluator;
use crate::loss::YoloLoss3d;
use crate::metrics::{MetricsSink, RunningLoss};
use crate::scheduler::CosineDecayLr;
use crate::targets::TargetAssigner;
use anyhow::Context;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsParams, Optimizer, Sgd, SgdConfig};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use models::{Yolo3d, STRIDES};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};
use volume_contracts::{AnnotationSet, Split};

pub type DetectorOptimizer<B> =
    OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, Yolo3d<B>, B>;

/// Prediction files for validation live here, under the checkpoint directory.
pub const PREDICTION_SUBDIR: &str = "evaluate";
pub const FROC_PLOT_FILE: &str = "froc_test.png";
/// Batches between input size changes when multi-scale training is on.
pub const MULTI_SCALE_EVERY: usize = 10;

/// Cube input size `k * 32` for `k` drawn from the inclusive `cells` range.
pub fn random_input_size(rng: &mut impl Rng, cells: [usize; 2]) -> [usize; 3] {
    let edge = rng.random_range(cells[0]..=cells[1]) * STRIDES[STRIDES.len() - 1];
    [edge; 3]
}

#[derive(Debug, Clone)]
pub struct TrainOptions {
    /// Checkpoint to start from; see `resume`.
    pub weight_path: Option<PathBuf>,
    /// Restore epoch, optimizer and best score from `weight_path` instead of
    /// treating it as pretrained weights.
    pub resume: bool,
    pub checkpoint_dir: PathBuf,
    /// Optimizer step every `accumulate` batches.
    pub accumulate: usize,
    pub fp16: bool,
    pub fold: Option<u32>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            weight_path: None,
            resume: false,
            checkpoint_dir: PathBuf::from("checkpoints"),
            accumulate: 1,
            fp16: false,
            fold: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrainState {
    Initializing,
    EpochRunning { epoch: usize },
    Validating { epoch: usize },
    Checkpointing { epoch: usize, score: f64 },
    Finished,
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub start_epoch: usize,
    pub epochs_run: usize,
    pub best_score: f64,
    /// Optimizer steps taken by this run.
    pub optimizer_steps: usize,
    /// Running means `[ciou, conf, cls, total]` of the last epoch.
    pub last_loss: [f32; 4],
}

pub struct Trainer<B: AutodiffBackend> {
    cfg: DetectorConfig,
    opts: TrainOptions,
    device: B::Device,
    model: Yolo3d<B>,
    optim: DetectorOptimizer<B>,
    scheduler: CosineDecayLr,
    loss: YoloLoss3d,
    assigner: TargetAssigner,
    annotations: AnnotationSet,
    train_set: VolumeDataset,
    valid_set: Option<VolumeDataset>,
    evaluator: Evaluator,
    checkpoints: CheckpointManager,
    metrics: Box<dyn MetricsSink>,
    scaler: Option<LossScaler>,
    running: RunningLoss,
    optimizer_steps: usize,
    start_epoch: usize,
    state: TrainState,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(
        cfg: DetectorConfig,
        opts: TrainOptions,
        metrics: Box<dyn MetricsSink>,
        device: B::Device,
    ) -> anyhow::Result<Self> {
        cfg.validate()?;
        B::seed(cfg.train.seed);
        let train = &cfg.train;
        let root = train.data_root.clone();
        let annotations = AnnotationSet::load_root(&root)
            .with_context(|| format!("loading annotations under {}", root.display()))?;
        let train_set = VolumeDataset::from_annotations(
            &root,
            &annotations,
            opts.fold,
            Split::Train,
            train.input_size,
            None,
        )?;
        if train_set.is_empty() {
            anyhow::bail!("no training volumes under {}", root.display());
        }
        let valid_set = if train.data_type.requires_validation() {
            Some(VolumeDataset::from_annotations(
                &root,
                &annotations,
                opts.fold,
                Split::Valid,
                cfg.val.input_size,
                cfg.val.max_volumes,
            )?)
        } else {
            None
        };

        let num_batches = train_set.num_batches(train.batch_size);
        let scheduler = CosineDecayLr::for_run(
            train.lr_init,
            train.lr_end,
            train.warmup_epochs,
            train.epochs,
            num_batches,
        );
        let loss = YoloLoss3d::new(train.iou_threshold_loss, train.loss_weights);
        let assigner = TargetAssigner {
            anchors: cfg.model.anchors,
            num_classes: cfg.model.num_classes,
            max_boxes: train.max_boxes,
            label_smoothing: train.label_smoothing,
        };
        let evaluator = Evaluator::new(
            cfg.val.eval_settings(),
            opts.checkpoint_dir.join(PREDICTION_SUBDIR),
        );
        let mut checkpoints = CheckpointManager::new(&opts.checkpoint_dir)?;

        let model = Yolo3d::<B>::new(&cfg.model, &device);
        let optim = SgdConfig::new()
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(train.momentum)
                    .with_dampening(0.0),
            ))
            .with_weight_decay(Some(WeightDecayConfig::new(train.weight_decay as f32)))
            .init::<B, Yolo3d<B>>();

        let (model, optim, start_epoch) = match &opts.weight_path {
            Some(path) => {
                let restored = checkpoints
                    .load::<B, _, _>(path, !opts.resume, model, optim, &device)
                    .with_context(|| format!("loading weights from {}", path.display()))?;
                (restored.model, restored.optimizer, restored.start_epoch)
            }
            None => (model, optim, 0),
        };

        info!(
            train_volumes = train_set.len(),
            valid_volumes = valid_set.as_ref().map_or(0, |v| v.len()),
            batch_size = train.batch_size,
            input_size = ?train.input_size,
            start_epoch,
            "trainer ready"
        );

        let scaler = opts.fp16.then(LossScaler::default);
        Ok(Self {
            cfg,
            opts,
            device,
            model,
            optim,
            scheduler,
            loss,
            assigner,
            annotations,
            train_set,
            valid_set,
            evaluator,
            checkpoints,
            metrics,
            scaler,
            running: RunningLoss::default(),
            optimizer_steps: 0,
            start_epoch,
            state: TrainState::Initializing,
        })
    }

    pub fn state(&self) -> TrainState {
        self.state
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn best_score(&self) -> f64 {
        self.checkpoints.best_score()
    }

    /// Drive the state machine until `Finished`.
    pub fn run(&mut self) -> anyhow::Result<TrainReport> {
        let epochs = self.cfg.train.epochs;
        let validates = self.cfg.train.data_type.requires_validation();
        info!(
            epochs,
            start_epoch = self.start_epoch,
            volumes = self.train_set.len(),
            "training start"
        );
        let mut epochs_run = 0;
        let mut epoch_started = Instant::now();
        loop {
            self.state = match self.state {
                TrainState::Initializing => TrainState::EpochRunning {
                    epoch: self.start_epoch,
                },
                TrainState::EpochRunning { epoch } if epoch >= epochs => TrainState::Finished,
                TrainState::EpochRunning { epoch } => {
                    epoch_started = Instant::now();
                    self.train_epoch(epoch)?;
                    epochs_run += 1;
                    if validates {
                        TrainState::Validating { epoch }
                    } else {
                        info!(epoch, secs = epoch_started.elapsed().as_secs_f64(), "epoch done");
                        TrainState::EpochRunning { epoch: epoch + 1 }
                    }
                }
                TrainState::Validating { epoch } => {
                    let score = self.validate(epoch)?;
                    TrainState::Checkpointing { epoch, score }
                }
                TrainState::Checkpointing { epoch, score } => {
                    self.checkpoints
                        .save::<B, _, _>(epoch, score, &self.model, &self.optim)
                        .context("saving checkpoint")?;
                    info!(epoch, auc_15mm = score, "save weights done");
                    info!(epoch, secs = epoch_started.elapsed().as_secs_f64(), "epoch done");
                    TrainState::EpochRunning { epoch: epoch + 1 }
                }
                TrainState::Finished => break,
            };
        }
        self.metrics.flush().context("flushing metrics")?;
        info!(best_score = self.checkpoints.best_score(), "training finished");
        Ok(TrainReport {
            start_epoch: self.start_epoch,
            epochs_run,
            best_score: self.checkpoints.best_score(),
            optimizer_steps: self.optimizer_steps,
            last_loss: self.running.mean(),
        })
    }

    fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<()> {
        let train = &self.cfg.train;
        let batch_size = train.batch_size;
        let log_every = train.log_every.max(1);
        let accumulate = self.opts.accumulate.max(1);
        let shuffle = train.shuffle.then_some((train.seed, epoch));
        let num_batches = self.train_set.num_batches(batch_size);

        // The dataset is borrowed by the batch iterator for the whole epoch.
        let train_set = std::mem::take(&mut self.train_set);
        let mut batches = train_set.batches(batch_size, shuffle);
        let mut accumulator = StepAccumulator::<Yolo3d<B>>::new(accumulate);
        let multi_scale = train.multi_scale;
        let mut scale_rng =
            multi_scale.map(|_| StdRng::seed_from_u64(train.seed.wrapping_add(epoch as u64)));
        self.running.reset();
        info!(epoch, epochs = train.epochs, "epoch start");

        let mut i = 0;
        let result: anyhow::Result<()> = loop {
            let batch = match batches.next_batch::<B>(&self.assigner, &self.device) {
                Ok(Some(batch)) => batch,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            };
            let step = num_batches * epoch + i;
            let lr = self.scheduler.rate(step);

            let outputs = self.model.forward(batch.images);
            let loss = self.loss.forward(&outputs, &batch.labels, &batch.bboxes);
            let items = loss.items();
            let grads = backward(&self.model, loss.total, self.scaler.as_mut());
            if let Some(grads) = accumulator.push::<B>(i, &self.model, grads) {
                self.model = self.optim.step(lr, self.model.clone(), grads);
            }

            self.running.update(i, items);
            if i % log_every == 0 {
                let [ciou, conf, cls, total] = self.running.mean();
                info!(
                    epoch,
                    step = i,
                    steps = num_batches.saturating_sub(1),
                    input_size = ?batch.input_size,
                    total_loss = total,
                    loss_ciou = ciou,
                    loss_conf = conf,
                    loss_cls = cls,
                    lr,
                    "train step"
                );
                if let Err(e) = self.log_step(step, lr) {
                    break Err(e);
                }
            }
            if let (Some(cells), Some(rng)) = (multi_scale, scale_rng.as_mut()) {
                if (i + 1) % MULTI_SCALE_EVERY == 0 {
                    let size = random_input_size(rng, cells);
                    debug!(epoch, step = i, input_size = ?size, "multi-scale resize");
                    batches.set_input_size(size);
                }
            }
            i += 1;
        };
        drop(batches);
        self.optimizer_steps += accumulator.steps();
        if accumulator.pending() > 0 {
            debug!(epoch, batches = accumulator.pending(), "dropping gradients of trailing batches");
        }
        self.train_set = train_set;
        result
    }

    fn log_step(&mut self, step: usize, lr: f64) -> anyhow::Result<()> {
        let [ciou, conf, cls, total] = self.running.mean();
        for (tag, value) in [
            ("loss_ciou", ciou as f64),
            ("loss_conf", conf as f64),
            ("loss_cls", cls as f64),
            ("train_loss", total as f64),
            ("train_lr", lr),
        ] {
            self.metrics
                .scalar(tag, value, step)
                .with_context(|| format!("writing metric {tag}"))?;
        }
        Ok(())
    }

    /// Predict the validation volumes, score them with FROC and return the
    /// large-lesion area.
    fn validate(&mut self, epoch: usize) -> anyhow::Result<f64> {
        let Some(valid_set) = &self.valid_set else {
            warn!(epoch, "no validation set; scoring 0");
            return Ok(0.0);
        };
        let started = Instant::now();
        self.evaluator
            .clear_predictions()
            .context("clearing prediction directory")?;
        let model = self.model.valid();
        let summary = self
            .evaluator
            .evaluate(&model, valid_set, &self.device)
            .context("writing predictions")?;
        let froc_cfg = self.cfg.val.froc_config(Some(summary.volume_ids));
        let report = froc::calculate_froc_with(&self.annotations, self.evaluator.pred_dir(), &froc_cfg)
            .context("scoring FROC")?;
        report
            .save_plot(&self.checkpoints.dir().join(FROC_PLOT_FILE))
            .context("saving FROC plot")?;

        self.metrics.scalar("AUC_10mm", report.area_small, epoch)?;
        self.metrics.scalar("AUC_15mm", report.area_big, epoch)?;
        info!(
            epoch,
            auc_10mm = report.area_small,
            auc_15mm = report.area_big,
            confidence = ?summary.confidence,
            secs = started.elapsed().as_secs_f64(),
            "validate"
        );
        Ok(report.area_big)
    }
}

/// Gradients of `loss` w.r.t. `model`; with a scaler, `None` when they overflowed.
fn backward<B: AutodiffBackend>(
    model: &Yolo3d<B>,
    loss: Tensor<B, 1>,
    scaler: Option<&mut LossScaler>,
) -> Option<GradientsParams> {
    let Some(scaler) = scaler else {
        return Some(GradientsParams::from_grads(loss.backward(), model));
    };
    let scaled = scaler.scale_loss(loss);
    let grads = GradientsParams::from_grads(scaled.backward(), model);
    let (grads, finite) = scaler.unscale::<B, _>(model, grads);
    scaler.update(!finite);
    if finite {
        Some(grads)
    } else {
        warn!(scale = scaler.scale(), "gradient overflow; skipping batch");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_input_size_is_a_stride_aligned_cube_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let [d, h, w] = random_input_size(&mut rng, [2, 4]);
            assert!(d == h && h == w);
            assert!([64, 96, 128].contains(&d), "{d}");
        }
        assert_eq!(random_input_size(&mut rng, [3, 3]), [96; 3]);
    }
}
