use crate::checkpoint::load_model_weights;
use crate::config::DetectorConfig;
use crate::dataset::VolumeDataset;
use crate::evaluator::Evaluator;
use crate::metrics::JsonlMetrics;
use crate::trainer::{TrainOptions, Trainer, FROC_PLOT_FILE, PREDICTION_SUBDIR};
use crate::TrainBackend;
use anyhow::Context;
use burn::backend::Autodiff;
use clap::{Parser, ValueEnum};
use models::Yolo3d;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use volume_contracts::{AnnotationSet, Split};

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train the volumetric YOLO lesion detector")]
pub struct TrainArgs {
    /// TOML config; falls back to $VOLDET_CONFIG, then built-in defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Checkpoint to start from (pretrained weights unless --resume).
    #[arg(long)]
    pub weight_path: Option<PathBuf>,
    /// Resume epoch, optimizer state and best score from --weight-path.
    #[arg(long, default_value_t = false)]
    pub resume: bool,
    /// Directory for checkpoints, predictions, metrics and the FROC plot.
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: PathBuf,
    /// Optimizer step every N batches.
    #[arg(long, default_value_t = 2)]
    pub accumulate: usize,
    /// Dynamic loss scaling.
    #[arg(long, default_value_t = false)]
    pub fp16: bool,
    /// Cross-validation fold held out for validation.
    #[arg(long)]
    pub fold: Option<u32>,
    /// Override `train.epochs` from the config.
    #[arg(long)]
    pub epochs: Option<usize>,
}

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Evaluate a detector checkpoint and report FROC areas"
)]
pub struct EvalArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Checkpoint whose model weights are evaluated.
    #[arg(long)]
    pub weights: PathBuf,
    /// Output directory for predictions, the FROC plot and curve CSVs.
    #[arg(long, default_value = "eval_out")]
    pub out_dir: PathBuf,
    #[arg(long)]
    pub fold: Option<u32>,
}

/// Install the fmt subscriber; `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; running on WGPU despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    let mut cfg = DetectorConfig::load(args.config.as_deref())?;
    if let Some(epochs) = args.epochs {
        cfg.train.epochs = epochs;
    }
    let metrics = JsonlMetrics::in_dir(&args.checkpoint_dir)
        .with_context(|| format!("opening metrics under {}", args.checkpoint_dir.display()))?;
    info!(metrics = %metrics.path().display(), "metrics sink ready");

    let opts = TrainOptions {
        weight_path: args.weight_path,
        resume: args.resume,
        checkpoint_dir: args.checkpoint_dir,
        accumulate: args.accumulate,
        fp16: args.fp16,
        fold: args.fold,
    };
    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let mut trainer =
        Trainer::<Autodiff<TrainBackend>>::new(cfg, opts, Box::new(metrics), device)?;
    let report = trainer.run()?;
    info!(
        epochs_run = report.epochs_run,
        best_score = report.best_score,
        "done"
    );
    Ok(())
}

pub fn run_eval(args: EvalArgs) -> anyhow::Result<froc::FrocReport> {
    validate_backend_choice(args.backend)?;
    let cfg = DetectorConfig::load(args.config.as_deref())?;
    let root = &cfg.train.data_root;
    let annotations = AnnotationSet::load_root(root)
        .with_context(|| format!("loading annotations under {}", root.display()))?;
    let dataset = VolumeDataset::from_annotations(
        root,
        &annotations,
        args.fold,
        Split::Valid,
        cfg.val.input_size,
        cfg.val.max_volumes,
    )?;

    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let model = Yolo3d::<TrainBackend>::new(&cfg.model, &device);
    let model = load_model_weights::<TrainBackend, _>(&args.weights, model, &device)
        .with_context(|| format!("loading weights from {}", args.weights.display()))?;

    let evaluator = Evaluator::new(cfg.val.eval_settings(), args.out_dir.join(PREDICTION_SUBDIR));
    evaluator.clear_predictions()?;
    let summary = evaluator.evaluate(&model, &dataset, &device)?;
    let report = froc::calculate_froc_with(
        &annotations,
        evaluator.pred_dir(),
        &cfg.val.froc_config(Some(summary.volume_ids)),
    )?;
    report.save_plot(&args.out_dir.join(FROC_PLOT_FILE))?;
    report.small.write_csv(&args.out_dir.join("froc_10mm.csv"))?;
    report.big.write_csv(&args.out_dir.join("froc_15mm.csv"))?;
    info!(
        auc_10mm = report.area_small,
        auc_15mm = report.area_big,
        confidence = ?summary.confidence,
        "evaluation done"
    );
    Ok(report)
}
