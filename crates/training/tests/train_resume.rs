use burn::backend::{ndarray::NdArray, Autodiff};
use std::fs;
use std::path::Path;
use training::checkpoint::{backup_file, CheckpointEnvelope, BEST_FILE, LATEST_FILE};
use training::config::{DataType, DetectorConfig};
use training::metrics::{JsonlMetrics, NullMetrics, METRICS_FILE};
use training::trainer::{TrainOptions, TrainState, Trainer, FROC_PLOT_FILE};
use volume_contracts::annotation::ANNOTATIONS_FILE;
use volume_contracts::{AnnotationSet, BoxZyx, LesionAnnotation, VolumeAnnotation};

type ADBackend = Autodiff<NdArray<f32>>;

fn synthetic_dataset(root: &Path) -> anyhow::Result<()> {
    synthetic_volumes(root, 2)
}

fn synthetic_volumes(root: &Path, count: usize) -> anyhow::Result<()> {
    let shape = [32, 32, 32];
    let mut volumes = Vec::new();
    let centers = [[12.0, 16.0, 16.0], [20.0, 14.0, 18.0], [16.0, 20.0, 12.0]];
    for (i, center) in centers.into_iter().cycle().take(count).enumerate() {
        let id = format!("vol{i}");
        let file = format!("{id}.raw");
        let voxels: Vec<u8> = (0..32 * 32 * 32).map(|v| ((v * 31 + i) % 251) as u8).collect();
        fs::write(root.join(&file), voxels)?;
        volumes.push(VolumeAnnotation {
            id,
            volume: file,
            shape,
            spacing_mm: [1.0, 1.0, 1.0],
            fold: None,
            lesions: vec![LesionAnnotation {
                bbox: BoxZyx::new(center, [10.0, 12.0, 12.0]),
                class_id: 0,
            }],
        });
    }
    AnnotationSet { volumes }.save(&root.join(ANNOTATIONS_FILE))?;
    Ok(())
}

fn tiny_config(root: &Path, epochs: usize) -> DetectorConfig {
    let mut cfg = DetectorConfig::default();
    cfg.model.base_channels = 2;
    cfg.train.data_root = root.to_path_buf();
    cfg.train.data_type = DataType::Abus;
    cfg.train.input_size = [32, 32, 32];
    cfg.train.epochs = epochs;
    cfg.train.warmup_epochs = 1;
    cfg.train.lr_init = 1e-3;
    cfg.train.log_every = 1;
    cfg.val.input_size = [32, 32, 32];
    cfg.val.size_threshold = 1.0;
    cfg.val.small_lesion_mm = 1.0;
    cfg.val.large_lesion_mm = 1.0;
    cfg
}

#[test]
fn tiny_run_checkpoints_and_resumes_at_next_epoch() -> anyhow::Result<()> {
    let data = tempfile::tempdir()?;
    let ckpt = tempfile::tempdir()?;
    synthetic_dataset(data.path())?;
    let device = Default::default();

    let opts = TrainOptions {
        checkpoint_dir: ckpt.path().to_path_buf(),
        accumulate: 2,
        ..Default::default()
    };
    let metrics = JsonlMetrics::in_dir(ckpt.path())?;
    let mut trainer = Trainer::<ADBackend>::new(
        tiny_config(data.path(), 1),
        opts.clone(),
        Box::new(metrics),
        device,
    )?;
    assert_eq!(trainer.state(), TrainState::Initializing);
    let report = trainer.run()?;
    assert_eq!(trainer.state(), TrainState::Finished);
    assert_eq!(report.epochs_run, 1);
    // two batches: step on batch 0, batch 1 is left over
    assert_eq!(report.optimizer_steps, 1);
    assert!(report.last_loss.iter().all(|v| v.is_finite() && *v >= 0.0));
    drop(trainer);

    for file in [backup_file(0), LATEST_FILE.to_string(), BEST_FILE.to_string()] {
        assert!(ckpt.path().join(&file).exists(), "missing {file}");
    }
    assert!(ckpt.path().join(FROC_PLOT_FILE).exists());
    let latest = CheckpointEnvelope::read(&ckpt.path().join(LATEST_FILE))?;
    assert_eq!(latest.epoch, Some(0));
    assert!(latest.optimizer.is_some());

    let metrics = fs::read_to_string(ckpt.path().join(METRICS_FILE))?;
    assert!(metrics.contains("\"train_loss\""));
    assert!(metrics.contains("\"AUC_15mm\""));

    let resume = TrainOptions {
        weight_path: Some(ckpt.path().join(LATEST_FILE)),
        resume: true,
        ..opts
    };
    let mut trainer = Trainer::<ADBackend>::new(
        tiny_config(data.path(), 2),
        resume,
        Box::new(NullMetrics),
        Default::default(),
    )?;
    assert_eq!(trainer.start_epoch(), 1);
    let report = trainer.run()?;
    assert_eq!(report.epochs_run, 1);
    assert_eq!(report.optimizer_steps, 1);
    assert!(ckpt.path().join(backup_file(1)).exists());
    assert_eq!(
        CheckpointEnvelope::read(&ckpt.path().join(LATEST_FILE))?.epoch,
        Some(1)
    );
    Ok(())
}

#[test]
fn coco_runs_skip_validation_and_checkpoints() -> anyhow::Result<()> {
    let data = tempfile::tempdir()?;
    let ckpt = tempfile::tempdir()?;
    synthetic_dataset(data.path())?;
    let mut cfg = tiny_config(data.path(), 1);
    cfg.train.data_type = DataType::Coco;

    let opts = TrainOptions {
        checkpoint_dir: ckpt.path().to_path_buf(),
        fp16: true,
        ..Default::default()
    };
    let mut trainer = Trainer::<ADBackend>::new(cfg, opts, Box::new(NullMetrics), Default::default())?;
    let report = trainer.run()?;
    assert_eq!(report.epochs_run, 1);
    assert!(!ckpt.path().join(LATEST_FILE).exists());
    assert!(!ckpt.path().join(FROC_PLOT_FILE).exists());
    Ok(())
}

#[test]
fn optimizer_steps_on_every_accumulate_th_batch() -> anyhow::Result<()> {
    let data = tempfile::tempdir()?;
    let ckpt = tempfile::tempdir()?;
    synthetic_volumes(data.path(), 3)?;
    let mut cfg = tiny_config(data.path(), 2);
    cfg.train.data_type = DataType::Coco;

    for (accumulate, per_epoch) in [(1, 3), (2, 2), (3, 1)] {
        let opts = TrainOptions {
            checkpoint_dir: ckpt.path().to_path_buf(),
            accumulate,
            ..Default::default()
        };
        let mut trainer =
            Trainer::<ADBackend>::new(cfg.clone(), opts, Box::new(NullMetrics), Default::default())?;
        let report = trainer.run()?;
        assert_eq!(report.optimizer_steps, 2 * per_epoch, "accumulate {accumulate}");
    }
    Ok(())
}
