use burn::backend::ndarray::NdArray;
use models::{Yolo3d, Yolo3dConfig};
use training::dataset::{VolumeDataset, VolumeSample};
use training::evaluator::{EvalSettings, Evaluator};
use volume_contracts::{prediction_path, read_predictions, PREDICTION_TEMPLATE};

type B = NdArray<f32>;

fn sample(id: &str, original_shape: [usize; 3]) -> VolumeSample {
    VolumeSample {
        id: id.into(),
        image: (0..32 * 32 * 32).map(|i| ((i * 13) % 97) as f32 / 97.0).collect(),
        input_size: [32, 32, 32],
        original_shape,
        lesions: Vec::new(),
    }
}

#[test]
fn predictions_respect_top_k_threshold_and_bounds() -> anyhow::Result<()> {
    let device = Default::default();
    let model = Yolo3d::<B>::new(
        &Yolo3dConfig {
            base_channels: 2,
            ..Default::default()
        },
        &device,
    );
    let dir = tempfile::tempdir()?;
    let settings = EvalSettings {
        conf_thresh: 0.2,
        nms_thresh: 1.0,
        box_top_k: 16,
        scale_to_original: true,
        ..Default::default()
    };
    let evaluator = Evaluator::new(settings, dir.path().join("preds"));
    evaluator.clear_predictions()?;

    let dataset = VolumeDataset::from_samples(vec![sample("a", [64, 48, 40]), sample("b", [32, 32, 32])]);
    let summary = evaluator.evaluate(&model, &dataset, &device)?;
    assert_eq!(summary.volume_ids, vec!["a".to_string(), "b".to_string()]);
    assert!(summary.confidence.is_some());

    for s in dataset.samples() {
        let path = prediction_path(evaluator.pred_dir(), PREDICTION_TEMPLATE, &s.id);
        let dets = read_predictions(&path)?;
        assert!(dets.len() <= 16);
        for d in &dets {
            assert!(d.score >= 0.2);
            let max = d.bbox.max_corner();
            for axis in 0..3 {
                assert!(max[axis] <= s.original_shape[axis] as f32 + 1e-3);
            }
        }
    }
    Ok(())
}
