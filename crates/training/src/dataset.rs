use crate::targets::TargetAssigner;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use models::ANCHORS_PER_SCALE;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use volume_contracts::{AnnotationSet, ContractError, LesionAnnotation, Split, VolumeAnnotation};

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("volume {path} holds {actual} voxels, expected {expected}")]
    VoxelCount {
        path: PathBuf,
        actual: usize,
        expected: usize,
    },
    #[error("cannot collate empty batch")]
    EmptyBatch,
    #[error("samples in a batch must share input size: {0:?} vs {1:?}")]
    MixedInputSize([usize; 3], [usize; 3]),
}

/// A volume resampled to network input size, with lesion boxes in input voxels.
#[derive(Debug, Clone)]
pub struct VolumeSample {
    pub id: String,
    /// `[D, H, W]` voxels in z-major order, normalized to `[0, 1]`.
    pub image: Vec<f32>,
    pub input_size: [usize; 3],
    pub original_shape: [usize; 3],
    pub lesions: Vec<LesionAnnotation>,
}

impl VolumeSample {
    /// Per-axis factor mapping input voxels back to original voxels.
    pub fn to_original_scale(&self) -> [f32; 3] {
        [0, 1, 2].map(|a| self.original_shape[a] as f32 / self.input_size[a] as f32)
    }

    /// The same volume resampled (nearest) to another input size.
    pub fn resized(&self, input_size: [usize; 3]) -> VolumeSample {
        let factor = [0, 1, 2].map(|a| input_size[a] as f32 / self.input_size[a] as f32);
        VolumeSample {
            id: self.id.clone(),
            image: resample_nearest_with(&self.image, self.input_size, input_size, |v| v),
            input_size,
            original_shape: self.original_shape,
            lesions: self
                .lesions
                .iter()
                .map(|l| LesionAnnotation {
                    bbox: l.bbox.scaled(factor),
                    class_id: l.class_id,
                })
                .collect(),
        }
    }
}

/// Nearest-neighbour resample of a z-major `u8` volume, normalized by 255.
pub fn resample_nearest(data: &[u8], shape: [usize; 3], target: [usize; 3]) -> Vec<f32> {
    resample_nearest_with(data, shape, target, |v| v as f32 / 255.0)
}

fn resample_nearest_with<T: Copy>(
    data: &[T],
    shape: [usize; 3],
    target: [usize; 3],
    value: impl Fn(T) -> f32,
) -> Vec<f32> {
    let index = |axis: usize, i: usize| -> usize {
        let src = ((i as f64 + 0.5) * shape[axis] as f64 / target[axis] as f64).floor() as usize;
        src.min(shape[axis] - 1)
    };
    let zs: Vec<usize> = (0..target[0]).map(|i| index(0, i)).collect();
    let ys: Vec<usize> = (0..target[1]).map(|i| index(1, i)).collect();
    let xs: Vec<usize> = (0..target[2]).map(|i| index(2, i)).collect();
    let mut out = Vec::with_capacity(target.iter().product());
    for &z in &zs {
        for &y in &ys {
            let row = (z * shape[1] + y) * shape[2];
            out.extend(xs.iter().map(|&x| value(data[row + x])));
        }
    }
    out
}

/// Read a raw volume from disk and resample it to `input_size`.
pub fn load_volume(
    root: &Path,
    ann: &VolumeAnnotation,
    input_size: [usize; 3],
) -> DatasetResult<VolumeSample> {
    let path = ann.volume_path(root);
    let bytes = fs::read(&path).map_err(|source| DatasetError::Io {
        path: path.clone(),
        source,
    })?;
    if bytes.len() != ann.voxel_count() {
        return Err(DatasetError::VoxelCount {
            path,
            actual: bytes.len(),
            expected: ann.voxel_count(),
        });
    }
    let image = resample_nearest(&bytes, ann.shape, input_size);
    let to_input = [0, 1, 2].map(|a| input_size[a] as f32 / ann.shape[a] as f32);
    let lesions = ann
        .lesions
        .iter()
        .map(|l| LesionAnnotation {
            bbox: l.bbox.scaled(to_input),
            class_id: l.class_id,
        })
        .collect();
    Ok(VolumeSample {
        id: ann.id.clone(),
        image,
        input_size,
        original_shape: ann.shape,
        lesions,
    })
}

#[derive(Debug, Clone, Default)]
pub struct VolumeDataset {
    samples: Vec<VolumeSample>,
}

impl VolumeDataset {
    pub fn from_samples(samples: Vec<VolumeSample>) -> Self {
        Self { samples }
    }

    /// Load every volume of `split` under `root/annotations.json`.
    pub fn from_root(
        root: &Path,
        fold: Option<u32>,
        split: Split,
        input_size: [usize; 3],
        limit: Option<usize>,
    ) -> DatasetResult<Self> {
        let set = AnnotationSet::load_root(root)?;
        Self::from_annotations(root, &set, fold, split, input_size, limit)
    }

    /// Like [`VolumeDataset::from_root`], reusing an already loaded annotation set.
    pub fn from_annotations(
        root: &Path,
        set: &AnnotationSet,
        fold: Option<u32>,
        split: Split,
        input_size: [usize; 3],
        limit: Option<usize>,
    ) -> DatasetResult<Self> {
        let mut volumes = set.split(fold, split);
        if let Some(limit) = limit {
            volumes.truncate(limit);
        }
        let samples = volumes
            .iter()
            .map(|ann| load_volume(root, ann, input_size))
            .collect::<DatasetResult<Vec<_>>>()?;
        info!(?split, ?fold, volumes = samples.len(), "loaded volume dataset");
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[VolumeSample] {
        &self.samples
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.samples.len().div_ceil(batch_size.max(1))
    }

    /// Batch iterator for one epoch; shuffling is seeded by `seed` and `epoch`.
    pub fn batches(&self, batch_size: usize, shuffle: Option<(u64, usize)>) -> VolumeBatchIter<'_> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if let Some((seed, epoch)) = shuffle {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        VolumeBatchIter {
            dataset: self,
            order,
            cursor: 0,
            batch_size: batch_size.max(1),
            input_size: None,
        }
    }
}

/// A collated batch: images plus per-scale label grids and box lists.
#[derive(Debug, Clone)]
pub struct VolumeBatch<B: Backend> {
    /// `[B, 1, D, H, W]`.
    pub images: Tensor<B, 5>,
    /// Per scale `[B, gd, gh, gw, A, 8 + C]`.
    pub labels: [Tensor<B, 6>; 3],
    /// Per scale `[B, max_boxes, 6]`.
    pub bboxes: [Tensor<B, 3>; 3],
    pub ids: Vec<String>,
    pub input_size: [usize; 3],
}

pub fn collate<B: Backend>(
    samples: &[&VolumeSample],
    assigner: &TargetAssigner,
    device: &B::Device,
) -> DatasetResult<VolumeBatch<B>> {
    let first = samples.first().ok_or(DatasetError::EmptyBatch)?;
    let input_size = first.input_size;
    let batch = samples.len();
    let voxels: usize = input_size.iter().product();
    let f = assigner.label_channels();
    let grids = [0, 1, 2].map(|s| TargetAssigner::grid_for(input_size, s));

    let mut image_buf = Vec::with_capacity(batch * voxels);
    let mut label_bufs: [Vec<f32>; 3] = Default::default();
    let mut box_bufs: [Vec<f32>; 3] = Default::default();
    let mut ids = Vec::with_capacity(batch);
    for sample in samples {
        if sample.input_size != input_size {
            return Err(DatasetError::MixedInputSize(input_size, sample.input_size));
        }
        image_buf.extend_from_slice(&sample.image);
        let targets = assigner.assign(input_size, &sample.lesions);
        for scale in 0..3 {
            label_bufs[scale].extend_from_slice(&targets.labels[scale]);
            box_bufs[scale].extend_from_slice(&targets.bboxes[scale]);
        }
        ids.push(sample.id.clone());
    }

    let [d, h, w] = input_size;
    let images = Tensor::<B, 5>::from_data(TensorData::new(image_buf, [batch, 1, d, h, w]), device);
    let mut label_bufs = label_bufs.into_iter();
    let labels = grids.map(|g| {
        let data = label_bufs.next().unwrap_or_default();
        Tensor::<B, 6>::from_data(
            TensorData::new(data, [batch, g[0], g[1], g[2], ANCHORS_PER_SCALE, f]),
            device,
        )
    });
    let bboxes = box_bufs.map(|data| {
        Tensor::<B, 3>::from_data(
            TensorData::new(data, [batch, assigner.max_boxes, 6]),
            device,
        )
    });
    Ok(VolumeBatch {
        images,
        labels,
        bboxes,
        ids,
        input_size,
    })
}

pub struct VolumeBatchIter<'a> {
    dataset: &'a VolumeDataset,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    input_size: Option<[usize; 3]>,
}

impl VolumeBatchIter<'_> {
    /// Resample the following batches to `size` instead of the loaded size.
    pub fn set_input_size(&mut self, size: [usize; 3]) {
        self.input_size = Some(size);
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        assigner: &TargetAssigner,
        device: &B::Device,
    ) -> DatasetResult<Option<VolumeBatch<B>>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let picked: Vec<&VolumeSample> = self.order[self.cursor..end]
            .iter()
            .map(|&i| &self.dataset.samples[i])
            .collect();
        self.cursor = end;
        debug!(size = picked.len(), input_size = ?self.input_size, "collating batch");
        match self.input_size {
            Some(size) if picked.iter().any(|s| s.input_size != size) => {
                let resized: Vec<VolumeSample> = picked.iter().map(|s| s.resized(size)).collect();
                let refs: Vec<&VolumeSample> = resized.iter().collect();
                collate(&refs, assigner, device).map(Some)
            }
            _ => collate(&picked, assigner, device).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volume_contracts::BoxZyx;

    #[test]
    fn nearest_resample_downsamples_and_normalizes() {
        // 2x2x2 volume, values 0..8
        let data: Vec<u8> = (0..8).map(|v| v * 10).collect();
        let out = resample_nearest(&data, [2, 2, 2], [1, 1, 1]);
        assert_eq!(out.len(), 1);
        assert!((out[0] - 70.0 / 255.0).abs() < 1e-6);

        let up = resample_nearest(&[0, 255], [1, 1, 2], [1, 1, 4]);
        assert_eq!(up, vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn resized_sample_rescales_image_and_boxes() {
        let sample = VolumeSample {
            id: "v".into(),
            image: vec![0.0, 1.0],
            input_size: [1, 1, 2],
            original_shape: [1, 1, 4],
            lesions: vec![LesionAnnotation {
                bbox: BoxZyx::new([0.5, 0.5, 1.0], [1.0, 1.0, 1.0]),
                class_id: 1,
            }],
        };
        let big = sample.resized([2, 2, 4]);
        assert_eq!(big.image, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
        assert_eq!(big.lesions[0].bbox.center, [1.0, 1.0, 2.0]);
        assert_eq!(big.lesions[0].bbox.size, [2.0, 2.0, 2.0]);
        assert_eq!(big.original_shape, [1, 1, 4]);
        assert_eq!(big.to_original_scale(), [0.5, 0.5, 1.0]);
    }

    #[test]
    fn iterator_resizes_batches_after_override() {
        let sample = |id: &str| VolumeSample {
            id: id.into(),
            image: vec![0.5; 32 * 32 * 32],
            input_size: [32; 3],
            original_shape: [64; 3],
            lesions: vec![LesionAnnotation {
                bbox: BoxZyx::new([16.0; 3], [8.0; 3]),
                class_id: 0,
            }],
        };
        let dataset = VolumeDataset::from_samples(vec![sample("a"), sample("b")]);
        let assigner = TargetAssigner {
            anchors: models::DEFAULT_ANCHORS,
            num_classes: 1,
            max_boxes: 4,
            label_smoothing: 0.0,
        };
        let device = Default::default();
        let mut batches = dataset.batches(1, None);
        let first = batches
            .next_batch::<burn_ndarray::NdArray<f32>>(&assigner, &device)
            .unwrap()
            .unwrap();
        assert_eq!(first.input_size, [32; 3]);
        batches.set_input_size([64; 3]);
        let second = batches
            .next_batch::<burn_ndarray::NdArray<f32>>(&assigner, &device)
            .unwrap()
            .unwrap();
        assert_eq!(second.input_size, [64; 3]);
        assert_eq!(second.images.dims(), [1, 1, 64, 64, 64]);
        assert!(batches
            .next_batch::<burn_ndarray::NdArray<f32>>(&assigner, &device)
            .unwrap()
            .is_none());
    }

    #[test]
    fn load_volume_scales_boxes_into_input_space() {
        let tmp = tempfile::tempdir().unwrap();
        let ann = VolumeAnnotation {
            id: "v".into(),
            volume: "v.raw".into(),
            shape: [4, 8, 8],
            spacing_mm: [1.0; 3],
            fold: None,
            lesions: vec![LesionAnnotation {
                bbox: BoxZyx::new([2.0, 4.0, 4.0], [2.0, 4.0, 4.0]),
                class_id: 0,
            }],
        };
        fs::write(tmp.path().join("v.raw"), vec![128u8; 4 * 8 * 8]).unwrap();
        let sample = load_volume(tmp.path(), &ann, [8, 4, 16]).unwrap();
        assert_eq!(sample.image.len(), 8 * 4 * 16);
        assert_eq!(sample.lesions[0].bbox.center, [4.0, 2.0, 8.0]);
        assert_eq!(sample.lesions[0].bbox.size, [4.0, 2.0, 8.0]);
        assert_eq!(sample.to_original_scale(), [0.5, 2.0, 0.5]);

        fs::write(tmp.path().join("v.raw"), vec![0u8; 10]).unwrap();
        assert!(matches!(
            load_volume(tmp.path(), &ann, [8, 4, 16]),
            Err(DatasetError::VoxelCount { .. })
        ));
    }
}
