use crate::{BoxZyx, ContractError, ContractResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the annotation set inside a dataset root.
pub const ANNOTATIONS_FILE: &str = "annotations.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LesionAnnotation {
    #[serde(rename = "box")]
    pub bbox: BoxZyx,
    #[serde(default)]
    pub class_id: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeAnnotation {
    pub id: String,
    /// Raw `u8` voxel file, z-major, relative to the dataset root.
    pub volume: String,
    /// Voxel shape `[D, H, W]`.
    pub shape: [usize; 3],
    #[serde(default = "default_spacing")]
    pub spacing_mm: [f32; 3],
    /// Cross-validation fold this volume is held out in.
    #[serde(default)]
    pub fold: Option<u32>,
    #[serde(default)]
    pub lesions: Vec<LesionAnnotation>,
}

fn default_spacing() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Valid,
}

impl VolumeAnnotation {
    pub fn volume_path(&self, root: &Path) -> PathBuf {
        root.join(&self.volume)
    }

    pub fn voxel_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn validate(&self) -> ContractResult<()> {
        if self.id.trim().is_empty() {
            return Err(ContractError::InvalidVolume {
                id: self.id.clone(),
                msg: "empty id".into(),
            });
        }
        if self.shape.iter().any(|d| *d == 0) {
            return Err(ContractError::InvalidVolume {
                id: self.id.clone(),
                msg: format!("degenerate shape {:?}", self.shape),
            });
        }
        if self.spacing_mm.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(ContractError::InvalidVolume {
                id: self.id.clone(),
                msg: format!("invalid spacing {:?}", self.spacing_mm),
            });
        }
        for lesion in &self.lesions {
            if !lesion.bbox.is_valid() {
                return Err(ContractError::InvalidBox(lesion.bbox));
            }
        }
        Ok(())
    }

    pub fn in_split(&self, fold: Option<u32>, split: Split) -> bool {
        let held_out = fold.is_some() && self.fold == fold;
        match split {
            Split::Train => !held_out,
            Split::Valid => held_out || fold.is_none(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnotationSet {
    pub volumes: Vec<VolumeAnnotation>,
}

impl AnnotationSet {
    /// Load `annotations.json` from a dataset root and validate every entry.
    pub fn load_root(root: &Path) -> ContractResult<Self> {
        Self::load(&root.join(ANNOTATIONS_FILE))
    }

    pub fn load(path: &Path) -> ContractResult<Self> {
        let bytes = fs::read(path).map_err(|source| ContractError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let set: AnnotationSet =
            serde_json::from_slice(&bytes).map_err(|source| ContractError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        for volume in &set.volumes {
            volume.validate()?;
        }
        Ok(set)
    }

    pub fn save(&self, path: &Path) -> ContractResult<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|source| ContractError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| ContractError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self, id: &str) -> Option<&VolumeAnnotation> {
        self.volumes.iter().find(|v| v.id == id)
    }

    /// Volumes belonging to `split` under fold-based cross validation. Without a
    /// fold, every volume is in both splits.
    pub fn split(&self, fold: Option<u32>, split: Split) -> Vec<VolumeAnnotation> {
        self.volumes
            .iter()
            .filter(|v| v.in_split(fold, split))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(id: &str, fold: Option<u32>) -> VolumeAnnotation {
        VolumeAnnotation {
            id: id.into(),
            volume: format!("{id}.raw"),
            shape: [8, 8, 8],
            spacing_mm: [1.0; 3],
            fold,
            lesions: vec![LesionAnnotation {
                bbox: BoxZyx::new([4.0; 3], [2.0; 3]),
                class_id: 0,
            }],
        }
    }

    #[test]
    fn fold_split_holds_out_matching_fold() {
        let set = AnnotationSet {
            volumes: vec![volume("a", Some(0)), volume("b", Some(1)), volume("c", None)],
        };
        let train: Vec<_> = set.split(Some(1), Split::Train).into_iter().map(|v| v.id).collect();
        let valid: Vec<_> = set.split(Some(1), Split::Valid).into_iter().map(|v| v.id).collect();
        assert_eq!(train, vec!["a", "c"]);
        assert_eq!(valid, vec!["b"]);
        assert_eq!(set.split(None, Split::Valid).len(), 3);
    }

    #[test]
    fn zero_sized_lesion_rejected() {
        let mut v = volume("a", None);
        v.lesions[0].bbox.size = [0.0, 2.0, 2.0];
        assert!(matches!(v.validate(), Err(ContractError::InvalidBox(_))));
    }
}
