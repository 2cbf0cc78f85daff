//! Checkpoint envelope and the epoch/latest/best file policy.
//!
//! Each `.ckpt` file is one bincode envelope holding the epoch, the best
//! validation score so far, and the model (plus optionally optimizer) records
//! encoded with burn's full-precision binary recorder.

use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder, RecorderError};
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const BEST_FILE: &str = "best.ckpt";
pub const LATEST_FILE: &str = "latest_epoch.ckpt";

pub fn backup_file(epoch: usize) -> String {
    format!("backup_epoch{epoch}.ckpt")
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode checkpoint envelope: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode checkpoint {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },
    #[error("burn record error: {0:?}")]
    Record(RecorderError),
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointEnvelope {
    pub epoch: Option<usize>,
    pub best_score: Option<f64>,
    pub model: Vec<u8>,
    pub optimizer: Option<Vec<u8>>,
}

impl CheckpointEnvelope {
    pub fn read(path: &Path) -> CheckpointResult<Self> {
        let bytes = fs::read(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        bincode::deserialize(&bytes).map_err(|source| CheckpointError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn write(&self, path: &Path) -> CheckpointResult<()> {
        let bytes = bincode::serialize(self).map_err(CheckpointError::Encode)?;
        fs::write(path, bytes).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

type Bytes = BinBytesRecorder<FullPrecisionSettings>;

pub fn encode_model<B, M>(model: &M) -> CheckpointResult<Vec<u8>>
where
    B: Backend,
    M: Module<B>,
{
    <Bytes as Recorder<B>>::record(&Bytes::default(), model.clone().into_record(), ())
        .map_err(CheckpointError::Record)
}

pub fn decode_model<B, M>(model: M, bytes: Vec<u8>, device: &B::Device) -> CheckpointResult<M>
where
    B: Backend,
    M: Module<B>,
{
    let record = <Bytes as Recorder<B>>::load(&Bytes::default(), bytes, device)
        .map_err(CheckpointError::Record)?;
    Ok(model.load_record(record))
}

fn encode_optimizer<B, M, O>(optim: &O) -> CheckpointResult<Vec<u8>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    <Bytes as Recorder<B>>::record(&Bytes::default(), optim.to_record(), ())
        .map_err(CheckpointError::Record)
}

fn decode_optimizer<B, M, O>(optim: O, bytes: Vec<u8>, device: &B::Device) -> CheckpointResult<O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let record = <Bytes as Recorder<B>>::load(&Bytes::default(), bytes, device)
        .map_err(CheckpointError::Record)?;
    Ok(optim.load_record(record))
}

/// Model weights from any checkpoint envelope, ignoring the training state.
pub fn load_model_weights<B, M>(path: &Path, model: M, device: &B::Device) -> CheckpointResult<M>
where
    B: Backend,
    M: Module<B>,
{
    let envelope = CheckpointEnvelope::read(path)?;
    decode_model::<B, M>(model, envelope.model, device)
}

/// State restored by [`CheckpointManager::load`].
pub struct Restored<M, O> {
    pub model: M,
    pub optimizer: O,
    /// First epoch to run: stored epoch + 1, or 0 for pretrained weights.
    pub start_epoch: usize,
}

/// Files written by one [`CheckpointManager::save`].
#[derive(Debug, Clone)]
pub struct SavedCheckpoint {
    pub backup: PathBuf,
    pub latest: PathBuf,
    pub best: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    best_score: f64,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> CheckpointResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            best_score: 0.0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_FILE)
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_FILE)
    }

    pub fn backup_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(backup_file(epoch))
    }

    /// Whether `score` at `epoch` also goes to the best file. Call after the
    /// best score has been raised; a tie with a positive best overwrites it.
    fn writes_best(&self, epoch: usize, score: f64) -> bool {
        epoch == 0 || (self.best_score == score && score > 0.0)
    }

    /// Write the backup and latest files for `epoch`, plus the best file when
    /// `score` matches a positive best (or on the first epoch).
    pub fn save<B, M, O>(
        &mut self,
        epoch: usize,
        score: f64,
        model: &M,
        optim: &O,
    ) -> CheckpointResult<SavedCheckpoint>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        if score > self.best_score {
            self.best_score = score;
        }
        let envelope = CheckpointEnvelope {
            epoch: Some(epoch),
            best_score: Some(self.best_score),
            model: encode_model::<B, M>(model)?,
            optimizer: Some(encode_optimizer::<B, M, O>(optim)?),
        };
        let backup = self.backup_path(epoch);
        let latest = self.latest_path();
        envelope.write(&backup)?;
        envelope.write(&latest)?;
        let best = if self.writes_best(epoch, score) {
            let path = self.best_path();
            envelope.write(&path)?;
            info!(epoch, score, path = %path.display(), "saved best checkpoint");
            Some(path)
        } else {
            None
        };
        debug!(epoch, score, best_score = self.best_score, "saved checkpoint");
        Ok(SavedCheckpoint {
            backup,
            latest,
            best,
        })
    }

    /// Restore model weights from `path`. Unless `as_pretrained`, also
    /// restore the epoch, optimizer state and best score when present.
    pub fn load<B, M, O>(
        &mut self,
        path: &Path,
        as_pretrained: bool,
        model: M,
        optim: O,
        device: &B::Device,
    ) -> CheckpointResult<Restored<M, O>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let envelope = CheckpointEnvelope::read(path)?;
        let model = decode_model::<B, M>(model, envelope.model, device)?;
        if as_pretrained {
            info!(path = %path.display(), "loaded pretrained weights");
            return Ok(Restored {
                model,
                optimizer: optim,
                start_epoch: 0,
            });
        }
        let start_epoch = envelope.epoch.map_or(0, |e| e + 1);
        let optimizer = match envelope.optimizer {
            Some(bytes) => decode_optimizer::<B, M, O>(optim, bytes, device)?,
            None => optim,
        };
        if let Some(best) = envelope.best_score {
            self.best_score = best;
        }
        info!(
            path = %path.display(),
            start_epoch,
            best_score = self.best_score,
            "resumed from checkpoint"
        );
        Ok(Restored {
            model,
            optimizer,
            start_epoch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.ckpt");
        let env = CheckpointEnvelope {
            epoch: Some(4),
            best_score: None,
            model: vec![1, 2, 3],
            optimizer: None,
        };
        env.write(&path).unwrap();
        let back = CheckpointEnvelope::read(&path).unwrap();
        assert_eq!(back.epoch, Some(4));
        assert_eq!(back.best_score, None);
        assert_eq!(back.model, vec![1, 2, 3]);
        assert!(back.optimizer.is_none());
    }

    #[test]
    fn best_file_rule() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = CheckpointManager::new(dir.path()).unwrap();
        assert!(m.writes_best(0, 0.0));
        m.best_score = 0.4;
        assert!(m.writes_best(3, 0.4));
        assert!(!m.writes_best(3, 0.3));
        m.best_score = 0.0;
        assert!(!m.writes_best(2, 0.0));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CheckpointEnvelope::read(&dir.path().join("nope.ckpt")).unwrap_err();
        assert!(matches!(err, CheckpointError::Io { .. }));
    }
}
