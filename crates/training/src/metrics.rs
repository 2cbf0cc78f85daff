use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Loss components tracked per step, in `[ciou, conf, cls, total]` order.
pub const LOSS_COMPONENTS: usize = 4;

/// Online mean of the loss components over one epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningLoss {
    mean: [f32; LOSS_COMPONENTS],
}

impl RunningLoss {
    pub fn reset(&mut self) {
        self.mean = [0.0; LOSS_COMPONENTS];
    }

    /// Fold in the items of step `i` (0-based within the epoch).
    pub fn update(&mut self, i: usize, items: [f32; LOSS_COMPONENTS]) {
        let n = i as f32;
        for (m, x) in self.mean.iter_mut().zip(items) {
            *m = (*m * n + x) / (n + 1.0);
        }
    }

    pub fn mean(&self) -> [f32; LOSS_COMPONENTS] {
        self.mean
    }

    pub fn total(&self) -> f32 {
        self.mean[3]
    }
}

/// Collects one objectness value per volume: the `rank`-th highest raw
/// objectness, or the lowest when the volume has fewer candidates.
#[derive(Debug, Clone)]
pub struct ConfidenceProbe {
    rank: usize,
    values: Vec<f32>,
}

impl ConfidenceProbe {
    pub fn new(rank: usize) -> Self {
        Self {
            rank: rank.max(1),
            values: Vec::new(),
        }
    }

    /// Records the ranked value for one volume and returns it. Empty input
    /// records nothing.
    pub fn observe(&mut self, objectness: &[f32]) -> Option<f32> {
        let value = ranked_value(objectness, self.rank)?;
        self.values.push(value);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Linear-interpolated percentile (`p` in `[0, 100]`) over recorded volumes.
    pub fn percentile(&self, p: f64) -> Option<f32> {
        percentile(&self.values, p)
    }
}

pub fn ranked_value(values: &[f32], rank: usize) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<f32> = values.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let idx = rank.max(1).min(sorted.len()) - 1;
    Some(sorted[idx])
}

pub fn percentile(values: &[f32], p: f64) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<f32> = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = p.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = (pos - lo as f64) as f32;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Destination for scalar training metrics.
pub trait MetricsSink {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> std::io::Result<()>;

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn scalar(&mut self, _tag: &str, _value: f64, _step: usize) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    value: f64,
    step: usize,
}

/// Appends `{"tag","value","step"}` lines to a JSONL file.
pub struct JsonlMetrics {
    path: PathBuf,
    writer: BufWriter<File>,
}

pub const METRICS_FILE: &str = "metrics.jsonl";

impl JsonlMetrics {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        Self::open(dir.as_ref().join(METRICS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlMetrics {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> std::io::Result<()> {
        let line = serde_json::to_string(&ScalarRecord { tag, value, step })
            .map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Drop for JsonlMetrics {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
