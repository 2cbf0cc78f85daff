use crate::{FrocError, FrocResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrocPoint {
    pub threshold: f32,
    pub true_positives: usize,
    pub false_positives: usize,
    pub sensitivity: f64,
    pub fp_per_volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrocCurve {
    pub label: String,
    pub min_diameter_mm: f32,
    pub total_lesions: usize,
    pub num_volumes: usize,
    /// One point per swept threshold, in sweep order.
    pub points: Vec<FrocPoint>,
}

impl FrocCurve {
    pub fn point_at(&self, threshold: f32) -> Option<&FrocPoint> {
        self.points
            .iter()
            .find(|p| (p.threshold - threshold).abs() < 1e-6)
    }

    /// Best sensitivity reachable at or below each distinct FP rate, ascending in FP.
    pub fn envelope(&self) -> Vec<(f64, f64)> {
        let mut pts: Vec<(f64, f64)> = self
            .points
            .iter()
            .map(|p| (p.fp_per_volume, p.sensitivity))
            .collect();
        pts.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut out: Vec<(f64, f64)> = Vec::with_capacity(pts.len());
        let mut best = 0.0f64;
        for (fp, sens) in pts {
            best = best.max(sens);
            match out.last_mut() {
                Some(last) if last.0 == fp => last.1 = best,
                _ => out.push((fp, best)),
            }
        }
        out
    }

    /// Mean envelope sensitivity over `fp_range`, i.e. the area under the
    /// step-wise curve normalized by the range width.
    pub fn area(&self, fp_range: (f64, f64)) -> f64 {
        let (lo, hi) = fp_range;
        if !(hi > lo) {
            return 0.0;
        }
        let mut area = 0.0;
        let mut best = 0.0f64;
        let mut x = lo;
        for (fp, sens) in self.envelope() {
            if fp > x {
                let end = fp.min(hi);
                area += best * (end - x);
                x = end;
            }
            if x >= hi {
                break;
            }
            best = best.max(sens);
        }
        if x < hi {
            area += best * (hi - x);
        }
        area / (hi - lo)
    }

    /// One row per swept threshold, headed by the `FrocPoint` field names.
    pub fn write_csv(&self, path: &Path) -> FrocResult<()> {
        let csv_error = |source: csv::Error| FrocError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
        for point in &self.points {
            writer.serialize(point).map_err(csv_error)?;
        }
        writer.flush().map_err(|source| FrocError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
