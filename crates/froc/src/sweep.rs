use crate::{FrocCurve, FrocError, FrocPoint, FrocResult};
use volume_contracts::{BoxZyx, Detection, VolumeAnnotation};

/// One volume's ground truth and detections, detections ordered by decreasing score.
#[derive(Debug, Clone)]
pub struct ScoredVolume {
    pub lesions: Vec<BoxZyx>,
    pub spacing_mm: [f32; 3],
    pub detections: Vec<Detection>,
}

impl ScoredVolume {
    pub fn new(annotation: &VolumeAnnotation, detections: Vec<Detection>) -> Self {
        Self::from_parts(
            annotation.lesions.iter().map(|l| l.bbox).collect(),
            annotation.spacing_mm,
            detections,
        )
    }

    pub fn from_parts(
        lesions: Vec<BoxZyx>,
        spacing_mm: [f32; 3],
        mut detections: Vec<Detection>,
    ) -> Self {
        detections.sort_by(|a, b| b.score.total_cmp(&a.score));
        Self {
            lesions,
            spacing_mm,
            detections,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LesionRole {
    Counted,
    Ignored,
}

fn lesion_roles(volume: &ScoredVolume, size_threshold: f32, min_diameter_mm: f32) -> Vec<LesionRole> {
    volume
        .lesions
        .iter()
        .map(|lesion| {
            if lesion.max_extent() < size_threshold
                || lesion.equivalent_diameter_mm(volume.spacing_mm) < min_diameter_mm
            {
                LesionRole::Ignored
            } else {
                LesionRole::Counted
            }
        })
        .collect()
}

/// Thresholds `0, 1/n, 2/n, ..., 1` with `n = round(1 / step)`.
///
/// Each value is `i / n`, the correctly rounded quotient, so a grid point
/// equals the `f32` literal of the same decimal (`9 / 20 == 0.45`).
pub fn threshold_grid(step: f32) -> FrocResult<Vec<f32>> {
    if !(step > 0.0 && step <= 1.0) {
        return Err(FrocError::InvalidStep(step));
    }
    let n = (1.0 / step).round() as usize;
    Ok((0..=n).map(|i| i as f32 / n as f32).collect())
}

/// Count (true positives, false positives) in one volume at one threshold.
fn match_volume(volume: &ScoredVolume, roles: &[LesionRole], threshold: f32) -> (usize, usize) {
    let mut matched = vec![false; volume.lesions.len()];
    let mut tp = 0;
    let mut fp = 0;
    for det in volume.detections.iter().take_while(|d| d.score >= threshold) {
        let center = det.bbox.center;
        let hit = volume
            .lesions
            .iter()
            .enumerate()
            .find(|(i, lesion)| {
                roles[*i] == LesionRole::Counted && !matched[*i] && lesion.contains(center)
            })
            .map(|(i, _)| i);
        if let Some(i) = hit {
            matched[i] = true;
            tp += 1;
            continue;
        }
        let in_ignored = volume
            .lesions
            .iter()
            .zip(roles)
            .any(|(lesion, role)| *role == LesionRole::Ignored && lesion.contains(center));
        if !in_ignored {
            fp += 1;
        }
    }
    (tp, fp)
}

/// Sweep `thresholds` over all volumes for lesions at least `min_diameter_mm` wide.
pub fn sweep_thresholds(
    volumes: &[ScoredVolume],
    thresholds: &[f32],
    size_threshold: f32,
    min_diameter_mm: f32,
    label: String,
) -> FrocCurve {
    let roles: Vec<Vec<LesionRole>> = volumes
        .iter()
        .map(|v| lesion_roles(v, size_threshold, min_diameter_mm))
        .collect();
    let total_lesions: usize = roles
        .iter()
        .map(|r| r.iter().filter(|role| **role == LesionRole::Counted).count())
        .sum();
    let num_volumes = volumes.len();

    let points = thresholds
        .iter()
        .map(|&threshold| {
            let (tp, fp) = volumes
                .iter()
                .zip(&roles)
                .map(|(v, r)| match_volume(v, r, threshold))
                .fold((0, 0), |acc, (tp, fp)| (acc.0 + tp, acc.1 + fp));
            FrocPoint {
                threshold,
                true_positives: tp,
                false_positives: fp,
                sensitivity: if total_lesions == 0 {
                    0.0
                } else {
                    tp as f64 / total_lesions as f64
                },
                fp_per_volume: if num_volumes == 0 {
                    0.0
                } else {
                    fp as f64 / num_volumes as f64
                },
            }
        })
        .collect();

    FrocCurve {
        label,
        min_diameter_mm,
        total_lesions,
        num_volumes,
        points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(center: [f32; 3], score: f32) -> Detection {
        Detection::new(BoxZyx::new(center, [4.0; 3]), score, 0, 1.0)
    }

    #[test]
    fn grid_covers_both_ends() {
        let grid = threshold_grid(0.25).unwrap();
        assert_eq!(grid, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(threshold_grid(0.01).unwrap().len(), 101);
        assert!(threshold_grid(0.0).is_err());
    }

    #[test]
    fn grid_points_equal_their_decimal_literals() {
        let grid = threshold_grid(0.05).unwrap();
        assert_eq!(grid[9], 0.45);
        assert_eq!(grid[15], 0.75);
        assert_eq!(grid[20], 1.0);
        let grid = threshold_grid(0.01).unwrap();
        assert_eq!(grid[45], 0.45);
        assert_eq!(grid[72], 0.72);
    }

    #[test]
    fn detection_on_a_grid_point_counts_at_that_threshold() {
        let lesion = BoxZyx::new([20.0; 3], [30.0; 3]);
        let v = ScoredVolume::from_parts(vec![lesion], [1.0; 3], vec![det([20.0; 3], 0.45)]);
        let grid = threshold_grid(0.05).unwrap();
        let curve = sweep_thresholds(&[v], &grid, 0.0, 0.0, "all".into());
        for p in &curve.points {
            let expected = if p.threshold <= 0.45 { 1.0 } else { 0.0 };
            assert_eq!(p.sensitivity, expected, "threshold {}", p.threshold);
        }
        assert_eq!(curve.point_at(0.45).map(|p| p.true_positives), Some(1));
    }

    #[test]
    fn second_hit_on_matched_lesion_is_false_positive() {
        let lesion = BoxZyx::new([20.0; 3], [30.0; 3]);
        let v = ScoredVolume::from_parts(
            vec![lesion],
            [1.0; 3],
            vec![det([20.0; 3], 0.9), det([22.0; 3], 0.8)],
        );
        let roles = lesion_roles(&v, 0.0, 0.0);
        assert_eq!(match_volume(&v, &roles, 0.5), (1, 1));
        assert_eq!(match_volume(&v, &roles, 0.85), (1, 0));
    }

    #[test]
    fn detections_in_small_lesions_are_ignored() {
        let small = BoxZyx::new([10.0; 3], [5.0; 3]);
        let v = ScoredVolume::from_parts(vec![small], [1.0; 3], vec![det([10.0; 3], 0.9)]);
        let curve = sweep_thresholds(&[v], &[0.0, 0.5], 0.0, 10.0, "10mm".into());
        assert_eq!(curve.total_lesions, 0);
        assert!(curve.points.iter().all(|p| p.false_positives == 0));
    }
}
