//! PNG rendering of FROC curves (sensitivity vs. FP per volume).

use crate::{FrocCurve, FrocError, FrocResult};
use plotters::prelude::*;
use std::path::Path;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn plot_error(path: &Path, err: impl std::fmt::Display) -> FrocError {
    FrocError::Plot {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Draw every curve as a step line over `fp_range`, one legend entry per curve.
pub fn save_plot(path: &Path, curves: &[&FrocCurve], fp_range: (f64, f64)) -> FrocResult<()> {
    let (lo, hi) = fp_range;
    let root = BitMapBackend::new(path, (WIDTH, HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| plot_error(path, e))?;

    let mut chart = ChartBuilder::on(&root)
        .margin(12)
        .caption("FROC", ("sans-serif", 22))
        .set_label_area_size(LabelAreaPosition::Left, 50)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .build_cartesian_2d(lo..hi, 0.0f64..1.0f64)
        .map_err(|e| plot_error(path, e))?;
    chart
        .configure_mesh()
        .x_desc("FP per volume")
        .y_desc("sensitivity")
        .draw()
        .map_err(|e| plot_error(path, e))?;

    for (idx, curve) in curves.iter().enumerate() {
        let color = Palette99::pick(idx).to_rgba();
        chart
            .draw_series(LineSeries::new(step_points(curve, fp_range), color.stroke_width(2)))
            .map_err(|e| plot_error(path, e))?
            .label(curve.label.clone())
            .legend(move |(x, y)| {
                PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
            });
    }
    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::LowerRight)
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(|e| plot_error(path, e))?;
    root.present().map_err(|e| plot_error(path, e))
}

/// Corner points of the envelope drawn as a staircase, clipped to `fp_range`.
pub fn step_points(curve: &FrocCurve, fp_range: (f64, f64)) -> Vec<(f64, f64)> {
    let (lo, hi) = fp_range;
    let mut points = vec![(lo, 0.0)];
    let mut last = 0.0;
    for (fp, sens) in curve.envelope() {
        if fp > hi {
            break;
        }
        let fp = fp.max(lo);
        points.push((fp, last));
        points.push((fp, sens));
        last = sens;
    }
    points.push((hi, last));
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrocPoint;

    fn point(fp: f64, sens: f64) -> FrocPoint {
        FrocPoint {
            threshold: 0.0,
            true_positives: 0,
            false_positives: 0,
            sensitivity: sens,
            fp_per_volume: fp,
        }
    }

    #[test]
    fn staircase_holds_sensitivity_until_next_fp_rate() {
        let curve = FrocCurve {
            label: "15mm".into(),
            min_diameter_mm: 15.0,
            total_lesions: 2,
            num_volumes: 1,
            points: vec![point(0.0, 0.5), point(2.0, 1.0), point(9.0, 1.0)],
        };
        assert_eq!(
            step_points(&curve, (0.0, 8.0)),
            vec![
                (0.0, 0.0),
                (0.0, 0.0),
                (0.0, 0.5),
                (2.0, 0.5),
                (2.0, 1.0),
                (8.0, 1.0)
            ]
        );
    }
}
