//! Differentiable 3D box overlap on tensors whose last axis is
//! `[cz, cy, cx, d, h, w]`.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use std::f32::consts::{FRAC_PI_4, PI};

const EPS: f32 = 1e-9;

struct Corners<B: Backend, const D: usize> {
    min: Tensor<B, D>,
    max: Tensor<B, D>,
    center: Tensor<B, D>,
    size: Tensor<B, D>,
}

fn corners<B: Backend, const D: usize>(boxes: Tensor<B, D>) -> Corners<B, D> {
    let center = boxes.clone().narrow(D - 1, 0, 3);
    let size = boxes.narrow(D - 1, 3, 3);
    let half = size.clone().mul_scalar(0.5);
    Corners {
        min: center.clone() - half.clone(),
        max: center.clone() + half,
        center,
        size,
    }
}

fn axis_product<B: Backend, const D: usize>(t: Tensor<B, D>) -> Tensor<B, D> {
    let a = t.clone().narrow(D - 1, 0, 1);
    let b = t.clone().narrow(D - 1, 1, 1);
    let c = t.narrow(D - 1, 2, 1);
    a * b * c
}

/// IoU and the intermediate terms CIoU reuses; every output has a trailing axis of 1.
fn overlap<B: Backend, const D: usize>(
    a: &Corners<B, D>,
    b: &Corners<B, D>,
) -> Tensor<B, D> {
    let lo = a.min.clone().max_pair(b.min.clone());
    let hi = a.max.clone().min_pair(b.max.clone());
    let inter = axis_product((hi - lo).clamp_min(0.0));
    let vol_a = axis_product(a.size.clone().clamp_min(0.0));
    let vol_b = axis_product(b.size.clone().clamp_min(0.0));
    let union = vol_a + vol_b - inter.clone();
    inter / union.add_scalar(EPS)
}

/// Plain IoU of two broadcast-compatible box tensors, `[..., 6] -> [..., 1]`.
pub fn box_iou<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, D> {
    overlap(&corners(a), &corners(b))
}

/// Arctangent for non-negative inputs: `atan(x) = pi/4 + atan((x - 1) / (x + 1))`
/// with a polynomial on the reduced argument (max error ~1.5e-3 rad).
fn atan_nonneg<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let t = (x.clone().sub_scalar(1.0)) / x.add_scalar(1.0);
    let abs = t.clone().abs();
    let poly = abs.clone().mul_scalar(0.0663).add_scalar(0.2447);
    let correction = t.clone() * abs.sub_scalar(1.0) * poly;
    (t.mul_scalar(FRAC_PI_4) - correction).add_scalar(FRAC_PI_4)
}

fn aspect_angle<B: Backend, const D: usize>(size: &Tensor<B, D>, i: usize, j: usize) -> Tensor<B, D> {
    let num = size.clone().narrow(D - 1, i, 1).clamp_min(0.0);
    let den = size.clone().narrow(D - 1, j, 1).clamp_min(0.0).add_scalar(EPS);
    atan_nonneg(num / den)
}

/// Complete IoU, `[..., 6] x [..., 6] -> [..., 1]`:
/// `iou - rho^2 / c^2 - alpha * v`, with `v` averaged over the three axis pairs.
pub fn box_ciou<B: Backend, const D: usize>(pred: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, D> {
    let a = corners(pred);
    let b = corners(target);
    let iou = overlap(&a, &b);

    let enclose_lo = a.min.clone().min_pair(b.min.clone());
    let enclose_hi = a.max.clone().max_pair(b.max.clone());
    let c2 = (enclose_hi - enclose_lo)
        .powf_scalar(2.0)
        .sum_dim(D - 1)
        .add_scalar(EPS);
    let rho2 = (a.center.clone() - b.center.clone())
        .powf_scalar(2.0)
        .sum_dim(D - 1);

    let pairs = [(0, 1), (1, 2), (0, 2)];
    let mut v: Option<Tensor<B, D>> = None;
    for (i, j) in pairs {
        let diff = aspect_angle(&b.size, i, j) - aspect_angle(&a.size, i, j);
        let term = diff.powf_scalar(2.0);
        v = Some(match v {
            Some(acc) => acc + term,
            None => term,
        });
    }
    let v = v
        .unwrap_or_else(|| iou.zeros_like())
        .mul_scalar(4.0 / (PI * PI) / pairs.len() as f32);
    let alpha = (v.clone() / (iou.clone().neg().add_scalar(1.0) + v.clone()).add_scalar(EPS)).detach();

    iou - rho2 / c2 - alpha * v
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn boxes(values: &[[f32; 6]]) -> Tensor<B, 2> {
        let flat: Vec<f32> = values.iter().flatten().copied().collect();
        Tensor::from_data(TensorData::new(flat, [values.len(), 6]), &Default::default())
    }

    fn scalars(t: Tensor<B, 2>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn identical_boxes_have_unit_iou_and_ciou() {
        let a = boxes(&[[4.0, 4.0, 4.0, 2.0, 3.0, 4.0]]);
        assert!((scalars(box_iou(a.clone(), a.clone()))[0] - 1.0).abs() < 1e-5);
        assert!((scalars(box_ciou(a.clone(), a))[0] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn half_overlap_iou() {
        let a = boxes(&[[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]]);
        let b = boxes(&[[2.0, 1.0, 1.0, 2.0, 2.0, 2.0]]);
        assert!((scalars(box_iou(a, b))[0] - 1.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn ciou_penalizes_distance_beyond_iou() {
        let a = boxes(&[[0.0, 0.0, 0.0, 2.0, 2.0, 2.0]]);
        let b = boxes(&[[10.0, 0.0, 0.0, 2.0, 2.0, 2.0]]);
        let iou = scalars(box_iou(a.clone(), b.clone()))[0];
        let ciou = scalars(box_ciou(a, b))[0];
        assert_eq!(iou, 0.0);
        assert!(ciou < -0.5 && ciou >= -1.0, "ciou {ciou}");
    }

    #[test]
    fn zero_sized_target_stays_finite() {
        let a = boxes(&[[3.0, 3.0, 3.0, 2.0, 2.0, 2.0]]);
        let zero = boxes(&[[0.0; 6]]);
        assert!(scalars(box_ciou(a, zero))[0].is_finite());
    }

    #[test]
    fn atan_approximation_is_close() {
        let xs = [0.0f32, 0.25, 1.0, 3.0, 40.0];
        let t = Tensor::<B, 1>::from_data(TensorData::new(xs.to_vec(), [xs.len()]), &Default::default());
        let approx = atan_nonneg(t).into_data().to_vec::<f32>().unwrap();
        for (x, y) in xs.iter().zip(approx) {
            assert!((x.atan() - y).abs() < 2e-3, "atan({x}) = {y}");
        }
    }
}
