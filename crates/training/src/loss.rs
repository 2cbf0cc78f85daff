//! Multi-scale YOLO detection loss over 3D anchors: CIoU box regression, focal
//! objectness and BCE classification.

use crate::config::LossWeights;
use crate::iou::{box_ciou, box_iou};
use crate::targets::LABEL_PREFIX;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use models::ScaleOutput;
use tracing::warn;

const FOCAL_GAMMA: f32 = 2.0;
const FOCAL_ALPHA: f32 = 1.0;

#[derive(Debug, Clone)]
pub struct YoloLoss3d {
    pub iou_threshold: f32,
    pub weights: LossWeights,
}

/// Loss scalars, each shaped `[1]`. `total` is the weighted sum of the other three.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    pub total: Tensor<B, 1>,
    pub ciou: Tensor<B, 1>,
    pub conf: Tensor<B, 1>,
    pub cls: Tensor<B, 1>,
}

impl<B: Backend> LossOutput<B> {
    /// `[ciou, conf, cls, total]` as host floats, detached from the graph.
    pub fn items(&self) -> [f32; 4] {
        [
            scalar_value(self.ciou.clone()),
            scalar_value(self.conf.clone()),
            scalar_value(self.cls.clone()),
            scalar_value(self.total.clone()),
        ]
    }
}

pub fn scalar_value<B: Backend>(t: Tensor<B, 1>) -> f32 {
    match t.detach().into_data().convert::<f32>().to_vec::<f32>() {
        Ok(values) => values.first().copied().unwrap_or(0.0),
        Err(err) => {
            warn!(?err, "loss tensor unreadable; reporting 0");
            0.0
        }
    }
}

/// Numerically stable `BCEWithLogits(x, t)`, elementwise.
pub fn bce_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    target: Tensor<B, D>,
) -> Tensor<B, D> {
    logits.clone().clamp_min(0.0) - logits.clone() * target
        + logits.abs().neg().exp().log1p()
}

/// Focal loss on logits: `alpha * |t - sigmoid(x)|^gamma * bce(x, t)`.
pub fn focal_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    target: Tensor<B, D>,
) -> Tensor<B, D> {
    let modulating = (target.clone() - sigmoid(logits.clone()))
        .abs()
        .powf_scalar(FOCAL_GAMMA);
    bce_with_logits(logits, target)
        .mul(modulating)
        .mul_scalar(FOCAL_ALPHA)
}

impl YoloLoss3d {
    pub fn new(iou_threshold: f32, weights: LossWeights) -> Self {
        Self {
            iou_threshold,
            weights,
        }
    }

    pub fn forward<B: Backend>(
        &self,
        outputs: &[ScaleOutput<B>; 3],
        labels: &[Tensor<B, 6>; 3],
        bboxes: &[Tensor<B, 3>; 3],
    ) -> LossOutput<B> {
        let (mut ciou, mut conf, mut cls) =
            self.per_scale(&outputs[0], labels[0].clone(), bboxes[0].clone());
        for scale in 1..outputs.len() {
            let (c, o, k) = self.per_scale(&outputs[scale], labels[scale].clone(), bboxes[scale].clone());
            ciou = ciou + c;
            conf = conf + o;
            cls = cls + k;
        }
        let total = ciou.clone().mul_scalar(self.weights.ciou)
            + conf.clone().mul_scalar(self.weights.conf)
            + cls.clone().mul_scalar(self.weights.cls);
        LossOutput {
            total,
            ciou,
            conf,
            cls,
        }
    }

    fn per_scale<B: Backend>(
        &self,
        out: &ScaleOutput<B>,
        label: Tensor<B, 6>,
        bboxes: Tensor<B, 3>,
    ) -> (Tensor<B, 1>, Tensor<B, 1>, Tensor<B, 1>) {
        let [b, d, h, w, a, f] = out.raw.dims();
        let num_classes = f - 7;
        let stride = out.stride as f32;

        let p_conf = out.raw.clone().narrow(5, 6, 1);
        let p_cls = out.raw.clone().narrow(5, 7, num_classes);
        let p_box = out.decoded.clone().narrow(5, 0, 6);

        let l_box = label.clone().narrow(5, 0, 6);
        let obj = label.clone().narrow(5, 6, 1);
        let mix = label.clone().narrow(5, 7, 1);
        let l_cls = label.narrow(5, LABEL_PREFIX, num_classes);

        // Localization: large boxes weigh less than small ones.
        let ciou = box_ciou(p_box.clone(), l_box.clone());
        let input_volume = (d as f32 * stride) * (h as f32 * stride) * (w as f32 * stride);
        let box_volume = l_box.clone().narrow(5, 3, 1)
            * l_box.clone().narrow(5, 4, 1)
            * l_box.narrow(5, 5, 1);
        let box_scale = box_volume.div_scalar(input_volume).neg().add_scalar(2.0);
        let loss_ciou = obj.clone() * box_scale * ciou.neg().add_scalar(1.0) * mix.clone();

        // Background anchors already overlapping a ground-truth box are not penalized.
        let m = d * h * w * a;
        let n = bboxes.dims()[1];
        let pred = p_box.detach().reshape([b, m, 1, 6]).repeat_dim(2, n);
        let gt = bboxes.reshape([b, 1, n, 6]).repeat_dim(1, m);
        let iou_max = box_iou(pred, gt).max_dim(2).reshape([b, d, h, w, a, 1]);
        let below = iou_max.lower_elem(self.iou_threshold).float();
        let noobj = obj.clone().neg().add_scalar(1.0) * below;

        let focal = focal_with_logits(p_conf, obj.clone());
        let loss_conf = (obj.clone() * focal.clone() + noobj * focal) * mix.clone();

        let cls_mask = (obj * mix).repeat_dim(5, num_classes);
        let loss_cls = cls_mask * bce_with_logits(p_cls, l_cls);

        let batch = b as f32;
        (
            loss_ciou.sum().div_scalar(batch),
            loss_conf.sum().div_scalar(batch),
            loss_cls.sum().div_scalar(batch),
        )
    }
}
