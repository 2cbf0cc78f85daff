//! Ground-truth assignment: turns lesion boxes into per-scale label grids and
//! raw box lists laid out the way the loss reads them.

use models::{Anchors, ANCHORS_PER_SCALE, STRIDES};
use tracing::warn;
use volume_contracts::{BoxZyx, LesionAnnotation};

/// Anchors whose center-aligned IoU with a box exceeds this are all positives.
const ANCHOR_IOU_POSITIVE: f32 = 0.3;

/// Label channels before the class targets: box (6), objectness, mix.
pub const LABEL_PREFIX: usize = 8;

#[derive(Debug, Clone)]
pub struct TargetAssigner {
    pub anchors: Anchors,
    pub num_classes: usize,
    pub max_boxes: usize,
    pub label_smoothing: f32,
}

/// Targets for one sample. `labels[s]` is `[gd, gh, gw, A, 8 + C]` flattened,
/// `bboxes[s]` is `[max_boxes, 6]` flattened.
#[derive(Debug, Clone)]
pub struct SampleTargets {
    pub grids: [[usize; 3]; 3],
    pub labels: [Vec<f32>; 3],
    pub bboxes: [Vec<f32>; 3],
}

impl TargetAssigner {
    pub fn label_channels(&self) -> usize {
        LABEL_PREFIX + self.num_classes
    }

    pub fn grid_for(input_size: [usize; 3], scale: usize) -> [usize; 3] {
        let s = STRIDES[scale];
        [input_size[0] / s, input_size[1] / s, input_size[2] / s]
    }

    pub fn assign(&self, input_size: [usize; 3], lesions: &[LesionAnnotation]) -> SampleTargets {
        let f = self.label_channels();
        let grids = [0, 1, 2].map(|s| Self::grid_for(input_size, s));
        let mut labels = grids.map(|g| vec![0.0f32; g[0] * g[1] * g[2] * ANCHORS_PER_SCALE * f]);
        let mut bboxes = [0, 1, 2].map(|_| vec![0.0f32; self.max_boxes * 6]);
        let mut counts = [0usize; 3];

        for lesion in lesions {
            if lesion.class_id >= self.num_classes {
                warn!(class_id = lesion.class_id, num_classes = self.num_classes, "skipping box with unknown class");
                continue;
            }
            if !lesion.bbox.is_valid() {
                warn!(?lesion.bbox, "skipping degenerate box");
                continue;
            }
            let class_target = self.smoothed_one_hot(lesion.class_id);
            let mut ious = [[0.0f32; ANCHORS_PER_SCALE]; 3];
            let mut positive = false;

            for scale in 0..3 {
                let mask: Vec<usize> = (0..ANCHORS_PER_SCALE)
                    .filter(|&a| {
                        let iou = self.anchor_iou(&lesion.bbox, scale, a);
                        ious[scale][a] = iou;
                        iou > ANCHOR_IOU_POSITIVE
                    })
                    .collect();
                if mask.is_empty() {
                    continue;
                }
                for a in mask {
                    self.write_label(&mut labels[scale], grids[scale], scale, a, &lesion.bbox, &class_target);
                }
                self.push_box(&mut bboxes[scale], &mut counts[scale], &lesion.bbox);
                positive = true;
            }

            if !positive {
                let (scale, a) = best_anchor(&ious);
                self.write_label(&mut labels[scale], grids[scale], scale, a, &lesion.bbox, &class_target);
                self.push_box(&mut bboxes[scale], &mut counts[scale], &lesion.bbox);
            }
        }

        SampleTargets {
            grids,
            labels,
            bboxes,
        }
    }

    fn smoothed_one_hot(&self, class_id: usize) -> Vec<f32> {
        let delta = self.label_smoothing;
        let uniform = delta / self.num_classes as f32;
        (0..self.num_classes)
            .map(|c| if c == class_id { 1.0 - delta + uniform } else { uniform })
            .collect()
    }

    /// IoU between the box and anchor `a`, both in stride units and centered on the box's cell.
    fn anchor_iou(&self, bbox: &BoxZyx, scale: usize, a: usize) -> f32 {
        let inv = 1.0 / STRIDES[scale] as f32;
        let scaled = bbox.scaled([inv; 3]);
        let anchor = BoxZyx::new(
            scaled.center.map(|c| c.floor() + 0.5),
            self.anchors[scale][a],
        );
        let centered = BoxZyx::new(anchor.center, scaled.size);
        centered.iou(&anchor)
    }

    fn write_label(
        &self,
        labels: &mut [f32],
        grid: [usize; 3],
        scale: usize,
        anchor: usize,
        bbox: &BoxZyx,
        class_target: &[f32],
    ) {
        let stride = STRIDES[scale] as f32;
        let mut cell = [0usize; 3];
        for axis in 0..3 {
            let idx = (bbox.center[axis] / stride).floor().max(0.0) as usize;
            cell[axis] = idx.min(grid[axis].saturating_sub(1));
        }
        let f = self.label_channels();
        let base = ((((cell[0] * grid[1]) + cell[1]) * grid[2] + cell[2]) * ANCHORS_PER_SCALE + anchor) * f;
        let slot = &mut labels[base..base + f];
        slot[0..3].copy_from_slice(&bbox.center);
        slot[3..6].copy_from_slice(&bbox.size);
        slot[6] = 1.0;
        slot[7] = 1.0;
        slot[LABEL_PREFIX..].copy_from_slice(class_target);
    }

    fn push_box(&self, bboxes: &mut [f32], count: &mut usize, bbox: &BoxZyx) {
        let idx = *count % self.max_boxes;
        bboxes[idx * 6..idx * 6 + 3].copy_from_slice(&bbox.center);
        bboxes[idx * 6 + 3..idx * 6 + 6].copy_from_slice(&bbox.size);
        *count += 1;
    }
}

fn best_anchor(ious: &[[f32; ANCHORS_PER_SCALE]; 3]) -> (usize, usize) {
    let mut best = (0, 0);
    let mut best_iou = f32::MIN;
    for (scale, row) in ious.iter().enumerate() {
        for (a, &iou) in row.iter().enumerate() {
            if iou > best_iou {
                best_iou = iou;
                best = (scale, a);
            }
        }
    }
    best
}
