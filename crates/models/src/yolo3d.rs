use crate::blocks::{upsample2x, ConvBlock, Stage};
use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};

/// Output strides of the small/medium/large heads.
pub const STRIDES: [usize; 3] = [8, 16, 32];
pub const ANCHORS_PER_SCALE: usize = 3;
/// Box (6) + objectness (1) channels preceding the class logits.
pub const BOX_CHANNELS: usize = 7;

/// Anchor extents `(d, h, w)` per scale, in units of that scale's stride.
pub type Anchors = [[[f32; 3]; ANCHORS_PER_SCALE]; 3];

pub const DEFAULT_ANCHORS: Anchors = [
    [[1.25, 1.5, 1.5], [2.0, 2.5, 2.5], [3.0, 4.0, 4.0]],
    [[1.5, 2.0, 2.0], [2.5, 3.0, 3.0], [3.5, 4.5, 4.5]],
    [[1.5, 1.75, 1.75], [2.0, 2.5, 2.5], [3.0, 3.5, 3.5]],
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Yolo3dConfig {
    pub in_channels: usize,
    /// Width of the stem; stage widths double from here.
    pub base_channels: usize,
    pub num_classes: usize,
    pub anchors: Anchors,
}

impl Default for Yolo3dConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            base_channels: 8,
            num_classes: 1,
            anchors: DEFAULT_ANCHORS,
        }
    }
}

impl Yolo3dConfig {
    /// Channels per anchor in the raw/decoded head tensors.
    pub fn features_per_anchor(&self) -> usize {
        BOX_CHANNELS + self.num_classes
    }
}

/// One detection scale: raw logits and decoded boxes, both `[B, D, H, W, A, 7 + C]`.
///
/// Decoded layout: `[cz, cy, cx, d, h, w]` in input voxels, then sigmoid objectness and
/// sigmoid class probabilities.
#[derive(Debug, Clone)]
pub struct ScaleOutput<B: Backend> {
    pub raw: Tensor<B, 6>,
    pub decoded: Tensor<B, 6>,
    pub stride: usize,
}

#[derive(Debug, Module)]
pub struct Yolo3d<B: Backend> {
    stem: ConvBlock<B>,
    stages: Vec<Stage<B>>,
    neck_l: ConvBlock<B>,
    reduce_l: ConvBlock<B>,
    neck_m: ConvBlock<B>,
    reduce_m: ConvBlock<B>,
    neck_s: ConvBlock<B>,
    detect_s: Conv3d<B>,
    detect_m: Conv3d<B>,
    detect_l: Conv3d<B>,
    num_classes: usize,
    anchors: Ignored<Anchors>,
}

impl<B: Backend> Yolo3d<B> {
    pub fn new(cfg: &Yolo3dConfig, device: &B::Device) -> Self {
        let c = cfg.base_channels.max(1);
        let widths = [c * 2, c * 4, c * 8, c * 16, c * 32];
        let mut stages = Vec::with_capacity(widths.len());
        let mut in_ch = c;
        for &out in &widths {
            stages.push(Stage::new(in_ch, out, device));
            in_ch = out;
        }
        let out_ch = ANCHORS_PER_SCALE * cfg.features_per_anchor();
        let detect = |channels: usize| -> Conv3d<B> {
            Conv3dConfig::new([channels, out_ch], [1, 1, 1]).init(device)
        };
        Self {
            stem: ConvBlock::new(cfg.in_channels, c, 3, 1, device),
            stages,
            neck_l: ConvBlock::new(c * 32, c * 16, 1, 1, device),
            reduce_l: ConvBlock::new(c * 16, c * 8, 1, 1, device),
            neck_m: ConvBlock::new(c * 8 + c * 16, c * 8, 3, 1, device),
            reduce_m: ConvBlock::new(c * 8, c * 4, 1, 1, device),
            neck_s: ConvBlock::new(c * 4 + c * 8, c * 4, 3, 1, device),
            detect_s: detect(c * 4),
            detect_m: detect(c * 8),
            detect_l: detect(c * 16),
            num_classes: cfg.num_classes,
            anchors: Ignored(cfg.anchors),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Forward a `[B, 1, D, H, W]` volume (each spatial dim a multiple of 32).
    /// Returns the small, medium and large scales in that order.
    pub fn forward(&self, input: Tensor<B, 5>) -> [ScaleOutput<B>; 3] {
        let mut x = self.stem.forward(input);
        let mut taps = Vec::with_capacity(3);
        for (idx, stage) in self.stages.iter().enumerate() {
            x = stage.forward(x);
            if idx >= 2 {
                taps.push(x.clone());
            }
        }
        let large = taps.pop().unwrap_or_else(|| x.clone());
        let medium = taps.pop().unwrap_or_else(|| x.clone());
        let small = taps.pop().unwrap_or(x);

        let feat_l = self.neck_l.forward(large);
        let up_l = upsample2x(self.reduce_l.forward(feat_l.clone()));
        let feat_m = self.neck_m.forward(Tensor::cat(vec![up_l, medium], 1));
        let up_m = upsample2x(self.reduce_m.forward(feat_m.clone()));
        let feat_s = self.neck_s.forward(Tensor::cat(vec![up_m, small], 1));

        [
            self.decode(self.detect_s.forward(feat_s), 0),
            self.decode(self.detect_m.forward(feat_m), 1),
            self.decode(self.detect_l.forward(feat_l), 2),
        ]
    }

    fn decode(&self, conv: Tensor<B, 5>, scale: usize) -> ScaleOutput<B> {
        let stride = STRIDES[scale];
        let [b, _, d, h, w] = conv.dims();
        let a = ANCHORS_PER_SCALE;
        let f = BOX_CHANNELS + self.num_classes;
        let device = conv.device();

        let raw = conv.reshape([b, a, f, d, h, w]).permute([0, 3, 4, 5, 1, 2]);
        let t_center = raw.clone().narrow(5, 0, 3);
        let t_size = raw.clone().narrow(5, 3, 3);
        let t_conf = raw.clone().narrow(5, 6, 1);
        let t_cls = raw.clone().narrow(5, 7, self.num_classes);

        let (grid, anchors) = grid_and_anchors::<B>([b, d, h, w], &self.anchors.0[scale], &device);
        let centers = (sigmoid(t_center) + grid).mul_scalar(stride as f32);
        // exp() is bounded so untrained heads cannot overflow.
        let sizes = (t_size.clamp(-10.0, 10.0).exp() * anchors).mul_scalar(stride as f32);
        let decoded = Tensor::cat(vec![centers, sizes, sigmoid(t_conf), sigmoid(t_cls)], 5);

        ScaleOutput {
            raw,
            decoded,
            stride,
        }
    }
}

/// Cell offsets `(z, y, x)` and anchor extents, both `[B, D, H, W, A, 3]`.
fn grid_and_anchors<B: Backend>(
    [b, d, h, w]: [usize; 4],
    anchors: &[[f32; 3]; ANCHORS_PER_SCALE],
    device: &B::Device,
) -> (Tensor<B, 6>, Tensor<B, 6>) {
    let a = ANCHORS_PER_SCALE;
    let cells = d * h * w;
    let mut grid = Vec::with_capacity(cells * a * 3);
    let mut anc = Vec::with_capacity(cells * a * 3);
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                for anchor in anchors.iter() {
                    grid.extend_from_slice(&[z as f32, y as f32, x as f32]);
                    anc.extend_from_slice(anchor);
                }
            }
        }
    }
    let grid = Tensor::<B, 6>::from_data(TensorData::new(grid, [1, d, h, w, a, 3]), device)
        .repeat_dim(0, b);
    let anc = Tensor::<B, 6>::from_data(TensorData::new(anc, [1, d, h, w, a, 3]), device)
        .repeat_dim(0, b);
    (grid, anc)
}
