use burn::module::Module;
use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig3d};
use burn::tensor::activation::leaky_relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

const LEAKY_SLOPE: f64 = 0.1;

/// Conv3d + BatchNorm + LeakyReLU with "same" padding.
#[derive(Debug, Module)]
pub struct ConvBlock<B: Backend> {
    conv: Conv3d<B>,
    norm: BatchNorm<B, 3>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let pad = kernel / 2;
        let conv = Conv3dConfig::new([in_channels, out_channels], [kernel; 3])
            .with_stride([stride; 3])
            .with_padding(PaddingConfig3d::Explicit(pad, pad, pad))
            .with_bias(false)
            .init(device);
        let norm = BatchNormConfig::new(out_channels).init(device);
        Self { conv, norm }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.conv.forward(input);
        let x = self.norm.forward(x);
        leaky_relu(x, LEAKY_SLOPE)
    }
}

/// Bottleneck residual: 1x1 reduce, 3x3 expand, identity shortcut.
#[derive(Debug, Module)]
pub struct Residual<B: Backend> {
    reduce: ConvBlock<B>,
    expand: ConvBlock<B>,
}

impl<B: Backend> Residual<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let hidden = (channels / 2).max(1);
        Self {
            reduce: ConvBlock::new(channels, hidden, 1, 1, device),
            expand: ConvBlock::new(hidden, channels, 3, 1, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.reduce.forward(input.clone());
        input + self.expand.forward(x)
    }
}

/// Stride-2 downsampling followed by a residual block.
#[derive(Debug, Module)]
pub struct Stage<B: Backend> {
    down: ConvBlock<B>,
    res: Residual<B>,
}

impl<B: Backend> Stage<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            down: ConvBlock::new(in_channels, out_channels, 3, 2, device),
            res: Residual::new(out_channels, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        self.res.forward(self.down.forward(input))
    }
}

/// Nearest-neighbour 2x upsampling of a `[B, C, D, H, W]` volume.
pub fn upsample2x<B: Backend>(input: Tensor<B, 5>) -> Tensor<B, 5> {
    let [b, c, d, h, w] = input.dims();
    input
        .reshape([b, c, d, 1, h, 1, w, 1])
        .repeat_dim(3, 2)
        .repeat_dim(5, 2)
        .repeat_dim(7, 2)
        .reshape([b, c, d * 2, h * 2, w * 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn upsample_repeats_each_voxel() {
        let device = Default::default();
        let x = Tensor::<B, 5>::from_data(
            TensorData::new(vec![1.0f32, 2.0], [1, 1, 1, 1, 2]),
            &device,
        );
        let y = upsample2x(x);
        assert_eq!(y.dims(), [1, 1, 2, 2, 4]);
        let v = y.into_data().to_vec::<f32>().unwrap();
        assert_eq!(&v[0..4], &[1.0, 1.0, 2.0, 2.0]);
        assert_eq!(&v[12..16], &[1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn stage_halves_spatial_dims() {
        let device = Default::default();
        let stage = Stage::<B>::new(2, 4, &device);
        let x = Tensor::<B, 5>::zeros([1, 2, 8, 8, 8], &device);
        assert_eq!(stage.forward(x).dims(), [1, 4, 4, 4, 4]);
    }
}
