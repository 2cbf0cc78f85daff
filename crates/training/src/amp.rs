//! Dynamic loss scaling for `fp16` runs: the loss is multiplied before the
//! backward pass, gradients are unscaled afterwards, and a micro-batch whose
//! gradients overflow is dropped while the scale backs off.

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};

#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: u32,
    growth_tracker: u32,
    min_scale: f32,
    max_scale: f32,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self::new(65536.0, 2.0, 0.5, 2000)
    }
}

impl LossScaler {
    /// Out-of-range factors fall back to the defaults (2.0 growth, 0.5 backoff).
    pub fn new(scale: f32, growth_factor: f32, backoff_factor: f32, growth_interval: u32) -> Self {
        let valid_scale = scale.is_finite() && scale > 0.0;
        Self {
            scale: if valid_scale { scale } else { 1.0 },
            growth_factor: if growth_factor.is_finite() && growth_factor > 1.0 {
                growth_factor
            } else {
                2.0
            },
            backoff_factor: if backoff_factor > 0.0 && backoff_factor < 1.0 {
                backoff_factor
            } else {
                0.5
            },
            growth_interval: growth_interval.max(1),
            growth_tracker: 0,
            min_scale: 1.0,
            max_scale: 16_777_216.0,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn scale_loss<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        loss.mul_scalar(self.scale)
    }

    /// Divides every gradient of `module` by the current scale. The flag is
    /// `false` when any gradient holds a NaN or infinity.
    pub fn unscale<B, M>(&self, module: &M, grads: GradientsParams) -> (GradientsParams, bool)
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let mut visitor = Unscale::<B> {
            grads,
            inverse: 1.0 / self.scale,
            finite: true,
            _backend: std::marker::PhantomData,
        };
        module.visit(&mut visitor);
        (visitor.grads, visitor.finite)
    }

    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.scale = (self.scale * self.backoff_factor).clamp(self.min_scale, self.max_scale);
            self.growth_tracker = 0;
        } else {
            self.growth_tracker = self.growth_tracker.saturating_add(1);
            if self.growth_tracker >= self.growth_interval {
                self.scale = (self.scale * self.growth_factor).clamp(self.min_scale, self.max_scale);
                self.growth_tracker = 0;
            }
        }
    }
}

struct Unscale<B: AutodiffBackend> {
    grads: GradientsParams,
    inverse: f32,
    finite: bool,
    _backend: std::marker::PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Unscale<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let grad = grad.mul_scalar(self.inverse);
        let total: f32 = grad.clone().sum().into_scalar().elem();
        if !total.is_finite() {
            self.finite = false;
        }
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}
