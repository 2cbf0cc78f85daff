//! Gradient accumulation across micro-batches.
//!
//! The optimizer steps on batch `i` when `i % every == 0`, using every
//! gradient collected since the previous step. Gradients still pending when
//! the epoch ends are dropped with the accumulator.

use burn::module::AutodiffModule;
use burn::optim::{GradientsAccumulator, GradientsParams};
use burn::tensor::backend::AutodiffBackend;

pub struct StepAccumulator<M> {
    every: usize,
    grads: GradientsAccumulator<M>,
    pending: usize,
    steps: usize,
}

impl<M> StepAccumulator<M> {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            grads: GradientsAccumulator::new(),
            pending: 0,
            steps: 0,
        }
    }

    pub fn steps_at(&self, i: usize) -> bool {
        i % self.every == 0
    }

    /// Micro-batches accumulated since the last step.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Optimizer steps handed out so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Add batch `i`'s gradients (`None` for a skipped batch) and return the
    /// summed gradients when the optimizer should step on this batch.
    pub fn push<B>(
        &mut self,
        i: usize,
        module: &M,
        grads: Option<GradientsParams>,
    ) -> Option<GradientsParams>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        if let Some(grads) = grads {
            self.grads.accumulate(module, grads);
            self.pending += 1;
        }
        if !self.steps_at(i) {
            return None;
        }
        self.pending = 0;
        self.steps += 1;
        Some(self.grads.grads())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::nn::{Linear, LinearConfig};
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;

    type B = Autodiff<NdArray<f32>>;
    type Inner = NdArray<f32>;

    fn grads_for(model: &Linear<B>, scale: f32) -> GradientsParams {
        let device = Default::default();
        let x = Tensor::<B, 2>::ones([1, 3], &device).mul_scalar(scale);
        let loss = model.forward(x).sum();
        GradientsParams::from_grads(loss.backward(), model)
    }

    fn weight_grad(model: &Linear<B>, grads: &GradientsParams) -> Vec<f32> {
        grads
            .get::<Inner, 2>(model.weight.id)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn steps_on_multiples_and_sums_batches_between_steps() {
        let device = Default::default();
        let model = LinearConfig::new(3, 2).init::<B>(&device);
        let mut acc = StepAccumulator::new(2);

        let first = acc.push::<B>(0, &model, Some(grads_for(&model, 1.0))).unwrap();
        assert_eq!(weight_grad(&model, &first), vec![1.0; 6]);

        assert!(acc.push::<B>(1, &model, Some(grads_for(&model, 2.0))).is_none());
        assert_eq!(acc.pending(), 1);

        // batch 1 (x=2) and batch 2 (x=3) go into one step
        let second = acc.push::<B>(2, &model, Some(grads_for(&model, 3.0))).unwrap();
        assert_eq!(weight_grad(&model, &second), vec![5.0; 6]);
        assert_eq!(acc.pending(), 0);
        assert_eq!(acc.steps(), 2);
    }

    #[test]
    fn trailing_batches_stay_pending() {
        let device = Default::default();
        let model = LinearConfig::new(3, 2).init::<B>(&device);
        let mut acc = StepAccumulator::new(2);
        for i in 0..4 {
            let out = acc.push::<B>(i, &model, Some(grads_for(&model, 1.0)));
            assert_eq!(out.is_some(), i % 2 == 0);
        }
        assert_eq!(acc.steps(), 2);
        assert_eq!(acc.pending(), 1);
    }

    #[test]
    fn overflowed_batch_is_not_accumulated() {
        let device = Default::default();
        let model = LinearConfig::new(3, 2).init::<B>(&device);
        let mut acc = StepAccumulator::new(2);
        acc.push::<B>(0, &model, Some(grads_for(&model, 1.0)));
        assert!(acc.push::<B>(1, &model, None).is_none());
        assert_eq!(acc.pending(), 0);
        let grads = acc.push::<B>(2, &model, Some(grads_for(&model, 4.0))).unwrap();
        assert_eq!(weight_grad(&model, &grads), vec![4.0; 6]);
    }
}
