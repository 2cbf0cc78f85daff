use std::f64::consts::PI;

/// Linear warmup followed by cosine decay, as a pure function of the global step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineDecayLr {
    pub lr_init: f64,
    pub lr_min: f64,
    pub warmup_steps: usize,
    pub t_max: usize,
}

impl CosineDecayLr {
    pub fn new(lr_init: f64, lr_min: f64, warmup_steps: usize, t_max: usize) -> Self {
        Self {
            lr_init,
            lr_min,
            warmup_steps: warmup_steps.min(t_max),
            t_max,
        }
    }

    /// Schedule spanning `epochs` epochs of `num_batches` steps each.
    pub fn for_run(
        lr_init: f64,
        lr_min: f64,
        warmup_epochs: usize,
        epochs: usize,
        num_batches: usize,
    ) -> Self {
        Self::new(
            lr_init,
            lr_min,
            warmup_epochs * num_batches,
            epochs * num_batches,
        )
    }

    pub fn rate(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.lr_init * step as f64 / self.warmup_steps as f64;
        }
        if step >= self.t_max {
            return self.lr_min;
        }
        let progress = (step - self.warmup_steps) as f64 / (self.t_max - self.warmup_steps) as f64;
        self.lr_min + 0.5 * (self.lr_init - self.lr_min) * (1.0 + (PI * progress).cos())
    }
}
