use std::f32::consts::PI;

use crate::Lars;

const WARMUP_EPOCHS: usize = 10;
const END_LR_FRACTION: f32 = 0.001;

/// Linear warmup to the batch-scaled peak, then cosine decay to 0.1% of it.
///
/// `lr_at` is a pure function of the step; `apply` is the single side
/// effect, writing the value into the optimizer's learning-rate field.
#[derive(Debug, Clone, Copy)]
pub struct LrSchedule {
    base_lr: f32,
    batch_size: usize,
    steps_per_epoch: usize,
    epochs: usize,
}

impl LrSchedule {
    pub fn new(base_lr: f32, batch_size: usize, steps_per_epoch: usize, epochs: usize) -> Self {
        Self {
            base_lr,
            batch_size,
            steps_per_epoch,
            epochs,
        }
    }

    /// Peak rate reached at the end of warmup: `base_lr * batch_size / 256`.
    pub fn peak_lr(&self) -> f32 {
        self.base_lr * self.batch_size as f32 / 256.0
    }

    pub fn total_steps(&self) -> usize {
        self.epochs * self.steps_per_epoch
    }

    pub fn warmup_steps(&self) -> usize {
        WARMUP_EPOCHS * self.steps_per_epoch
    }

    /// Calculates the learning rate for a given global step.
    pub fn lr_at(&self, step: usize) -> f32 {
        let warmup = self.warmup_steps();
        let peak = self.peak_lr();

        if step < warmup {
            return peak * step as f32 / warmup as f32;
        }

        let end = peak * END_LR_FRACTION;
        let decay_steps = self.total_steps().saturating_sub(warmup);
        if decay_steps == 0 {
            return end;
        }

        let t = (step - warmup).min(decay_steps) as f32;
        let q = 0.5 * (1.0 + (PI * t / decay_steps as f32).cos());
        peak * q + end * (1.0 - q)
    }

    /// Applies the schedule for `step` to the optimizer and returns the
    /// value written.
    pub fn apply(&self, step: usize, optimizer: &mut Lars) -> f32 {
        let lr = self.lr_at(step);
        optimizer.set_lr(lr);
        lr
    }
}
