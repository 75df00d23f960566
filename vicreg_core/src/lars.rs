use log::debug;
use rayon::prelude::*;

use crate::{CoreErr, ParamLayout, ParamSpec, Result};

/// Exemption predicate over a parameter descriptor. Returning true exempts
/// the tensor from the corresponding effect.
pub type ParamFilter = fn(&ParamSpec) -> bool;

/// The standard exemption: biases and normalization affine parameters are
/// 1-D and should receive neither weight decay nor trust-ratio scaling.
pub fn exclude_one_dim(spec: &ParamSpec) -> bool {
    spec.ndim() == 1
}

/// Layer-wise adaptive rate scaling.
///
/// Momentum buffers live in an index-keyed side table, allocated the first
/// time a tensor receives a gradient. The momentum update is a running
/// accumulation, `mu = momentum * mu + g`, with no `(1 - momentum)`
/// factor; changing that would silently invalidate the optimizer state in
/// existing checkpoints.
pub struct Lars {
    lr: f32,
    weight_decay: f32,
    momentum: f32,
    eta: f32,
    weight_decay_filter: Option<ParamFilter>,
    lars_adaptation_filter: Option<ParamFilter>,
    mu: Vec<Option<Vec<f32>>>,
}

impl Lars {
    pub const DEFAULT_MOMENTUM: f32 = 0.9;
    pub const DEFAULT_ETA: f32 = 0.001;

    /// Creates the optimizer for a model with `nparams` tensors.
    ///
    /// # Args
    /// * `lr` - Initial learning rate; the schedule overwrites it every step.
    /// * `weight_decay` - L2 coefficient folded into the gradient.
    /// * `weight_decay_filter` - Exempts tensors from decay.
    /// * `lars_adaptation_filter` - Exempts tensors from trust-ratio scaling.
    /// * `nparams` - Number of tensors in the parameter layout.
    pub fn new(
        lr: f32,
        weight_decay: f32,
        weight_decay_filter: Option<ParamFilter>,
        lars_adaptation_filter: Option<ParamFilter>,
        nparams: usize,
    ) -> Self {
        Self {
            lr,
            weight_decay,
            momentum: Self::DEFAULT_MOMENTUM,
            eta: Self::DEFAULT_ETA,
            weight_decay_filter,
            lars_adaptation_filter,
            mu: vec![None; nparams],
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    /// The schedule's write point.
    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    /// Applies one update to a single tensor.
    ///
    /// An absent gradient means the tensor did not participate in the loss
    /// graph this step: no update, no state mutation.
    ///
    /// # Errors
    /// Returns `CoreErr` when the gradient length or the tensor index does
    /// not match the optimizer's state.
    pub fn update(
        &mut self,
        index: usize,
        spec: &ParamSpec,
        param: &mut [f32],
        grad: Option<&[f32]>,
    ) -> Result<()> {
        let Some(grad) = grad else {
            return Ok(());
        };

        if grad.len() != param.len() {
            return Err(CoreErr::BufferLengthMismatch {
                what: "grad",
                got: grad.len(),
                expected: param.len(),
            });
        }
        if index >= self.mu.len() {
            return Err(CoreErr::BufferLengthMismatch {
                what: "momentum table",
                got: index,
                expected: self.mu.len(),
            });
        }

        let mut g = grad.to_vec();

        if !exempted(self.weight_decay_filter, spec) && self.weight_decay != 0.0 {
            let wd = self.weight_decay;
            g.par_iter_mut()
                .zip(param.par_iter())
                .for_each(|(g, p)| *g += wd * p);
        }

        if !exempted(self.lars_adaptation_filter, spec) {
            let param_norm = l2_norm(param);
            let update_norm = l2_norm(&g);
            let q = if param_norm > 0.0 && update_norm > 0.0 {
                self.eta * param_norm / update_norm
            } else {
                1.0
            };

            if q != 1.0 {
                g.par_iter_mut().for_each(|v| *v *= q);
            }
        }

        let momentum = self.momentum;
        let lr = self.lr;
        let mu = self.mu[index].get_or_insert_with(|| vec![0.0; param.len()]);

        mu.par_iter_mut()
            .zip(g.par_iter())
            .for_each(|(m, g)| *m = momentum * *m + g);

        param
            .par_iter_mut()
            .zip(mu.par_iter())
            .for_each(|(p, m)| *p -= lr * m);

        Ok(())
    }

    /// Applies one update to every tensor in the layout.
    ///
    /// # Errors
    /// Returns `CoreErr` when either buffer disagrees with the layout.
    pub fn step(
        &mut self,
        layout: &ParamLayout,
        params: &mut [f32],
        grads: &[f32],
    ) -> Result<()> {
        check_buffer("params", params.len(), layout.total_len())?;
        check_buffer("grads", grads.len(), layout.total_len())?;

        debug!(lr = self.lr; "optimizer step");

        for (index, spec) in layout.specs().iter().enumerate() {
            let range = spec.range();
            self.update(index, spec, &mut params[range.clone()], Some(&grads[range]))?;
        }

        Ok(())
    }

    /// The momentum side table, for checkpointing.
    pub fn momentum_table(&self) -> &[Option<Vec<f32>>] {
        &self.mu
    }

    /// Restores the momentum side table from a checkpoint.
    ///
    /// # Errors
    /// Returns `CoreErr` when the table does not match the layout.
    pub fn load_momentum(
        &mut self,
        layout: &ParamLayout,
        table: Vec<Option<Vec<f32>>>,
    ) -> Result<()> {
        check_buffer("momentum table", table.len(), layout.len())?;

        for (spec, entry) in layout.specs().iter().zip(&table) {
            if let Some(mu) = entry {
                check_buffer("momentum buffer", mu.len(), spec.len())?;
            }
        }

        self.mu = table;
        Ok(())
    }
}

fn exempted(filter: Option<ParamFilter>, spec: &ParamSpec) -> bool {
    filter.is_some_and(|f| f(spec))
}

// The summation order must be identical on every rank; the reduction
// stays sequential.
fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

fn check_buffer(what: &'static str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(CoreErr::BufferLengthMismatch {
            what,
            got,
            expected,
        });
    }

    Ok(())
}
