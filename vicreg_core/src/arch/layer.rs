use ndarray::Array2;
use rand::Rng;

use super::{BatchNorm, Dense, Relu};
use crate::ParamSpec;

#[derive(Clone)]
pub enum Layer {
    Dense(Dense),
    BatchNorm(BatchNorm),
    Relu(Relu),
}
use Layer::*;

impl Layer {
    pub fn dense(dim: (usize, usize), bias: bool) -> Self {
        Self::Dense(Dense::new(dim, bias))
    }

    pub fn batch_norm(width: usize) -> Self {
        Self::BatchNorm(BatchNorm::new(width))
    }

    pub fn relu() -> Self {
        Self::Relu(Relu::new())
    }

    pub fn size(&self) -> usize {
        match self {
            Dense(l) => l.size(),
            BatchNorm(l) => l.size(),
            Relu(_) => 0,
        }
    }

    pub fn specs(&self, prefix: &str, offset: usize) -> Vec<ParamSpec> {
        match self {
            Dense(l) => l.specs(prefix, offset),
            BatchNorm(l) => l.specs(prefix, offset),
            Relu(_) => Vec::new(),
        }
    }

    pub fn init<R: Rng>(&self, params: &mut [f32], rng: &mut R) {
        match self {
            Dense(l) => l.init(params, rng),
            BatchNorm(l) => l.init(params),
            Relu(_) => {}
        }
    }

    pub fn forward(&mut self, params: &[f32], x: Array2<f32>) -> Array2<f32> {
        match self {
            Dense(l) => l.forward(params, x),
            BatchNorm(l) => l.forward(params, x),
            Relu(l) => l.forward(x),
        }
    }

    pub fn backward(&mut self, params: &[f32], grad: &mut [f32], d: Array2<f32>) -> Array2<f32> {
        match self {
            Dense(l) => l.backward(params, grad, d),
            BatchNorm(l) => l.backward(params, grad, d),
            Relu(l) => l.backward(d),
        }
    }
}
