use ndarray::Array2;
use rand::Rng;

use super::Layer;
use crate::{CoreErr, ParamSpec, Result};

/// A layer chain over one flat parameter buffer: information flows forward
/// when computing an output and backward when accumulating gradients.
///
/// Cloning duplicates only the forward caches; parameters stay external,
/// which is what lets two view towers share a single weight set.
#[derive(Clone)]
pub struct Sequential {
    layers: Vec<Layer>,
    size: usize,
}

impl Sequential {
    pub fn new<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = Layer>,
    {
        let layers: Vec<Layer> = layers.into_iter().collect();
        let size = layers.iter().map(|layer| layer.size()).sum();

        Self { layers, size }
    }

    /// Returns the amount of parameters in the chain.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Enumerates every parameter tensor in buffer order.
    pub fn specs(&self, prefix: &str) -> Vec<ParamSpec> {
        let mut specs = Vec::new();
        let mut offset = 0;

        for (i, layer) in self.layers.iter().enumerate() {
            specs.extend(layer.specs(&format!("{prefix}.{i}"), offset));
            offset += layer.size();
        }

        specs
    }

    /// Writes fresh initial values for every layer into `params`.
    ///
    /// # Errors
    /// Returns `CoreErr` when the buffer length does not match the chain.
    pub fn init_params<R: Rng>(&self, params: &mut [f32], rng: &mut R) -> Result<()> {
        self.check_len("params", params.len())?;

        let mut rest = params;
        for layer in &self.layers {
            let (chunk, tail) = rest.split_at_mut(layer.size());
            layer.init(chunk, rng);
            rest = tail;
        }

        Ok(())
    }

    /// Makes a forward pass through the chain.
    ///
    /// # Errors
    /// Returns `CoreErr` when the buffer length does not match the chain.
    pub fn forward(&mut self, params: &[f32], mut x: Array2<f32>) -> Result<Array2<f32>> {
        self.check_len("params", params.len())?;

        let mut rest = params;
        for layer in &mut self.layers {
            let (chunk, tail) = rest.split_at(layer.size());
            x = layer.forward(chunk, x);
            rest = tail;
        }

        Ok(x)
    }

    /// Walks the chain backwards, accumulating each layer's contribution
    /// into its slice of `grad` and returning the input gradient.
    ///
    /// # Errors
    /// Returns `CoreErr` when either buffer length does not match the chain.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        mut d: Array2<f32>,
    ) -> Result<Array2<f32>> {
        self.check_len("params", params.len())?;
        self.check_len("grad", grad.len())?;

        let mut offset = self.size;
        for layer in self.layers.iter_mut().rev() {
            offset -= layer.size();
            let end = offset + layer.size();
            d = layer.backward(&params[offset..end], &mut grad[offset..end], d);
        }

        Ok(d)
    }

    fn check_len(&self, what: &'static str, got: usize) -> Result<()> {
        if got != self.size {
            return Err(CoreErr::BufferLengthMismatch {
                what,
                got,
                expected: self.size,
            });
        }

        Ok(())
    }
}
