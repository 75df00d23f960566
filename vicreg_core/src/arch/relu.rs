use ndarray::prelude::*;

/// Rectifier. Keeps the pre-activations so the backward pass can mask the
/// upstream signal.
#[derive(Clone)]
pub struct Relu {
    z: Array2<f32>,
}

impl Relu {
    pub fn new() -> Self {
        Self {
            z: Array2::zeros((1, 1)),
        }
    }

    pub fn forward(&mut self, x: Array2<f32>) -> Array2<f32> {
        self.z = x;
        self.z.mapv(|v| v.max(0.0))
    }

    pub fn backward(&mut self, mut d: Array2<f32>) -> Array2<f32> {
        d.zip_mut_with(&self.z, |dv, &z| {
            if z <= 0.0 {
                *dv = 0.0;
            }
        });
        d
    }
}

impl Default for Relu {
    fn default() -> Self {
        Self::new()
    }
}
