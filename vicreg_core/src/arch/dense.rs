use ndarray::{linalg, prelude::*};
use rand::Rng;

use crate::ParamSpec;

/// Fully connected layer reading its weights from a slice of the flat
/// parameter buffer.
///
/// `backward` accumulates into the gradient slice so that the two
/// augmented views can share one parameter set.
#[derive(Clone)]
pub struct Dense {
    dim: (usize, usize),
    bias: bool,
    size: usize,

    // Forward metadata
    x: Array2<f32>,
}

impl Dense {
    pub fn new(dim: (usize, usize), bias: bool) -> Self {
        let size = dim.0 * dim.1 + if bias { dim.1 } else { 0 };

        Self {
            dim,
            bias,
            size,
            x: Array2::zeros((1, 1)),
        }
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn specs(&self, prefix: &str, offset: usize) -> Vec<ParamSpec> {
        let w_size = self.dim.0 * self.dim.1;
        let mut specs = vec![ParamSpec::new(
            format!("{prefix}.weight"),
            vec![self.dim.0, self.dim.1],
            offset,
        )];

        if self.bias {
            specs.push(ParamSpec::new(
                format!("{prefix}.bias"),
                vec![self.dim.1],
                offset + w_size,
            ));
        }

        specs
    }

    /// Fills the layer's slice with uniform values bounded by the inverse
    /// square root of the fan-in.
    pub fn init<R: Rng>(&self, params: &mut [f32], rng: &mut R) {
        let bound = 1.0 / (self.dim.0 as f32).sqrt();
        for p in params.iter_mut() {
            *p = rng.random_range(-bound..bound);
        }
    }

    pub fn forward(&mut self, params: &[f32], x: Array2<f32>) -> Array2<f32> {
        let (w, b) = self.view_params(params);

        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);
        if let Some(b) = b {
            z += &b;
        }

        self.x = x;
        z
    }

    pub fn backward(&mut self, params: &[f32], grad: &mut [f32], d: Array2<f32>) -> Array2<f32> {
        let (mut dw, db) = self.view_grad(grad);
        linalg::general_mat_mul(1.0, &self.x.t(), &d, 1.0, &mut dw);
        if let Some(mut db) = db {
            db += &d.sum_axis(Axis(0));
        }

        let (w, _) = self.view_params(params);
        let mut dx = Array2::zeros((d.nrows(), self.dim.0));
        linalg::general_mat_mul(1.0, &d, &w.t(), 0.0, &mut dx);

        dx
    }

    /// Gives a view of the raw parameter slice as this layer's weights and
    /// optional biases.
    fn view_params<'a>(
        &self,
        params: &'a [f32],
    ) -> (ArrayView2<'a, f32>, Option<ArrayView1<'a, f32>>) {
        let w_size = self.dim.0 * self.dim.1;
        let weights = ArrayView2::from_shape(self.dim, &params[..w_size]).unwrap();
        let biases = self
            .bias
            .then(|| ArrayView1::from_shape(self.dim.1, &params[w_size..]).unwrap());
        (weights, biases)
    }

    /// Gives a view of the raw gradient slice as this layer's delta weights
    /// and optional delta biases.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> (ArrayViewMut2<'a, f32>, Option<ArrayViewMut1<'a, f32>>) {
        let w_size = self.dim.0 * self.dim.1;
        let (dw_raw, db_raw) = grad.split_at_mut(w_size);
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw).unwrap();
        let db = self
            .bias
            .then(|| ArrayViewMut1::from_shape(self.dim.1, db_raw).unwrap());
        (dw, db)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;

    use super::*;

    #[test]
    fn forward_applies_weights_and_bias() {
        let mut layer = Dense::new((2, 2), true);
        // w = [[1, 0], [0, 2]], b = [0.5, -0.5]
        let params = [1.0, 0.0, 0.0, 2.0, 0.5, -0.5];

        let out = layer.forward(&params, arr2(&[[1.0, 1.0], [2.0, 3.0]]));

        assert_eq!(out, arr2(&[[1.5, 1.5], [2.5, 5.5]]));
    }

    #[test]
    fn backward_accumulates_into_grad() {
        let mut layer = Dense::new((2, 1), true);
        let params = [1.0, -1.0, 0.0];
        let mut grad = [1.0, 1.0, 1.0];

        layer.forward(&params, arr2(&[[2.0, 3.0]]));
        let dx = layer.backward(&params, &mut grad, arr2(&[[1.0]]));

        // dw = x^T d = [2, 3], db = 1, each on top of the existing 1.0.
        assert_eq!(grad, [3.0, 4.0, 2.0]);
        // dx = d w^T = [1, -1]
        assert_eq!(dx, arr2(&[[1.0, -1.0]]));
    }

    #[test]
    fn no_bias_layer_has_weight_only_specs() {
        let layer = Dense::new((3, 4), false);
        let specs = layer.specs("head", 10);

        assert_eq!(layer.size(), 12);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name(), "head.weight");
        assert_eq!(specs[0].range(), 10..22);
    }
}
