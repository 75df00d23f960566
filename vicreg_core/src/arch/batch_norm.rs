use ndarray::prelude::*;

use crate::ParamSpec;

const BN_EPS: f32 = 1e-5;

/// Normalization over the batch dimension with learnable per-feature
/// scale and shift.
///
/// Statistics always come from the current batch; the projector head is
/// only ever run in training mode.
#[derive(Clone)]
pub struct BatchNorm {
    width: usize,

    // Forward metadata
    xhat: Array2<f32>,
    std: Array1<f32>,
}

impl BatchNorm {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            xhat: Array2::zeros((1, 1)),
            std: Array1::zeros(1),
        }
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        2 * self.width
    }

    pub fn specs(&self, prefix: &str, offset: usize) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new(format!("{prefix}.gamma"), vec![self.width], offset),
            ParamSpec::new(
                format!("{prefix}.beta"),
                vec![self.width],
                offset + self.width,
            ),
        ]
    }

    /// Identity affine start: unit scale, zero shift.
    pub fn init(&self, params: &mut [f32]) {
        let (gamma, beta) = params.split_at_mut(self.width);
        gamma.fill(1.0);
        beta.fill(0.0);
    }

    pub fn forward(&mut self, params: &[f32], x: Array2<f32>) -> Array2<f32> {
        let (gamma, beta) = self.view_params(params);

        let mean = x.mean_axis(Axis(0)).unwrap();
        let xc = &x - &mean;
        let var = xc.mapv(|v| v * v).mean_axis(Axis(0)).unwrap();
        let std = var.mapv(|v| (v + BN_EPS).sqrt());

        self.xhat = xc / &std;
        self.std = std;

        &self.xhat * &gamma + &beta
    }

    pub fn backward(&mut self, params: &[f32], grad: &mut [f32], d: Array2<f32>) -> Array2<f32> {
        let (gamma, _) = self.view_params(params);
        let b = d.nrows() as f32;

        {
            let (mut dgamma, mut dbeta) = self.view_grad(grad);
            dgamma += &(&d * &self.xhat).sum_axis(Axis(0));
            dbeta += &d.sum_axis(Axis(0));
        }

        let dxhat = &d * &gamma;
        let mean_dxhat = dxhat.sum_axis(Axis(0)) / b;
        let mean_dxhat_xhat = (&dxhat * &self.xhat).sum_axis(Axis(0)) / b;

        let mut dx = dxhat;
        dx -= &mean_dxhat;
        dx -= &(&self.xhat * &mean_dxhat_xhat);
        dx /= &self.std;

        dx
    }

    fn view_params<'a>(&self, params: &'a [f32]) -> (ArrayView1<'a, f32>, ArrayView1<'a, f32>) {
        let (gamma, beta) = params.split_at(self.width);
        (
            ArrayView1::from_shape(self.width, gamma).unwrap(),
            ArrayView1::from_shape(self.width, beta).unwrap(),
        )
    }

    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> (ArrayViewMut1<'a, f32>, ArrayViewMut1<'a, f32>) {
        let (dgamma, dbeta) = grad.split_at_mut(self.width);
        (
            ArrayViewMut1::from_shape(self.width, dgamma).unwrap(),
            ArrayViewMut1::from_shape(self.width, dbeta).unwrap(),
        )
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;

    use super::*;

    #[test]
    fn forward_standardizes_each_column() {
        let mut layer = BatchNorm::new(2);
        let params = [1.0, 1.0, 0.0, 0.0];

        let out = layer.forward(&params, arr2(&[[0.0, 10.0], [2.0, 30.0]]));

        // Each column becomes {-1, 1} up to the stabilizing epsilon.
        for (&got, &expected) in out.iter().zip([-1.0, -1.0, 1.0, 1.0].iter()) {
            assert!((got - expected).abs() < 1e-3, "got {got}, expected {expected}");
        }
    }

    #[test]
    fn affine_parameters_scale_and_shift() {
        let mut layer = BatchNorm::new(1);
        let params = [2.0, 3.0];

        let out = layer.forward(&params, arr2(&[[-1.0], [1.0]]));

        assert!((out[[0, 0]] - 1.0).abs() < 1e-3);
        assert!((out[[1, 0]] - 5.0).abs() < 1e-3);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut layer = BatchNorm::new(2);
        let params = [1.5, 0.5, 0.2, -0.1];
        let x = arr2(&[[0.1, -0.4], [0.9, 0.3], [-0.5, 0.7], [0.4, -0.2]]);

        // Scalar objective: sum of outputs weighted by a fixed matrix.
        let w = arr2(&[[0.3, -0.7], [0.9, 0.4], [-0.2, 0.6], [0.5, -0.8]]);
        let objective = |layer: &mut BatchNorm, x: &Array2<f32>| {
            (layer.forward(&params, x.clone()) * &w).sum()
        };

        objective(&mut layer, &x);
        let mut grad = [0.0; 4];
        let dx = layer.backward(&params, &mut grad, w.clone());

        let h = 1e-3;
        for i in 0..x.nrows() {
            for j in 0..x.ncols() {
                let mut xp = x.clone();
                let mut xm = x.clone();
                xp[[i, j]] += h;
                xm[[i, j]] -= h;

                let numeric =
                    (objective(&mut layer, &xp) - objective(&mut layer, &xm)) / (2.0 * h);
                assert!(
                    (dx[[i, j]] - numeric).abs() < 1e-2,
                    "dx[{i},{j}] = {}, numeric = {numeric}",
                    dx[[i, j]]
                );
            }
        }
    }
}
