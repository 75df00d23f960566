use ndarray::prelude::*;

use crate::{CoreErr, Result};

/// Stabilizer under the square root of the per-column variance; keeps the
/// hinge gradient finite when a feature collapses to a constant.
const VAR_EPS: f32 = 1e-4;

/// Extracts the off-diagonal entries of a square matrix in row order.
///
/// A `D x D` input always yields exactly `D * (D - 1)` elements.
///
/// # Errors
/// Returns `CoreErr` when the input is not square.
pub fn off_diagonal(m: ArrayView2<f32>) -> Result<Vec<f32>> {
    let (rows, cols) = m.dim();
    if rows != cols {
        return Err(CoreErr::NotSquare { rows, cols });
    }

    let mut out = Vec::with_capacity(rows * (rows - 1));
    for ((i, j), &v) in m.indexed_iter() {
        if i != j {
            out.push(v);
        }
    }

    Ok(out)
}

/// The three weighted regularization terms and their sum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossTerms {
    pub invariance: f32,
    pub variance: f32,
    pub covariance: f32,
    pub total: f32,
}

/// The invariance/variance/covariance objective over two batches of
/// embeddings. Stateless: both directions are plain functions of the
/// inputs and the three coefficients.
#[derive(Debug, Clone, Copy)]
pub struct VicregLoss {
    sim_coeff: f32,
    std_coeff: f32,
    cov_coeff: f32,
}

struct Analysis {
    terms: LossTerms,
    xc: Array2<f32>,
    yc: Array2<f32>,
    std_x: Array1<f32>,
    std_y: Array1<f32>,
    cov_x: Array2<f32>,
    cov_y: Array2<f32>,
}

impl VicregLoss {
    pub fn new(sim_coeff: f32, std_coeff: f32, cov_coeff: f32) -> Self {
        Self {
            sim_coeff,
            std_coeff,
            cov_coeff,
        }
    }

    /// Computes the weighted loss terms for two row-corresponding views.
    ///
    /// # Errors
    /// Returns `CoreErr` when the views disagree on shape or the batch has
    /// fewer than two rows.
    pub fn evaluate(&self, x: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<LossTerms> {
        Ok(self.analyze(x, y)?.terms)
    }

    /// Computes the loss terms together with the gradients of the total
    /// loss with respect to each view.
    ///
    /// # Errors
    /// Returns `CoreErr` when the views disagree on shape or the batch has
    /// fewer than two rows.
    pub fn evaluate_with_grad(
        &self,
        x: ArrayView2<f32>,
        y: ArrayView2<f32>,
    ) -> Result<(LossTerms, Array2<f32>, Array2<f32>)> {
        let analysis = self.analyze(x, y)?;
        let (b, d) = x.dim();
        let (b_f, d_f) = (b as f32, d as f32);

        // Invariance: d/dx of mean((x - y)^2) over all elements.
        let inv_scale = 2.0 * self.sim_coeff / (b_f * d_f);
        let diff = &x - &y;
        let mut dx = diff.mapv(|v| v * inv_scale);
        let mut dy = diff.mapv(|v| -v * inv_scale);

        // Variance: the hinge only pushes on columns whose std is below 1.
        // Centering needs no extra projection here: each column of the
        // centered view sums to zero, so the projection is the identity.
        let hinge_coeff = |std: &Array1<f32>| {
            std.mapv(|s| {
                if s < 1.0 {
                    -self.std_coeff / (2.0 * d_f * b_f * s)
                } else {
                    0.0
                }
            })
        };
        dx += &(&analysis.xc * &hinge_coeff(&analysis.std_x));
        dy += &(&analysis.yc * &hinge_coeff(&analysis.std_y));

        // Covariance: L = sum_offdiag(C^2) / D with C = xc^T xc / (B - 1),
        // so dL/dxc = 4 xc C_off / (D (B - 1)).
        let cov_scale = 4.0 * self.cov_coeff / (d_f * (b_f - 1.0));
        let zero_diag = |m: &Array2<f32>| {
            let mut off = m.clone();
            for i in 0..d {
                off[[i, i]] = 0.0;
            }
            off
        };
        dx.scaled_add(cov_scale, &analysis.xc.dot(&zero_diag(&analysis.cov_x)));
        dy.scaled_add(cov_scale, &analysis.yc.dot(&zero_diag(&analysis.cov_y)));

        Ok((analysis.terms, dx, dy))
    }

    fn analyze(&self, x: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<Analysis> {
        if x.dim() != y.dim() {
            return Err(CoreErr::ViewShapeMismatch {
                got: y.dim(),
                expected: x.dim(),
            });
        }

        let (b, d) = x.dim();
        if b < 2 {
            return Err(CoreErr::BatchTooSmall { got: b });
        }
        let (b_f, d_f) = (b as f32, d as f32);

        let invariance = (&x - &y).mapv(|v| v * v).mean().unwrap_or_default();

        let xc = &x - &x.mean_axis(Axis(0)).unwrap();
        let yc = &y - &y.mean_axis(Axis(0)).unwrap();

        let col_std = |c: &Array2<f32>| {
            c.mapv(|v| v * v)
                .mean_axis(Axis(0))
                .unwrap()
                .mapv(|v| (v + VAR_EPS).sqrt())
        };
        let std_x = col_std(&xc);
        let std_y = col_std(&yc);

        let hinge_mean =
            |std: &Array1<f32>| std.mapv(|s| (1.0 - s).max(0.0)).mean().unwrap_or_default();
        let variance = hinge_mean(&std_x) / 2.0 + hinge_mean(&std_y) / 2.0;

        let cov_x = xc.t().dot(&xc) / (b_f - 1.0);
        let cov_y = yc.t().dot(&yc) / (b_f - 1.0);

        let off_sq_sum = |cov: &Array2<f32>| -> Result<f32> {
            Ok(off_diagonal(cov.view())?.iter().map(|v| v * v).sum())
        };
        let covariance = (off_sq_sum(&cov_x)? + off_sq_sum(&cov_y)?) / d_f;

        let total = self.sim_coeff * invariance
            + self.std_coeff * variance
            + self.cov_coeff * covariance;

        Ok(Analysis {
            terms: LossTerms {
                invariance,
                variance,
                covariance,
                total,
            },
            xc,
            yc,
            std_x,
            std_y,
            cov_x,
            cov_y,
        })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;

    use super::*;

    fn views() -> (Array2<f32>, Array2<f32>) {
        let x = arr2(&[
            [0.31, -0.42, 0.11],
            [-0.25, 0.38, -0.47],
            [0.44, 0.09, 0.28],
            [-0.18, -0.33, 0.06],
        ]);
        let y = arr2(&[
            [0.27, -0.36, 0.19],
            [-0.31, 0.41, -0.39],
            [0.40, 0.05, 0.22],
            [-0.12, -0.29, 0.12],
        ]);
        (x, y)
    }

    #[test]
    fn identical_views_have_zero_invariance() {
        let (x, _) = views();
        let loss = VicregLoss::new(25.0, 25.0, 1.0);

        let terms = loss.evaluate(x.view(), x.view()).unwrap();
        assert_eq!(terms.invariance, 0.0);
    }

    #[test]
    fn saturated_hinge_has_zero_variance_term() {
        // Columns with std well above 1 in both views.
        let x = arr2(&[[-2.0, 4.0], [2.0, -4.0], [-2.0, 4.0], [2.0, -4.0]]);
        let loss = VicregLoss::new(0.0, 1.0, 0.0);

        let terms = loss.evaluate(x.view(), x.view()).unwrap();
        assert_eq!(terms.variance, 0.0);
    }

    #[test]
    fn off_diagonal_count_and_diagonal_only_covariance() {
        let m = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]);
        let off = off_diagonal(m.view()).unwrap();
        assert_eq!(off.len(), 3 * 2);
        assert_eq!(off, vec![2.0, 3.0, 4.0, 6.0, 7.0, 8.0]);

        // Two orthogonal columns: the covariance matrix is diagonal-only.
        let x = arr2(&[[1.0, 1.0], [1.0, -1.0], [-1.0, 1.0], [-1.0, -1.0]]);
        let loss = VicregLoss::new(0.0, 0.0, 1.0);
        let terms = loss.evaluate(x.view(), x.view()).unwrap();
        assert_eq!(terms.covariance, 0.0);
    }

    #[test]
    fn off_diagonal_rejects_non_square_input() {
        let m = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert!(matches!(
            off_diagonal(m.view()),
            Err(CoreErr::NotSquare { rows: 2, cols: 3 })
        ));
    }

    #[test]
    fn tiny_batches_are_rejected() {
        let x = arr2(&[[1.0, 2.0]]);
        let loss = VicregLoss::new(25.0, 25.0, 1.0);

        assert!(matches!(
            loss.evaluate(x.view(), x.view()),
            Err(CoreErr::BatchTooSmall { got: 1 })
        ));
    }

    #[test]
    fn mismatched_views_are_rejected() {
        let (x, _) = views();
        let y = arr2(&[[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]);
        let loss = VicregLoss::new(25.0, 25.0, 1.0);

        assert!(matches!(
            loss.evaluate(x.view(), y.view()),
            Err(CoreErr::ViewShapeMismatch { .. })
        ));
    }

    #[test]
    fn gradients_match_finite_differences() {
        let (x, y) = views();
        let loss = VicregLoss::new(25.0, 25.0, 1.0);

        let (terms, dx, dy) = loss.evaluate_with_grad(x.view(), y.view()).unwrap();
        assert!(terms.total.is_finite());

        let h = 1e-3;
        for i in 0..x.nrows() {
            for j in 0..x.ncols() {
                let mut xp = x.clone();
                let mut xm = x.clone();
                xp[[i, j]] += h;
                xm[[i, j]] -= h;

                let fp = loss.evaluate(xp.view(), y.view()).unwrap().total;
                let fm = loss.evaluate(xm.view(), y.view()).unwrap().total;
                let numeric = (fp - fm) / (2.0 * h);

                assert!(
                    (dx[[i, j]] - numeric).abs() < 2e-2,
                    "dx[{i},{j}] = {}, numeric = {numeric}",
                    dx[[i, j]]
                );

                let mut yp = y.clone();
                let mut ym = y.clone();
                yp[[i, j]] += h;
                ym[[i, j]] -= h;

                let fp = loss.evaluate(x.view(), yp.view()).unwrap().total;
                let fm = loss.evaluate(x.view(), ym.view()).unwrap().total;
                let numeric = (fp - fm) / (2.0 * h);

                assert!(
                    (dy[[i, j]] - numeric).abs() < 2e-2,
                    "dy[{i},{j}] = {}, numeric = {numeric}",
                    dy[[i, j]]
                );
            }
        }
    }
}
