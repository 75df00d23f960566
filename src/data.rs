use ndarray::{Array2, s};
use ndarray_rand::RandomExt;
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Normal, StandardNormal};

use crate::{Result, TrainErr};

/// Stand-in for the augmentation collaborator: a seeded base sample
/// matrix from which each batch yields two independently noised views.
/// Row `i` of both views always comes from the same base sample.
pub struct PairSampler {
    base: Array2<f32>,
    noise: Normal<f32>,
    rng: StdRng,
    batch_size: usize,
}

impl PairSampler {
    /// Creates a deterministic sampler.
    ///
    /// # Args
    /// * `num_samples` - Base sample count; `num_samples / batch_size`
    ///   batches make one epoch.
    /// * `input_dim` - Flattened sample width.
    /// * `noise_std` - Per-view augmentation noise level.
    /// * `batch_size` - Rows per produced batch.
    /// * `seed` - Drives both the base data and the noise stream.
    ///
    /// # Errors
    /// Returns `TrainErr` when the noise level is not a positive finite
    /// number or no full batch fits.
    pub fn new(
        num_samples: usize,
        input_dim: usize,
        noise_std: f32,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 || num_samples < batch_size {
            return Err(TrainErr::InvalidConfig {
                what: "num_samples",
                detail: format!("{num_samples} samples cannot fill a batch of {batch_size}"),
            });
        }

        let noise = Normal::new(0.0, noise_std).map_err(|e| TrainErr::InvalidConfig {
            what: "noise_std",
            detail: e.to_string(),
        })?;

        let mut rng = StdRng::seed_from_u64(seed);
        let base = Array2::random_using((num_samples, input_dim), StandardNormal, &mut rng);

        Ok(Self {
            base,
            noise,
            rng,
            batch_size,
        })
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.base.nrows() / self.batch_size
    }

    /// Produces the two augmented views for an epoch-local batch index.
    pub fn batch(&mut self, index: usize) -> (Array2<f32>, Array2<f32>) {
        let start = (index % self.steps_per_epoch()) * self.batch_size;
        let rows = self.base.slice(s![start..start + self.batch_size, ..]);

        let view_a = &rows + &Array2::random_using(rows.dim(), self.noise, &mut self.rng);
        let view_b = &rows + &Array2::random_using(rows.dim(), self.noise, &mut self.rng);

        (view_a, view_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_gives_the_same_stream() {
        let mut a = PairSampler::new(8, 3, 0.1, 4, 42).unwrap();
        let mut b = PairSampler::new(8, 3, 0.1, 4, 42).unwrap();

        let (a0, a1) = a.batch(0);
        let (b0, b1) = b.batch(0);

        assert_eq!(a0, b0);
        assert_eq!(a1, b1);
        assert_ne!(a0, a1);
    }

    #[test]
    fn views_share_base_rows() {
        let mut sampler = PairSampler::new(8, 3, 1e-6, 4, 7).unwrap();
        let (va, vb) = sampler.batch(1);

        assert_eq!(va.dim(), (4, 3));
        for (a, b) in va.iter().zip(vb.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn undersized_pools_are_rejected() {
        assert!(matches!(
            PairSampler::new(3, 2, 0.1, 4, 0),
            Err(TrainErr::InvalidConfig { .. })
        ));
    }
}
