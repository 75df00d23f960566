use ndarray::Array2;
use rand::Rng;

use crate::{
    ParamLayout, Result,
    arch::{Layer, Sequential},
    projector::projector,
};

/// The minimal concrete backbone collaborator: one bias-carrying linear
/// map from the flattened input to the embedding width.
pub fn linear_backbone(input_dim: usize, embedding: usize) -> Vec<Layer> {
    vec![Layer::dense((input_dim, embedding), true)]
}

/// Backbone plus expander head, duplicated into two towers so each
/// augmented view keeps its own forward caches while both read and
/// accumulate into the same flat parameter and gradient buffers.
pub struct VicregModel {
    tower_a: Sequential,
    tower_b: Sequential,
    backbone_len: usize,
    num_features: usize,
}

impl VicregModel {
    /// Assembles the model for a given input width and projector spec.
    ///
    /// # Errors
    /// Returns `CoreErr` when the projector spec is degenerate or invalid.
    pub fn new(input_dim: usize, embedding: usize, mlp_spec: &str) -> Result<Self> {
        let mut layers = linear_backbone(input_dim, embedding);
        let backbone_len = layers.iter().map(|l| l.size()).sum();

        let (head, num_features) = projector(embedding, mlp_spec)?;
        layers.extend(head);

        let tower = Sequential::new(layers);

        Ok(Self {
            tower_a: tower.clone(),
            tower_b: tower,
            backbone_len,
            num_features,
        })
    }

    /// Total parameter count across backbone and head.
    pub fn size(&self) -> usize {
        self.tower_a.size()
    }

    /// Width of the embeddings the loss consumes.
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Length of the backbone's prefix of the flat buffer, used when
    /// exporting the feature extractor alone.
    pub fn backbone_len(&self) -> usize {
        self.backbone_len
    }

    /// The ordered description of every parameter tensor.
    pub fn layout(&self) -> Result<ParamLayout> {
        ParamLayout::new(self.tower_a.specs("net"))
    }

    /// Allocates and initializes a fresh flat parameter buffer.
    pub fn init_params<R: Rng>(&self, rng: &mut R) -> Result<Vec<f32>> {
        let mut params = vec![0.0; self.size()];
        self.tower_a.init_params(&mut params, rng)?;
        Ok(params)
    }

    /// Runs both augmented views through their towers.
    ///
    /// # Errors
    /// Returns `CoreErr` when the parameter buffer length does not match.
    pub fn forward_pair(
        &mut self,
        params: &[f32],
        view_a: Array2<f32>,
        view_b: Array2<f32>,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        let za = self.tower_a.forward(params, view_a)?;
        let zb = self.tower_b.forward(params, view_b)?;
        Ok((za, zb))
    }

    /// Backpropagates both embedding gradients, accumulating each tower's
    /// contribution into the shared gradient buffer.
    ///
    /// # Errors
    /// Returns `CoreErr` when either buffer length does not match.
    pub fn backward_pair(
        &mut self,
        params: &[f32],
        grads: &mut [f32],
        d_a: Array2<f32>,
        d_b: Array2<f32>,
    ) -> Result<()> {
        self.tower_a.backward(params, grads, d_a)?;
        self.tower_b.backward(params, grads, d_b)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn layout_covers_the_whole_buffer() {
        let model = VicregModel::new(6, 4, "8-8").unwrap();
        let layout = model.layout().unwrap();

        assert_eq!(layout.total_len(), model.size());
        assert_eq!(model.num_features(), 8);
        // input->embedding dense with bias
        assert_eq!(model.backbone_len(), 6 * 4 + 4);
        assert_eq!(layout.specs()[0].name(), "net.0.weight");
    }

    #[test]
    fn both_towers_accumulate_into_one_grad_buffer() {
        let mut model = VicregModel::new(3, 2, "4").unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let params = model.init_params(&mut rng).unwrap();

        let view = Array2::from_shape_fn((4, 3), |(i, j)| (i + j) as f32 * 0.1);
        let (za, zb) = model
            .forward_pair(&params, view.clone(), view.clone())
            .unwrap();
        assert_eq!(za.dim(), (4, 4));
        assert_eq!(za, zb);

        let mut grads = vec![0.0; model.size()];
        let d = Array2::ones((4, 4));
        model
            .backward_pair(&params, &mut grads, d.clone(), d)
            .unwrap();

        // Identical views and upstream gradients: the accumulated grad is
        // twice a single tower's contribution.
        let mut single = vec![0.0; model.size()];
        let mut tower = VicregModel::new(3, 2, "4").unwrap();
        tower.forward_pair(&params, view.clone(), view).unwrap();
        tower
            .backward_pair(&params, &mut single, Array2::ones((4, 4)), Array2::zeros((4, 4)))
            .unwrap();

        for (g, s) in grads.iter().zip(&single) {
            assert!((g - 2.0 * s).abs() < 1e-4, "{g} vs {}", 2.0 * s);
        }
    }
}
