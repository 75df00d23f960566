use crate::{CoreErr, Result, arch::Layer};

/// Builds the expander head from a hyphen-delimited width list.
///
/// The embedding width is prepended, every adjacent pair except the last
/// becomes {dense → batch-norm → relu}, and the final pair is a single
/// dense transform without bias. Returns the layers together with the
/// head's output width.
///
/// # Errors
/// Returns `CoreErr` when the spec yields fewer than two widths or
/// contains a token that is not a positive integer.
pub fn projector(embedding: usize, mlp_spec: &str) -> Result<(Vec<Layer>, usize)> {
    if mlp_spec.trim().is_empty() {
        return Err(CoreErr::DegenerateMlpSpec {
            spec: mlp_spec.to_string(),
        });
    }

    let mut widths = vec![embedding];
    for token in mlp_spec.split('-') {
        let width: usize = token.trim().parse().map_err(|_| CoreErr::InvalidMlpWidth {
            token: token.to_string(),
        })?;

        if width == 0 {
            return Err(CoreErr::InvalidMlpWidth {
                token: token.to_string(),
            });
        }

        widths.push(width);
    }

    if widths.len() < 2 {
        return Err(CoreErr::DegenerateMlpSpec {
            spec: mlp_spec.to_string(),
        });
    }

    let mut layers = Vec::new();
    for pair in widths.windows(2).take(widths.len() - 2) {
        layers.push(Layer::dense((pair[0], pair[1]), true));
        layers.push(Layer::batch_norm(pair[1]));
        layers.push(Layer::relu());
    }

    let last = widths.len() - 1;
    layers.push(Layer::dense((widths[last - 1], widths[last]), false));

    Ok((layers, widths[last]))
}
