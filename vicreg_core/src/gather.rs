use collective::ProcessGroup;
use ndarray::{Array2, ArrayView2, Axis, concatenate, s};

use crate::{CoreErr, Result};

/// The collective gather as a differentiable two-phase operation.
///
/// Forward hands every rank the full rank-ordered set of embedding
/// shards. Because that duplicates each shard into every rank's view of
/// the batch, backward must route the *sum* of all ranks' upstream
/// gradients for a shard back to the rank that owns it: stack, all-reduce
/// the stack, keep the local slice. With a single-participant group both
/// directions are exact identities.
pub struct FullGather<G> {
    group: G,
}

impl<G: ProcessGroup> FullGather<G> {
    pub fn new(group: G) -> Self {
        Self { group }
    }

    pub fn group(&self) -> &G {
        &self.group
    }

    /// Gathers the local shard from every rank, in rank order.
    ///
    /// Concatenation along the batch dimension is the caller's choice.
    ///
    /// # Errors
    /// Returns `CoreErr` on transport failure or when the group returns
    /// the wrong number of shards.
    pub fn forward(&self, local: ArrayView2<f32>) -> Result<Vec<Array2<f32>>> {
        let flat: Vec<f32> = local.iter().copied().collect();
        let shards = self.group.all_gather(&flat)?;

        if shards.len() != self.group.world_size() {
            return Err(CoreErr::WorldSizeMismatch {
                got: shards.len(),
                expected: self.group.world_size(),
            });
        }

        shards
            .into_iter()
            .map(|shard| {
                let got = shard.len();
                Array2::from_shape_vec(local.dim(), shard).map_err(|_| {
                    CoreErr::BufferLengthMismatch {
                        what: "gathered shard",
                        got,
                        expected: flat.len(),
                    }
                })
            })
            .collect()
    }

    /// Routes the summed upstream gradients back to the local shard.
    ///
    /// # Args
    /// * `upstream` - One gradient tensor per rank position, each shaped
    ///   like the local shard.
    ///
    /// # Errors
    /// Returns `CoreErr` when the upstream count or shapes disagree with
    /// the group, or on transport failure.
    pub fn backward(&self, upstream: &[Array2<f32>]) -> Result<Array2<f32>> {
        let world_size = self.group.world_size();
        if upstream.len() != world_size {
            return Err(CoreErr::WorldSizeMismatch {
                got: upstream.len(),
                expected: world_size,
            });
        }

        let dim = upstream[0].dim();
        for grad in upstream {
            if grad.dim() != dim {
                return Err(CoreErr::ViewShapeMismatch {
                    got: grad.dim(),
                    expected: dim,
                });
            }
        }

        let shard_len = dim.0 * dim.1;
        let mut stacked = Vec::with_capacity(world_size * shard_len);
        for grad in upstream {
            stacked.extend(grad.iter().copied());
        }

        self.group.all_reduce_sum(&mut stacked)?;

        let rank = self.group.rank();
        let own = stacked[rank * shard_len..(rank + 1) * shard_len].to_vec();
        Ok(Array2::from_shape_vec(dim, own).unwrap())
    }
}

/// Concatenates rank-ordered shards along the batch dimension.
///
/// # Errors
/// Returns `CoreErr` when the shards disagree on feature width.
pub fn concat_batch(shards: &[Array2<f32>]) -> Result<Array2<f32>> {
    let views: Vec<ArrayView2<f32>> = shards.iter().map(|s| s.view()).collect();
    concatenate(Axis(0), &views).map_err(|_| CoreErr::ViewShapeMismatch {
        got: shards.last().map(|s| s.dim()).unwrap_or((0, 0)),
        expected: shards.first().map(|s| s.dim()).unwrap_or((0, 0)),
    })
}

/// Splits a global-batch tensor back into equal per-rank shards.
///
/// # Errors
/// Returns `CoreErr` when the row count is not a multiple of `world_size`.
pub fn split_batch(global: &Array2<f32>, world_size: usize) -> Result<Vec<Array2<f32>>> {
    let rows = global.nrows();
    if world_size == 0 || rows % world_size != 0 {
        return Err(CoreErr::WorldSizeMismatch {
            got: rows,
            expected: world_size,
        });
    }

    let shard_rows = rows / world_size;
    Ok((0..world_size)
        .map(|r| {
            global
                .slice(s![r * shard_rows..(r + 1) * shard_rows, ..])
                .to_owned()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use collective::{LocalGroup, ThreadGroup};
    use ndarray::arr2;

    use super::*;

    #[test]
    fn single_participant_forward_and_backward_are_identities() {
        let gather = FullGather::new(LocalGroup);
        let local = arr2(&[[1.0, 2.0], [3.0, 4.0]]);

        let shards = gather.forward(local.view()).unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0], local);

        let upstream = vec![arr2(&[[5.0, 6.0], [7.0, 8.0]])];
        let d = gather.backward(&upstream).unwrap();
        assert_eq!(d, upstream[0]);
    }

    #[test]
    fn backward_rejects_a_wrong_rank_count() {
        let gather = FullGather::new(LocalGroup);
        let upstream = vec![Array2::zeros((2, 2)), Array2::zeros((2, 2))];

        assert!(matches!(
            gather.backward(&upstream),
            Err(CoreErr::WorldSizeMismatch { got: 2, expected: 1 })
        ));
    }

    #[test]
    fn multi_rank_backward_sums_then_slices() {
        const WORLD: usize = 3;

        let groups = ThreadGroup::connect(WORLD);
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| {
                    s.spawn(move || {
                        let rank = g.rank() as f32;
                        let gather = FullGather::new(g);

                        // Every rank supplies a distinct upstream tensor for
                        // every position.
                        let upstream: Vec<Array2<f32>> = (0..WORLD)
                            .map(|pos| {
                                arr2(&[[rank * 10.0 + pos as f32, 1.0], [0.5, rank]])
                            })
                            .collect();

                        gather.backward(&upstream).unwrap()
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Position p's summed gradient: sum over ranks r of the tensor
        // [[10r + p, 1], [0.5, r]] = [[30 + 3p, 3], [1.5, 3]].
        for (rank, d) in results.iter().enumerate() {
            let expected = arr2(&[[30.0 + 3.0 * rank as f32, 3.0], [1.5, 3.0]]);
            assert_eq!(d, &expected);
        }
    }

    #[test]
    fn multi_rank_forward_gathers_in_rank_order() {
        const WORLD: usize = 2;

        let groups = ThreadGroup::connect(WORLD);
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| {
                    s.spawn(move || {
                        let local = arr2(&[[g.rank() as f32, -1.0]]);
                        let gather = FullGather::new(g);
                        let shards = gather.forward(local.view()).unwrap();
                        concat_batch(&shards).unwrap()
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for global in results {
            assert_eq!(global, arr2(&[[0.0, -1.0], [1.0, -1.0]]));
        }
    }

    #[test]
    fn split_batch_inverts_concat_batch() {
        let a = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let b = arr2(&[[5.0, 6.0], [7.0, 8.0]]);

        let global = concat_batch(&[a.clone(), b.clone()]).unwrap();
        let shards = split_batch(&global, 2).unwrap();

        assert_eq!(shards, vec![a, b]);
        assert!(split_batch(&global, 3).is_err());
    }
}
