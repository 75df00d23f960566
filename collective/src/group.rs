use std::sync::{Arc, Barrier};

use log::debug;
use parking_lot::Mutex;

use crate::{CollectiveErr, Result};

/// A fixed, ordered set of cooperating participants.
///
/// Every method is a synchronization point: all ranks must call it with a
/// buffer of the same length before any of them proceeds. The group is
/// assumed connected before training starts; establishing it is the
/// bootstrap layer's job.
pub trait ProcessGroup {
    /// This participant's position in `[0, world_size)`.
    fn rank(&self) -> usize;

    /// Number of participants in the group.
    fn world_size(&self) -> usize;

    /// Collects every rank's buffer, returned in rank order.
    ///
    /// # Errors
    /// Returns `CollectiveErr` on transport failure or when ranks disagree
    /// on the buffer length.
    fn all_gather(&self, local: &[f32]) -> Result<Vec<Vec<f32>>>;

    /// Replaces `buf` with the elementwise sum of every rank's buffer.
    ///
    /// # Errors
    /// Returns `CollectiveErr` on transport failure or when ranks disagree
    /// on the buffer length.
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()>;
}

impl<G: ProcessGroup + ?Sized> ProcessGroup for &G {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<Vec<f32>>> {
        (**self).all_gather(local)
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        (**self).all_reduce_sum(buf)
    }
}

impl<G: ProcessGroup + ?Sized> ProcessGroup for Box<G> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<Vec<f32>>> {
        (**self).all_gather(local)
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        (**self).all_reduce_sum(buf)
    }
}

/// The single-participant group. Every collective is an identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalGroup;

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<Vec<f32>>> {
        Ok(vec![local.to_vec()])
    }

    fn all_reduce_sum(&self, _buf: &mut [f32]) -> Result<()> {
        Ok(())
    }
}

struct Exchange {
    slots: Mutex<Vec<Option<Vec<f32>>>>,
    barrier: Barrier,
}

/// An in-memory group whose ranks live on threads of one process.
///
/// Ranks deposit their buffer into a shared slot table and meet at a
/// barrier twice per operation: once so every deposit is visible before
/// anyone reads, once so nobody starts the next operation while a slow
/// rank is still reading this one.
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Exchange>,
}

impl ThreadGroup {
    /// Creates one connected handle per rank, in rank order.
    pub fn connect(world_size: usize) -> Vec<ThreadGroup> {
        let shared = Arc::new(Exchange {
            slots: Mutex::new(vec![None; world_size]),
            barrier: Barrier::new(world_size),
        });

        (0..world_size)
            .map(|rank| ThreadGroup {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn exchange(&self, local: &[f32]) -> Result<Vec<Vec<f32>>> {
        self.shared.slots.lock()[self.rank] = Some(local.to_vec());
        self.shared.barrier.wait();

        let result = self.collect(local.len());

        // Hold everyone until all reads are done, so the next operation's
        // deposits cannot clobber this one's slots.
        self.shared.barrier.wait();
        result
    }

    fn collect(&self, expected: usize) -> Result<Vec<Vec<f32>>> {
        let slots = self.shared.slots.lock();
        let mut shards = Vec::with_capacity(self.world_size);

        for (rank, slot) in slots.iter().enumerate() {
            let shard = slot
                .as_ref()
                .ok_or(CollectiveErr::MissingShard { rank })?;

            if shard.len() != expected {
                return Err(CollectiveErr::ShardLengthMismatch {
                    rank,
                    got: shard.len(),
                    expected,
                });
            }

            shards.push(shard.clone());
        }

        Ok(shards)
    }
}

impl ProcessGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<Vec<f32>>> {
        debug!(rank = self.rank; "all_gather");
        self.exchange(local)
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        debug!(rank = self.rank; "all_reduce_sum");
        let shards = self.exchange(buf)?;

        buf.fill(0.0);
        for shard in &shards {
            for (acc, v) in buf.iter_mut().zip(shard) {
                *acc += v;
            }
        }

        Ok(())
    }
}
