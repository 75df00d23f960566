use std::{error::Error, fmt};

/// The collective module's result type.
pub type Result<T> = std::result::Result<T, CollectiveErr>;

/// Process-group communication failures.
///
/// Any of these is fatal to the whole group: the recovery unit is a restart
/// of every participant from the last checkpoint, not a local retry.
#[derive(Debug)]
pub enum CollectiveErr {
    Transport {
        detail: String,
    },
    ShardLengthMismatch {
        rank: usize,
        got: usize,
        expected: usize,
    },
    MissingShard {
        rank: usize,
    },
}

impl fmt::Display for CollectiveErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveErr::Transport { detail } => write!(f, "transport error: {detail}"),
            CollectiveErr::ShardLengthMismatch {
                rank,
                got,
                expected,
            } => write!(
                f,
                "shard length mismatch at rank {rank}: got {got}, expected {expected}"
            ),
            CollectiveErr::MissingShard { rank } => {
                write!(f, "rank {rank} deposited no shard for this operation")
            }
        }
    }
}

impl Error for CollectiveErr {}
