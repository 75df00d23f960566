use std::{error::Error, fmt, io};

use collective::CollectiveErr;
use vicreg_core::CoreErr;

/// The trainer module's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Training runtime failures.
#[derive(Debug)]
pub enum TrainErr {
    Io(io::Error),
    Core(CoreErr),
    Collective(CollectiveErr),
    Checkpoint {
        detail: String,
    },
    InvalidConfig {
        what: &'static str,
        detail: String,
    },
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::Io(e) => write!(f, "io error: {e}"),
            TrainErr::Core(e) => write!(f, "core error: {e}"),
            TrainErr::Collective(e) => write!(f, "collective error: {e}"),
            TrainErr::Checkpoint { detail } => write!(f, "checkpoint error: {detail}"),
            TrainErr::InvalidConfig { what, detail } => {
                write!(f, "invalid configuration for {what}: {detail}")
            }
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Io(e) => Some(e),
            TrainErr::Core(e) => Some(e),
            TrainErr::Collective(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<CoreErr> for TrainErr {
    fn from(value: CoreErr) -> Self {
        Self::Core(value)
    }
}

impl From<CollectiveErr> for TrainErr {
    fn from(value: CollectiveErr) -> Self {
        Self::Collective(value)
    }
}
