use std::{
    error::Error,
    fmt::{self, Display},
};

use collective::CollectiveErr;

/// The result type used in the entire core module.
pub type Result<T> = std::result::Result<T, CoreErr>;

/// The core module's error type.
///
/// Everything here is fatal: either an invalid configuration caught at
/// startup or a caller bug caught at a shape boundary. Neither is retried.
#[derive(Debug)]
pub enum CoreErr {
    DegenerateMlpSpec {
        spec: String,
    },
    InvalidMlpWidth {
        token: String,
    },
    BatchTooSmall {
        got: usize,
    },
    ViewShapeMismatch {
        got: (usize, usize),
        expected: (usize, usize),
    },
    NotSquare {
        rows: usize,
        cols: usize,
    },
    BufferLengthMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    WorldSizeMismatch {
        got: usize,
        expected: usize,
    },
    Collective(CollectiveErr),
}

impl Display for CoreErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreErr::DegenerateMlpSpec { spec } => {
                write!(f, "projector spec {spec:?} yields fewer than two widths")
            }
            CoreErr::InvalidMlpWidth { token } => {
                write!(f, "projector spec contains an invalid width {token:?}")
            }
            CoreErr::BatchTooSmall { got } => {
                write!(f, "batch size must be at least 2, got {got}")
            }
            CoreErr::ViewShapeMismatch { got, expected } => write!(
                f,
                "the two views disagree on shape: got {got:?}, expected {expected:?}"
            ),
            CoreErr::NotSquare { rows, cols } => {
                write!(f, "expected a square matrix, got {rows}x{cols}")
            }
            CoreErr::BufferLengthMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "{what} buffer length mismatch: got {got}, expected {expected}"
            ),
            CoreErr::WorldSizeMismatch { got, expected } => write!(
                f,
                "expected one tensor per rank ({expected}), got {got}"
            ),
            CoreErr::Collective(e) => write!(f, "collective failure: {e}"),
        }
    }
}

impl Error for CoreErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CoreErr::Collective(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CollectiveErr> for CoreErr {
    fn from(value: CollectiveErr) -> Self {
        Self::Collective(value)
    }
}
