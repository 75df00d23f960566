mod error;
mod group;

pub use error::{CollectiveErr, Result};
pub use group::{LocalGroup, ProcessGroup, ThreadGroup};
