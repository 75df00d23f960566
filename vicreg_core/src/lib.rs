pub mod arch;
mod error;
mod gather;
mod lars;
mod loss;
mod model;
mod params;
mod projector;
mod schedule;

pub use error::{CoreErr, Result};
pub use gather::{FullGather, concat_batch, split_batch};
pub use lars::{Lars, ParamFilter, exclude_one_dim};
pub use loss::{LossTerms, VicregLoss, off_diagonal};
pub use model::{VicregModel, linear_backbone};
pub use params::{ParamLayout, ParamSpec};
pub use projector::projector;
pub use schedule::LrSchedule;
