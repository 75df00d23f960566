pub mod checkpoint;
mod config;
mod data;
mod error;
mod stats;
mod trainer;

pub use config::TrainConfig;
pub use data::PairSampler;
pub use error::{Result, TrainErr};
pub use stats::StatsLogger;
pub use trainer::{RunOutcome, StepOutcome, Trainer};
