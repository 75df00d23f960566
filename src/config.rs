use std::{fs::File, io::BufReader, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};

use crate::{Result, TrainErr};

/// The run's external configuration surface.
///
/// Loaded from a JSON file given as the single command-line argument;
/// every field falls back to its default. Validation happens once at
/// startup and is never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Where checkpoints, the stats log and the backbone export live.
    pub exp_dir: PathBuf,

    /// Flattened input width fed to the backbone.
    pub input_dim: usize,
    /// Backbone output width consumed by the expander head.
    pub embedding: usize,
    /// Hyphen-delimited expander head widths.
    pub mlp: String,

    pub epochs: usize,
    /// Effective batch size across the whole group; each rank works on
    /// `batch_size / world_size` rows.
    pub batch_size: usize,
    pub base_lr: f32,
    pub weight_decay: f32,

    pub sim_coeff: f32,
    pub std_coeff: f32,
    pub cov_coeff: f32,

    /// Stats records are throttled to one per this many seconds.
    pub log_freq_secs: u64,

    /// Synthetic data source: sample count, per-view noise level, seed.
    pub num_samples: usize,
    pub noise_std: f32,
    pub seed: u64,

    /// Log and skip the optimizer step when the loss or a gradient goes
    /// NaN/Inf, instead of poisoning the momentum buffers.
    pub guard_non_finite: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            exp_dir: PathBuf::from("./exp"),
            input_dim: 784,
            embedding: 512,
            mlp: "8192-8192-8192".to_string(),
            epochs: 100,
            batch_size: 128,
            base_lr: 0.2,
            weight_decay: 1e-6,
            sim_coeff: 25.0,
            std_coeff: 25.0,
            cov_coeff: 1.0,
            log_freq_secs: 60,
            num_samples: 1024,
            noise_std: 0.1,
            seed: 0,
            guard_non_finite: true,
        }
    }
}

impl TrainConfig {
    /// Reads a configuration record from a JSON file.
    ///
    /// # Errors
    /// Returns `TrainErr` when the file is missing or malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| TrainErr::InvalidConfig {
            what: "config file",
            detail: e.to_string(),
        })
    }

    /// Checks the startup invariants.
    ///
    /// # Errors
    /// Returns `TrainErr` for any hyperparameter the core cannot work with.
    pub fn validate(&self, world_size: usize) -> Result<()> {
        if self.batch_size < 2 {
            return Err(invalid("batch_size", "must be at least 2"));
        }
        if world_size == 0 || self.batch_size % world_size != 0 {
            return Err(invalid(
                "batch_size",
                "must be a positive multiple of the world size",
            ));
        }
        if self.epochs == 0 {
            return Err(invalid("epochs", "must be at least 1"));
        }
        if self.num_samples < self.batch_size {
            return Err(invalid("num_samples", "must cover at least one batch"));
        }
        if self.sim_coeff < 0.0 || self.std_coeff < 0.0 || self.cov_coeff < 0.0 {
            return Err(invalid("loss coefficients", "must be non-negative"));
        }
        if !(self.noise_std > 0.0) {
            return Err(invalid("noise_std", "must be positive"));
        }
        if self.input_dim == 0 || self.embedding == 0 {
            return Err(invalid("model widths", "must be positive"));
        }

        Ok(())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.exp_dir.join("model.ckpt")
    }

    pub fn backbone_path(&self) -> PathBuf {
        self.exp_dir.join("backbone.ckpt")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.exp_dir.join("stats.jsonl")
    }
}

fn invalid(what: &'static str, detail: &str) -> TrainErr {
    TrainErr::InvalidConfig {
        what,
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        TrainConfig::default().validate(1).unwrap();
    }

    #[test]
    fn tiny_batches_are_rejected() {
        let cfg = TrainConfig {
            batch_size: 1,
            ..TrainConfig::default()
        };

        assert!(matches!(
            cfg.validate(1),
            Err(TrainErr::InvalidConfig { what: "batch_size", .. })
        ));
    }

    #[test]
    fn batch_must_divide_across_the_group() {
        let cfg = TrainConfig {
            batch_size: 10,
            ..TrainConfig::default()
        };

        assert!(cfg.validate(2).is_ok());
        assert!(cfg.validate(3).is_err());
    }
}
