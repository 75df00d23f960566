use std::{
    fs,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use collective::ProcessGroup;
use log::{debug, info, warn};
use rand::{SeedableRng, rngs::StdRng};
use vicreg_core::{
    FullGather, Lars, LossTerms, LrSchedule, ParamLayout, VicregLoss, VicregModel, concat_batch,
    exclude_one_dim, split_batch,
};

use crate::{
    PairSampler, Result, StatsLogger, TrainConfig,
    checkpoint::{self, Snapshot, StartState},
};

/// What a single step did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Stepped { terms: LossTerms, lr: f32 },
    /// The non-finite guard fired: logged, optimizer untouched.
    SkippedNonFinite,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Cancellation observed between steps; the checkpoint holds `epoch`.
    Interrupted { epoch: usize },
}

/// Drives the synchronous training loop on one rank.
///
/// Owns the flat parameter and gradient buffers for the run's lifetime;
/// between collective calls nothing else touches them. Every rank holds a
/// redundant copy of the parameters and stays synchronized by applying
/// the same reduced gradients every step.
pub struct Trainer<G: ProcessGroup> {
    cfg: TrainConfig,
    model: VicregModel,
    layout: ParamLayout,
    params: Vec<f32>,
    grads: Vec<f32>,
    lars: Lars,
    schedule: LrSchedule,
    loss: VicregLoss,
    gather: FullGather<G>,
    sampler: PairSampler,
    stats: StatsLogger,
    stop: Arc<AtomicBool>,
    start_epoch: usize,
}

impl<G: ProcessGroup> Trainer<G> {
    /// Builds the full training stack for one rank and consults the
    /// checkpoint file: an existing record resumes at its epoch, otherwise
    /// the run is fresh at epoch zero.
    ///
    /// # Errors
    /// Returns `TrainErr` on invalid configuration, a malformed checkpoint
    /// or I/O failure.
    pub fn new(cfg: TrainConfig, group: G, stop: Arc<AtomicBool>) -> Result<Self> {
        let world_size = group.world_size();
        cfg.validate(world_size)?;
        fs::create_dir_all(&cfg.exp_dir)?;

        let model = VicregModel::new(cfg.input_dim, cfg.embedding, &cfg.mlp)?;
        let layout = model.layout()?;

        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut params = model.init_params(&mut rng)?;
        let grads = vec![0.0; model.size()];

        let mut lars = Lars::new(
            0.0,
            cfg.weight_decay,
            Some(exclude_one_dim),
            Some(exclude_one_dim),
            layout.len(),
        );

        let local_batch = cfg.batch_size / world_size;
        let sampler = PairSampler::new(
            cfg.num_samples,
            cfg.input_dim,
            cfg.noise_std,
            local_batch,
            cfg.seed.wrapping_add(group.rank() as u64),
        )?;

        let schedule = LrSchedule::new(
            cfg.base_lr,
            cfg.batch_size,
            sampler.steps_per_epoch(),
            cfg.epochs,
        );

        let stats = StatsLogger::append(
            &cfg.stats_path(),
            Duration::from_secs(cfg.log_freq_secs),
        )?;

        let start_epoch = match checkpoint::load(&cfg.checkpoint_path(), &layout)? {
            Some(snapshot) => {
                info!(epoch = snapshot.epoch; "resuming from checkpoint");
                params = snapshot.params;
                lars.load_momentum(&layout, snapshot.momentum)?;
                snapshot.epoch
            }
            None => 0,
        };

        let loss = VicregLoss::new(cfg.sim_coeff, cfg.std_coeff, cfg.cov_coeff);

        Ok(Self {
            cfg,
            model,
            layout,
            params,
            grads,
            lars,
            schedule,
            loss,
            gather: FullGather::new(group),
            sampler,
            stats,
            stop,
            start_epoch,
        })
    }

    /// The state the run started in, after the checkpoint consultation.
    pub fn start_state(&self) -> StartState {
        if self.start_epoch == 0 {
            StartState::Fresh
        } else {
            StartState::Resumed {
                epoch: self.start_epoch,
            }
        }
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    pub fn momentum_table(&self) -> &[Option<Vec<f32>>] {
        self.lars.momentum_table()
    }

    /// Runs one step: forward both views, gather the embeddings across the
    /// group, take the loss over the global batch, route the gradients
    /// back through the gather, then update.
    ///
    /// # Errors
    /// Returns `TrainErr` on any shape or transport failure; both are
    /// fatal to the run.
    pub fn step_once(&mut self, epoch: usize, step_in_epoch: usize) -> Result<StepOutcome> {
        let global_step = epoch * self.sampler.steps_per_epoch() + step_in_epoch;
        let world_size = self.gather.group().world_size();

        self.grads.fill(0.0);

        let (view_a, view_b) = self.sampler.batch(step_in_epoch);
        let (za, zb) = self.model.forward_pair(&self.params, view_a, view_b)?;

        let x = concat_batch(&self.gather.forward(za.view())?)?;
        let y = concat_batch(&self.gather.forward(zb.view())?)?;

        let (terms, dx, dy) = self.loss.evaluate_with_grad(x.view(), y.view())?;
        let lr = self.schedule.apply(global_step, &mut self.lars);

        if self.cfg.guard_non_finite && !terms.total.is_finite() {
            warn!(epoch = epoch, step = global_step; "non-finite loss, skipping the optimizer step");
            return Ok(StepOutcome::SkippedNonFinite);
        }

        let d_a = self.gather.backward(&split_batch(&dx, world_size)?)?;
        let d_b = self.gather.backward(&split_batch(&dy, world_size)?)?;
        self.model
            .backward_pair(&self.params, &mut self.grads, d_a, d_b)?;

        // Each rank's parameter gradients come from its own shard's
        // activations; averaging them across the group (which also cancels
        // the world-size factor the gather's summed backward introduced)
        // leaves every rank holding the exact global-batch gradient.
        if world_size > 1 {
            self.gather.group().all_reduce_sum(&mut self.grads)?;
            let scale = 1.0 / world_size as f32;
            for g in self.grads.iter_mut() {
                *g *= scale;
            }
        }

        if self.cfg.guard_non_finite && !self.grads.iter().all(|g| g.is_finite()) {
            warn!(epoch = epoch, step = global_step; "non-finite gradient, skipping the optimizer step");
            return Ok(StepOutcome::SkippedNonFinite);
        }

        self.lars.step(&self.layout, &mut self.params, &self.grads)?;

        debug!(epoch = epoch, step = global_step, loss = terms.total, lr = lr; "step");
        Ok(StepOutcome::Stepped { terms, lr })
    }

    /// Runs from the start epoch to completion, checkpointing at every
    /// epoch boundary and on cancellation.
    ///
    /// # Errors
    /// Returns `TrainErr` on any fatal failure; the last written
    /// checkpoint remains the recovery point.
    pub fn run(mut self) -> Result<RunOutcome> {
        let steps_per_epoch = self.sampler.steps_per_epoch();

        for epoch in self.start_epoch..self.cfg.epochs {
            for step_in_epoch in 0..steps_per_epoch {
                if self.stop.load(Ordering::Relaxed) {
                    info!(epoch = epoch; "cancellation observed, checkpointing");
                    self.save_checkpoint(epoch)?;
                    return Ok(RunOutcome::Interrupted { epoch });
                }

                let outcome = self.step_once(epoch, step_in_epoch)?;

                if let StepOutcome::Stepped { terms, lr } = outcome {
                    let global_step = epoch * steps_per_epoch + step_in_epoch;
                    self.stats
                        .maybe_log(epoch, global_step, terms.total, lr)?;
                }
            }

            self.save_checkpoint(epoch + 1)?;
            info!(epoch = epoch; "epoch complete");
        }

        self.export_backbone()?;
        Ok(RunOutcome::Completed)
    }

    /// Persists `{epoch, parameters, optimizer state}` atomically.
    ///
    /// # Errors
    /// Returns `TrainErr` on I/O failure.
    pub fn save_checkpoint(&self, epoch: usize) -> Result<()> {
        let snapshot = Snapshot {
            epoch,
            params: self.params.clone(),
            momentum: self.lars.momentum_table().to_vec(),
        };

        checkpoint::save(&self.cfg.checkpoint_path(), &self.layout, &snapshot)
    }

    fn export_backbone(&self) -> Result<()> {
        let backbone_specs: Vec<_> = self
            .layout
            .specs()
            .iter()
            .filter(|spec| spec.range().end <= self.model.backbone_len())
            .cloned()
            .collect();

        checkpoint::export_params(&self.cfg.backbone_path(), &backbone_specs, &self.params)
    }
}
