use std::{
    env,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context;
use collective::LocalGroup;
use log::info;
use tokio::{signal, task};

use vicreg_pretraining::{RunOutcome, TrainConfig, Trainer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cfg = match env::args().nth(1) {
        Some(path) => TrainConfig::from_file(Path::new(&path))
            .with_context(|| format!("loading config from {path}"))?,
        None => TrainConfig::default(),
    };
    info!("experiment directory {}", cfg.exp_dir.display());

    let stop = Arc::new(AtomicBool::new(false));
    let trainer = Trainer::new(cfg, LocalGroup, Arc::clone(&stop))?;
    info!("starting in state {:?}", trainer.start_state());

    // The loop is CPU-bound and synchronous; run it on the blocking pool
    // and keep this task free to observe the cancellation signal.
    let mut handle = task::spawn_blocking(move || trainer.run());

    let outcome = tokio::select! {
        res = &mut handle => res??,
        _ = signal::ctrl_c() => {
            info!("interrupt received, checkpointing at the next step boundary");
            stop.store(true, Ordering::Relaxed);
            handle.await??
        }
    };

    match outcome {
        RunOutcome::Completed => info!("training complete"),
        RunOutcome::Interrupted { epoch } => {
            info!("interrupted; checkpoint holds epoch {epoch}")
        }
    }

    Ok(())
}
