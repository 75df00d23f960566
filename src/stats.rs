use std::{
    fs::OpenOptions,
    io::{self, BufWriter, Write},
    path::Path,
    time::{Duration, Instant},
};

use serde::Serialize;

/// One observational record per emission. Nothing in the core reads these
/// back.
#[derive(Debug, Serialize)]
struct StatsRecord {
    epoch: usize,
    step: usize,
    loss: f32,
    elapsed_time: u64,
    lr: f32,
}

/// Append-only line-delimited JSON stats, throttled to one record per
/// interval rather than a fixed step cadence.
pub struct StatsLogger {
    out: BufWriter<std::fs::File>,
    every: Duration,
    start: Instant,
    last_logging: Instant,
}

impl StatsLogger {
    /// Opens (or creates) the stats file in append mode.
    ///
    /// # Errors
    /// Returns `io::Error` when the file cannot be opened.
    pub fn append(path: &Path, every: Duration) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        let now = Instant::now();

        Ok(Self {
            out: BufWriter::new(file),
            every,
            start: now,
            last_logging: now,
        })
    }

    /// Emits a record if the interval has elapsed since the last one.
    ///
    /// # Returns
    /// Whether a record was written.
    ///
    /// # Errors
    /// Returns `io::Error` on write failure.
    pub fn maybe_log(&mut self, epoch: usize, step: usize, loss: f32, lr: f32) -> io::Result<bool> {
        let now = Instant::now();
        if now.duration_since(self.last_logging) < self.every {
            return Ok(false);
        }

        let record = StatsRecord {
            epoch,
            step,
            loss,
            elapsed_time: self.start.elapsed().as_secs(),
            lr,
        };

        serde_json::to_writer(&mut self.out, &record).map_err(io::Error::other)?;
        writeln!(self.out)?;
        self.out.flush()?;

        self.last_logging = now;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::{env, fs};

    use super::*;

    #[test]
    fn records_are_throttled_by_the_interval() {
        let dir = env::temp_dir().join("vicreg-stats-tests");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stats.jsonl");
        let _ = fs::remove_file(&path);

        let mut logger = StatsLogger::append(&path, Duration::from_secs(3600)).unwrap();

        // The interval has not elapsed since construction.
        assert!(!logger.maybe_log(0, 0, 1.0, 0.1).unwrap());
        assert!(!logger.maybe_log(0, 1, 2.0, 0.1).unwrap());

        let mut eager = StatsLogger::append(&path, Duration::ZERO).unwrap();
        assert!(eager.maybe_log(1, 5, 3.5, 0.2).unwrap());

        let contents = fs::read_to_string(&path).unwrap();
        let line = contents.lines().last().unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["epoch"], 1);
        assert_eq!(value["step"], 5);
        assert!((value["lr"].as_f64().unwrap() - 0.2).abs() < 1e-6);

        fs::remove_file(&path).unwrap();
    }
}
