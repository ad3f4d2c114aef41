//! Run timing.

use std::time::{Duration, Instant};

use tracing::info;

/// Timer state of one training run, passed explicitly to each stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    started: Instant,
    last_checkpoint: Instant,
}

impl RunContext {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_checkpoint: now,
        }
    }

    /// Logs the minutes spent since the previous checkpoint and starts a new interval.
    pub fn checkpoint(&mut self, stage: &str) -> Duration {
        let now = Instant::now();
        let interval = now - self.last_checkpoint;
        self.last_checkpoint = now;
        info!(
            stage,
            minutes = format_args!("{:.2}", interval.as_secs_f64() / 60.0),
            "time since last checkpoint"
        );
        interval
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_hours(&self) -> f64 {
        self.elapsed().as_secs_f64() / 3600.0
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}
