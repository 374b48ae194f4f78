//! Wall-clock timing for pipeline steps.

use std::time::{Duration, Instant};

use tracing::info;

/// Logs how long a step took when finished.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(self) -> Duration {
        let elapsed = self.elapsed();
        info!("{} time: {:.2} seconds", self.label, elapsed.as_secs_f64());
        elapsed
    }
}
