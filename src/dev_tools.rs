use std::time::{Duration, Instant};

/// Measures wall time between checkpoints and reports it through `log::debug!`.
pub struct Timer {
    last: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Logs `msg` with the time elapsed since the previous call (or creation),
    /// resets the checkpoint and returns the elapsed time.
    pub fn log<T: std::fmt::Display>(&mut self, msg: T) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        self.last = now;
        log::debug!("{msg} ({:.3}s)", elapsed.as_secs_f64());
        elapsed
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
