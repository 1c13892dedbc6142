use std::time::{Duration, Instant};

/// Measures the time between consecutive ticks, used to log device round trips.
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let diff = now - self.last;
        self.last = now;
        diff
    }

    /// Logs the elapsed milliseconds at debug level.
    pub fn tick_debug(&mut self, msg: &str) -> Duration {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff.as_secs_f64() * 1e3);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}
