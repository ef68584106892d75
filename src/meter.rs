use std::time::{Duration, Instant};

/// Cumulative throughput over one executor run.
///
/// Anchored at stream start; the rate is always delivered-frames divided by
/// total elapsed time, recomputed on every call rather than cached or
/// windowed.
pub struct Throughput {
    started: Instant,
    delivered: u64,
}

impl Throughput {
    /// Start the clock.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            delivered: 0,
        }
    }

    /// Count one delivered frame and return the current rate.
    pub fn record(&mut self) -> f32 {
        self.delivered += 1;
        self.fps()
    }

    pub fn fps(&self) -> f32 {
        self.delivered as f32 / self.elapsed().as_secs_f32().max(f32::EPSILON)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
