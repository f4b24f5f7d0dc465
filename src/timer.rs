//! Elapsed-time helper for latency measurement.

use tokio::time::Instant;

/// A stopwatch that can be created running or idle.
///
/// Uses the tokio clock so paused-time tests see deterministic values.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started_at: Option<Instant>,
    stopped: bool,
}

impl Stopwatch {
    /// Create a stopwatch that is already running.
    pub fn started() -> Self {
        Self {
            started_at: Some(Instant::now()),
            stopped: false,
        }
    }

    /// Create a stopwatch that has not started yet.
    pub fn idle() -> Self {
        Self {
            started_at: None,
            stopped: false,
        }
    }

    /// Start the stopwatch unless it is already running.
    pub fn start_if_not_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    /// Seconds since start, or 0 if never started.
    pub fn time(&self) -> f64 {
        self.started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Stop and return elapsed seconds.
    ///
    /// Returns `None` if the stopwatch never started or was already stopped,
    /// so callers can record a "first event" latency exactly once.
    pub fn stop(&mut self) -> Option<f64> {
        if self.stopped {
            return None;
        }
        let elapsed = self.started_at.map(|t| t.elapsed().as_secs_f64())?;
        self.stopped = true;
        Some(elapsed)
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::started()
    }
}
