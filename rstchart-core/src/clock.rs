//! Simulated time.

use crate::error::ClockError;

/// A manually advanced, monotonic clock.
///
/// Time only moves when [`Clock::advance`] is called; nothing here reads the
/// wall clock. Real-time pacing is the runtime's job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Clock {
    time: f64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time in seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Moves time forward by `delta` seconds and returns the new time.
    ///
    /// Negative or non-finite deltas are rejected and leave the time unchanged.
    pub fn advance(&mut self, delta: f64) -> Result<f64, ClockError> {
        if !delta.is_finite() {
            return Err(ClockError::NonFiniteDelta { delta });
        }
        if delta < 0.0 {
            return Err(ClockError::NegativeDelta { delta });
        }
        self.time += delta;
        Ok(self.time)
    }

    /// Sets the time when resuming from a checkpoint.
    pub(crate) fn restore(&mut self, time: f64) {
        self.time = time;
    }
}
