//! Smoothed RTT estimator driving retransmission timeouts.

use std::time::Duration;

const ALPHA: f64 = 0.125;
const MIN_RTO: Duration = Duration::from_millis(200);
const MAX_RTO: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    smoothed: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self { smoothed: MIN_RTO }
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in a fresh round-trip sample using an exponentially weighted
    /// moving average.
    pub fn sample(&mut self, measured: Duration) {
        let smoothed_secs = self.smoothed.as_secs_f64();
        let measured_secs = measured.as_secs_f64();
        let next = smoothed_secs + ALPHA * (measured_secs - smoothed_secs);
        self.smoothed = Duration::from_secs_f64(next.max(0.0));
    }

    /// Current retransmission timeout: twice the smoothed RTT, clamped to
    /// [200ms, 2s].
    pub fn rto(&self) -> Duration {
        self.smoothed.mul_f64(2.0).clamp(MIN_RTO, MAX_RTO)
    }
}
