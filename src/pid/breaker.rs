//! Oscillation-driven circuit breaker: a ring buffer of recent PID outputs
//! and timestamps, tripped when zero-crossing density is high and signal
//! magnitude is non-trivial. See the glossary entry
//! "Circuit breaker".
//!
//! Grounded on `self_tune::anomaly::ZScoreDetector`'s fixed-capacity
//! ring-buffer-of-samples shape, repurposed from statistical outlier
//! detection to zero-crossing counting.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Number of recent outputs to consider for the zero-crossing ratio.
    pub window: usize,
    /// Trip when the fraction of zero-crossings in the window reaches this.
    pub threshold_percent: f64,
    /// Minimum observed duration (wall-clock) before tripping is considered.
    pub min_duration: Duration,
    /// Minimum |output| magnitude required to count a sample as significant.
    pub min_signal_magnitude: f64,
    /// How long a trip lasts before auto-reset if no further oscillation.
    pub reset_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 20,
            threshold_percent: 60.0,
            min_duration: Duration::from_secs(2),
            min_signal_magnitude: 0.0,
            reset_duration: Duration::from_secs(30),
        }
    }
}

struct Sample {
    value: f64,
    at: Instant,
}

pub struct OscillationDetector {
    cfg: BreakerConfig,
    samples: Vec<Sample>,
    tripped: bool,
    tripped_at: Option<Instant>,
}

impl OscillationDetector {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            samples: Vec::new(),
            tripped: false,
            tripped_at: None,
        }
    }

    pub fn reconfigure(&mut self, cfg: BreakerConfig) {
        self.cfg = cfg;
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    /// Feed one new PID output sample and update trip state.
    pub fn observe(&mut self, value: f64, now: Instant) {
        self.samples.push(Sample { value, at: now });
        if self.samples.len() > self.cfg.window {
            self.samples.remove(0);
        }

        if self.tripped {
            if let Some(tripped_at) = self.tripped_at {
                if now.duration_since(tripped_at) >= self.cfg.reset_duration {
                    self.tripped = false;
                    self.tripped_at = None;
                }
            }
            return;
        }

        if self.samples.len() < 2 {
            return;
        }

        let span = now.duration_since(self.samples[0].at);
        if span < self.cfg.min_duration {
            return;
        }

        let significant: Vec<&Sample> = self
            .samples
            .iter()
            .filter(|s| s.value.abs() >= self.cfg.min_signal_magnitude)
            .collect();
        if significant.len() < 2 {
            return;
        }

        let mut crossings = 0usize;
        for w in significant.windows(2) {
            if (w[0].value > 0.0) != (w[1].value > 0.0) {
                crossings += 1;
            }
        }
        let ratio = crossings as f64 / (significant.len() - 1) as f64 * 100.0;

        if ratio >= self.cfg.threshold_percent {
            self.tripped = true;
            self.tripped_at = Some(now);
        }
    }
}
