//! # Module: pid
//!
//! ## Responsibility
//! A single closed-loop PID controller: trapezoidal integration, clamped
//! output, back-calculation anti-windup, filtered derivative, and an
//! oscillation-driven circuit breaker.
//!
//! Modeled on a `self_tune::controller::PidState` (same
//! kp/ki/kd-gains-plus-integral-plus-prev-error shape), generalized with
//! trapezoidal integration, derivative filtering, back-calculation
//! anti-windup and a circuit breaker.
//!
//! ## Guarantees
//! - `compute()`'s output always lies in `[output_min, output_max]`.
//! - `|integral| <= integral_limit` immediately after any `compute()`.
//! - `compute()` is not reentrant (single exclusive lock at the call site —
//!   this type itself is `&mut self`, callers serialize access).
//!
//! ## NOT Responsible For
//! Translating a PID output into a `ConfigPatch` — that's the Adaptive
//! Controller's job.

use std::time::Instant;

use crate::error::{PhoenixError, PhoenixResult};

mod breaker;
pub use breaker::{BreakerConfig, OscillationDetector};

/// Configuration accepted at construction and via the `set_*`/`configure_*`
/// operations.
#[derive(Debug, Clone)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub setpoint: f64,
    pub output_min: f64,
    pub output_max: f64,
    pub integral_limit: f64,
    pub anti_windup_enabled: bool,
    pub anti_windup_gain: f64,
    /// `α` in `(0, 1]`; `1.0` disables filtering (pure current derivative).
    pub derivative_filter_coeff: f64,
    pub circuit_breaker_enabled: bool,
    pub breaker: breaker::BreakerConfig,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            setpoint: 0.0,
            output_min: -1.0,
            output_max: 1.0,
            integral_limit: 100.0,
            anti_windup_enabled: true,
            anti_windup_gain: 1.0,
            derivative_filter_coeff: 1.0,
            circuit_breaker_enabled: false,
            breaker: breaker::BreakerConfig::default(),
        }
    }
}

/// Decomposed terms from the most recent `compute()` call, exported as
/// `phoenix.pid.*` self-metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PidTerms {
    pub error: f64,
    pub p: f64,
    pub i: f64,
    pub d: f64,
    pub raw_output: f64,
    pub output: f64,
    pub breaker_tripped: bool,
}

/// A single PID loop. Owns its `ControllerState` exclusively; never shared
/// by reference across threads.
pub struct PidController {
    cfg: PidConfig,
    integral: f64,
    last_error: f64,
    prev_error: f64,
    last_time: Option<Instant>,
    last_dt: f64,
    breaker: OscillationDetector,
    override_until: Option<Instant>,
    last_terms: PidTerms,
}

impl PidController {
    /// Construct a controller. Rejects negative gains: invalid gains fail
    /// at construction rather than producing silently wrong output later.
    pub fn new(cfg: PidConfig) -> PhoenixResult<Self> {
        if cfg.kp < 0.0 || cfg.ki < 0.0 || cfg.kd < 0.0 {
            return Err(PhoenixError::ConstraintViolated(
                "PID gains must be non-negative".into(),
            ));
        }
        if cfg.output_min >= cfg.output_max {
            return Err(PhoenixError::ConstraintViolated(format!(
                "output_min ({}) must be < output_max ({})",
                cfg.output_min, cfg.output_max
            )));
        }
        let breaker = OscillationDetector::new(cfg.breaker.clone());
        // derivative_filter_coeff outside (0,1] is clamped, not rejected,
        // degrades gracefully rather than rejecting the whole config.
        let mut cfg = cfg;
        cfg.derivative_filter_coeff = cfg.derivative_filter_coeff.clamp(f64::EPSILON, 1.0);

        Ok(Self {
            cfg,
            integral: 0.0,
            last_error: 0.0,
            prev_error: 0.0,
            last_time: None,
            last_dt: 1.0,
            breaker,
            override_until: None,
            last_terms: PidTerms::default(),
        })
    }

    pub fn set_tunings(&mut self, kp: f64, ki: f64, kd: f64) -> PhoenixResult<()> {
        if kp < 0.0 || ki < 0.0 || kd < 0.0 {
            return Err(PhoenixError::ConstraintViolated(
                "PID gains must be non-negative".into(),
            ));
        }
        self.cfg.kp = kp;
        self.cfg.ki = ki;
        self.cfg.kd = kd;
        Ok(())
    }

    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.cfg.setpoint = setpoint;
    }

    pub fn set_output_limits(&mut self, min: f64, max: f64) -> PhoenixResult<()> {
        if min >= max {
            return Err(PhoenixError::ConstraintViolated(format!(
                "output_min ({min}) must be < output_max ({max})"
            )));
        }
        self.cfg.output_min = min;
        self.cfg.output_max = max;
        Ok(())
    }

    pub fn set_integral_limit(&mut self, limit: f64) {
        self.cfg.integral_limit = limit.abs();
        self.integral = self.integral.clamp(-self.cfg.integral_limit, self.cfg.integral_limit);
    }

    pub fn reset_integral(&mut self) {
        self.integral = 0.0;
    }

    pub fn configure_anti_windup(&mut self, enabled: bool, gain: f64) {
        self.cfg.anti_windup_enabled = enabled;
        self.cfg.anti_windup_gain = gain;
    }

    /// Clamped to `(0, 1]`, degrading gracefully rather than rejecting.
    pub fn set_derivative_filter_coefficient(&mut self, alpha: f64) {
        self.cfg.derivative_filter_coeff = alpha.clamp(f64::EPSILON, 1.0);
    }

    pub fn enable_circuit_breaker(&mut self, enabled: bool) {
        self.cfg.circuit_breaker_enabled = enabled;
    }

    pub fn configure_circuit_breaker(&mut self, breaker: breaker::BreakerConfig) {
        self.cfg.breaker = breaker.clone();
        self.breaker.reconfigure(breaker);
    }

    /// Suspend the circuit breaker's safe-mode output for `duration`,
    /// letting the normal PID law run even while the breaker is tripped.
    pub fn temporary_override(&mut self, duration: std::time::Duration) {
        self.override_until = Some(Instant::now() + duration);
    }

    pub fn last_terms(&self) -> PidTerms {
        self.last_terms
    }

    pub fn circuit_breaker_tripped(&self) -> bool {
        self.breaker.is_tripped()
    }

    /// Compute the next control output for `measurement`: trapezoidal
    /// integration, back-calculation anti-windup, filtered derivative, then
    /// the circuit breaker's override if tripped.
    pub fn compute(&mut self, measurement: f64) -> f64 {
        let now = Instant::now();
        let dt = match self.last_time {
            Some(t) => {
                let elapsed = now.duration_since(t).as_secs_f64();
                if elapsed > 0.0 {
                    elapsed
                } else {
                    self.last_dt // reuse last_dt on dt <= 0
                }
            }
            None => self.last_dt,
        };
        self.last_time = Some(now);
        self.last_dt = dt;

        let error = self.cfg.setpoint - measurement;

        let p = self.cfg.kp * error;

        // Trapezoidal integration.
        self.integral += (error + self.last_error) / 2.0 * dt;
        self.integral = self
            .integral
            .clamp(-self.cfg.integral_limit, self.cfg.integral_limit);
        let i = self.cfg.ki * self.integral;

        let d_now = if dt > 0.0 {
            (error - self.last_error) / dt
        } else {
            0.0
        };
        let d_prev = if self.last_dt > 0.0 {
            (self.last_error - self.prev_error) / self.last_dt
        } else {
            0.0
        };
        let alpha = self.cfg.derivative_filter_coeff;
        let d_filtered = alpha * d_now + (1.0 - alpha) * d_prev;
        let d = self.cfg.kd * d_filtered;

        self.prev_error = self.last_error;
        self.last_error = error;

        let raw_output = p + i + d;
        let mut output = raw_output.clamp(self.cfg.output_min, self.cfg.output_max);

        // Back-calculation anti-windup: if clamped, pull the integral back
        // toward what would have produced the clamped output.
        if self.cfg.anti_windup_enabled && self.cfg.ki != 0.0 && (output - raw_output).abs() > f64::EPSILON {
            self.integral += (output - raw_output) * self.cfg.anti_windup_gain / self.cfg.ki;
            self.integral = self
                .integral
                .clamp(-self.cfg.integral_limit, self.cfg.integral_limit);
        }

        let mut breaker_tripped = false;
        if self.cfg.circuit_breaker_enabled {
            self.breaker.observe(output, now);
            let under_override = self.override_until.map(|t| now < t).unwrap_or(false);
            if self.breaker.is_tripped() && !under_override {
                breaker_tripped = true;
                output = (0.1 * self.cfg.kp * error).clamp(self.cfg.output_min, self.cfg.output_max);
                self.integral = 0.0;
            }
        }

        self.last_terms = PidTerms {
            error,
            p,
            i,
            d,
            raw_output,
            output,
            breaker_tripped,
        };

        output
    }
}


#[cfg(test)]
mod proptests {
    use super::tests::cfg as build_cfg;
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn output_stays_within_configured_limits(
            kp in 0.0f64..50.0,
            ki in 0.0f64..50.0,
            kd in 0.0f64..50.0,
            measurements in proptest::collection::vec(-1000.0f64..1000.0, 1..20),
        ) {
            let mut pid = PidController::new(build_cfg(kp, ki, kd, -10.0, 10.0)).unwrap();
            for m in measurements {
                let out = pid.compute(m);
                prop_assert!(out >= -10.0 - 1e-9 && out <= 10.0 + 1e-9);
            }
        }
    }
}
