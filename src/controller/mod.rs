//! # Module: controller
//!
//! ## Responsibility
//! The Adaptive Controller Processor: for each configured KPI, read its
//! latest value, compute an adjustment via PID (or the Bayesian fallback
//! once PID stalls), translate it into `ConfigPatch`es, and submit them to
//! Governance.
//!
//! Modeled on a `self_tune::controller::Controller::observe`
//! scan-cooldown-apply-or-skip shape, generalized from "one parameter per
//! telemetry field" to "one controller per KPI emitting multiple output
//! patches", and on `self_tune::anomaly`'s degradation-counter style for
//! stall tracking.
//!
//! ## NOT Responsible For
//! Deciding whether a submitted patch is actually applied — that is
//! entirely Governance's call.

use tracing::{info, warn};

use crate::bayes::{BayesianOptimizer, Bounds, GpConfig};
use crate::error::{PhoenixError, PhoenixResult};
use crate::governance::Governance;
use crate::model::patch::{ConfigPatch, PatchValue, Severity};
use crate::pid::{PidConfig, PidController};
use crate::safety::SafetyLevel;

#[derive(Debug, Clone)]
pub struct OutputPatchSpec {
    pub target: String,
    pub parameter_path: String,
    pub change_scale_factor: f64,
    pub min_value: f64,
    pub max_value: f64,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub name: String,
    pub enabled: bool,
    pub kpi_metric_name: String,
    pub kpi_target: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Percent of `|target|` within which changes are suppressed (deadband).
    pub hysteresis_percent: f64,
    pub integral_windup_limit: f64,
    pub use_bayesian: bool,
    pub stall_threshold: u32,
    /// How many ticks to stay in Bayesian mode before re-attempting PID.
    pub bayesian_window_ticks: u32,
    pub output_patches: Vec<OutputPatchSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerMode {
    Idle,
    Pid,
    Bayesian,
    Suspended,
}

/// One KPI's closed control loop: owns its PID controller, its Bayesian
/// fallback, and its own stall/mode state. Never shared by reference
/// across threads; each controller runs on the control loop that owns it.
pub struct AdaptiveController {
    cfg: ControllerConfig,
    pid: PidController,
    bayes: BayesianOptimizer,
    mode: ControllerMode,
    stall_count: u32,
    bayesian_ticks_remaining: u32,
    current_values: Vec<f64>,
    last_error: Option<f64>,
}

impl AdaptiveController {
    pub fn new(cfg: ControllerConfig) -> PhoenixResult<Self> {
        let pid_cfg = PidConfig {
            kp: cfg.kp,
            ki: cfg.ki,
            kd: cfg.kd,
            setpoint: cfg.kpi_target,
            output_min: -1.0,
            output_max: 1.0,
            integral_limit: cfg.integral_windup_limit,
            ..PidConfig::default()
        };
        let pid = PidController::new(pid_cfg)?;

        let bounds = Bounds(cfg.output_patches.iter().map(|p| (p.min_value, p.max_value)).collect());
        let bayes = BayesianOptimizer::new(bounds, GpConfig::default());

        Ok(Self {
            current_values: cfg.output_patches.iter().map(|p| (p.min_value + p.max_value) / 2.0).collect::<Vec<_>>(),
            mode: if cfg.enabled { ControllerMode::Idle } else { ControllerMode::Suspended },
            cfg,
            pid,
            bayes,
            stall_count: 0,
            bayesian_ticks_remaining: 0,
            last_error: None,
        })
    }

    pub fn mode(&self) -> ControllerMode {
        self.mode
    }

    /// Proxy for this controller's current influence on active time-series
    /// volume: the committed value of its first output patch (conventionally
    /// a cardinality-shaping parameter such as `topk.k_value`). Drives the
    /// control file's `optimization_profile` hysteresis; `None` if this
    /// controller has no output patches configured.
    pub fn effective_output_magnitude(&self) -> Option<f64> {
        self.current_values.first().copied()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.mode = if enabled { ControllerMode::Idle } else { ControllerMode::Suspended };
    }

    fn severity_for(level: SafetyLevel) -> Severity {
        match level {
            SafetyLevel::Normal => Severity::Normal,
            SafetyLevel::Warning => Severity::High,
            SafetyLevel::Critical | SafetyLevel::Emergency => Severity::Emergency,
        }
    }

    /// Run one control tick. `kpi_value` is the latest observed datapoint
    /// for `kpi_metric_name`, if the pipeline emitted one this period.
    /// Returns the patches to submit; an empty vec means "no adjustment
    /// this tick" (disabled, suspended, missing KPI, or within deadband).
    pub fn tick(&mut self, kpi_value: Option<f64>, safety_level: SafetyLevel) -> Vec<ConfigPatch> {
        if !self.cfg.enabled {
            self.mode = ControllerMode::Suspended;
            return Vec::new();
        }
        if safety_level == SafetyLevel::Emergency {
            self.mode = ControllerMode::Suspended;
            return Vec::new();
        }

        let Some(measured) = kpi_value else {
            warn!(controller = %self.cfg.name, "missing KPI this tick, skipping");
            return Vec::new();
        };

        let error = self.cfg.kpi_target - measured;
        let denom = self.cfg.kpi_target.abs().max(f64::EPSILON);
        if (error.abs() / denom) < (self.cfg.hysteresis_percent / 100.0) {
            self.last_error = Some(error);
            return Vec::new(); // within deadband
        }

        if self.mode == ControllerMode::Idle {
            self.mode = ControllerMode::Pid;
        }

        let delta = match self.mode {
            ControllerMode::Bayesian => {
                self.bayesian_ticks_remaining = self.bayesian_ticks_remaining.saturating_sub(1);
                self.bayes.add_sample(vec![measured], error.abs());
                let suggestion = self.bayes.suggest();
                if self.bayesian_ticks_remaining == 0 {
                    self.mode = ControllerMode::Pid;
                    self.stall_count = 0;
                }
                suggestion.first().copied().unwrap_or(0.0)
            }
            _ => self.pid.compute(measured),
        };

        let improved = self
            .last_error
            .map(|prev| delta.signum() == (prev - error).signum() || delta == 0.0)
            .unwrap_or(true);
        if improved {
            self.stall_count = 0;
        } else {
            self.stall_count += 1;
        }
        self.last_error = Some(error);

        if self.stall_count >= self.cfg.stall_threshold && self.cfg.use_bayesian && self.mode != ControllerMode::Bayesian {
            info!(controller = %self.cfg.name, "PID stalled, switching to Bayesian fallback");
            self.mode = ControllerMode::Bayesian;
            self.bayesian_ticks_remaining = self.cfg.bayesian_window_ticks.max(1);
        }

        let severity = Self::severity_for(safety_level);
        let reason = format!("{}: error={error:.4}, delta={delta:.4}", self.cfg.name);

        // Candidate values only: `current_values` isn't advanced here.
        // Governance may still reject (rate limit, cooldown, staleness), so
        // the committed baseline only moves once `tick_and_submit` sees
        // `governance.apply` return `Ok`.
        self.cfg
            .output_patches
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let current = self.current_values[i];
                let new_value = (current + spec.change_scale_factor * delta).clamp(spec.min_value, spec.max_value);
                ConfigPatch::new(
                    spec.target.clone(),
                    spec.parameter_path.clone(),
                    PatchValue::Float(new_value),
                    reason.clone(),
                    severity,
                    "adaptive-controller",
                    60,
                )
            })
            .collect()
    }

    /// Run `tick`, then submit every resulting patch to `governance`,
    /// logging (but not retrying) rejections. `current_values[i]` only
    /// advances to a patch's candidate value once governance actually
    /// applies it — a rejection leaves the next tick's delta computed off
    /// the last value that was truly accepted.
    ///
    /// Returns `Err(PhoenixError::Safety)` when the safety level refused
    /// this tick outright (suspended under Emergency); per-patch governance
    /// rejections are logged and otherwise non-fatal.
    pub fn tick_and_submit(
        &mut self,
        kpi_value: Option<f64>,
        safety_level: SafetyLevel,
        governance: &Governance,
    ) -> PhoenixResult<()> {
        let patches = self.tick(kpi_value, safety_level);
        if safety_level == SafetyLevel::Emergency {
            return Err(PhoenixError::Safety {
                level: "emergency".into(),
                reason: format!("{} suspended: safety level is emergency", self.cfg.name),
            });
        }

        for (i, patch) in patches.into_iter().enumerate() {
            let candidate = match patch.new_value {
                PatchValue::Float(v) => v,
                _ => self.current_values[i],
            };
            match governance.apply(patch) {
                Ok(()) => self.current_values[i] = candidate,
                Err(e) => {
                    warn!(controller = %self.cfg.name, error = %e, "patch rejected by governance, current value unchanged");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ControllerConfig {
        ControllerConfig {
            name: "throughput-controller".into(),
            enabled: true,
            kpi_metric_name: "phoenix.pipeline.coverage_ratio".into(),
            kpi_target: 0.95,
            kp: 2.0,
            ki: 0.0,
            kd: 0.0,
            hysteresis_percent: 1.0,
            integral_windup_limit: 10.0,
            use_bayesian: true,
            stall_threshold: 3,
            bayesian_window_ticks: 2,
            output_patches: vec![OutputPatchSpec {
                target: "metric-pipeline".into(),
                parameter_path: "topk.k_value".into(),
                change_scale_factor: 10.0,
                min_value: 1.0,
                max_value: 500.0,
            }],
        }
    }

    #[test]
    fn disabled_controller_emits_no_patches() {
        let mut c = AdaptiveController::new(ControllerConfig {
            enabled: false,
            ..cfg()
        })
        .unwrap();
        assert!(c.tick(Some(0.5), SafetyLevel::Normal).is_empty());
        assert_eq!(c.mode(), ControllerMode::Suspended);
    }

    #[test]
    fn missing_kpi_skips_tick() {
        let mut c = AdaptiveController::new(cfg()).unwrap();
        assert!(c.tick(None, SafetyLevel::Normal).is_empty());
    }

    #[test]
    fn within_deadband_emits_no_patch() {
        let mut c = AdaptiveController::new(cfg()).unwrap();
        assert!(c.tick(Some(0.9499), SafetyLevel::Normal).is_empty());
    }

    #[test]
    fn outside_deadband_emits_a_patch_per_output() {
        let mut c = AdaptiveController::new(cfg()).unwrap();
        let patches = c.tick(Some(0.5), SafetyLevel::Normal);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].target_processor, "metric-pipeline");
    }

    #[test]
    fn emergency_safety_level_suspends_controller() {
        let mut c = AdaptiveController::new(cfg()).unwrap();
        assert!(c.tick(Some(0.5), SafetyLevel::Emergency).is_empty());
        assert_eq!(c.mode(), ControllerMode::Suspended);
    }

    #[test]
    fn warning_safety_level_escalates_patch_severity() {
        let mut c = AdaptiveController::new(cfg()).unwrap();
        let patches = c.tick(Some(0.5), SafetyLevel::Warning);
        assert_eq!(patches[0].severity, Severity::High);
    }

    #[test]
    fn repeated_stall_switches_to_bayesian_mode() {
        let mut c = AdaptiveController::new(cfg()).unwrap();
        // Oscillate the measured value so direction never matches "toward target",
        // forcing the stall counter past the threshold.
        for _ in 0..10 {
            c.tick(Some(0.5), SafetyLevel::Normal);
            c.tick(Some(1.4), SafetyLevel::Normal);
        }
        assert_eq!(c.mode(), ControllerMode::Bayesian);
    }

    #[test]
    fn tick_and_submit_does_not_panic_without_a_registered_target() {
        let mut c = AdaptiveController::new(cfg()).unwrap();
        let g = Governance::new(crate::governance::GovernanceConfig::default());
        assert!(c.tick_and_submit(Some(0.5), SafetyLevel::Normal, &g).is_ok());
        assert_eq!(g.history().len(), 1);
    }

    #[test]
    fn tick_and_submit_returns_safety_error_under_emergency() {
        let mut c = AdaptiveController::new(cfg()).unwrap();
        let g = Governance::new(crate::governance::GovernanceConfig::default());
        let err = c
            .tick_and_submit(Some(0.5), SafetyLevel::Emergency, &g)
            .unwrap_err();
        assert!(matches!(err, crate::error::PhoenixError::Safety { .. }));
        assert_eq!(c.mode(), ControllerMode::Suspended);
    }

    #[test]
    fn effective_output_magnitude_reflects_committed_value() {
        let c = AdaptiveController::new(cfg()).unwrap();
        // min 1.0, max 500.0 -> starts at the midpoint.
        assert_eq!(c.effective_output_magnitude(), Some(250.5));
    }

    #[test]
    fn current_value_unchanged_when_governance_rejects_patch() {
        let mut c = AdaptiveController::new(cfg()).unwrap();
        // Rejected every time: no processor registered at "metric-pipeline".
        let g = Governance::new(crate::governance::GovernanceConfig::default());
        let before = c.current_values.clone();
        c.tick_and_submit(Some(0.5), SafetyLevel::Normal, &g).unwrap();
        assert_eq!(c.current_values, before);
    }
}
