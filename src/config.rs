//! # Module: config
//!
//! ## Responsibility
//! Typed `config` and `policy` file structures and their
//! TOML loading, with path-aware error context so a malformed file tells
//! the operator *which* file and *why*.
//!
//! Modeled on a `self_tune::controller::ControllerConfig`
//! struct-with-`Default` style, loaded with the existing `toml` dependency.
//!
//! ## NOT Responsible For
//! Applying configuration to running components — `main.rs` wires a loaded
//! `ServiceConfig`/`Policy` into the pipeline/controller/governance/safety
//! constructors.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::controller::ControllerConfig as RuntimeControllerConfig;
use crate::error::{PhoenixError, PhoenixResult};
use crate::governance::GovernanceConfig as RuntimeGovernanceConfig;
use crate::model::patch::Severity;
use crate::safety::{DimensionThresholds, SafetyConfig as RuntimeSafetyConfig};

/// The `config` file: receivers, processors, exporters, and
/// a service graph. The core only cares about the Metric Pipeline and
/// Adaptive Controller processor declarations; other entries are carried
/// opaquely so this crate doesn't need to understand every receiver/exporter
/// kind a host collector might declare.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub receivers: Vec<String>,
    #[serde(default)]
    pub exporters: Vec<String>,
    #[serde(default)]
    pub service_graph: Vec<String>,
    #[serde(default)]
    pub pipeline: PipelineFileConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineFileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub filter_strategy: String,
    #[serde(default)]
    pub priority_attribute: String,
}

fn default_true() -> bool {
    true
}

/// The `policy` file: adaptive parameters, PID tunings per
/// controller, safety thresholds, governance limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Policy {
    #[serde(default)]
    pub controllers: Vec<ControllerPolicy>,
    #[serde(default)]
    pub safety: SafetyPolicy,
    #[serde(default)]
    pub governance: GovernancePolicy,
    #[serde(default)]
    pub control_file: ControlFilePolicy,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            controllers: Vec::new(),
            safety: SafetyPolicy::default(),
            governance: GovernancePolicy::default(),
            control_file: ControlFilePolicy::default(),
        }
    }
}

/// Opt-in collaboration with out-of-process readers of the control file:
/// when enabled, the control loop writes the Adaptive Controller's effective
/// output magnitude into `thresholds`/`current_metrics` and derives
/// `optimization_profile` from it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlFilePolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_control_file_path")]
    pub path: String,
    #[serde(default = "default_conservative_max_ts")]
    pub conservative_max_ts: f64,
    #[serde(default = "default_aggressive_min_ts")]
    pub aggressive_min_ts: f64,
    #[serde(default = "default_recovery_seconds")]
    pub recovery_time_seconds: u64,
}

impl Default for ControlFilePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_control_file_path(),
            conservative_max_ts: default_conservative_max_ts(),
            aggressive_min_ts: default_aggressive_min_ts(),
            recovery_time_seconds: default_recovery_seconds(),
        }
    }
}

fn default_control_file_path() -> String {
    "control.toml".to_string()
}
fn default_conservative_max_ts() -> f64 {
    50_000.0
}
fn default_aggressive_min_ts() -> f64 {
    200_000.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerPolicy {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub kpi_metric_name: String,
    pub kpi_target: f64,
    pub kp: f64,
    #[serde(default)]
    pub ki: f64,
    #[serde(default)]
    pub kd: f64,
    #[serde(default = "default_hysteresis")]
    pub hysteresis_percent: f64,
    #[serde(default = "default_integral_limit")]
    pub integral_windup_limit: f64,
    #[serde(default)]
    pub use_bayesian: bool,
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,
    #[serde(default = "default_bayesian_window")]
    pub bayesian_window_ticks: u32,
    #[serde(default)]
    pub output_patches: Vec<OutputPatchPolicy>,
}

fn default_hysteresis() -> f64 {
    5.0
}
fn default_integral_limit() -> f64 {
    100.0
}
fn default_stall_threshold() -> u32 {
    5
}
fn default_bayesian_window() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputPatchPolicy {
    pub target: String,
    pub parameter_path: String,
    pub change_scale_factor: f64,
    pub min_value: f64,
    pub max_value: f64,
}

impl From<&ControllerPolicy> for RuntimeControllerConfig {
    fn from(p: &ControllerPolicy) -> Self {
        RuntimeControllerConfig {
            name: p.name.clone(),
            enabled: p.enabled,
            kpi_metric_name: p.kpi_metric_name.clone(),
            kpi_target: p.kpi_target,
            kp: p.kp,
            ki: p.ki,
            kd: p.kd,
            hysteresis_percent: p.hysteresis_percent,
            integral_windup_limit: p.integral_windup_limit,
            use_bayesian: p.use_bayesian,
            stall_threshold: p.stall_threshold,
            bayesian_window_ticks: p.bayesian_window_ticks,
            output_patches: p
                .output_patches
                .iter()
                .map(|o| crate::controller::OutputPatchSpec {
                    target: o.target.clone(),
                    parameter_path: o.parameter_path.clone(),
                    change_scale_factor: o.change_scale_factor,
                    min_value: o.min_value,
                    max_value: o.max_value,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SafetyPolicy {
    #[serde(default = "default_poll_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_cpu_thresholds")]
    pub cpu_millicores: ThresholdsPolicy,
    #[serde(default = "default_mem_thresholds")]
    pub memory_mib: ThresholdsPolicy,
    #[serde(default = "default_recovery_multiplier")]
    pub recovery_multiplier: f64,
    #[serde(default = "default_recovery_seconds")]
    pub recovery_time_seconds: u64,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_seconds(),
            cpu_millicores: default_cpu_thresholds(),
            memory_mib: default_mem_thresholds(),
            recovery_multiplier: default_recovery_multiplier(),
            recovery_time_seconds: default_recovery_seconds(),
        }
    }
}

fn default_poll_seconds() -> u64 {
    5
}
fn default_recovery_multiplier() -> f64 {
    0.8
}
fn default_recovery_seconds() -> u64 {
    30
}
fn default_cpu_thresholds() -> ThresholdsPolicy {
    ThresholdsPolicy {
        warning: 700.0,
        critical: 900.0,
        emergency: 980.0,
    }
}
fn default_mem_thresholds() -> ThresholdsPolicy {
    ThresholdsPolicy {
        warning: 768.0,
        critical: 1024.0,
        emergency: 1536.0,
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThresholdsPolicy {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
}

impl From<&SafetyPolicy> for RuntimeSafetyConfig {
    fn from(p: &SafetyPolicy) -> Self {
        RuntimeSafetyConfig {
            poll_interval: std::time::Duration::from_secs(p.poll_interval_seconds),
            cpu_millicores: DimensionThresholds {
                warning: p.cpu_millicores.warning,
                critical: p.cpu_millicores.critical,
                emergency: p.cpu_millicores.emergency,
            },
            memory_mib: DimensionThresholds {
                warning: p.memory_mib.warning,
                critical: p.memory_mib.critical,
                emergency: p.memory_mib.emergency,
            },
            recovery_multiplier: p.recovery_multiplier,
            recovery_time_seconds: p.recovery_time_seconds,
            channel_capacity: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GovernancePolicy {
    #[serde(default = "default_allowed_sources")]
    pub allowed_sources: Vec<String>,
    #[serde(default = "default_allowed_severities")]
    pub allowed_severities: Vec<Severity>,
    #[serde(default = "default_max_patches")]
    pub max_patches_per_minute: u32,
    #[serde(default = "default_cooldown")]
    pub patch_cooldown_seconds: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for GovernancePolicy {
    fn default() -> Self {
        Self {
            allowed_sources: default_allowed_sources(),
            allowed_severities: default_allowed_severities(),
            max_patches_per_minute: default_max_patches(),
            patch_cooldown_seconds: default_cooldown(),
            history_capacity: default_history_capacity(),
        }
    }
}

fn default_allowed_sources() -> Vec<String> {
    vec!["adaptive-controller".to_string(), "operator".to_string()]
}
fn default_allowed_severities() -> Vec<Severity> {
    vec![Severity::Normal, Severity::High, Severity::Emergency]
}
fn default_max_patches() -> u32 {
    30
}
fn default_cooldown() -> u64 {
    30
}
fn default_history_capacity() -> usize {
    500
}

impl From<&GovernancePolicy> for RuntimeGovernanceConfig {
    fn from(p: &GovernancePolicy) -> Self {
        RuntimeGovernanceConfig {
            allowed_sources: p.allowed_sources.clone(),
            allowed_severities: p.allowed_severities.clone(),
            max_patches_per_minute: p.max_patches_per_minute,
            patch_cooldown_seconds: p.patch_cooldown_seconds,
            history_capacity: p.history_capacity,
        }
    }
}

pub fn load_config_file(path: &Path) -> PhoenixResult<ServiceConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| PhoenixError::ConfigInvalid(format!("reading config file {path:?}: {e}")))?;
    toml::from_str(&text).map_err(|e| PhoenixError::ConfigInvalid(format!("parsing config file {path:?}: {e}")))
}

pub fn load_policy_file(path: &Path) -> PhoenixResult<Policy> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| PhoenixError::ConfigInvalid(format!("reading policy file {path:?}: {e}")))?;
    toml::from_str(&text).map_err(|e| PhoenixError::ConfigInvalid(format!("parsing policy file {path:?}: {e}")))
}
