//! # Module: governance
//!
//! ## Responsibility
//! Central validator and dispatcher for `ConfigPatch`es: ordered checks,
//! rate limiting, cooldown, dispatch to the target processor, bounded
//! history.
//!
//! Modeled on a `self_modify::gate`-style ordered check
//! pipeline (pass/fail accumulation into an auditable report), generalized
//! from CI-gate checks to patch-validation checks, and on the weak-
//! reference registry design.
//!
//! ## NOT Responsible For
//! Interpreting a patch's `parameter_path`/`new_value` — that is entirely
//! the target processor's concern, reached only through `Processor::
//! on_config_patch`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{PhoenixError, PhoenixResult};
use crate::model::patch::{cooldown_key, ConfigPatch, Severity};

/// `parameter_path` syntax: a lowercase identifier, optionally with
/// dot-separated sub-segments, e.g. `enabled` or `topk.k_value`. Compiled
/// once and shared across every `validate` call rather than per patch.
static PARAMETER_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)*$").expect("valid regex"));

/// Snapshot returned by a processor's `config_status()`: whether it's
/// enabled plus a flattened parameter map for operator visibility.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigStatus {
    pub enabled: bool,
    pub parameters: Vec<(String, String)>,
}

/// Anything governance can dispatch a patch to. Implemented by the Metric
/// Pipeline Processor and the Adaptive Controller's own tunable state.
pub trait Processor: Send + Sync {
    fn on_config_patch(&self, patch: &ConfigPatch) -> PhoenixResult<()>;
    fn config_status(&self) -> ConfigStatus;
}

#[derive(Debug, Clone)]
pub struct GovernanceConfig {
    pub allowed_sources: Vec<String>,
    pub allowed_severities: Vec<Severity>,
    pub max_patches_per_minute: u32,
    pub patch_cooldown_seconds: u64,
    pub history_capacity: usize,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            allowed_sources: vec!["adaptive-controller".to_string(), "operator".to_string()],
            allowed_severities: vec![Severity::Normal, Severity::High, Severity::Emergency],
            max_patches_per_minute: 30,
            patch_cooldown_seconds: 30,
            history_capacity: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub patch: ConfigPatch,
    pub outcome: Outcome,
    pub recorded_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Rejected,
}

struct Counters {
    recent_applies: VecDeque<SystemTime>,
    last_applied_at: HashMap<String, SystemTime>,
    history: VecDeque<HistoryEntry>,
}

/// Weak-reference processor registry: governance never keeps a processor
/// alive by holding it, and never calls a processor while its own lock is
/// held — the registry's own lock is held only during lookup.
pub struct Governance {
    cfg: GovernanceConfig,
    registry: Mutex<HashMap<String, Weak<dyn Processor>>>,
    counters: Mutex<Counters>,
}

impl Governance {
    pub fn new(cfg: GovernanceConfig) -> Self {
        Self {
            cfg,
            registry: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters {
                recent_applies: VecDeque::new(),
                last_applied_at: HashMap::new(),
                history: VecDeque::new(),
            }),
        }
    }

    pub fn register(&self, processor_id: impl Into<String>, processor: &Arc<dyn Processor>) {
        self.registry
            .lock()
            .insert(processor_id.into(), Arc::downgrade(processor));
    }

    pub fn unregister(&self, processor_id: &str) {
        self.registry.lock().remove(processor_id);
    }

    /// Ordered validation checks, first failure wins. Does not
    /// touch the registry or counters' mutable state beyond reading them.
    pub fn validate(&self, patch: &ConfigPatch, now: SystemTime) -> PhoenixResult<()> {
        if patch.patch_id.is_empty() || patch.target_processor.is_empty() || patch.parameter_path.is_empty() {
            return Err(PhoenixError::ConfigInvalid(
                "patch_id, target_processor and parameter_path are required".into(),
            ));
        }
        if !PARAMETER_PATH_RE.is_match(&patch.parameter_path) {
            return Err(PhoenixError::ConfigInvalid(format!(
                "parameter_path '{}' must be dot-separated lowercase segments",
                patch.parameter_path
            )));
        }

        if !self.cfg.allowed_sources.iter().any(|s| s == &patch.source) {
            return Err(PhoenixError::ConstraintViolated(format!(
                "source '{}' is not in allowed_sources",
                patch.source
            )));
        }
        if !self.cfg.allowed_severities.contains(&patch.severity) {
            return Err(PhoenixError::ConstraintViolated(format!(
                "severity '{}' is not in allowed_severities",
                patch.severity
            )));
        }

        if patch.ttl_seconds == 0 {
            return Err(PhoenixError::ConfigInvalid("ttl_seconds must be > 0".into()));
        }
        if patch.is_stale(now) {
            return Err(PhoenixError::Stale {
                ttl_seconds: patch.ttl_seconds,
                elapsed: now
                    .duration_since(patch.timestamp)
                    .unwrap_or(Duration::ZERO),
            });
        }

        let counters = self.counters.lock();
        let one_minute_ago = now.checked_sub(Duration::from_secs(60)).unwrap_or(now);
        let recent_count = counters
            .recent_applies
            .iter()
            .filter(|t| **t >= one_minute_ago)
            .count();
        if recent_count as u32 >= self.cfg.max_patches_per_minute {
            return Err(PhoenixError::RateLimited(format!(
                "{recent_count} patches applied in the last 60s, limit {}",
                self.cfg.max_patches_per_minute
            )));
        }

        let key = cooldown_key(&patch.target_processor, &patch.parameter_path);
        if let Some(last) = counters.last_applied_at.get(&key) {
            let elapsed = now.duration_since(*last).unwrap_or(Duration::ZERO);
            if elapsed < Duration::from_secs(self.cfg.patch_cooldown_seconds) {
                return Err(PhoenixError::RateLimited(format!(
                    "cooldown active for '{key}': {elapsed:?} elapsed, need {}s",
                    self.cfg.patch_cooldown_seconds
                )));
            }
        }

        Ok(())
    }

    /// Validate, dispatch to the registered target (without holding the
    /// registry or counters lock during the call), and record the outcome.
    pub fn apply(&self, patch: ConfigPatch) -> PhoenixResult<()> {
        let now = SystemTime::now();

        if let Err(e) = self.validate(&patch, now) {
            self.record(patch, Outcome::Rejected, now);
            return Err(e);
        }

        let target = {
            let registry = self.registry.lock();
            registry.get(&patch.target_processor).cloned()
        };
        let Some(target) = target.and_then(|w| w.upgrade()) else {
            let err = PhoenixError::TargetNotFound(patch.target_processor.clone());
            self.record(patch, Outcome::Rejected, now);
            return Err(err);
        };

        match target.on_config_patch(&patch) {
            Ok(()) => {
                let key = cooldown_key(&patch.target_processor, &patch.parameter_path);
                {
                    let mut counters = self.counters.lock();
                    counters.recent_applies.push_back(now);
                    while counters.recent_applies.len() > self.cfg.max_patches_per_minute as usize * 4 {
                        counters.recent_applies.pop_front();
                    }
                    counters.last_applied_at.insert(key, now);
                }
                info!(patch_id = %patch.patch_id, target = %patch.target_processor, "patch applied");
                self.record(patch, Outcome::Applied, now);
                Ok(())
            }
            Err(e) => {
                warn!(patch_id = %patch.patch_id, error = %e, "patch rejected by target processor");
                self.record(patch, Outcome::Rejected, now);
                Err(e)
            }
        }
    }

    fn record(&self, patch: ConfigPatch, outcome: Outcome, now: SystemTime) {
        let mut counters = self.counters.lock();
        if counters.history.len() >= self.cfg.history_capacity {
            counters.history.pop_front();
        }
        counters.history.push_back(HistoryEntry {
            patch,
            outcome,
            recorded_at: now,
        });
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.counters.lock().history.iter().cloned().collect()
    }

    /// Clear all counters and history. Does not touch the registry.
    pub fn reset(&self) {
        let mut counters = self.counters.lock();
        counters.recent_applies.clear();
        counters.last_applied_at.clear();
        counters.history.clear();
    }
}
