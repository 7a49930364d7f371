//! `ConfigPatch`: an immutable request to change one parameter on one
//! target processor. Created by the Adaptive Controller (or an operator),
//! consumed by Governance.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Patch severity, used by Governance's `allowed_severities` check and by
/// the Adaptive Controller to reflect the current safety level in emitted
/// patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    High,
    Emergency,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Normal => "normal",
            Severity::High => "high",
            Severity::Emergency => "emergency",
        };
        write!(f, "{s}")
    }
}

/// A new parameter value, carried alongside its type so governance/
/// processors never silently string-to-float coerce in the hot path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatchValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl PatchValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PatchValue::Int(i) => Some(*i as f64),
            PatchValue::Float(f) => Some(*f),
            PatchValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            PatchValue::Str(_) => None,
        }
    }
}

/// Immutable request to change one parameter on one target processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub patch_id: String,
    pub target_processor: String,
    pub parameter_path: String,
    pub new_value: PatchValue,
    pub reason: String,
    pub severity: Severity,
    pub source: String,
    pub timestamp: SystemTime,
    pub ttl_seconds: u64,
}

impl ConfigPatch {
    /// Construct a patch with a fresh id and `timestamp = now`. Convenience
    /// for controllers; operators may construct `ConfigPatch` directly.
    pub fn new(
        target_processor: impl Into<String>,
        parameter_path: impl Into<String>,
        new_value: PatchValue,
        reason: impl Into<String>,
        severity: Severity,
        source: impl Into<String>,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            patch_id: Uuid::new_v4().to_string(),
            target_processor: target_processor.into(),
            parameter_path: parameter_path.into(),
            new_value,
            reason: reason.into(),
            severity,
            source: source.into(),
            timestamp: SystemTime::now(),
            ttl_seconds,
        }
    }

    /// Seconds elapsed since `timestamp`, saturating at 0 for clock skew
    /// that would otherwise make this negative.
    pub fn age_seconds(&self, now: SystemTime) -> u64 {
        now.duration_since(self.timestamp)
            .unwrap_or_default()
            .as_secs()
    }

    pub fn is_stale(&self, now: SystemTime) -> bool {
        self.ttl_seconds > 0 && self.age_seconds(now) > self.ttl_seconds
    }
}

/// Stable key identifying a `(target_processor, parameter_path)` pair for
/// cooldown tracking in Governance.
pub fn cooldown_key(target_processor: &str, parameter_path: &str) -> String {
    format!("{target_processor}::{parameter_path}")
}

/// Unix-epoch seconds, used where governance needs a plain numeric
/// timestamp (e.g. in logged audit context).
pub fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_patch(ttl: u64) -> ConfigPatch {
        ConfigPatch::new(
            "metric-pipeline",
            "topk.k_value",
            PatchValue::Int(64),
            "coverage below target",
            Severity::Normal,
            "adaptive-controller",
            ttl,
        )
    }

    #[test]
    fn fresh_patch_is_not_stale() {
        let p = sample_patch(60);
        assert!(!p.is_stale(SystemTime::now()));
    }

    #[test]
    fn patch_past_ttl_is_stale() {
        let p = sample_patch(1);
        let later = p.timestamp + Duration::from_secs(5);
        assert!(p.is_stale(later));
    }

    #[test]
    fn ttl_zero_never_expires_by_staleness_flag_convention() {
        // ttl_seconds > 0 is required for staleness;
        // a zero TTL is caught by validation, not by is_stale.
        let p = sample_patch(0);
        assert!(!p.is_stale(SystemTime::now() + Duration::from_secs(1_000)));
    }

    #[test]
    fn cooldown_key_distinguishes_target_and_path() {
        assert_ne!(
            cooldown_key("a", "x"),
            cooldown_key("a", "y")
        );
        assert_ne!(
            cooldown_key("a", "x"),
            cooldown_key("b", "x")
        );
    }
}
