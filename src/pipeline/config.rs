//! Pipeline configuration types, matching the processor's configuration
//! surface. Kept separate from `mod.rs` so `on_config_patch` can construct
//! and validate a whole new `PipelineConfig` snapshot before swapping it in.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PhoenixError, PhoenixResult};
use crate::model::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStrategy {
    Priority,
    Topk,
    Hybrid,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupStrategy {
    Sum,
    Avg,
    Min,
    Max,
}

/// One `(match_regex, priority)` rule, evaluated in declaration order.
#[derive(Debug, Clone)]
pub struct PriorityRule {
    pub match_regex: String,
    pub priority: Priority,
    compiled: Regex,
}

impl PriorityRule {
    pub fn new(match_regex: impl Into<String>, priority: Priority) -> PhoenixResult<Self> {
        let match_regex = match_regex.into();
        let compiled = Regex::new(&match_regex)
            .map_err(|e| PhoenixError::ConstraintViolated(format!("invalid priority_rules regex '{match_regex}': {e}")))?;
        Ok(Self {
            match_regex,
            priority,
            compiled,
        })
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.compiled.is_match(haystack)
    }
}

#[derive(Debug, Clone)]
pub struct TopkConfig {
    pub k_value: usize,
    pub k_min: usize,
    pub k_max: usize,
    pub resource_field: String,
    pub counter_field: String,
    pub coverage_target: f64,
}

impl Default for TopkConfig {
    fn default() -> Self {
        Self {
            k_value: 50,
            k_min: 10,
            k_max: 500,
            resource_field: "service.name".to_string(),
            counter_field: "request.count".to_string(),
            coverage_target: 0.95,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RollupConfig {
    pub enabled: bool,
    pub priority_threshold: Priority,
    pub strategy: RollupStrategy,
    pub name_prefix: String,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            priority_threshold: Priority::Low,
            strategy: RollupStrategy::Sum,
            name_prefix: "rollup".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistogramRule {
    pub metric_name: String,
    pub boundaries: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct HistogramsConfig {
    pub enabled: bool,
    pub max_buckets: usize,
    pub rules: Vec<HistogramRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeAction {
    Delete,
    Insert,
    Update,
}

#[derive(Debug, Clone)]
pub struct AttributeActionRule {
    pub key: String,
    pub action: AttributeAction,
    pub value: Option<crate::model::attributes::AttributeValue>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub enabled: bool,
    pub filter_strategy: FilterStrategy,
    pub priority_attribute: String,
    pub priority_rules: Vec<PriorityRule>,
    pub topk: TopkConfig,
    pub rollup: RollupConfig,
    pub histograms: HistogramsConfig,
    pub attribute_actions: Vec<AttributeActionRule>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            filter_strategy: FilterStrategy::None,
            priority_attribute: "phoenix.priority".to_string(),
            priority_rules: Vec::new(),
            topk: TopkConfig::default(),
            rollup: RollupConfig::default(),
            histograms: HistogramsConfig::default(),
            attribute_actions: Vec::new(),
        }
    }
}
