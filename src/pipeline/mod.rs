//! # Module: pipeline
//!
//! ## Responsibility
//! The Metric Pipeline Processor: transform an input [`MetricBatch`] into a
//! filtered, priority-tagged, possibly rolled-up output batch per its
//! current configuration.
//!
//! Modeled on a `self_tune::controller::Controller` shape
//! (owns its engine plus an atomically-swapped config, exposes a
//! self-describing status), generalized from PID-parameter tuning to a
//! full metric-transform pipeline. `on_config_patch`'s path-to-field
//! resolution follows `helix_bridge`'s typed optional-field patch style.
//!
//! ## NOT Responsible For
//! Deciding *when* a patch should be applied — Governance validates and
//! dispatches; this processor only executes the patch once called.

pub mod config;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{PhoenixError, PhoenixResult};
use crate::governance::{ConfigStatus, Processor};
use crate::model::attributes::{AttributeSet, AttributeValue};
use crate::model::batch::{DataPoint, DataPointValue, HistogramBucket, HistogramDataPoint, Metric, MetricData, MetricBatch, ResourceMetrics};
use crate::model::patch::{ConfigPatch, PatchValue};
use crate::model::Priority;
use crate::telemetry::{attach_self_metrics, SelfMetric};
use crate::topk::TopKEngine;
use crate::util::distinct::{AutoDistinctCounter, DistinctCounter};
use crate::util::reservoir::ReservoirSampler;

use config::{AttributeAction, FilterStrategy, PipelineConfig, PriorityRule, RollupStrategy};

/// Exact until this many distinct series have been observed, then
/// approximate (HyperLogLog). Not config-patchable: a fixed memory ceiling
/// for the output-cardinality estimator, independent of `topk.k_value`.
const DISTINCT_SERIES_MEMORY_BOUND: usize = 2_000;
const DISTINCT_SERIES_HLL_PRECISION: u32 = 12;

struct Counters {
    patches_applied: AtomicU64,
    patches_rejected: AtomicU64,
}

/// Owns its Top-K engine and atomically-swapped configuration. `consume()`
/// never blocks behind `on_config_patch` longer than an `ArcSwap` load.
pub struct MetricPipeline {
    config: ArcSwap<PipelineConfig>,
    topk: TopKEngine,
    /// Estimates the cardinality of the *output* stream (distinct
    /// `topk.resource_field` values actually emitted), independent of which
    /// ones Top-K happens to retain.
    distinct_series: Mutex<AutoDistinctCounter>,
    counters: Counters,
}

impl MetricPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let k = config.topk.k_value.max(1);
        Self {
            topk: TopKEngine::new(k),
            distinct_series: Mutex::new(AutoDistinctCounter::new(
                DISTINCT_SERIES_MEMORY_BOUND,
                DISTINCT_SERIES_HLL_PRECISION,
            )),
            config: ArcSwap::from_pointee(config),
            counters: Counters {
                patches_applied: AtomicU64::new(0),
                patches_rejected: AtomicU64::new(0),
            },
        }
    }

    pub fn config_status(&self) -> ConfigStatus {
        let cfg = self.config.load();
        ConfigStatus {
            enabled: cfg.enabled,
            parameters: vec![
                ("filter_strategy".into(), format!("{:?}", cfg.filter_strategy)),
                ("priority_attribute".into(), cfg.priority_attribute.clone()),
                ("topk.k_value".into(), self.topk.k().to_string()),
                ("topk.resource_field".into(), cfg.topk.resource_field.clone()),
                ("rollup.enabled".into(), cfg.rollup.enabled.to_string()),
                ("histograms.enabled".into(), cfg.histograms.enabled.to_string()),
            ],
        }
    }

    /// Fully ordered transformation: priority tag, filter, rollup, histogram
    /// synthesis, attribute actions, self-metric emission. Preserves
    /// metric/datapoint semantic types throughout.
    pub fn consume(&self, mut batch: MetricBatch) -> MetricBatch {
        let cfg = self.config.load();
        if !cfg.enabled {
            return batch;
        }
        let started = Instant::now();
        let total_resources = batch.resources.len();

        let priorities = tag_priorities(&batch, &cfg.priority_rules, &cfg.priority_attribute);
        stamp_priority_attribute(&mut batch.resources, &priorities, &cfg.priority_attribute);
        let per_priority_counts = count_by_priority(&priorities);

        let kept: Vec<bool> = self.filter_mask(&batch, &priorities, &cfg);
        let kept_count = kept.iter().filter(|k| **k).count();

        let mut output_resources = Vec::with_capacity(kept_count);
        let mut rollup_sources = Vec::new();
        for (idx, resource) in batch.resources.drain(..).enumerate() {
            if kept[idx] {
                output_resources.push(resource);
            } else if cfg.rollup.enabled && priorities[idx] <= cfg.rollup.priority_threshold {
                rollup_sources.push(resource);
            }
            // Neither kept nor eligible for rollup: dropped by the configured filter.
        }

        let rollup_count = rollup_sources.len();
        if cfg.rollup.enabled && !rollup_sources.is_empty() {
            output_resources.extend(build_rollups(rollup_sources, &cfg));
        }

        batch.resources = output_resources;

        let histogram_conversions = if cfg.histograms.enabled {
            synthesize_histograms(&mut batch, &cfg)
        } else {
            0
        };

        apply_attribute_actions(&mut batch, &cfg.attribute_actions);

        let (distinct_series_estimate, distinct_series_is_approximate) = {
            let mut distinct = self.distinct_series.lock();
            for resource in &batch.resources {
                if let Some(v) = resource.resource.attributes.get(&cfg.topk.resource_field) {
                    distinct.insert(v.as_match_str().as_ref());
                }
            }
            (distinct.estimate(), distinct.is_approximate())
        };

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let coverage = self.topk.coverage();

        let mut self_metrics = vec![
            SelfMetric::new("phoenix.pipeline.resources_total", total_resources as f64),
            SelfMetric::new("phoenix.pipeline.resources_included", output_resources_count(&batch)),
            SelfMetric::new("phoenix.pipeline.coverage_ratio", coverage),
            SelfMetric::new("phoenix.pipeline.topk_k", self.topk.k() as f64),
            SelfMetric::new("phoenix.pipeline.rollup_count", rollup_count as f64),
            SelfMetric::new("phoenix.pipeline.histogram_conversions", histogram_conversions as f64),
            SelfMetric::new("phoenix.pipeline.processing_duration_ms", duration_ms),
            SelfMetric::new(
                "phoenix.pipeline.active_series_estimate",
                distinct_series_estimate as f64,
            )
            .with_attribute("approximate", AttributeValue::Bool(distinct_series_is_approximate)),
            SelfMetric::new(
                "phoenix.pipeline.patches_applied_total",
                self.counters.patches_applied.load(Ordering::Relaxed) as f64,
            ),
            SelfMetric::new(
                "phoenix.pipeline.patches_rejected_total",
                self.counters.patches_rejected.load(Ordering::Relaxed) as f64,
            ),
        ];
        for (priority, count) in per_priority_counts {
            self_metrics.push(
                SelfMetric::new("phoenix.pipeline.resources_by_priority", count as f64)
                    .with_attribute("priority", AttributeValue::Str(priority.to_string())),
            );
        }

        attach_self_metrics(&mut batch, "phoenix.pipeline", self_metrics);
        debug!(total_resources, kept_count, rollup_count, duration_ms, "consume complete");
        batch
    }

    fn filter_mask(&self, batch: &MetricBatch, priorities: &[Priority], cfg: &PipelineConfig) -> Vec<bool> {
        match cfg.filter_strategy {
            FilterStrategy::None => vec![true; batch.resources.len()],
            FilterStrategy::Priority => priorities
                .iter()
                .map(|p| *p >= cfg.rollup.priority_threshold)
                .collect(),
            FilterStrategy::Topk => self.topk_mask(batch, cfg),
            FilterStrategy::Hybrid => {
                let priority_kept: Vec<bool> = priorities
                    .iter()
                    .map(|p| *p >= cfg.rollup.priority_threshold)
                    .collect();
                let topk_kept = self.topk_mask(batch, cfg);
                priority_kept
                    .into_iter()
                    .zip(topk_kept)
                    .map(|(a, b)| a || b)
                    .collect()
            }
        }
    }

    fn topk_mask(&self, batch: &MetricBatch, cfg: &PipelineConfig) -> Vec<bool> {
        let keys: Vec<Option<String>> = batch
            .resources
            .iter()
            .map(|r| {
                r.resource
                    .attributes
                    .get(&cfg.topk.resource_field)
                    .map(|v| v.as_match_str().into_owned())
            })
            .collect();
        let weights: Vec<f64> = batch
            .resources
            .iter()
            .map(|r| {
                r.resource
                    .attributes
                    .get(&cfg.topk.counter_field)
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0)
            })
            .collect();

        for (key, weight) in keys.iter().zip(&weights) {
            if let Some(key) = key {
                self.topk.add(key, *weight);
            }
        }

        let top_ids = self.topk.top_k_ids();
        keys.iter()
            .map(|k| k.as_ref().map(|k| top_ids.contains(k)).unwrap_or(false))
            .collect()
    }

    /// Validate the patch's parameter path and new value, then atomically
    /// swap the affected parameter. Unknown paths and type mismatches are
    /// `ConfigInvalid`; out-of-range values are `ConstraintViolated`.
    fn apply_patch(&self, patch: &ConfigPatch) -> PhoenixResult<()> {
        let mut next = (**self.config.load()).clone();
        match patch.parameter_path.as_str() {
            "enabled" => next.enabled = expect_bool(&patch.new_value)?,
            "filter_strategy" => {
                next.filter_strategy = match expect_str(&patch.new_value)?.as_str() {
                    "priority" => FilterStrategy::Priority,
                    "topk" => FilterStrategy::Topk,
                    "hybrid" => FilterStrategy::Hybrid,
                    "none" => FilterStrategy::None,
                    other => {
                        return Err(PhoenixError::ConfigInvalid(format!(
                            "unknown filter_strategy '{other}'"
                        )))
                    }
                }
            }
            "topk.k_value" => {
                let k = expect_positive_int(&patch.new_value)?;
                if k < next.topk.k_min || k > next.topk.k_max {
                    return Err(PhoenixError::ConstraintViolated(format!(
                        "k_value {k} outside [{}, {}]",
                        next.topk.k_min, next.topk.k_max
                    )));
                }
                next.topk.k_value = k;
                self.topk.set_k(k);
            }
            "rollup.enabled" => next.rollup.enabled = expect_bool(&patch.new_value)?,
            "histograms.enabled" => next.histograms.enabled = expect_bool(&patch.new_value)?,
            other => {
                return Err(PhoenixError::ConfigInvalid(format!(
                    "unknown parameter_path '{other}'"
                )))
            }
        }
        self.config.store(std::sync::Arc::new(next));
        Ok(())
    }

    pub fn add_priority_rule(&self, rule: PriorityRule) {
        let mut next = (**self.config.load()).clone();
        next.priority_rules.push(rule);
        self.config.store(std::sync::Arc::new(next));
    }
}

impl Processor for MetricPipeline {
    fn on_config_patch(&self, patch: &ConfigPatch) -> PhoenixResult<()> {
        let result = self.apply_patch(patch);
        match &result {
            Ok(()) => self.counters.patches_applied.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.patches_rejected.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn config_status(&self) -> ConfigStatus {
        self.config_status()
    }
}

fn expect_bool(v: &PatchValue) -> PhoenixResult<bool> {
    match v {
        PatchValue::Bool(b) => Ok(*b),
        _ => Err(PhoenixError::ConfigInvalid("expected a bool value".into())),
    }
}

fn expect_str(v: &PatchValue) -> PhoenixResult<String> {
    match v {
        PatchValue::Str(s) => Ok(s.clone()),
        _ => Err(PhoenixError::ConfigInvalid("expected a string value".into())),
    }
}

fn expect_positive_int(v: &PatchValue) -> PhoenixResult<usize> {
    match v {
        PatchValue::Int(i) if *i > 0 => Ok(*i as usize),
        PatchValue::Int(_) => Err(PhoenixError::ConstraintViolated("value must be positive".into())),
        _ => Err(PhoenixError::ConfigInvalid("expected an int value".into())),
    }
}

fn output_resources_count(batch: &MetricBatch) -> f64 {
    batch.resources.len() as f64
}

/// First-match-wins priority assignment; a Resource with no matching rule
/// gets [`Priority::Low`] so tagging is always total (see the
/// invariant: "every Resource has exactly one priority attribute").
fn tag_priorities(batch: &MetricBatch, rules: &[PriorityRule], priority_attribute: &str) -> Vec<Priority> {
    batch
        .resources
        .iter()
        .map(|resource| {
            let haystack: String = resource
                .resource
                .attributes
                .iter()
                .map(|(_, v)| v.as_match_str().into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            rules
                .iter()
                .find(|rule| rule.is_match(&haystack))
                .map(|rule| rule.priority)
                .unwrap_or(Priority::Low)
        })
        .collect()
}

/// Tags `resource.attributes[priority_attribute]` in place for every kept
/// resource, since priority tagging is observable output, not just an
/// internal filter decision.
fn stamp_priority_attribute(resources: &mut [ResourceMetrics], priorities: &[Priority], priority_attribute: &str) {
    for (resource, priority) in resources.iter_mut().zip(priorities) {
        resource
            .resource
            .attributes
            .insert(priority_attribute.to_string(), AttributeValue::Str(priority.to_string()));
    }
}

fn count_by_priority(priorities: &[Priority]) -> Vec<(Priority, usize)> {
    let mut counts = [0usize; 4];
    for p in priorities {
        counts[*p as usize] += 1;
    }
    vec![
        (Priority::Low, counts[0]),
        (Priority::Medium, counts[1]),
        (Priority::High, counts[2]),
        (Priority::Critical, counts[3]),
    ]
    .into_iter()
    .filter(|(_, c)| *c > 0)
    .collect()
}

/// Aggregate dropped low-priority resources into one synthetic Resource per
/// (scope name, metric name) group.
fn build_rollups(sources: Vec<ResourceMetrics>, cfg: &PipelineConfig) -> Vec<ResourceMetrics> {
    use std::collections::HashMap;

    struct Group {
        values: Vec<f64>,
        sampler: ReservoirSampler<AttributeSet>,
    }

    let mut groups: HashMap<(String, String), Group> = HashMap::new();

    for source in &sources {
        for scope in &source.scopes {
            for metric in &scope.metrics {
                for point in metric.data.numeric_points() {
                    let key = (scope.name.clone(), metric.name.clone());
                    let group = groups.entry(key).or_insert_with(|| Group {
                        values: Vec::new(),
                        sampler: ReservoirSampler::new(8),
                    });
                    group.values.push(point.value.as_f64());
                    group.sampler.offer(source.resource.attributes.clone());
                }
            }
        }
    }

    let source_count = sources.len();
    groups
        .into_iter()
        .map(|((scope_name, metric_name), group)| {
            let aggregated = match cfg.rollup.strategy {
                RollupStrategy::Sum => group.values.iter().sum(),
                RollupStrategy::Avg => {
                    if group.values.is_empty() {
                        0.0
                    } else {
                        group.values.iter().sum::<f64>() / group.values.len() as f64
                    }
                }
                RollupStrategy::Min => group.values.iter().cloned().fold(f64::INFINITY, f64::min),
                RollupStrategy::Max => group.values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            };

            let mut attributes = AttributeSet::new();
            attributes.insert("priority", AttributeValue::Str(cfg.rollup.priority_threshold.to_string()));
            attributes.insert("name", AttributeValue::Str(cfg.rollup.name_prefix.clone()));
            attributes.insert("rollup.count", AttributeValue::Int(source_count as i64));
            attributes.insert(
                "rollup.sample_attributes",
                AttributeValue::Str(render_sampled_attributes(group.sampler.samples())),
            );

            let mut datapoint_attrs = AttributeSet::new();
            datapoint_attrs.insert("rollup.count", AttributeValue::Int(group.values.len() as i64));

            ResourceMetrics {
                resource: crate::model::batch::Resource::new(attributes),
                scopes: vec![crate::model::batch::ScopeMetrics {
                    name: scope_name,
                    metrics: vec![Metric::new(
                        format!("{}.{}", cfg.rollup.name_prefix, metric_name),
                        MetricData::Gauge {
                            points: vec![DataPoint {
                                attributes: datapoint_attrs,
                                timestamp: std::time::SystemTime::now(),
                                value: DataPointValue::Double(aggregated),
                            }],
                        },
                    )],
                }],
            }
        })
        .collect()
}

/// Render a rollup group's reservoir-sampled source attribute sets into a
/// single diagnostic string, e.g. `"service.name=a,region=us;service.name=b"`
/// — one semicolon-separated entry per sampled source, each a
/// comma-separated `key=value` list in the set's (deterministic) key order.
fn render_sampled_attributes(samples: &[AttributeSet]) -> String {
    samples
        .iter()
        .map(|attrs| {
            attrs
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// For each configured rule, synthesize a `{original}_histogram` metric
/// from the observed gauge/sum datapoints of any metric by that name found
/// in the batch. Returns the number of conversions performed.
fn synthesize_histograms(batch: &mut MetricBatch, cfg: &PipelineConfig) -> usize {
    let mut conversions = 0;
    for resource in &mut batch.resources {
        for scope in &mut resource.scopes {
            let mut synthesized = Vec::new();
            for metric in &scope.metrics {
                let Some(rule) = cfg.histograms.rules.iter().find(|r| r.metric_name == metric.name) else {
                    continue;
                };
                if metric.data.is_histogram() {
                    continue; // already a histogram; pass through unchanged
                }
                let points = metric.data.numeric_points();
                if points.is_empty() {
                    continue;
                }

                let mut boundaries = rule.boundaries.clone();
                boundaries.sort_by(|a, b| a.partial_cmp(b).unwrap());
                boundaries.truncate(cfg.histograms.max_buckets.max(1));

                let mut bucket_counts = vec![0u64; boundaries.len() + 1];
                let mut sum = 0.0;
                for point in points {
                    let v = point.value.as_f64();
                    sum += v;
                    let bucket_idx = boundaries.iter().position(|b| v <= *b).unwrap_or(boundaries.len());
                    bucket_counts[bucket_idx] += 1;
                }

                let mut buckets: Vec<HistogramBucket> = boundaries
                    .iter()
                    .zip(&bucket_counts)
                    .map(|(b, c)| HistogramBucket {
                        upper_bound: *b,
                        count: *c,
                    })
                    .collect();
                buckets.push(HistogramBucket {
                    upper_bound: f64::INFINITY,
                    count: *bucket_counts.last().unwrap(),
                });

                synthesized.push(Metric::new(
                    format!("{}_histogram", metric.name),
                    MetricData::Histogram {
                        points: vec![HistogramDataPoint {
                            attributes: AttributeSet::new(),
                            timestamp: std::time::SystemTime::now(),
                            count: points.len() as u64,
                            sum,
                            buckets,
                        }],
                    },
                ));
                conversions += 1;
            }
            scope.metrics.extend(synthesized);
        }
    }
    conversions
}

/// Apply `delete`, `insert` (only if absent), `update` (only if present), in
/// declared order, to every Resource's attribute set.
fn apply_attribute_actions(batch: &mut MetricBatch, actions: &[config::AttributeActionRule]) {
    for resource in &mut batch.resources {
        for rule in actions {
            match rule.action {
                AttributeAction::Delete => {
                    resource.resource.attributes.remove(&rule.key);
                }
                AttributeAction::Insert => {
                    if !resource.resource.attributes.contains_key(&rule.key) {
                        if let Some(v) = &rule.value {
                            resource.resource.attributes.insert(rule.key.clone(), v.clone());
                        }
                    }
                }
                AttributeAction::Update => {
                    if resource.resource.attributes.contains_key(&rule.key) {
                        if let Some(v) = &rule.value {
                            resource.resource.attributes.insert(rule.key.clone(), v.clone());
                        }
                    }
                }
            }
        }
    }
}


#[cfg(test)]
mod rstests {
    use super::*;
    use crate::model::batch::{Resource, ScopeMetrics};
    use crate::model::Priority;
    use rstest::rstest;

    fn service(name: &str) -> ResourceMetrics {
        let mut attributes = AttributeSet::new();
        attributes.insert("service.name", AttributeValue::Str(name.to_string()));
        ResourceMetrics {
            resource: Resource::new(attributes),
            scopes: vec![ScopeMetrics {
                name: "scope".into(),
                metrics: vec![],
            }],
        }
    }

    fn rules() -> Vec<PriorityRule> {
        vec![
            PriorityRule::new("payments", Priority::Critical).unwrap(),
            PriorityRule::new("checkout", Priority::High).unwrap(),
            PriorityRule::new("batch", Priority::Medium).unwrap(),
            PriorityRule::new(".*", Priority::Low).unwrap(),
        ]
    }

    #[rstest]
    #[case::exact_critical_match("payments-api", Priority::Critical)]
    #[case::exact_high_match("checkout-service", Priority::High)]
    #[case::exact_medium_match("batch-reconciler", Priority::Medium)]
    #[case::falls_through_to_catch_all("unrelated-worker", Priority::Low)]
    fn priority_rule_order_picks_first_match(#[case] service_name: &str, #[case] expected: Priority) {
        let mut batch = MetricBatch::new();
        batch.resources.push(service(service_name));
        let priorities = tag_priorities(&batch, &rules(), "phoenix.priority");
        assert_eq!(priorities[0], expected);
    }
}
