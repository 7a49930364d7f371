//! # Module: telemetry
//!
//! ## Responsibility
//! The `SelfMetric` record every processor emits about its own behavior
//! (`phoenix.*`, `phoenix.pid.*`) and the helper that merges a batch of
//! them into an outgoing [`crate::model::MetricBatch`] as one synthetic
//! Resource.
//!
//! ## NOT Responsible For
//! Exporting self-metrics anywhere — no exporter is implemented here; this
//! module only shapes self-metrics and attaches them to the batch the
//! core already produces.

use std::time::SystemTime;

use crate::model::attributes::{AttributeSet, AttributeValue};
use crate::model::batch::{DataPoint, DataPointValue, Metric, MetricData, Resource, ResourceMetrics, ScopeMetrics};

/// One named numeric self-observation, e.g. `phoenix.pipeline.coverage_ratio`.
#[derive(Debug, Clone)]
pub struct SelfMetric {
    pub name: String,
    pub value: f64,
    pub attributes: AttributeSet,
}

impl SelfMetric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            attributes: AttributeSet::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(key, value);
        self
    }
}

/// Appends one synthetic `ResourceMetrics` to `batch` carrying every
/// `SelfMetric` in `metrics`, each as its own single-datapoint Gauge. A
/// no-op if `metrics` is empty, so callers can unconditionally call this at
/// the end of `consume()`.
pub fn attach_self_metrics(batch: &mut crate::model::MetricBatch, scope_name: &str, metrics: Vec<SelfMetric>) {
    if metrics.is_empty() {
        return;
    }
    let now = SystemTime::now();
    let metrics: Vec<Metric> = metrics
        .into_iter()
        .map(|m| {
            Metric::new(
                m.name,
                MetricData::Gauge {
                    points: vec![DataPoint {
                        attributes: m.attributes,
                        timestamp: now,
                        value: DataPointValue::Double(m.value),
                    }],
                },
            )
        })
        .collect();

    batch.resources.push(ResourceMetrics {
        resource: Resource::new(AttributeSet::new()),
        scopes: vec![ScopeMetrics {
            name: scope_name.to_string(),
            metrics,
        }],
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricBatch;

    #[test]
    fn empty_metrics_do_not_add_a_resource() {
        let mut batch = MetricBatch::new();
        attach_self_metrics(&mut batch, "phoenix.pipeline", Vec::new());
        assert_eq!(batch.resource_count(), 0);
    }

    #[test]
    fn metrics_are_attached_as_one_synthetic_resource() {
        let mut batch = MetricBatch::new();
        attach_self_metrics(
            &mut batch,
            "phoenix.pipeline",
            vec![SelfMetric::new("phoenix.pipeline.coverage_ratio", 0.95)],
        );
        assert_eq!(batch.resource_count(), 1);
        let scope = &batch.resources[0].scopes[0];
        assert_eq!(scope.name, "phoenix.pipeline");
        assert_eq!(scope.metrics[0].name, "phoenix.pipeline.coverage_ratio");
    }
}
