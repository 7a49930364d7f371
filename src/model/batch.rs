//! The metric batch tree: `Resource → ScopeGroup → Metric → DataPoint`.
//!
//! Invariant: resources and metrics are order-insensitive; uniqueness of a
//! time series is defined by `(resource attribute set, metric name, scope
//! name, datapoint attribute set)` — never by position in the containing
//! `Vec`.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::attributes::AttributeSet;

/// A single point-in-time observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    pub attributes: AttributeSet,
    pub timestamp: SystemTime,
    pub value: DataPointValue,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataPointValue {
    Int(i64),
    Double(f64),
}

impl DataPointValue {
    pub fn as_f64(self) -> f64 {
        match self {
            DataPointValue::Int(i) => i as f64,
            DataPointValue::Double(d) => d,
        }
    }
}

/// One histogram bucket count alongside its upper boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub upper_bound: f64,
    pub count: u64,
}

/// A synthesized or pass-through histogram datapoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramDataPoint {
    pub attributes: AttributeSet,
    pub timestamp: SystemTime,
    pub count: u64,
    pub sum: f64,
    pub buckets: Vec<HistogramBucket>,
}

/// The semantic type of a metric and its datapoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetricData {
    Gauge { points: Vec<DataPoint> },
    Sum { monotonic: bool, points: Vec<DataPoint> },
    Histogram { points: Vec<HistogramDataPoint> },
}

impl MetricData {
    pub fn is_histogram(&self) -> bool {
        matches!(self, MetricData::Histogram { .. })
    }

    /// Gauge/Sum datapoints, if this metric carries them (empty for Histogram).
    pub fn numeric_points(&self) -> &[DataPoint] {
        match self {
            MetricData::Gauge { points } | MetricData::Sum { points, .. } => points,
            MetricData::Histogram { .. } => &[],
        }
    }

    pub fn numeric_points_mut(&mut self) -> Option<&mut Vec<DataPoint>> {
        match self {
            MetricData::Gauge { points } | MetricData::Sum { points, .. } => Some(points),
            MetricData::Histogram { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub unit: String,
    pub description: String,
    pub data: MetricData,
}

impl Metric {
    pub fn new(name: impl Into<String>, data: MetricData) -> Self {
        Self {
            name: name.into(),
            unit: String::new(),
            description: String::new(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeMetrics {
    pub name: String,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resource {
    pub attributes: AttributeSet,
}

impl Resource {
    pub fn new(attributes: AttributeSet) -> Self {
        Self { attributes }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub resource: Resource,
    pub scopes: Vec<ScopeMetrics>,
}

/// The top-level tree `consume()` transforms. Resources are unordered; the
/// `Vec` is positional storage only, never a semantic ordering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricBatch {
    pub resources: Vec<ResourceMetrics>,
}

impl MetricBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Total numeric (gauge/sum) datapoints across the whole batch, used by
    /// self-metrics and by rollup's source-count accounting.
    pub fn datapoint_count(&self) -> usize {
        self.resources
            .iter()
            .flat_map(|r| r.scopes.iter())
            .flat_map(|s| s.metrics.iter())
            .map(|m| m.data.numeric_points().len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch_has_zero_counts() {
        let b = MetricBatch::new();
        assert_eq!(b.resource_count(), 0);
        assert_eq!(b.datapoint_count(), 0);
    }

    #[test]
    fn datapoint_count_sums_across_resources_and_scopes() {
        let dp = |v: f64| DataPoint {
            attributes: AttributeSet::new(),
            timestamp: SystemTime::now(),
            value: DataPointValue::Double(v),
        };
        let batch = MetricBatch {
            resources: vec![ResourceMetrics {
                resource: Resource::default(),
                scopes: vec![ScopeMetrics {
                    name: "scope".into(),
                    metrics: vec![Metric::new(
                        "cpu",
                        MetricData::Gauge {
                            points: vec![dp(1.0), dp(2.0)],
                        },
                    )],
                }],
            }],
        };
        assert_eq!(batch.datapoint_count(), 2);
    }
}
