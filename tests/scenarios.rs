//! End-to-end scenario tests exercising whole-component behavior rather
//! than single functions. Top-K (S2) and PID-step (S3) scenarios already
//! live as unit tests alongside their implementations; this file covers
//! the remaining scenarios that cross a processor's full `consume`/`apply`
//! surface.

use std::time::Duration;

use phoenix_sa_omf::governance::{Governance, GovernanceConfig, Processor};
use phoenix_sa_omf::model::attributes::{AttributeSet, AttributeValue};
use phoenix_sa_omf::model::batch::{
    DataPoint, DataPointValue, Metric, MetricBatch, MetricData, Resource, ResourceMetrics, ScopeMetrics,
};
use phoenix_sa_omf::model::patch::{ConfigPatch, PatchValue, Severity};
use phoenix_sa_omf::model::Priority;
use phoenix_sa_omf::pid::{BreakerConfig, PidConfig, PidController};
use phoenix_sa_omf::pipeline::config::{FilterStrategy, PipelineConfig, PriorityRule, RollupConfig, RollupStrategy};
use phoenix_sa_omf::pipeline::MetricPipeline;

fn resource_with_name(name: &str, count: f64) -> ResourceMetrics {
    let mut attrs = AttributeSet::new();
    attrs.insert("process.name", AttributeValue::Str(name.to_string()));
    ResourceMetrics {
        resource: Resource::new(attrs),
        scopes: vec![ScopeMetrics {
            name: "scope".into(),
            metrics: vec![Metric::new(
                "request.count",
                MetricData::Gauge {
                    points: vec![DataPoint {
                        attributes: AttributeSet::new(),
                        timestamp: std::time::SystemTime::now(),
                        value: DataPointValue::Double(count),
                    }],
                },
            )],
        }],
    }
}

/// S1 — Priority tagging: java→high, mysql→critical, everything else→low;
/// filtering at a medium threshold keeps only java and mysql.
#[test]
fn s1_priority_tagging_keeps_only_matched_resources() {
    let mut cfg = PipelineConfig::default();
    cfg.filter_strategy = FilterStrategy::Priority;
    cfg.priority_rules = vec![
        PriorityRule::new("java", Priority::High).unwrap(),
        PriorityRule::new("mysql", Priority::Critical).unwrap(),
        PriorityRule::new(".*", Priority::Low).unwrap(),
    ];
    cfg.rollup = RollupConfig {
        enabled: false,
        priority_threshold: Priority::Medium,
        ..RollupConfig::default()
    };

    let pipeline = MetricPipeline::new(cfg);
    let batch = MetricBatch {
        resources: vec![
            resource_with_name("java", 10.0),
            resource_with_name("mysql", 20.0),
            resource_with_name("other", 5.0),
        ],
    };

    let out = pipeline.consume(batch);
    // one extra synthetic resource carries self-metrics.
    let tagged: Vec<_> = out
        .resources
        .iter()
        .filter(|r| r.resource.attributes.get("process.name").is_some())
        .collect();

    assert_eq!(tagged.len(), 2);
    let names: Vec<&str> = tagged
        .iter()
        .map(|r| match r.resource.attributes.get("process.name").unwrap() {
            AttributeValue::Str(s) => s.as_str(),
            _ => unreachable!(),
        })
        .collect();
    assert!(names.contains(&"java"));
    assert!(names.contains(&"mysql"));
    assert!(!names.contains(&"other"));

    for resource in &tagged {
        let priority = resource.resource.attributes.get(&cfg_priority_attribute()).unwrap();
        match priority {
            AttributeValue::Str(p) => assert!(p == "high" || p == "critical"),
            _ => unreachable!(),
        }
    }
}

fn cfg_priority_attribute() -> String {
    PipelineConfig::default().priority_attribute
}

/// S4 — Rollup: three low-priority resources are all excluded from direct
/// output and rolled up into one synthetic resource summing their CPU
/// values, tagged with the source count.
#[test]
fn s4_rollup_sums_excluded_low_priority_resources() {
    let mut cfg = PipelineConfig::default();
    cfg.filter_strategy = FilterStrategy::Priority;
    cfg.rollup = RollupConfig {
        enabled: true,
        priority_threshold: Priority::Medium,
        strategy: RollupStrategy::Sum,
        name_prefix: "rollup".to_string(),
    };

    let pipeline = MetricPipeline::new(cfg);

    let cpu_resource = |v: f64| ResourceMetrics {
        resource: Resource::new(AttributeSet::new()),
        scopes: vec![ScopeMetrics {
            name: "scope".into(),
            metrics: vec![Metric::new(
                "cpu",
                MetricData::Gauge {
                    points: vec![DataPoint {
                        attributes: AttributeSet::new(),
                        timestamp: std::time::SystemTime::now(),
                        value: DataPointValue::Double(v),
                    }],
                },
            )],
        }],
    };

    let batch = MetricBatch {
        resources: vec![cpu_resource(1.0), cpu_resource(2.0), cpu_resource(3.0)],
    };

    let out = pipeline.consume(batch);
    let rollup_resource = out
        .resources
        .iter()
        .find(|r| r.resource.attributes.get("rollup.count").is_some())
        .expect("expected a synthesized rollup resource");

    let metric = &rollup_resource.scopes[0].metrics[0];
    assert_eq!(metric.name, "rollup.cpu");
    let value = metric.data.numeric_points()[0].value.as_f64();
    assert_eq!(value, 6.0);

    match rollup_resource.resource.attributes.get("rollup.count").unwrap() {
        AttributeValue::Int(n) => assert_eq!(*n, 3),
        other => panic!("expected Int, got {other:?}"),
    }
}

/// S5 — Governance rate limit: a second patch within the same minute is
/// rejected once `max_patches_per_minute` is reached; `reset()` clears the
/// window so a subsequent patch succeeds again.
#[test]
fn s5_rate_limit_rejects_second_patch_then_resets() {
    struct NoopProcessor;
    impl Processor for NoopProcessor {
        fn on_config_patch(&self, _patch: &ConfigPatch) -> phoenix_sa_omf::PhoenixResult<()> {
            Ok(())
        }
    }

    let governance = Governance::new(GovernanceConfig {
        max_patches_per_minute: 1,
        ..GovernanceConfig::default()
    });
    let processor: std::sync::Arc<dyn Processor> = std::sync::Arc::new(NoopProcessor);
    governance.register("target", &processor);

    let patch = || {
        ConfigPatch::new(
            "target",
            "some.path",
            PatchValue::Int(1),
            "s5",
            Severity::Normal,
            "adaptive-controller",
            60,
        )
    };

    assert!(governance.apply(patch()).is_ok());
    let rejected = governance.apply(patch());
    assert!(matches!(rejected, Err(phoenix_sa_omf::PhoenixError::RateLimited(_))));

    governance.reset();
    assert!(governance.apply(patch()).is_ok());
}

/// S6 — Circuit breaker trip: alternating-sign outputs past the
/// zero-crossing threshold force the breaker to trip; the next `compute`
/// call returns the safe-mode `0.1 * kp * error` output with a zeroed
/// integral, and normal PID behavior resumes after `reset_duration`.
#[test]
fn s6_circuit_breaker_trips_and_recovers() {
    let cfg = PidConfig {
        kp: 2.0,
        ki: 0.0,
        kd: 0.0,
        setpoint: 100.0,
        output_min: -5.0,
        output_max: 5.0,
        circuit_breaker_enabled: true,
        breaker: BreakerConfig {
            window: 10,
            threshold_percent: 100.0,
            min_duration: Duration::ZERO,
            min_signal_magnitude: 0.0,
            reset_duration: Duration::from_millis(20),
        },
        ..PidConfig::default()
    };
    let mut pid = PidController::new(cfg).unwrap();

    // error=+10 -> output clamps to +5; error=-10 -> output clamps to -5:
    // a single alternation past a zero-threshold trips the breaker.
    pid.compute(90.0);
    pid.compute(110.0);
    assert!(pid.circuit_breaker_tripped());

    let output = pid.compute(90.0);
    assert!((output - 2.0).abs() < 1e-9); // 0.1 * kp * error = 0.1 * 2.0 * 10.0
    assert_eq!(pid.last_terms().i, 0.0);

    std::thread::sleep(Duration::from_millis(30));
    pid.compute(95.0); // no further oscillation; lets the breaker's reset_duration elapse
    assert!(!pid.circuit_breaker_tripped());
}
