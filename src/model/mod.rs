//! # Module: model
//!
//! ## Responsibility
//! The shared data model every other component operates on: the
//! `Resource → ScopeGroup → Metric → DataPoint` metric-batch tree, the
//! totally-ordered `Priority` set, and the immutable `ConfigPatch` request
//! type.
//!
//! ## NOT Responsible For
//! Any transformation of the data — that lives in `pipeline`, `topk`, etc.
//! This module only defines shape and the handful of invariant-preserving
//! constructors/accessors every shape needs.

pub mod attributes;
pub mod batch;
pub mod patch;
pub mod priority;

pub use attributes::{AttributeSet, AttributeValue};
pub use batch::{DataPoint, DataPointValue, Metric, MetricBatch, MetricData, ResourceMetrics, Resource, ScopeMetrics};
pub use patch::{ConfigPatch, Severity};
pub use priority::Priority;
