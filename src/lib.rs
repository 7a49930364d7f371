//! Self-adaptive metrics processing fabric: a streaming metric pipeline
//! whose priority tagging, Top-K retention, rollups, and histogram
//! synthesis are continuously retuned by an adaptive control loop, guarded
//! by host-resource safety monitoring and a governance layer that is the
//! sole arbiter of which configuration patches actually take effect.
//!
//! ## Crate layout
//! - [`model`] — the shared metric-batch/priority/patch data model.
//! - [`topk`] — the Space-Saving streaming Top-K engine.
//! - [`pid`] — the PID controller and its oscillation circuit breaker.
//! - [`bayes`] — the Gaussian-Process Bayesian optimizer fallback.
//! - [`pipeline`] — the Metric Pipeline processor (tagging, filtering, rollups, histograms).
//! - [`controller`] — the Adaptive Controller processor.
//! - [`governance`] — patch validation, rate limiting, and dispatch.
//! - [`safety`] — host CPU/memory monitoring and hysteresis-gated escalation.
//! - [`config`] — typed `config`/`policy` file structures and TOML loading.
//! - [`control_file`] — the optional control-file collaborator interface.
//! - [`telemetry`] — self-metric emission helpers.
//! - [`util`] — small shared helpers (distinct counting, reservoir sampling, smoothing).
//! - [`error`] — the crate-wide error taxonomy.

pub mod bayes;
pub mod config;
pub mod control_file;
pub mod controller;
pub mod error;
pub mod governance;
pub mod model;
pub mod pid;
pub mod pipeline;
pub mod safety;
pub mod telemetry;
pub mod topk;
pub mod util;

pub use error::{PhoenixError, PhoenixResult};
