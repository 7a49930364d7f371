//! # Module: util
//!
//! ## Responsibility
//! Small, independently-testable helpers shared by the processors: an
//! approximate-distinct counter with automatic exact→approximate fallback,
//! a bounded reservoir sampler, and an EWMA/rolling-window smoother. Each
//! small enough to not warrant its own top-level module.
//!
//! ## NOT Responsible For
//! Any processor-specific policy around *when* to sample or smooth — those
//! decisions live in `pipeline`, `controller`, and `safety`.

pub mod distinct;
pub mod reservoir;
pub mod smoothed;

pub use distinct::DistinctCounter;
pub use reservoir::ReservoirSampler;
pub use smoothed::SmoothedSeries;
