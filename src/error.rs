//! # Module: error
//!
//! ## Responsibility
//! Single crate-wide error taxonomy. Every fallible operation in the control
//! plane and data plane returns [`PhoenixError`] instead of an ad hoc string,
//! so callers can match on error *kind* (rate limited vs. stale vs. target
//! not found) rather than parsing messages.
//!
//! ## NOT Responsible For
//! Deciding what to *do* about an error (retry, log-and-skip, shut down) —
//! that policy lives with each caller.

use std::time::Duration;

use thiserror::Error;

/// The error kinds this crate distinguishes.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PhoenixError {
    /// Malformed parameter path or value type.
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    /// Value outside `[min, max]`, or a rule/regex failed to compile.
    #[error("constraint violated: {0}")]
    ConstraintViolated(String),

    /// Governance dropped a patch due to the rate or cooldown window.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Patch TTL expired before it could be applied.
    #[error("stale patch: ttl {ttl_seconds}s expired {elapsed:?} ago")]
    Stale {
        ttl_seconds: u64,
        elapsed: Duration,
    },

    /// No processor is registered at the requested target id.
    #[error("target not found: {0}")]
    TargetNotFound(String),

    /// Momentary downstream failure; caller may retry or skip.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Operation refused because the safety level is at or above critical.
    #[error("refused under safety level {level}: {reason}")]
    Safety { level: String, reason: String },

    /// Context or shutdown signal cancelled the operation.
    #[error("cancelled")]
    Cancelled,

    /// Unrecoverable invariant violation; triggers graceful shutdown.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl PhoenixError {
    /// `true` for kinds the control plane may legitimately retry on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PhoenixError::RateLimited(_) | PhoenixError::Transient(_) | PhoenixError::Stale { .. }
        )
    }
}

/// Crate-wide result alias.
pub type PhoenixResult<T> = Result<T, PhoenixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_retryable() {
        assert!(PhoenixError::RateLimited("x".into()).is_retryable());
    }

    #[test]
    fn fatal_is_not_retryable() {
        assert!(!PhoenixError::Fatal("x".into()).is_retryable());
    }

    #[test]
    fn display_includes_kind_context() {
        let e = PhoenixError::TargetNotFound("pipeline-1".into());
        assert!(e.to_string().contains("pipeline-1"));
    }
}
