//! Unified error model for the access-control core.
//! Every denial a daemon sees is expressed through `Outcome` in the engine;
//! `GateError` covers the internal failure taxonomy behind those denials so
//! callers can distinguish a transient registry problem from a hard mismatch.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    /// Registry unreachable or did not answer within the bounded timeout.
    /// Fails closed: the attempt is denied and the caller's next attempt
    /// performs the retry, never the library itself.
    #[error("registry unavailable for '{principal}': {reason}")]
    TransientRegistry { principal: String, reason: String },

    /// Invalid threshold/window values. Raised once at startup by
    /// `GateConfig::validate`, never at request time.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Bad path, unacceptable mode or malformed username. Denied and logged,
    /// never retried.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// One of the rate-limit kinds is over its window threshold.
    #[error("rate limited: {kind} for {key}")]
    RateLimited { kind: &'static str, key: String },

    /// Presented credential does not match any cached form. Counted toward
    /// abuse thresholds by the engine.
    #[error("credential mismatch for '{0}'")]
    AuthMismatch(String),

    /// OS entropy or thread plumbing failure. Surfaces as a denied attempt
    /// rather than a degraded token.
    #[error("internal: {0}")]
    Internal(String),
}

impl GateError {
    pub fn registry_timeout(principal: &str, waited: Duration) -> Self {
        GateError::TransientRegistry {
            principal: principal.to_string(),
            reason: format!("no answer within {waited:?}"),
        }
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        GateError::Configuration(msg.into())
    }

    pub fn policy<S: Into<String>>(msg: S) -> Self {
        GateError::PolicyViolation(msg.into())
    }
}

pub type GateResult<T> = Result<T, GateError>;
