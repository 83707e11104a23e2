//! Per-call policies.
//!
//! Policies are plain values passed explicitly to every entry point.  The
//! engine never mutates a shared policy; omitting one falls back to the
//! baseline in [`crate::config::EngineConfig`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Bounds for the function-calling round loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionCallingPolicy {
    /// Maximum provider round-trips per logical completion.  Must be ≥ 1.
    pub max_rounds: u32,

    /// Timeout applied to each underlying provider request (not cumulative).
    #[serde(
        rename = "timeout_secs",
        with = "duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    /// Parallel-call hint forwarded to adapters.  Calls from one response are
    /// still executed one at a time, in order.
    pub max_concurrency: usize,

    /// Emit round and call lifecycle events at `info` instead of `debug`.
    pub enable_logging: bool,
}

impl Default for FunctionCallingPolicy {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            timeout: None,
            max_concurrency: 1,
            enable_logging: true,
        }
    }
}

impl FunctionCallingPolicy {
    /// Set the round limit.
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the parallel-call hint.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Toggle lifecycle logging.
    pub fn with_logging(mut self, enable_logging: bool) -> Self {
        self.enable_logging = enable_logging;
        self
    }

    /// Check the loop-termination and concurrency invariants.
    pub fn validate(&self) -> Result<()> {
        if self.max_rounds == 0 {
            return Err(EngineError::usage("max_rounds must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(EngineError::usage("max_concurrency must be at least 1"));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(EngineError::usage("timeout must be non-zero when set"));
        }
        Ok(())
    }
}

/// Bounds for structured-output repair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredOutputPolicy {
    /// Repair rounds allowed after the first attempt.  `None` defers to the
    /// service-wide default.
    pub max_repair_attempts: Option<u32>,
}

impl StructuredOutputPolicy {
    /// Policy with an explicit repair bound.
    pub fn with_max_repair_attempts(max_repair_attempts: u32) -> Self {
        Self {
            max_repair_attempts: Some(max_repair_attempts),
        }
    }

    /// The repair bound to use, given the service default.
    pub fn effective_repairs(&self, service_default: u32) -> u32 {
        self.max_repair_attempts.unwrap_or(service_default)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        match secs {
            Some(s) if s.is_finite() && s >= 0.0 => Ok(Some(Duration::from_secs_f64(s))),
            Some(s) => Err(serde::de::Error::custom(format!(
                "timeout_secs must be a non-negative number, got {s}"
            ))),
            None => Ok(None),
        }
    }
}
