//! Admission policy: how many requests a window admits and how long it lasts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FloodgateError, Result};

/// A fixed-window policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPolicy", into = "RawPolicy")]
pub struct Policy {
    limit: u64,
    window_seconds: u64,
}

impl Policy {
    /// Create a policy admitting `limit` requests per `window_seconds`.
    ///
    /// # Errors
    /// Both values must be positive.
    pub fn new(limit: u64, window_seconds: u64) -> Result<Self> {
        if limit == 0 {
            return Err(FloodgateError::Config(
                "policy limit must be greater than zero".to_string(),
            ));
        }
        if window_seconds == 0 {
            return Err(FloodgateError::Config(
                "policy window must be at least one second".to_string(),
            ));
        }
        Ok(Self {
            limit,
            window_seconds,
        })
    }

    /// Maximum admissions per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length in whole seconds.
    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Unvalidated wire form used by serde.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawPolicy {
    limit: u64,
    window_seconds: u64,
}

impl TryFrom<RawPolicy> for Policy {
    type Error = FloodgateError;

    fn try_from(raw: RawPolicy) -> Result<Self> {
        Policy::new(raw.limit, raw.window_seconds)
    }
}

impl From<Policy> for RawPolicy {
    fn from(policy: Policy) -> Self {
        Self {
            limit: policy.limit,
            window_seconds: policy.window_seconds,
        }
    }
}
