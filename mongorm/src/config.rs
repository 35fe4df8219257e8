use crate::error::{MongormError, Result};
use crate::storage::CappedOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How references are materialized when a record is decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePolicy {
    /// Keep a handle and fetch on first `resolve`, caching the result.
    #[default]
    Lazy,
    /// Fetch referenced documents (one level deep) while decoding.
    Eager,
}

/// Store-wide settings. Read from the `settings:` block of `schema.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub reference_policy: ReferencePolicy,
    /// Longest a subscriber waits on an empty tail before checking its stop flag.
    pub tail_poll_interval_ms: u64,
    /// Bound used for event schemas that do not declare their own.
    pub default_capped: CappedOptions,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            reference_policy: ReferencePolicy::Lazy,
            tail_poll_interval_ms: 100,
            default_capped: CappedOptions::records(1000),
        }
    }
}

impl StoreConfig {
    pub fn with_reference_policy(mut self, policy: ReferencePolicy) -> Self {
        self.reference_policy = policy;
        self
    }

    pub fn with_tail_poll_interval(mut self, interval: Duration) -> Self {
        self.tail_poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn tail_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tail_poll_interval_ms)
    }

    pub fn check(&self) -> Result<()> {
        if self.tail_poll_interval_ms == 0 {
            return Err(MongormError::Schema(
                "settings.tail_poll_interval_ms must be greater than zero".into(),
            ));
        }
        self.default_capped
            .check()
            .map_err(|e| MongormError::Schema(format!("settings.default_capped: {e}")))
    }
}
