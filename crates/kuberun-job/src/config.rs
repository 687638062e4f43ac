//! Controller settings
//!
//! Defaults match what a test framework wants out of the box; a YAML or JSON
//! file can override any of them:
//!
//! ```yaml
//! runPrefix: ci
//! cancelGracePeriodMs: 5000
//! quotaRetryIntervalMs: 30000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kuberun_common::Document;

use crate::error::RunError;

/// Time a cancelled run is left alone before it is torn down
pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Sleep between ticks of a blocking wait
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Sleep between pod listings in the log collector
pub const COLLECTOR_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Delay between quota-rejected create attempts
pub const QUOTA_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Default prefix of derived root names
pub const DEFAULT_RUN_PREFIX: &str = "kr";

/// Tunables of the run controller
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Prefix of derived root object names
    #[serde(default = "default_run_prefix")]
    pub run_prefix: String,

    /// Cancellation grace period in milliseconds
    #[serde(default = "default_cancel_grace_period_ms")]
    pub cancel_grace_period_ms: u64,

    /// Blocking-wait tick interval in milliseconds
    #[serde(default = "default_wait_poll_interval_ms")]
    pub wait_poll_interval_ms: u64,

    /// Log collector polling interval in milliseconds
    #[serde(default = "default_collector_poll_interval_ms")]
    pub collector_poll_interval_ms: u64,

    /// Quota retry delay in milliseconds
    #[serde(default = "default_quota_retry_interval_ms")]
    pub quota_retry_interval_ms: u64,
}

fn default_run_prefix() -> String {
    DEFAULT_RUN_PREFIX.to_string()
}

fn default_cancel_grace_period_ms() -> u64 {
    CANCEL_GRACE_PERIOD.as_millis() as u64
}

fn default_wait_poll_interval_ms() -> u64 {
    WAIT_POLL_INTERVAL.as_millis() as u64
}

fn default_collector_poll_interval_ms() -> u64 {
    COLLECTOR_POLL_INTERVAL.as_millis() as u64
}

fn default_quota_retry_interval_ms() -> u64 {
    QUOTA_RETRY_INTERVAL.as_millis() as u64
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            run_prefix: default_run_prefix(),
            cancel_grace_period_ms: default_cancel_grace_period_ms(),
            wait_poll_interval_ms: default_wait_poll_interval_ms(),
            collector_poll_interval_ms: default_collector_poll_interval_ms(),
            quota_retry_interval_ms: default_quota_retry_interval_ms(),
        }
    }
}

impl ControllerConfig {
    /// Load settings from a YAML or JSON file
    pub fn load(path: &Path) -> Result<Self, RunError> {
        let doc = Document::read(path)?;
        let config: Self = serde_json::from_value(doc.value).map_err(|e| {
            RunError::configuration(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), RunError> {
        let prefix_ok = !self.run_prefix.is_empty()
            && self.run_prefix.len() <= 20
            && self
                .run_prefix
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            && !self.run_prefix.starts_with('-')
            && !self.run_prefix.ends_with('-');
        if !prefix_ok {
            return Err(RunError::configuration(format!(
                "runPrefix '{}' must be 1-20 lowercase alphanumerics or '-'",
                self.run_prefix
            )));
        }

        if self.wait_poll_interval_ms == 0 || self.collector_poll_interval_ms == 0 {
            return Err(RunError::configuration("poll intervals must be non-zero"));
        }
        Ok(())
    }

    /// Cancellation grace period
    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_period_ms)
    }

    /// Blocking-wait tick interval
    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    /// Log collector polling interval
    pub fn collector_poll_interval(&self) -> Duration {
        Duration::from_millis(self.collector_poll_interval_ms)
    }

    /// Quota retry delay
    pub fn quota_retry_interval(&self) -> Duration {
        Duration::from_millis(self.quota_retry_interval_ms)
    }
}
