//! Controller configuration.
//!
//! Property names mirror the published component configuration surface
//! (`intentManager.*`, `groupManager.*`, `appStore.*`), so a JSON or
//! properties-derived document deserializes directly into these structs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the controller core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Intent subsystem properties.
    #[serde(rename = "intentManager", default)]
    pub intent_manager: IntentManagerConfig,

    /// Group provider properties. The group subsystem itself lives with the
    /// device providers; the knobs are carried here because they are part of
    /// the controller configuration surface.
    #[serde(rename = "groupManager", default)]
    pub group_manager: GroupManagerConfig,

    /// Application store properties.
    #[serde(rename = "appStore", default)]
    pub app_store: AppStoreConfig,
}

/// Intent manager properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentManagerConfig {
    /// Skip releasing resources when an intent is withdrawn. Only useful for
    /// throughput benchmarking.
    #[serde(rename = "skipReleaseResourcesOnWithdrawal", default)]
    pub skip_release_resources_on_withdrawal: bool,

    /// Number of concurrent phase workers.
    #[serde(rename = "numThreads", default = "default_num_threads")]
    pub num_threads: usize,

    /// Seconds an installer may take before the install is failed with a
    /// timeout.
    #[serde(rename = "installTimeoutSecs", default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    /// Accumulator time window in milliseconds, counted from the first
    /// buffered item.
    #[serde(rename = "batchWindowMs", default = "default_batch_window")]
    pub batch_window_ms: u64,

    /// Accumulator size threshold; a full buffer flushes ahead of the window.
    #[serde(rename = "batchMaxItems", default = "default_batch_max_items")]
    pub batch_max_items: usize,
}

impl Default for IntentManagerConfig {
    fn default() -> Self {
        Self {
            skip_release_resources_on_withdrawal: false,
            num_threads: default_num_threads(),
            install_timeout_secs: default_install_timeout(),
            batch_window_ms: default_batch_window(),
            batch_max_items: default_batch_max_items(),
        }
    }
}

impl IntentManagerConfig {
    /// Install timeout as a [`Duration`].
    #[must_use]
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    /// Accumulator window as a [`Duration`].
    #[must_use]
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

/// Group provider properties, consumed by the device-provider layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupManagerConfig {
    /// Frequency (seconds) with which the fallback group poller audits
    /// device group state.
    #[serde(rename = "fallbackPollFrequency", default = "default_poll_frequency")]
    pub fallback_poll_frequency: u64,

    /// Purge group entries when a device disconnects.
    #[serde(rename = "purgeOnDisconnection", default)]
    pub purge_on_disconnection: bool,
}

impl Default for GroupManagerConfig {
    fn default() -> Self {
        Self {
            fallback_poll_frequency: default_poll_frequency(),
            purge_on_disconnection: false,
        }
    }
}

/// Application store properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStoreConfig {
    /// Seconds to wait for a peer to serve application bits.
    #[serde(rename = "fetchTimeoutSecs", default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Attempts made to load one application from disk at bootstrap.
    #[serde(rename = "maxLoadRetries", default = "default_max_load_retries")]
    pub max_load_retries: u32,

    /// Base delay (milliseconds) between load retries; the actual delay is
    /// jittered.
    #[serde(rename = "retryDelayMs", default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for AppStoreConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout(),
            max_load_retries: default_max_load_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl AppStoreConfig {
    /// Bits-fetch timeout as a [`Duration`].
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn default_num_threads() -> usize {
    12
}

fn default_install_timeout() -> u64 {
    30
}

fn default_batch_window() -> u64 {
    50
}

fn default_batch_max_items() -> usize {
    500
}

fn default_poll_frequency() -> u64 {
    30
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_max_load_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2_000
}
