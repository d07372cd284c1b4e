use std::{path::Path, time::Duration};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{utils::duration_ms, WebVmError, WebVmResult};

use super::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The configuration of the application server core.
///
/// Every field has a default, so a TOML file only needs to name what it overrides:
///
/// ```toml
/// base_url = "https://apps.example.com"
/// app_port_base = 9000
///
/// [resilience.retry]
/// max_attempts = 5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct WebVmConfig {
    /// The origin manifests and relative bundle URLs are resolved against.
    #[builder(default = DEFAULT_BASE_URL.to_string(), setter(into))]
    base_url: String,

    /// The path of the runtime package manifest.
    #[builder(default = DEFAULT_MANIFEST_PATH.to_string(), setter(into))]
    manifest_path: String,

    /// The first port handed out to applications.
    #[builder(default = DEFAULT_APP_PORT_BASE)]
    app_port_base: u16,

    /// The number of progress increments of the staged boot.
    #[builder(default = DEFAULT_BOOT_STEPS)]
    boot_steps: u8,

    /// The delay between boot progress increments.
    #[serde(with = "duration_ms")]
    #[builder(default = DEFAULT_BOOT_STEP_DELAY)]
    boot_step_delay: Duration,

    /// The delay of a wake from hibernation.
    #[serde(with = "duration_ms")]
    #[builder(default = DEFAULT_WAKE_DELAY)]
    wake_delay: Duration,

    /// The number of finished runtime operations kept in memory.
    #[builder(default = DEFAULT_OPERATION_HISTORY_LIMIT)]
    operation_history_limit: usize,

    /// Settings of the error handler wrapping virtual machine calls.
    #[builder(default)]
    resilience: ResilienceConfig,
}

/// Settings of the [`ErrorHandler`](crate::resilience::ErrorHandler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct ResilienceConfig {
    /// The ceiling on concurrently tracked operations.
    #[builder(default = DEFAULT_MAX_CONCURRENT_OPERATIONS)]
    max_concurrent_operations: usize,

    /// The time a single attempt may take.
    #[serde(with = "duration_ms")]
    #[builder(default = DEFAULT_OPERATION_TIMEOUT)]
    operation_timeout: Duration,

    /// The age after which an in-flight operation's bookkeeping is evicted.
    #[serde(with = "duration_ms")]
    #[builder(default = DEFAULT_STALE_THRESHOLD)]
    stale_threshold: Duration,

    /// The interval of the background maintenance sweep.
    #[serde(with = "duration_ms")]
    #[builder(default = DEFAULT_MAINTENANCE_INTERVAL)]
    maintenance_interval: Duration,

    /// Retry settings.
    #[builder(default)]
    retry: RetryConfig,

    /// Circuit breaker settings.
    #[builder(default)]
    breaker: BreakerConfig,
}

/// Retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct RetryConfig {
    /// Whether operations that ask for retries get them.
    #[builder(default = true)]
    enabled: bool,

    /// The maximum number of attempts, including the first.
    #[builder(default = DEFAULT_RETRY_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// The delay before the first retry.
    #[serde(with = "duration_ms")]
    #[builder(default = DEFAULT_RETRY_BASE_DELAY)]
    base_delay: Duration,

    /// The growth factor of the delay.
    #[builder(default = DEFAULT_RETRY_MULTIPLIER)]
    multiplier: f64,

    /// The cap on the delay before jitter.
    #[serde(with = "duration_ms")]
    #[builder(default = DEFAULT_RETRY_MAX_DELAY)]
    max_delay: Duration,

    /// The maximum jitter, as a fraction of the delay.
    #[builder(default = DEFAULT_RETRY_JITTER)]
    jitter: f64,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct BreakerConfig {
    /// The number of failures within the monitoring window that opens the breaker.
    #[builder(default = DEFAULT_BREAKER_FAILURE_THRESHOLD)]
    failure_threshold: u32,

    /// How long an open breaker rejects calls before admitting a trial.
    #[serde(with = "duration_ms")]
    #[builder(default = DEFAULT_BREAKER_RESET_TIMEOUT)]
    reset_timeout: Duration,

    /// The window failures are counted in.
    #[serde(with = "duration_ms")]
    #[builder(default = DEFAULT_BREAKER_MONITORING_WINDOW)]
    monitoring_window: Duration,

    /// How long a closed breaker must be quiet before its counters are zeroed.
    #[serde(with = "duration_ms")]
    #[builder(default = DEFAULT_BREAKER_IDLE_RESET)]
    idle_reset: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WebVmConfig {
    /// Parses a configuration from TOML.
    pub fn from_toml_str(contents: &str) -> WebVmResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Loads a configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> WebVmResult<Self> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!("loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Returns the absolute URL of the runtime package manifest.
    pub fn manifest_url(&self) -> WebVmResult<String> {
        self.resolve_url(&self.manifest_path)
    }

    /// Resolves a possibly relative URL against the base URL.
    pub fn resolve_url(&self, url: &str) -> WebVmResult<String> {
        let base = reqwest::Url::parse(&self.base_url)
            .map_err(|e| WebVmError::Validation(format!("invalid base url: {e}")))?;
        let resolved = base
            .join(url)
            .map_err(|e| WebVmError::Validation(format!("invalid url {url:?}: {e}")))?;
        Ok(resolved.to_string())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for WebVmConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
