use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::HireboardError;
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};

/// Main configuration for a Hireboard service
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub entitlements: EntitlementsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

/// Configuration for subscription entitlements
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct EntitlementsConfig {
    /// Endpoint of the external billing check function
    #[serde(default)]
    pub billing_check_url: Option<String>,

    /// Client-side timeout for every remote call, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Interval between periodic refreshes while mounted, in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Non-forced refreshes closer than this to the last fetch are throttled
    #[serde(default = "default_min_refresh_interval_ms")]
    pub min_refresh_interval_ms: u64,

    /// Backoff added per request in a throttled burst
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,

    /// Cap on throttle backoff
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Number of payment-return tokens remembered for deduplication
    #[serde(default = "default_processed_marker_capacity")]
    pub processed_marker_capacity: usize,
}

impl Default for EntitlementsConfig {
    fn default() -> Self {
        Self {
            billing_check_url: None,
            request_timeout_ms: default_request_timeout_ms(),
            poll_interval_secs: default_poll_interval_secs(),
            min_refresh_interval_ms: default_min_refresh_interval_ms(),
            backoff_step_ms: default_backoff_step_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            processed_marker_capacity: default_processed_marker_capacity(),
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_min_refresh_interval_ms() -> u64 {
    2_000
}

fn default_backoff_step_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_processed_marker_capacity() -> usize {
    64
}

impl EntitlementsConfig {
    /// Create a builder starting from defaults
    pub fn builder() -> EntitlementsConfigBuilder {
        EntitlementsConfigBuilder::new()
    }

    /// Load entitlements configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(url) = get_env_with_prefix("BILLING_CHECK_URL") {
            config.billing_check_url = Some(url);
        }
        if let Some(ms) = parse_env_with_prefix("ENTITLEMENTS_REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = ms;
        }
        if let Some(secs) = parse_env_with_prefix("ENTITLEMENTS_POLL_INTERVAL_SECS") {
            config.poll_interval_secs = secs;
        }
        if let Some(ms) = parse_env_with_prefix("ENTITLEMENTS_MIN_REFRESH_INTERVAL_MS") {
            config.min_refresh_interval_ms = ms;
        }
        if let Some(ms) = parse_env_with_prefix("ENTITLEMENTS_BACKOFF_STEP_MS") {
            config.backoff_step_ms = ms;
        }
        if let Some(ms) = parse_env_with_prefix("ENTITLEMENTS_MAX_BACKOFF_MS") {
            config.max_backoff_ms = ms;
        }
        if let Some(capacity) = parse_env_with_prefix("ENTITLEMENTS_PROCESSED_MARKER_CAPACITY") {
            config.processed_marker_capacity = capacity;
        }

        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Parsed billing check endpoint, if configured
    pub fn billing_check_url(&self) -> crate::error::Result<Option<url::Url>> {
        self.billing_check_url
            .as_deref()
            .map(|raw| {
                url::Url::parse(raw).map_err(|e| {
                    HireboardError::bad_request(format!("Invalid billing check URL {}: {}", raw, e))
                })
            })
            .transpose()
    }

    /// Check the settings for consistency
    ///
    /// # Errors
    ///
    /// Returns an error if a timeout or interval is zero, the backoff cap is
    /// below the step, or the billing check URL does not parse.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(HireboardError::bad_request(
                "Entitlements request timeout must be greater than 0",
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(HireboardError::bad_request(
                "Entitlements poll interval must be greater than 0",
            ));
        }
        if self.max_backoff_ms < self.backoff_step_ms {
            return Err(HireboardError::bad_request(format!(
                "Entitlements max backoff ({} ms) must not be below the backoff step ({} ms)",
                self.max_backoff_ms, self.backoff_step_ms
            )));
        }
        self.billing_check_url()?;
        Ok(())
    }
}

/// Builder for [`EntitlementsConfig`]
#[must_use = "builder does nothing until you call build()"]
#[derive(Debug, Clone, Default)]
pub struct EntitlementsConfigBuilder {
    config: EntitlementsConfig,
}

impl EntitlementsConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn billing_check_url(mut self, url: impl Into<String>) -> Self {
        self.config.billing_check_url = Some(url.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_secs = interval.as_secs();
        self
    }

    pub fn min_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.min_refresh_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn backoff_step(mut self, step: Duration) -> Self {
        self.config.backoff_step_ms = step.as_millis() as u64;
        self
    }

    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.config.max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn processed_marker_capacity(mut self, capacity: usize) -> Self {
        self.config.processed_marker_capacity = capacity;
        self
    }

    pub fn build(self) -> EntitlementsConfig {
        self.config
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_entitlements(mut self, entitlements: EntitlementsConfig) -> Self {
        self.config.entitlements = entitlements;
        self
    }

    /// Load configuration from environment variables with HIREBOARD_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        self.config.entitlements = EntitlementsConfig::from_env();

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error if the log level is unknown or the entitlements
    /// settings are invalid.
    pub fn build(self) -> crate::error::Result<Config> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(HireboardError::bad_request(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        self.config.entitlements.validate()?;

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.entitlements.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.entitlements.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.entitlements.min_refresh_interval_ms, 2_000);
        assert_eq!(config.entitlements.processed_marker_capacity, 64);
        assert!(config.entitlements.billing_check_url().unwrap().is_none());
    }

    #[test]
    fn test_invalid_log_level() {
        let err = ConfigBuilder::new().with_log_level("loud").build().unwrap_err();
        assert!(matches!(err, HireboardError::BadRequest(_)));
    }

    #[test]
    fn test_entitlements_validation() {
        let bad_backoff = EntitlementsConfig::builder()
            .backoff_step(Duration::from_secs(5))
            .max_backoff(Duration::from_secs(1))
            .build();
        assert!(bad_backoff.validate().is_err());

        let zero_timeout = EntitlementsConfig::builder()
            .request_timeout(Duration::ZERO)
            .build();
        assert!(zero_timeout.validate().is_err());

        let bad_url = EntitlementsConfig::builder()
            .billing_check_url("not a url")
            .build();
        assert!(ConfigBuilder::new()
            .with_entitlements(bad_url)
            .build()
            .is_err());

        let good = EntitlementsConfig::builder()
            .billing_check_url("https://billing.example.com/functions/check-subscription")
            .poll_interval(Duration::from_secs(30))
            .build();
        assert!(good.validate().is_ok());
        assert_eq!(
            good.billing_check_url().unwrap().unwrap().host_str(),
            Some("billing.example.com")
        );
    }

    #[test]
    fn test_entitlements_from_env() {
        unsafe {
            std::env::set_var("HIREBOARD_ENTITLEMENTS_POLL_INTERVAL_SECS", "45");
            std::env::set_var("HIREBOARD_ENTITLEMENTS_MAX_BACKOFF_MS", "oops");
        }
        let config = EntitlementsConfig::from_env();
        assert_eq!(config.poll_interval_secs, 45);
        assert_eq!(config.max_backoff_ms, 10_000);
        unsafe {
            std::env::remove_var("HIREBOARD_ENTITLEMENTS_POLL_INTERVAL_SECS");
            std::env::remove_var("HIREBOARD_ENTITLEMENTS_MAX_BACKOFF_MS");
        }
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"entitlements": {"poll_interval_secs": 5}}"#).unwrap();
        assert_eq!(config.entitlements.poll_interval_secs, 5);
        assert_eq!(config.entitlements.request_timeout_ms, 10_000);
        assert_eq!(config.logging.level, "info");
    }
}
