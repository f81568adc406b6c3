//! Pool configuration.
//!
//! Loaded from TOML; every field has a default so a file only needs to
//! list its accounts.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::account::{Account, AccountId, LaunchConfig};

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of pending + running jobs.
    pub queue_capacity: usize,
    /// Consecutive failures before a slot becomes unhealthy.
    pub failure_threshold: u32,
    /// Retries allowed per job after the first attempt.
    pub max_retries: u32,
    /// Inactivity warning threshold per execution.
    pub soft_timeout_secs: u64,
    /// Hard ceiling per execution.
    pub hard_timeout_secs: u64,
    /// Whether a timeout counts toward the failure threshold.
    pub timeout_counts_as_failure: bool,
    /// Whether a timed-out job is retried like a transient failure.
    pub retry_timeouts: bool,
    /// Model used when neither the job nor the account names one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Readiness probe attempts in `init_session`.
    pub init_attempts: u32,
    /// Delay between readiness probe attempts.
    pub init_retry_interval_ms: u64,
    /// Backoff for upstream retries and slot relaunches.
    pub retry_backoff: BackoffConfig,
    /// Retry policy per remote error code. A configured table replaces the
    /// defaults entirely.
    pub upstream: HashMap<String, UpstreamPolicy>,
    /// Accounts and their windows.
    pub accounts: Vec<AccountConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            failure_threshold: 3,
            max_retries: 3,
            soft_timeout_secs: 90,
            hard_timeout_secs: 150,
            timeout_counts_as_failure: true,
            retry_timeouts: true,
            default_model: None,
            init_attempts: 3,
            init_retry_interval_ms: 1000,
            retry_backoff: BackoffConfig::default(),
            upstream: default_upstream_policies(),
            accounts: Vec::new(),
        }
    }
}

fn default_upstream_policies() -> HashMap<String, UpstreamPolicy> {
    let mut policies = HashMap::new();
    policies.insert("rate_limited".to_string(), UpstreamPolicy::retry_after(5_000));
    policies.insert("server_busy".to_string(), UpstreamPolicy::retry_after(2_000));
    policies.insert("bad_request".to_string(), UpstreamPolicy::no_retry());
    policies.insert("content_policy".to_string(), UpstreamPolicy::no_retry());
    policies
}

impl PoolConfig {
    /// Load and validate a TOML config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// Returns error if parsing or validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for internal consistency.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be > 0".into()));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid("failure_threshold must be > 0".into()));
        }
        if self.hard_timeout_secs == 0 {
            return Err(ConfigError::Invalid("hard_timeout_secs must be > 0".into()));
        }
        if self.soft_timeout_secs >= self.hard_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "soft_timeout_secs ({}) must be below hard_timeout_secs ({})",
                self.soft_timeout_secs, self.hard_timeout_secs
            )));
        }
        if self.init_attempts == 0 {
            return Err(ConfigError::Invalid("init_attempts must be > 0".into()));
        }
        self.retry_backoff.validate()?;
        let mut seen = HashSet::new();
        for account in &self.accounts {
            account.validate()?;
            if !seen.insert(account.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate account id: {}",
                    account.id
                )));
            }
        }
        Ok(())
    }

    /// Soft (warning) timeout.
    #[must_use]
    pub const fn soft_timeout(&self) -> Duration {
        Duration::from_secs(self.soft_timeout_secs)
    }

    /// Hard timeout.
    #[must_use]
    pub const fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }

    /// Retry policy for a remote error code. Unknown codes are not retried.
    #[must_use]
    pub fn upstream_policy(&self, code: &str) -> UpstreamPolicy {
        self.upstream.get(code).cloned().unwrap_or_default()
    }

    /// Total number of slots across all accounts.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.accounts.iter().map(|a| a.windows).sum()
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound on the delay.
    pub max_delay_ms: u64,
    /// Growth factor after each failure.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Check that the delays grow and never collapse to zero.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` for a zero initial delay, a maximum
    /// below the initial delay, or a multiplier that is not a finite
    /// number of at least 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry_backoff.initial_delay_ms must be > 0".into(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry_backoff.max_delay_ms ({}) must be at least initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry_backoff.multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Initial delay.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Maximum delay.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Retry policy for one remote error code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamPolicy {
    /// Whether the job is retried.
    #[serde(default)]
    pub retry: bool,
    /// Fixed delay before requeueing; the pool backoff applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
}

impl UpstreamPolicy {
    /// Retry after a fixed delay.
    #[must_use]
    pub const fn retry_after(backoff_ms: u64) -> Self {
        Self {
            retry: true,
            backoff_ms: Some(backoff_ms),
        }
    }

    /// Never retry.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            retry: false,
            backoff_ms: None,
        }
    }
}

/// One account and its windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: AccountId,
    pub profile_dir: PathBuf,
    /// Number of session slots (windows) for this account.
    #[serde(default = "default_windows")]
    pub windows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Upstream proxy shared through a bridge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// Adapter-specific launch parameters.
    #[serde(default)]
    pub launch: HashMap<String, Value>,
}

const fn default_windows() -> usize {
    1
}

impl AccountConfig {
    /// Create an account config with one window.
    #[must_use]
    pub fn new(id: impl Into<AccountId>, profile_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            profile_dir: profile_dir.into(),
            windows: default_windows(),
            default_model: None,
            proxy: None,
            launch: HashMap::new(),
        }
    }

    /// Set the number of windows.
    #[must_use]
    pub const fn with_windows(mut self, windows: usize) -> Self {
        self.windows = windows;
        self
    }

    /// Route this account through an upstream proxy.
    #[must_use]
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Check this account entry.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` for an empty id or zero windows.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("account id must not be empty".into()));
        }
        if self.windows == 0 {
            return Err(ConfigError::Invalid(format!(
                "account {} must have at least one window",
                self.id
            )));
        }
        Ok(())
    }

    /// The account this entry describes.
    #[must_use]
    pub fn account(&self) -> Account {
        Account {
            id: self.id.clone(),
            profile_dir: self.profile_dir.clone(),
            default_model: self.default_model.clone(),
        }
    }

    /// Launch parameters for window `window`.
    #[must_use]
    pub fn launch_config(&self, window: usize, pool: &PoolConfig) -> LaunchConfig {
        LaunchConfig {
            window,
            proxy_endpoint: None,
            init_attempts: pool.init_attempts,
            init_retry_interval_ms: pool.init_retry_interval_ms,
            params: self.launch.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.failure_threshold, 3);
        assert!(config.timeout_counts_as_failure);
        assert!(config.soft_timeout() < config.hard_timeout());
        assert!(config.upstream_policy("rate_limited").retry);
        assert!(!config.upstream_policy("bad_request").retry);
        assert!(!config.upstream_policy("never_heard_of_it").retry);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_toml() {
        let config = PoolConfig::from_toml_str(
            r#"
            queue_capacity = 4
            hard_timeout_secs = 120
            soft_timeout_secs = 60

            [upstream.quota_exceeded]
            retry = true
            backoff_ms = 30000

            [[accounts]]
            id = "alpha"
            profile_dir = "/var/lib/slotpool/alpha"
            windows = 2
            proxy = "socks5://10.0.0.1:1080"

            [accounts.launch]
            headless = true

            [[accounts]]
            id = "beta"
            profile_dir = "/var/lib/slotpool/beta"
            default_model = "image-v2"
            "#,
        )
        .unwrap();

        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.slot_count(), 3);
        assert_eq!(config.accounts[1].windows, 1);
        assert_eq!(
            config.upstream_policy("quota_exceeded"),
            UpstreamPolicy::retry_after(30_000)
        );
        // A configured table replaces the default policies.
        assert_eq!(config.upstream.len(), 1);
        assert!(!config.upstream_policy("rate_limited").retry);

        let launch = config.accounts[0].launch_config(1, &config);
        assert_eq!(launch.window, 1);
        assert_eq!(launch.get_param("headless"), Some(&Value::Bool(true)));
        assert_eq!(
            config.accounts[1].account().default_model.as_deref(),
            Some("image-v2")
        );
    }

    #[test]
    fn test_rejects_duplicate_accounts() {
        let err = PoolConfig::from_toml_str(
            r#"
            [[accounts]]
            id = "alpha"
            profile_dir = "/a"

            [[accounts]]
            id = "alpha"
            profile_dir = "/b"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_soft_above_hard() {
        let config = PoolConfig {
            soft_timeout_secs: 200,
            hard_timeout_secs: 120,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_initial_backoff() {
        let config = PoolConfig::from_toml_str(
            r"
            [retry_backoff]
            initial_delay_ms = 0
            ",
        );
        let err = config.unwrap_err();
        assert!(err.to_string().contains("initial_delay_ms"));
    }

    #[test]
    fn test_rejects_max_backoff_below_initial() {
        let config = PoolConfig {
            retry_backoff: BackoffConfig {
                initial_delay_ms: 5_000,
                max_delay_ms: 1_000,
                multiplier: 2.0,
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_shrinking_or_invalid_multiplier() {
        for multiplier in [0.0, 0.5, -2.0, f64::NAN, f64::INFINITY] {
            let backoff = BackoffConfig {
                multiplier,
                ..BackoffConfig::default()
            };
            assert!(backoff.validate().is_err(), "multiplier {multiplier} accepted");
        }
        let flat = BackoffConfig {
            multiplier: 1.0,
            ..BackoffConfig::default()
        };
        assert!(flat.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_windows() {
        let account = AccountConfig::new("alpha", "/a").with_windows(0);
        assert!(account.validate().is_err());
    }
}
