//! Accounts and the launch parameters handed to adapters.

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Account identifier, taken verbatim from configuration.
pub type AccountId = String;

/// A persistent identity/profile served by one or more session slots.
///
/// Only one job per account may be active at any instant, regardless of
/// how many slots (windows) the account owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Isolated profile/storage directory for this account.
    pub profile_dir: PathBuf,
    /// Model used when a job does not request one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl Account {
    /// Maximum number of simultaneously active jobs per account.
    pub const CONCURRENCY: usize = 1;

    /// Create an account with just an id and a profile directory.
    #[must_use]
    pub fn new(id: impl Into<AccountId>, profile_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            profile_dir: profile_dir.into(),
            default_model: None,
        }
    }

    /// Set the account's default model.
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}

/// Per-slot launch parameters passed to `Adapter::init_session`.
///
/// Adapters interpret `params` however they like; the dispatcher never
/// looks inside.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Index of the window (slot) within its account.
    pub window: usize,
    /// Local endpoint of the shared proxy bridge, if the account uses one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_endpoint: Option<String>,
    /// Readiness probe attempts before `init_session` gives up.
    pub init_attempts: u32,
    /// Delay between readiness probe attempts, in milliseconds.
    pub init_retry_interval_ms: u64,
    /// Arbitrary adapter-specific parameters.
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

impl LaunchConfig {
    /// Get a launch parameter by key.
    #[must_use]
    pub fn get_param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Set a launch parameter.
    pub fn set_param(&mut self, key: impl Into<String>, value: Value) {
        self.params.insert(key.into(), value);
    }
}
