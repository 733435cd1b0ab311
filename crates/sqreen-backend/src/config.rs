// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::api::DEFAULT_BASE_URL;
use crate::buffer::MAX_EVENTS_PER_HEARTBEAT;
use crate::retry::RetryPolicy;
use reqwest::Url;
use std::env;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LOG_LEVEL: &str = "warn";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Agent configuration, built once and shared read-only.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Backend base URL
    pub base_url: String,
    /// Access token sent on login
    pub token: String,
    /// Application name sent on login
    pub app_name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Disables the agent regardless of the token; any non-empty `SQREEN_DISABLE` sets it
    pub disable: bool,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    /// Timeout of a single HTTP exchange
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Heartbeat delay used when the backend does not provide one
    pub default_heartbeat_delay: Duration,
    pub max_events_per_heartbeat: usize,
    /// Upper bound of the whole logout sequence
    pub logout_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: String::new(),
            app_name: String::new(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            disable: false,
            https_proxy: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
            default_heartbeat_delay: DEFAULT_HEARTBEAT_DELAY,
            max_events_per_heartbeat: MAX_EVENTS_PER_HEARTBEAT,
            logout_timeout: DEFAULT_LOGOUT_TIMEOUT,
        }
    }
}

impl AgentConfig {
    /// Create configuration from `SQREEN_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`AgentConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|val| !val.trim().is_empty());

        let base_url = non_empty("SQREEN_URL")
            .map(|url| url.trim().to_string())
            .unwrap_or(defaults.base_url);
        let token = lookup("SQREEN_TOKEN")
            .map(|val| val.trim().to_string())
            .unwrap_or_default();
        let app_name = lookup("SQREEN_APP_NAME")
            .map(|val| val.trim().to_string())
            .unwrap_or_default();
        let log_level = non_empty("SQREEN_LOG_LEVEL")
            .map(|val| val.trim().to_lowercase())
            .unwrap_or(defaults.log_level);
        let disable = non_empty("SQREEN_DISABLE").is_some();
        let https_proxy = non_empty("SQREEN_PROXY").or_else(|| non_empty("HTTPS_PROXY"));
        let request_timeout = match non_empty("SQREEN_REQUEST_TIMEOUT_MS") {
            Some(val) => val
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| {
                    ConfigError::Invalid(format!(
                        "SQREEN_REQUEST_TIMEOUT_MS must be a number of milliseconds, got '{val}'"
                    ))
                })?,
            None => defaults.request_timeout,
        };

        let config = Self {
            base_url,
            token,
            app_name,
            log_level,
            disable,
            https_proxy,
            request_timeout,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// The agent stays off when explicitly disabled or when no token is configured.
    pub fn is_disabled(&self) -> bool {
        self.disable || self.token.is_empty()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            ConfigError::Invalid(format!("invalid backend url '{}': {e}", self.base_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "backend url '{}' must use http or https",
                self.base_url
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "request timeout must be greater than 0".to_string(),
            ));
        }

        let backoff = &self.retry.backoff;
        if !backoff.rate.is_finite() || backoff.rate < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff rate must be at least 1.0, got {}",
                backoff.rate
            )));
        }
        if backoff.min.is_zero() || backoff.min > backoff.max {
            return Err(ConfigError::Invalid(
                "backoff bounds must satisfy 0 < min <= max".to_string(),
            ));
        }

        if self.default_heartbeat_delay.is_zero() {
            return Err(ConfigError::Invalid(
                "default heartbeat delay must be greater than 0".to_string(),
            ));
        }

        if self.max_events_per_heartbeat == 0 {
            return Err(ConfigError::Invalid(
                "max events per heartbeat must be greater than 0".to_string(),
            ));
        }

        if self.logout_timeout.is_zero() || self.logout_timeout >= self.retry.period {
            return Err(ConfigError::Invalid(format!(
                "logout timeout ({:?}) must be positive and shorter than the retry period ({:?})",
                self.logout_timeout, self.retry.period
            )));
        }

        Ok(())
    }
}
