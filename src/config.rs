//! Application configuration
//!
//! Centralized configuration management with environment variable support
//! and sensible defaults. The onboarding part of the configuration is handed
//! to the orchestrator once at startup and never changes afterwards.

use serde::Serialize;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::onboarding::types::PollPolicy;

/// Scopes requested for the service token when `PLATFORM_SCOPES` is unset.
///
/// The `internal_org_*` scopes are carried over into the organization-scoped
/// token obtained by the organization switch grant.
pub const DEFAULT_SCOPES: &[&str] = &[
    "internal_organization_create",
    "internal_organization_view",
    "internal_organization_delete",
    "internal_org_userstore_view",
    "internal_org_user_mgt_create",
    "internal_org_user_mgt_list",
    "internal_org_role_mgt_view",
    "internal_org_role_mgt_update",
    "internal_org_application_mgt_view",
];

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required environment variable is not set or is blank
    #[error("Missing required configuration: {0}")]
    Missing(String),

    /// A variable is set but its value cannot be used
    #[error("Invalid value for {name}: {reason}")]
    Invalid {
        /// Variable name
        name: String,
        /// Why the value was rejected
        reason: String,
    },
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Onboarding pipeline configuration
    pub onboarding: OnboardingConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind the server to
    pub port: u16,
    /// Host address to bind to
    pub host: String,
}

/// Configuration consumed by the onboarding orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct OnboardingConfig {
    /// Identity platform connection settings
    pub platform: PlatformConfig,
    /// Poll budgets for the eventually-consistent stages
    pub polling: PollingConfig,
    /// Look the user up before re-issuing a create on retry
    pub verify_before_retry: bool,
    /// Delete the organization when a later stage fails
    pub rollback_on_failure: bool,
}

/// Identity platform connection settings
#[derive(Clone, Serialize)]
pub struct PlatformConfig {
    /// Root organization URL, e.g. `https://api.asgardeo.io/t/acme`
    pub base_url: String,
    /// Service client id
    pub client_id: String,
    /// Service client secret
    #[serde(skip_serializing)]
    pub client_secret: String,
    /// Scopes requested for the service token
    pub scopes: Vec<String>,
    /// Display name of the administrator role
    pub admin_role_name: String,
    /// When set, every request must name this application
    pub application_name: Option<String>,
    /// Timeout for a single outbound request, in seconds
    pub request_timeout_secs: u64,
}

impl fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scopes", &self.scopes)
            .field("admin_role_name", &self.admin_role_name)
            .field("application_name", &self.application_name)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Poll budgets, one per polling stage
#[derive(Debug, Clone, Serialize)]
pub struct PollingConfig {
    /// Maximum userstore listing attempts
    pub userstore_max_attempts: u32,
    /// Wait between userstore listings, in milliseconds
    pub userstore_interval_ms: u64,
    /// Time budget for user creation, in milliseconds
    pub user_max_elapsed_ms: u64,
    /// Wait between user creation attempts, in milliseconds
    pub user_interval_ms: u64,
    /// Time budget for role assignment, in milliseconds
    pub role_max_elapsed_ms: u64,
    /// Wait between role assignment attempts, in milliseconds
    pub role_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            userstore_max_attempts: 30,
            userstore_interval_ms: 2000,
            user_max_elapsed_ms: 10_000,
            user_interval_ms: 1000,
            role_max_elapsed_ms: 10_000,
            role_interval_ms: 1000,
        }
    }
}

impl PollingConfig {
    /// Policy for the userstore availability poller
    pub fn userstore_policy(&self) -> PollPolicy {
        PollPolicy::attempts(
            self.userstore_max_attempts,
            Duration::from_millis(self.userstore_interval_ms),
        )
    }

    /// Policy for the user provisioning poller
    pub fn user_policy(&self) -> PollPolicy {
        PollPolicy::elapsed(
            Duration::from_millis(self.user_max_elapsed_ms),
            Duration::from_millis(self.user_interval_ms),
        )
    }

    /// Policy for the role assignment poller
    pub fn role_policy(&self) -> PollPolicy {
        PollPolicy::elapsed(
            Duration::from_millis(self.role_max_elapsed_ms),
            Duration::from_millis(self.role_interval_ms),
        )
    }
}

impl OnboardingConfig {
    /// Check that the configuration can drive a run to completion
    ///
    /// Every poll budget and interval must be non-zero so that each poller
    /// makes at least one attempt and terminates.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.platform.base_url.trim().is_empty() {
            return Err(ConfigError::Missing("PLATFORM_BASE_URL".to_string()));
        }
        if self.platform.client_id.trim().is_empty() {
            return Err(ConfigError::Missing("PLATFORM_CLIENT_ID".to_string()));
        }
        if self.platform.client_secret.is_empty() {
            return Err(ConfigError::Missing("PLATFORM_CLIENT_SECRET".to_string()));
        }
        if self.platform.admin_role_name.trim().is_empty() {
            return Err(ConfigError::Missing("ADMIN_ROLE_NAME".to_string()));
        }
        if self.platform.request_timeout_secs == 0 {
            return Err(invalid("PLATFORM_REQUEST_TIMEOUT_SECS", "must be > 0"));
        }

        let polling = &self.polling;
        let checks = [
            ("USERSTORE_POLL_MAX_ATTEMPTS", polling.userstore_max_attempts as u64),
            ("USERSTORE_POLL_INTERVAL_MS", polling.userstore_interval_ms),
            ("USER_POLL_MAX_ELAPSED_MS", polling.user_max_elapsed_ms),
            ("USER_POLL_INTERVAL_MS", polling.user_interval_ms),
            ("ROLE_POLL_MAX_ELAPSED_MS", polling.role_max_elapsed_ms),
            ("ROLE_POLL_INTERVAL_MS", polling.role_interval_ms),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(invalid(name, "must be > 0"));
            }
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source
    ///
    /// `from_env` delegates here; tests pass a map-backed closure instead of
    /// mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &str| var(name).ok_or_else(|| ConfigError::Missing(name.to_string()));

        let defaults = PollingConfig::default();

        let scopes = match var("PLATFORM_SCOPES") {
            Some(raw) => raw
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        };

        let config = Self {
            server: ServerConfig {
                port: parse_or(&var, "PORT", 8080)?,
                host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            },
            onboarding: OnboardingConfig {
                platform: PlatformConfig {
                    base_url: required("PLATFORM_BASE_URL")?
                        .trim_end_matches('/')
                        .to_string(),
                    client_id: required("PLATFORM_CLIENT_ID")?,
                    client_secret: required("PLATFORM_CLIENT_SECRET")?,
                    scopes,
                    admin_role_name: var("ADMIN_ROLE_NAME")
                        .unwrap_or_else(|| "Administrator".to_string()),
                    application_name: var("APPLICATION_NAME"),
                    request_timeout_secs: parse_or(&var, "PLATFORM_REQUEST_TIMEOUT_SECS", 30)?,
                },
                polling: PollingConfig {
                    userstore_max_attempts: parse_or(
                        &var,
                        "USERSTORE_POLL_MAX_ATTEMPTS",
                        defaults.userstore_max_attempts,
                    )?,
                    userstore_interval_ms: parse_or(
                        &var,
                        "USERSTORE_POLL_INTERVAL_MS",
                        defaults.userstore_interval_ms,
                    )?,
                    user_max_elapsed_ms: parse_or(
                        &var,
                        "USER_POLL_MAX_ELAPSED_MS",
                        defaults.user_max_elapsed_ms,
                    )?,
                    user_interval_ms: parse_or(
                        &var,
                        "USER_POLL_INTERVAL_MS",
                        defaults.user_interval_ms,
                    )?,
                    role_max_elapsed_ms: parse_or(
                        &var,
                        "ROLE_POLL_MAX_ELAPSED_MS",
                        defaults.role_max_elapsed_ms,
                    )?,
                    role_interval_ms: parse_or(
                        &var,
                        "ROLE_POLL_INTERVAL_MS",
                        defaults.role_interval_ms,
                    )?,
                },
                verify_before_retry: parse_or(&var, "USER_VERIFY_BEFORE_RETRY", true)?,
                rollback_on_failure: parse_or(&var, "ONBOARDING_ROLLBACK_ON_FAILURE", false)?,
            },
        };

        config.onboarding.validate()?;
        Ok(config)
    }

    /// Get the server address as a string
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_or<T, F>(var: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name: name.to_string(),
            reason: format!("'{}': {}", raw, e),
        }),
        None => Ok(default),
    }
}

fn invalid(name: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}
