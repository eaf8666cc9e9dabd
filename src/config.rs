//! Runtime configuration read from the process environment.
//!
//! `.env` files are loaded by the binary before [`Config::from_env`] runs.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::queue::RetryPolicy;
use crate::utils::get_database_path;

pub const DB_PATH_VAR: &str = "SCALPEL_DB_PATH";
pub const PROVIDER_URL_VAR: &str = "SCALPEL_PROVIDER_URL";
/// Older deployments point at the analysis service through this name.
pub const LEGACY_PROVIDER_URL_VAR: &str = "FASTAPI_BASE_URL";
pub const PROVIDER_TIMEOUT_VAR: &str = "SCALPEL_PROVIDER_TIMEOUT_SECS";
pub const MAX_ATTEMPTS_VAR: &str = "SCALPEL_MAX_ATTEMPTS";
pub const RETRY_BASE_VAR: &str = "SCALPEL_RETRY_BASE_SECS";
pub const RETRY_MAX_VAR: &str = "SCALPEL_RETRY_MAX_SECS";
pub const POLL_VAR: &str = "SCALPEL_POLL_SECS";

pub const DEFAULT_PROVIDER_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,
    pub provider_url: String,
    pub provider_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub poll_interval: Duration,
}

impl Config {
    /// Builds the configuration from `SCALPEL_*` environment variables,
    /// falling back to defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns an error naming the variable when a numeric value does not
    /// parse, or when no default database location can be determined.
    pub fn from_env() -> Result<Self> {
        let db_path = match env_string(DB_PATH_VAR) {
            Some(path) => PathBuf::from(path),
            None => get_database_path()?,
        };

        let provider_url = env_string(PROVIDER_URL_VAR)
            .or_else(|| env_string(LEGACY_PROVIDER_URL_VAR))
            .unwrap_or_else(|| DEFAULT_PROVIDER_URL.to_string());

        let defaults = RetryPolicy::default();
        let retry_policy = RetryPolicy {
            max_attempts: env_number(MAX_ATTEMPTS_VAR, defaults.max_attempts)?,
            initial_backoff_secs: env_number(RETRY_BASE_VAR, defaults.initial_backoff_secs)?,
            max_backoff_secs: env_number(RETRY_MAX_VAR, defaults.max_backoff_secs)?,
            ..defaults
        };
        if retry_policy.max_attempts == 0 {
            return Err(anyhow!("{MAX_ATTEMPTS_VAR} must be at least 1"));
        }

        Ok(Self {
            db_path,
            provider_url,
            provider_timeout: Duration::from_secs(env_number(PROVIDER_TIMEOUT_VAR, 60)?),
            retry_policy,
            poll_interval: Duration::from_secs(env_number(POLL_VAR, 5)?),
        })
    }
}

/// A set, non-blank variable, trimmed.
fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_number<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_string(name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Invalid value for {name}: {raw:?}")),
        None => Ok(default),
    }
}
