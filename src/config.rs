#![forbid(unsafe_code)]

// Coordinator configuration, loaded from environment variables.

use crate::guard::DEFAULT_OPERATION_TIMEOUT;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_SYNC_ORIGIN: &str = "http://localhost:4000";
const DEFAULT_MAX_WORKERS: usize = 1_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub port: u16,
    /// Bearer token required on every control request
    pub control_token: String,
    /// Secret used to mint worker access tokens; unset disables token checks
    /// in the bundled backend
    pub test_auth_secret: Option<String>,
    /// Sync origin used when a start request carries no `uri`
    pub sync_origin: String,
    pub operation_timeout: Duration,
    pub max_workers: usize,
    /// SQLite URL for worker state; in-memory storage when unset
    pub state_db: Option<String>,
    /// Latency added by the bundled in-memory backend
    pub sim_latency: Duration,
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Invalid values fall back to
    /// defaults with a warning; only the control token is mandatory.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let control_token = lookup("COORDINATOR_TOKEN")
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::Missing("COORDINATOR_TOKEN"))?;

        let port = parsed(&lookup, "PORT", DEFAULT_PORT);

        let timeout_ms = parsed(&lookup, "OPERATION_TIMEOUT_MS", DEFAULT_OPERATION_TIMEOUT.as_millis() as u64);
        let operation_timeout = if timeout_ms == 0 {
            warn!("OPERATION_TIMEOUT_MS=0 would fail every operation, using default");
            DEFAULT_OPERATION_TIMEOUT
        } else {
            Duration::from_millis(timeout_ms)
        };

        let mut max_workers = parsed(&lookup, "MAX_WORKERS", DEFAULT_MAX_WORKERS);
        if max_workers == 0 {
            warn!("MAX_WORKERS=0 would reject every test, using default {}", DEFAULT_MAX_WORKERS);
            max_workers = DEFAULT_MAX_WORKERS;
        }

        let test_auth_secret = lookup("TEST_AUTH_SECRET").filter(|s| !s.is_empty());
        if test_auth_secret.is_none() {
            info!("TEST_AUTH_SECRET not set, worker access tokens are not checked");
        }

        Ok(Self {
            port,
            control_token,
            test_auth_secret,
            sync_origin: lookup("SYNC_ORIGIN").unwrap_or_else(|| DEFAULT_SYNC_ORIGIN.to_string()),
            operation_timeout,
            max_workers,
            state_db: lookup("STATE_DB").filter(|s| !s.is_empty()),
            sim_latency: Duration::from_millis(parsed(&lookup, "SIM_LATENCY_MS", 0)),
        })
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid {}={:?}, using default {}", key, raw, default);
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<CoordinatorConfig, ConfigError> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        CoordinatorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_token_is_required() {
        assert_eq!(load(&[]).unwrap_err(), ConfigError::Missing("COORDINATOR_TOKEN"));
        assert!(load(&[("COORDINATOR_TOKEN", "")]).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("COORDINATOR_TOKEN", "t")]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.operation_timeout, Duration::from_secs(10));
        assert_eq!(config.max_workers, 1_000);
        assert_eq!(config.sync_origin, "http://localhost:4000");
        assert_eq!(config.test_auth_secret, None);
        assert_eq!(config.state_db, None);
        assert_eq!(config.sim_latency, Duration::ZERO);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = load(&[
            ("COORDINATOR_TOKEN", "t"),
            ("PORT", "eighty"),
            ("OPERATION_TIMEOUT_MS", "0"),
            ("MAX_WORKERS", "-4"),
        ])
        .unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.operation_timeout, Duration::from_secs(10));
        assert_eq!(config.max_workers, 1_000);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("COORDINATOR_TOKEN", "t"),
            ("PORT", "8080"),
            ("OPERATION_TIMEOUT_MS", "2500"),
            ("TEST_AUTH_SECRET", "shh"),
            ("STATE_DB", "sqlite://state.db"),
            ("SIM_LATENCY_MS", "15"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.operation_timeout, Duration::from_millis(2500));
        assert_eq!(config.test_auth_secret.as_deref(), Some("shh"));
        assert_eq!(config.state_db.as_deref(), Some("sqlite://state.db"));
        assert_eq!(config.sim_latency, Duration::from_millis(15));
    }
}
