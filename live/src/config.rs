//! Configuration for opening a database.

use ripple_engine::StoreConfig;
use std::env;
use std::time::Duration;

/// Default name of the background notifier thread.
pub const DEFAULT_NOTIFIER_THREAD: &str = "ripple-notifier";

/// Default bound on waiting for an asynchronous subscription to register.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_millis(5000);

/// Database configuration, usually loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on simultaneously pinned versions (unbounded when `None`)
    pub max_active_versions: Option<usize>,
    /// Name given to the background notifier thread
    pub notifier_thread: String,
    /// How long `Subscription::wait_registered` waits before giving up
    pub registration_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_active_versions: None,
            notifier_thread: DEFAULT_NOTIFIER_THREAD.to_string(),
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (and `.env`, if present).
    ///
    /// - `RIPPLE_MAX_ACTIVE_VERSIONS`: optional positive integer
    /// - `RIPPLE_NOTIFIER_THREAD`: notifier thread name
    /// - `RIPPLE_REGISTRATION_TIMEOUT_MS`: registration timeout in milliseconds
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_active_versions = match lookup("RIPPLE_MAX_ACTIVE_VERSIONS") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(0) | Err(_) => return Err(ConfigError::InvalidMaxActiveVersions(raw)),
                Ok(n) => Some(n),
            },
            None => None,
        };

        let notifier_thread = lookup("RIPPLE_NOTIFIER_THREAD")
            .unwrap_or_else(|| DEFAULT_NOTIFIER_THREAD.to_string());

        let registration_timeout = match lookup("RIPPLE_REGISTRATION_TIMEOUT_MS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::InvalidRegistrationTimeout(raw))?,
            None => DEFAULT_REGISTRATION_TIMEOUT,
        };

        Ok(Self {
            max_active_versions,
            notifier_thread,
            registration_timeout,
        })
    }

    /// Engine settings derived from this configuration.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_active_versions: self.max_active_versions,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid RIPPLE_MAX_ACTIVE_VERSIONS value: {0}")]
    InvalidMaxActiveVersions(String),

    #[error("Invalid RIPPLE_REGISTRATION_TIMEOUT_MS value: {0}")]
    InvalidRegistrationTimeout(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.store_config(), StoreConfig::default());
    }

    #[test]
    fn reads_all_values() {
        let config = Config::from_lookup(lookup(&[
            ("RIPPLE_MAX_ACTIVE_VERSIONS", "8"),
            ("RIPPLE_NOTIFIER_THREAD", "notify"),
            ("RIPPLE_REGISTRATION_TIMEOUT_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.max_active_versions, Some(8));
        assert_eq!(config.notifier_thread, "notify");
        assert_eq!(config.registration_timeout, Duration::from_millis(250));
        assert_eq!(config.store_config().max_active_versions, Some(8));
    }

    #[test]
    fn rejects_invalid_values() {
        let result = Config::from_lookup(lookup(&[("RIPPLE_MAX_ACTIVE_VERSIONS", "0")]));
        assert!(matches!(result, Err(ConfigError::InvalidMaxActiveVersions(_))));

        let result = Config::from_lookup(lookup(&[("RIPPLE_REGISTRATION_TIMEOUT_MS", "soon")]));
        assert!(matches!(result, Err(ConfigError::InvalidRegistrationTimeout(_))));
    }
}
