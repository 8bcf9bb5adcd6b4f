//! Runtime configuration.
//!
//! Every setting has a default so tests and single-process setups can use
//! [`CoreConfig::default`]. Deployments read the environment with
//! [`CoreConfig::from_env`].

use std::time::Duration;

/// Session rows live this long after their last write (72 hours).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(72 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    pub session_table: String,
    pub lock_table: String,
    /// Enables usage counters when set.
    pub profile_table: Option<String>,
    pub lock_retry: Duration,
    pub lock_lease: Duration,
    pub session_timeout: Duration,
    pub delivery_timeout: Duration,
    /// Base URL of the connection-management endpoint.
    pub gateway_endpoint: Option<String>,
    pub database_url: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            session_table: "sessions".to_string(),
            lock_table: "locks".to_string(),
            profile_table: None,
            lock_retry: crate::lock::DEFAULT_RETRY,
            lock_lease: crate::lock::DEFAULT_LEASE,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            delivery_timeout: crate::notify::DEFAULT_DELIVERY_TIMEOUT,
            gateway_endpoint: None,
            database_url: None,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset or empty variables keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            session_table: get("SESSION_TABLE").unwrap_or(defaults.session_table),
            lock_table: get("LOCK_TABLE").unwrap_or(defaults.lock_table),
            profile_table: get("PROFILE_TABLE"),
            lock_retry: millis("LOCK_RETRY_MS", get("LOCK_RETRY_MS"), defaults.lock_retry)?,
            lock_lease: millis("LOCK_LEASE_MS", get("LOCK_LEASE_MS"), defaults.lock_lease)?,
            session_timeout: seconds(
                "SESSION_TIMEOUT_SECS",
                get("SESSION_TIMEOUT_SECS"),
                defaults.session_timeout,
            )?,
            delivery_timeout: millis(
                "DELIVERY_TIMEOUT_MS",
                get("DELIVERY_TIMEOUT_MS"),
                defaults.delivery_timeout,
            )?,
            gateway_endpoint: get("GATEWAY_ENDPOINT"),
            database_url: get("DATABASE_URL"),
        })
    }

    pub fn with_session_table(mut self, table: impl Into<String>) -> Self {
        self.session_table = table.into();
        self
    }

    pub fn with_lock_table(mut self, table: impl Into<String>) -> Self {
        self.lock_table = table.into();
        self
    }

    pub fn with_profile_table(mut self, table: impl Into<String>) -> Self {
        self.profile_table = Some(table.into());
        self
    }

    pub fn with_lock_timing(mut self, retry: Duration, lease: Duration) -> Self {
        self.lock_retry = retry;
        self.lock_lease = lease;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }
}

fn parse_positive(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            var,
            value: raw.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError::Invalid {
            var,
            value: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn millis(var: &'static str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    raw.map_or(Ok(default), |r| parse_positive(var, &r).map(Duration::from_millis))
}

fn seconds(var: &'static str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    raw.map_or(Ok(default), |r| parse_positive(var, &r).map(Duration::from_secs))
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
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.lock_retry, Duration::from_millis(5));
        assert_eq!(config.lock_lease, Duration::from_secs(1));
        assert_eq!(config.session_timeout, Duration::from_secs(259_200));
        assert_eq!(config.delivery_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_overrides() {
        let config = CoreConfig::from_lookup(lookup(&[
            ("SESSION_TABLE", "pp-sessions"),
            ("PROFILE_TABLE", "pp-profiles"),
            ("LOCK_LEASE_MS", "2500"),
            ("GATEWAY_ENDPOINT", "https://ws.example.com/prod"),
            ("LOCK_TABLE", "  "),
        ]))
        .unwrap();
        assert_eq!(config.session_table, "pp-sessions");
        assert_eq!(config.lock_table, "locks");
        assert_eq!(config.profile_table.as_deref(), Some("pp-profiles"));
        assert_eq!(config.lock_lease, Duration::from_millis(2500));
        assert_eq!(
            config.gateway_endpoint.as_deref(),
            Some("https://ws.example.com/prod")
        );
    }

    #[test]
    fn test_invalid_durations() {
        let err = CoreConfig::from_lookup(lookup(&[("LOCK_RETRY_MS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "LOCK_RETRY_MS", .. }));

        let err = CoreConfig::from_lookup(lookup(&[("SESSION_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }
}
