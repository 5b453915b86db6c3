//! Server configuration.
//!
//! [`ServerConfig`] carries every tunable with a documented default. The
//! binary loads it from `UNO_*` environment variables via
//! [`ServerConfig::from_env`]; tests build it directly with the `with_*`
//! methods.
//!
//! # Example
//!
//! ```
//! use uno_session_server::config::ServerConfig;
//! use std::time::Duration;
//!
//! let config = ServerConfig::new()
//!     .with_grace_period(Duration::from_secs(30))
//!     .with_room_capacity(4);
//! assert_eq!(config.room_capacity, 4);
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::registry::DEFAULT_ROOM_CAPACITY;
use crate::scheduler::DEFAULT_GRACE_PERIOD;

/// Default WebSocket listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

/// Default health endpoint listen address.
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:3001";

/// Default maximum snapshot age before a sweep removes it.
pub const DEFAULT_SNAPSHOT_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Default interval between snapshot sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default transport silence tolerated before a connection is dropped.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default timeout for the graceful shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default key prefix of the shared snapshot store.
pub const DEFAULT_SHARED_STORE_PREFIX: &str = "uno";

/// Errors raised while loading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was set to a value that does not parse or is out of range.
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },

    /// The shared store was enabled without a URL.
    #[error("UNO_SHARED_STORE_URL is required when UNO_SHARED_STORE_ENABLED is set")]
    MissingSharedStoreUrl,
}

/// Connection settings of the shared snapshot store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedStoreConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// Prefix of every key the server writes.
    pub key_prefix: String,
}

impl SharedStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: DEFAULT_SHARED_STORE_PREFIX.to_string(),
        }
    }

    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// Configuration for a [`SessionServer`](crate::server::SessionServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// WebSocket listen address. Defaults to **0.0.0.0:3000**.
    pub bind_addr: SocketAddr,
    /// `/health` listen address. Defaults to **0.0.0.0:3001**.
    pub health_addr: SocketAddr,
    /// How long a disconnected player keeps their seat.
    ///
    /// Defaults to **60 seconds**.
    pub grace_period: Duration,
    /// Snapshots whose last write is older than this are swept.
    ///
    /// Defaults to **1 hour**.
    pub snapshot_max_age: Duration,
    /// How often the sweep runs. Defaults to **5 minutes**.
    pub sweep_interval: Duration,
    /// Seats per room. Defaults to **6**. Values below 1 are clamped to 1.
    pub room_capacity: usize,
    /// A connection that sends nothing for this long is treated as lost with
    /// reason `"ping timeout"`.
    ///
    /// Defaults to **5 minutes**.
    pub keepalive_timeout: Duration,
    /// Time the event loop is given to wind down on shutdown before it is
    /// aborted. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Use the shared snapshot store instead of the in-memory one.
    pub shared_store: Option<SharedStoreConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    /// Create a configuration with every default applied.
    pub fn new() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            grace_period: DEFAULT_GRACE_PERIOD,
            snapshot_max_age: DEFAULT_SNAPSHOT_MAX_AGE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            room_capacity: DEFAULT_ROOM_CAPACITY,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            shared_store: None,
        }
    }

    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    #[must_use]
    pub fn with_health_addr(mut self, addr: SocketAddr) -> Self {
        self.health_addr = addr;
        self
    }

    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    #[must_use]
    pub fn with_snapshot_max_age(mut self, max_age: Duration) -> Self {
        self.snapshot_max_age = max_age;
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the number of seats per room. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_room_capacity(mut self, capacity: usize) -> Self {
        self.room_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    /// Set the timeout for the graceful shutdown. A zero timeout aborts the
    /// event loop immediately.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shared_store(mut self, shared: SharedStoreConfig) -> Self {
        self.shared_store = Some(shared);
        self
    }

    /// Load from `UNO_*` environment variables, defaulting anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unparsable or out-of-range values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. [`from_env`](Self::from_env) uses
    /// the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unparsable or out-of-range values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        if let Some(value) = lookup("UNO_BIND_ADDR") {
            config.bind_addr = parse_addr("UNO_BIND_ADDR", value)?;
        }
        if let Some(value) = lookup("UNO_HEALTH_ADDR") {
            config.health_addr = parse_addr("UNO_HEALTH_ADDR", value)?;
        }
        if let Some(value) = lookup("UNO_GRACE_PERIOD_SECS") {
            config.grace_period = parse_secs("UNO_GRACE_PERIOD_SECS", value)?;
        }
        if let Some(value) = lookup("UNO_SNAPSHOT_MAX_AGE_SECS") {
            config.snapshot_max_age = parse_secs("UNO_SNAPSHOT_MAX_AGE_SECS", value)?;
        }
        if let Some(value) = lookup("UNO_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = parse_secs("UNO_SWEEP_INTERVAL_SECS", value)?;
        }
        if let Some(value) = lookup("UNO_ROOM_CAPACITY") {
            let capacity = parse_positive("UNO_ROOM_CAPACITY", value)?;
            config.room_capacity = usize::try_from(capacity).map_err(|_| ConfigError::Invalid {
                key: "UNO_ROOM_CAPACITY",
                value: capacity.to_string(),
                reason: "too large",
            })?;
        }
        if let Some(value) = lookup("UNO_KEEPALIVE_TIMEOUT_SECS") {
            config.keepalive_timeout = parse_secs("UNO_KEEPALIVE_TIMEOUT_SECS", value)?;
        }
        if let Some(value) = lookup("UNO_SHUTDOWN_TIMEOUT_MS") {
            let millis = value.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
                key: "UNO_SHUTDOWN_TIMEOUT_MS",
                value,
                reason: "expected a whole number of milliseconds",
            })?;
            config.shutdown_timeout = Duration::from_millis(millis);
        }

        let enabled = match lookup("UNO_SHARED_STORE_ENABLED") {
            Some(value) => parse_bool("UNO_SHARED_STORE_ENABLED", value)?,
            None => false,
        };
        if enabled {
            let url = lookup("UNO_SHARED_STORE_URL")
                .filter(|url| !url.trim().is_empty())
                .ok_or(ConfigError::MissingSharedStoreUrl)?;
            let mut shared = SharedStoreConfig::new(url);
            if let Some(prefix) = lookup("UNO_SHARED_STORE_PREFIX") {
                shared = shared.with_key_prefix(prefix);
            }
            config.shared_store = Some(shared);
        }

        Ok(config)
    }
}

fn parse_addr(key: &'static str, value: String) -> Result<SocketAddr, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value,
        reason: "expected host:port",
    })
}

fn parse_positive(key: &'static str, value: String) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            key,
            value,
            reason: "must be greater than zero",
        }),
        Ok(n) => Ok(n),
        Err(_) => Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected a positive integer",
        }),
    }
}

fn parse_secs(key: &'static str, value: String) -> Result<Duration, ConfigError> {
    parse_positive(key, value).map(Duration::from_secs)
}

fn parse_bool(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected true or false",
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.health_addr.to_string(), DEFAULT_HEALTH_ADDR);
        assert_eq!(config.grace_period, Duration::from_secs(60));
        assert_eq!(config.snapshot_max_age, Duration::from_secs(3600));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.room_capacity, 6);
        assert_eq!(config.keepalive_timeout, Duration::from_secs(300));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert!(config.shared_store.is_none());
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(load(&[]).unwrap(), ServerConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("UNO_BIND_ADDR", "127.0.0.1:4000"),
            ("UNO_GRACE_PERIOD_SECS", "15"),
            ("UNO_ROOM_CAPACITY", "4"),
            ("UNO_SHUTDOWN_TIMEOUT_MS", "250"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr.port(), 4000);
        assert_eq!(config.grace_period, Duration::from_secs(15));
        assert_eq!(config.room_capacity, 4);
        assert_eq!(config.shutdown_timeout, Duration::from_millis(250));
    }

    #[test]
    fn zero_grace_is_rejected() {
        let err = load(&[("UNO_GRACE_PERIOD_SECS", "0")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "UNO_GRACE_PERIOD_SECS",
                ..
            }
        ));
    }

    #[test]
    fn garbage_capacity_is_rejected() {
        assert!(load(&[("UNO_ROOM_CAPACITY", "six")]).is_err());
    }

    #[test]
    fn shared_store_needs_url() {
        assert_eq!(
            load(&[("UNO_SHARED_STORE_ENABLED", "true")]).unwrap_err(),
            ConfigError::MissingSharedStoreUrl
        );
        let config = load(&[
            ("UNO_SHARED_STORE_ENABLED", "1"),
            ("UNO_SHARED_STORE_URL", "redis://cache:6379"),
        ])
        .unwrap();
        let shared = config.shared_store.unwrap();
        assert_eq!(shared.url, "redis://cache:6379");
        assert_eq!(shared.key_prefix, "uno");
    }

    #[test]
    fn shared_store_url_ignored_when_disabled() {
        let config = load(&[("UNO_SHARED_STORE_URL", "redis://cache:6379")]).unwrap();
        assert!(config.shared_store.is_none());
    }

    #[test]
    fn capacity_builder_clamps_to_one() {
        assert_eq!(ServerConfig::new().with_room_capacity(0).room_capacity, 1);
    }
}
