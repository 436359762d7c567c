//! Connection configuration for one storage instance.
//!
//! File loading and schema live with the host application; this module only
//! defines the validated shape the pool manager consumes. Parsing from TOML
//! is provided for hosts that hand us raw config text.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Default time between reconnect attempts while the database is down.
const DEFAULT_RETRY_INTERVAL_MS: u64 = 10_000;

/// Default cap on total time spent waiting for the database at startup.
const DEFAULT_MAX_INIT_WAIT_MS: u64 = 3_600_000;

/// Postgres connection settings for one tenant/user-pool instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database_name: String,
    /// Upper bound on pooled connections. Must be > 0.
    pub connection_pool_size: u32,
    #[serde(default)]
    pub pool: PoolSettings,
}

/// Startup-retry and instrumentation knobs for the connection pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_retry_interval_ms")]
    retry_interval_ms: u64,
    #[serde(default = "default_max_init_wait_ms")]
    max_init_wait_ms: u64,
    /// Enables the process state recorder and timing overrides.
    #[serde(default)]
    test_mode: bool,
}

fn default_retry_interval_ms() -> u64 {
    DEFAULT_RETRY_INTERVAL_MS
}

fn default_max_init_wait_ms() -> u64 {
    DEFAULT_MAX_INIT_WAIT_MS
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_init_wait_ms: DEFAULT_MAX_INIT_WAIT_MS,
            test_mode: false,
        }
    }
}

impl PoolSettings {
    /// Settings for test instrumentation: recorder active, timing overridable.
    pub fn for_testing() -> Self {
        Self {
            test_mode: true,
            ..Self::default()
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn max_init_wait(&self) -> Duration {
        Duration::from_millis(self.max_init_wait_ms)
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    /// Override startup-retry timing. Sub-second values are preserved.
    ///
    /// Production tenants run with the documented defaults; only test
    /// instrumentation may shorten them.
    pub fn set_timing(
        &mut self,
        retry_interval: Duration,
        max_init_wait: Duration,
    ) -> Result<(), ConfigError> {
        if !self.test_mode {
            return Err(ConfigError::TimingOverrideOutsideTest);
        }
        self.retry_interval_ms = retry_interval.as_millis() as u64;
        self.max_init_wait_ms = max_init_wait.as_millis() as u64;
        Ok(())
    }
}

impl PgConfig {
    /// Parse config from TOML text and validate it.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config. Fails hard so a misconfigured tenant never
    /// reaches pool initialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingField { field: "host" });
        }
        if self.user.is_empty() {
            return Err(ConfigError::MissingField { field: "user" });
        }
        if self.database_name.is_empty() {
            return Err(ConfigError::MissingField {
                field: "database_name",
            });
        }
        if self.connection_pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        Ok(())
    }
}
