/// Structured error types for tenantpg-core.
///
/// Uses `thiserror` for better API surface and error composition.
/// The store layer wraps these where configuration problems surface
/// during pool initialization.

use thiserror::Error;

/// Configuration validation and parsing errors.
///
/// All of these are fatal at load time: a tenant with a bad config must
/// terminate, not limp along with a half-built storage layer.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Pool size must be at least one connection
    #[error("invalid pool size 0: connection_pool_size must be greater than zero")]
    ZeroPoolSize,

    /// Required field missing or empty
    #[error("missing required config field '{field}'")]
    MissingField { field: &'static str },

    /// Retry timing may only be overridden under test instrumentation
    #[error("pool retry timing can only be overridden in test mode")]
    TimingOverrideOutsideTest,

    /// TOML parsing failed
    #[error("failed to parse config: {source}")]
    Parse {
        #[from]
        source: toml::de::Error,
    },
}

/// Result type alias for tenantpg-core operations
pub type Result<T> = std::result::Result<T, ConfigError>;
