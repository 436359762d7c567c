//! tenantpg-core: instance-scoped types for the tenantpg storage layer.
//!
//! Holds everything the Postgres-facing store crate builds on but that
//! never touches the driver: validated connection config, the
//! per-instance singleton registry, the test-mode process state
//! recorder, and the storage instance lifecycle with its init token.

pub mod config;
pub mod error;
pub mod instance;
pub mod recorder;
pub mod registry;

pub use config::{PgConfig, PoolSettings};
pub use error::ConfigError;
pub use instance::{InitToken, StorageInstance};
pub use recorder::{ProcessState, ProcessStateEvent, ProcessStateRecorder};
pub use registry::{ResourceRegistry, SingletonResource};
