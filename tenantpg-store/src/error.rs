//! Error taxonomy for the store layer.
//!
//! Three families a caller needs to tell apart:
//! - [`StorageError`]: lifecycle failures (disabled instance, pool never
//!   initialized, startup timeout). Fatal for the tenant.
//! - [`StorageQueryError`]: infrastructure/driver failures inside a
//!   transaction attempt.
//! - `TxError::Logic`: a typed domain error raised by the unit itself,
//!   carried unmodified so callers can pattern-match the original value.

use std::time::Duration;
use thiserror::Error;

use tenantpg_core::ConfigError;

/// SQLSTATE class for a serialization failure under SERIALIZABLE.
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE for a deadlock the server broke by aborting one side.
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

/// Infrastructure/driver-level failure, distinct from unit logic errors.
#[derive(Error, Debug)]
#[error("storage query error: {source}")]
pub struct StorageQueryError {
    #[from]
    source: sqlx::Error,
}

impl StorageQueryError {
    pub fn source_error(&self) -> &sqlx::Error {
        &self.source
    }
}

/// Lifecycle errors for a storage instance. All variants except
/// `Disabled` indicate a programming or deployment fault that should
/// terminate the tenant rather than be retried.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The instance is administratively disabled; never enters the
    /// connectivity retry loop.
    #[error("storage instance '{user_pool_id}' is disabled")]
    Disabled { user_pool_id: String },

    /// `get_connection` before `init_pool` succeeded.
    #[error("connection pool for '{user_pool_id}' was never initialized")]
    PoolNotInitialized { user_pool_id: String },

    /// `init_pool` called without the instance's own token.
    #[error("init_pool for '{user_pool_id}' called from a context that does not own the instance")]
    NotOwner { user_pool_id: String },

    /// Database stayed unreachable past the configured max wait.
    #[error("database unreachable after {waited:?}: {source}")]
    InitTimedOut {
        waited: Duration,
        source: sqlx::Error,
    },

    /// External shutdown aborted the startup retry wait.
    #[error("pool initialization interrupted by shutdown")]
    InitInterrupted,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Query(#[from] StorageQueryError),
}

/// What a transaction unit may raise: a driver failure (propagated with
/// `?` thanks to the `From` impl) or a typed domain error.
#[derive(Error, Debug)]
pub enum UnitError<E> {
    #[error(transparent)]
    Query(#[from] sqlx::Error),

    #[error("transaction logic error")]
    Logic(E),
}

/// Error surfaced by the transaction engine after retries are exhausted
/// or a non-retryable failure occurred.
#[derive(Error, Debug)]
pub enum TxError<E> {
    /// Lifecycle failure acquiring a connection.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Driver failure inside the attempt, after rollback.
    #[error(transparent)]
    Query(#[from] StorageQueryError),

    /// The unit's own typed error, unmodified.
    #[error("transaction logic error")]
    Logic(E),
}

impl<E> TxError<E> {
    /// The unit's typed error, if that is what this is.
    pub fn into_logic(self) -> Option<E> {
        match self {
            TxError::Logic(e) => Some(e),
            _ => None,
        }
    }
}

/// Whether this SQLSTATE names a serialization conflict the engine may
/// transparently retry.
pub fn sqlstate_is_serialization_conflict(code: &str) -> bool {
    code == SQLSTATE_SERIALIZATION_FAILURE || code == SQLSTATE_DEADLOCK_DETECTED
}

/// Structured check against the driver's error taxonomy; no message-text
/// matching, which breaks across driver versions.
pub fn is_serialization_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| sqlstate_is_serialization_conflict(&code)),
        _ => false,
    }
}

/// Whether a connect failure is the transient connection-refused class
/// the startup retry loop handles, as opposed to a fatal one (bad
/// credentials, unknown database).
pub fn is_connection_refused(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
        ),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}
