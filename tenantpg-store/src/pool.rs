//! Connection pool lifecycle for one storage instance.
//!
//! The pool is created lazily by the instance's owner context and lives
//! in the instance registry, so a second `init_pool` is an identity
//! no-op. While the database is unreachable at startup the owner blocks
//! in a cancellable retry loop; everything after initialization is plain
//! sqlx checkout.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions, Postgres};
use sqlx::pool::PoolConnection;
use sqlx::PgPool;

use tenantpg_core::{InitToken, PgConfig, ProcessState, StorageInstance};

use crate::error::{is_connection_refused, StorageError, StorageQueryError};

/// Registry key for the instance's pool singleton.
const POOL_KEY: &str = "connection-pool";

/// Pool lifecycle operations scoped to one instance. Cheap to clone.
#[derive(Clone)]
pub struct PoolManager {
    instance: Arc<StorageInstance>,
}

impl PoolManager {
    pub fn new(instance: Arc<StorageInstance>) -> Self {
        Self { instance }
    }

    pub fn instance(&self) -> &Arc<StorageInstance> {
        &self.instance
    }

    /// Initialize the instance's pool, retrying while the database is
    /// unreachable.
    ///
    /// Idempotent once a pool exists. Requires the instance's own
    /// [`InitToken`]; calling with any other token is a configuration
    /// fault and fails with [`StorageError::NotOwner`]. A disabled
    /// instance fails immediately without touching the network. Both the
    /// connect attempts and the retry waits are aborted by
    /// [`StorageInstance::request_interrupt`], and no attempt may run
    /// past the configured max init wait.
    pub async fn init_pool(&self, token: &InitToken) -> Result<(), StorageError> {
        let user_pool_id = self.instance.user_pool_id();

        if !token.owns(&self.instance) {
            return Err(StorageError::NotOwner {
                user_pool_id: user_pool_id.to_string(),
            });
        }
        if !self.instance.is_enabled() {
            return Err(StorageError::Disabled {
                user_pool_id: user_pool_id.to_string(),
            });
        }
        if self.instance.registry().get_as::<PgPool>(POOL_KEY).is_some() {
            return Ok(());
        }

        let config = self.instance.config();
        let retry_interval = config.pool.retry_interval();
        let max_wait = config.pool.max_init_wait();
        let started = Instant::now();

        // Register interrupt interest before the first liveness check so
        // an interrupt landing between the check and the select is not
        // lost. The same listener covers connect attempts and retry
        // sleeps alike; a connect that merely hangs (unreachable host,
        // dropped packets) is as abortable as a sleeping retry.
        let interrupted = self.instance.interrupt().notified();
        tokio::pin!(interrupted);
        interrupted.as_mut().enable();

        loop {
            if self.instance.interrupt_requested() {
                return self.init_interrupted();
            }

            // Each connect attempt is bounded by whatever is left of the
            // max wait, so a hanging connect cannot overshoot it.
            let remaining = max_wait.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return self.init_timed_out(started.elapsed(), sqlx::Error::PoolTimedOut);
            }

            let outcome = tokio::select! {
                _ = interrupted.as_mut() => return self.init_interrupted(),
                outcome = tokio::time::timeout(
                    remaining,
                    connect(config, config.connection_pool_size),
                ) => outcome,
            };

            let err = match outcome {
                Ok(Ok(pool)) => {
                    self.instance
                        .registry()
                        .set_if_absent(POOL_KEY, Arc::new(pool));
                    tracing::info!(
                        user_pool_id,
                        pool_size = config.connection_pool_size,
                        "connection pool initialized"
                    );
                    return Ok(());
                }
                Ok(Err(err)) if is_connection_refused(&err) => err,
                Ok(Err(err)) => {
                    self.instance
                        .recorder()
                        .record(ProcessState::InitFailure, Some(err.to_string()));
                    return Err(StorageQueryError::from(err).into());
                }
                Err(_elapsed) => {
                    return self.init_timed_out(started.elapsed(), sqlx::Error::PoolTimedOut);
                }
            };

            let waited = started.elapsed();
            if waited + retry_interval > max_wait {
                return self.init_timed_out(waited, err);
            }
            tracing::warn!(
                user_pool_id,
                retry_in_secs = retry_interval.as_secs(),
                error = %err,
                "database unreachable, will retry"
            );
            tokio::select! {
                _ = interrupted.as_mut() => return self.init_interrupted(),
                _ = tokio::time::sleep(retry_interval) => {}
            }
        }
    }

    fn init_timed_out(&self, waited: Duration, source: sqlx::Error) -> Result<(), StorageError> {
        tracing::error!(
            user_pool_id = self.instance.user_pool_id(),
            waited_secs = waited.as_secs(),
            "database unreachable past max wait, giving up"
        );
        self.instance
            .recorder()
            .record(ProcessState::InitFailure, Some(source.to_string()));
        Err(StorageError::InitTimedOut { waited, source })
    }

    fn init_interrupted(&self) -> Result<(), StorageError> {
        tracing::warn!(
            user_pool_id = self.instance.user_pool_id(),
            "pool initialization aborted by shutdown"
        );
        self.instance
            .recorder()
            .record(ProcessState::ShuttingDown, None);
        Err(StorageError::InitInterrupted)
    }

    /// The instance's pool, if initialization has happened.
    pub fn pool(&self) -> Result<Arc<PgPool>, StorageError> {
        if !self.instance.is_enabled() {
            return Err(StorageError::Disabled {
                user_pool_id: self.instance.user_pool_id().to_string(),
            });
        }
        self.instance
            .registry()
            .get_as::<PgPool>(POOL_KEY)
            .ok_or_else(|| StorageError::PoolNotInitialized {
                user_pool_id: self.instance.user_pool_id().to_string(),
            })
    }

    /// Check out one connection. Fails without retry when the pool was
    /// never initialized or the instance is disabled; blocks on sqlx's
    /// internal queue when the pool is saturated.
    pub async fn get_connection(&self) -> Result<PoolConnection<Postgres>, StorageError> {
        let pool = self.pool()?;
        let conn = pool.acquire().await.map_err(StorageQueryError::from)?;
        Ok(conn)
    }

    /// Release all pooled connections. No-op when never initialized.
    pub async fn close(&self) {
        if let Some(pool) = self.instance.registry().get_as::<PgPool>(POOL_KEY) {
            self.instance
                .recorder()
                .record(ProcessState::ShuttingDown, None);
            pool.close().await;
            tracing::info!(
                user_pool_id = self.instance.user_pool_id(),
                "connection pool closed"
            );
        }
    }
}

/// Connection options built field by field. Credentials never pass
/// through URL parsing, so a password full of URL metacharacters needs
/// no escaping.
fn pg_connect_options(config: &PgConfig) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .database(&config.database_name);
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    options
}

/// Create a bounded Postgres pool and verify connectivity eagerly, so
/// the retry loop sees connect failures here rather than on first use.
pub(crate) async fn connect(config: &PgConfig, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(pg_connect_options(config))
        .await
}
