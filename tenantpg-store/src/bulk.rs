//! Bulk import transaction session.
//!
//! A batch import applies many independently-written query functions and
//! must land atomically. Those functions were written against the
//! one-unit-per-transaction contract and finalize eagerly, so this
//! session pins one physical connection, hands the functions a
//! [`TxSession`] whose commit/rollback are intercepted no-ops, and keeps
//! the real finalization on the session itself for the import driver.
//!
//! Single-writer by construction: all surfaces take `&mut self`, one
//! physical connection serves one batch driver.

use std::sync::Arc;

use sqlx::pool::PoolConnection;
use sqlx::postgres::Postgres;
use sqlx::PgPool;

use tenantpg_core::StorageInstance;

use crate::engine::{CommitMode, IsolationLevel, TxSession};
use crate::error::{StorageError, StorageQueryError};
use crate::pool::connect;

/// One pinned-connection import job against a storage instance.
pub struct BulkImportSession {
    instance: Arc<StorageInstance>,
    /// Dedicated pool capped at one connection, so the whole job is
    /// deterministically pinned and concurrent sub-transactions on the
    /// same logical session are impossible.
    pool: PgPool,
    pinned: Option<PoolConnection<Postgres>>,
}

impl BulkImportSession {
    /// Open a session for the instance. Connects its dedicated
    /// single-connection pool eagerly; the transaction itself starts on
    /// first [`session`](Self::session) call.
    pub async fn open(instance: Arc<StorageInstance>) -> Result<Self, StorageError> {
        if !instance.is_enabled() {
            return Err(StorageError::Disabled {
                user_pool_id: instance.user_pool_id().to_string(),
            });
        }
        let pool = connect(instance.config(), 1)
            .await
            .map_err(StorageQueryError::from)?;
        tracing::info!(
            user_pool_id = instance.user_pool_id(),
            "bulk import session opened"
        );
        Ok(Self {
            instance,
            pool,
            pinned: None,
        })
    }

    /// The standard connection-like surface for per-record query code.
    ///
    /// First call pins the connection and issues
    /// `BEGIN ISOLATION LEVEL SERIALIZABLE` exactly once; every call
    /// returns a session in [`CommitMode::Deferred`], so commit/rollback
    /// attempts from reused query code cannot finalize the shared
    /// transaction.
    pub async fn session(&mut self) -> Result<TxSession<'_>, StorageError> {
        let conn = match self.pinned {
            Some(ref mut conn) => conn,
            None => {
                let mut conn = self
                    .pool
                    .acquire()
                    .await
                    .map_err(StorageQueryError::from)?;
                sqlx::query(IsolationLevel::Serializable.begin_statement())
                    .execute(conn.as_mut())
                    .await
                    .map_err(StorageQueryError::from)?;
                tracing::debug!(
                    user_pool_id = self.instance.user_pool_id(),
                    "bulk import transaction pinned"
                );
                self.pinned.insert(conn)
            }
        };
        Ok(TxSession::new(conn.as_mut(), CommitMode::Deferred))
    }

    /// Whether the pinned transaction has been started.
    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    /// Orchestrator surface: really commit the whole batch.
    pub async fn commit(mut self) -> Result<(), StorageError> {
        if let Some(mut conn) = self.pinned.take() {
            sqlx::query("COMMIT")
                .execute(conn.as_mut())
                .await
                .map_err(StorageQueryError::from)?;
        }
        self.shutdown("committed").await;
        Ok(())
    }

    /// Orchestrator surface: really roll the whole batch back.
    pub async fn rollback(mut self) -> Result<(), StorageError> {
        if let Some(mut conn) = self.pinned.take() {
            sqlx::query("ROLLBACK")
                .execute(conn.as_mut())
                .await
                .map_err(StorageQueryError::from)?;
        }
        self.shutdown("rolled back").await;
        Ok(())
    }

    /// Orchestrator surface: close without committing. Anything
    /// uncommitted on the pinned connection is rolled back.
    pub async fn close(mut self) {
        if let Some(mut conn) = self.pinned.take() {
            let _ = sqlx::query("ROLLBACK").execute(conn.as_mut()).await;
        }
        self.shutdown("closed").await;
    }

    async fn shutdown(&self, outcome: &str) {
        self.pool.close().await;
        tracing::info!(
            user_pool_id = self.instance.user_pool_id(),
            outcome,
            "bulk import session finished"
        );
    }
}
