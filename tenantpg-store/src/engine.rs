//! Transaction execution engine.
//!
//! Runs a caller-supplied unit of work inside an explicit transaction:
//! checkout, `BEGIN` at the requested isolation level, run the unit,
//! commit or rollback per [`CommitMode`], and return the connection to
//! the pool on every exit path. Serialization conflicts (40001/40P01)
//! retried on a fresh connection with jittered backoff, up to the
//! [`RetryPolicy`] attempt cap; resolved conflicts are invisible to the
//! caller, an exhausted cap surfaces the last driver error unmodified.

use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use sqlx::PgConnection;

use tenantpg_core::ProcessState;

use crate::error::{is_serialization_conflict, StorageQueryError, TxError, UnitError};
use crate::pool::PoolManager;

/// Transaction isolation level, issued as part of `BEGIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub(crate) fn begin_statement(self) -> &'static str {
        match self {
            Self::ReadCommitted => "BEGIN ISOLATION LEVEL READ COMMITTED",
            Self::RepeatableRead => "BEGIN ISOLATION LEVEL REPEATABLE READ",
            Self::Serializable => "BEGIN ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// Who finalizes a successful transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// The unit issues `session.commit()` as its last successful action;
    /// the engine only ever rolls back. Default contract.
    #[default]
    UnitCommits,
    /// The engine commits after the unit returns success.
    EngineCommits,
    /// Commit/rollback through the session are intercepted no-ops; an
    /// outer orchestrator owns finalization (bulk import).
    Deferred,
}

/// Retry cap and backoff window for serialization conflicts.
///
/// The defaults (3 attempts, 10-30 ms uniform jitter) are inherited
/// policy, not tuned optima; override them if your contention profile
/// says otherwise.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_min: Duration::from_millis(10),
            backoff_max: Duration::from_millis(30),
        }
    }
}

impl RetryPolicy {
    /// Uniform random delay to desynchronize colliding transactions.
    fn backoff(&self) -> Duration {
        let min = self.backoff_min.as_millis() as u64;
        let max = self.backoff_max.as_millis() as u64;
        if max <= min {
            return self.backoff_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finalized {
    Committed,
    RolledBack,
}

/// The connection-shaped surface a transaction unit works against.
///
/// Wraps the checked-out connection together with the commit mode, so
/// the same query code runs unchanged under the engine's one-unit-per-
/// transaction contract and under a bulk import session where
/// finalization is deferred to the orchestrator.
pub struct TxSession<'c> {
    conn: &'c mut PgConnection,
    mode: CommitMode,
    finalized: Option<Finalized>,
}

impl<'c> TxSession<'c> {
    pub(crate) fn new(conn: &'c mut PgConnection, mode: CommitMode) -> Self {
        Self {
            conn,
            mode,
            finalized: None,
        }
    }

    /// The underlying connection, inside the open transaction.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut *self.conn
    }

    /// Commit the transaction. In [`CommitMode::Deferred`] this is an
    /// intercepted no-op: the physical transaction stays open for the
    /// orchestrator.
    pub async fn commit(&mut self) -> Result<(), sqlx::Error> {
        if self.mode == CommitMode::Deferred || self.finalized.is_some() {
            return Ok(());
        }
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finalized = Some(Finalized::Committed);
        Ok(())
    }

    /// Roll the transaction back. Intercepted no-op in
    /// [`CommitMode::Deferred`].
    pub async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        if self.mode == CommitMode::Deferred || self.finalized.is_some() {
            return Ok(());
        }
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finalized = Some(Finalized::RolledBack);
        Ok(())
    }

    pub fn is_committed(&self) -> bool {
        self.finalized == Some(Finalized::Committed)
    }

    fn finalized(&self) -> Option<Finalized> {
        self.finalized
    }
}

/// Identity helper that pins a closure to the unit-of-work signature.
///
/// Closure lifetime inference cannot work out the higher-ranked
/// signature on its own at most call sites; routing the closure through
/// this function makes `runner.run(iso, mode, unit_fn(|session| ...))`
/// compile without explicit annotations.
pub fn unit_fn<T, E, F>(f: F) -> F
where
    F: for<'a, 'b> Fn(&'a mut TxSession<'b>) -> BoxFuture<'a, Result<T, UnitError<E>>>,
{
    f
}

enum AttemptError<E> {
    /// Retryable serialization conflict, after rollback.
    Conflict(sqlx::Error),
    /// Terminal failure for this run.
    Failed(TxError<E>),
}

/// Runs units of work against one instance's pool under the retry
/// policy. Cheap to clone.
#[derive(Clone)]
pub struct TransactionRunner {
    pools: PoolManager,
    policy: RetryPolicy,
}

impl TransactionRunner {
    pub fn new(pools: PoolManager) -> Self {
        Self::with_policy(pools, RetryPolicy::default())
    }

    pub fn with_policy(pools: PoolManager, policy: RetryPolicy) -> Self {
        Self { pools, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `unit` inside a transaction at `isolation`.
    ///
    /// The unit may run up to `max_attempts` times; it must be safe to
    /// re-execute from a clean transaction. Serialization conflicts
    /// between attempts are recorded (test mode) and absorbed; any other
    /// error rolls back and propagates, with the unit's typed errors
    /// carried unmodified in [`TxError::Logic`].
    pub async fn run<T, E, F>(
        &self,
        isolation: IsolationLevel,
        mode: CommitMode,
        unit: F,
    ) -> Result<T, TxError<E>>
    where
        F: for<'a, 'b> Fn(&'a mut TxSession<'b>) -> BoxFuture<'a, Result<T, UnitError<E>>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match self.attempt(isolation, mode, &unit).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Conflict(err)) if attempt < self.policy.max_attempts => {
                    self.pools
                        .instance()
                        .recorder()
                        .record(ProcessState::DeadlockFound, Some(err.to_string()));
                    let backoff = self.policy.backoff();
                    tracing::warn!(
                        user_pool_id = self.pools.instance().user_pool_id(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "serialization conflict, retrying transaction"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(AttemptError::Conflict(err)) => {
                    return Err(TxError::Query(StorageQueryError::from(err)))
                }
                Err(AttemptError::Failed(err)) => return Err(err),
            }
        }
    }

    /// One attempt: fresh connection, fresh `BEGIN`, guaranteed
    /// finalization before the connection returns to the pool.
    async fn attempt<T, E, F>(
        &self,
        isolation: IsolationLevel,
        mode: CommitMode,
        unit: &F,
    ) -> Result<T, AttemptError<E>>
    where
        F: for<'a, 'b> Fn(&'a mut TxSession<'b>) -> BoxFuture<'a, Result<T, UnitError<E>>>,
    {
        let mut conn = self
            .pools
            .get_connection()
            .await
            .map_err(|e| AttemptError::Failed(TxError::Storage(e)))?;

        sqlx::query(isolation.begin_statement())
            .execute(conn.as_mut())
            .await
            .map_err(|e| AttemptError::Failed(TxError::Query(StorageQueryError::from(e))))?;

        let (result, finalized) = {
            let mut session = TxSession::new(conn.as_mut(), mode);
            let result = unit(&mut session).await;
            (result, session.finalized())
        };

        match result {
            Ok(value) => {
                if finalized.is_none() {
                    match mode {
                        CommitMode::EngineCommits => {
                            if let Err(err) =
                                sqlx::query("COMMIT").execute(conn.as_mut()).await
                            {
                                // COMMIT itself can report a serialization
                                // conflict under SERIALIZABLE
                                if is_serialization_conflict(&err) {
                                    return Err(AttemptError::Conflict(err));
                                }
                                return Err(AttemptError::Failed(TxError::Query(
                                    StorageQueryError::from(err),
                                )));
                            }
                        }
                        CommitMode::UnitCommits | CommitMode::Deferred => {
                            // Contract: the unit commits. An open transaction
                            // must not leak back into the pool, so its writes
                            // are discarded.
                            let _ = sqlx::query("ROLLBACK").execute(conn.as_mut()).await;
                            tracing::warn!(
                                "unit returned success without committing; rolled back"
                            );
                        }
                    }
                }
                Ok(value)
            }
            Err(UnitError::Query(err)) => {
                let _ = sqlx::query("ROLLBACK").execute(conn.as_mut()).await;
                if is_serialization_conflict(&err) {
                    Err(AttemptError::Conflict(err))
                } else {
                    Err(AttemptError::Failed(TxError::Query(StorageQueryError::from(
                        err,
                    ))))
                }
            }
            Err(UnitError::Logic(e)) => {
                let _ = sqlx::query("ROLLBACK").execute(conn.as_mut()).await;
                Err(AttemptError::Failed(TxError::Logic(e)))
            }
        }
    }
}
