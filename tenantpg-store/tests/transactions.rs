//! DB-backed integration tests for the transaction engine and the bulk
//! import session.
//!
//! Everything here needs a running Postgres and is ignored by default:
//!
//!     DATABASE_URL=postgres://... cargo test -p tenantpg-store -- --ignored

use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tenantpg_core::{PgConfig, PoolSettings, ProcessState};
use tenantpg_store::{unit_fn, PostgresStorage, RetryPolicy, TxError, TxSession, UnitError};

fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL required")
}

fn config_from_url(url: &str) -> PgConfig {
    let rest = url
        .trim_start_matches("postgres://")
        .trim_start_matches("postgresql://");
    let (creds, host_part) = rest.split_once('@').unwrap_or(("postgres", rest));
    let (user, password) = match creds.split_once(':') {
        Some((user, password)) => (user, Some(password.to_string())),
        None => (creds, None),
    };
    let (host_port, database) = host_part.split_once('/').unwrap_or((host_part, "postgres"));
    let (host, port) = match host_port.split_once(':') {
        Some((host, port)) => (host, port.parse().unwrap_or(5432)),
        None => (host_port, 5432),
    };
    PgConfig {
        host: host.to_string(),
        port,
        user: user.to_string(),
        password,
        database_name: database.to_string(),
        connection_pool_size: 5,
        pool: PoolSettings::for_testing(),
    }
}

/// Fresh storage layer plus a clean scratch table named `table`.
async fn setup(user_pool_id: &str, table: &str) -> PostgresStorage {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let storage = PostgresStorage::load_config(user_pool_id, config_from_url(&database_url()))
        .expect("config invalid");
    storage.init_storage().await.expect("init failed");

    let mut conn = storage.get_connection().await.expect("checkout failed");
    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(conn.as_mut())
        .await
        .expect("drop failed");
    sqlx::query(&format!(
        "CREATE TABLE {table} (k TEXT PRIMARY KEY, v BIGINT NOT NULL)"
    ))
    .execute(conn.as_mut())
    .await
    .expect("create failed");
    storage
}

async fn count_rows(storage: &PostgresStorage, table: &str) -> i64 {
    let mut conn = storage.get_connection().await.expect("checkout failed");
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(conn.as_mut())
        .await
        .expect("count failed")
}

#[tokio::test]
#[ignore = "requires database"]
async fn unit_commit_makes_writes_visible() {
    let storage = setup("it-commit", "it_commit").await;

    storage
        .start_transaction(unit_fn(|session: &mut TxSession<'_>| {
            Box::pin(async move {
                sqlx::query("INSERT INTO it_commit (k, v) VALUES ('a', 1)")
                    .execute(session.conn())
                    .await?;
                sqlx::query("INSERT INTO it_commit (k, v) VALUES ('b', 2)")
                    .execute(session.conn())
                    .await?;
                session.commit().await?;
                Ok::<(), UnitError<Infallible>>(())
            })
        }))
        .await
        .expect("transaction failed");

    assert_eq!(count_rows(&storage, "it_commit").await, 2);
    storage.close().await;
}

#[tokio::test]
#[ignore = "requires database"]
async fn uncommitted_success_is_rolled_back() {
    let storage = setup("it-forgot", "it_forgot").await;

    // Unit "succeeds" but never commits; the engine must not leak the
    // open transaction or its writes.
    storage
        .start_transaction(unit_fn(|session: &mut TxSession<'_>| {
            Box::pin(async move {
                sqlx::query("INSERT INTO it_forgot (k, v) VALUES ('a', 1)")
                    .execute(session.conn())
                    .await?;
                Ok::<(), UnitError<Infallible>>(())
            })
        }))
        .await
        .expect("transaction failed");

    assert_eq!(count_rows(&storage, "it_forgot").await, 0);
    storage.close().await;
}

#[derive(Debug, PartialEq, Eq)]
struct DuplicateKey(String);

#[tokio::test]
#[ignore = "requires database"]
async fn logic_error_rolls_back_and_keeps_its_type() {
    let storage = setup("it-logic", "it_logic").await;

    let err = storage
        .start_transaction(unit_fn(|session: &mut TxSession<'_>| {
            Box::pin(async move {
                sqlx::query("INSERT INTO it_logic (k, v) VALUES ('a', 1)")
                    .execute(session.conn())
                    .await?;
                // Domain rule fires after the write; everything must unwind.
                Err::<(), UnitError<DuplicateKey>>(UnitError::Logic(DuplicateKey("a".into())))
            })
        }))
        .await
        .expect_err("transaction should fail");

    assert_eq!(err.into_logic(), Some(DuplicateKey("a".into())));
    assert_eq!(count_rows(&storage, "it_logic").await, 0);
    storage.close().await;
}

#[tokio::test]
#[ignore = "requires database"]
async fn opposite_order_lock_deadlock_is_retried_and_both_commit() {
    let storage = std::sync::Arc::new(setup("it-deadlock", "it_deadlock").await);
    {
        let mut conn = storage.get_connection().await.expect("checkout failed");
        sqlx::query("INSERT INTO it_deadlock (k, v) VALUES ('A', 0), ('B', 0)")
            .execute(conn.as_mut())
            .await
            .expect("seed failed");
    }

    // T1 locks A then B, T2 locks B then A. The overlap window is wide
    // enough that the first attempts deadlock; the server aborts one
    // side, the engine retries it, both end up committed.
    async fn locking_unit(storage: &PostgresStorage, first: &str, second: &str) {
        let first = first.to_string();
        let second = second.to_string();
        storage
            .start_transaction(unit_fn(move |session: &mut TxSession<'_>| {
                let first = first.clone();
                let second = second.clone();
                Box::pin(async move {
                    sqlx::query("SELECT v FROM it_deadlock WHERE k = $1 FOR UPDATE")
                        .bind(&first)
                        .fetch_one(session.conn())
                        .await?;
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    sqlx::query("UPDATE it_deadlock SET v = v + 1 WHERE k = $1")
                        .bind(&second)
                        .execute(session.conn())
                        .await?;
                    session.commit().await?;
                    Ok::<(), UnitError<Infallible>>(())
                })
            }))
            .await
            .expect("transaction failed past retries");
    }

    let s1 = std::sync::Arc::clone(&storage);
    let s2 = std::sync::Arc::clone(&storage);
    let t1 = tokio::spawn(async move { locking_unit(&s1, "A", "B").await });
    let t2 = tokio::spawn(async move { locking_unit(&s2, "B", "A").await });
    t1.await.expect("t1 panicked");
    t2.await.expect("t2 panicked");

    let recorder = storage.recorder();
    assert_eq!(recorder.count_of(ProcessState::DeadlockFound), 1);
    assert!(recorder
        .last_event_of(ProcessState::DeadlockFound)
        .is_some());

    // Both increments applied
    let mut conn = storage.get_connection().await.expect("checkout failed");
    let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(v), 0)::BIGINT FROM it_deadlock")
        .fetch_one(conn.as_mut())
        .await
        .expect("sum failed");
    assert_eq!(total, 2);
    drop(conn);
    storage.close().await;
}

#[tokio::test]
#[ignore = "requires database"]
async fn persistent_conflict_exhausts_the_retry_cap() {
    let storage = setup("it-cap", "it_cap").await;
    let attempts = Arc::new(AtomicU32::new(0));
    let max_attempts = RetryPolicy::default().max_attempts;

    let unit_attempts = Arc::clone(&attempts);
    let err = storage
        .start_transaction(unit_fn(move |session: &mut TxSession<'_>| {
            let unit_attempts = Arc::clone(&unit_attempts);
            Box::pin(async move {
                unit_attempts.fetch_add(1, Ordering::SeqCst);
                // A serialization failure the server never resolves, so
                // every attempt conflicts.
                sqlx::query(
                    "DO $$ BEGIN RAISE EXCEPTION 'stale read' USING ERRCODE = '40001'; END $$",
                )
                .execute(session.conn())
                .await?;
                Ok::<(), UnitError<Infallible>>(())
            })
        }))
        .await
        .expect_err("conflict never clears");

    // The unit ran exactly max_attempts times, then the last conflict
    // surfaced unmodified as a query error.
    assert_eq!(attempts.load(Ordering::SeqCst), max_attempts);
    match &err {
        TxError::Query(query) => {
            let code = query
                .source_error()
                .as_database_error()
                .and_then(|db| db.code())
                .map(|code| code.to_string());
            assert_eq!(code.as_deref(), Some("40001"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        storage.recorder().count_of(ProcessState::DeadlockFound),
        max_attempts as usize - 1
    );
    storage.close().await;
}

#[tokio::test]
#[ignore = "requires database"]
async fn bulk_session_intercepts_commit_until_orchestrator_decides() {
    let storage = setup("it-bulk", "it_bulk").await;

    let mut bulk = storage.bulk_import_session().await.expect("open failed");
    assert!(!bulk.is_pinned());

    // Per-record query code: writes, then tries to finalize the way
    // ordinary units do. Both calls must be intercepted.
    {
        let mut session = bulk.session().await.expect("session failed");
        sqlx::query("INSERT INTO it_bulk (k, v) VALUES ('r1', 1)")
            .execute(session.conn())
            .await
            .expect("insert failed");
        session.commit().await.expect("no-op commit errored");
        session.rollback().await.expect("no-op rollback errored");
        assert!(!session.is_committed());
    }
    assert!(bulk.is_pinned());

    // Invisible outside: the pinned transaction is still open.
    assert_eq!(count_rows(&storage, "it_bulk").await, 0);

    // Still visible inside the pinned transaction, proving the earlier
    // commit/rollback really were no-ops.
    {
        let mut session = bulk.session().await.expect("session failed");
        let inside: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM it_bulk")
            .fetch_one(session.conn())
            .await
            .expect("count failed");
        assert_eq!(inside, 1);
    }

    // Orchestrator surface takes real effect.
    bulk.commit().await.expect("real commit failed");
    assert_eq!(count_rows(&storage, "it_bulk").await, 1);
    storage.close().await;
}

#[tokio::test]
#[ignore = "requires database"]
async fn bulk_session_rollback_discards_the_whole_batch() {
    let storage = setup("it-bulk-rb", "it_bulk_rb").await;

    let mut bulk = storage.bulk_import_session().await.expect("open failed");
    {
        let mut session = bulk.session().await.expect("session failed");
        sqlx::query("INSERT INTO it_bulk_rb (k, v) VALUES ('r1', 1)")
            .execute(session.conn())
            .await
            .expect("insert failed");
    }
    {
        let mut session = bulk.session().await.expect("session failed");
        sqlx::query("INSERT INTO it_bulk_rb (k, v) VALUES ('r2', 2)")
            .execute(session.conn())
            .await
            .expect("insert failed");
    }

    bulk.rollback().await.expect("rollback failed");
    assert_eq!(count_rows(&storage, "it_bulk_rb").await, 0);
    storage.close().await;
}

#[tokio::test]
#[ignore = "requires database"]
async fn disabled_layer_rejects_transactions_until_reenabled() {
    let storage = setup("it-disabled", "it_disabled").await;

    storage.set_storage_layer_enabled(false);
    let err = storage.get_connection().await.expect_err("should be disabled");
    assert!(matches!(
        err,
        tenantpg_store::StorageError::Disabled { .. }
    ));

    // Reactive recovery: flipping the flag back is enough.
    storage.set_storage_layer_enabled(true);
    storage.get_connection().await.expect("checkout failed");
    storage.close().await;
}
