//! Integration tests for retry behaviour through the executors.

use serde_json::json;
use std::time::Duration;
use surreal_conn::db::{
    AsyncConnection, AsyncExecutor, AsyncSingleConnection, RetryPolicy, SyncConnection,
    SyncExecutor, SyncSingleConnection,
};
use surreal_conn::testing::{MockConnector, MockEvent};
use surreal_conn::DbError;

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_between_attempts() {
    let connector = MockConnector::new();
    connector.seed("user:1", json!({"name": "Ann"}));
    let conn = connector.open();
    conn.controls().fail_next(3);
    let single = AsyncSingleConnection::new(conn, RetryPolicy::new(3, Duration::from_millis(50)));

    let start = tokio::time::Instant::now();
    let record = single
        .execute_with_retry(|c| Box::pin(async move { AsyncConnection::select(c, "user:1").await }))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(record["name"], "Ann");
    // 50ms + 100ms + 200ms
    assert!(elapsed >= Duration::from_millis(350));
    assert!(elapsed < Duration::from_millis(400));
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_reports_connection_error_with_cause() {
    let connector = MockConnector::new();
    let conn = connector.open();
    conn.controls().fail_next(usize::MAX);
    let single = AsyncSingleConnection::new(conn, RetryPolicy::new(2, Duration::from_millis(10)));

    let err = single
        .execute_with_retry(|c| {
            Box::pin(async move { AsyncConnection::create(c, "user", None).await })
        })
        .await
        .unwrap_err();

    assert!(err.is_connection_error());
    assert!(err.to_string().contains("3 attempts"));
    assert!(matches!(err.root_cause(), DbError::Protocol { .. }));
    assert!(err.suggestion().is_some());
}

#[test]
fn test_retried_write_can_apply_twice() {
    let connector = MockConnector::new();
    let conn = connector.open();
    let single = SyncSingleConnection::new(conn, RetryPolicy::new(1, Duration::from_millis(1)));

    // The first attempt reaches the store, then reports a transport failure.
    let mut attempts = 0;
    single
        .execute_with_retry(|c| {
            attempts += 1;
            let created = SyncConnection::create(c, "event", Some(json!({"kind": "click"})))?;
            if attempts == 1 {
                return Err(DbError::protocol("connection reset after write"));
            }
            Ok(created)
        })
        .unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(connector.store().table("event").len(), 2);
    let creates = connector
        .events()
        .into_iter()
        .filter(|e| matches!(e, MockEvent::Call(_, "create", _)))
        .count();
    assert_eq!(creates, 2);
}

#[test]
fn test_invalid_table_rejected_before_any_call() {
    let connector = MockConnector::new();
    let single = SyncSingleConnection::new(
        connector.open(),
        RetryPolicy::new(3, Duration::from_millis(1)),
    );
    let crud = surreal_conn::query::SyncCrudHelpers::new(&single);

    let err = crud.insert_one("bad table", json!({})).unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert!(connector.events().iter().all(|e| !matches!(e, MockEvent::Call(..))));
}
