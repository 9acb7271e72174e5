//! Table lifecycle tests

use std::time::Duration;

use chrono::NaiveDate;
use pgtemp::PgTempDB;

use crate::{
    record::{HoldingRecord, Rowset, Value},
    schema::{self, TableOutcome},
    tests::{CapturedLogs, connect_store, connect_with_retry},
};

#[tokio::test]
async fn ensure_parent_table_twice_creates_one_partitioned_table() {
    //* Given
    let temp_db = PgTempDB::new();
    let mut conn = connect_with_retry(&temp_db.connection_uri())
        .await
        .expect("Failed to connect to temp db");

    //* When
    let first = schema::ensure_parent_table(&mut conn, "holdings")
        .await
        .expect("Failed to create parent table");
    let second = schema::ensure_parent_table(&mut conn, "holdings")
        .await
        .expect("Second ensure should not fail");

    //* Then
    assert_eq!(first, TableOutcome::Created);
    assert_eq!(
        second,
        TableOutcome::AlreadyExists,
        "second call should be a no-op"
    );

    let kinds: Vec<String> =
        sqlx::query_scalar("SELECT relkind::text FROM pg_class WHERE relname = 'holdings'")
            .fetch_all(&mut conn)
            .await
            .expect("Failed to query catalog");
    assert_eq!(kinds, ["p"], "exactly one range-partitioned parent should exist");
}

#[tokio::test]
async fn parent_table_rejects_null_partition_key() {
    //* Given
    let temp_db = PgTempDB::new();
    let mut conn = connect_with_retry(&temp_db.connection_uri())
        .await
        .expect("Failed to connect to temp db");
    schema::ensure_parent_table(&mut conn, "holdings")
        .await
        .expect("Failed to create parent table");

    //* When
    let result = sqlx::query("INSERT INTO holdings (cusip) VALUES ('037833100')")
        .execute(&mut conn)
        .await;

    //* Then
    assert!(result.is_err(), "rows without a period must be rejected");
}

#[tokio::test]
async fn create_table_infers_column_types_from_sample() {
    //* Given
    let temp_db = PgTempDB::new();
    let mut conn = connect_with_retry(&temp_db.connection_uri())
        .await
        .expect("Failed to connect to temp db");

    let mut sample = Rowset::new(["ticker", "trade_date", "close_price", "volume", "halted"]);
    sample.push([
        Value::from("AAPL"),
        Value::from(NaiveDate::from_ymd_opt(2024, 1, 2).expect("valid date")),
        Value::from(185.64),
        Value::from(82_488_700_i64),
        Value::from(false),
    ]);

    //* When
    let outcome = schema::create_table(&mut conn, "ticker_prices", &sample)
        .await
        .expect("Failed to create table");
    let again = schema::create_table(&mut conn, "ticker_prices", &sample)
        .await
        .expect("Recreating should not fail");

    //* Then
    assert_eq!(outcome, TableOutcome::Created);
    assert_eq!(again, TableOutcome::AlreadyExists);

    let types: Vec<(String, String)> = sqlx::query_as(indoc::indoc! {"
        SELECT column_name::text, data_type::text
        FROM information_schema.columns
        WHERE table_name = 'ticker_prices'
        ORDER BY ordinal_position
    "})
    .fetch_all(&mut conn)
    .await
    .expect("Failed to read columns");

    let expected = [
        ("ticker", "text"),
        ("trade_date", "date"),
        ("close_price", "numeric"),
        ("volume", "bigint"),
        ("halted", "boolean"),
    ];
    assert_eq!(types.len(), expected.len());
    for ((name, data_type), (expected_name, expected_type)) in types.iter().zip(expected) {
        assert_eq!(name, expected_name);
        assert_eq!(data_type, expected_type, "column {name} has the wrong type");
    }
}

#[tokio::test]
async fn drop_table_is_safe_for_missing_tables() {
    //* Given
    let temp_db = PgTempDB::new();
    let mut store = connect_store(&temp_db.connection_uri()).await;
    assert!(store.ensure_parent_table("holdings").await);

    //* When
    let dropped = store.drop_table("holdings").await;
    let dropped_again = store.drop_table("holdings").await;

    //* Then
    assert!(dropped);
    assert!(dropped_again, "dropping a missing table should succeed");
    assert!(!store.table_exists("holdings").await);
}

#[tokio::test]
async fn boundary_reports_invalid_names_as_false() {
    //* Given
    let temp_db = PgTempDB::new();
    let mut store = connect_store(&temp_db.connection_uri()).await;

    //* When
    let created = store.ensure_parent_table("holdings; DROP TABLE x").await;

    //* Then
    assert!(!created);
    assert!(
        store.is_connected(),
        "validation failures should not drop the session"
    );
}

#[tokio::test]
async fn store_reconnects_after_disconnect() {
    //* Given
    let temp_db = PgTempDB::new();
    let mut store = connect_store(&temp_db.connection_uri()).await;
    store.disconnect().await;
    assert!(!store.is_connected());

    //* When
    let created = store.ensure_parent_table("holdings").await;

    //* Then
    assert!(created, "operations should reconnect on demand");
    assert!(store.is_connected());
}

#[tokio::test]
async fn boundary_failures_are_logged_once() {
    //* Given
    let temp_db = PgTempDB::new();
    let mut store = connect_store(&temp_db.connection_uri()).await;
    let (logs, _guard) = CapturedLogs::install();

    //* When
    let created = store.ensure_parent_table("holdings; DROP TABLE x").await;
    let loaded = store
        .ingest(&[HoldingRecord::new(2013, 2)], "holdings; DROP TABLE x")
        .await;

    //* Then
    assert!(!created);
    assert_eq!(loaded, 0);

    let errors = logs.error_lines();
    assert_eq!(errors.len(), 2, "one error event per failed call: {errors:#?}");
    assert!(errors[0].contains("holdings_operation_failed"));
    assert!(errors[1].contains("ingest_failed"));
}

#[tokio::test]
async fn store_reconnects_after_server_drops_the_session() {
    //* Given
    let temp_db = PgTempDB::new();
    let mut store = connect_store(&temp_db.connection_uri()).await;
    let mut admin = connect_with_retry(&temp_db.connection_uri())
        .await
        .expect("Failed to connect to temp db");

    let other_sessions = indoc::indoc! {"
        FROM pg_stat_activity
        WHERE datname = current_database()
          AND pid <> pg_backend_pid()
          AND backend_type = 'client backend'
    "};

    let terminated: Vec<bool> =
        sqlx::query_scalar(&format!("SELECT pg_terminate_backend(pid) {other_sessions}"))
            .fetch_all(&mut admin)
            .await
            .expect("Failed to terminate store session");
    assert!(!terminated.is_empty(), "the store session should be listed");

    // Wait for the terminated backends to exit
    for _ in 0..100 {
        let remaining: i64 = sqlx::query_scalar(&format!("SELECT count(*) {other_sessions}"))
            .fetch_one(&mut admin)
            .await
            .expect("Failed to poll sessions");
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    //* When
    let created = store.ensure_parent_table("holdings").await;

    //* Then
    assert!(created, "the first call after the drop should reconnect and succeed");
    assert!(store.is_connected());
}
