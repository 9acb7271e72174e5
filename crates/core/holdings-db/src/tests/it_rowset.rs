//! Generic table load tests

use chrono::NaiveDate;
use pgtemp::PgTempDB;

use crate::{
    load::IfExists,
    record::{Rowset, Value},
    tests::{connect_store, connect_with_retry, count_rows},
};

fn prices(rows: &[(&str, u32, f64, Option<i64>)]) -> Rowset {
    let mut rowset = Rowset::new(["ticker", "trade_date", "close_price", "volume"]);
    for &(ticker, day, close, volume) in rows {
        rowset.push([
            Value::from(ticker),
            Value::from(NaiveDate::from_ymd_opt(2024, 1, day).expect("valid date")),
            Value::from(close),
            Value::from(volume),
        ]);
    }
    rowset
}

#[tokio::test]
async fn append_creates_missing_table_and_adds_rows() {
    //* Given
    let temp_db = PgTempDB::new();
    let mut store = connect_store(&temp_db.connection_uri()).await;
    let first = prices(&[("AAPL", 2, 185.64, Some(82_488_700)), ("MSFT", 2, 370.87, None)]);
    let second = prices(&[("AAPL", 3, 184.25, Some(58_414_500))]);

    //* When
    let loaded_first = store
        .load_rowset("ticker_prices", &first, IfExists::Append)
        .await;
    let loaded_second = store
        .load_rowset("ticker_prices", &second, IfExists::Append)
        .await;

    //* Then
    assert_eq!(loaded_first, 2);
    assert_eq!(loaded_second, 1);

    let mut conn = connect_with_retry(&temp_db.connection_uri())
        .await
        .expect("Failed to connect to temp db");
    assert_eq!(count_rows(&mut conn, "ticker_prices").await, 3);

    let volumes: Vec<Option<i64>> =
        sqlx::query_scalar("SELECT volume FROM ticker_prices ORDER BY trade_date, ticker")
            .fetch_all(&mut conn)
            .await
            .expect("Failed to read volumes");
    assert_eq!(volumes, [Some(82_488_700), None, Some(58_414_500)]);
}

#[tokio::test]
async fn replace_drops_previous_rows() {
    //* Given
    let temp_db = PgTempDB::new();
    let mut store = connect_store(&temp_db.connection_uri()).await;
    let first = prices(&[("AAPL", 2, 185.64, Some(1)), ("MSFT", 2, 370.87, Some(2))]);
    let second = prices(&[("GOOG", 3, 138.92, Some(3))]);
    store
        .load_rowset("ticker_prices", &first, IfExists::Append)
        .await;

    //* When
    let loaded = store
        .load_rowset("ticker_prices", &second, IfExists::Replace)
        .await;

    //* Then
    assert_eq!(loaded, 1);

    let mut conn = connect_with_retry(&temp_db.connection_uri())
        .await
        .expect("Failed to connect to temp db");
    let tickers: Vec<String> = sqlx::query_scalar("SELECT ticker FROM ticker_prices")
        .fetch_all(&mut conn)
        .await
        .expect("Failed to read tickers");
    assert_eq!(tickers, ["GOOG"]);
}

#[tokio::test]
async fn mismatched_rows_are_rejected_without_partial_load() {
    //* Given
    let temp_db = PgTempDB::new();
    let mut store = connect_store(&temp_db.connection_uri()).await;
    let mut rowset = prices(&[("AAPL", 2, 185.64, Some(1))]);
    rowset.push([Value::from("MSFT")]);

    //* When
    let loaded = store
        .load_rowset("ticker_prices", &rowset, IfExists::Append)
        .await;

    //* Then
    assert_eq!(loaded, 0);
    assert!(
        !store.table_exists("ticker_prices").await,
        "table creation should roll back with the failed load"
    );
}

#[tokio::test]
async fn empty_rowset_is_a_no_op() {
    //* Given
    let temp_db = PgTempDB::new();
    let mut store = connect_store(&temp_db.connection_uri()).await;

    //* When
    let loaded = store
        .load_rowset("ticker_prices", &prices(&[]), IfExists::Replace)
        .await;

    //* Then
    assert_eq!(loaded, 0);
    assert!(!store.table_exists("ticker_prices").await);
}
