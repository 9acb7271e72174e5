//! SQL wrapper functions for the quarter filter
//!
//! Every statement restricts the source table with the same half-open range on the partition
//! key (`$1` inclusive, `$2` exclusive), so the planner prunes the source to the partition of
//! a single quarter. Table names are validated and quoted by the caller.

use chrono::NaiveDate;
use indoc::formatdoc;
use sqlx::{Executor, Postgres};

use crate::{record::PARTITION_KEY, sql::quote};

/// Columns of the filtered holdings table, in insert order.
pub const FILTERED_COLUMNS: &[&str] = &[
    "nameofissuer",
    "cusip",
    "sshprnamt",
    "cik",
    "year",
    "quarter",
    PARTITION_KEY,
];

/// Column definitions of the filtered holdings table.
pub const FILTERED_SCHEMA: &[(&str, &str, bool)] = &[
    ("nameofissuer", "TEXT", true),
    ("cusip", "TEXT", true),
    ("sshprnamt", "DOUBLE PRECISION", true),
    ("cik", "TEXT", true),
    ("year", "INT", true),
    ("quarter", "INT", true),
    (PARTITION_KEY, "DATE", false),
];

/// Source rows of the quarter.
pub fn count_source_statement(source: &str) -> String {
    let key = quote(PARTITION_KEY);
    formatdoc! {"
        SELECT COUNT(*)
        FROM {source}
        WHERE {key} >= $1 AND {key} < $2
    ",
        source = quote(source),
    }
}

/// Mapped security identifiers, one row per identifier.
///
/// The mapping is unique on `(cusip, ticker)`, so a security traded under several tickers
/// appears more than once; joining the distinct identifiers keeps one output row per source
/// row.
fn mapped_cusips(mapping: &str) -> String {
    format!("(SELECT DISTINCT cusip FROM {})", quote(mapping))
}

/// Source rows of the quarter whose security identifier is mapped.
pub fn count_joined_statement(source: &str, mapping: &str) -> String {
    let key = quote(PARTITION_KEY);
    formatdoc! {"
        SELECT COUNT(*)
        FROM {source} h
        INNER JOIN {mapped} t ON h.cusip = t.cusip
        WHERE h.{key} >= $1 AND h.{key} < $2
    ",
        source = quote(source),
        mapped = mapped_cusips(mapping),
    }
}

/// Copies the mapped source rows of the quarter into the target table.
pub fn insert_joined_statement(source: &str, mapping: &str, target: &str) -> String {
    let key = quote(PARTITION_KEY);
    let columns = crate::sql::column_list(FILTERED_COLUMNS);
    let selected = FILTERED_COLUMNS
        .iter()
        .map(|column| format!("h.{}", quote(column)))
        .collect::<Vec<_>>()
        .join(", ");
    formatdoc! {"
        INSERT INTO {target} ({columns})
        SELECT {selected}
        FROM {source} h
        INNER JOIN {mapped} t ON h.cusip = t.cusip
        WHERE h.{key} >= $1 AND h.{key} < $2
    ",
        target = quote(target),
        source = quote(source),
        mapped = mapped_cusips(mapping),
    }
}

pub async fn count_in_range<'c, E>(
    exe: E,
    statement: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(statement)
        .bind(from)
        .bind(to)
        .fetch_one(exe)
        .await
}

pub async fn insert_in_range<'c, E>(
    exe: E,
    statement: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(statement)
        .bind(from)
        .bind(to)
        .execute(exe)
        .await?;
    Ok(result.rows_affected())
}
