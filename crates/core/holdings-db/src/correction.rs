//! Optional value-per-share correction.
//!
//! Reported values are frequently off by orders of magnitude (thousands vs. units). The
//! correction replaces every row's `value_per_share` with the median of its quarter and
//! recomputes `value` from it. It rewrites reported data and is therefore never part of
//! ingestion unless asked for through [`IngestOptions`](crate::ingest::IngestOptions).

use std::collections::HashMap;

use sqlx::PgConnection;

use crate::{
    quarter::YearQuarter,
    record::{HoldingRecord, PARTITION_KEY},
    sql::{ValidateIdentifierError, quote, validate_identifier},
};

/// Errors that occur when applying the correction in the database
#[derive(Debug, thiserror::Error)]
pub enum CorrectionError {
    /// Table name is not a valid identifier
    #[error("Invalid table name '{table_name}'")]
    InvalidTableName {
        table_name: String,
        #[source]
        source: ValidateIdentifierError,
    },

    /// The UPDATE statement failed
    #[error("Failed to correct value per share in '{table_name}' for {period}")]
    Update {
        table_name: String,
        period: YearQuarter,
        #[source]
        source: sqlx::Error,
    },
}

/// Median of the finite values, `None` when there are none.
///
/// An even count yields the mean of the two middle values.
pub fn median(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut values: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);

    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Applies the correction to an in-memory batch, per `(year, quarter)`.
///
/// Groups without any finite `value_per_share` are left untouched. `value` becomes empty for
/// rows without a share count.
pub fn apply_median_correction(records: &mut [HoldingRecord]) {
    let mut groups: HashMap<(i32, i32), Vec<f64>> = HashMap::new();
    for record in records.iter() {
        if let Some(vps) = record.value_per_share {
            groups
                .entry((record.year, record.quarter))
                .or_default()
                .push(vps);
        }
    }

    let medians: HashMap<(i32, i32), f64> = groups
        .into_iter()
        .filter_map(|(key, values)| median(values).map(|m| (key, m)))
        .collect();

    for record in records.iter_mut() {
        let Some(&m) = medians.get(&(record.year, record.quarter)) else {
            continue;
        };
        record.value_per_share = Some(m);
        record.value = record.shares.map(|shares| m * shares as f64);
    }
}

/// `UPDATE` applying the correction to one quarter of `table_name`.
///
/// `$1`/`$2` are the quarter's `[start, end)` bounds, which restrict both the median and the
/// rows updated to the quarter's partition.
pub fn median_update_statement(table_name: &str) -> String {
    let table = quote(table_name);
    let key = quote(PARTITION_KEY);
    indoc::formatdoc! {"
            UPDATE {table} AS h
            SET value_per_share = m.median,
                value = m.median * h.sshprnamt
            FROM (
                SELECT percentile_cont(0.5) WITHIN GROUP (ORDER BY value_per_share) AS median
                FROM {table}
                WHERE {key} >= $1 AND {key} < $2
            ) AS m
            WHERE h.{key} >= $1 AND h.{key} < $2
              AND m.median IS NOT NULL
        "}
}

/// Applies the correction to the rows of `period` already stored in `table_name`.
///
/// Returns the number of rows updated.
#[tracing::instrument(skip(conn))]
pub async fn correct_quarter(
    conn: &mut PgConnection,
    table_name: &str,
    period: YearQuarter,
) -> Result<u64, CorrectionError> {
    validate_identifier(table_name).map_err(|source| CorrectionError::InvalidTableName {
        table_name: table_name.to_string(),
        source,
    })?;

    let statement = median_update_statement(table_name);
    let result = sqlx::query(&statement)
        .bind(period.start_date())
        .bind(period.end_date())
        .execute(&mut *conn)
        .await
        .map_err(|source| CorrectionError::Update {
            table_name: table_name.to_string(),
            period,
            source,
        })?;

    tracing::info!(
        table = table_name,
        quarter = %period,
        rows = result.rows_affected(),
        "value_per_share_corrected"
    );

    Ok(result.rows_affected())
}
