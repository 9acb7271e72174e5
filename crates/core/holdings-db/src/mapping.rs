//! Ticker mapping table, the right-hand side of the quarter filter join.

use std::collections::HashSet;

use indoc::formatdoc;
use sqlx::{Connection as _, PgConnection};

use crate::{
    copy::{self, CopyError},
    record::{TICKER_MAPPING_COLUMNS, TickerMapping},
    schema::{self, SchemaError},
};

/// Counts of one mapping load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingLoadReport {
    pub rows_received: usize,
    /// Rows dropped because their security identifier is a placeholder.
    pub placeholders_skipped: usize,
    /// Rows left after de-duplicating on `(cusip, ticker)`.
    pub unique_records: usize,
    pub rows_inserted: u64,
}

/// Errors that occur when loading the mapping table
#[derive(Debug, thiserror::Error)]
pub enum MappingLoadError {
    /// Dropping or creating the table failed
    #[error("Failed to rebuild mapping table '{table_name}'")]
    Schema {
        table_name: String,
        #[source]
        source: SchemaError,
    },

    /// Bulk load failed
    #[error("Failed to load mappings into '{table_name}'")]
    Load {
        table_name: String,
        #[source]
        source: CopyError,
    },

    /// Failed to begin or commit the transaction
    #[error("Transaction failed while loading mappings into '{table_name}'")]
    Transaction {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Column definitions of the mapping table, keyed on `(cusip, ticker)`.
pub fn mapping_columns_ddl() -> String {
    formatdoc! {"
        name TEXT NOT NULL,
        cusip TEXT NOT NULL,
        ticker TEXT NOT NULL,
        trading_start_date DATE,
        trading_end_date DATE,
        PRIMARY KEY (cusip, ticker)"
    }
}

/// Mappings to load: placeholders removed, first occurrence of each `(cusip, ticker)` kept.
pub fn dedup_mappings(mappings: &[TickerMapping]) -> (Vec<&TickerMapping>, usize) {
    let mut seen = HashSet::new();
    let mut placeholders = 0;
    let mut unique = Vec::with_capacity(mappings.len());

    for mapping in mappings {
        if mapping.cusip.is_placeholder() {
            placeholders += 1;
            continue;
        }
        if seen.insert((mapping.cusip.as_str(), mapping.ticker.as_str())) {
            unique.push(mapping);
        }
    }
    (unique, placeholders)
}

/// Replaces the content of `table_name` with `mappings`.
///
/// The drop, the create and the load run in one transaction, so readers see either the old
/// mapping or the new one.
#[tracing::instrument(skip(conn, mappings), fields(rows = mappings.len()))]
pub async fn load_ticker_mappings(
    conn: &mut PgConnection,
    table_name: &str,
    mappings: &[TickerMapping],
) -> Result<MappingLoadReport, MappingLoadError> {
    let schema_err = |source| MappingLoadError::Schema {
        table_name: table_name.to_string(),
        source,
    };
    let tx_err = |source| MappingLoadError::Transaction {
        table_name: table_name.to_string(),
        source,
    };

    schema::validate_table_name(table_name).map_err(schema_err)?;

    let (unique, placeholders_skipped) = dedup_mappings(mappings);

    let mut tx = conn.begin().await.map_err(tx_err)?;

    schema::drop_table(&mut tx, table_name)
        .await
        .map_err(schema_err)?;
    schema::create(
        &mut tx,
        table_name,
        &crate::sql::create_table_if_not_exists(table_name, &mapping_columns_ddl()),
    )
    .await
    .map_err(schema_err)?;

    let rows_inserted = copy::copy_rows(&mut tx, table_name, TICKER_MAPPING_COLUMNS, &unique)
        .await
        .map_err(|source| MappingLoadError::Load {
            table_name: table_name.to_string(),
            source,
        })?;

    tx.commit().await.map_err(tx_err)?;

    let report = MappingLoadReport {
        rows_received: mappings.len(),
        placeholders_skipped,
        unique_records: unique.len(),
        rows_inserted,
    };

    tracing::info!(
        table = table_name,
        received = report.rows_received,
        placeholders = report.placeholders_skipped,
        unique = report.unique_records,
        inserted = report.rows_inserted,
        "ticker_mappings_loaded"
    );

    Ok(report)
}
