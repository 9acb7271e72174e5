//! Loading of opaque tabular batches (daily prices and the like) into plain tables.

use sqlx::{Connection as _, PgConnection};

use crate::{
    copy::{self, CopyError},
    record::Rowset,
    schema::{self, SchemaError},
    sql::validate_identifier,
};

/// What to do with a table that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IfExists {
    /// Keep existing rows and add the new ones.
    #[default]
    Append,
    /// Drop the table and recreate it from the batch.
    Replace,
}

/// Errors that occur when loading a rowset
#[derive(Debug, thiserror::Error)]
pub enum RowsetLoadError {
    /// Dropping, validating or creating the table failed
    #[error("Failed to prepare table '{table_name}'")]
    Schema {
        table_name: String,
        #[source]
        source: SchemaError,
    },

    /// Bulk load failed
    #[error("Failed to load rowset into '{table_name}'")]
    Load {
        table_name: String,
        #[source]
        source: CopyError,
    },

    /// Failed to begin or commit the transaction
    #[error("Transaction failed while loading rowset into '{table_name}'")]
    Transaction {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Loads `rowset` into `table_name`, creating the table from the rowset's inferred column
/// types when it does not exist.
///
/// An empty rowset returns `0` without touching the database, for both modes. The drop, the
/// create and the load commit together.
#[tracing::instrument(skip(conn, rowset), fields(rows = rowset.len()))]
pub async fn load_rowset(
    conn: &mut PgConnection,
    table_name: &str,
    rowset: &Rowset,
    if_exists: IfExists,
) -> Result<u64, RowsetLoadError> {
    if rowset.is_empty() {
        return Ok(0);
    }

    let schema_err = |source| RowsetLoadError::Schema {
        table_name: table_name.to_string(),
        source,
    };
    let tx_err = |source| RowsetLoadError::Transaction {
        table_name: table_name.to_string(),
        source,
    };

    // Column names end up in the COPY statement even when the table is not created here
    for column in &rowset.columns {
        validate_identifier(column).map_err(|source| {
            schema_err(SchemaError::InvalidColumnName {
                table_name: table_name.to_string(),
                column: column.clone(),
                source,
            })
        })?;
    }

    let mut tx = conn.begin().await.map_err(tx_err)?;

    if if_exists == IfExists::Replace {
        schema::drop_table(&mut tx, table_name)
            .await
            .map_err(schema_err)?;
    }
    schema::create_table(&mut tx, table_name, rowset)
        .await
        .map_err(schema_err)?;

    let columns: Vec<&str> = rowset.columns.iter().map(String::as_str).collect();
    let rows = copy::copy_rows(&mut tx, table_name, &columns, &rowset.rows)
        .await
        .map_err(|source| RowsetLoadError::Load {
            table_name: table_name.to_string(),
            source,
        })?;

    tx.commit().await.map_err(tx_err)?;

    tracing::info!(table = table_name, rows, ?if_exists, "rowset_loaded");

    Ok(rows)
}
