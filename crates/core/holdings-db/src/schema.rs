//! Table lifecycle: the partitioned holdings parent, generic tables inferred from a rowset,
//! existence checks and drops.
//!
//! Creation is safe to run from several processes at once. Existence is checked in the
//! catalog first, and a creation that loses the race to another session is reported as
//! [`TableOutcome::AlreadyExists`] rather than an error.

pub(crate) mod sql;

use sqlx::PgConnection;

use crate::{
    error::is_already_exists,
    record::{HOLDINGS_SCHEMA, PARTITION_KEY, Rowset},
    sql::{self as stmt, ValidateIdentifierError, validate_identifier},
};

/// Result of an idempotent create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOutcome {
    Created,
    AlreadyExists,
}

/// Errors that occur during table lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Table name is not a valid identifier
    #[error("Invalid table name '{table_name}'")]
    InvalidTableName {
        table_name: String,
        #[source]
        source: ValidateIdentifierError,
    },

    /// Column name is not a valid identifier
    #[error("Invalid column name '{column}' for table '{table_name}'")]
    InvalidColumnName {
        table_name: String,
        column: String,
        #[source]
        source: ValidateIdentifierError,
    },

    /// No columns to create the table with
    #[error("Cannot create table '{table_name}' without columns")]
    NoColumns { table_name: String },

    /// Catalog lookup failed
    #[error("Failed to check existence of table '{table_name}'")]
    ExistenceCheck {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },

    /// CREATE TABLE failed for a reason other than the table already existing
    #[error("Failed to create table '{table_name}'")]
    CreateTable {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },

    /// CREATE INDEX failed
    #[error("Failed to create index '{index_name}' on '{table_name}'")]
    CreateIndex {
        table_name: String,
        index_name: String,
        #[source]
        source: sqlx::Error,
    },

    /// DROP TABLE failed
    #[error("Failed to drop table '{table_name}'")]
    DropTable {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },
}

pub(crate) fn validate_table_name(table_name: &str) -> Result<(), SchemaError> {
    validate_identifier(table_name).map_err(|source| SchemaError::InvalidTableName {
        table_name: table_name.to_string(),
        source,
    })
}

/// Column definitions of the holdings parent table.
pub fn holdings_columns_ddl() -> String {
    HOLDINGS_SCHEMA
        .iter()
        .map(|(name, pg_type, nullable)| stmt::column_definition(name, pg_type, *nullable))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Whether `table_name` exists in the current schema.
pub async fn table_exists(conn: &mut PgConnection, table_name: &str) -> Result<bool, SchemaError> {
    validate_table_name(table_name)?;

    sql::table_exists(&mut *conn, table_name)
        .await
        .map_err(|source| SchemaError::ExistenceCheck {
            table_name: table_name.to_string(),
            source,
        })
}

/// Ensures the holdings parent table exists, range-partitioned on the quarter start.
///
/// Calling this for an existing table issues no DDL.
#[tracing::instrument(skip(conn))]
pub async fn ensure_parent_table(
    conn: &mut PgConnection,
    table_name: &str,
) -> Result<TableOutcome, SchemaError> {
    if table_exists(conn, table_name).await? {
        return Ok(TableOutcome::AlreadyExists);
    }

    let ddl = stmt::create_range_partitioned_table(
        table_name,
        &holdings_columns_ddl(),
        PARTITION_KEY,
    );
    create(conn, table_name, &ddl).await
}

/// Creates a plain table whose column types are inferred from `sample`.
///
/// See [`Rowset::column_types`] for the inference rules.
#[tracing::instrument(skip(conn, sample))]
pub async fn create_table(
    conn: &mut PgConnection,
    table_name: &str,
    sample: &Rowset,
) -> Result<TableOutcome, SchemaError> {
    validate_table_name(table_name)?;
    if sample.columns.is_empty() {
        return Err(SchemaError::NoColumns {
            table_name: table_name.to_string(),
        });
    }
    for column in &sample.columns {
        validate_identifier(column).map_err(|source| SchemaError::InvalidColumnName {
            table_name: table_name.to_string(),
            column: column.clone(),
            source,
        })?;
    }

    if table_exists(conn, table_name).await? {
        return Ok(TableOutcome::AlreadyExists);
    }

    let columns = sample
        .columns
        .iter()
        .zip(sample.column_types())
        .map(|(name, pg_type)| stmt::column_definition(name, pg_type, true))
        .collect::<Vec<_>>()
        .join(", ");
    let ddl = stmt::create_table_if_not_exists(table_name, &columns);
    create(conn, table_name, &ddl).await
}

/// Drops `table_name` if it exists. Partitions of a parent are dropped with it.
#[tracing::instrument(skip(conn))]
pub async fn drop_table(conn: &mut PgConnection, table_name: &str) -> Result<(), SchemaError> {
    validate_table_name(table_name)?;

    sql::execute_ddl(&mut *conn, &stmt::drop_table_if_exists(table_name))
        .await
        .map_err(|source| SchemaError::DropTable {
            table_name: table_name.to_string(),
            source,
        })?;

    tracing::info!(table = table_name, "table_dropped");
    Ok(())
}

/// Runs a CREATE TABLE statement, reclassifying a lost creation race as success.
pub(crate) async fn create(
    conn: &mut PgConnection,
    table_name: &str,
    ddl: &str,
) -> Result<TableOutcome, SchemaError> {
    match sql::execute_ddl(&mut *conn, ddl).await {
        Ok(()) => {
            tracing::info!(table = table_name, "table_created");
            Ok(TableOutcome::Created)
        }
        Err(err) if is_already_exists(&err) => {
            tracing::warn!(table = table_name, error = %err, "table_create_race");
            Ok(TableOutcome::AlreadyExists)
        }
        Err(source) => Err(SchemaError::CreateTable {
            table_name: table_name.to_string(),
            source,
        }),
    }
}

/// Creates a non-unique single-column index.
pub(crate) async fn create_index(
    conn: &mut PgConnection,
    index_name: &str,
    table_name: &str,
    column: &str,
) -> Result<(), SchemaError> {
    validate_identifier(index_name).map_err(|source| SchemaError::InvalidTableName {
        table_name: index_name.to_string(),
        source,
    })?;

    sql::execute_ddl(
        &mut *conn,
        &stmt::create_index(index_name, table_name, column),
    )
    .await
    .map_err(|source| SchemaError::CreateIndex {
        table_name: table_name.to_string(),
        index_name: index_name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holdings_ddl_declares_not_null_partition_key_last() {
        let ddl = holdings_columns_ddl();

        assert!(ddl.starts_with("accessionnumber TEXT, infotablesk TEXT"));
        assert!(ddl.ends_with("period_start DATE NOT NULL"));
        assert_eq!(ddl.matches("NOT NULL").count(), 1);
    }
}
