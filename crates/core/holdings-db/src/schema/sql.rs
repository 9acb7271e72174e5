//! SQL wrapper functions for schema operations
//!
//! Functions in this module are generic over `sqlx::Executor` and return `sqlx::Error`.
//! The component layer (in `schema.rs`) validates names and converts errors to
//! [`SchemaError`](super::SchemaError).

use sqlx::{Executor, Postgres};

/// Whether a table (or partition) with this exact name exists in the current schema.
pub async fn table_exists<'c, E>(exe: E, table_name: &str) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(crate::sql::TABLE_EXISTS)
        .bind(table_name)
        .fetch_one(exe)
        .await
}

/// Executes a DDL statement built by [`crate::sql`].
pub async fn execute_ddl<'c, E>(exe: E, statement: &str) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(statement).execute(exe).await?;
    Ok(())
}
