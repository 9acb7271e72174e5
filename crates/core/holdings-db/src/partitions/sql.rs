//! SQL wrapper functions for partition catalog queries

use sqlx::{Executor, Postgres};

use super::AttachedPartition;

/// Partitions attached to `parent` in the current schema, with their bound expressions,
/// ordered by name.
pub async fn list_attached<'c, E>(exe: E, parent: &str) -> Result<Vec<AttachedPartition>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {"
        SELECT child.relname::text AS name,
               pg_get_expr(child.relpartbound, child.oid) AS bounds
        FROM pg_inherits inh
        JOIN pg_class child ON child.oid = inh.inhrelid
        JOIN pg_class parent ON parent.oid = inh.inhparent
        JOIN pg_namespace ns ON ns.oid = parent.relnamespace
        WHERE parent.relname = $1
          AND ns.nspname = current_schema()
        ORDER BY child.relname
    "};

    sqlx::query_as(query).bind(parent).fetch_all(exe).await
}

/// Whether `partition` is attached to `parent` in the current schema.
pub async fn is_attached<'c, E>(exe: E, parent: &str, partition: &str) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {"
        SELECT EXISTS (
            SELECT 1
            FROM pg_inherits inh
            JOIN pg_class child ON child.oid = inh.inhrelid
            JOIN pg_class parent ON parent.oid = inh.inhparent
            JOIN pg_namespace ns ON ns.oid = parent.relnamespace
            WHERE parent.relname = $1
              AND child.relname = $2
              AND ns.nspname = current_schema()
        )
    "};

    sqlx::query_scalar(query)
        .bind(parent)
        .bind(partition)
        .fetch_one(exe)
        .await
}
