//! Error types for holdings store operations

use crate::{
    conn::ConnError, copy::CopyError, correction::CorrectionError, filter::FilterError,
    ingest::IngestError, load::RowsetLoadError, mapping::MappingLoadError, partitions::PartitionError,
    quarter::QuarterParseError, schema::SchemaError, sql::ValidateIdentifierError,
};

/// Errors that can occur when interacting with the holdings store
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error(transparent)]
    InvalidIdentifier(#[from] ValidateIdentifierError),

    #[error(transparent)]
    InvalidQuarter(#[from] QuarterParseError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Copy(#[from] CopyError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Correction(#[from] CorrectionError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    MappingLoad(#[from] MappingLoadError),

    #[error(transparent)]
    RowsetLoad(#[from] RowsetLoadError),
}

/// PostgreSQL error codes reporting that an object being created already exists.
const ALREADY_EXISTS_CODES: [&str; 3] = [
    "42P07", // duplicate_table
    "42P06", // duplicate_schema
    "42710", // duplicate_object
];

/// Returns `true` if a DDL failure means the object it was creating already exists.
///
/// Besides the duplicate-object codes, two sessions racing on `CREATE TABLE` can collide on
/// the row type the table registers in `pg_type`, which surfaces as a unique violation
/// (`23505`) instead of `42P07`.
pub fn is_already_exists(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    let Some(code) = db_err.code() else {
        return false;
    };

    ALREADY_EXISTS_CODES.contains(&&*code)
        || (code == "23505"
            && db_err
                .constraint()
                .is_some_and(|constraint| constraint.starts_with("pg_type_")))
}

/// Returns `true` if the error is likely to be a transient connection issue.
///
/// The following errors are considered connection errors:
/// - `sqlx::Error::Io`: An I/O error, often indicating a network issue or a closed socket.
/// - `sqlx::Error::Tls`: An error that occurred during the TLS handshake.
/// - `sqlx::Error::PoolTimedOut` / `sqlx::Error::PoolClosed`
/// - SQLSTATE class `08` (connection exception) and `57P03` (cannot connect now).
pub fn is_connection_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .is_some_and(|code| code.starts_with("08") || code == "57P03"),
        _ => false,
    }
}
