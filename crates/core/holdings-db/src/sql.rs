//! SQL utilities for safe identifier handling and statement building.
//!
//! Table, partition and index names cannot be bound as parameters, so every dynamic
//! identifier that ends up in a statement passes through this module:
//!
//! ```text
//! caller table name → validate_identifier() → quote_identifier() → SQL text
//!                     (charset + sqlparser)    (pg_escape quoting)
//! ```
//!
//! Values (dates, security identifiers) are never formatted into statements here; they are
//! bound as `$n` parameters by the callers. The only literals produced by this module are
//! partition bounds, which are rendered from typed [`NaiveDate`]s.

use chrono::NaiveDate;
use pg_escape::quote_identifier;
use sqlparser::{dialect::PostgreSqlDialect, parser::Parser};

/// PostgreSQL truncates identifiers longer than this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Errors that occur during SQL identifier validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidateIdentifierError {
    /// Identifier is empty
    #[error("Identifier cannot be empty")]
    Empty,

    /// Identifier exceeds PostgreSQL's 63-byte limit
    #[error("Identifier '{name}' exceeds PostgreSQL limit of 63 bytes (got {length})")]
    TooLong { name: String, length: usize },

    /// Identifier contains invalid characters
    #[error("Identifier contains invalid character: '{character}'")]
    InvalidCharacter { character: char },

    /// Identifier must start with letter or underscore
    #[error("Identifier must start with letter or underscore, got '{first_char}'")]
    InvalidFirstCharacter { first_char: char },

    /// Identifier failed SQL parser validation
    #[error("Not a valid SQL identifier: {reason}")]
    ParserError { reason: String },

    /// Identifier parsed as multiple SQL statements (injection attempt)
    #[error("Identifier parsed as multiple SQL statements")]
    MultipleStatements,
}

/// Validate that a string is a safe, unqualified PostgreSQL identifier.
///
/// Accepted names are ASCII alphanumerics and `_`, starting with a letter or underscore,
/// at most [`MAX_IDENTIFIER_LEN`] bytes long, and parseable by sqlparser as a single table
/// reference.
///
/// Derived names (partitions, indexes) are validated as well, since appending a suffix to a
/// valid table name can push it over the length limit.
///
/// # Example
/// ```
/// use holdings_db::sql::validate_identifier;
///
/// assert!(validate_identifier("holdings").is_ok());
/// assert!(validate_identifier("holdings_2013_q2").is_ok());
/// assert!(validate_identifier("holdings; DROP TABLE").is_err());
/// assert!(validate_identifier("holdings-2013").is_err());
/// ```
pub fn validate_identifier(name: &str) -> Result<(), ValidateIdentifierError> {
    let Some(first_char) = name.chars().next() else {
        return Err(ValidateIdentifierError::Empty);
    };

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidateIdentifierError::TooLong {
            name: name.to_string(),
            length: name.len(),
        });
    }

    if let Some(character) = name
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && *ch != '_')
    {
        return Err(ValidateIdentifierError::InvalidCharacter { character });
    }

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ValidateIdentifierError::InvalidFirstCharacter { first_char });
    }

    // Catches reserved words used bare and anything else the parser refuses as a table name
    let sql = format!("SELECT * FROM {name}");
    match Parser::parse_sql(&PostgreSqlDialect {}, &sql) {
        Ok(statements) if statements.len() == 1 => Ok(()),
        Ok(_) => Err(ValidateIdentifierError::MultipleStatements),
        Err(err) => Err(ValidateIdentifierError::ParserError {
            reason: err.to_string(),
        }),
    }
}

/// Quote a table, column or index name for use in SQL text.
///
/// **Safety**: Assumes the name has been validated using [`validate_identifier`] when it
/// comes from outside the crate. Column names are crate constants.
pub fn quote(name: &str) -> String {
    quote_identifier(name).to_string()
}

/// Comma-separated, quoted column list: `"a", "b", "c"`.
pub fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|column| quote(column))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build a column definition for CREATE TABLE with proper identifier quoting.
///
/// Formats a column as: `"column_name" TYPE [NOT NULL]`
pub fn column_definition(column_name: &str, pg_type: &str, nullable: bool) -> String {
    let nullability = if nullable { "" } else { " NOT NULL" };
    format!("{} {}{}", quote(column_name), pg_type, nullability)
}

/// `CREATE TABLE <table> (<columns>) PARTITION BY RANGE (<key>)`.
///
/// Deliberately without `IF NOT EXISTS`: the registrar checks the catalog first and
/// reclassifies the duplicate-table error of a lost race itself.
pub fn create_range_partitioned_table(table: &str, columns: &str, key: &str) -> String {
    format!(
        "CREATE TABLE {} ({}) PARTITION BY RANGE ({})",
        quote(table),
        columns,
        quote(key)
    )
}

/// `CREATE TABLE IF NOT EXISTS <table> (<columns>)`.
pub fn create_table_if_not_exists(table: &str, columns: &str) -> String {
    format!("CREATE TABLE IF NOT EXISTS {} ({})", quote(table), columns)
}

/// `CREATE TABLE <partition> PARTITION OF <parent> FOR VALUES FROM ('<from>') TO ('<to>')`.
///
/// The bounds are rendered from typed dates (`YYYY-MM-DD`), never from caller strings.
pub fn create_range_partition(
    partition: &str,
    parent: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> String {
    format!(
        "CREATE TABLE {} PARTITION OF {} FOR VALUES FROM ('{}') TO ('{}')",
        quote(partition),
        quote(parent),
        from.format("%Y-%m-%d"),
        to.format("%Y-%m-%d"),
    )
}

/// `DROP TABLE IF EXISTS <table>`.
pub fn drop_table_if_exists(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote(table))
}

/// `CREATE INDEX <index> ON <table> (<column>)`.
pub fn create_index(index: &str, table: &str, column: &str) -> String {
    format!(
        "CREATE INDEX {} ON {} ({})",
        quote(index),
        quote(table),
        quote(column)
    )
}

/// Null marker of the text COPY stream. Quoted fields never match it, so a string whose
/// content is `\N` survives the round trip as long as the encoder quotes it.
pub const COPY_NULL: &str = r"\N";

/// `COPY <table> (<columns>) FROM STDIN WITH (FORMAT csv, NULL '\N')`.
///
/// Columns are always listed explicitly so the stream never depends on the table's
/// physical column order. No header row is sent.
pub fn copy_csv_from_stdin(table: &str, columns: &[&str]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv, NULL '{}')",
        quote(table),
        column_list(columns),
        COPY_NULL
    )
}

/// Catalog lookup used for every existence check: `$1` is the unquoted table name.
///
/// Matches on the exact stored name in the session's current schema, which is how
/// [`quote`] leaves mixed-case names.
pub const TABLE_EXISTS: &str = indoc::indoc! {"
    SELECT EXISTS (
        SELECT 1
        FROM information_schema.tables
        WHERE table_schema = current_schema()
          AND table_name = $1
    )
"};
