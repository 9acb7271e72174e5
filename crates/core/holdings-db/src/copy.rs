//! Bulk loading through `COPY ... FROM STDIN`.
//!
//! Rows are encoded as CSV text straight into a [`BytesMut`] buffer and streamed to the
//! server in chunks of about [`CHUNK_SIZE`] bytes, so no per-row SQL text is ever built and
//! memory use stays bounded regardless of batch size.
//!
//! NULL is written as an unquoted `\N`; every string that could be mistaken for it (or that
//! is empty) is quoted, which keeps NULL and the empty string distinct.

use std::{borrow::Borrow, fmt::Write as _};

use bytes::{BufMut as _, Bytes, BytesMut};
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::{Connection as _, PgConnection};

use crate::{
    cusip::Cusip,
    quarter::QuarterParseError,
    record::{HOLDINGS_COLUMNS, HoldingRecord, PlacedRecord},
    sql::{self, COPY_NULL, ValidateIdentifierError},
};

/// Size at which an encoded chunk is flushed to the server.
pub const CHUNK_SIZE: usize = 1 << 20;

/// A value that can be written as one CSV field of a COPY stream.
pub trait CopyField {
    fn write_field(&self, out: &mut BytesMut);
}

/// A value that can be written as one line of a COPY stream.
pub trait CopyRow {
    /// Writes the row's fields in the column order of the COPY statement.
    fn write_row(&self, row: &mut RowWriter<'_>);
}

impl<T: CopyRow + ?Sized> CopyRow for &T {
    fn write_row(&self, row: &mut RowWriter<'_>) {
        (**self).write_row(row);
    }
}

/// Writes the fields of one row, inserting delimiters.
pub struct RowWriter<'a> {
    out: &'a mut BytesMut,
    fields: usize,
}

impl RowWriter<'_> {
    pub fn field<T: CopyField + ?Sized>(&mut self, value: &T) -> &mut Self {
        if self.fields > 0 {
            self.out.put_u8(b',');
        }
        value.write_field(self.out);
        self.fields += 1;
        self
    }
}

pub(crate) fn write_null(out: &mut BytesMut) {
    out.put_slice(COPY_NULL.as_bytes());
}

impl CopyField for str {
    fn write_field(&self, out: &mut BytesMut) {
        let needs_quotes = self.is_empty()
            || self == COPY_NULL
            || self.bytes().any(|b| matches!(b, b',' | b'"' | b'\r' | b'\n'));

        if !needs_quotes {
            out.put_slice(self.as_bytes());
            return;
        }

        out.reserve(self.len() + 2);
        out.put_u8(b'"');
        for (index, part) in self.split('"').enumerate() {
            if index > 0 {
                out.put_slice(b"\"\"");
            }
            out.put_slice(part.as_bytes());
        }
        out.put_u8(b'"');
    }
}

impl CopyField for String {
    fn write_field(&self, out: &mut BytesMut) {
        self.as_str().write_field(out);
    }
}

impl CopyField for Cusip {
    fn write_field(&self, out: &mut BytesMut) {
        self.as_str().write_field(out);
    }
}

impl CopyField for i64 {
    fn write_field(&self, out: &mut BytesMut) {
        let _ = write!(out, "{self}");
    }
}

impl CopyField for i32 {
    fn write_field(&self, out: &mut BytesMut) {
        let _ = write!(out, "{self}");
    }
}

/// Non-finite values have no NUMERIC representation and are written as NULL.
impl CopyField for f64 {
    fn write_field(&self, out: &mut BytesMut) {
        if self.is_finite() {
            let _ = write!(out, "{self}");
        } else {
            write_null(out);
        }
    }
}

impl CopyField for bool {
    fn write_field(&self, out: &mut BytesMut) {
        out.put_u8(if *self { b't' } else { b'f' });
    }
}

impl CopyField for NaiveDate {
    fn write_field(&self, out: &mut BytesMut) {
        let _ = write!(out, "{}", self.format("%Y-%m-%d"));
    }
}

impl CopyField for NaiveDateTime {
    fn write_field(&self, out: &mut BytesMut) {
        let _ = write!(out, "{}", self.format("%Y-%m-%d %H:%M:%S%.f"));
    }
}

impl<T: CopyField> CopyField for Option<T> {
    fn write_field(&self, out: &mut BytesMut) {
        match self {
            Some(value) => value.write_field(out),
            None => write_null(out),
        }
    }
}

/// A row wrote a different number of fields than the COPY statement names columns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("row {row} has {fields} fields, expected {columns}")]
pub struct FieldCountMismatch {
    pub row: usize,
    pub fields: usize,
    pub columns: usize,
}

/// Accumulates encoded rows and hands out chunks ready to send.
#[derive(Debug)]
pub struct CopyEncoder {
    columns: usize,
    rows: usize,
    buf: BytesMut,
}

impl CopyEncoder {
    pub fn new(columns: usize) -> Self {
        Self {
            columns,
            rows: 0,
            buf: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }

    /// Appends one line, checking its field count against the column list.
    pub fn push<R: CopyRow + ?Sized>(&mut self, row: &R) -> Result<(), FieldCountMismatch> {
        let start = self.buf.len();
        let mut writer = RowWriter {
            out: &mut self.buf,
            fields: 0,
        };
        row.write_row(&mut writer);
        let fields = writer.fields;

        if fields != self.columns {
            self.buf.truncate(start);
            return Err(FieldCountMismatch {
                row: self.rows,
                fields,
                columns: self.columns,
            });
        }

        self.buf.put_u8(b'\n');
        self.rows += 1;
        Ok(())
    }

    /// Number of rows encoded so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Takes the buffered bytes once they reach [`CHUNK_SIZE`].
    pub fn take_full_chunk(&mut self) -> Option<Bytes> {
        (self.buf.len() >= CHUNK_SIZE).then(|| self.buf.split().freeze())
    }

    /// Takes whatever is left in the buffer.
    pub fn finish(mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

/// Errors that occur when bulk loading rows
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    /// Target table name is not a valid identifier
    #[error("Invalid table name '{table_name}'")]
    InvalidTableName {
        table_name: String,
        #[source]
        source: ValidateIdentifierError,
    },

    /// A holdings record carries a year or quarter outside the valid range
    #[error("Invalid period in record {row} for '{table_name}'")]
    InvalidPeriod {
        table_name: String,
        row: usize,
        #[source]
        source: QuarterParseError,
    },

    /// A row could not be encoded for the column list
    #[error("Failed to encode rows for COPY into '{table_name}'")]
    Encode {
        table_name: String,
        #[source]
        source: FieldCountMismatch,
    },

    /// Failed to begin transaction
    #[error("Failed to begin transaction for loading into '{table_name}'")]
    TransactionBegin {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },

    /// Failed to initiate COPY operation
    #[error("Failed to initiate COPY into '{table_name}'")]
    CopyInitiate {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },

    /// Failed to send COPY data
    #[error("Failed to send COPY data to '{table_name}'")]
    CopySend {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },

    /// Failed to finish COPY operation
    #[error("Failed to finish COPY into '{table_name}'")]
    CopyFinish {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },

    /// Failed to commit transaction
    #[error("Failed to commit transaction for loading into '{table_name}'")]
    TransactionCommit {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Streams `rows` into `table` in a transaction of its own and returns the number of rows
/// the server consumed.
///
/// An empty slice returns `0` without touching the database. The columns are named
/// explicitly in the COPY statement; every row must write exactly `columns.len()` fields.
pub async fn copy_rows<R: CopyRow>(
    conn: &mut PgConnection,
    table_name: &str,
    columns: &[&str],
    rows: &[R],
) -> Result<u64, CopyError> {
    if rows.is_empty() {
        return Ok(0);
    }

    sql::validate_identifier(table_name).map_err(|source| CopyError::InvalidTableName {
        table_name: table_name.to_string(),
        source,
    })?;

    let copy_sql = sql::copy_csv_from_stdin(table_name, columns);

    let mut tx = conn
        .begin()
        .await
        .map_err(|source| CopyError::TransactionBegin {
            table_name: table_name.to_string(),
            source,
        })?;

    let mut copy = tx
        .copy_in_raw(&copy_sql)
        .await
        .map_err(|source| CopyError::CopyInitiate {
            table_name: table_name.to_string(),
            source,
        })?;

    let mut encoder = CopyEncoder::new(columns.len());
    for row in rows {
        if let Err(source) = encoder.push(row) {
            let _ = copy.abort(source.to_string()).await;
            return Err(CopyError::Encode {
                table_name: table_name.to_string(),
                source,
            });
        }

        if let Some(chunk) = encoder.take_full_chunk() {
            copy.send(chunk)
                .await
                .map_err(|source| CopyError::CopySend {
                    table_name: table_name.to_string(),
                    source,
                })?;
        }
    }

    copy.send(encoder.finish())
        .await
        .map_err(|source| CopyError::CopySend {
            table_name: table_name.to_string(),
            source,
        })?;

    let rows_copied = copy
        .finish()
        .await
        .map_err(|source| CopyError::CopyFinish {
            table_name: table_name.to_string(),
            source,
        })?;

    tx.commit()
        .await
        .map_err(|source| CopyError::TransactionCommit {
            table_name: table_name.to_string(),
            source,
        })?;

    tracing::debug!(table = table_name, rows = rows_copied, "copy_completed");

    Ok(rows_copied)
}

/// Streams holdings records into `table_name` and returns the number of rows loaded.
///
/// The caller is responsible for the target partitions existing; an empty batch is a no-op
/// that issues no statement at all.
pub async fn load_batch<R: Borrow<HoldingRecord>>(
    conn: &mut PgConnection,
    table_name: &str,
    records: &[R],
) -> Result<u64, CopyError> {
    let placed = records
        .iter()
        .map(Borrow::borrow)
        .enumerate()
        .map(|(row, record)| {
            record
                .period_start()
                .map(|period_start| PlacedRecord {
                    record,
                    period_start,
                })
                .map_err(|source| CopyError::InvalidPeriod {
                    table_name: table_name.to_string(),
                    row,
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    copy_rows(conn, table_name, HOLDINGS_COLUMNS, &placed).await
}
