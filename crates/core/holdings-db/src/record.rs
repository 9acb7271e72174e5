//! Row types handed to the store by upstream collaborators.

use chrono::{NaiveDate, NaiveDateTime};

use crate::{
    copy::{CopyField, CopyRow, RowWriter},
    cusip::Cusip,
    quarter::{QuarterParseError, YearQuarter},
};

/// Column set of the partitioned holdings parent table, in declaration order.
///
/// `(name, type, nullable)`; the last column is the partition key.
pub const HOLDINGS_SCHEMA: &[(&str, &str, bool)] = &[
    ("accessionnumber", "TEXT", true),
    ("infotablesk", "TEXT", true),
    ("nameofissuer", "TEXT", true),
    ("cusip", "TEXT", true),
    ("value", "NUMERIC", true),
    ("sshprnamt", "BIGINT", true),
    ("filingdate", "DATE", true),
    ("cik", "TEXT", true),
    ("value_per_share", "NUMERIC", true),
    ("year", "INT", true),
    ("quarter", "INT", true),
    (PARTITION_KEY, "DATE", false),
];

/// Range partition key of every holdings table: the first day of the row's quarter.
pub const PARTITION_KEY: &str = "period_start";

/// Column names of [`HOLDINGS_SCHEMA`], in the order [`HoldingRecord`] writes them.
pub const HOLDINGS_COLUMNS: &[&str] = &[
    "accessionnumber",
    "infotablesk",
    "nameofissuer",
    "cusip",
    "value",
    "sshprnamt",
    "filingdate",
    "cik",
    "value_per_share",
    "year",
    "quarter",
    PARTITION_KEY,
];

/// One reported position from a quarterly holdings filing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HoldingRecord {
    pub accession_number: Option<String>,
    pub info_table_sk: Option<String>,
    pub issuer_name: Option<String>,
    pub cusip: Option<Cusip>,
    /// Reported market value of the position.
    pub value: Option<f64>,
    /// Reported share (or principal) amount.
    pub shares: Option<i64>,
    pub filing_date: Option<NaiveDate>,
    /// Filer id.
    pub cik: Option<String>,
    pub value_per_share: Option<f64>,
    pub year: i32,
    /// Reporting quarter, 1..=4.
    pub quarter: i32,
}

impl HoldingRecord {
    /// Builds a record for the given reporting period with every other field empty.
    pub fn new(year: i32, quarter: i32) -> Self {
        Self {
            year,
            quarter,
            ..Default::default()
        }
    }

    /// Reporting period, validated.
    pub fn year_quarter(&self) -> Result<YearQuarter, QuarterParseError> {
        YearQuarter::from_parts(self.year, self.quarter)
    }

    /// Partition key value: the first day of the reporting quarter.
    pub fn period_start(&self) -> Result<NaiveDate, QuarterParseError> {
        self.year_quarter().map(|period| period.start_date())
    }
}

/// A [`HoldingRecord`] whose period has been validated, ready to be streamed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlacedRecord<'a> {
    pub record: &'a HoldingRecord,
    pub period_start: NaiveDate,
}

impl CopyRow for PlacedRecord<'_> {
    fn write_row(&self, row: &mut RowWriter<'_>) {
        let record = self.record;
        row.field(&record.accession_number)
            .field(&record.info_table_sk)
            .field(&record.issuer_name)
            .field(&record.cusip)
            .field(&record.value)
            .field(&record.shares)
            .field(&record.filing_date)
            .field(&record.cik)
            .field(&record.value_per_share)
            .field(&record.year)
            .field(&record.quarter)
            .field(&self.period_start);
    }
}

/// Column set of the ticker mapping table.
pub const TICKER_MAPPING_COLUMNS: &[&str] = &[
    "name",
    "cusip",
    "ticker",
    "trading_start_date",
    "trading_end_date",
];

/// Resolution of a security identifier to a traded ticker, unique on `(cusip, ticker)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerMapping {
    pub name: String,
    pub cusip: Cusip,
    pub ticker: String,
    pub trading_start_date: Option<NaiveDate>,
    pub trading_end_date: Option<NaiveDate>,
}

impl CopyRow for TickerMapping {
    fn write_row(&self, row: &mut RowWriter<'_>) {
        row.field(&self.name)
            .field(&self.cusip)
            .field(&self.ticker)
            .field(&self.trading_start_date)
            .field(&self.trading_end_date);
    }
}

/// A single cell of a [`Rowset`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Text(String),
}

impl Value {
    /// SQL type inferred from the value's kind, `None` for [`Value::Null`].
    pub fn sql_type(&self) -> Option<&'static str> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some("BIGINT"),
            Value::Float(_) => Some("NUMERIC(18,4)"),
            Value::Bool(_) => Some("BOOLEAN"),
            Value::Timestamp(_) => Some("TIMESTAMP"),
            Value::Date(_) => Some("DATE"),
            Value::Text(_) => Some("TEXT"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::Timestamp(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl CopyField for Value {
    fn write_field(&self, out: &mut bytes::BytesMut) {
        match self {
            Value::Null => crate::copy::write_null(out),
            Value::Int(value) => value.write_field(out),
            Value::Float(value) => value.write_field(out),
            Value::Bool(value) => value.write_field(out),
            Value::Timestamp(value) => value.write_field(out),
            Value::Date(value) => value.write_field(out),
            Value::Text(value) => value.write_field(out),
        }
    }
}

/// An opaque tabular batch with a known column set, e.g. daily prices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rowset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Rowset {
    pub fn new(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: impl IntoIterator<Item = Value>) -> &mut Self {
        self.rows.push(row.into_iter().collect());
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// SQL type per column, from the first non-null value found in that column.
    ///
    /// Columns with no non-null value are `TEXT`.
    pub fn column_types(&self) -> Vec<&'static str> {
        (0..self.columns.len())
            .map(|index| {
                self.rows
                    .iter()
                    .find_map(|row| row.get(index).and_then(Value::sql_type))
                    .unwrap_or("TEXT")
            })
            .collect()
    }
}

impl CopyRow for Vec<Value> {
    fn write_row(&self, row: &mut RowWriter<'_>) {
        for value in self {
            row.field(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_start_is_derived_from_year_and_quarter() {
        let record = HoldingRecord::new(2013, 3);

        assert_eq!(
            record.period_start(),
            Ok(NaiveDate::from_ymd_opt(2013, 7, 1).expect("valid date"))
        );
    }

    #[test]
    fn period_start_rejects_invalid_quarter() {
        let record = HoldingRecord::new(2013, 7);

        assert!(record.period_start().is_err());
    }

    #[test]
    fn schema_and_columns_agree() {
        let names: Vec<_> = HOLDINGS_SCHEMA.iter().map(|(name, _, _)| *name).collect();

        assert_eq!(names, HOLDINGS_COLUMNS);
        assert_eq!(HOLDINGS_SCHEMA.last(), Some(&(PARTITION_KEY, "DATE", false)));
    }

    #[test]
    fn column_types_follow_value_kinds() {
        let mut rowset = Rowset::new(["ticker", "date", "close", "volume", "halted", "ts"]);
        rowset.push([
            Value::from("AAPL"),
            Value::from(NaiveDate::from_ymd_opt(2024, 1, 2).expect("valid date")),
            Value::from(185.64),
            Value::from(82_488_700_i64),
            Value::from(false),
            Value::from(
                NaiveDate::from_ymd_opt(2024, 1, 2)
                    .and_then(|date| date.and_hms_opt(16, 0, 0))
                    .expect("valid timestamp"),
            ),
        ]);

        assert_eq!(
            rowset.column_types(),
            ["TEXT", "DATE", "NUMERIC(18,4)", "BIGINT", "BOOLEAN", "TIMESTAMP"]
        );
    }

    #[test]
    fn column_types_skip_leading_nulls() {
        let mut rowset = Rowset::new(["close", "note"]);
        rowset
            .push([Value::Null, Value::Null])
            .push([Value::from(1.5), Value::Null]);

        assert_eq!(rowset.column_types(), ["NUMERIC(18,4)", "TEXT"]);
    }
}
