//! Quarter-partitioned PostgreSQL store for securities holdings.
//!
//! [`HoldingsStore`] is the entry point. It owns one [`Session`] and exposes two layers:
//!
//! - `try_*` methods that return typed errors, for callers that want to react to failures.
//! - Boundary methods (`ingest`, `load_batch`, `run_quarter_filter`, ...) that never fail:
//!   every error is logged inside the store's span and turned into `false`, `0` or an empty
//!   report.
//!
//! The component modules ([`schema`], [`partitions`], [`copy`], [`ingest`], [`filter`],
//! [`mapping`], [`load`]) work on a borrowed `PgConnection` and can be used directly as well.

use tracing::Instrument as _;

pub mod conn;
pub mod copy;
pub mod correction;
pub mod cusip;
mod error;
pub mod filter;
pub mod ingest;
pub mod load;
pub mod mapping;
pub mod partitions;
pub mod quarter;
pub mod record;
pub mod schema;
pub mod sql;


pub use self::{
    conn::{ConnError, ConnectOptions, Session},
    cusip::Cusip,
    error::{Error, is_already_exists, is_connection_error},
    filter::{FilterRunReport, FilterTables, QuarterOutcome, QuarterStats},
    ingest::{IngestOptions, IngestReport},
    load::IfExists,
    mapping::MappingLoadReport,
    partitions::{AttachedPartition, PartitionOutcome, PartitionReport},
    quarter::{Quarter, QuarterParseError, QuarterWindow, YearQuarter},
    record::{HoldingRecord, Rowset, TickerMapping, Value},
    schema::TableOutcome,
};

/// One session against the holdings database, plus the span every operation logs in.
#[derive(Debug)]
pub struct HoldingsStore {
    session: Session,
    span: tracing::Span,
    ingest_options: IngestOptions,
}

impl HoldingsStore {
    /// Creates a disconnected store logging under a `holdings_store` span.
    pub fn new(options: ConnectOptions) -> Self {
        let span = tracing::info_span!("holdings_store", db = %options);
        Self::with_span(options, span)
    }

    /// Creates a disconnected store logging under the caller's span.
    pub fn with_span(options: ConnectOptions, span: tracing::Span) -> Self {
        Self {
            session: Session::new(options),
            span,
            ingest_options: IngestOptions::default(),
        }
    }

    /// Sets the options applied by [`HoldingsStore::ingest`].
    pub fn with_ingest_options(mut self, options: IngestOptions) -> Self {
        self.ingest_options = options;
        self
    }

    pub fn ingest_options(&self) -> &IngestOptions {
        &self.ingest_options
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Connects within the configured timeout. On failure no connection is retained.
    pub async fn connect(&mut self) -> bool {
        let span = self.span.clone();
        self.session.connect().instrument(span).await
    }

    /// Closes the connection, if any.
    pub async fn disconnect(&mut self) {
        let span = self.span.clone();
        self.session.disconnect().instrument(span).await
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub async fn try_ensure_parent_table(&mut self, table_name: &str) -> Result<TableOutcome, Error> {
        let span = self.span.clone();
        async {
            let conn = self.session.ensure_connected().await?;
            Ok(schema::ensure_parent_table(conn, table_name).await?)
        }
        .instrument(span)
        .await
    }

    pub async fn try_create_table(
        &mut self,
        table_name: &str,
        sample: &Rowset,
    ) -> Result<TableOutcome, Error> {
        let span = self.span.clone();
        async {
            let conn = self.session.ensure_connected().await?;
            Ok(schema::create_table(conn, table_name, sample).await?)
        }
        .instrument(span)
        .await
    }

    pub async fn try_table_exists(&mut self, table_name: &str) -> Result<bool, Error> {
        let span = self.span.clone();
        async {
            let conn = self.session.ensure_connected().await?;
            Ok(schema::table_exists(conn, table_name).await?)
        }
        .instrument(span)
        .await
    }

    pub async fn try_drop_table(&mut self, table_name: &str) -> Result<(), Error> {
        let span = self.span.clone();
        async {
            let conn = self.session.ensure_connected().await?;
            Ok(schema::drop_table(conn, table_name).await?)
        }
        .instrument(span)
        .await
    }

    pub async fn try_ensure_partitions(
        &mut self,
        table_name: &str,
        records: &[HoldingRecord],
    ) -> Result<PartitionReport, Error> {
        let span = self.span.clone();
        async {
            let conn = self.session.ensure_connected().await?;
            Ok(partitions::ensure_partitions(conn, table_name, records).await?)
        }
        .instrument(span)
        .await
    }

    /// Partitions attached to `table_name`, with their bound expressions.
    pub async fn try_list_partitions(
        &mut self,
        table_name: &str,
    ) -> Result<Vec<AttachedPartition>, Error> {
        let span = self.span.clone();
        async {
            let conn = self.session.ensure_connected().await?;
            Ok(partitions::list_partitions(conn, table_name).await?)
        }
        .instrument(span)
        .await
    }

    pub async fn try_load_batch(
        &mut self,
        table_name: &str,
        records: &[HoldingRecord],
    ) -> Result<u64, Error> {
        if records.is_empty() {
            return Ok(0);
        }

        let span = self.span.clone();
        async {
            let conn = self.session.ensure_connected().await?;
            Ok(copy::load_batch(conn, table_name, records).await?)
        }
        .instrument(span)
        .await
    }

    pub async fn try_ingest(
        &mut self,
        records: &[HoldingRecord],
        table_name: &str,
    ) -> Result<IngestReport, Error> {
        if records.is_empty() {
            return Ok(IngestReport::default());
        }

        let span = self.span.clone();
        async {
            let conn = self.session.ensure_connected().await?;
            Ok(ingest::ingest(conn, table_name, records, &self.ingest_options).await?)
        }
        .instrument(span)
        .await
    }

    /// Applies the median value-per-share correction to one stored quarter.
    pub async fn try_correct_quarter(
        &mut self,
        table_name: &str,
        period: YearQuarter,
    ) -> Result<u64, Error> {
        let span = self.span.clone();
        async {
            let conn = self.session.ensure_connected().await?;
            Ok(correction::correct_quarter(conn, table_name, period).await?)
        }
        .instrument(span)
        .await
    }

    pub async fn try_run_quarter_filter(
        &mut self,
        tables: &FilterTables,
        window: QuarterWindow,
    ) -> Result<FilterRunReport, Error> {
        let span = self.span.clone();
        async {
            let conn = self.session.ensure_connected().await?;
            Ok(filter::run_quarter_filter(conn, tables, window).await?)
        }
        .instrument(span)
        .await
    }

    pub async fn try_load_ticker_mappings(
        &mut self,
        table_name: &str,
        mappings: &[TickerMapping],
    ) -> Result<MappingLoadReport, Error> {
        let span = self.span.clone();
        async {
            let conn = self.session.ensure_connected().await?;
            Ok(mapping::load_ticker_mappings(conn, table_name, mappings).await?)
        }
        .instrument(span)
        .await
    }

    pub async fn try_load_rowset(
        &mut self,
        table_name: &str,
        rowset: &Rowset,
        if_exists: IfExists,
    ) -> Result<u64, Error> {
        if rowset.is_empty() {
            return Ok(0);
        }

        let span = self.span.clone();
        async {
            let conn = self.session.ensure_connected().await?;
            Ok(load::load_rowset(conn, table_name, rowset, if_exists).await?)
        }
        .instrument(span)
        .await
    }

    /// Ensures the partitioned holdings parent table exists. `true` if it does afterwards.
    pub async fn ensure_parent_table(&mut self, table_name: &str) -> bool {
        match self.try_ensure_parent_table(table_name).await {
            Ok(_) => true,
            Err(err) => {
                self.log_failure("ensure_parent_table", table_name, &err);
                false
            }
        }
    }

    /// Creates a plain table typed after `sample`. `true` if it exists afterwards.
    pub async fn create_table(&mut self, table_name: &str, sample: &Rowset) -> bool {
        match self.try_create_table(table_name, sample).await {
            Ok(_) => true,
            Err(err) => {
                self.log_failure("create_table", table_name, &err);
                false
            }
        }
    }

    /// `false` when the table is missing or the lookup failed.
    pub async fn table_exists(&mut self, table_name: &str) -> bool {
        match self.try_table_exists(table_name).await {
            Ok(exists) => exists,
            Err(err) => {
                self.log_failure("table_exists", table_name, &err);
                false
            }
        }
    }

    pub async fn drop_table(&mut self, table_name: &str) -> bool {
        match self.try_drop_table(table_name).await {
            Ok(()) => true,
            Err(err) => {
                self.log_failure("drop_table", table_name, &err);
                false
            }
        }
    }

    /// Creates the missing partitions for every quarter present in `records`.
    ///
    /// Per-partition failures are in the report; a failure before any partition was
    /// attempted yields an empty report.
    pub async fn ensure_partitions(
        &mut self,
        table_name: &str,
        records: &[HoldingRecord],
    ) -> PartitionReport {
        match self.try_ensure_partitions(table_name, records).await {
            Ok(report) => report,
            Err(err) => {
                self.log_failure("ensure_partitions", table_name, &err);
                PartitionReport::default()
            }
        }
    }

    /// Streams `records` into an existing table. Returns the rows loaded, `0` on failure.
    pub async fn load_batch(&mut self, table_name: &str, records: &[HoldingRecord]) -> u64 {
        match self.try_load_batch(table_name, records).await {
            Ok(rows) => rows,
            Err(err) => {
                self.log_failure("load_batch", table_name, &err);
                0
            }
        }
    }

    /// Ingests `records` into `table_name`. Returns the rows loaded, `0` on failure.
    ///
    /// Groups committed before a failing group stay in the table even though `0` is
    /// returned; the failure event records how many rows that is.
    pub async fn ingest(&mut self, records: &[HoldingRecord], table_name: &str) -> u64 {
        match self.try_ingest(records, table_name).await {
            Ok(report) => report.total_rows,
            Err(err) => {
                let committed = match &err {
                    Error::Ingest(err) => err.loaded_before(),
                    _ => 0,
                };
                tracing::error!(
                    parent: &self.span,
                    table = table_name,
                    rows = records.len(),
                    committed,
                    error = %err, error_source = monitoring::logging::error_source(&err),
                    "ingest_failed"
                );
                0
            }
        }
    }

    /// Runs the quarter filter over `window`. Returns an empty report if the run could not
    /// start; per-quarter failures are in the report.
    pub async fn run_quarter_filter(
        &mut self,
        tables: &FilterTables,
        window: QuarterWindow,
    ) -> FilterRunReport {
        match self.try_run_quarter_filter(tables, window).await {
            Ok(report) => report,
            Err(err) => {
                self.log_failure("run_quarter_filter", &tables.target, &err);
                FilterRunReport::default()
            }
        }
    }

    /// Replaces the mapping table. Returns an all-zero report on failure.
    pub async fn load_ticker_mappings(
        &mut self,
        table_name: &str,
        mappings: &[TickerMapping],
    ) -> MappingLoadReport {
        match self.try_load_ticker_mappings(table_name, mappings).await {
            Ok(report) => report,
            Err(err) => {
                self.log_failure("load_ticker_mappings", table_name, &err);
                MappingLoadReport::default()
            }
        }
    }

    /// Loads a rowset into a plain table. Returns the rows loaded, `0` on failure.
    pub async fn load_rowset(
        &mut self,
        table_name: &str,
        rowset: &Rowset,
        if_exists: IfExists,
    ) -> u64 {
        match self.try_load_rowset(table_name, rowset, if_exists).await {
            Ok(rows) => rows,
            Err(err) => {
                self.log_failure("load_rowset", table_name, &err);
                0
            }
        }
    }

    fn log_failure(&self, operation: &'static str, table_name: &str, err: &Error) {
        tracing::error!(
            parent: &self.span,
            operation,
            table = table_name,
            error = %err, error_source = monitoring::logging::error_source(err),
            "holdings_operation_failed"
        );
    }
}
