//! Quarter-by-quarter filter of a partitioned holdings table against a ticker mapping.
//!
//! The target table is rebuilt at the start of every run, then filled one quarter at a
//! time. Each quarter runs three statements over the same partition-key range in one
//! transaction:
//!
//! 1. count the source rows of the quarter,
//! 2. count the source rows whose security identifier is mapped,
//! 3. insert those mapped rows into the target.
//!
//! A failed quarter is rolled back, logged and recorded; the run continues with the next
//! quarter and the totals only include quarters that completed.

pub(crate) mod sql;

use monitoring::logging;
use sqlx::{Connection as _, PgConnection};

use crate::{
    quarter::{QuarterWindow, YearQuarter},
    record::PARTITION_KEY,
    schema::{self, SchemaError},
    sql::{self as stmt, ValidateIdentifierError, validate_identifier},
};

/// Tables taking part in a filter run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterTables {
    /// Partitioned holdings table read from.
    pub source: String,
    /// Ticker mapping table joined against on `cusip`.
    pub mapping: String,
    /// Filtered holdings table, rebuilt by every run.
    pub target: String,
}

impl FilterTables {
    pub fn new(
        source: impl Into<String>,
        mapping: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            mapping: mapping.into(),
            target: target.into(),
        }
    }

    /// Index names on the target's partition key and security identifier.
    pub fn index_names(&self) -> [(String, &'static str); 2] {
        [
            (format!("idx_{}_{PARTITION_KEY}", self.target), PARTITION_KEY),
            (format!("idx_{}_cusip", self.target), "cusip"),
        ]
    }
}

/// Counts of one completed quarter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarterStats {
    pub period: YearQuarter,
    /// Source rows in the quarter.
    pub original: u64,
    /// Source rows in the quarter with a mapped security identifier.
    pub filtered: u64,
    /// Rows written to the target.
    pub inserted: u64,
}

impl QuarterStats {
    /// `filtered / original`, 0 for an empty quarter.
    pub fn keep_rate(&self) -> f64 {
        keep_rate(self.filtered, self.original)
    }
}

/// What happened to one quarter of the window.
#[derive(Debug)]
pub enum QuarterOutcome {
    Completed(QuarterStats),
    Failed {
        period: YearQuarter,
        error: FilterError,
    },
}

impl QuarterOutcome {
    pub fn period(&self) -> YearQuarter {
        match self {
            QuarterOutcome::Completed(stats) => stats.period,
            QuarterOutcome::Failed { period, .. } => *period,
        }
    }
}

/// Result of a filter run: per-quarter outcomes and totals over completed quarters.
#[derive(Debug, Default)]
pub struct FilterRunReport {
    pub outcomes: Vec<QuarterOutcome>,
    pub original: u64,
    pub filtered: u64,
    pub inserted: u64,
}

impl FilterRunReport {
    fn record(&mut self, outcome: QuarterOutcome) {
        if let QuarterOutcome::Completed(stats) = &outcome {
            self.original += stats.original;
            self.filtered += stats.filtered;
            self.inserted += stats.inserted;
        }
        self.outcomes.push(outcome);
    }

    /// Source rows dropped by the filter.
    pub fn removed(&self) -> u64 {
        self.original.saturating_sub(self.filtered)
    }

    /// Overall `filtered / original`, 0 when nothing was read.
    pub fn keep_rate(&self) -> f64 {
        keep_rate(self.filtered, self.original)
    }

    pub fn completed(&self) -> impl Iterator<Item = &QuarterStats> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            QuarterOutcome::Completed(stats) => Some(stats),
            QuarterOutcome::Failed { .. } => None,
        })
    }

    pub fn failed_quarters(&self) -> Vec<YearQuarter> {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, QuarterOutcome::Failed { .. }))
            .map(QuarterOutcome::period)
            .collect()
    }
}

fn keep_rate(filtered: u64, original: u64) -> f64 {
    if original == 0 {
        0.0
    } else {
        filtered as f64 / original as f64
    }
}

/// Errors that occur during a filter run
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// A table or derived index name is not a valid identifier
    #[error("Invalid identifier '{name}'")]
    InvalidIdentifier {
        name: String,
        #[source]
        source: ValidateIdentifierError,
    },

    /// Rebuilding the target table failed
    #[error("Failed to rebuild target table '{table_name}'")]
    PrepareTarget {
        table_name: String,
        #[source]
        source: SchemaError,
    },

    /// Failed to begin or commit the transaction rebuilding the target
    #[error("Transaction failed while rebuilding target table '{table_name}'")]
    PrepareTransaction {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },

    /// Failed to begin or commit a transaction
    #[error("Transaction failed while filtering {period}")]
    Transaction {
        period: YearQuarter,
        #[source]
        source: sqlx::Error,
    },

    /// Counting source rows failed
    #[error("Failed to count rows of '{table_name}' for {period}")]
    Count {
        table_name: String,
        period: YearQuarter,
        #[source]
        source: sqlx::Error,
    },

    /// INSERT ... SELECT failed
    #[error("Failed to insert filtered rows of {period} into '{table_name}'")]
    Insert {
        table_name: String,
        period: YearQuarter,
        #[source]
        source: sqlx::Error,
    },
}

fn validate(name: &str) -> Result<(), FilterError> {
    validate_identifier(name).map_err(|source| FilterError::InvalidIdentifier {
        name: name.to_string(),
        source,
    })
}

/// Drops and recreates the target table with its two indexes, in one transaction.
pub async fn prepare_target(
    conn: &mut PgConnection,
    tables: &FilterTables,
) -> Result<(), FilterError> {
    let prepare_err = |source| FilterError::PrepareTarget {
        table_name: tables.target.clone(),
        source,
    };

    let tx_err = |source| FilterError::PrepareTransaction {
        table_name: tables.target.clone(),
        source,
    };

    let mut tx = conn.begin().await.map_err(tx_err)?;

    schema::drop_table(&mut tx, &tables.target)
        .await
        .map_err(prepare_err)?;

    let columns = sql::FILTERED_SCHEMA
        .iter()
        .map(|(name, pg_type, nullable)| stmt::column_definition(name, pg_type, *nullable))
        .collect::<Vec<_>>()
        .join(", ");
    schema::create(
        &mut tx,
        &tables.target,
        &stmt::create_table_if_not_exists(&tables.target, &columns),
    )
    .await
    .map_err(prepare_err)?;

    for (index_name, column) in tables.index_names() {
        schema::create_index(&mut tx, &index_name, &tables.target, column)
            .await
            .map_err(prepare_err)?;
    }

    tx.commit().await.map_err(tx_err)?;

    tracing::info!(table = %tables.target, "filter_target_prepared");
    Ok(())
}

/// Runs the three statements of one quarter in a transaction.
async fn filter_quarter(
    conn: &mut PgConnection,
    tables: &FilterTables,
    period: YearQuarter,
) -> Result<QuarterStats, FilterError> {
    let (from, to) = (period.start_date(), period.end_date());
    let tx_err = |source| FilterError::Transaction { period, source };
    let count_err = |source| FilterError::Count {
        table_name: tables.source.clone(),
        period,
        source,
    };

    let mut tx = conn.begin().await.map_err(tx_err)?;

    let original =
        sql::count_in_range(&mut *tx, &sql::count_source_statement(&tables.source), from, to)
            .await
            .map_err(count_err)?;

    let filtered = sql::count_in_range(
        &mut *tx,
        &sql::count_joined_statement(&tables.source, &tables.mapping),
        from,
        to,
    )
    .await
    .map_err(count_err)?;

    let inserted = sql::insert_in_range(
        &mut *tx,
        &sql::insert_joined_statement(&tables.source, &tables.mapping, &tables.target),
        from,
        to,
    )
    .await
    .map_err(|source| FilterError::Insert {
        table_name: tables.target.clone(),
        period,
        source,
    })?;

    tx.commit().await.map_err(tx_err)?;

    Ok(QuarterStats {
        period,
        original: u64::try_from(original).unwrap_or_default(),
        filtered: u64::try_from(filtered).unwrap_or_default(),
        inserted,
    })
}

/// Rebuilds `tables.target` and fills it with the mapped rows of every quarter of `window`.
///
/// Errors are returned only when the names are invalid or the target cannot be rebuilt;
/// per-quarter failures are part of the report.
#[tracing::instrument(skip_all, fields(source = %tables.source, target = %tables.target))]
pub async fn run_quarter_filter(
    conn: &mut PgConnection,
    tables: &FilterTables,
    window: QuarterWindow,
) -> Result<FilterRunReport, FilterError> {
    validate(&tables.source)?;
    validate(&tables.mapping)?;
    validate(&tables.target)?;
    for (index_name, _) in tables.index_names() {
        validate(&index_name)?;
    }

    prepare_target(conn, tables).await?;

    let total = window.len();
    tracing::info!(
        quarters = total,
        start = %window.start(),
        end = %window.end(),
        "filter_run_started"
    );

    let mut report = FilterRunReport::default();
    for (index, period) in window.iter().enumerate() {
        let outcome = match filter_quarter(conn, tables, period).await {
            Ok(stats) => {
                tracing::info!(
                    progress = %format_args!("{}/{}", index + 1, total),
                    quarter = %period,
                    original = stats.original,
                    filtered = stats.filtered,
                    inserted = stats.inserted,
                    kept = %format_args!("{:.1}%", stats.keep_rate() * 100.0),
                    "quarter_filtered"
                );
                QuarterOutcome::Completed(stats)
            }
            Err(err) => {
                tracing::error!(
                    progress = %format_args!("{}/{}", index + 1, total),
                    quarter = %period,
                    error = %err, error_source = logging::error_source(&err),
                    "quarter_filter_failed"
                );
                QuarterOutcome::Failed { period, error: err }
            }
        };
        report.record(outcome);
    }

    tracing::info!(
        original = report.original,
        filtered = report.filtered,
        inserted = report.inserted,
        removed = report.removed(),
        kept = %format_args!("{:.1}%", report.keep_rate() * 100.0),
        failed = report.failed_quarters().len(),
        "filter_run_completed"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(period: &str, original: u64, filtered: u64) -> QuarterStats {
        QuarterStats {
            period: period.parse().expect("valid quarter"),
            original,
            filtered,
            inserted: filtered,
        }
    }

    #[test]
    fn keep_rate_of_empty_quarter_is_zero() {
        assert_eq!(stats("Q1_2013", 0, 0).keep_rate(), 0.0);
        assert_eq!(FilterRunReport::default().keep_rate(), 0.0);
    }

    #[test]
    fn totals_only_include_completed_quarters() {
        let mut report = FilterRunReport::default();
        report.record(QuarterOutcome::Completed(stats("Q1_2013", 10, 0)));
        report.record(QuarterOutcome::Failed {
            period: "Q2_2013".parse().expect("valid quarter"),
            error: FilterError::InvalidIdentifier {
                name: "x-y".to_string(),
                source: ValidateIdentifierError::InvalidCharacter { character: '-' },
            },
        });
        report.record(QuarterOutcome::Completed(stats("Q3_2013", 30, 15)));

        assert_eq!(report.original, 40);
        assert_eq!(report.filtered, 15);
        assert_eq!(report.inserted, 15);
        assert_eq!(report.removed(), 25);
        assert_eq!(report.keep_rate(), 0.375);
        assert_eq!(report.completed().count(), 2);
        assert_eq!(report.failed_quarters(), ["Q2_2013".parse().expect("valid quarter")]);
    }

    #[test]
    fn index_names_follow_target() {
        let tables = FilterTables::new("holdings", "ticker_to_cusip", "holdings_filtered_new");
        let [(by_period, _), (by_cusip, _)] = tables.index_names();

        assert_eq!(by_period, "idx_holdings_filtered_new_period_start");
        assert_eq!(by_cusip, "idx_holdings_filtered_new_cusip");
    }
}
