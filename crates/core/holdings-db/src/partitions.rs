//! Quarter partitions of a range-partitioned holdings table.
//!
//! Each `(year, quarter)` maps to exactly one partition named `{table}_{year}_q{quarter}` that
//! owns `[quarter start, next quarter start)`. Creation is best-effort per partition: all
//! partitions of a call share one transaction, and each attempt runs under its own savepoint
//! so a failed attempt rolls back alone while the partitions created before it are kept.
//!
//! A partition counts as present only when the catalog shows it attached to the parent. A
//! table that merely carries the partition name is reported as a failure.

pub(crate) mod sql;

use std::collections::BTreeSet;

use chrono::NaiveDate;
use monitoring::logging;
use sqlx::{Connection as _, PgConnection};

use crate::{
    error::is_already_exists,
    quarter::{QuarterParseError, YearQuarter},
    record::HoldingRecord,
    schema,
    sql::{self as stmt, ValidateIdentifierError, validate_identifier},
};

/// A partition to be created under a parent table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub parent: String,
    pub name: String,
    pub period: YearQuarter,
}

impl PartitionSpec {
    pub fn new(parent: &str, period: YearQuarter) -> Self {
        Self {
            parent: parent.to_string(),
            name: period.partition_name(parent),
            period,
        }
    }

    /// Inclusive lower bound.
    pub fn from(&self) -> NaiveDate {
        self.period.start_date()
    }

    /// Exclusive upper bound.
    pub fn to(&self) -> NaiveDate {
        self.period.end_date()
    }

    pub fn create_statement(&self) -> String {
        stmt::create_range_partition(&self.name, &self.parent, self.from(), self.to())
    }
}

/// What happened to one partition.
#[derive(Debug)]
pub enum PartitionOutcome {
    Created,
    AlreadyExists,
    Failed(PartitionError),
}

/// Per-partition outcomes of one [`ensure_partitions`] call, in quarter order.
#[derive(Debug, Default)]
pub struct PartitionReport {
    pub outcomes: Vec<(PartitionSpec, PartitionOutcome)>,
}

impl PartitionReport {
    pub fn created(&self) -> usize {
        self.count(|outcome| matches!(outcome, PartitionOutcome::Created))
    }

    pub fn already_existing(&self) -> usize {
        self.count(|outcome| matches!(outcome, PartitionOutcome::AlreadyExists))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, PartitionOutcome::Failed(_)))
    }

    /// Whether every requested partition exists.
    pub fn is_complete(&self) -> bool {
        self.failed() == 0
    }

    /// Names of the partitions this call created.
    pub fn created_names(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, PartitionOutcome::Created))
            .map(|(spec, _)| spec.name.as_str())
            .collect()
    }

    fn count(&self, pred: impl Fn(&PartitionOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, outcome)| pred(outcome)).count()
    }
}

/// A partition attached to a parent table, as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AttachedPartition {
    pub name: String,
    /// Bound expression, e.g. `FOR VALUES FROM ('2013-04-01') TO ('2013-07-01')`.
    pub bounds: String,
}

/// Errors that occur when creating partitions
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    /// Parent table name is not a valid identifier
    #[error("Invalid parent table name '{table_name}'")]
    InvalidTableName {
        table_name: String,
        #[source]
        source: ValidateIdentifierError,
    },

    /// Derived partition name is not a valid identifier (usually too long)
    #[error("Invalid partition name '{partition}'")]
    InvalidPartitionName {
        partition: String,
        #[source]
        source: ValidateIdentifierError,
    },

    /// A record carries a year or quarter outside the valid range
    #[error("Invalid period in record {row} for '{table_name}'")]
    InvalidPeriod {
        table_name: String,
        row: usize,
        #[source]
        source: QuarterParseError,
    },

    /// Failed to begin transaction
    #[error("Failed to begin transaction for partitions of '{table_name}'")]
    TransactionBegin {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },

    /// Failed to open or release the savepoint of one partition
    #[error("Failed to manage savepoint for partition '{partition}'")]
    Savepoint {
        partition: String,
        #[source]
        source: sqlx::Error,
    },

    /// Catalog lookup failed
    #[error("Failed to check existence of partition '{partition}'")]
    ExistenceCheck {
        partition: String,
        #[source]
        source: sqlx::Error,
    },

    /// The partition name belongs to a table that is not a partition of this parent
    #[error("Table '{partition}' exists but is not a partition of '{parent}'")]
    NameTaken { partition: String, parent: String },

    /// CREATE TABLE ... PARTITION OF failed for a reason other than the partition existing
    #[error("Failed to create partition '{partition}' FROM {from} TO {to}")]
    Create {
        partition: String,
        from: NaiveDate,
        to: NaiveDate,
        #[source]
        source: sqlx::Error,
    },

    /// Failed to commit transaction
    #[error("Failed to commit partitions of '{table_name}'")]
    TransactionCommit {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },

    /// Failed to list attached partitions
    #[error("Failed to list partitions of '{table_name}'")]
    List {
        table_name: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Distinct periods of a batch in chronological order.
///
/// Fails on the first record whose year or quarter is out of range.
pub fn batch_periods(
    table_name: &str,
    records: &[HoldingRecord],
) -> Result<BTreeSet<YearQuarter>, PartitionError> {
    records
        .iter()
        .enumerate()
        .map(|(row, record)| {
            record
                .year_quarter()
                .map_err(|source| PartitionError::InvalidPeriod {
                    table_name: table_name.to_string(),
                    row,
                    source,
                })
        })
        .collect()
}

/// Ensures a partition exists for every `(year, quarter)` present in `records`.
pub async fn ensure_partitions(
    conn: &mut PgConnection,
    table_name: &str,
    records: &[HoldingRecord],
) -> Result<PartitionReport, PartitionError> {
    let periods = batch_periods(table_name, records)?;
    ensure_quarter_partitions(conn, table_name, periods).await
}

/// Ensures a partition exists for each of `periods`.
///
/// Individual failures are recorded in the report and do not stop the loop. Errors are
/// returned only when the enclosing transaction cannot be opened or committed.
#[tracing::instrument(skip(conn, periods))]
pub async fn ensure_quarter_partitions(
    conn: &mut PgConnection,
    table_name: &str,
    periods: impl IntoIterator<Item = YearQuarter>,
) -> Result<PartitionReport, PartitionError> {
    validate_identifier(table_name).map_err(|source| PartitionError::InvalidTableName {
        table_name: table_name.to_string(),
        source,
    })?;

    let mut report = PartitionReport::default();
    let mut periods = periods.into_iter().peekable();
    if periods.peek().is_none() {
        return Ok(report);
    }

    let mut tx = conn
        .begin()
        .await
        .map_err(|source| PartitionError::TransactionBegin {
            table_name: table_name.to_string(),
            source,
        })?;

    for period in periods {
        let spec = PartitionSpec::new(table_name, period);
        let outcome = ensure_one(&mut tx, &spec).await;

        match &outcome {
            PartitionOutcome::Created => {
                tracing::info!(
                    partition = %spec.name,
                    from = %spec.from(),
                    to = %spec.to(),
                    "partition_created"
                );
            }
            PartitionOutcome::AlreadyExists => {
                tracing::debug!(partition = %spec.name, "partition_exists");
            }
            PartitionOutcome::Failed(err) => {
                tracing::error!(
                    partition = %spec.name,
                    error = %err, error_source = logging::error_source(err),
                    "partition_create_failed"
                );
            }
        }
        report.outcomes.push((spec, outcome));
    }

    tx.commit()
        .await
        .map_err(|source| PartitionError::TransactionCommit {
            table_name: table_name.to_string(),
            source,
        })?;

    Ok(report)
}

/// One partition attempt under its own savepoint.
async fn ensure_one(tx: &mut PgConnection, spec: &PartitionSpec) -> PartitionOutcome {
    if let Err(source) = validate_identifier(&spec.name) {
        return PartitionOutcome::Failed(PartitionError::InvalidPartitionName {
            partition: spec.name.clone(),
            source,
        });
    }

    let savepoint_err = |source| {
        PartitionOutcome::Failed(PartitionError::Savepoint {
            partition: spec.name.clone(),
            source,
        })
    };

    let mut savepoint = match tx.begin().await {
        Ok(savepoint) => savepoint,
        Err(source) => return savepoint_err(source),
    };

    match sql::is_attached(&mut *savepoint, &spec.parent, &spec.name).await {
        Ok(false) => {}
        Ok(true) => {
            return match savepoint.commit().await {
                Ok(()) => PartitionOutcome::AlreadyExists,
                Err(source) => savepoint_err(source),
            };
        }
        Err(source) => {
            let _ = savepoint.rollback().await;
            return PartitionOutcome::Failed(PartitionError::ExistenceCheck {
                partition: spec.name.clone(),
                source,
            });
        }
    }

    match schema::sql::execute_ddl(&mut *savepoint, &spec.create_statement()).await {
        Ok(()) => match savepoint.commit().await {
            Ok(()) => PartitionOutcome::Created,
            Err(source) => savepoint_err(source),
        },
        Err(err) if is_already_exists(&err) => {
            let _ = savepoint.rollback().await;
            // Either another session attached it first, or the name belongs to another table
            match sql::is_attached(&mut *tx, &spec.parent, &spec.name).await {
                Ok(true) => PartitionOutcome::AlreadyExists,
                Ok(false) => PartitionOutcome::Failed(PartitionError::NameTaken {
                    partition: spec.name.clone(),
                    parent: spec.parent.clone(),
                }),
                Err(source) => PartitionOutcome::Failed(PartitionError::ExistenceCheck {
                    partition: spec.name.clone(),
                    source,
                }),
            }
        }
        Err(source) => {
            let _ = savepoint.rollback().await;
            PartitionOutcome::Failed(PartitionError::Create {
                partition: spec.name.clone(),
                from: spec.from(),
                to: spec.to(),
                source,
            })
        }
    }
}

/// Partitions currently attached to `table_name`, ordered by name.
pub async fn list_partitions(
    conn: &mut PgConnection,
    table_name: &str,
) -> Result<Vec<AttachedPartition>, PartitionError> {
    validate_identifier(table_name).map_err(|source| PartitionError::InvalidTableName {
        table_name: table_name.to_string(),
        source,
    })?;

    sql::list_attached(&mut *conn, table_name)
        .await
        .map_err(|source| PartitionError::List {
            table_name: table_name.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yq(year: i32, quarter: i32) -> YearQuarter {
        YearQuarter::from_parts(year, quarter).expect("valid quarter")
    }

    #[test]
    fn spec_derives_name_and_bounds() {
        let spec = PartitionSpec::new("t", yq(2013, 4));

        assert_eq!(spec.name, "t_2013_q4");
        assert_eq!(
            spec.create_statement(),
            "CREATE TABLE t_2013_q4 PARTITION OF t FOR VALUES FROM ('2013-10-01') TO ('2014-01-01')"
        );
    }

    #[test]
    fn batch_periods_are_distinct_and_sorted() {
        let records = [
            HoldingRecord::new(2013, 3),
            HoldingRecord::new(2013, 2),
            HoldingRecord::new(2013, 2),
            HoldingRecord::new(2012, 4),
        ];

        let periods = batch_periods("t", &records).expect("valid periods");

        assert_eq!(
            periods.into_iter().collect::<Vec<_>>(),
            [yq(2012, 4), yq(2013, 2), yq(2013, 3)]
        );
    }

    #[test]
    fn batch_periods_report_the_offending_row() {
        let records = [HoldingRecord::new(2013, 2), HoldingRecord::new(2013, 9)];

        let err = batch_periods("t", &records).expect_err("quarter 9 is invalid");

        assert!(matches!(err, PartitionError::InvalidPeriod { row: 1, .. }));
    }

    #[test]
    fn report_counts_outcomes() {
        let report = PartitionReport {
            outcomes: vec![
                (PartitionSpec::new("t", yq(2013, 1)), PartitionOutcome::Created),
                (PartitionSpec::new("t", yq(2013, 2)), PartitionOutcome::AlreadyExists),
                (PartitionSpec::new("t", yq(2013, 3)), PartitionOutcome::Created),
            ],
        };

        assert_eq!(report.created(), 2);
        assert_eq!(report.already_existing(), 1);
        assert!(report.is_complete());
        assert_eq!(report.created_names(), ["t_2013_q1", "t_2013_q3"]);
    }
}
