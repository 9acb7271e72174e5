//! Batch ingestion into a partitioned holdings table.
//!
//! ```text
//! records ─► group by quarter ─► ensure_parent_table ─► ensure_partitions
//!                                                              │
//!                               load_batch per group ◄─────────┘
//!                               (own transaction each)
//! ```
//!
//! Groups are committed one by one. When a group fails, the groups loaded before it stay
//! committed and the error carries how many rows they hold.

use std::collections::BTreeMap;

use sqlx::PgConnection;

use crate::{
    copy::{self, CopyError},
    correction::{self, CorrectionError},
    partitions::{self, PartitionError, PartitionReport},
    quarter::YearQuarter,
    record::HoldingRecord,
    schema::{self, SchemaError, TableOutcome},
};

/// Knobs of one ingestion call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOptions {
    /// Rewrite each loaded quarter's value per share with the quarter median.
    pub median_value_correction: bool,
}

/// Rows loaded for one `(year, quarter)` group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLoad {
    pub period: YearQuarter,
    pub rows: u64,
}

/// Outcome of a successful ingestion call.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// `None` when the batch was empty and no DDL was issued.
    pub parent: Option<TableOutcome>,
    pub partitions: PartitionReport,
    pub groups: Vec<GroupLoad>,
    pub total_rows: u64,
}

/// Errors that occur during ingestion
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Parent table could not be ensured
    #[error("Failed to ensure parent table '{table_name}'")]
    ParentTable {
        table_name: String,
        #[source]
        source: SchemaError,
    },

    /// Partitions could not be ensured
    #[error("Failed to ensure partitions of '{table_name}'")]
    Partitions {
        table_name: String,
        #[source]
        source: PartitionError,
    },

    /// Loading one quarter group failed
    #[error(
        "Failed to load {period} into '{table_name}' ({loaded_before} rows committed by earlier groups)"
    )]
    Load {
        table_name: String,
        period: YearQuarter,
        loaded_before: u64,
        #[source]
        source: CopyError,
    },

    /// Correcting a loaded quarter failed
    #[error(
        "Failed to correct {period} in '{table_name}' ({loaded_before} rows committed by earlier groups)"
    )]
    Correction {
        table_name: String,
        period: YearQuarter,
        loaded_before: u64,
        #[source]
        source: CorrectionError,
    },
}

impl IngestError {
    /// Rows committed by this call before it failed.
    pub fn loaded_before(&self) -> u64 {
        match self {
            IngestError::Load { loaded_before, .. }
            | IngestError::Correction { loaded_before, .. } => *loaded_before,
            IngestError::ParentTable { .. } | IngestError::Partitions { .. } => 0,
        }
    }
}

/// Records grouped by period, in chronological order.
///
/// Fails on the first record whose year or quarter is out of range.
pub fn group_by_period<'a>(
    table_name: &str,
    records: &'a [HoldingRecord],
) -> Result<BTreeMap<YearQuarter, Vec<&'a HoldingRecord>>, PartitionError> {
    let mut groups: BTreeMap<YearQuarter, Vec<&HoldingRecord>> = BTreeMap::new();
    for (row, record) in records.iter().enumerate() {
        let period = record
            .year_quarter()
            .map_err(|source| PartitionError::InvalidPeriod {
                table_name: table_name.to_string(),
                row,
                source,
            })?;
        groups.entry(period).or_default().push(record);
    }
    Ok(groups)
}

/// Loads `records` into the partitioned table `table_name`, creating the table and the
/// partitions it needs first.
///
/// An empty batch returns an empty report without touching the database.
#[tracing::instrument(skip(conn, records, options), fields(rows = records.len()))]
pub async fn ingest(
    conn: &mut PgConnection,
    table_name: &str,
    records: &[HoldingRecord],
    options: &IngestOptions,
) -> Result<IngestReport, IngestError> {
    if records.is_empty() {
        return Ok(IngestReport::default());
    }

    let partitions_err = |source| IngestError::Partitions {
        table_name: table_name.to_string(),
        source,
    };

    // Bad periods are rejected before any DDL is issued
    let groups = group_by_period(table_name, records).map_err(partitions_err)?;

    let parent = schema::ensure_parent_table(conn, table_name)
        .await
        .map_err(|source| IngestError::ParentTable {
            table_name: table_name.to_string(),
            source,
        })?;

    let partitions =
        partitions::ensure_quarter_partitions(conn, table_name, groups.keys().copied())
            .await
            .map_err(partitions_err)?;

    let mut report = IngestReport {
        parent: Some(parent),
        partitions,
        groups: Vec::new(),
        total_rows: 0,
    };

    for (period, group) in groups {
        tracing::info!(
            table = table_name,
            quarter = %period,
            rows = group.len(),
            "loading_quarter"
        );

        let rows = copy::load_batch(conn, table_name, &group)
            .await
            .map_err(|source| IngestError::Load {
                table_name: table_name.to_string(),
                period,
                loaded_before: report.total_rows,
                source,
            })?;

        report.total_rows += rows;
        report.groups.push(GroupLoad { period, rows });

        if options.median_value_correction {
            correction::correct_quarter(conn, table_name, period)
                .await
                .map_err(|source| IngestError::Correction {
                    table_name: table_name.to_string(),
                    period,
                    loaded_before: report.total_rows,
                    source,
                })?;
        }
    }

    tracing::info!(
        table = table_name,
        rows = report.total_rows,
        quarters = report.groups.len(),
        partitions_created = report.partitions.created(),
        "ingest_completed"
    );

    Ok(report)
}
