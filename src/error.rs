use std::time::Duration;

use thiserror::Error;

/// Task-level error taxonomy for the ETL pipeline.
///
/// The runner inspects the kind to decide between retrying a task and
/// failing the run. Row-level problems are carried by [`RowError`] and
/// never reach the runner boundary.
#[derive(Debug, Error)]
pub enum EtlError {
    /// A source database was unreachable or dropped the connection mid-read.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A source is missing an expected column or returned an incompatible
    /// type. Fatal: retrying cannot fix a drifted schema.
    #[error("source schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The analytical mart was unreachable or rejected a batch.
    #[error("target unavailable: {0}")]
    TargetUnavailable(String),

    /// A task or whole-run ceiling was exceeded.
    #[error("deadline exceeded after {0:?}")]
    RunTimeout(Duration),

    /// A previous run still holds the single-instance lock.
    #[error("previous run still holds the single-instance lock")]
    LockContention,
}

impl EtlError {
    /// Whether the runner should retry the failed task.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable(_) | Self::TargetUnavailable(_)
        )
    }

    /// Classifies an sqlx error against the taxonomy.
    ///
    /// Missing-column and decode failures mean the extraction queries no
    /// longer match the source schema; everything else is treated as a
    /// transient connectivity problem.
    pub fn from_source(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnNotFound(col) => {
                Self::SchemaMismatch(format!("missing column {col}"))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                Self::SchemaMismatch(format!("column {index} failed to decode: {source}"))
            }
            sqlx::Error::TypeNotFound { type_name } => {
                Self::SchemaMismatch(format!("unknown source type {type_name}"))
            }
            other => Self::SourceUnavailable(other.to_string()),
        }
    }
}

/// Row-level failures inside the transform stage.
///
/// These drop the offending telemetry row and bump a counter; the run
/// keeps going.
#[derive(Debug, Error, PartialEq)]
pub enum RowError {
    /// Telemetry for a chip with no active prosthesis in the reference set.
    #[error("no active prosthesis for chip {chip_id}")]
    OrphanTelemetry { chip_id: String },

    /// A metric outside its declared range.
    #[error("{field} out of range for chip {chip_id}: {value}")]
    InvalidMetric {
        chip_id: String,
        field: &'static str,
        value: f64,
    },
}
