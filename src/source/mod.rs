pub mod crm;
pub mod replica;
pub mod telemetry;

use chrono::{DateTime, Utc};

use crate::error::EtlError;
use crate::model::CustomerProsthesis;

pub use crm::CrmSource;
pub use replica::ReplicaSource;
pub use telemetry::TelemetrySource;

/// Reference extraction backend selected by `sources.mode`.
///
/// Enum dispatch rather than trait objects, so the runner's task futures
/// stay `Send` without boxing.
pub enum ReferenceSource {
    /// Live CRM PostgreSQL.
    Crm(CrmSource),
    /// CDC replica in ClickHouse, deduplicated by a monotonic version.
    Replica(ReplicaSource),
}

impl ReferenceSource {
    /// Returns the backend name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Crm(_) => "crm",
            Self::Replica(_) => "replica",
        }
    }

    /// Pulls the flattened active-prosthesis view, at most one row per
    /// chip_id, filtered to rows updated at or after `since`.
    pub async fn extract_reference(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<CustomerProsthesis>, EtlError> {
        match self {
            Self::Crm(s) => s.extract_reference(since).await,
            Self::Replica(s) => s.extract_reference(since).await,
        }
    }
}
