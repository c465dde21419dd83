use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::debug;

use crate::config::PostgresConfig;
use crate::error::EtlError;
use crate::model::CustomerProsthesis;

/// Flattened active-prosthesis extraction query.
///
/// `DISTINCT ON (chip_id)` with the matching ORDER BY keeps exactly one
/// row per chip: greatest updated_at wins, then lowest prosthesis_id.
/// Reads run under the default read-committed isolation; a torn view
/// across rows is tolerated and corrected by the next run.
const REFERENCE_QUERY: &str = r#"
SELECT DISTINCT ON (p.chip_id)
    c.external_id AS user_id,
    concat_ws(' ', c.last_name, c.first_name, c.middle_name) AS customer_name,
    c.email AS customer_email,
    c.region::text AS customer_region,
    c.branch AS customer_branch,
    p.prosthesis_id::bigint AS prosthesis_id,
    p.serial_number AS prosthesis_serial,
    p.chip_id,
    pm.model_name AS prosthesis_model,
    pm.category::text AS prosthesis_category,
    p.firmware_version,
    greatest(c.updated_at, p.updated_at) AS last_updated_at
FROM crm.customers c
JOIN crm.prostheses p ON p.customer_id = c.customer_id
JOIN crm.prosthesis_models pm ON pm.model_id = p.model_id
WHERE p.status = 'active'
  AND p.chip_id IS NOT NULL
  AND greatest(c.updated_at, p.updated_at) >= $1
ORDER BY p.chip_id, greatest(c.updated_at, p.updated_at) DESC, p.prosthesis_id ASC
"#;

/// Reference source backed by the operational CRM PostgreSQL.
pub struct CrmSource {
    pool: PgPool,
}

impl CrmSource {
    /// Opens the read connection pool.
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self, EtlError> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.pool_size)
            .connect(&cfg.url)
            .await
            .map_err(|e| EtlError::SourceUnavailable(format!("connecting to CRM: {e}")))?;

        Ok(Self { pool })
    }

    /// Streams the flattened reference view for rows updated since the
    /// given instant.
    pub async fn extract_reference(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<CustomerProsthesis>, EtlError> {
        let mut stream = sqlx::query_as::<_, CustomerProsthesis>(REFERENCE_QUERY)
            .bind(since)
            .fetch(&self.pool);

        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await.map_err(EtlError::from_source)? {
            rows.push(row);
        }

        debug!(rows = rows.len(), %since, "extracted CRM reference rows");

        Ok(rows)
    }
}
