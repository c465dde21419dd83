use clickhouse_rs::{ClientHandle, Pool};
use tracing::info;

use crate::error::EtlError;

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: include_str!("sql/001_init.up.sql"),
        down_sql: include_str!("sql/001_init.down.sql"),
    },
    Migration {
        version: 2,
        up_sql: include_str!("sql/002_report_views.up.sql"),
        down_sql: include_str!("sql/002_report_views.down.sql"),
    },
];

/// Recorded schema state of the mart.
///
/// A dirty state means a migration started and never finished; the mart
/// needs manual repair before the pipeline may touch it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaState {
    pub version: u32,
    pub dirty: bool,
}

/// Applies the embedded mart migrations over a ClickHouse pool.
///
/// Progress lives in a single-row `etl_schema_version` table next to
/// the mart. Connectivity failures surface as [`EtlError::TargetUnavailable`]
/// so the caller can treat them like any other mart outage; an
/// inconsistent recorded state is [`EtlError::SchemaMismatch`] and
/// never retried.
pub struct ClickHouseMigrator {
    pool: Pool,
}

impl ClickHouseMigrator {
    /// Creates a new migrator using the given connection pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn handle(&self) -> Result<ClientHandle, EtlError> {
        self.pool
            .get_handle()
            .await
            .map_err(|e| EtlError::TargetUnavailable(format!("connecting for migration: {e}")))
    }

    /// Applies every pending migration in version order.
    pub async fn up(&self) -> Result<(), EtlError> {
        let mut handle = self.handle().await?;
        ensure_tracking(&mut handle).await?;

        let state = read_state(&mut handle).await?;
        if state.dirty {
            return Err(EtlError::SchemaMismatch(format!(
                "mart schema stuck mid-migration at version {}, repair before restarting",
                state.version,
            )));
        }

        let pending: Vec<&Migration> = MIGRATIONS
            .iter()
            .filter(|m| m.version > state.version)
            .collect();

        if pending.is_empty() {
            info!(version = state.version, "mart schema is current");
            return Ok(());
        }

        for migration in pending {
            info!(version = migration.version, "applying mart migration");

            // Dirty until every statement of this version has run.
            record(&mut handle, migration.version, true).await?;
            run_statements(&mut handle, migration.up_sql, migration.version).await?;
            record(&mut handle, migration.version, false).await?;
        }

        let state = read_state(&mut handle).await?;
        info!(version = state.version, "mart migrations applied");

        Ok(())
    }

    /// Rolls back the most recently applied migration.
    pub async fn down(&self) -> Result<(), EtlError> {
        let mut handle = self.handle().await?;
        ensure_tracking(&mut handle).await?;

        let state = read_state(&mut handle).await?;
        if state.version == 0 {
            info!("no mart migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == state.version)
            .ok_or_else(|| {
                EtlError::SchemaMismatch(format!(
                    "no embedded migration for recorded version {}",
                    state.version,
                ))
            })?;

        info!(version = state.version, "rolling back mart migration");

        record(&mut handle, state.version, true).await?;
        run_statements(&mut handle, migration.down_sql, migration.version).await?;

        let previous = MIGRATIONS
            .iter()
            .map(|m| m.version)
            .filter(|v| *v < state.version)
            .max()
            .unwrap_or(0);
        record(&mut handle, previous, false).await?;

        info!(version = previous, "mart rollback finished");

        Ok(())
    }

    /// Returns the recorded schema state.
    pub async fn status(&self) -> Result<SchemaState, EtlError> {
        let mut handle = self.handle().await?;
        ensure_tracking(&mut handle).await?;
        read_state(&mut handle).await
    }

    /// Overrides the mart's TTL with the configured retention.
    ///
    /// The embedded DDL bakes the default 365 days; deployments with a
    /// different retention apply it here after migrations run.
    pub async fn apply_retention(&self, retention_days: u32) -> Result<(), EtlError> {
        let sql = format!(
            "ALTER TABLE user_prosthesis_stats \
             MODIFY TTL report_date + INTERVAL {retention_days} DAY DELETE"
        );

        let mut handle = self.handle().await?;
        handle
            .execute(sql.as_str())
            .await
            .map_err(|e| EtlError::TargetUnavailable(format!("changing mart retention: {e}")))?;

        info!(retention_days, "mart retention TTL applied");

        Ok(())
    }
}

/// Creates the single-row state table if missing.
async fn ensure_tracking(handle: &mut ClientHandle) -> Result<(), EtlError> {
    handle
        .execute(
            "CREATE TABLE IF NOT EXISTS etl_schema_version (
                version Int64,
                dirty UInt8
            ) ENGINE = TinyLog",
        )
        .await
        .map_err(|e| EtlError::TargetUnavailable(format!("creating etl_schema_version: {e}")))
}

/// Reads the recorded state; an empty table is version 0, clean.
async fn read_state(handle: &mut ClientHandle) -> Result<SchemaState, EtlError> {
    let block = handle
        .query("SELECT version, dirty FROM etl_schema_version LIMIT 1")
        .fetch_all()
        .await
        .map_err(|e| EtlError::TargetUnavailable(format!("reading etl_schema_version: {e}")))?;

    let Some(row) = block.rows().next() else {
        return Ok(SchemaState {
            version: 0,
            dirty: false,
        });
    };

    let version: i64 = row
        .get("version")
        .map_err(|e| EtlError::SchemaMismatch(format!("etl_schema_version.version: {e}")))?;
    let dirty: u8 = row
        .get("dirty")
        .map_err(|e| EtlError::SchemaMismatch(format!("etl_schema_version.dirty: {e}")))?;

    Ok(SchemaState {
        version: version as u32,
        dirty: dirty != 0,
    })
}

/// Replaces the recorded state. TinyLog has no update path, so the row
/// is rewritten wholesale.
async fn record(handle: &mut ClientHandle, version: u32, dirty: bool) -> Result<(), EtlError> {
    handle
        .execute("TRUNCATE TABLE etl_schema_version")
        .await
        .map_err(|e| EtlError::TargetUnavailable(format!("clearing etl_schema_version: {e}")))?;

    let sql = format!(
        "INSERT INTO etl_schema_version (version, dirty) VALUES ({version}, {})",
        u8::from(dirty),
    );

    handle
        .execute(sql.as_str())
        .await
        .map_err(|e| EtlError::TargetUnavailable(format!("recording schema version: {e}")))
}

/// Runs each statement of one migration file in order.
async fn run_statements(
    handle: &mut ClientHandle,
    sql: &str,
    version: u32,
) -> Result<(), EtlError> {
    for statement in split_statements(sql) {
        handle.execute(statement).await.map_err(|e| {
            let preview: String = statement.chars().take(60).collect();
            EtlError::TargetUnavailable(format!(
                "migration {version} failed at \"{preview}\": {e}"
            ))
        })?;
    }

    Ok(())
}

/// Splits SQL text into statements, dropping blank segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .filter_map(|s| {
            let s = s.trim();
            (!s.is_empty()).then_some(s)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements() {
        let sql = "CREATE TABLE foo (id Int32); CREATE TABLE bar (id Int32);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE foo"));
        assert!(stmts[1].starts_with("CREATE TABLE bar"));

        assert!(split_statements("").is_empty());
        assert!(split_statements("  \n ; ; \n").is_empty());
        assert_eq!(split_statements("SELECT 1;;;").len(), 1);
    }

    #[test]
    fn test_embedded_migrations_are_complete_and_ordered() {
        assert!(!MIGRATIONS.is_empty());

        for m in MIGRATIONS {
            assert!(m.version > 0);
            assert!(!m.up_sql.is_empty(), "version {} has empty up SQL", m.version);
            assert!(
                !m.down_sql.is_empty(),
                "version {} has empty down SQL",
                m.version
            );
        }

        for pair in MIGRATIONS.windows(2) {
            assert!(
                pair[0].version < pair[1].version,
                "versions {} and {} out of order",
                pair[0].version,
                pair[1].version,
            );
        }
    }

    #[test]
    fn test_mart_ddl_shape() {
        let init = MIGRATIONS[0].up_sql;
        assert!(init.contains("ReplacingMergeTree(etl_processed_at)"));
        assert!(init.contains("PARTITION BY toYYYYMM(report_date)"));
        assert!(init.contains("ORDER BY (user_id, report_date, report_hour, prosthesis_id)"));
        assert!(init.contains("TTL report_date + INTERVAL 365 DAY"));

        let views = MIGRATIONS[1].up_sql;
        assert!(views.contains("count(DISTINCT report_hour) AS active_hours"));
        assert!(views.contains("count(DISTINCT report_date) AS active_days"));
    }
}
