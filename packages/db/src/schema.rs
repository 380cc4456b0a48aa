//! Database schema definitions using SurrealQL.

use crate::{DbError, get_db};

/// Create the tables and indexes used by the repositories.
pub async fn init_schema() -> Result<(), DbError> {
    let db = get_db()?;

    tracing::info!("Initializing database schema...");

    db.query(EXECUTION_SCHEMA).await?.check()?;
    db.query(LOG_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Latest execution record per job. The record id is the tenant/job key.
const EXECUTION_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job_execution SCHEMALESS;

DEFINE INDEX IF NOT EXISTS execution_tenant ON job_execution FIELDS tenant_id;
DEFINE INDEX IF NOT EXISTS execution_tenant_status ON job_execution FIELDS tenant_id, status;
"#;

/// Append-only job output.
const LOG_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job_log SCHEMALESS;

DEFINE INDEX IF NOT EXISTS log_job_seq ON job_log FIELDS tenant_id, job_id, seq;
"#;
