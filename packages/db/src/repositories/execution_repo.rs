//! Latest-execution persistence.

use std::collections::HashMap;

use dispatch_core::{ExecutionStatus, JobExecution, JobId, TenantId};
use serde::Deserialize;

use super::record_key;
use crate::{DbError, get_db};

const TABLE: &str = "job_execution";

/// Repository for job execution records.
pub struct ExecutionRepository;

impl ExecutionRepository {
    /// Insert or replace the execution record of a job.
    pub async fn upsert(execution: &JobExecution) -> Result<JobExecution, DbError> {
        let db = get_db()?;
        let key = record_key(&execution.tenant_id, execution.job_id);

        let record: Option<JobExecution> = db
            .upsert((TABLE, key))
            .content(execution.clone())
            .await?;

        record.ok_or_else(|| DbError::Query(format!("Failed to upsert execution {}", execution.job_id)))
    }

    /// Latest execution of a job, if one was recorded.
    pub async fn get(tenant_id: &TenantId, job_id: JobId) -> Result<Option<JobExecution>, DbError> {
        let db = get_db()?;
        let record: Option<JobExecution> = db.select((TABLE, record_key(tenant_id, job_id))).await?;
        Ok(record)
    }

    /// Every execution of a tenant in job id (submission) order.
    pub async fn list_for_tenant(tenant_id: &TenantId) -> Result<Vec<JobExecution>, DbError> {
        let db = get_db()?;

        let mut result = db
            .query("SELECT * FROM job_execution WHERE tenant_id = $tenant_id ORDER BY job_id ASC")
            .bind(("tenant_id", tenant_id.to_string()))
            .await?;

        let records: Vec<JobExecution> = result.take(0)?;
        Ok(records)
    }

    /// Executions of a tenant currently in `status`.
    pub async fn list_by_status(
        tenant_id: &TenantId,
        status: ExecutionStatus,
    ) -> Result<Vec<JobExecution>, DbError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                SELECT * FROM job_execution
                WHERE tenant_id = $tenant_id AND status = $status
                ORDER BY job_id ASC
                "#,
            )
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("status", status.as_str()))
            .await?;

        let records: Vec<JobExecution> = result.take(0)?;
        Ok(records)
    }

    /// Count a tenant's executions by status.
    pub async fn count_by_status(tenant_id: &TenantId) -> Result<HashMap<String, u64>, DbError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                SELECT status, count() AS count
                FROM job_execution
                WHERE tenant_id = $tenant_id
                GROUP BY status
                "#,
            )
            .bind(("tenant_id", tenant_id.to_string()))
            .await?;

        #[derive(Deserialize)]
        struct StatusCount {
            status: Option<String>,
            count: i64,
        }

        let counts: Vec<StatusCount> = result.take(0)?;

        let mut map = HashMap::new();
        for count in counts {
            if let Some(status) = count.status {
                map.insert(status, count.count as u64);
            }
        }
        Ok(map)
    }

    /// Delete a job's execution record.
    pub async fn delete(tenant_id: &TenantId, job_id: JobId) -> Result<(), DbError> {
        let db = get_db()?;
        let _: Option<JobExecution> = db.delete((TABLE, record_key(tenant_id, job_id))).await?;
        Ok(())
    }
}
