//! [`ExecutionStore`] backed by the SurrealDB repositories.

use dispatch_core::{ExecutionStore, JobExecution, JobId, LogLine, StoreError, StoreFuture, TenantId};

use crate::DbError;
use crate::repositories::{ExecutionRepository, LogRepository};

/// Store handle over the global connection. Requires [`crate::init`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SurrealStore;

impl SurrealStore {
    pub fn new() -> Self {
        Self
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl ExecutionStore for SurrealStore {
    fn record_execution(&self, execution: JobExecution) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            ExecutionRepository::upsert(&execution).await?;
            Ok(())
        })
    }

    fn append_log(&self, tenant_id: TenantId, job_id: JobId, line: LogLine) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            LogRepository::append(&tenant_id, job_id, &line).await?;
            Ok(())
        })
    }

    fn latest_execution(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> StoreFuture<'_, Option<JobExecution>> {
        Box::pin(async move { Ok(ExecutionRepository::get(&tenant_id, job_id).await?) })
    }

    fn logs(&self, tenant_id: TenantId, job_id: JobId) -> StoreFuture<'_, Vec<LogLine>> {
        Box::pin(async move { Ok(LogRepository::list(&tenant_id, job_id).await?) })
    }
}
