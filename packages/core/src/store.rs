//! Persistent log/status store interface.
//!
//! Workers append log lines and record execution status through
//! [`ExecutionStore`]; the dispatcher reads them back for replay and status
//! lookups. [`MemoryStore`] keeps everything in process memory.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use crate::{JobExecution, JobId, LogLine, TenantId};

/// Future type returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Append-only job logs plus latest execution status, keyed by
/// `(tenant, job)`.
pub trait ExecutionStore: Send + Sync + 'static {
    /// Insert or replace the latest execution record for its job.
    fn record_execution(&self, execution: JobExecution) -> StoreFuture<'_, ()>;

    /// Append one log line to a job's log.
    fn append_log(&self, tenant_id: TenantId, job_id: JobId, line: LogLine) -> StoreFuture<'_, ()>;

    /// Latest recorded execution for a job.
    fn latest_execution(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> StoreFuture<'_, Option<JobExecution>>;

    /// Every stored line of a job ordered by sequence number.
    fn logs(&self, tenant_id: TenantId, job_id: JobId) -> StoreFuture<'_, Vec<LogLine>>;
}

type Key = (TenantId, JobId);

/// In-memory [`ExecutionStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    executions: Mutex<HashMap<Key, JobExecution>>,
    logs: Mutex<HashMap<Key, Vec<LogLine>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded execution for a tenant.
    pub fn executions_for(&self, tenant_id: &TenantId) -> Vec<JobExecution> {
        let executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<JobExecution> = executions
            .values()
            .filter(|e| &e.tenant_id == tenant_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.job_id);
        found
    }
}

impl ExecutionStore for MemoryStore {
    fn record_execution(&self, execution: JobExecution) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
            executions.insert((execution.tenant_id.clone(), execution.job_id), execution);
            Ok(())
        })
    }

    fn append_log(&self, tenant_id: TenantId, job_id: JobId, line: LogLine) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
            logs.entry((tenant_id, job_id)).or_default().push(line);
            Ok(())
        })
    }

    fn latest_execution(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> StoreFuture<'_, Option<JobExecution>> {
        Box::pin(async move {
            let executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(executions.get(&(tenant_id, job_id)).cloned())
        })
    }

    fn logs(&self, tenant_id: TenantId, job_id: JobId) -> StoreFuture<'_, Vec<LogLine>> {
        Box::pin(async move {
            let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
            let mut lines = logs.get(&(tenant_id, job_id)).cloned().unwrap_or_default();
            lines.sort_by_key(|l| l.seq);
            Ok(lines)
        })
    }
}
