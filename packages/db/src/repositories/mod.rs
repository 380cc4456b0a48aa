//! Repository implementations for database operations.

mod execution_repo;
mod log_repo;

pub use execution_repo::ExecutionRepository;
pub use log_repo::LogRepository;

use dispatch_core::{JobId, TenantId};

/// Record id shared by a job's execution row.
pub(crate) fn record_key(tenant_id: &TenantId, job_id: JobId) -> String {
    format!("{}/{}", tenant_id, job_id)
}
