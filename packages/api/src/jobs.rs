//! Job submission, termination and lookups.

use chrono::Utc;
use dispatch_core::{
    ControlCommand, JobEvent, JobExecution, JobId, JobRequest, LogLine, QueueCounts, TenantId,
};

use crate::dispatcher::{DispatchError, Dispatcher};

/// Answer to a terminate request. `accepted` means the request was sent on
/// the control bus, not that the job has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateAck {
    pub accepted: bool,
}

impl Dispatcher {
    /// Put a script run on the tenant's queue.
    pub async fn submit_job(
        &self,
        tenant_id: TenantId,
        script_ref: impl Into<String>,
        arg_string: Option<String>,
        work_dir: Option<String>,
    ) -> Result<JobId, DispatchError> {
        let mut request = JobRequest::new(tenant_id, script_ref);
        if let Some(args) = arg_string.filter(|a| !a.trim().is_empty()) {
            request = request.with_args(args);
        }
        if let Some(dir) = work_dir {
            request = request.with_work_dir(dir);
        }
        self.submit(request).await
    }

    /// Enqueue a prepared request.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, DispatchError> {
        let job_id = request.job_id;
        tracing::info!(
            "Enqueueing job {} for {}: {}",
            job_id,
            request.tenant_id,
            request.script_ref
        );
        self.broker.enqueue(request.clone()).await?;
        let _ = self.context.events.send(JobEvent::JobEnqueued {
            request,
            timestamp: Utc::now(),
        });
        Ok(job_id)
    }

    /// Ask whichever node runs the job to terminate it.
    pub async fn terminate_job(&self, tenant_id: TenantId, job_id: JobId) -> TerminateAck {
        let command = ControlCommand::terminate(tenant_id, job_id);
        match self.publish(&command).await {
            Ok(()) => TerminateAck { accepted: true },
            Err(e) => {
                tracing::warn!("Failed to send terminate request for job {}: {}", job_id, e);
                TerminateAck { accepted: false }
            }
        }
    }

    /// Latest recorded execution of a job; `None` while it is still queued.
    pub async fn job_status(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<Option<JobExecution>, DispatchError> {
        Ok(self.store.latest_execution(tenant_id, job_id).await?)
    }

    /// Every stored line of a job, in sequence order.
    pub async fn replay_logs(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<Vec<LogLine>, DispatchError> {
        Ok(self.store.logs(tenant_id, job_id).await?)
    }

    pub async fn queue_counts(&self, tenant_id: &TenantId) -> Result<QueueCounts, DispatchError> {
        Ok(self.broker.counts(tenant_id).await?)
    }

    /// Parse a job id received from outside.
    pub fn parse_job_id(raw: &str) -> Result<JobId, DispatchError> {
        JobId::parse(raw).map_err(|e| DispatchError::InvalidJobId(format!("{}: {}", raw, e)))
    }
}
