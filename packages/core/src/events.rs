//! Event types for real-time updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, JobRequest, LogLine, TenantId, TenantStats};

/// Events emitted by the dispatch system for real-time updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    // Tenant worker events
    /// A tenant worker started claiming jobs.
    WorkerStarted {
        tenant_id: TenantId,
        concurrency_limit: usize,
        timestamp: DateTime<Utc>,
    },
    /// A tenant worker stopped claiming and is finishing in-flight jobs.
    WorkerDraining {
        tenant_id: TenantId,
        in_flight: usize,
        force: bool,
        timestamp: DateTime<Utc>,
    },
    /// A tenant worker finished draining and stopped.
    WorkerStopped {
        tenant_id: TenantId,
        stats: TenantStats,
        timestamp: DateTime<Utc>,
    },

    // Job events
    /// A job request was put on a tenant queue.
    JobEnqueued {
        request: JobRequest,
        timestamp: DateTime<Utc>,
    },
    /// The job's process was spawned.
    JobStarted {
        tenant_id: TenantId,
        job_id: JobId,
        pid: u32,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// A line of job output.
    JobLog {
        tenant_id: TenantId,
        job_id: JobId,
        line: LogLine,
    },
    /// The job's process exited with code 0.
    JobSucceeded {
        tenant_id: TenantId,
        job_id: JobId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// The job failed to spawn or exited nonzero.
    JobFailed {
        tenant_id: TenantId,
        job_id: JobId,
        exit_code: Option<i32>,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// The job exited after a cancel request.
    JobTerminated {
        tenant_id: TenantId,
        job_id: JobId,
        exit_code: Option<i32>,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::WorkerStarted { timestamp, .. } => *timestamp,
            JobEvent::WorkerDraining { timestamp, .. } => *timestamp,
            JobEvent::WorkerStopped { timestamp, .. } => *timestamp,
            JobEvent::JobEnqueued { timestamp, .. } => *timestamp,
            JobEvent::JobStarted { timestamp, .. } => *timestamp,
            JobEvent::JobLog { line, .. } => line.timestamp,
            JobEvent::JobSucceeded { timestamp, .. } => *timestamp,
            JobEvent::JobFailed { timestamp, .. } => *timestamp,
            JobEvent::JobTerminated { timestamp, .. } => *timestamp,
        }
    }

    /// Get the tenant this event belongs to.
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            JobEvent::WorkerStarted { tenant_id, .. }
            | JobEvent::WorkerDraining { tenant_id, .. }
            | JobEvent::WorkerStopped { tenant_id, .. }
            | JobEvent::JobStarted { tenant_id, .. }
            | JobEvent::JobLog { tenant_id, .. }
            | JobEvent::JobSucceeded { tenant_id, .. }
            | JobEvent::JobFailed { tenant_id, .. }
            | JobEvent::JobTerminated { tenant_id, .. } => tenant_id,
            JobEvent::JobEnqueued { request, .. } => &request.tenant_id,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobEnqueued { request, .. } => Some(request.job_id),
            JobEvent::JobStarted { job_id, .. }
            | JobEvent::JobLog { job_id, .. }
            | JobEvent::JobSucceeded { job_id, .. }
            | JobEvent::JobFailed { job_id, .. }
            | JobEvent::JobTerminated { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Check if this event ends a job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::JobSucceeded { .. } | JobEvent::JobFailed { .. } | JobEvent::JobTerminated { .. }
        )
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::WorkerStarted {
                tenant_id,
                concurrency_limit,
                ..
            } => format!("Worker for {} started (limit {})", tenant_id, concurrency_limit),
            JobEvent::WorkerDraining {
                tenant_id,
                in_flight,
                force,
                ..
            } => {
                let mode = if *force { "force" } else { "graceful" };
                format!("Worker for {} draining {} jobs ({})", tenant_id, in_flight, mode)
            }
            JobEvent::WorkerStopped { tenant_id, .. } => format!("Worker for {} stopped", tenant_id),
            JobEvent::JobEnqueued { request, .. } => {
                format!("Job {} enqueued for {}", request.job_id, request.tenant_id)
            }
            JobEvent::JobStarted { job_id, pid, .. } => {
                format!("Job {} started as pid {}", job_id, pid)
            }
            JobEvent::JobLog { job_id, line, .. } => {
                format!("Job {} [{}] {}", job_id, line.severity, line.text)
            }
            JobEvent::JobSucceeded {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} succeeded in {}ms", job_id, duration_ms),
            JobEvent::JobFailed { job_id, reason, .. } => {
                format!("Job {} failed: {}", job_id, reason)
            }
            JobEvent::JobTerminated { job_id, .. } => format!("Job {} terminated", job_id),
        }
    }
}
