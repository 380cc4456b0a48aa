//! Job domain types: requests waiting in a tenant queue and the executions
//! created when a worker claims them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::TenantId;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request to run one script for one tenant.
///
/// Immutable once enqueued; the broker owns it until a worker claims it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub tenant_id: TenantId,
    pub job_id: JobId,
    /// Script path handed to the interpreter.
    pub script_ref: String,
    /// Extra arguments, split on whitespace when the argv is built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg_string: Option<String>,
    /// Working directory for the child process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl JobRequest {
    /// Create a request with a fresh job ID.
    pub fn new(tenant_id: TenantId, script_ref: impl Into<String>) -> Self {
        Self {
            tenant_id,
            job_id: JobId::new(),
            script_ref: script_ref.into(),
            arg_string: None,
            work_dir: None,
            enqueued_at: Utc::now(),
        }
    }

    /// Set the additional argument string.
    pub fn with_args(mut self, arg_string: impl Into<String>) -> Self {
        self.arg_string = Some(arg_string.into());
        self
    }

    /// Set the working directory.
    pub fn with_work_dir(mut self, work_dir: impl Into<String>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }
}

/// Lifecycle status of a job execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Claimed but the process has not been spawned yet.
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Cancel was requested before the process exited.
    Terminated,
}

impl ExecutionStatus {
    /// Check if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Terminated
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt at running a [`JobRequest`].
///
/// Mutated only by the worker that claimed the request. Once the status is
/// terminal the transition methods leave the execution untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecution {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Delivery attempt reported by the broker (1 on first delivery).
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

impl JobExecution {
    /// Create a pending execution for a claimed request.
    pub fn claimed(request: &JobRequest, attempt: u32) -> Self {
        Self {
            job_id: request.job_id,
            tenant_id: request.tenant_id.clone(),
            pid: None,
            started_at: Utc::now(),
            finished_at: None,
            status: ExecutionStatus::Pending,
            exit_code: None,
            failure_reason: None,
            attempt,
        }
    }

    /// Mark the process as spawned.
    pub fn mark_running(&mut self, pid: u32) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.pid = Some(pid);
        self.status = ExecutionStatus::Running;
        true
    }

    /// Record a clean exit.
    pub fn mark_succeeded(&mut self, finished_at: DateTime<Utc>) -> bool {
        self.finish(ExecutionStatus::Succeeded, Some(0), None, finished_at)
    }

    /// Record a spawn error or nonzero exit.
    pub fn mark_failed(
        &mut self,
        exit_code: Option<i32>,
        reason: impl Into<String>,
        finished_at: DateTime<Utc>,
    ) -> bool {
        self.finish(
            ExecutionStatus::Failed,
            exit_code,
            Some(reason.into()),
            finished_at,
        )
    }

    /// Record an exit that followed a cancel request.
    pub fn mark_terminated(&mut self, exit_code: Option<i32>, finished_at: DateTime<Utc>) -> bool {
        self.finish(ExecutionStatus::Terminated, exit_code, None, finished_at)
    }

    fn finish(
        &mut self,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        failure_reason: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.exit_code = exit_code;
        self.failure_reason = failure_reason;
        self.finished_at = Some(finished_at);
        true
    }

    /// Wall-clock duration, available once the execution finished.
    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|f| (f - self.started_at).num_milliseconds().max(0) as u64)
    }
}
