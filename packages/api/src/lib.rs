//! Dispatcher facade for the job dispatch system.
//!
//! [`Dispatcher`] is what callers outside the node talk to:
//! - Jobs (submit, terminate, status, log replay)
//! - Tenants (add, remove, stats)
//! - Real-time output (log subscriptions, event stream)

mod dispatcher;
mod init;
mod jobs;
mod realtime;

pub use dispatcher::{Backends, DispatchError, Dispatcher};
pub use init::init_dispatcher;
pub use jobs::TerminateAck;
pub use realtime::LogSubscription;

// Re-export core types for convenience
pub use dispatch_core::{
    DispatchConfig, ExecutionStatus, JobEvent, JobExecution, JobId, JobRequest, LogLine, LogStream,
    QueueCounts, Severity, TenantId, TenantStats,
};
