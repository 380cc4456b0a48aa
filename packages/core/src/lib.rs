//! Core domain types for the job dispatch system.
//!
//! This crate contains shared types used across all packages:
//! - Tenants and per-tenant statistics
//! - Job requests, executions and their status
//! - Log lines captured from job processes
//! - Control-plane commands and real-time events
//! - The execution store interface

mod command;
mod config;
mod control;
mod events;
mod job;
mod log;
mod store;
mod tenant;

pub use command::{ACCOUNT_FLAG, argv_for, build_argv, split_args, truncate_utf8};
pub use config::{ConfigError, DispatchConfig};
pub use control::{ControlCommand, ControlError, topics};
pub use events::JobEvent;
pub use job::{ExecutionStatus, JobExecution, JobId, JobRequest};
pub use log::{LineStamper, LogLine, LogStream, Severity};
pub use store::{ExecutionStore, MemoryStore, StoreError, StoreFuture};
pub use tenant::{KEY_DELIMITER, QueueCounts, TenantId, TenantIdError, TenantStats};
