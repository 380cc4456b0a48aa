//! Actor system for dispatching tenant jobs as child processes.
//!
//! # Architecture
//!
//! - `WorkerManager` - per-node set of tenant workers, driven by add/remove
//! - `TenantWorker` - owns a tenant's slot workers and aggregates stats
//! - `SlotWorker` - claims one request at a time and runs it to completion
//! - `ProcessSupervisor` - spawns, streams and cancels a single process
//! - `JobRegistry` - cancel handles of running jobs
//! - `ControlChannel` - applies commands received on the control bus
//!
//! # Usage
//!
//! ```ignore
//! use actors::{ManagerArgs, WorkerContext, start_manager};
//!
//! let context = Arc::new(WorkerContext::new(broker, store, registry, config));
//! let (manager, _handle) = start_manager(ManagerArgs { context, roster: None }).await?;
//! manager.add_tenant(TenantId::new("acct1")?).await?;
//! ```

mod context;
mod control;
mod manager;
mod messages;
pub mod process;
pub mod registry;
mod roster;
mod slot_worker;
mod tenant_worker;

pub use context::WorkerContext;
pub use control::ControlChannel;
pub use manager::{ManagerArgs, ManagerHandle, WorkerManager, start_manager};
pub use messages::{ManagerError, ManagerMessage, SlotMessage, TenantMessage};
pub use process::{
    CancelHandle, Completion, LogSink, ProcessError, ProcessFailure, ProcessSpec, ProcessSupervisor,
    RunningProcess, SpawnError,
};
pub use registry::{CancelOutcome, JobRegistry, RegistryError};
pub use roster::{RosterError, TenantRoster};
pub use slot_worker::{SlotWorker, SlotWorkerArgs};
pub use tenant_worker::{TenantWorker, TenantWorkerArgs};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
