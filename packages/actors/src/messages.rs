//! Message types for actor communication.

use broker::DeliveryTag;
use dispatch_core::{ExecutionStatus, TenantId, TenantStats};
use ractor::RpcReplyPort;

/// Messages for a TenantWorker.
#[derive(Debug)]
pub enum TenantMessage {
    /// Current statistics.
    GetStats { reply: RpcReplyPort<TenantStats> },

    /// A slot worker spawned the process of a delivery.
    JobStarted { tag: DeliveryTag },

    /// A slot worker recorded the terminal status of a delivery.
    JobFinished {
        tag: DeliveryTag,
        status: ExecutionStatus,
    },

    /// Stop claiming; cancel in-flight jobs too when `force`. The reply is
    /// sent once every slot worker has stopped.
    Drain {
        force: bool,
        reply: Option<RpcReplyPort<TenantStats>>,
    },
}

/// Messages for a slot worker.
#[derive(Debug)]
pub enum SlotMessage {
    /// Claim the next request and run it.
    Claim,
}

/// Messages for the WorkerManager.
#[derive(Debug)]
pub enum ManagerMessage {
    /// Start a tenant worker unless one is running. Replies `true` when a
    /// worker was created.
    AddTenant {
        tenant_id: TenantId,
        reply: Option<RpcReplyPort<bool>>,
    },

    /// Forget a tenant and drain its worker. Replies `true` when the tenant
    /// was known.
    RemoveTenant {
        tenant_id: TenantId,
        force: bool,
        reply: Option<RpcReplyPort<bool>>,
    },

    /// Like `RemoveTenant`, replying once the worker finished draining.
    DrainTenant {
        tenant_id: TenantId,
        force: bool,
        reply: RpcReplyPort<Option<TenantStats>>,
    },

    /// Tenants with a running worker.
    ListTenants { reply: RpcReplyPort<Vec<TenantId>> },

    /// Statistics of one tenant worker.
    TenantStats {
        tenant_id: TenantId,
        reply: RpcReplyPort<Option<TenantStats>>,
    },

    /// Drain every tenant and stop. Replies once all workers stopped.
    Shutdown {
        force: bool,
        reply: Option<RpcReplyPort<()>>,
    },
}

/// Errors from talking to the actor tree.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("worker manager is not running")]
    NotRunning,

    #[error("worker manager did not reply")]
    NoReply,
}
