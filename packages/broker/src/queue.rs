//! Durable queue primitive consumed by tenant workers.

use std::future::Future;
use std::pin::Pin;

use dispatch_core::{JobRequest, QueueCounts, TenantId};

/// Future type returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Broker-assigned identifier of one delivery of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// A claimed request. The claimer owns it until it is acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub request: JobRequest,
    /// 1 on first delivery, incremented on each redelivery.
    pub attempt: u32,
}

/// How a claimed request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Completed,
    /// `retryable` lets the broker redeliver according to its own policy.
    Failed { retryable: bool },
}

/// What the broker did with an acknowledged delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    Completed,
    Failed,
    /// Put back on the queue for another attempt.
    Requeued { next_attempt: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker closed")]
    Closed,

    #[error("unknown delivery {tag} for tenant {tenant_id}")]
    UnknownDelivery { tenant_id: TenantId, tag: DeliveryTag },
}

/// Durable per-tenant job queue.
///
/// `claim` suspends until a request is available; FIFO order per tenant is
/// the broker's responsibility.
pub trait Broker: Send + Sync + 'static {
    /// Append a request to its tenant's queue.
    fn enqueue(&self, request: JobRequest) -> BrokerFuture<'_, ()>;

    /// Wait for and claim the next request of a tenant queue.
    fn claim<'a>(&'a self, tenant_id: &'a TenantId) -> BrokerFuture<'a, Delivery>;

    /// Acknowledge a claimed delivery.
    fn ack<'a>(&'a self, delivery: &'a Delivery, outcome: AckOutcome) -> BrokerFuture<'a, AckDisposition>;

    /// Job counts by status for one tenant.
    fn counts<'a>(&'a self, tenant_id: &'a TenantId) -> BrokerFuture<'a, QueueCounts>;
}
