//! In-process [`Broker`] implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dispatch_core::{JobRequest, QueueCounts, TenantId};
use tokio::sync::Notify;

use crate::queue::{
    AckDisposition, AckOutcome, Broker, BrokerError, BrokerFuture, Delivery, DeliveryTag,
};

/// A request waiting in a queue together with the attempts already made.
#[derive(Debug)]
struct Waiting {
    request: JobRequest,
    attempts: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    waiting: VecDeque<Waiting>,
    in_flight: HashMap<DeliveryTag, Delivery>,
    completed: u64,
    failed: u64,
}

#[derive(Debug, Default)]
struct TenantQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl TenantQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO queues per tenant with bounded redelivery of retryable failures.
///
/// Nothing survives a restart; in-flight deliveries can be handed back with
/// [`MemoryBroker::requeue_in_flight`] to emulate crash redelivery.
#[derive(Debug)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<TenantId, Arc<TenantQueue>>>,
    next_tag: AtomicU64,
    max_attempts: u32,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryBroker {
    /// Create a broker that delivers each request at most `max_attempts` times.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            max_attempts: max_attempts.max(1),
        }
    }

    fn queue(&self, tenant_id: &TenantId) -> Arc<TenantQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.entry(tenant_id.clone()).or_default().clone()
    }

    /// Put every unacknowledged delivery of a tenant back at the head of its
    /// queue, as a broker does when a consumer dies.
    pub fn requeue_in_flight(&self, tenant_id: &TenantId) -> usize {
        let queue = self.queue(tenant_id);
        let requeued = {
            let mut state = queue.lock();
            let mut deliveries: Vec<Delivery> = state.in_flight.drain().map(|(_, d)| d).collect();
            deliveries.sort_by_key(|d| std::cmp::Reverse(d.tag.0));
            let count = deliveries.len();
            for d in deliveries {
                state.waiting.push_front(Waiting {
                    request: d.request,
                    attempts: d.attempt,
                });
            }
            count
        };
        for _ in 0..requeued {
            queue.ready.notify_one();
        }
        if requeued > 0 {
            tracing::warn!("Requeued {} in-flight jobs for {}", requeued, tenant_id);
        }
        requeued
    }

    /// Tenants that currently have waiting or in-flight requests.
    pub fn tenants_with_work(&self) -> Vec<TenantId> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tenants: Vec<TenantId> = queues
            .iter()
            .filter(|(_, q)| {
                let state = q.lock();
                !state.waiting.is_empty() || !state.in_flight.is_empty()
            })
            .map(|(t, _)| t.clone())
            .collect();
        tenants.sort();
        tenants
    }

    fn try_claim(&self, queue: &TenantQueue) -> Option<Delivery> {
        let mut state = queue.lock();
        let waiting = state.waiting.pop_front()?;
        let delivery = Delivery {
            tag: DeliveryTag(self.next_tag.fetch_add(1, Ordering::Relaxed)),
            request: waiting.request,
            attempt: waiting.attempts + 1,
        };
        state.in_flight.insert(delivery.tag, delivery.clone());
        // A single stored permit can cover several enqueues; pass the wakeup on.
        if !state.waiting.is_empty() {
            queue.ready.notify_one();
        }
        Some(delivery)
    }
}

impl Broker for MemoryBroker {
    fn enqueue(&self, request: JobRequest) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let queue = self.queue(&request.tenant_id);
            tracing::debug!("Enqueued job {} for {}", request.job_id, request.tenant_id);
            queue.lock().waiting.push_back(Waiting {
                request,
                attempts: 0,
            });
            queue.ready.notify_one();
            Ok(())
        })
    }

    fn claim<'a>(&'a self, tenant_id: &'a TenantId) -> BrokerFuture<'a, Delivery> {
        Box::pin(async move {
            let queue = self.queue(tenant_id);
            loop {
                if let Some(delivery) = self.try_claim(&queue) {
                    return Ok(delivery);
                }
                queue.ready.notified().await;
            }
        })
    }

    fn ack<'a>(
        &'a self,
        delivery: &'a Delivery,
        outcome: AckOutcome,
    ) -> BrokerFuture<'a, AckDisposition> {
        Box::pin(async move {
            let tenant_id = &delivery.request.tenant_id;
            let queue = self.queue(tenant_id);
            let disposition = {
                let mut state = queue.lock();
                let Some(claimed) = state.in_flight.remove(&delivery.tag) else {
                    return Err(BrokerError::UnknownDelivery {
                        tenant_id: tenant_id.clone(),
                        tag: delivery.tag,
                    });
                };

                match outcome {
                    AckOutcome::Completed => {
                        state.completed += 1;
                        AckDisposition::Completed
                    }
                    AckOutcome::Failed { retryable } if retryable && claimed.attempt < self.max_attempts => {
                        state.waiting.push_back(Waiting {
                            request: claimed.request,
                            attempts: claimed.attempt,
                        });
                        AckDisposition::Requeued {
                            next_attempt: claimed.attempt + 1,
                        }
                    }
                    AckOutcome::Failed { .. } => {
                        state.failed += 1;
                        AckDisposition::Failed
                    }
                }
            };

            if let AckDisposition::Requeued { next_attempt } = disposition {
                tracing::info!(
                    "Requeued job {} for {} (attempt {})",
                    delivery.request.job_id,
                    tenant_id,
                    next_attempt
                );
                queue.ready.notify_one();
            }
            Ok(disposition)
        })
    }

    fn counts<'a>(&'a self, tenant_id: &'a TenantId) -> BrokerFuture<'a, QueueCounts> {
        Box::pin(async move {
            let queue = self.queue(tenant_id);
            let state = queue.lock();
            Ok(QueueCounts {
                waiting: state.waiting.len() as u64,
                active: state.in_flight.len() as u64,
                completed: state.completed,
                failed: state.failed,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    #[tokio::test]
    async fn claims_in_fifo_order() -> Result<(), BrokerError> {
        let broker = MemoryBroker::default();
        let t = tenant("acct1");
        let first = JobRequest::new(t.clone(), "a.py");
        let second = JobRequest::new(t.clone(), "b.py");
        broker.enqueue(first.clone()).await?;
        broker.enqueue(second.clone()).await?;

        let d1 = broker.claim(&t).await?;
        let d2 = broker.claim(&t).await?;
        assert_eq!(d1.request.job_id, first.job_id);
        assert_eq!(d2.request.job_id, second.job_id);
        assert_eq!(d1.attempt, 1);

        let counts = broker.counts(&t).await?;
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.active, 2);
        Ok(())
    }

    #[tokio::test]
    async fn claim_waits_for_enqueue() -> Result<(), BrokerError> {
        let broker = Arc::new(MemoryBroker::default());
        let t = tenant("acct1");

        let claimer = {
            let broker = broker.clone();
            let t = t.clone();
            tokio::spawn(async move { broker.claim(&t).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!claimer.is_finished());

        let request = JobRequest::new(t.clone(), "late.py");
        broker.enqueue(request.clone()).await?;
        let delivery = tokio::time::timeout(Duration::from_secs(1), claimer)
            .await
            .expect("claim should wake")
            .expect("task panicked")?;
        assert_eq!(delivery.request.job_id, request.job_id);
        Ok(())
    }

    #[tokio::test]
    async fn tenants_are_isolated() -> Result<(), BrokerError> {
        let broker = MemoryBroker::default();
        broker.enqueue(JobRequest::new(tenant("a"), "x.py")).await?;

        let other = tenant("b");
        let blocked = tokio::time::timeout(Duration::from_millis(30), broker.claim(&other)).await;
        assert!(blocked.is_err());
        assert_eq!(broker.tenants_with_work(), vec![tenant("a")]);
        Ok(())
    }

    #[tokio::test]
    async fn retryable_failures_redeliver_until_attempts_run_out() -> Result<(), BrokerError> {
        let broker = MemoryBroker::new(2);
        let t = tenant("acct1");
        broker.enqueue(JobRequest::new(t.clone(), "flaky.py")).await?;

        let first = broker.claim(&t).await?;
        let disposition = broker
            .ack(&first, AckOutcome::Failed { retryable: true })
            .await?;
        assert_eq!(disposition, AckDisposition::Requeued { next_attempt: 2 });

        let second = broker.claim(&t).await?;
        assert_eq!(second.attempt, 2);
        assert_eq!(second.request.job_id, first.request.job_id);
        let disposition = broker
            .ack(&second, AckOutcome::Failed { retryable: true })
            .await?;
        assert_eq!(disposition, AckDisposition::Failed);

        let counts = broker.counts(&t).await?;
        assert_eq!((counts.waiting, counts.active, counts.failed), (0, 0, 1));
        Ok(())
    }

    #[tokio::test]
    async fn double_ack_is_rejected() -> Result<(), BrokerError> {
        let broker = MemoryBroker::default();
        let t = tenant("acct1");
        broker.enqueue(JobRequest::new(t.clone(), "once.py")).await?;
        let delivery = broker.claim(&t).await?;

        broker.ack(&delivery, AckOutcome::Completed).await?;
        let again = broker.ack(&delivery, AckOutcome::Completed).await;
        assert!(matches!(again, Err(BrokerError::UnknownDelivery { .. })));
        assert_eq!(broker.counts(&t).await?.completed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn requeue_in_flight_redelivers_with_next_attempt() -> Result<(), BrokerError> {
        let broker = MemoryBroker::default();
        let t = tenant("acct1");
        broker.enqueue(JobRequest::new(t.clone(), "crash.py")).await?;
        let lost = broker.claim(&t).await?;

        assert_eq!(broker.requeue_in_flight(&t), 1);
        let redelivered = broker.claim(&t).await?;
        assert_eq!(redelivered.request.job_id, lost.request.job_id);
        assert_eq!(redelivered.attempt, 2);
        assert_ne!(redelivered.tag, lost.tag);
        Ok(())
    }
}
