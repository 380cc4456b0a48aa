//! Control channel: applies administrative commands received on the bus.

use std::sync::Arc;

use broker::{BrokerError, BusMessage, ControlBus, Subscription, SubscriptionError};
use dispatch_core::{ControlCommand, JobId, TenantId, topics};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::manager::ManagerHandle;
use crate::messages::ManagerError;
use crate::registry::{CancelOutcome, JobRegistry};

/// Subscriber turning bus messages into manager and registry calls.
pub struct ControlChannel {
    bus: Arc<dyn ControlBus>,
    manager: ManagerHandle,
    registry: Arc<JobRegistry>,
    stop: CancellationToken,
}

impl ControlChannel {
    pub fn new(
        bus: Arc<dyn ControlBus>,
        manager: ManagerHandle,
        registry: Arc<JobRegistry>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            bus,
            manager,
            registry,
            stop,
        }
    }

    /// Subscribe now and process messages on a background task until the
    /// stop token fires or the bus closes.
    pub fn spawn(self) -> Result<JoinHandle<()>, BrokerError> {
        let subscription = self.bus.subscribe(&topics::ALL)?;
        Ok(tokio::spawn(self.run(subscription)))
    }

    async fn run(self, mut subscription: Subscription) {
        tracing::info!("Control channel listening on {:?}", topics::ALL);
        loop {
            let received = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                received = subscription.recv() => received,
            };
            match received {
                Ok(message) => self.dispatch(&message).await,
                Err(SubscriptionError::Lagged(skipped)) => {
                    tracing::warn!("Control channel lagged, {} messages skipped", skipped);
                }
                Err(SubscriptionError::Closed) => {
                    tracing::info!("Control bus closed");
                    break;
                }
            }
        }
        tracing::info!("Control channel stopped");
    }

    /// Decode and apply one bus message. Bad messages are logged and dropped.
    pub async fn dispatch(&self, message: &BusMessage) {
        let command = match ControlCommand::decode(&message.topic, &message.payload) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Discarding control message: {}", e);
                return;
            }
        };
        if let Err(e) = self.apply(command).await {
            tracing::warn!("Failed to apply control command: {}", e);
        }
    }

    /// Apply a decoded command.
    pub async fn apply(&self, command: ControlCommand) -> Result<(), ManagerError> {
        match command {
            ControlCommand::CreateWorker { tenant_id } => {
                if !self.manager.add_tenant(tenant_id.clone()).await? {
                    tracing::debug!("Worker for {} already running", tenant_id);
                }
            }
            ControlCommand::TerminateJob { tenant_id, job_id } => {
                self.terminate(&tenant_id, &job_id);
            }
            ControlCommand::RemoveWorker { tenant_id, force } => {
                if !self.manager.remove_tenant(tenant_id.clone(), force).await? {
                    tracing::info!("No worker for {} to remove", tenant_id);
                }
            }
        }
        Ok(())
    }

    fn terminate(&self, tenant_id: &TenantId, job_id: &str) -> CancelOutcome {
        let outcome = match JobId::parse(job_id) {
            Ok(job_id) => self.registry.cancel(tenant_id, job_id),
            Err(_) => CancelOutcome::NotFound,
        };
        match outcome {
            CancelOutcome::Cancelled => {
                tracing::info!("Terminating job {} for {}", job_id, tenant_id);
            }
            CancelOutcome::AlreadyStopping => {
                tracing::info!("Job {} for {} is already stopping", job_id, tenant_id);
            }
            CancelOutcome::NotFound => {
                tracing::info!(
                    "Job {} for {} not found, may have already completed or supervisor restarted",
                    job_id,
                    tenant_id
                );
            }
        }
        outcome
    }
}
