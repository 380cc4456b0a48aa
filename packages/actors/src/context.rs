//! Collaborators shared by every worker of a node.

use std::sync::Arc;

use broker::Broker;
use dispatch_core::{DispatchConfig, ExecutionStore, JobEvent, JobExecution};
use tokio::sync::broadcast;

use crate::registry::JobRegistry;

/// Broker, store, registry and event stream handed to tenant and slot
/// workers.
pub struct WorkerContext {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn ExecutionStore>,
    pub registry: Arc<JobRegistry>,
    pub events: broadcast::Sender<JobEvent>,
    pub config: DispatchConfig,
}

impl WorkerContext {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn ExecutionStore>,
        registry: Arc<JobRegistry>,
        config: DispatchConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            broker,
            store,
            registry,
            events,
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Persist an execution. Store failures never abandon the job.
    pub(crate) async fn record(&self, execution: &JobExecution) {
        if let Err(e) = self.store.record_execution(execution.clone()).await {
            tracing::warn!(
                "Failed to record {} status for job {}: {}",
                execution.status.as_str(),
                execution.job_id,
                e
            );
        }
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
