//! The dispatcher facade and its lifecycle.

use std::sync::{Arc, Mutex, PoisonError};

use actors::{
    ControlChannel, JobRegistry, ManagerArgs, ManagerError, ManagerHandle, TenantRoster,
    WorkerContext, start_manager,
};
use broker::{Broker, BrokerError, ControlBus};
use dispatch_core::{
    ControlCommand, ControlError, DispatchConfig, ExecutionStore, StoreError, TenantId, TenantStats,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Db(#[from] db::DbError),

    #[error("control message error: {0}")]
    Control(#[from] ControlError),

    #[error("worker manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("failed to start worker manager: {0}")]
    Spawn(String),

    #[error("invalid job id: {0}")]
    InvalidJobId(String),
}

/// The external collaborators a dispatcher runs against.
#[derive(Clone)]
pub struct Backends {
    pub broker: Arc<dyn Broker>,
    pub bus: Arc<dyn ControlBus>,
    pub store: Arc<dyn ExecutionStore>,
}

/// Entry point for submitting jobs, administering tenants and following
/// job output on one node.
pub struct Dispatcher {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) bus: Arc<dyn ControlBus>,
    pub(crate) store: Arc<dyn ExecutionStore>,
    pub(crate) context: Arc<WorkerContext>,
    pub(crate) manager: ManagerHandle,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the worker manager and the control channel.
    ///
    /// Tenants listed in the config and in the roster under `state_dir`
    /// get a worker right away.
    pub async fn start(config: DispatchConfig, backends: Backends) -> Result<Self, DispatchError> {
        let Backends { broker, bus, store } = backends;
        let registry = Arc::new(JobRegistry::new());
        let roster = config.state_dir.as_ref().map(TenantRoster::new);
        let context = Arc::new(WorkerContext::new(
            broker.clone(),
            store.clone(),
            registry.clone(),
            config,
        ));

        let (manager, manager_task) = start_manager(ManagerArgs {
            context: context.clone(),
            roster,
        })
        .await
        .map_err(|e| DispatchError::Spawn(e.to_string()))?;

        let stop = CancellationToken::new();
        let control = ControlChannel::new(bus.clone(), manager.clone(), registry, stop.clone());
        let control_task = match control.spawn() {
            Ok(task) => task,
            Err(e) => {
                let _ = manager.shutdown(true).await;
                return Err(e.into());
            }
        };

        Ok(Self {
            broker,
            bus,
            store,
            context,
            manager,
            stop,
            tasks: Mutex::new(vec![control_task, manager_task]),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.context.config
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.context.registry
    }

    pub(crate) async fn publish(&self, command: &ControlCommand) -> Result<(), DispatchError> {
        let payload = command.encode()?;
        self.bus.publish(command.topic(), payload).await?;
        Ok(())
    }

    /// Ask the node to start a worker for `tenant_id`. Asynchronous: the
    /// worker exists once the control channel has applied the request.
    pub async fn add_tenant(&self, tenant_id: TenantId) -> Result<(), DispatchError> {
        tracing::info!("Requesting worker for {}", tenant_id);
        self.publish(&ControlCommand::CreateWorker { tenant_id }).await
    }

    /// Ask the node to stop claiming for `tenant_id`. In-flight jobs finish
    /// unless `force` terminates them.
    pub async fn remove_tenant(&self, tenant_id: TenantId, force: bool) -> Result<(), DispatchError> {
        tracing::info!("Requesting removal of {} (force: {})", tenant_id, force);
        self.publish(&ControlCommand::RemoveWorker { tenant_id, force })
            .await
    }

    /// Tenants with a running worker.
    pub async fn tenants(&self) -> Result<Vec<TenantId>, DispatchError> {
        Ok(self.manager.list_tenants().await?)
    }

    pub async fn tenant_stats(&self, tenant_id: TenantId) -> Result<Option<TenantStats>, DispatchError> {
        Ok(self.manager.tenant_stats(tenant_id).await?)
    }

    /// Stop the control channel, drain every tenant and wait for the
    /// workers to stop. Safe to call more than once.
    pub async fn shutdown(&self, force: bool) -> Result<(), DispatchError> {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        if tasks.is_empty() {
            return Ok(());
        }

        tracing::info!("Shutting down dispatcher (force: {})", force);
        self.stop.cancel();
        let result = self.manager.shutdown(force).await;
        for task in tasks {
            let _ = task.await;
        }
        self.context.registry.clear();
        match result {
            // A manager that already stopped has nothing left to drain.
            Ok(()) | Err(ManagerError::NotRunning) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
