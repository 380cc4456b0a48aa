//! Worker manager: the per-node set of tenant workers.
//!
//! Add and remove requests are actor messages, so concurrent requests for the
//! same tenant apply in arrival order. Removing a tenant forgets it at once;
//! its old worker drains in the background while a new add may already start
//! a fresh one.

use std::collections::HashMap;
use std::sync::Arc;

use dispatch_core::{TenantId, TenantStats};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};

use crate::context::WorkerContext;
use crate::messages::{ManagerError, ManagerMessage, TenantMessage};
use crate::roster::TenantRoster;
use crate::tenant_worker::{TenantWorker, TenantWorkerArgs};

/// Worker manager arguments.
pub struct ManagerArgs {
    pub context: Arc<WorkerContext>,
    /// Persisted tenant set, restored at startup.
    pub roster: Option<TenantRoster>,
}

/// State for the worker manager.
pub struct ManagerState {
    tenants: HashMap<TenantId, ActorRef<TenantMessage>>,
    context: Arc<WorkerContext>,
    roster: Option<TenantRoster>,
    shutting_down: bool,
}

impl ManagerState {
    async fn spawn_tenant(
        &mut self,
        myself: &ActorRef<ManagerMessage>,
        tenant_id: TenantId,
    ) -> Result<(), ActorProcessingErr> {
        let args = TenantWorkerArgs {
            tenant_id: tenant_id.clone(),
            context: self.context.clone(),
            concurrency_limit: self.context.config.concurrency_limit,
        };
        let (worker, _handle) = Actor::spawn_linked(None, TenantWorker, args, myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn tenant worker: {}", e)))?;
        self.tenants.insert(tenant_id, worker);
        Ok(())
    }

    async fn save_roster(&self) {
        let Some(roster) = &self.roster else {
            return;
        };
        let tenants: Vec<TenantId> = self.tenants.keys().cloned().collect();
        if let Err(e) = roster.save(&tenants).await {
            tracing::warn!("Failed to persist tenant roster: {}", e);
        }
    }

    /// Forget a tenant and ask its worker to drain.
    fn detach(
        &mut self,
        tenant_id: &TenantId,
        force: bool,
        reply: Option<RpcReplyPort<TenantStats>>,
    ) -> bool {
        let Some(worker) = self.tenants.remove(tenant_id) else {
            return false;
        };
        tracing::info!("Removing tenant {} (force: {})", tenant_id, force);
        if worker
            .send_message(TenantMessage::Drain { force, reply })
            .is_err()
        {
            tracing::warn!("Tenant worker {} already stopped", tenant_id);
        }
        true
    }
}

/// Worker manager actor.
pub struct WorkerManager;

impl Actor for WorkerManager {
    type Msg = ManagerMessage;
    type State = ManagerState;
    type Arguments = ManagerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker manager");

        let mut state = ManagerState {
            tenants: HashMap::new(),
            context: args.context,
            roster: args.roster,
            shutting_down: false,
        };

        let mut initial = state.context.config.tenants.clone();
        if let Some(roster) = &state.roster {
            roster.init().await?;
            match roster.load().await {
                Ok(tenants) => initial.extend(tenants),
                Err(e) => tracing::warn!("Ignoring unreadable tenant roster {:?}: {}", roster.path(), e),
            }
        }
        for tenant_id in initial {
            if !state.tenants.contains_key(&tenant_id) {
                state.spawn_tenant(&myself, tenant_id).await?;
            }
        }
        if !state.tenants.is_empty() {
            tracing::info!("Restored {} tenant workers", state.tenants.len());
            state.save_roster().await;
        }

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ManagerMessage::AddTenant { tenant_id, reply } => {
                let created = if state.shutting_down || state.tenants.contains_key(&tenant_id) {
                    false
                } else {
                    tracing::info!("Adding tenant {}", tenant_id);
                    state.spawn_tenant(&myself, tenant_id).await?;
                    state.save_roster().await;
                    true
                };
                if let Some(reply) = reply {
                    let _ = reply.send(created);
                }
            }

            ManagerMessage::RemoveTenant {
                tenant_id,
                force,
                reply,
            } => {
                let removed = state.detach(&tenant_id, force, None);
                if removed {
                    state.save_roster().await;
                }
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }

            ManagerMessage::DrainTenant {
                tenant_id,
                force,
                reply,
            } => {
                let (tx, rx) = ractor::concurrency::oneshot();
                if state.detach(&tenant_id, force, Some(tx.into())) {
                    state.save_roster().await;
                    tokio::spawn(async move {
                        let _ = reply.send(rx.await.ok());
                    });
                } else {
                    let _ = reply.send(None);
                }
            }

            ManagerMessage::ListTenants { reply } => {
                let mut tenants: Vec<TenantId> = state.tenants.keys().cloned().collect();
                tenants.sort();
                let _ = reply.send(tenants);
            }

            ManagerMessage::TenantStats { tenant_id, reply } => {
                if let Some(worker) = state.tenants.get(&tenant_id) {
                    let (tx, rx) = ractor::concurrency::oneshot();
                    if worker
                        .send_message(TenantMessage::GetStats { reply: tx.into() })
                        .is_ok()
                        && let Ok(stats) = rx.await
                    {
                        let _ = reply.send(Some(stats));
                        return Ok(());
                    }
                }
                let _ = reply.send(None);
            }

            ManagerMessage::Shutdown { force, reply } => {
                tracing::info!("Shutting down worker manager ({} tenants)", state.tenants.len());
                state.shutting_down = true;

                let mut drains = Vec::new();
                for (tenant_id, worker) in state.tenants.drain() {
                    let (tx, rx) = ractor::concurrency::oneshot();
                    if worker
                        .send_message(TenantMessage::Drain {
                            force,
                            reply: Some(tx.into()),
                        })
                        .is_ok()
                    {
                        drains.push((tenant_id, rx));
                    }
                }

                // The roster keeps the tenants so a restart brings them back.
                let manager = myself.clone();
                tokio::spawn(async move {
                    for (tenant_id, rx) in drains {
                        if rx.await.is_err() {
                            tracing::warn!("Tenant worker {} stopped without reporting", tenant_id);
                        }
                    }
                    manager.stop(None);
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                });
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                // Drained workers were already forgotten.
                let lost = state
                    .tenants
                    .iter()
                    .find(|(_, w)| w.get_id() == cell.get_id())
                    .map(|(t, _)| t.clone());
                match lost {
                    Some(tenant_id) => {
                        tracing::warn!("Tenant worker {} terminated: {:?}", tenant_id, reason);
                        state.tenants.remove(&tenant_id);
                        state.save_roster().await;
                    }
                    None => tracing::debug!("Tenant worker {} finished draining", cell.get_id()),
                }
            }
            SupervisionEvent::ActorFailed(cell, err) => {
                let failed = state
                    .tenants
                    .iter()
                    .find(|(_, w)| w.get_id() == cell.get_id())
                    .map(|(t, _)| t.clone());
                if let Some(tenant_id) = failed {
                    tracing::warn!("Tenant worker {} failed: {}, restarting", tenant_id, err);
                    state.tenants.remove(&tenant_id);
                    if !state.shutting_down {
                        state.spawn_tenant(&myself, tenant_id).await?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Start the worker manager.
pub async fn start_manager(
    args: ManagerArgs,
) -> Result<(ManagerHandle, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    let (actor, handle) = Actor::spawn(None, WorkerManager, args).await?;
    Ok((ManagerHandle::new(actor), handle))
}

/// Request/reply wrapper around the manager actor.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    actor: ActorRef<ManagerMessage>,
}

impl ManagerHandle {
    pub fn new(actor: ActorRef<ManagerMessage>) -> Self {
        Self { actor }
    }

    pub fn actor(&self) -> &ActorRef<ManagerMessage> {
        &self.actor
    }

    async fn call<T>(
        &self,
        message: impl FnOnce(RpcReplyPort<T>) -> ManagerMessage,
    ) -> Result<T, ManagerError>
    where
        T: Send + 'static,
    {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(message(tx.into()))
            .map_err(|_| ManagerError::NotRunning)?;
        rx.await.map_err(|_| ManagerError::NoReply)
    }

    /// Start a worker for `tenant_id`; `false` when one already runs.
    pub async fn add_tenant(&self, tenant_id: TenantId) -> Result<bool, ManagerError> {
        self.call(|reply| ManagerMessage::AddTenant {
            tenant_id,
            reply: Some(reply),
        })
        .await
    }

    /// Forget a tenant and drain its worker in the background; `false` when
    /// the tenant was unknown.
    pub async fn remove_tenant(&self, tenant_id: TenantId, force: bool) -> Result<bool, ManagerError> {
        self.call(|reply| ManagerMessage::RemoveTenant {
            tenant_id,
            force,
            reply: Some(reply),
        })
        .await
    }

    /// Remove a tenant and wait until its worker has stopped.
    pub async fn drain_tenant(
        &self,
        tenant_id: TenantId,
        force: bool,
    ) -> Result<Option<TenantStats>, ManagerError> {
        self.call(|reply| ManagerMessage::DrainTenant {
            tenant_id,
            force,
            reply,
        })
        .await
    }

    pub async fn list_tenants(&self) -> Result<Vec<TenantId>, ManagerError> {
        self.call(|reply| ManagerMessage::ListTenants { reply }).await
    }

    pub async fn tenant_stats(&self, tenant_id: TenantId) -> Result<Option<TenantStats>, ManagerError> {
        self.call(|reply| ManagerMessage::TenantStats { tenant_id, reply })
            .await
    }

    /// Drain every tenant worker and stop the manager.
    pub async fn shutdown(&self, force: bool) -> Result<(), ManagerError> {
        self.call(|reply| ManagerMessage::Shutdown {
            force,
            reply: Some(reply),
        })
        .await
    }
}
