//! Tenant worker: owns one tenant's slot workers and aggregates their stats.

use std::collections::HashSet;
use std::sync::Arc;

use broker::DeliveryTag;
use chrono::Utc;
use dispatch_core::{ExecutionStatus, JobEvent, TenantId, TenantStats};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use tokio_util::sync::CancellationToken;

use crate::context::WorkerContext;
use crate::messages::TenantMessage;
use crate::slot_worker::{SlotWorker, SlotWorkerArgs};

/// Tenant worker arguments.
pub struct TenantWorkerArgs {
    pub tenant_id: TenantId,
    pub context: Arc<WorkerContext>,
    pub concurrency_limit: usize,
}

/// State for the tenant worker.
pub struct TenantWorkerState {
    tenant_id: TenantId,
    context: Arc<WorkerContext>,
    stats: TenantStats,
    /// Deliveries whose process is running.
    active: HashSet<DeliveryTag>,
    /// Cancelled to stop every slot from claiming.
    stop: CancellationToken,
    /// Slot workers still alive.
    live_slots: usize,
    next_slot: usize,
    /// Drain callers waiting for the last slot to stop.
    waiters: Vec<RpcReplyPort<TenantStats>>,
}

impl TenantWorkerState {
    fn snapshot(&self) -> TenantStats {
        let mut stats = self.stats.clone();
        stats.active = self.active.len();
        stats
    }

    async fn spawn_slot(&mut self, myself: &ActorRef<TenantMessage>) -> Result<(), ActorProcessingErr> {
        let args = SlotWorkerArgs {
            slot: self.next_slot,
            tenant_id: self.tenant_id.clone(),
            tenant: myself.clone(),
            context: self.context.clone(),
            stop: self.stop.clone(),
        };
        Actor::spawn_linked(None, SlotWorker, args, myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn slot worker: {}", e)))?;
        self.next_slot += 1;
        self.live_slots += 1;
        Ok(())
    }

    fn drain(&mut self, force: bool) {
        if !self.stats.draining {
            self.stats.draining = true;
            self.stop.cancel();
            tracing::info!(
                "Draining tenant worker {} ({} in flight, force: {})",
                self.tenant_id,
                self.active.len(),
                force
            );
            self.context.publish(JobEvent::WorkerDraining {
                tenant_id: self.tenant_id.clone(),
                in_flight: self.active.len(),
                force,
                timestamp: Utc::now(),
            });
        }
        if force {
            let cancelled = self.context.registry.cancel_tenant(&self.tenant_id);
            if cancelled > 0 {
                tracing::info!("Cancelled {} in-flight jobs for {}", cancelled, self.tenant_id);
            }
        }
    }

    /// Stop once draining, no slot is left and every started job reported
    /// its end.
    fn finish_if_drained(&mut self, myself: &ActorRef<TenantMessage>) {
        if !self.stats.draining || self.live_slots > 0 || !self.active.is_empty() {
            return;
        }
        let stats = self.snapshot();
        tracing::info!(
            "Tenant worker {} stopped ({} succeeded, {} failed, {} terminated)",
            self.tenant_id,
            stats.succeeded,
            stats.failed,
            stats.terminated
        );
        self.context.publish(JobEvent::WorkerStopped {
            tenant_id: self.tenant_id.clone(),
            stats: stats.clone(),
            timestamp: Utc::now(),
        });
        for reply in self.waiters.drain(..) {
            let _ = reply.send(stats.clone());
        }
        myself.stop(None);
    }
}

/// Tenant worker actor.
pub struct TenantWorker;

impl Actor for TenantWorker {
    type Msg = TenantMessage;
    type State = TenantWorkerState;
    type Arguments = TenantWorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let limit = args.concurrency_limit.max(1);
        tracing::info!("Starting tenant worker {} with {} slots", args.tenant_id, limit);

        let mut state = TenantWorkerState {
            tenant_id: args.tenant_id,
            context: args.context,
            stats: TenantStats::new(limit),
            active: HashSet::new(),
            stop: CancellationToken::new(),
            live_slots: 0,
            next_slot: 0,
            waiters: Vec::new(),
        };
        for _ in 0..limit {
            state.spawn_slot(&myself).await?;
        }

        state.context.publish(JobEvent::WorkerStarted {
            tenant_id: state.tenant_id.clone(),
            concurrency_limit: limit,
            timestamp: Utc::now(),
        });
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            TenantMessage::GetStats { reply } => {
                let _ = reply.send(state.snapshot());
            }

            TenantMessage::JobStarted { tag } => {
                state.active.insert(tag);
                state.stats.claimed += 1;
                state.stats.peak_active = state.stats.peak_active.max(state.active.len());
            }

            TenantMessage::JobFinished { tag, status } => {
                // Spawn failures finish without having started.
                if !state.active.remove(&tag) {
                    state.stats.claimed += 1;
                }
                match status {
                    ExecutionStatus::Succeeded => state.stats.succeeded += 1,
                    ExecutionStatus::Failed => state.stats.failed += 1,
                    ExecutionStatus::Terminated => state.stats.terminated += 1,
                    ExecutionStatus::Pending | ExecutionStatus::Running => {}
                }
                state.finish_if_drained(&myself);
            }

            TenantMessage::Drain { force, reply } => {
                state.drain(force);
                if let Some(reply) = reply {
                    state.waiters.push(reply);
                }
                state.finish_if_drained(&myself);
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
            SupervisionEvent::ActorTerminated(_, _, _) => {
                state.live_slots = state.live_slots.saturating_sub(1);
                if !state.stats.draining {
                    tracing::warn!("Slot worker for {} stopped unexpectedly, replacing it", state.tenant_id);
                    state.spawn_slot(&myself).await?;
                }
                state.finish_if_drained(&myself);
            }
            SupervisionEvent::ActorFailed(cell, err) => {
                state.live_slots = state.live_slots.saturating_sub(1);
                tracing::warn!("Slot worker {} for {} failed: {}", cell.get_id(), state.tenant_id, err);
                if !state.stats.draining {
                    state.spawn_slot(&myself).await?;
                } else if state.live_slots == 0 {
                    // A failed slot never reports its job's end.
                    state.active.clear();
                }
                state.finish_if_drained(&myself);
            }
            _ => {}
        }
        Ok(())
    }
}
