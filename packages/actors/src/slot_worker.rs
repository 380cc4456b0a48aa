//! Slot worker: one unit of a tenant's concurrency.
//!
//! Each slot loops claim → execute → ack → claim. The broker's blocking claim
//! is the only place a slot waits for work, so a tenant never runs more jobs
//! than it has slots.

use std::sync::Arc;
use std::time::Duration;

use broker::{AckDisposition, AckOutcome, Delivery};
use chrono::Utc;
use dispatch_core::{
    ExecutionStore, JobEvent, JobExecution, JobId, LogLine, TenantId, argv_for,
};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::context::WorkerContext;
use crate::messages::{SlotMessage, TenantMessage};
use crate::process::{ProcessSpec, ProcessSupervisor};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Slot worker arguments.
pub struct SlotWorkerArgs {
    pub slot: usize,
    pub tenant_id: TenantId,
    pub tenant: ActorRef<TenantMessage>,
    pub context: Arc<WorkerContext>,
    pub stop: CancellationToken,
}

/// State for the slot worker.
pub struct SlotWorkerState {
    slot: usize,
    tenant_id: TenantId,
    tenant: ActorRef<TenantMessage>,
    context: Arc<WorkerContext>,
    stop: CancellationToken,
    backoff: Duration,
}

/// Slot worker actor.
pub struct SlotWorker;

impl Actor for SlotWorker {
    type Msg = SlotMessage;
    type State = SlotWorkerState;
    type Arguments = SlotWorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!("Starting slot {} for {}", args.slot, args.tenant_id);
        myself.send_message(SlotMessage::Claim)?;
        Ok(SlotWorkerState {
            slot: args.slot,
            tenant_id: args.tenant_id,
            tenant: args.tenant,
            context: args.context,
            stop: args.stop,
            backoff: INITIAL_BACKOFF,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SlotMessage::Claim => {
                let claimed = tokio::select! {
                    biased;
                    _ = state.stop.cancelled() => None,
                    result = state.context.broker.claim(&state.tenant_id) => Some(result),
                };

                match claimed {
                    None => {
                        tracing::debug!("Slot {} for {} stopped", state.slot, state.tenant_id);
                        myself.stop(None);
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            "Claim failed for {}: {} (retrying in {:?})",
                            state.tenant_id,
                            e,
                            state.backoff
                        );
                        tokio::select! {
                            biased;
                            _ = state.stop.cancelled() => {
                                myself.stop(None);
                                return Ok(());
                            }
                            _ = tokio::time::sleep(state.backoff) => {}
                        }
                        state.backoff = (state.backoff * 2).min(MAX_BACKOFF);
                    }
                    Some(Ok(delivery)) => {
                        state.backoff = INITIAL_BACKOFF;
                        let outcome = execute(&state.context, &delivery, &state.tenant).await;
                        match state.context.broker.ack(&delivery, outcome).await {
                            Ok(AckDisposition::Requeued { next_attempt }) => tracing::info!(
                                "Job {} for {} will be retried (attempt {})",
                                delivery.request.job_id,
                                state.tenant_id,
                                next_attempt
                            ),
                            Ok(_) => {}
                            Err(e) => tracing::warn!(
                                "Failed to ack job {} for {}: {}",
                                delivery.request.job_id,
                                state.tenant_id,
                                e
                            ),
                        }
                    }
                }

                myself.send_message(SlotMessage::Claim)?;
            }
        }

        Ok(())
    }
}

/// Run one claimed request to a terminal status and decide its ack.
pub(crate) async fn execute(
    context: &WorkerContext,
    delivery: &Delivery,
    tenant: &ActorRef<TenantMessage>,
) -> AckOutcome {
    let request = &delivery.request;
    let tenant_id = &request.tenant_id;
    let job_id = request.job_id;

    if context.registry.contains(tenant_id, job_id) {
        tracing::warn!(
            "Job {} for {} is already running, skipping duplicate delivery {}",
            job_id,
            tenant_id,
            delivery.tag
        );
        return AckOutcome::Completed;
    }

    let mut execution = JobExecution::claimed(request, delivery.attempt);
    context.record(&execution).await;

    let config = &context.config;
    let (log_tx, log_rx) = mpsc::unbounded_channel();
    let spawned = ProcessSpec::from_argv(argv_for(&config.interpreter, request)).and_then(|spec| {
        let spec = spec
            .with_work_dir(request.work_dir.as_deref())
            .with_cancel_grace(config.cancel_grace)
            .with_stderr_capture_limit(config.stderr_capture_limit);
        ProcessSupervisor::spawn(spec, log_tx)
    });

    let process = match spawned {
        Ok(process) => process,
        Err(e) => {
            tracing::warn!("Failed to spawn job {} for {}: {}", job_id, tenant_id, e);
            let now = Utc::now();
            let reason = e.to_string();
            execution.mark_failed(None, reason.clone(), now);
            context.record(&execution).await;
            context.publish(JobEvent::JobFailed {
                tenant_id: tenant_id.clone(),
                job_id,
                exit_code: None,
                reason,
                timestamp: now,
            });
            let _ = tenant.send_message(TenantMessage::JobFinished {
                tag: delivery.tag,
                status: execution.status,
            });
            return AckOutcome::Failed { retryable: false };
        }
    };

    let pid = process.pid();
    let handle = process.cancel_handle();
    if let Err(e) = context.registry.register(tenant_id, job_id, handle.clone()) {
        // A concurrent delivery of the same job won the race.
        tracing::warn!("{}, stopping pid {}", e, pid);
        handle.cancel();
        let _ = process.wait().await;
        return AckOutcome::Completed;
    }

    execution.mark_running(pid);
    context.record(&execution).await;
    context.publish(JobEvent::JobStarted {
        tenant_id: tenant_id.clone(),
        job_id,
        pid,
        attempt: delivery.attempt,
        timestamp: Utc::now(),
    });
    let _ = tenant.send_message(TenantMessage::JobStarted { tag: delivery.tag });
    tracing::info!("Started job {} for {} as pid {}", job_id, tenant_id, pid);

    let forwarder = tokio::spawn(forward_logs(
        context.store.clone(),
        context.events.clone(),
        tenant_id.clone(),
        job_id,
        log_rx,
    ));
    let result = process.wait().await;
    // Every line is stored before the terminal status.
    let _ = forwarder.await;

    let now = Utc::now();
    let (ack, event) = match result {
        Ok(completion) => {
            execution.mark_succeeded(completion.completed_at);
            tracing::info!("Job {} for {} succeeded", job_id, tenant_id);
            (
                AckOutcome::Completed,
                JobEvent::JobSucceeded {
                    tenant_id: tenant_id.clone(),
                    job_id,
                    duration_ms: execution.duration_ms().unwrap_or(0),
                    timestamp: completion.completed_at,
                },
            )
        }
        Err(failure) if failure.cancelled => {
            execution.mark_terminated(failure.exit_code, now);
            tracing::info!("Job {} for {} terminated", job_id, tenant_id);
            (
                AckOutcome::Failed { retryable: false },
                JobEvent::JobTerminated {
                    tenant_id: tenant_id.clone(),
                    job_id,
                    exit_code: failure.exit_code,
                    timestamp: now,
                },
            )
        }
        Err(failure) => {
            let reason = failure.reason(config.failure_reason_limit);
            tracing::info!("Job {} for {} failed: {}", job_id, tenant_id, failure);
            execution.mark_failed(failure.exit_code, reason.clone(), now);
            (
                AckOutcome::Failed { retryable: true },
                JobEvent::JobFailed {
                    tenant_id: tenant_id.clone(),
                    job_id,
                    exit_code: failure.exit_code,
                    reason,
                    timestamp: now,
                },
            )
        }
    };

    context.record(&execution).await;
    context.registry.unregister(tenant_id, job_id, &handle);
    context.publish(event);
    let _ = tenant.send_message(TenantMessage::JobFinished {
        tag: delivery.tag,
        status: execution.status,
    });
    ack
}

async fn forward_logs(
    store: Arc<dyn ExecutionStore>,
    events: broadcast::Sender<JobEvent>,
    tenant_id: TenantId,
    job_id: JobId,
    mut lines: mpsc::UnboundedReceiver<LogLine>,
) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = store
            .append_log(tenant_id.clone(), job_id, line.clone())
            .await
        {
            tracing::warn!("Failed to store log line {} of job {}: {}", line.seq, job_id, e);
        }
        let _ = events.send(JobEvent::JobLog {
            tenant_id: tenant_id.clone(),
            job_id,
            line,
        });
    }
}
