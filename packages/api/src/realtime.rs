//! Live job output and event streams.

use dispatch_core::{JobEvent, JobId, LogLine, TenantId};
use futures_util::Stream;
use futures_util::stream;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::dispatcher::{DispatchError, Dispatcher};

/// Push subscription to one job's log lines.
///
/// Yields lines as the worker captures them and ends when the job reaches a
/// terminal status. Lines produced before the subscription was opened are
/// only available through [`Dispatcher::replay_logs`].
pub struct LogSubscription {
    tenant_id: TenantId,
    job_id: JobId,
    events: broadcast::Receiver<JobEvent>,
    finished: bool,
}

impl LogSubscription {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Next line of the job, or `None` once it has finished.
    pub async fn next_line(&mut self) -> Option<LogLine> {
        while !self.finished {
            match self.events.recv().await {
                Ok(JobEvent::JobLog {
                    tenant_id,
                    job_id,
                    line,
                }) if job_id == self.job_id && tenant_id == self.tenant_id => return Some(line),
                Ok(event) => {
                    if event.is_terminal()
                        && event.job_id() == Some(self.job_id)
                        && event.tenant_id() == &self.tenant_id
                    {
                        self.finished = true;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Log subscription for job {} lagged, {} events skipped",
                        self.job_id,
                        skipped
                    );
                }
                Err(RecvError::Closed) => self.finished = true,
            }
        }
        None
    }

    pub fn into_stream(self) -> impl Stream<Item = LogLine> + Send {
        stream::unfold(self, |mut subscription| async move {
            let line = subscription.next_line().await?;
            Some((line, subscription))
        })
    }
}

impl std::fmt::Debug for LogSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSubscription")
            .field("tenant_id", &self.tenant_id)
            .field("job_id", &self.job_id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Dispatcher {
    /// Follow a job's output live. A job that already finished yields an
    /// empty subscription.
    pub async fn subscribe_logs(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<LogSubscription, DispatchError> {
        // Subscribe before looking at the status so no terminal event is missed.
        let events = self.context.subscribe();
        let finished = self
            .store
            .latest_execution(tenant_id.clone(), job_id)
            .await?
            .is_some_and(|execution| execution.status.is_terminal());
        Ok(LogSubscription {
            tenant_id,
            job_id,
            events,
            finished,
        })
    }

    /// Every event the node's workers publish.
    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.context.subscribe()
    }
}
