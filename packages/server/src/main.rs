//! Standalone dispatch node.
//!
//! Configured through `DISPATCH_*` environment variables; log verbosity via
//! `RUST_LOG`. The first SIGINT/SIGTERM drains every tenant, a second one
//! terminates the jobs still running.

use std::error::Error;

use api::{JobEvent, init_dispatcher};
use dispatch_core::DispatchConfig;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod shutdown;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DispatchConfig::from_env()?;
    tracing::info!(
        "Starting dispatch node (interpreter {:?}, concurrency {}, store {})",
        config.interpreter,
        config.concurrency_limit,
        config.db_endpoint
    );

    let dispatcher = init_dispatcher(config).await?;
    let stop = CancellationToken::new();
    let events = tokio::spawn(log_events(dispatcher.subscribe_events(), stop.clone()));

    shutdown::install_shutdown_handler()?.cancelled().await;

    let force = shutdown::install_shutdown_handler()?;
    let drain = dispatcher.shutdown(false);
    tokio::pin!(drain);
    tokio::select! {
        result = &mut drain => result?,
        _ = force.cancelled() => {
            tracing::warn!("Second signal received, terminating running jobs");
            let terminated = dispatcher.registry().cancel_all();
            tracing::info!("Terminated {} running jobs", terminated);
            drain.await?;
        }
    }

    stop.cancel();
    let _ = events.await;
    tracing::info!("Dispatch node stopped");
    Ok(())
}

/// Mirror job lifecycle events into the log.
async fn log_events(mut events: tokio::sync::broadcast::Receiver<JobEvent>, stop: CancellationToken) {
    loop {
        let received = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            received = events.recv() => received,
        };
        match received {
            Ok(JobEvent::JobLog { .. }) => {}
            Ok(event) => tracing::debug!("{}", event.description()),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Event log lagged, {} events skipped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
