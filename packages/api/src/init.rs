//! Standalone node bootstrap.

use std::sync::Arc;

use broker::{MemoryBroker, MemoryBus};
use db::{DbConfig, SurrealStore};
use dispatch_core::DispatchConfig;

use crate::dispatcher::{Backends, DispatchError, Dispatcher};

/// Start a node on the in-process broker and bus with the SurrealDB store
/// at `config.db_endpoint`.
///
/// Call once per process: the database connection is global.
pub async fn init_dispatcher(config: DispatchConfig) -> Result<Dispatcher, DispatchError> {
    tracing::info!("Initializing dispatch node...");

    db::init(DbConfig::endpoint(config.db_endpoint.clone())).await?;

    let backends = Backends {
        broker: Arc::new(MemoryBroker::new(config.max_attempts)),
        bus: Arc::new(MemoryBus::new()),
        store: Arc::new(SurrealStore),
    };
    let dispatcher = Dispatcher::start(config, backends).await?;

    tracing::info!(
        "Dispatch node initialized (concurrency limit {})",
        dispatcher.config().concurrency_limit
    );
    Ok(dispatcher)
}
