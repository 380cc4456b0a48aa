#![allow(dead_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use api::{Backends, DispatchConfig, Dispatcher, JobExecution, JobId, TenantId};
use broker::{MemoryBroker, MemoryBus};
use dispatch_core::MemoryStore;
use tempfile::TempDir;

pub type TestResult = Result<(), Box<dyn Error>>;

pub fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

/// Jobs run as shell scripts.
pub fn config(limit: usize) -> DispatchConfig {
    DispatchConfig::default()
        .with_interpreter(["sh"])
        .with_concurrency_limit(limit)
        .with_cancel_grace(Duration::from_secs(2))
}

pub struct Node {
    pub dispatcher: Dispatcher,
    pub scripts: TempDir,
}

impl Node {
    pub async fn start(config: DispatchConfig) -> Result<Self, Box<dyn Error>> {
        let backends = Backends {
            broker: Arc::new(MemoryBroker::new(config.max_attempts)),
            bus: Arc::new(MemoryBus::new()),
            store: Arc::new(MemoryStore::new()),
        };
        Ok(Self {
            dispatcher: Dispatcher::start(config, backends).await?,
            scripts: tempfile::tempdir()?,
        })
    }

    /// Write a job script and return its path.
    pub fn script(&self, name: &str, body: &str) -> String {
        let path: PathBuf = self.scripts.path().join(name);
        std::fs::write(&path, body).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// Add a tenant over the control bus and wait for its worker.
    pub async fn add_tenant(&self, tenant_id: &TenantId) {
        self.dispatcher.add_tenant(tenant_id.clone()).await.unwrap();
        self.wait_tenants(|tenants| tenants.contains(tenant_id)).await;
    }

    pub async fn wait_tenants(&self, done: impl Fn(&[TenantId]) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let tenants = self.dispatcher.tenants().await.unwrap();
            if done(&tenants) {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "tenant set never settled");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_for(
        &self,
        tenant_id: &TenantId,
        job_id: JobId,
        done: impl Fn(&JobExecution) -> bool,
    ) -> JobExecution {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            if let Some(execution) = self
                .dispatcher
                .job_status(tenant_id.clone(), job_id)
                .await
                .unwrap()
                && done(&execution)
            {
                return execution;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} did not reach the expected state",
                job_id
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_terminal(&self, tenant_id: &TenantId, job_id: JobId) -> JobExecution {
        self.wait_for(tenant_id, job_id, |e| e.status.is_terminal()).await
    }
}
