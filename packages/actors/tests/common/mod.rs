#![allow(dead_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use actors::{JobRegistry, ManagerArgs, ManagerHandle, TenantRoster, WorkerContext, start_manager};
use broker::{Broker, MemoryBroker, MemoryBus};
use dispatch_core::{
    DispatchConfig, ExecutionStore, JobExecution, JobRequest, MemoryStore, TenantId, TenantStats,
};
use tempfile::TempDir;

pub type TestResult<T = ()> = Result<T, Box<dyn Error>>;

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

pub struct Harness {
    pub broker: Arc<MemoryBroker>,
    pub bus: Arc<MemoryBus>,
    pub store: Arc<MemoryStore>,
    pub registry: Arc<JobRegistry>,
    pub context: Arc<WorkerContext>,
    pub manager: ManagerHandle,
    pub scripts: TempDir,
}

impl Harness {
    pub async fn start(config: DispatchConfig) -> Result<Self, Box<dyn Error>> {
        Self::start_with_roster(config, None).await
    }

    pub async fn start_with_roster(
        config: DispatchConfig,
        roster: Option<TenantRoster>,
    ) -> Result<Self, Box<dyn Error>> {
        let broker = Arc::new(MemoryBroker::new(config.max_attempts));
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(JobRegistry::new());
        let context = Arc::new(WorkerContext::new(
            broker.clone(),
            store.clone(),
            registry.clone(),
            config,
        ));
        let (manager, _handle) = start_manager(ManagerArgs {
            context: context.clone(),
            roster,
        })
        .await?;

        Ok(Self {
            broker,
            bus: Arc::new(MemoryBus::new()),
            store,
            registry,
            context,
            manager,
            scripts: tempfile::tempdir()?,
        })
    }

    /// Write a job script and return its path.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.scripts.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    pub async fn submit(&self, request: JobRequest) -> JobRequest {
        self.broker.enqueue(request.clone()).await.unwrap();
        request
    }

    pub async fn submit_script(&self, tenant_id: &TenantId, script: &Path) -> JobRequest {
        self.submit(JobRequest::new(tenant_id.clone(), script.to_string_lossy()))
            .await
    }

    /// Poll the store until the job's execution satisfies `done`.
    pub async fn wait_for(
        &self,
        request: &JobRequest,
        done: impl Fn(&JobExecution) -> bool,
    ) -> JobExecution {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            if let Some(execution) = self
                .store
                .latest_execution(request.tenant_id.clone(), request.job_id)
                .await
                .unwrap()
                && done(&execution)
            {
                return execution;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} did not reach the expected state",
                request.job_id
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_terminal(&self, request: &JobRequest) -> JobExecution {
        self.wait_for(request, |e| e.status.is_terminal()).await
    }

    pub async fn wait_registered(&self, request: &JobRequest) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        while !self.registry.contains(&request.tenant_id, request.job_id) {
            assert!(tokio::time::Instant::now() < deadline, "job never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll a tenant worker's stats until `done` holds.
    pub async fn wait_stats(&self, tenant_id: &TenantId, done: impl Fn(&TenantStats) -> bool) -> TenantStats {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            if let Some(stats) = self.manager.tenant_stats(tenant_id.clone()).await.unwrap()
                && done(&stats)
            {
                return stats;
            }
            assert!(tokio::time::Instant::now() < deadline, "stats never settled");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
