#![allow(clippy::disallowed_methods)]

mod common;

use chrono::Utc;
use dispatch_core::{
    ExecutionStatus, ExecutionStore, JobExecution, JobRequest, LineStamper, LogStream, TenantId,
};
use std::error::Error;

use db::SurrealStore;
use db::repositories::{ExecutionRepository, LogRepository};

fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

#[tokio::test]
async fn test_execution_repository() -> Result<(), Box<dyn Error>> {
    let _guard = common::fresh_store().await?;

    let request = JobRequest::new(tenant("acct1"), "report.py");
    let mut execution = JobExecution::claimed(&request, 1);
    assert!(execution.mark_running(4242));

    let stored = ExecutionRepository::upsert(&execution).await?;
    assert_eq!(stored.job_id, request.job_id);
    assert_eq!(stored.status, ExecutionStatus::Running);
    assert_eq!(stored.pid, Some(4242));

    // Upsert replaces rather than duplicating.
    assert!(execution.mark_failed(Some(2), "boom".to_string(), Utc::now()));
    ExecutionRepository::upsert(&execution).await?;

    let loaded = ExecutionRepository::get(&request.tenant_id, request.job_id)
        .await?
        .expect("execution should exist");
    assert_eq!(loaded.status, ExecutionStatus::Failed);
    assert_eq!(loaded.exit_code, Some(2));
    assert_eq!(loaded.failure_reason.as_deref(), Some("boom"));

    let all = ExecutionRepository::list_for_tenant(&request.tenant_id).await?;
    assert_eq!(all.len(), 1);

    let other = JobRequest::new(tenant("acct1"), "other.py");
    let mut second = JobExecution::claimed(&other, 1);
    second.mark_running(7);
    second.mark_succeeded(Utc::now());
    ExecutionRepository::upsert(&second).await?;

    let failed = ExecutionRepository::list_by_status(&request.tenant_id, ExecutionStatus::Failed).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job_id, request.job_id);

    let counts = ExecutionRepository::count_by_status(&request.tenant_id).await?;
    assert_eq!(counts.get("failed"), Some(&1));
    assert_eq!(counts.get("succeeded"), Some(&1));

    // Tenants do not see each other's executions.
    assert!(ExecutionRepository::list_for_tenant(&tenant("acct2")).await?.is_empty());
    assert!(ExecutionRepository::get(&tenant("acct2"), request.job_id).await?.is_none());

    ExecutionRepository::delete(&request.tenant_id, request.job_id).await?;
    assert!(ExecutionRepository::get(&request.tenant_id, request.job_id).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_log_repository_orders_by_sequence() -> Result<(), Box<dyn Error>> {
    let _guard = common::fresh_store().await?;

    let request = JobRequest::new(tenant("acct1"), "chatty.py");
    let stamper = LineStamper::new();
    let first = stamper.stamp(LogStream::Stdout, "starting");
    let second = stamper.stamp(LogStream::Stderr, "warning: slow");
    let third = stamper.stamp(LogStream::Stdout, "done");

    // Written out of order, read back by seq.
    for line in [&third, &first, &second] {
        LogRepository::append(&request.tenant_id, request.job_id, line).await?;
    }

    let lines = LogRepository::list(&request.tenant_id, request.job_id).await?;
    let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["starting", "warning: slow", "done"]);
    assert_eq!(lines[1], second);
    assert_eq!(LogRepository::count(&request.tenant_id, request.job_id).await?, 3);

    LogRepository::delete_for_job(&request.tenant_id, request.job_id).await?;
    assert!(LogRepository::list(&request.tenant_id, request.job_id).await?.is_empty());
    assert_eq!(LogRepository::count(&request.tenant_id, request.job_id).await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_surreal_store_round_trip() -> Result<(), Box<dyn Error>> {
    let _guard = common::fresh_store().await?;
    let store = SurrealStore::new();

    let request = JobRequest::new(tenant("acct9"), "job.py");
    let mut execution = JobExecution::claimed(&request, 1);
    execution.mark_running(11);
    store.record_execution(execution.clone()).await?;

    let stamper = LineStamper::new();
    store
        .append_log(request.tenant_id.clone(), request.job_id, stamper.stamp(LogStream::Stdout, "hello"))
        .await?;

    let latest = store
        .latest_execution(request.tenant_id.clone(), request.job_id)
        .await?
        .expect("recorded");
    assert_eq!(latest.job_id, execution.job_id);
    assert_eq!(latest.status, ExecutionStatus::Running);
    assert_eq!(latest.pid, Some(11));

    let logs = store.logs(request.tenant_id.clone(), request.job_id).await?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].text, "hello");

    assert!(store.latest_execution(tenant("acct9"), dispatch_core::JobId::new()).await?.is_none());
    Ok(())
}
