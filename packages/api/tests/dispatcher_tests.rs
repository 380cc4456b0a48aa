#![allow(clippy::disallowed_methods)]

mod common;

use std::time::Duration;

use api::{Dispatcher, ExecutionStatus, JobEvent, JobId, JobRequest, LogStream};
use futures_util::StreamExt;

use common::{Node, TestResult, config, tenant};

#[tokio::test]
async fn submitted_job_runs_and_replays_its_logs() -> TestResult {
    let node = Node::start(config(2)).await?;
    let t = tenant("acct1");
    let script = node.script("hello.sh", "echo \"args: $*\"\necho oops >&2\n");
    node.add_tenant(&t).await;

    let job_id = node
        .dispatcher
        .submit_job(t.clone(), script, Some("--x 1   --y 2".to_string()), None)
        .await?;
    let execution = node.wait_terminal(&t, job_id).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.attempt, 1);

    let lines = node.dispatcher.replay_logs(t.clone(), job_id).await?;
    assert_eq!(lines.len(), 2);
    assert!(lines.windows(2).all(|w| w[0].seq < w[1].seq));
    let stdout = lines.iter().find(|l| l.stream == LogStream::Stdout).unwrap();
    assert_eq!(stdout.text, "args: --account acct1 --x 1 --y 2");

    let counts = node.dispatcher.queue_counts(&t).await?;
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.outstanding(), 0);

    node.dispatcher.shutdown(false).await?;
    Ok(())
}

#[tokio::test]
async fn queued_job_has_no_status_until_a_worker_claims_it() -> TestResult {
    let node = Node::start(config(1)).await?;
    let t = tenant("acct1");
    let script = node.script("ok.sh", "exit 0\n");

    let job_id = node.dispatcher.submit_job(t.clone(), script, None, None).await?;
    assert!(node.dispatcher.job_status(t.clone(), job_id).await?.is_none());
    assert_eq!(node.dispatcher.queue_counts(&t).await?.waiting, 1);

    node.add_tenant(&t).await;
    let execution = node.wait_terminal(&t, job_id).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);

    node.dispatcher.shutdown(false).await?;
    Ok(())
}

#[tokio::test]
async fn log_subscription_follows_a_running_job() -> TestResult {
    let node = Node::start(config(1)).await?;
    let t = tenant("acct1");
    let script = node.script(
        "chatty.sh",
        "echo first\nsleep 0.2\necho second >&2\nsleep 0.2\necho third\n",
    );
    node.add_tenant(&t).await;

    let request = JobRequest::new(t.clone(), script);
    let subscription = node
        .dispatcher
        .subscribe_logs(t.clone(), request.job_id)
        .await?;
    node.dispatcher.submit(request.clone()).await?;

    let lines: Vec<_> = tokio::time::timeout(
        Duration::from_secs(15),
        subscription.into_stream().collect::<Vec<_>>(),
    )
    .await?;
    let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["first", "second", "third"]);
    assert_eq!(lines[1].stream, LogStream::Stderr);

    // Everything pushed live was stored too.
    let replayed = node.dispatcher.replay_logs(t.clone(), request.job_id).await?;
    assert_eq!(replayed, lines);

    node.dispatcher.shutdown(false).await?;
    Ok(())
}

#[tokio::test]
async fn subscription_to_a_finished_job_is_empty() -> TestResult {
    let node = Node::start(config(1)).await?;
    let t = tenant("acct1");
    let script = node.script("ok.sh", "echo done\n");
    node.add_tenant(&t).await;

    let job_id = node.dispatcher.submit_job(t.clone(), script, None, None).await?;
    node.wait_terminal(&t, job_id).await;

    let mut subscription = node.dispatcher.subscribe_logs(t.clone(), job_id).await?;
    assert!(subscription.next_line().await.is_none());
    assert_eq!(node.dispatcher.replay_logs(t.clone(), job_id).await?.len(), 1);

    node.dispatcher.shutdown(false).await?;
    Ok(())
}

#[tokio::test]
async fn terminate_job_stops_a_running_job() -> TestResult {
    let node = Node::start(config(1)).await?;
    let t = tenant("acct1");
    let script = node.script("sleepy.sh", "echo started\nsleep 30\n");
    node.add_tenant(&t).await;

    let job_id = node.dispatcher.submit_job(t.clone(), script, None, None).await?;
    node.wait_for(&t, job_id, |e| e.status == ExecutionStatus::Running)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ack = node.dispatcher.terminate_job(t.clone(), job_id).await;
    assert!(ack.accepted);

    let execution = node.wait_terminal(&t, job_id).await;
    assert_eq!(execution.status, ExecutionStatus::Terminated);
    assert!(node.dispatcher.registry().is_empty());

    node.dispatcher.shutdown(false).await?;
    Ok(())
}

#[tokio::test]
async fn terminating_an_unknown_job_is_accepted_and_harmless() -> TestResult {
    let node = Node::start(config(1)).await?;
    let t = tenant("acct1");
    node.add_tenant(&t).await;

    let ack = node.dispatcher.terminate_job(t.clone(), JobId::new()).await;
    assert!(ack.accepted);

    // The node keeps serving requests afterwards.
    let script = node.script("ok.sh", "exit 0\n");
    let job_id = node.dispatcher.submit_job(t.clone(), script, None, None).await?;
    let execution = node.wait_terminal(&t, job_id).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);

    node.dispatcher.shutdown(false).await?;
    Ok(())
}

#[tokio::test]
async fn tenants_are_added_and_removed_over_the_control_bus() -> TestResult {
    let node = Node::start(config(1)).await?;
    let a = tenant("acct1");
    let b = tenant("acct2");

    node.add_tenant(&a).await;
    node.add_tenant(&b).await;
    assert_eq!(node.dispatcher.tenants().await?, vec![a.clone(), b.clone()]);
    let stats = node.dispatcher.tenant_stats(a.clone()).await?.unwrap();
    assert_eq!(stats.concurrency_limit, 1);

    node.dispatcher.remove_tenant(a.clone(), false).await?;
    node.wait_tenants(|tenants| !tenants.contains(&a)).await;
    assert!(node.dispatcher.tenant_stats(a.clone()).await?.is_none());
    assert_eq!(node.dispatcher.tenants().await?, vec![b]);

    node.dispatcher.shutdown(false).await?;
    Ok(())
}

#[tokio::test]
async fn event_stream_reports_the_job_lifecycle() -> TestResult {
    let node = Node::start(config(1)).await?;
    let t = tenant("acct1");
    let script = node.script("ok.sh", "echo hi\n");
    node.add_tenant(&t).await;
    let mut events = node.dispatcher.subscribe_events();

    let job_id = node.dispatcher.submit_job(t.clone(), script, None, None).await?;
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(15), async {
        while let Ok(event) = events.recv().await {
            if event.job_id() != Some(job_id) {
                continue;
            }
            let terminal = event.is_terminal();
            seen.push(event);
            if terminal {
                break;
            }
        }
    })
    .await?;

    assert!(seen.iter().any(|e| matches!(e, JobEvent::JobEnqueued { .. })));
    assert!(seen.iter().any(|e| matches!(e, JobEvent::JobStarted { .. })));
    assert!(seen.iter().any(|e| matches!(e, JobEvent::JobLog { line, .. } if line.text == "hi")));
    assert!(matches!(seen.last(), Some(JobEvent::JobSucceeded { .. })));

    node.dispatcher.shutdown(false).await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_waits_for_running_jobs_and_is_idempotent() -> TestResult {
    let node = Node::start(config(1)).await?;
    let t = tenant("acct1");
    let script = node.script("slow.sh", "sleep 0.5\necho finished\n");
    node.add_tenant(&t).await;

    let job_id = node.dispatcher.submit_job(t.clone(), script, None, None).await?;
    node.wait_for(&t, job_id, |e| e.status == ExecutionStatus::Running)
        .await;

    node.dispatcher.shutdown(false).await?;
    let execution = node
        .dispatcher
        .job_status(t.clone(), job_id)
        .await?
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);

    node.dispatcher.shutdown(false).await?;
    assert!(node.dispatcher.tenants().await.is_err());
    Ok(())
}

#[tokio::test]
async fn forced_shutdown_terminates_running_jobs() -> TestResult {
    let node = Node::start(config(1)).await?;
    let t = tenant("acct1");
    let script = node.script("forever.sh", "sleep 30\n");
    node.add_tenant(&t).await;

    let job_id = node.dispatcher.submit_job(t.clone(), script, None, None).await?;
    node.wait_for(&t, job_id, |e| e.status == ExecutionStatus::Running)
        .await;

    tokio::time::timeout(Duration::from_secs(15), node.dispatcher.shutdown(true)).await??;
    let execution = node
        .dispatcher
        .job_status(t.clone(), job_id)
        .await?
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Terminated);
    Ok(())
}

#[test]
fn external_job_ids_are_validated() {
    let job_id = JobId::new();
    assert_eq!(Dispatcher::parse_job_id(&job_id.to_string()).unwrap(), job_id);
    assert!(Dispatcher::parse_job_id("not-a-ulid").is_err());
}
