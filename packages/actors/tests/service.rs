//! End-to-end behaviour of the job service over the in-memory store.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use jobs_actors::{FnHandler, HandlerFuture, JobContext, JobService, ServiceConfig, job_handler};
use chrono::Utc;
use jobs_core::{
    ClaimRequest, CreateJobRequest, ErrorClass, HandlerError, HealthStatus, Job, JobEvent,
    JobFilter, JobId, JobStatus, JobType, JobsError, Priority, RetryPolicy, ScheduleConfig,
    ScheduleId, SchedulePatch, WorkerConfig, WorkerStatus,
};
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::Instant;

type TestResult = Result<(), Box<dyn Error>>;

fn fast_config() -> ServiceConfig {
    ServiceConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_lease_ttl(Duration::from_millis(500))
        .with_scheduler_tick(Duration::from_millis(50))
        .with_retry(RetryPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(20),
        ))
}

fn digest_request() -> CreateJobRequest {
    CreateJobRequest::new(JobType::DigestGeneration, json!({ "digest_id": "weekly-1" }))
}

fn health_request() -> CreateJobRequest {
    CreateJobRequest::new(JobType::HealthCheck, json!({}))
}

async fn wait_for(
    service: &JobService,
    id: JobId,
    done: impl Fn(&Job) -> bool,
) -> Result<Job, Box<dyn Error>> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(job) = service.get_job(id).await?
            && done(&job)
        {
            return Ok(job);
        }
        if Instant::now() > deadline {
            return Err(format!("job {id} never reached the expected state").into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A handler that reports 50% and then waits for `gate`.
fn gated_digest(
    gate: Arc<Notify>,
) -> FnHandler<impl Fn(JobContext) -> HandlerFuture + Send + Sync + 'static> {
    FnHandler::new(JobType::DigestGeneration, move |ctx: JobContext| -> HandlerFuture {
        let gate = gate.clone();
        Box::pin(async move {
            ctx.report_progress(50).await;
            gate.notified().await;
            Ok(json!({ "ok": true }))
        })
    })
}

#[tokio::test]
async fn test_progress_then_completion() -> TestResult {
    let gate = Arc::new(Notify::new());
    let mut service = JobService::in_memory(fast_config().with_worker(WorkerConfig::new(1)));
    service.register_handler(gated_digest(gate.clone()));
    service.initialize().await?;

    let job = service.create_job(digest_request()).await?;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.priority, Priority::Normal);

    let running = wait_for(&service, job.id, |j| {
        j.status == JobStatus::Running && j.progress == 50
    })
    .await?;
    assert_eq!(running.attempts, 1);
    assert!(running.worker_id.is_some());

    gate.notify_one();
    let done = wait_for(&service, job.id, |j| j.status == JobStatus::Completed).await?;
    assert_eq!(done.result, Some(json!({ "ok": true })));
    assert_eq!(done.progress, 100);
    assert!(done.finished_at.is_some());
    assert!(done.worker_id.is_none());

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_retryable_failures_then_success() -> TestResult {
    let mut service = JobService::in_memory(fast_config().with_worker(WorkerConfig::new(2)));
    service.register_handler(job_handler!(JobType::HealthCheck, |ctx| {
        if ctx.attempt < 3 {
            Err(HandlerError::retryable("upstream unavailable"))
        } else {
            Ok(json!({ "attempt": ctx.attempt }))
        }
    }));
    service.initialize().await?;

    let job = service
        .create_job(health_request().with_max_retries(3))
        .await?;
    let done = wait_for(&service, job.id, |j| j.status.is_terminal()).await?;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 3);
    assert_eq!(done.result, Some(json!({ "attempt": 3 })));

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_exhausted_job_fails_and_can_be_retried() -> TestResult {
    let mut service = JobService::in_memory(fast_config().with_worker(WorkerConfig::new(1)));
    service.register_handler(job_handler!(JobType::HealthCheck, |ctx| {
        if ctx.attempt == 1 {
            Err(HandlerError::fatal("bad input"))
        } else {
            Ok(json!({ "recovered": true }))
        }
    }));
    service.initialize().await?;

    let job = service.create_job(health_request()).await?;
    let failed = wait_for(&service, job.id, |j| j.status == JobStatus::Failed).await?;
    assert_eq!(failed.attempts, 1);
    let error = failed.error.ok_or("failed job has no error")?;
    assert_eq!(error.class, ErrorClass::NonRetryable);

    assert!(service.retry_job(job.id, false).await?);
    let done = wait_for(&service, job.id, |j| j.status == JobStatus::Completed).await?;
    assert_eq!(done.attempts, 2);

    // Only failed jobs can be re-armed.
    assert!(!service.retry_job(job.id, true).await?);
    assert!(matches!(
        service.retry_job(JobId::new(), false).await,
        Err(JobsError::NotFound { .. })
    ));

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_graceful_removal_waits_for_running_job() -> TestResult {
    let gate = Arc::new(Notify::new());
    let mut service = JobService::in_memory(fast_config());
    service.register_handler(gated_digest(gate.clone()));
    let service = Arc::new(service);
    service.initialize().await?;
    service
        .add_worker(WorkerConfig::new(1).with_id("drainer"))
        .await?;

    let first = service.create_job(digest_request()).await?;
    wait_for(&service, first.id, |j| j.status == JobStatus::Running).await?;
    let second = service.create_job(digest_request()).await?;

    let removal = {
        let service = service.clone();
        tokio::spawn(async move { service.remove_worker("drainer", true).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!removal.is_finished());

    gate.notify_one();
    assert!(removal.await??);

    let first = service.get_job(first.id).await?.ok_or("first job missing")?;
    assert_eq!(first.status, JobStatus::Completed);
    let second = service.get_job(second.id).await?.ok_or("second job missing")?;
    assert_eq!(second.status, JobStatus::Pending);
    assert!(service.get_worker_statuses().await?.is_empty());

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_forced_removal_hands_job_back() -> TestResult {
    let mut service = JobService::in_memory(fast_config());
    service.register_handler(job_handler!(JobType::HealthCheck, |ctx| {
        ctx.cancel.cancelled().await;
        Err(HandlerError::cancelled())
    }));
    service.initialize().await?;
    service
        .add_worker(WorkerConfig::new(1).with_id("doomed"))
        .await?;

    let job = service.create_job(health_request()).await?;
    wait_for(&service, job.id, |j| j.status == JobStatus::Running).await?;

    assert!(!service.remove_worker("doomed", false).await?);
    let released = wait_for(&service, job.id, |j| j.status != JobStatus::Running).await?;
    assert_eq!(released.status, JobStatus::Pending);
    assert_eq!(released.attempts, 0);
    assert!(released.worker_id.is_none());

    assert!(matches!(
        service.remove_worker("doomed", true).await,
        Err(JobsError::NotFound { .. })
    ));
    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_cancel_pending_job() -> TestResult {
    let service = JobService::in_memory(fast_config());

    let job = service.create_job(health_request()).await?;
    assert!(service.cancel_job(job.id).await?);

    let cancelled = service.get_job(job.id).await?.ok_or("job missing")?;
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.finished_at.is_some());

    assert!(!service.cancel_job(job.id).await?);
    assert!(matches!(
        service.cancel_job(JobId::new()).await,
        Err(JobsError::NotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_cancel_running_job_fires_token() -> TestResult {
    let mut service = JobService::in_memory(fast_config().with_worker(WorkerConfig::new(1)));
    service.register_handler(job_handler!(JobType::HealthCheck, |ctx| {
        ctx.report_progress(10).await;
        ctx.cancel.cancelled().await;
        ctx.checkpoint()?;
        Ok(json!({ "unreachable": true }))
    }));
    service.initialize().await?;

    let job = service.create_job(health_request()).await?;
    wait_for(&service, job.id, |j| j.status == JobStatus::Running && j.progress == 10).await?;

    assert!(service.cancel_job(job.id).await?);
    let cancelled = wait_for(&service, job.id, |j| j.status.is_terminal()).await?;
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.result, None);

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_handler_timeout_and_panic() -> TestResult {
    let config = fast_config()
        .with_worker(WorkerConfig::new(2))
        .with_job_timeout(JobType::HealthCheck, Duration::from_millis(100));
    let mut service = JobService::in_memory(config);
    service.register_handler(job_handler!(JobType::HealthCheck, |ctx| {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!({ "attempt": ctx.attempt }))
    }));
    service.register_handler(job_handler!(JobType::Cleanup, |_ctx| {
        panic!("cleanup exploded");
    }));
    service.initialize().await?;

    let slow = service
        .create_job(health_request().with_max_retries(0))
        .await?;
    let boom = service
        .create_job(CreateJobRequest::new(JobType::Cleanup, json!({})).with_max_retries(0))
        .await?;

    let timed_out = wait_for(&service, slow.id, |j| j.status == JobStatus::Failed).await?;
    let error = timed_out.error.ok_or("timed out job has no error")?;
    assert_eq!(error.class, ErrorClass::Timeout);

    let panicked = wait_for(&service, boom.id, |j| j.status == JobStatus::Failed).await?;
    let error = panicked.error.ok_or("panicked job has no error")?;
    assert!(error.message.contains("cleanup exploded"));

    // The worker survives a panicking handler.
    let workers = service.get_worker_statuses().await?;
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].status, WorkerStatus::Active);

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_validation_and_conflicts() -> TestResult {
    let mut service = JobService::in_memory(fast_config());
    service.register_handler(job_handler!(JobType::HealthCheck, |_ctx| Ok(json!(null))));
    service.initialize().await?;

    let bad_payload = service
        .create_job(CreateJobRequest::new(JobType::DigestGeneration, json!({})))
        .await;
    assert!(matches!(bad_payload, Err(JobsError::Validation(_))));
    assert!(service.query_jobs(JobFilter::default()).await?.is_empty());

    assert!(matches!(
        service.add_worker(WorkerConfig::new(0)).await,
        Err(JobsError::Validation(_))
    ));
    assert!(matches!(
        service
            .add_worker(WorkerConfig::new(1).with_types([JobType::Notification]))
            .await,
        Err(JobsError::Validation(_))
    ));

    let id = service.add_worker(WorkerConfig::new(1).with_id("w-a")).await?;
    assert_eq!(id, "w-a");
    assert!(matches!(
        service.add_worker(WorkerConfig::new(1).with_id("w-a")).await,
        Err(JobsError::Conflict(_))
    ));

    let generated = service.add_worker(WorkerConfig::new(3)).await?;
    let statuses = service.get_worker_statuses().await?;
    assert_eq!(statuses.len(), 2);
    let info = statuses
        .iter()
        .find(|w| w.id == generated)
        .ok_or("generated worker missing")?;
    assert_eq!(info.capacity, 3);
    assert_eq!(info.supported_types, vec![JobType::HealthCheck]);

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_operations_before_initialize() -> TestResult {
    let service = JobService::in_memory(fast_config());

    assert!(matches!(
        service.add_worker(WorkerConfig::new(1)).await,
        Err(JobsError::NotInitialized)
    ));
    assert!(matches!(
        service.list_schedules().await,
        Err(JobsError::NotInitialized)
    ));
    assert!(matches!(
        service.get_metrics().await,
        Err(JobsError::NotInitialized)
    ));
    assert!(matches!(
        service.get_health_check().await,
        Err(JobsError::NotInitialized)
    ));

    // Job operations do not need the actors.
    let job = service.create_job(health_request()).await?;
    let listed = service
        .query_jobs(JobFilter::default().with_status(JobStatus::Pending))
        .await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, job.id);
    Ok(())
}

#[tokio::test]
async fn test_initialize_and_shutdown_are_idempotent() -> TestResult {
    let mut service = JobService::in_memory(fast_config().with_worker(WorkerConfig::new(1)));
    service.register_handler(job_handler!(JobType::HealthCheck, |_ctx| Ok(json!(null))));

    service.initialize().await?;
    service.initialize().await?;
    assert_eq!(service.get_worker_statuses().await?.len(), 1);

    service.shutdown().await?;
    service.shutdown().await?;
    assert!(!service.is_initialized().await);
    assert!(matches!(
        service.get_worker_statuses().await,
        Err(JobsError::NotInitialized)
    ));

    // A restarted service starts its configured workers again.
    service.initialize().await?;
    assert_eq!(service.get_worker_statuses().await?.len(), 1);
    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_schedule_management_and_trigger() -> TestResult {
    let config = fast_config()
        .with_schedule(ScheduleConfig::new("nightly-cleanup", "0 3 * * *", JobType::Cleanup));
    let service = JobService::in_memory(config);
    service.initialize().await?;

    let schedules = service.list_schedules().await?;
    assert_eq!(schedules.len(), 1);
    assert!(schedules[0].next_run_at.is_some());

    let pulse = service
        .add_schedule(
            ScheduleConfig::new("pulse", "*/5 * * * *", JobType::HealthCheck)
                .with_priority(Priority::High)
                .disabled(),
        )
        .await?;
    assert_eq!(pulse.next_run_at, None);

    assert!(matches!(
        service
            .add_schedule(ScheduleConfig::new("pulse", "* * * * *", JobType::HealthCheck))
            .await,
        Err(JobsError::Conflict(_))
    ));
    assert!(matches!(
        service
            .add_schedule(ScheduleConfig::new("broken", "not a cron", JobType::HealthCheck))
            .await,
        Err(JobsError::Validation(_))
    ));

    // Manual triggers work while disabled and leave the next run alone.
    let job = service.trigger_schedule(pulse.id).await?;
    let expected_correlation = format!("schedule:{}", pulse.id);
    assert_eq!(job.correlation_id.as_deref(), Some(expected_correlation.as_str()));
    assert_eq!(job.priority, Priority::High);
    let triggered = service
        .get_schedule(pulse.id)
        .await?
        .ok_or("schedule missing")?;
    assert!(triggered.last_run_at.is_some());
    assert_eq!(triggered.next_run_at, None);

    let enabled = service
        .update_schedule(pulse.id, SchedulePatch::enabled(true))
        .await?;
    assert!(enabled.enabled);
    assert!(enabled.next_run_at.is_some());

    assert!(service.remove_schedule(pulse.id).await?);
    assert!(!service.remove_schedule(pulse.id).await?);
    assert!(matches!(
        service.trigger_schedule(ScheduleId::new()).await,
        Err(JobsError::NotFound { .. })
    ));
    assert!(matches!(
        service
            .update_schedule(ScheduleId::new(), SchedulePatch::enabled(false))
            .await,
        Err(JobsError::NotFound { .. })
    ));

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_metrics_health_and_events() -> TestResult {
    let mut service = JobService::in_memory(fast_config().with_worker(WorkerConfig::new(1)));
    service.register_handler(job_handler!(JobType::HealthCheck, |_ctx| {
        Ok(json!({ "healthy": true }))
    }));
    let mut events = service.subscribe();
    service.initialize().await?;

    let job = service.create_job(health_request()).await?;
    wait_for(&service, job.id, |j| j.status == JobStatus::Completed).await?;

    let mut saw_enqueued = false;
    let mut saw_completed = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !(saw_enqueued && saw_completed) && Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
            Ok(Ok(JobEvent::JobEnqueued { job: enqueued, .. })) => {
                saw_enqueued |= enqueued.id == job.id;
            }
            Ok(Ok(JobEvent::JobCompleted { job_id, .. })) => saw_completed |= job_id == job.id,
            _ => {}
        }
    }
    assert!(saw_enqueued && saw_completed);

    let metrics = service.get_metrics().await?;
    assert_eq!(metrics.counts.completed, 1);
    assert_eq!(metrics.counts.queue_depth(), 0);

    let deadline = Instant::now() + Duration::from_secs(5);
    let stats = loop {
        let stats = service
            .get_job_performance_stats(Some(JobType::HealthCheck))
            .await?;
        if stats[0].completed == 1 || Instant::now() > deadline {
            break stats;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(stats[0].completed, 1);
    assert_eq!(stats[0].success_rate(), Some(100.0));

    let health = service.get_health_check().await?;
    for name in ["queue", "workers", "errors", "scheduler"] {
        assert!(health.component(name).is_some(), "missing component {name}");
    }
    assert_eq!(
        health.component("scheduler").map(|c| c.status),
        Some(HealthStatus::Healthy)
    );
    assert!(service.get_metrics_history(1).await?.len() <= 1);

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_initialize_starts_nothing() -> TestResult {
    let mut service = JobService::in_memory(
        fast_config()
            .with_worker(WorkerConfig::new(1).with_id("health"))
            .with_worker(WorkerConfig::new(1).with_types([JobType::Cleanup])),
    );
    service.register_handler(job_handler!(JobType::HealthCheck, |_ctx| Ok(json!(null))));

    assert!(matches!(
        service.initialize().await,
        Err(JobsError::Validation(_))
    ));
    assert!(!service.is_initialized().await);
    assert!(matches!(
        service.get_worker_statuses().await,
        Err(JobsError::NotInitialized)
    ));
    // Retrying reports the same problem instead of succeeding silently.
    assert!(service.initialize().await.is_err());
    assert!(!service.is_initialized().await);

    let idle = JobService::in_memory(fast_config().with_worker(WorkerConfig::new(0)));
    assert!(matches!(
        idle.initialize().await,
        Err(JobsError::Validation(_))
    ));
    assert!(!idle.is_initialized().await);

    let mut twins = JobService::in_memory(
        fast_config()
            .with_worker(WorkerConfig::new(1).with_id("twin"))
            .with_worker(WorkerConfig::new(1).with_id("twin")),
    );
    twins.register_handler(job_handler!(JobType::HealthCheck, |_ctx| Ok(json!(null))));
    assert!(matches!(
        twins.initialize().await,
        Err(JobsError::Conflict(_))
    ));
    assert!(!twins.is_initialized().await);
    Ok(())
}

#[tokio::test]
async fn test_expired_lease_is_recovered_by_another_worker() -> TestResult {
    let mut service = JobService::in_memory(fast_config());
    service.register_handler(job_handler!(JobType::HealthCheck, |ctx| {
        Ok(json!({ "attempt": ctx.attempt }))
    }));
    service.initialize().await?;

    let job = service.create_job(health_request()).await?;

    // A holder that claims the job and then disappears without heartbeating.
    let claimed = service
        .store()
        .claim_next(ClaimRequest::new(
            "vanished",
            vec![JobType::HealthCheck],
            Utc::now(),
            chrono::Duration::milliseconds(200),
        ))
        .await?
        .ok_or("job was not claimable")?;
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.attempts, 1);

    service
        .add_worker(WorkerConfig::new(1).with_id("survivor"))
        .await?;
    let done = wait_for(&service, job.id, |j| j.status.is_terminal()).await?;
    assert_eq!(done.status, JobStatus::Completed);
    // The abandoned attempt still counts; the survivor ran the second one.
    assert_eq!(done.attempts, 2);
    assert_eq!(done.result, Some(json!({ "attempt": 2 })));

    service.shutdown().await?;
    Ok(())
}
