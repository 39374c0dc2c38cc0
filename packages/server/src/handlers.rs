//! Demo handlers for the built-in job types.

use std::time::Duration;

use jobs_actors::{
    FnHandler, HandlerFuture, HandlerResult, JobContext, JobQueue, JobService, job_handler,
};
use jobs_core::{HandlerError, JobCounts, JobPayload, JobType, JobsError};
use serde_json::json;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

fn unexpected(ctx: &JobContext) -> HandlerError {
    HandlerError::fatal(format!(
        "{} job carried a {} payload",
        ctx.job_type,
        ctx.payload.job_type()
    ))
}

/// Register a handler for every built-in job type.
pub fn register_all(service: &mut JobService) {
    let queue = service.queue().clone();

    service.register_handler(job_handler!(JobType::DigestGeneration, |ctx| {
        let JobPayload::DigestGeneration(digest) = &ctx.payload else {
            return Err(unexpected(&ctx));
        };
        let steps = digest.repository_ids.len().max(1);
        for step in 0..steps {
            ctx.checkpoint()?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            ctx.report_progress((((step + 1) * 100) / steps) as u8).await;
        }
        tracing::info!("Generated digest {}", digest.digest_id);
        Ok(json!({
            "digest_id": digest.digest_id,
            "repositories": digest.repository_ids.len(),
        }))
    }));

    service.register_handler(job_handler!(JobType::RepositorySync, |ctx| {
        let JobPayload::RepositorySync(repo) = &ctx.payload else {
            return Err(unexpected(&ctx));
        };
        ctx.report_progress(10).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        ctx.checkpoint()?;
        tracing::info!("Synced repository {}", repo.full_name);
        Ok(json!({ "repository_id": repo.repository_id, "forced": repo.force }))
    }));

    service.register_handler(job_handler!(JobType::WebhookProcessing, |ctx| {
        let JobPayload::WebhookProcessing(hook) = &ctx.payload else {
            return Err(unexpected(&ctx));
        };
        tracing::info!("Processing {} webhook from {}", hook.event, hook.source);
        Ok(json!({ "source": hook.source, "event": hook.event, "delivery_id": hook.delivery_id }))
    }));

    service.register_handler(job_handler!(JobType::Notification, |ctx| {
        let JobPayload::Notification(notification) = &ctx.payload else {
            return Err(unexpected(&ctx));
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        tracing::info!(
            "Delivered {:?} notification to {}",
            notification.channel,
            notification.recipient
        );
        Ok(json!({ "channel": notification.channel, "delivered": true }))
    }));

    let cleanup_queue = queue.clone();
    service.register_handler(FnHandler::new(
        JobType::Cleanup,
        move |ctx: JobContext| -> HandlerFuture { Box::pin(cleanup(ctx, cleanup_queue.clone())) },
    ));

    service.register_handler(FnHandler::new(
        JobType::HealthCheck,
        move |ctx: JobContext| -> HandlerFuture { Box::pin(health_check(ctx, queue.clone())) },
    ));
}

/// Purge finished jobs past the retention period.
async fn cleanup(ctx: JobContext, queue: JobQueue) -> HandlerResult {
    let JobPayload::Cleanup(cleanup) = &ctx.payload else {
        return Err(unexpected(&ctx));
    };
    let retention = Duration::from_secs(u64::from(cleanup.older_than_days) * SECS_PER_DAY);
    let purged = queue
        .purge_older_than(retention)
        .await
        .map_err(|e| match e {
            JobsError::Validation(message) => HandlerError::fatal(message),
            other => HandlerError::retryable(other.to_string()),
        })?;
    ctx.report_progress(100).await;
    tracing::info!(
        "Cleanup purged {} jobs older than {} days",
        purged,
        cleanup.older_than_days
    );
    Ok(json!({ "purged": purged, "older_than_days": cleanup.older_than_days }))
}

async fn health_check(ctx: JobContext, queue: JobQueue) -> HandlerResult {
    let counts = queue
        .store()
        .count_by_status()
        .await
        .map_err(|e| HandlerError::retryable(format!("store unreachable: {e}")))?;
    let counts = JobCounts::from_map(&counts);
    tracing::debug!("Health check {}: {:?}", ctx.job_id, counts);
    Ok(json!({ "store": "ok", "counts": counts }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobs_actors::ServiceConfig;
    use jobs_core::{CreateJobRequest, HealthCheckPayload, Job, JobStatus, WorkerConfig};

    fn finished_days_ago(days: i64) -> Job {
        let mut job = Job::new(JobPayload::HealthCheck(HealthCheckPayload::default()));
        job.status = JobStatus::Completed;
        job.finished_at = Some(Utc::now() - chrono::Duration::days(days));
        job
    }

    #[tokio::test]
    async fn cleanup_purges_jobs_past_retention() {
        let config = ServiceConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_worker(WorkerConfig::new(1).with_types([JobType::Cleanup]));
        let mut service = JobService::in_memory(config);
        register_all(&mut service);

        let stale = service.store().insert(finished_days_ago(40)).await.unwrap();
        let recent = service.store().insert(finished_days_ago(2)).await.unwrap();

        service.initialize().await.unwrap();
        let request = CreateJobRequest::new(JobType::Cleanup, json!({ "older_than_days": 30 }));
        let job = service.create_job(request).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let done = loop {
            let current = service.get_job(job.id).await.unwrap().unwrap();
            if current.status.is_terminal() || tokio::time::Instant::now() > deadline {
                break current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(
            done.result,
            Some(json!({ "purged": 1, "older_than_days": 30 }))
        );
        assert!(service.get_job(stale.id).await.unwrap().is_none());
        assert!(service.get_job(recent.id).await.unwrap().is_some());

        service.shutdown().await.unwrap();
    }
}
