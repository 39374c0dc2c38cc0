//! Store behaviour shared by every `JobStore` implementation.

use std::error::Error;
use std::sync::Arc;

use chrono::{Duration, Utc};
use jobs_core::{
    ClaimRequest, HealthCheckPayload, Job, JobFilter, JobPayload, JobStatus, JobStore, JobType,
    Priority, StatusUpdate, StoreError,
};

pub type TestResult = Result<(), Box<dyn Error>>;

pub fn health_job() -> Job {
    Job::new(JobPayload::HealthCheck(HealthCheckPayload::default()))
}

pub fn claim(worker: &str) -> ClaimRequest {
    ClaimRequest::new(worker, vec![JobType::HealthCheck], Utc::now(), Duration::minutes(2))
}

pub async fn claim_is_exclusive<S: JobStore>(store: Arc<S>) -> TestResult {
    let job = store.insert(health_job()).await?;

    let mut tasks = Vec::new();
    for n in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.claim_next(claim(&format!("worker-{n}"))).await
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        if let Some(claimed) = task.await?? {
            winners.push(claimed);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, job.id);
    assert_eq!(winners[0].attempts, 1);
    Ok(())
}

pub async fn claims_follow_priority<S: JobStore>(store: Arc<S>) -> TestResult {
    let low = store.insert(health_job().with_priority(Priority::Low)).await?;
    let normal = store
        .insert(health_job().with_priority(Priority::Normal))
        .await?;
    let high = store.insert(health_job().with_priority(Priority::High)).await?;

    let mut order = Vec::new();
    while let Some(job) = store.claim_next(claim("w1")).await? {
        order.push(job.id);
    }
    assert_eq!(order, vec![high.id, normal.id, low.id]);
    Ok(())
}

pub async fn expired_leases_are_requeued<S: JobStore>(store: Arc<S>) -> TestResult {
    let job = store.insert(health_job()).await?;
    let claimed = store
        .claim_next(claim("w1"))
        .await?
        .ok_or("job should be claimable")?;
    assert_eq!(claimed.status, JobStatus::Running);

    assert!(store.release_expired(Utc::now()).await?.is_empty());

    let later = Utc::now() + Duration::minutes(3);
    let released = store.release_expired(later).await?;
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].worker_id, "w1");
    assert_eq!(released[0].job.status, JobStatus::Retrying);
    assert_eq!(released[0].job.attempts, 1);

    // The former holder can no longer settle the job.
    let late = store
        .update_status(
            job.id,
            JobStatus::Completed,
            StatusUpdate::default().held_by("w1"),
        )
        .await;
    assert!(matches!(late, Err(StoreError::LeaseLost(_))));

    let mut request = claim("w2");
    request.now = later;
    let reclaimed = store
        .claim_next(request)
        .await?
        .ok_or("released job should be claimable")?;
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.attempts, 2);
    assert_eq!(reclaimed.worker_id.as_deref(), Some("w2"));
    Ok(())
}

pub async fn cancelled_pending_job_is_never_claimed<S: JobStore>(store: Arc<S>) -> TestResult {
    let job = store.insert(health_job()).await?;
    let outcome = store
        .request_cancel(job.id, Utc::now())
        .await?
        .ok_or("job should exist")?;
    assert_eq!(outcome.job().status, JobStatus::Cancelled);
    assert!(store.claim_next(claim("w1")).await?.is_none());
    Ok(())
}

pub async fn attempts_are_capped<S: JobStore>(store: Arc<S>) -> TestResult {
    let job = store.insert(health_job().with_max_retries(1)).await?;

    for attempt in 1..=2 {
        let claimed = store
            .claim_next(claim("w1"))
            .await?
            .ok_or("attempt should be allowed")?;
        assert_eq!(claimed.attempts, attempt);
        store
            .update_status(
                job.id,
                JobStatus::Retrying,
                StatusUpdate::default()
                    .with_scheduled_for(Utc::now() - Duration::seconds(1))
                    .held_by("w1"),
            )
            .await?;
    }

    assert!(store.claim_next(claim("w1")).await?.is_none());
    let stored = store.find(job.id).await?.ok_or("job should exist")?;
    assert_eq!(stored.attempts, 2);
    Ok(())
}

pub async fn progress_and_completion<S: JobStore>(store: Arc<S>) -> TestResult {
    let job = store.insert(health_job()).await?;
    store.claim_next(claim("w1")).await?;

    let running = store
        .update_status(
            job.id,
            JobStatus::Running,
            StatusUpdate::default().with_progress(50).held_by("w1"),
        )
        .await?;
    assert_eq!(running.progress, 50);

    assert!(
        store
            .renew_lease(job.id, "w1".into(), Utc::now() + Duration::minutes(5))
            .await?
    );
    assert!(
        !store
            .renew_lease(job.id, "w2".into(), Utc::now() + Duration::minutes(5))
            .await?
    );

    let done = store
        .update_status(
            job.id,
            JobStatus::Completed,
            StatusUpdate::default()
                .with_progress(100)
                .with_result(serde_json::json!({"ok": true}))
                .held_by("w1"),
        )
        .await?;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result, Some(serde_json::json!({"ok": true})));
    assert!(done.finished_at.is_some());
    assert!(done.worker_id.is_none());

    let found = store.find(job.id).await?.ok_or("job should exist")?;
    assert_eq!(found.status, JobStatus::Completed);
    assert_eq!(found.payload, job.payload);
    Ok(())
}

pub async fn query_count_and_purge<S: JobStore>(store: Arc<S>) -> TestResult {
    let first = store.insert(health_job()).await?;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = store.insert(health_job()).await?;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let cleanup = store
        .insert(Job::new(JobPayload::Cleanup(Default::default())))
        .await?;
    store.request_cancel(first.id, Utc::now()).await?;

    let all = store.query(JobFilter::default()).await?;
    assert_eq!(
        all.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![cleanup.id, second.id, first.id]
    );

    let pending_health = store
        .query(
            JobFilter::default()
                .with_status(JobStatus::Pending)
                .with_job_type(JobType::HealthCheck),
        )
        .await?;
    assert_eq!(pending_health.len(), 1);
    assert_eq!(pending_health[0].id, second.id);

    let page = store.query(JobFilter::default().with_limit(1)).await?;
    assert_eq!(page.len(), 1);

    let counts = store.count_by_status().await?;
    assert_eq!(counts.get(&JobStatus::Pending), Some(&2));
    assert_eq!(counts.get(&JobStatus::Cancelled), Some(&1));

    assert_eq!(store.purge_finished(Utc::now() - Duration::hours(1)).await?, 0);
    assert_eq!(store.purge_finished(Utc::now() + Duration::seconds(1)).await?, 1);
    assert!(store.find(first.id).await?.is_none());
    Ok(())
}

pub async fn duplicate_insert_is_rejected<S: JobStore>(store: Arc<S>) -> TestResult {
    let job = store.insert(health_job()).await?;
    let again = store.insert(job.clone()).await;
    assert!(matches!(again, Err(StoreError::Duplicate(id)) if id == job.id));
    Ok(())
}

pub async fn rearm_requires_failed_status<S: JobStore>(store: Arc<S>) -> TestResult {
    let job = store.insert(health_job().with_max_retries(0)).await?;
    store.claim_next(claim("w1")).await?;
    store
        .update_status(job.id, JobStatus::Failed, StatusUpdate::default().held_by("w1"))
        .await?;

    let rearm = || {
        StatusUpdate::default()
            .with_max_retries(1)
            .with_scheduled_for(Utc::now() - Duration::seconds(1))
            .from_status(JobStatus::Failed)
    };

    let id = job.id;
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let update = rearm();
        tasks.push(tokio::spawn(async move {
            store.update_status(id, JobStatus::Retrying, update).await
        }));
    }
    let mut rearmed = 0;
    for task in tasks {
        match task.await? {
            Ok(job) => {
                assert_eq!(job.status, JobStatus::Retrying);
                rearmed += 1;
            }
            Err(StoreError::StatusMismatch { actual, .. }) => {
                assert_eq!(actual, JobStatus::Retrying)
            }
            Err(e) => return Err(e.into()),
        }
    }
    assert_eq!(rearmed, 1);

    // A late re-arm must not pull the job away from its new holder.
    let running = store
        .claim_next(claim("w2"))
        .await?
        .ok_or("re-armed job should be claimable")?;
    assert_eq!(running.attempts, 2);
    assert!(matches!(
        store.update_status(job.id, JobStatus::Retrying, rearm()).await,
        Err(StoreError::StatusMismatch {
            actual: JobStatus::Running,
            ..
        })
    ));
    let stored = store.find(job.id).await?.ok_or("job should exist")?;
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.worker_id.as_deref(), Some("w2"));
    Ok(())
}
