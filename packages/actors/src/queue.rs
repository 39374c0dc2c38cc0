//! Job queue: claim, settle and cancel jobs over a store, publishing events.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobs_core::{
    CancelOutcome, ClaimRequest, ErrorClass, Job, JobError, JobEvent, JobId, JobStatus, JobStore,
    JobType, JobsError, RetryPolicy, StatusUpdate, StoreError,
};
use tokio::sync::broadcast;

use crate::config::ServiceConfig;

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Status a queued job held before a claim. Queued jobs are `Pending` only
/// before their first attempt.
fn queued_status(attempts_before: u32) -> JobStatus {
    if attempts_before == 0 {
        JobStatus::Pending
    } else {
        JobStatus::Retrying
    }
}

/// Priority-ordered view over a [`JobStore`] that publishes a [`JobEvent`]
/// for every transition it makes.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    events: broadcast::Sender<JobEvent>,
    retry: RetryPolicy,
    lease_ttl: chrono::Duration,
    aging_threshold: Option<chrono::Duration>,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        events: broadcast::Sender<JobEvent>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            store,
            events,
            retry: config.retry,
            lease_ttl: to_chrono(config.lease_ttl),
            aging_threshold: config.aging_threshold.map(to_chrono),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> broadcast::Sender<JobEvent> {
        self.events.clone()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    fn status_changed(&self, job: &Job, old_status: JobStatus) {
        self.publish(JobEvent::JobStatusChanged {
            job_id: job.id,
            job_type: job.job_type.clone(),
            old_status,
            new_status: job.status,
            timestamp: Utc::now(),
        });
    }

    fn cancelled(&self, job: &Job, old_status: JobStatus, reason: &str) {
        tracing::info!("Job {} cancelled: {}", job.id, reason);
        self.publish(JobEvent::JobCancelled {
            job_id: job.id,
            reason: Some(reason.to_string()),
            timestamp: Utc::now(),
        });
        self.status_changed(job, old_status);
    }

    /// Persist a new pending job.
    pub async fn enqueue(&self, job: Job) -> Result<Job, JobsError> {
        let job = self.store.insert(job).await?;
        tracing::info!(
            "Enqueued job {} ({}, {})",
            job.id,
            job.job_type,
            job.priority
        );
        self.publish(JobEvent::JobEnqueued {
            job: Box::new(job.clone()),
            timestamp: Utc::now(),
        });
        Ok(job)
    }

    /// Claim the next eligible job for a worker with `capacity` free slots.
    ///
    /// Abandoned leases are recovered first so their jobs compete normally.
    pub async fn claim(
        &self,
        worker_id: &str,
        job_types: &[JobType],
        capacity: usize,
    ) -> Result<Option<Job>, JobsError> {
        if capacity == 0 || job_types.is_empty() {
            return Ok(None);
        }
        self.recover_expired().await?;

        let request =
            ClaimRequest::new(worker_id, job_types.to_vec(), Utc::now(), self.lease_ttl)
                .with_aging(self.aging_threshold);
        let Some(job) = self.store.claim_next(request).await? else {
            return Ok(None);
        };

        tracing::debug!(
            "Worker {} claimed job {} (attempt {})",
            worker_id,
            job.id,
            job.attempts
        );
        self.publish(JobEvent::JobStarted {
            job_id: job.id,
            job_type: job.job_type.clone(),
            worker_id: worker_id.to_string(),
            attempt: job.attempts,
            timestamp: Utc::now(),
        });
        self.status_changed(&job, queued_status(job.attempts - 1));
        Ok(Some(job))
    }

    /// Extend the lease on a running job. False when the worker lost it.
    pub async fn renew(&self, job_id: JobId, worker_id: &str) -> Result<bool, JobsError> {
        let expires_at = Utc::now() + self.lease_ttl;
        Ok(self
            .store
            .renew_lease(job_id, worker_id.to_string(), expires_at)
            .await?)
    }

    pub async fn find(&self, job_id: JobId) -> Result<Option<Job>, JobsError> {
        Ok(self.store.find(job_id).await?)
    }

    /// Settle every job whose lease lapsed. Returns how many were recovered.
    pub async fn recover_expired(&self) -> Result<usize, JobsError> {
        let expired = self.store.release_expired(Utc::now()).await?;
        for lease in &expired {
            let job = &lease.job;
            tracing::warn!(
                "Lease on job {} held by {} expired, job is now {}",
                job.id,
                lease.worker_id,
                job.status
            );
            self.publish(JobEvent::LeaseExpired {
                job_id: job.id,
                worker_id: lease.worker_id.clone(),
                timestamp: Utc::now(),
            });
            match job.status {
                JobStatus::Cancelled => self.cancelled(job, JobStatus::Running, "lease expired"),
                JobStatus::Failed => {
                    self.publish(JobEvent::JobFailed {
                        job_id: job.id,
                        job_type: job.job_type.clone(),
                        error: "lease expired".into(),
                        attempts: job.attempts,
                        will_retry: false,
                        duration_ms: job.duration_ms().unwrap_or(0),
                        timestamp: Utc::now(),
                    });
                    self.status_changed(job, JobStatus::Running);
                }
                _ => self.status_changed(job, JobStatus::Running),
            }
        }
        Ok(expired.len())
    }

    /// Record handler progress on a running job.
    pub async fn report_progress(
        &self,
        job_id: JobId,
        worker_id: &str,
        progress: u8,
    ) -> Result<Job, JobsError> {
        let job = self
            .store
            .update_status(
                job_id,
                JobStatus::Running,
                StatusUpdate::default()
                    .with_progress(progress)
                    .held_by(worker_id),
            )
            .await?;
        self.publish(JobEvent::JobProgress {
            job_id,
            progress: job.progress,
            timestamp: Utc::now(),
        });
        Ok(job)
    }

    /// Mark a job completed with its handler result.
    pub async fn complete(
        &self,
        job: &Job,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Job, JobsError> {
        let settled = self
            .store
            .update_status(
                job.id,
                JobStatus::Completed,
                StatusUpdate::default()
                    .with_progress(100)
                    .with_result(result)
                    .held_by(worker_id),
            )
            .await?;

        if settled.status == JobStatus::Cancelled {
            self.cancelled(&settled, JobStatus::Running, "cancel requested during execution");
            return Ok(settled);
        }

        let duration_ms = settled.duration_ms().unwrap_or(0);
        tracing::info!("Job {} completed in {}ms", settled.id, duration_ms);
        self.publish(JobEvent::JobCompleted {
            job_id: settled.id,
            job_type: settled.job_type.clone(),
            duration_ms,
            timestamp: Utc::now(),
        });
        self.status_changed(&settled, JobStatus::Running);
        Ok(settled)
    }

    /// Record a failed attempt, scheduling a retry when the policy allows.
    pub async fn fail(
        &self,
        job: &Job,
        worker_id: &str,
        error: JobError,
    ) -> Result<Job, JobsError> {
        let will_retry = self
            .retry
            .should_retry(job.attempts, job.max_retries, error.class);
        let duration_ms = (Utc::now() - job.started_at.unwrap_or(job.created_at))
            .num_milliseconds()
            .max(0) as u64;

        let (status, update) = if will_retry {
            let delay = to_chrono(self.retry.next_delay(job.attempts));
            (
                JobStatus::Retrying,
                StatusUpdate::default().with_scheduled_for(Utc::now() + delay),
            )
        } else {
            (JobStatus::Failed, StatusUpdate::default())
        };
        let settled = self
            .store
            .update_status(
                job.id,
                status,
                update.with_error(error.clone()).held_by(worker_id),
            )
            .await?;

        if settled.status == JobStatus::Cancelled {
            self.cancelled(&settled, JobStatus::Running, "cancel requested during execution");
            return Ok(settled);
        }

        if will_retry {
            tracing::warn!(
                "Job {} attempt {} failed, retrying at {}: {}",
                settled.id,
                settled.attempts,
                settled.scheduled_for,
                error.message
            );
        } else {
            tracing::error!(
                "Job {} failed after {} attempts: {}",
                settled.id,
                settled.attempts,
                error.message
            );
        }
        self.publish(JobEvent::JobFailed {
            job_id: settled.id,
            job_type: settled.job_type.clone(),
            error: error.message,
            attempts: settled.attempts,
            will_retry,
            duration_ms,
            timestamp: Utc::now(),
        });
        if will_retry {
            self.publish(JobEvent::JobRetrying {
                job_id: settled.id,
                attempt: settled.attempts + 1,
                scheduled_for: settled.scheduled_for,
                timestamp: Utc::now(),
            });
        }
        self.status_changed(&settled, JobStatus::Running);
        Ok(settled)
    }

    /// Settle a running job whose handler stopped on its cancellation token.
    pub async fn settle_cancelled(&self, job: &Job, worker_id: &str) -> Result<Job, JobsError> {
        let settled = self
            .store
            .update_status(
                job.id,
                JobStatus::Cancelled,
                StatusUpdate::default()
                    .with_error(JobError::new("cancelled", ErrorClass::Cancelled))
                    .held_by(worker_id),
            )
            .await?;
        self.cancelled(&settled, JobStatus::Running, "handler observed cancellation");
        Ok(settled)
    }

    /// Hand a job back after its worker was stopped. The interrupted attempt
    /// is not counted.
    pub async fn release(&self, job: &Job, worker_id: &str) -> Result<Job, JobsError> {
        let attempts = job.attempts.saturating_sub(1);
        let settled = self
            .store
            .update_status(
                job.id,
                queued_status(attempts),
                StatusUpdate::default()
                    .with_attempts(attempts)
                    .with_scheduled_for(Utc::now())
                    .held_by(worker_id),
            )
            .await?;
        if settled.status == JobStatus::Cancelled {
            self.cancelled(&settled, JobStatus::Running, "cancel requested during execution");
        } else {
            tracing::info!("Worker {} released job {}", worker_id, settled.id);
            self.status_changed(&settled, JobStatus::Running);
        }
        Ok(settled)
    }

    /// Cancel a queued job or flag a running one. `None` for unknown ids.
    pub async fn cancel(&self, job_id: JobId) -> Result<Option<CancelOutcome>, JobsError> {
        let outcome = self.store.request_cancel(job_id, Utc::now()).await?;
        match &outcome {
            Some(CancelOutcome::Cancelled(job)) => {
                self.cancelled(job, queued_status(job.attempts), "cancelled before execution")
            }
            Some(CancelOutcome::Requested(job)) => {
                tracing::info!("Cancellation requested for running job {}", job.id)
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Re-arm a failed job. Forced re-arms start over with no attempts;
    /// otherwise exactly one more attempt is granted. `None` unless the job
    /// is `Failed`.
    pub async fn rearm(&self, job_id: JobId, force_reset: bool) -> Result<Option<Job>, JobsError> {
        let job = self
            .store
            .find(job_id)
            .await?
            .ok_or_else(|| JobsError::not_found("Job", job_id))?;
        if job.status != JobStatus::Failed {
            return Ok(None);
        }

        let (status, update) = if force_reset {
            (
                JobStatus::Pending,
                StatusUpdate::default().with_attempts(0),
            )
        } else {
            (
                queued_status(job.attempts),
                StatusUpdate::default().with_max_retries(job.attempts),
            )
        };
        let update = update
            .with_scheduled_for(Utc::now())
            .from_status(JobStatus::Failed);
        let rearmed = match self.store.update_status(job_id, status, update).await {
            Ok(job) => job,
            // Someone else re-armed it first.
            Err(StoreError::StatusMismatch { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            "Job {} re-armed (attempts {}, max retries {})",
            job_id,
            rearmed.attempts,
            rearmed.max_retries
        );
        self.status_changed(&rearmed, JobStatus::Failed);
        Ok(Some(rearmed))
    }

    /// Delete terminal jobs finished before `before`.
    pub async fn purge(&self, before: chrono::DateTime<Utc>) -> Result<u64, JobsError> {
        let purged = self.store.purge_finished(before).await?;
        if purged > 0 {
            tracing::info!("Purged {} finished jobs older than {}", purged, before);
        }
        Ok(purged)
    }

    /// Delete terminal jobs that finished more than `older_than` ago.
    pub async fn purge_older_than(&self, older_than: Duration) -> Result<u64, JobsError> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|_| JobsError::validation("purge age out of range"))?;
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .ok_or_else(|| JobsError::validation("purge age out of range"))?;
        self.purge(cutoff).await
    }
}
