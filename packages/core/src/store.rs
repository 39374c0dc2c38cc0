//! Job store contract and the transition rules every store applies.
//!
//! Stores only persist and select; the rules for what a claim, a status
//! update, a cancel request or a lease expiry does to a record live here so
//! the in-memory and durable stores behave identically.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Duration, Utc};

use crate::job::{ErrorClass, Job, JobError, JobFilter, JobId, JobStatus, JobType, Priority};

/// Future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Errors raised by a job store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// The caller expected to hold the lease but no longer does.
    #[error("Lease on job {0} is held by another worker")]
    LeaseLost(JobId),

    #[error("Job already exists: {0}")]
    Duplicate(JobId),

    /// A guarded update found the job in another status.
    #[error("Job {id} is {actual}, expected {expected}")]
    StatusMismatch {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    /// A conditional write kept losing to concurrent writers.
    #[error("Write conflict on job {0}")]
    Contention(JobId),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Durable storage for jobs.
///
/// `claim_next` must be atomic with respect to other claimants: a job is
/// handed to at most one caller per transition to `Running`.
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new job.
    fn insert(&self, job: Job) -> StoreFuture<'_, Job>;

    /// Atomically claim the best eligible job, if any.
    fn claim_next(&self, request: ClaimRequest) -> StoreFuture<'_, Option<Job>>;

    /// Extend the lease held by `worker_id`. Returns false when the lease is gone.
    fn renew_lease(
        &self,
        id: JobId,
        worker_id: String,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool>;

    /// Move a job to `status`, applying the field changes in `update`.
    fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        update: StatusUpdate,
    ) -> StoreFuture<'_, Job>;

    /// Cancel a queued job or flag a running one. `None` for unknown ids.
    fn request_cancel(&self, id: JobId, now: DateTime<Utc>)
    -> StoreFuture<'_, Option<CancelOutcome>>;

    /// Settle every running job whose lease lapsed at or before `now`.
    fn release_expired(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<ExpiredLease>>;

    fn find(&self, id: JobId) -> StoreFuture<'_, Option<Job>>;

    /// Jobs matching `filter`, newest first.
    fn query(&self, filter: JobFilter) -> StoreFuture<'_, Vec<Job>>;

    fn count_by_status(&self) -> StoreFuture<'_, HashMap<JobStatus, u64>>;

    /// Delete terminal jobs that finished before `before`.
    fn purge_finished(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64>;
}

/// Parameters of a claim.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRequest {
    pub worker_id: String,
    /// Types the claimant can run. Empty claims nothing.
    pub job_types: Vec<JobType>,
    pub now: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    /// Jobs eligible for longer than this run one priority tier higher.
    pub aging_threshold: Option<Duration>,
}

impl ClaimRequest {
    pub fn new(
        worker_id: impl Into<String>,
        job_types: Vec<JobType>,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            job_types,
            now,
            lease_expires_at: now + lease_ttl,
            aging_threshold: None,
        }
    }

    pub fn with_aging(mut self, threshold: Option<Duration>) -> Self {
        self.aging_threshold = threshold;
        self
    }

    /// Whether `job` may be claimed by this request.
    pub fn is_eligible(&self, job: &Job) -> bool {
        job.status.is_claimable()
            && job.scheduled_for <= self.now
            && job.has_attempts_left()
            && !job.cancel_requested
            && self.job_types.contains(&job.job_type)
    }

    /// Priority after aging.
    pub fn effective_priority(&self, job: &Job) -> Priority {
        match self.aging_threshold {
            Some(threshold) if self.now - job.scheduled_for > threshold => job.priority.bumped(),
            _ => job.priority,
        }
    }

    /// Claim order: higher effective priority, then older, then lower id.
    pub fn compare(&self, a: &Job, b: &Job) -> Ordering {
        self.effective_priority(b)
            .cmp(&self.effective_priority(a))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }

    /// The job this request would claim out of `jobs`.
    pub fn select<'j>(&self, jobs: impl IntoIterator<Item = &'j Job>) -> Option<&'j Job> {
        jobs.into_iter()
            .filter(|job| self.is_eligible(job))
            .min_by(|a, b| self.compare(a, b))
    }

    /// Transition a selected job to `Running` under this request's lease.
    pub fn apply(&self, job: &mut Job) {
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.progress = 0;
        job.started_at = Some(self.now);
        job.finished_at = None;
        job.worker_id = Some(self.worker_id.clone());
        job.lease_expires_at = Some(self.lease_expires_at);
        job.updated_at = self.now;
    }
}

/// Field changes carried by a status update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub progress: Option<u8>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub attempts: Option<u32>,
    pub max_retries: Option<u32>,
    /// Reject the update unless this worker holds the job's lease.
    pub expect_worker: Option<String>,
    /// Reject the update unless the job is currently in this status.
    pub expect_status: Option<JobStatus>,
}

impl StatusUpdate {
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: JobError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn held_by(mut self, worker_id: impl Into<String>) -> Self {
        self.expect_worker = Some(worker_id.into());
        self
    }

    pub fn from_status(mut self, status: JobStatus) -> Self {
        self.expect_status = Some(status);
        self
    }
}

/// Apply a status update to `job` in place.
///
/// A running job with a pending cancel request settles as `Cancelled`
/// whatever status was asked for, unless it stays `Running`.
pub fn apply_status_update(
    job: &mut Job,
    status: JobStatus,
    update: StatusUpdate,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if let Some(worker) = &update.expect_worker
        && (job.status != JobStatus::Running || job.worker_id.as_deref() != Some(worker))
    {
        return Err(StoreError::LeaseLost(job.id));
    }
    if let Some(expected) = update.expect_status
        && job.status != expected
    {
        return Err(StoreError::StatusMismatch {
            id: job.id,
            expected,
            actual: job.status,
        });
    }

    let status = if job.cancel_requested
        && job.status == JobStatus::Running
        && status != JobStatus::Running
    {
        JobStatus::Cancelled
    } else {
        status
    };

    match (status, update.progress) {
        (JobStatus::Running, Some(progress)) => job.progress = job.progress.max(progress.min(100)),
        (JobStatus::Completed, Some(progress)) => job.progress = progress.min(100),
        _ => {}
    }
    if status == JobStatus::Completed
        && let Some(result) = update.result
    {
        job.result = Some(result);
    }
    if let Some(error) = update.error {
        job.error = Some(error);
    }
    if let Some(at) = update.started_at {
        job.started_at = Some(at);
    }
    if let Some(at) = update.scheduled_for {
        job.scheduled_for = at;
    }
    if let Some(attempts) = update.attempts {
        job.attempts = attempts;
    }
    if let Some(max_retries) = update.max_retries {
        job.max_retries = max_retries;
    }

    if status != JobStatus::Running {
        job.worker_id = None;
        job.lease_expires_at = None;
    }
    if status.is_claimable() {
        job.progress = 0;
        job.cancel_requested = false;
        job.finished_at = None;
    }
    if status.is_terminal() {
        job.finished_at = Some(update.finished_at.unwrap_or(now));
    }

    job.status = status;
    job.updated_at = now;
    Ok(())
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The job was queued and is now `Cancelled`.
    Cancelled(Job),
    /// The job is running; its cancel flag is now set.
    Requested(Job),
    /// The job had already finished.
    AlreadyTerminal(Job),
}

impl CancelOutcome {
    pub fn job(&self) -> &Job {
        match self {
            CancelOutcome::Cancelled(job)
            | CancelOutcome::Requested(job)
            | CancelOutcome::AlreadyTerminal(job) => job,
        }
    }
}

/// Apply a cancel request to `job` in place.
pub fn apply_cancel_request(job: &mut Job, now: DateTime<Utc>) -> CancelOutcome {
    match job.status {
        status if status.is_terminal() => CancelOutcome::AlreadyTerminal(job.clone()),
        JobStatus::Running => {
            job.cancel_requested = true;
            job.updated_at = now;
            CancelOutcome::Requested(job.clone())
        }
        _ => {
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(now);
            job.updated_at = now;
            CancelOutcome::Cancelled(job.clone())
        }
    }
}

/// A job whose lease lapsed, after it was settled.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredLease {
    pub job: Job,
    /// Worker that held the lapsed lease.
    pub worker_id: String,
}

/// Settle `job` if its lease lapsed at or before `now`.
///
/// The job returns to `Retrying` eligible at once with `attempts` unchanged,
/// becomes `Cancelled` when a cancel was requested, or `Failed` when no
/// attempts remain.
pub fn apply_lease_expiry(job: &mut Job, now: DateTime<Utc>) -> Option<ExpiredLease> {
    if job.status != JobStatus::Running || job.lease_expires_at.is_none_or(|at| at > now) {
        return None;
    }

    let worker_id = job.worker_id.take().unwrap_or_default();
    job.lease_expires_at = None;
    job.updated_at = now;

    if job.cancel_requested {
        job.status = JobStatus::Cancelled;
        job.finished_at = Some(now);
    } else if !job.has_attempts_left() {
        job.status = JobStatus::Failed;
        job.finished_at = Some(now);
        job.error = Some(JobError::new(
            format!("lease held by {worker_id} expired"),
            ErrorClass::LeaseExpired,
        ));
    } else {
        job.status = JobStatus::Retrying;
        job.scheduled_for = now;
        job.progress = 0;
    }

    Some(ExpiredLease {
        job: job.clone(),
        worker_id,
    })
}

/// Extend the lease on `job` if `worker_id` still holds it.
pub fn apply_lease_renewal(job: &mut Job, worker_id: &str, expires_at: DateTime<Utc>) -> bool {
    if job.status != JobStatus::Running || job.worker_id.as_deref() != Some(worker_id) {
        return false;
    }
    job.lease_expires_at = Some(expires_at);
    true
}

/// Whether `job` is a finished job old enough to purge.
pub fn is_purgeable(job: &Job, before: DateTime<Utc>) -> bool {
    job.status.is_terminal() && job.finished_at.is_some_and(|at| at < before)
}

/// Order matching jobs newest first and apply the filter's paging.
pub fn page(mut jobs: Vec<Job>, filter: &JobFilter) -> Vec<Job> {
    jobs.retain(|job| filter.matches(job));
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    jobs.into_iter()
        .skip(filter.offset.unwrap_or(0))
        .take(filter.limit.unwrap_or(usize::MAX))
        .collect()
}

/// Count jobs per status.
pub fn count_statuses<'j>(jobs: impl IntoIterator<Item = &'j Job>) -> HashMap<JobStatus, u64> {
    let mut counts = HashMap::new();
    for job in jobs {
        *counts.entry(job.status).or_insert(0) += 1;
    }
    counts
}
