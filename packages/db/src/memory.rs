//! In-process job store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jobs_core::store::{
    self, CancelOutcome, ClaimRequest, ExpiredLease, JobStore, StatusUpdate, StoreError,
    StoreFuture,
};
use jobs_core::{Job, JobFilter, JobId, JobStatus};
use tokio::sync::Mutex;

/// Job store backed by a mutex-guarded map. Claims are atomic because every
/// operation runs inside one critical section.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, job: Job) -> StoreFuture<'_, Job> {
        Box::pin(async move {
            let mut jobs = self.jobs.lock().await;
            if jobs.contains_key(&job.id) {
                return Err(StoreError::Duplicate(job.id));
            }
            jobs.insert(job.id, job.clone());
            Ok(job)
        })
    }

    fn claim_next(&self, request: ClaimRequest) -> StoreFuture<'_, Option<Job>> {
        Box::pin(async move {
            let mut jobs = self.jobs.lock().await;
            let Some(id) = request.select(jobs.values()).map(|job| job.id) else {
                return Ok(None);
            };
            let Some(job) = jobs.get_mut(&id) else {
                return Ok(None);
            };
            request.apply(job);
            Ok(Some(job.clone()))
        })
    }

    fn renew_lease(
        &self,
        id: JobId,
        worker_id: String,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut jobs = self.jobs.lock().await;
            Ok(jobs
                .get_mut(&id)
                .is_some_and(|job| store::apply_lease_renewal(job, &worker_id, expires_at)))
        })
    }

    fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        update: StatusUpdate,
    ) -> StoreFuture<'_, Job> {
        Box::pin(async move {
            let mut jobs = self.jobs.lock().await;
            let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            // Apply to a copy so a rejected update leaves the record untouched.
            let mut updated = job.clone();
            store::apply_status_update(&mut updated, status, update, Utc::now())?;
            *job = updated.clone();
            Ok(updated)
        })
    }

    fn request_cancel(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<CancelOutcome>> {
        Box::pin(async move {
            let mut jobs = self.jobs.lock().await;
            Ok(jobs
                .get_mut(&id)
                .map(|job| store::apply_cancel_request(job, now)))
        })
    }

    fn release_expired(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<ExpiredLease>> {
        Box::pin(async move {
            let mut jobs = self.jobs.lock().await;
            Ok(jobs
                .values_mut()
                .filter_map(|job| store::apply_lease_expiry(job, now))
                .collect())
        })
    }

    fn find(&self, id: JobId) -> StoreFuture<'_, Option<Job>> {
        Box::pin(async move { Ok(self.jobs.lock().await.get(&id).cloned()) })
    }

    fn query(&self, filter: JobFilter) -> StoreFuture<'_, Vec<Job>> {
        Box::pin(async move {
            let jobs = self.jobs.lock().await;
            let matching = jobs.values().filter(|job| filter.matches(job)).cloned().collect();
            Ok(store::page(matching, &filter))
        })
    }

    fn count_by_status(&self) -> StoreFuture<'_, HashMap<JobStatus, u64>> {
        Box::pin(async move { Ok(store::count_statuses(self.jobs.lock().await.values())) })
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut jobs = self.jobs.lock().await;
            let count = jobs.len();
            jobs.retain(|_, job| !store::is_purgeable(job, before));
            Ok((count - jobs.len()) as u64)
        })
    }
}
