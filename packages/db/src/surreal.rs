//! SurrealDB-backed job store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jobs_core::store::{
    self, CancelOutcome, ClaimRequest, ExpiredLease, JobStore, StatusUpdate, StoreError,
    StoreFuture,
};
use jobs_core::{Job, JobError, JobFilter, JobId, JobPayload, JobStatus, Priority};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{Database, DbConfig, DbError};

/// Attempts at a conditional write before giving up with `Contention`.
const MAX_WRITE_ATTEMPTS: usize = 8;

const TERMINAL: [&str; 3] = ["completed", "failed", "cancelled"];

impl From<DbError> for StoreError {
    fn from(error: DbError) -> Self {
        match error {
            DbError::Serialization(message) => StoreError::Serialization(message),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

fn backend(error: surrealdb::Error) -> StoreError {
    DbError::from(error).into()
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(value: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {value}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: &str) -> Result<T, StoreError> {
    serde_json::from_str(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Flat record stored under `job:<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    job_id: String,
    job_type: String,
    priority: String,
    priority_rank: i64,
    payload: String,
    status: String,
    progress: i64,
    attempts: i64,
    max_retries: i64,
    scheduled_for: i64,
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    result: Option<String>,
    error: Option<String>,
    correlation_id: Option<String>,
    worker_id: Option<String>,
    lease_expires_at: Option<i64>,
    cancel_requested: bool,
    updated_at: i64,
    version: i64,
}

impl JobRecord {
    fn from_job(job: &Job, version: i64) -> Result<Self, StoreError> {
        Ok(Self {
            job_id: job.id.to_string(),
            job_type: job.job_type.to_string(),
            priority: job.priority.to_string(),
            priority_rank: job.priority.rank(),
            payload: to_json(&job.payload)?,
            status: job.status.as_str().to_string(),
            progress: i64::from(job.progress),
            attempts: i64::from(job.attempts),
            max_retries: i64::from(job.max_retries),
            scheduled_for: micros(job.scheduled_for),
            created_at: micros(job.created_at),
            started_at: job.started_at.map(micros),
            finished_at: job.finished_at.map(micros),
            result: job.result.as_ref().map(to_json).transpose()?,
            error: job.error.as_ref().map(to_json).transpose()?,
            correlation_id: job.correlation_id.clone(),
            worker_id: job.worker_id.clone(),
            lease_expires_at: job.lease_expires_at.map(micros),
            cancel_requested: job.cancel_requested,
            updated_at: micros(job.updated_at),
            version,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let invalid = |field: &str, value: &str| {
            StoreError::Serialization(format!("invalid {field} '{value}'"))
        };
        let payload: JobPayload = from_json(&self.payload)?;
        Ok(Job {
            id: JobId::parse(&self.job_id).map_err(|_| invalid("job id", &self.job_id))?,
            job_type: self
                .job_type
                .parse()
                .map_err(|_| invalid("job type", &self.job_type))?,
            priority: self
                .priority
                .parse::<Priority>()
                .map_err(|_| invalid("priority", &self.priority))?,
            payload,
            status: self
                .status
                .parse::<JobStatus>()
                .map_err(|_| invalid("status", &self.status))?,
            progress: u8::try_from(self.progress).unwrap_or(100),
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            max_retries: u32::try_from(self.max_retries).unwrap_or(0),
            scheduled_for: from_micros(self.scheduled_for)?,
            created_at: from_micros(self.created_at)?,
            started_at: self.started_at.map(from_micros).transpose()?,
            finished_at: self.finished_at.map(from_micros).transpose()?,
            result: self.result.as_deref().map(from_json).transpose()?,
            error: self
                .error
                .as_deref()
                .map(from_json::<JobError>)
                .transpose()?,
            correlation_id: self.correlation_id,
            worker_id: self.worker_id,
            lease_expires_at: self.lease_expires_at.map(from_micros).transpose()?,
            cancel_requested: self.cancel_requested,
            updated_at: from_micros(self.updated_at)?,
        })
    }
}

/// What a mutation decided to do with the record it loaded.
enum Change<T> {
    Write(T),
    Keep(T),
}

/// Durable job store on SurrealDB.
///
/// Every mutation reads the record, applies the shared transition rules and
/// writes back with `WHERE version = $version`, retrying when another writer
/// got there first. Writers in this process are additionally serialized so
/// they do not abort each other's transactions.
pub struct SurrealJobStore {
    db: Database,
    writes: Mutex<()>,
}

impl SurrealJobStore {
    /// Wrap an open connection. The schema must already exist.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            writes: Mutex::new(()),
        }
    }

    /// Connect, initialize the schema and wrap the connection.
    pub async fn open(config: &DbConfig) -> Result<Self, DbError> {
        let db = crate::connect(config).await?;
        crate::init_schema(&db).await?;
        Ok(Self::new(db))
    }

    /// The underlying connection.
    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn load(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.db
            .select(("job", id.to_string()))
            .await
            .map_err(backend)
    }

    async fn select_where(
        &self,
        sql: &str,
        bindings: Vec<(&'static str, serde_json::Value)>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut query = self.db.query(sql.to_string());
        for binding in bindings {
            query = query.bind(binding);
        }
        let mut response = query.await.map_err(backend)?;
        response.take(0).map_err(backend)
    }

    /// Write `job` if the stored record is still at `version`.
    async fn write_if_unchanged(&self, job: &Job, version: i64) -> Result<bool, StoreError> {
        let record = JobRecord::from_job(job, version + 1)?;
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('job', $id) CONTENT $data \
                 WHERE version = $version RETURN AFTER",
            )
            .bind(("id", job.id.to_string()))
            .bind(("data", record))
            .bind(("version", version))
            .await
            .map_err(backend)?;
        let written: Vec<JobRecord> = response.take(0).map_err(backend)?;
        Ok(!written.is_empty())
    }

    /// Read-modify-conditional-write loop on one record.
    async fn mutate<T: Send>(
        &self,
        id: JobId,
        mut change: impl FnMut(&mut Job) -> Result<Change<T>, StoreError> + Send,
    ) -> Result<Option<T>, StoreError> {
        let _guard = self.writes.lock().await;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(record) = self.load(id).await? else {
                return Ok(None);
            };
            let version = record.version;
            let mut job = record.into_job()?;
            match change(&mut job)? {
                Change::Keep(out) => return Ok(Some(out)),
                Change::Write(out) => {
                    if self.write_if_unchanged(&job, version).await? {
                        return Ok(Some(out));
                    }
                    tracing::debug!("Version conflict on job {}, retrying", id);
                }
            }
        }
        Err(StoreError::Contention(id))
    }
}

impl JobStore for SurrealJobStore {
    fn insert(&self, job: Job) -> StoreFuture<'_, Job> {
        Box::pin(async move {
            let _guard = self.writes.lock().await;
            if self.load(job.id).await?.is_some() {
                return Err(StoreError::Duplicate(job.id));
            }
            let record = JobRecord::from_job(&job, 0)?;
            let created: Option<JobRecord> = self
                .db
                .create(("job", job.id.to_string()))
                .content(record)
                .await
                .map_err(backend)?;
            created
                .ok_or_else(|| StoreError::Backend("Failed to create job".into()))?
                .into_job()
        })
    }

    fn claim_next(&self, request: ClaimRequest) -> StoreFuture<'_, Option<Job>> {
        Box::pin(async move {
            if request.job_types.is_empty() {
                return Ok(None);
            }
            let types: Vec<String> = request.job_types.iter().map(|t| t.to_string()).collect();
            let _guard = self.writes.lock().await;

            for _ in 0..MAX_WRITE_ATTEMPTS {
                let records = self
                    .select_where(
                        "SELECT * FROM job WHERE status IN ['pending', 'retrying'] \
                         AND scheduled_for <= $now AND job_type IN $types",
                        vec![
                            ("now", serde_json::json!(micros(request.now))),
                            ("types", serde_json::json!(types)),
                        ],
                    )
                    .await?;

                let mut candidates = Vec::with_capacity(records.len());
                for record in records {
                    let version = record.version;
                    candidates.push((record.into_job()?, version));
                }
                let Some(picked) = request.select(candidates.iter().map(|(job, _)| job)) else {
                    return Ok(None);
                };
                let picked = picked.id;
                let Some((mut job, version)) =
                    candidates.into_iter().find(|(job, _)| job.id == picked)
                else {
                    return Ok(None);
                };

                request.apply(&mut job);
                if self.write_if_unchanged(&job, version).await? {
                    return Ok(Some(job));
                }
                tracing::debug!("Lost claim race on job {}, retrying", job.id);
            }
            Ok(None)
        })
    }

    fn renew_lease(
        &self,
        id: JobId,
        worker_id: String,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let renewed = self
                .mutate(id, |job| {
                    Ok(if store::apply_lease_renewal(job, &worker_id, expires_at) {
                        Change::Write(true)
                    } else {
                        Change::Keep(false)
                    })
                })
                .await?;
            Ok(renewed.unwrap_or(false))
        })
    }

    fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        update: StatusUpdate,
    ) -> StoreFuture<'_, Job> {
        Box::pin(async move {
            let now = Utc::now();
            self.mutate(id, |job| {
                store::apply_status_update(job, status, update.clone(), now)?;
                Ok(Change::Write(job.clone()))
            })
            .await?
            .ok_or(StoreError::NotFound(id))
        })
    }

    fn request_cancel(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<CancelOutcome>> {
        Box::pin(async move {
            self.mutate(id, |job| {
                Ok(match store::apply_cancel_request(job, now) {
                    outcome @ CancelOutcome::AlreadyTerminal(_) => Change::Keep(outcome),
                    outcome => Change::Write(outcome),
                })
            })
            .await
        })
    }

    fn release_expired(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<ExpiredLease>> {
        Box::pin(async move {
            let records = self
                .select_where(
                    "SELECT * FROM job WHERE status = 'running' \
                     AND lease_expires_at != NONE AND lease_expires_at <= $now",
                    vec![("now", serde_json::json!(micros(now)))],
                )
                .await?;

            let mut released = Vec::new();
            for record in records {
                let id = record.into_job()?.id;
                let expired = self
                    .mutate(id, |job| {
                        Ok(match store::apply_lease_expiry(job, now) {
                            Some(expired) => Change::Write(Some(expired)),
                            None => Change::Keep(None),
                        })
                    })
                    .await?;
                if let Some(Some(expired)) = expired {
                    released.push(expired);
                }
            }
            Ok(released)
        })
    }

    fn find(&self, id: JobId) -> StoreFuture<'_, Option<Job>> {
        Box::pin(async move { self.load(id).await?.map(JobRecord::into_job).transpose() })
    }

    fn query(&self, filter: JobFilter) -> StoreFuture<'_, Vec<Job>> {
        Box::pin(async move {
            let mut conditions = Vec::new();
            let mut bindings: Vec<(&'static str, serde_json::Value)> = Vec::new();

            if let Some(status) = filter.status {
                conditions.push("status = $status");
                bindings.push(("status", serde_json::json!(status.as_str())));
            }

            if let Some(job_type) = &filter.job_type {
                conditions.push("job_type = $job_type");
                bindings.push(("job_type", serde_json::json!(job_type.to_string())));
            }

            if let Some(priority) = filter.priority {
                conditions.push("priority = $priority");
                bindings.push(("priority", serde_json::json!(priority.as_str())));
            }

            if let Some(after) = filter.created_after {
                conditions.push("created_at > $created_after");
                bindings.push(("created_after", serde_json::json!(micros(after))));
            }

            if let Some(before) = filter.created_before {
                conditions.push("created_at < $created_before");
                bindings.push(("created_before", serde_json::json!(micros(before))));
            }

            let where_clause = if conditions.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", conditions.join(" AND "))
            };

            let limit_clause = filter
                .limit
                .map(|l| format!("LIMIT {}", l))
                .unwrap_or_default();

            let offset_clause = filter
                .offset
                .map(|o| format!("START {}", o))
                .unwrap_or_default();

            let sql = format!(
                "SELECT * FROM job {} ORDER BY created_at DESC, job_id DESC {} {}",
                where_clause, limit_clause, offset_clause
            );

            self.select_where(&sql, bindings)
                .await?
                .into_iter()
                .map(JobRecord::into_job)
                .collect()
        })
    }

    fn count_by_status(&self) -> StoreFuture<'_, HashMap<JobStatus, u64>> {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct StatusCount {
                status: String,
                count: i64,
            }

            let mut response = self
                .db
                .query("SELECT status, count() AS count FROM job GROUP BY status")
                .await
                .map_err(backend)?;
            let counts: Vec<StatusCount> = response.take(0).map_err(backend)?;

            let mut map = HashMap::new();
            for count in counts {
                if let Ok(status) = count.status.parse::<JobStatus>() {
                    map.insert(status, count.count.max(0) as u64);
                }
            }
            Ok(map)
        })
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let _guard = self.writes.lock().await;
            let mut response = self
                .db
                .query(
                    "DELETE job WHERE status IN $terminal \
                     AND finished_at != NONE AND finished_at < $before RETURN BEFORE",
                )
                .bind(("terminal", TERMINAL.map(String::from).to_vec()))
                .bind(("before", micros(before)))
                .await
                .map_err(backend)?;
            let deleted: Vec<JobRecord> = response.take(0).map_err(backend)?;
            Ok(deleted.len() as u64)
        })
    }
}
