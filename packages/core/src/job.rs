//! Job domain types for work items in the queue.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::JobsError;
use crate::payload::JobPayload;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a job performs. Handlers are registered per type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum JobType {
    DigestGeneration,
    RepositorySync,
    WebhookProcessing,
    Notification,
    Cleanup,
    HealthCheck,
    /// Application-defined type outside the built-in set.
    Custom(String),
}

impl JobType {
    /// All built-in job types.
    pub const BUILT_IN: [JobType; 6] = [
        JobType::DigestGeneration,
        JobType::RepositorySync,
        JobType::WebhookProcessing,
        JobType::Notification,
        JobType::Cleanup,
        JobType::HealthCheck,
    ];

    /// Wire name of the type.
    pub fn as_str(&self) -> &str {
        match self {
            JobType::DigestGeneration => "DIGEST_GENERATION",
            JobType::RepositorySync => "REPOSITORY_SYNC",
            JobType::WebhookProcessing => "WEBHOOK_PROCESSING",
            JobType::Notification => "NOTIFICATION",
            JobType::Cleanup => "CLEANUP",
            JobType::HealthCheck => "HEALTH_CHECK",
            JobType::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let job_type = match s {
            "DIGEST_GENERATION" => JobType::DigestGeneration,
            "REPOSITORY_SYNC" => JobType::RepositorySync,
            "WEBHOOK_PROCESSING" => JobType::WebhookProcessing,
            "NOTIFICATION" => JobType::Notification,
            "CLEANUP" => JobType::Cleanup,
            "HEALTH_CHECK" => JobType::HealthCheck,
            "" => return Err(JobsError::validation("job type must not be empty")),
            other => JobType::Custom(other.to_string()),
        };
        Ok(job_type)
    }
}

impl From<JobType> for String {
    fn from(job_type: JobType) -> Self {
        job_type.as_str().to_string()
    }
}

impl TryFrom<String> for JobType {
    type Error = JobsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Priority level for job execution order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// Numeric rank, higher runs first.
    pub fn rank(self) -> i64 {
        self as i64
    }

    /// The next tier up, saturating at `Critical`.
    pub fn bumped(self) -> Self {
        match self {
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High | Priority::Critical => Priority::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "NORMAL" => Ok(Priority::Normal),
            "HIGH" => Ok(Priority::High),
            "CRITICAL" | "URGENT" => Ok(Priority::Critical),
            other => Err(JobsError::validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// Current status of a job in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job is waiting to be processed.
    #[default]
    Pending,
    /// Job is currently held by a worker lease.
    Running,
    /// Job failed transiently and waits for its backoff to elapse.
    Retrying,
    /// Job completed successfully.
    Completed,
    /// Job failed and will not be retried (dead-lettered).
    Failed,
    /// Job was cancelled before completion.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Retrying,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Check if the job may be picked up by a claim.
    pub fn is_claimable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }

    /// Get a simple status string for display.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| JobsError::validation(format!("unknown job status '{s}'")))
    }
}

/// How a failure should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
    Timeout,
    LeaseExpired,
    Cancelled,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::Retryable | ErrorClass::Timeout | ErrorClass::LeaseExpired
        )
    }
}

/// Error detail recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub class: ErrorClass,
}

impl JobError {
    pub fn new(message: impl Into<String>, class: ErrorClass) -> Self {
        Self {
            message: message.into(),
            class,
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?})", self.message, self.class)
    }
}

/// A job represents a unit of work to be executed by the queue system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Type of job (used for routing to handlers).
    pub job_type: JobType,
    /// Execution priority.
    pub priority: Priority,
    /// Typed payload consumed by the handler.
    pub payload: JobPayload,
    /// Current status.
    pub status: JobStatus,
    /// Progress percentage, meaningful while running.
    pub progress: u8,
    /// Number of execution attempts so far.
    pub attempts: u32,
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Earliest time the job may be claimed.
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Links the job to its originating entity (digest record, schedule, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Worker currently holding the lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Set when cancellation was requested while running.
    #[serde(default)]
    pub cancel_requested: bool,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job, eligible immediately.
    pub fn new(payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: payload.job_type(),
            priority: Priority::default(),
            payload,
            status: JobStatus::Pending,
            progress: 0,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            scheduled_for: now,
            created_at: now,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            correlation_id: None,
            worker_id: None,
            lease_expires_at: None,
            cancel_requested: false,
            updated_at: now,
        }
    }

    /// Set the priority for this job.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the max retries for this job.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay eligibility until `at`.
    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = at;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Whether another execution attempt is still permitted.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// Wall-clock time of the current or last execution.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at.unwrap_or_else(Utc::now);
        u64::try_from((finished - started).num_milliseconds()).ok()
    }
}

/// Default per-job retry cap.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Caller input for creating a job. The payload is validated against the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub job_type: JobType,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl CreateJobRequest {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            job_type,
            payload,
            priority: None,
            max_retries: None,
            scheduled_for: None,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Validate the payload and build a pending job.
    pub fn into_job(self, default_max_retries: u32) -> Result<Job, JobsError> {
        let payload = JobPayload::from_json(&self.job_type, self.payload)?;
        let mut job = Job::new(payload)
            .with_priority(self.priority.unwrap_or_default())
            .with_max_retries(self.max_retries.unwrap_or(default_max_retries));
        if let Some(at) = self.scheduled_for {
            job = job.with_scheduled_for(at);
        }
        if let Some(correlation_id) = self.correlation_id {
            job = job.with_correlation_id(correlation_id);
        }
        Ok(job)
    }
}

/// Filter options for listing jobs.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub priority: Option<Priority>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check the non-paging criteria against a job.
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.job_type.as_ref().is_none_or(|t| &job.job_type == t)
            && self.priority.is_none_or(|p| job.priority == p)
            && self.created_after.is_none_or(|t| job.created_at > t)
            && self.created_before.is_none_or(|t| job.created_at < t)
    }
}
