//! Event types for job state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId, JobStatus, JobType};
use crate::schedule::ScheduleId;
use crate::worker::WorkerStatus;

/// Events emitted by the job system for observers such as the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    // Job events
    /// A new job was enqueued.
    JobEnqueued { job: Box<Job>, timestamp: DateTime<Utc> },
    /// A worker claimed a job.
    JobStarted {
        job_id: JobId,
        job_type: JobType,
        worker_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// A handler reported progress.
    JobProgress {
        job_id: JobId,
        progress: u8,
        timestamp: DateTime<Utc>,
    },
    /// A job completed successfully.
    JobCompleted {
        job_id: JobId,
        job_type: JobType,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// An execution attempt failed.
    JobFailed {
        job_id: JobId,
        job_type: JobType,
        error: String,
        attempts: u32,
        will_retry: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job's status changed.
    JobStatusChanged {
        job_id: JobId,
        job_type: JobType,
        old_status: JobStatus,
        new_status: JobStatus,
        timestamp: DateTime<Utc>,
    },
    /// A job was cancelled.
    JobCancelled {
        job_id: JobId,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A job was scheduled for another attempt.
    JobRetrying {
        job_id: JobId,
        attempt: u32,
        scheduled_for: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    /// A lease lapsed and the job was returned to the queue.
    LeaseExpired {
        job_id: JobId,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },

    // Worker events
    WorkerStarted {
        worker_id: String,
        capacity: usize,
        timestamp: DateTime<Utc>,
    },
    WorkerHeartbeat {
        worker_id: String,
        status: WorkerStatus,
        current_load: usize,
        capacity: usize,
        timestamp: DateTime<Utc>,
    },
    WorkerStopped {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },

    // Scheduler events
    ScheduleTriggered {
        schedule_id: ScheduleId,
        job_id: JobId,
        manual: bool,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobEnqueued { timestamp, .. } => *timestamp,
            JobEvent::JobStarted { timestamp, .. } => *timestamp,
            JobEvent::JobProgress { timestamp, .. } => *timestamp,
            JobEvent::JobCompleted { timestamp, .. } => *timestamp,
            JobEvent::JobFailed { timestamp, .. } => *timestamp,
            JobEvent::JobStatusChanged { timestamp, .. } => *timestamp,
            JobEvent::JobCancelled { timestamp, .. } => *timestamp,
            JobEvent::JobRetrying { timestamp, .. } => *timestamp,
            JobEvent::LeaseExpired { timestamp, .. } => *timestamp,
            JobEvent::WorkerStarted { timestamp, .. } => *timestamp,
            JobEvent::WorkerHeartbeat { timestamp, .. } => *timestamp,
            JobEvent::WorkerStopped { timestamp, .. } => *timestamp,
            JobEvent::ScheduleTriggered { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobEnqueued { job, .. } => Some(job.id),
            JobEvent::JobStarted { job_id, .. } => Some(*job_id),
            JobEvent::JobProgress { job_id, .. } => Some(*job_id),
            JobEvent::JobCompleted { job_id, .. } => Some(*job_id),
            JobEvent::JobFailed { job_id, .. } => Some(*job_id),
            JobEvent::JobStatusChanged { job_id, .. } => Some(*job_id),
            JobEvent::JobCancelled { job_id, .. } => Some(*job_id),
            JobEvent::JobRetrying { job_id, .. } => Some(*job_id),
            JobEvent::LeaseExpired { job_id, .. } => Some(*job_id),
            JobEvent::ScheduleTriggered { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobEnqueued { job, .. } => {
                format!("Job {} ({}) enqueued", job.id, job.job_type)
            }
            JobEvent::JobStarted {
                job_id,
                worker_id,
                attempt,
                ..
            } => format!("Job {} started by {} (attempt {})", job_id, worker_id, attempt),
            JobEvent::JobProgress {
                job_id, progress, ..
            } => format!("Job {} at {}%", job_id, progress),
            JobEvent::JobCompleted {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_id, duration_ms),
            JobEvent::JobFailed {
                job_id,
                error,
                will_retry,
                ..
            } => {
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!("Job {} failed: {}{}", job_id, error, retry)
            }
            JobEvent::JobStatusChanged {
                job_id,
                old_status,
                new_status,
                ..
            } => format!("Job {} {} -> {}", job_id, old_status, new_status),
            JobEvent::JobCancelled { job_id, reason, .. } => {
                let reason = reason.as_deref().unwrap_or("no reason");
                format!("Job {} cancelled: {}", job_id, reason)
            }
            JobEvent::JobRetrying {
                job_id,
                attempt,
                scheduled_for,
                ..
            } => format!(
                "Job {} retrying (attempt {}) at {}",
                job_id, attempt, scheduled_for
            ),
            JobEvent::LeaseExpired {
                job_id, worker_id, ..
            } => format!("Lease on job {} held by {} expired", job_id, worker_id),
            JobEvent::WorkerStarted {
                worker_id,
                capacity,
                ..
            } => format!("Worker {} started (capacity {})", worker_id, capacity),
            JobEvent::WorkerHeartbeat { worker_id, .. } => {
                format!("Worker {} heartbeat", worker_id)
            }
            JobEvent::WorkerStopped { worker_id, .. } => format!("Worker {} stopped", worker_id),
            JobEvent::ScheduleTriggered {
                schedule_id,
                job_id,
                manual,
                ..
            } => {
                let how = if *manual { "manually" } else { "on schedule" };
                format!("Schedule {} enqueued job {} {}", schedule_id, job_id, how)
            }
        }
    }
}
