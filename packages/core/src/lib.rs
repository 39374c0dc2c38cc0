//! Core domain types for the job processing system.
//!
//! This crate contains the types and pure rules shared by every package:
//! - Job, JobStatus and typed payloads for work items
//! - The JobStore contract and the transitions stores apply
//! - Retry backoff, cron evaluation and schedule definitions
//! - Worker descriptors, metrics and health reports
//! - Events for live observers

pub mod cron;
mod error;
mod events;
mod job;
mod metrics;
mod payload;
pub mod retry;
mod schedule;
pub mod store;
mod worker;

pub use cron::{CronError, CronExpr};
pub use error::{HandlerError, JobsError};
pub use events::JobEvent;
pub use job::{
    CreateJobRequest, DEFAULT_MAX_RETRIES, ErrorClass, Job, JobError, JobFilter, JobId, JobStatus,
    JobType, Priority,
};
pub use metrics::{
    ComponentHealth, HealthReport, HealthStatus, JobCounts, JobPerformanceStats, MetricsSnapshot,
};
pub use payload::{
    CleanupPayload, CustomPayload, DigestGenerationPayload, HealthCheckPayload, JobPayload,
    NotificationChannel, NotificationPayload, RepositorySyncPayload, WebhookPayload,
};
pub use retry::RetryPolicy;
pub use schedule::{Schedule, ScheduleConfig, ScheduleId, SchedulePatch};
pub use store::{
    CancelOutcome, ClaimRequest, ExpiredLease, JobStore, StatusUpdate, StoreError, StoreFuture,
};
pub use worker::{WorkerConfig, WorkerInfo, WorkerStatus};
