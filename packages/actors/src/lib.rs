//! Actor system for the job service.
//!
//! This crate provides the Ractor-based runtime that executes jobs:
//! workers, the cron scheduler and the metrics monitor, composed behind
//! [`JobService`].
//!
//! # Architecture
//!
//! - `JobService` - Public API; owns the worker pool and the actors below
//! - `WorkerActor` - Claims jobs and runs up to `capacity` handlers at once
//! - `SchedulerActor` - Enqueues jobs for due cron schedules
//! - `MonitorActor` - Folds the event stream into metrics and health
//!
//! # Usage
//!
//! ```ignore
//! use jobs_actors::{JobService, ServiceConfig, job_handler};
//! use jobs_core::{CreateJobRequest, JobType, WorkerConfig};
//!
//! let config = ServiceConfig::default().with_worker(WorkerConfig::new(4));
//! let mut service = JobService::in_memory(config);
//! service.register_handler(job_handler!(JobType::HealthCheck, |ctx| {
//!     ctx.report_progress(100).await;
//!     Ok(serde_json::json!({ "ok": true }))
//! }));
//! service.initialize().await?;
//! service.create_job(CreateJobRequest::new(JobType::HealthCheck, serde_json::Value::Null)).await?;
//! ```

mod config;
mod handler;
mod messages;
mod monitor;
mod queue;
mod scheduler;
mod service;
mod worker_actor;

pub use config::{MonitorConfig, ServiceConfig};
pub use handler::{
    FnHandler, HandlerFuture, HandlerResult, JobContext, JobHandler, JobHandlerRegistry,
    ProgressReporter,
};
pub use messages::{MonitorMessage, SchedulerMessage, WorkerMessage};
pub use monitor::{MetricsAggregator, MonitorActor};
pub use queue::JobQueue;
pub use scheduler::{ScheduleBook, SchedulerActor};
pub use service::JobService;
pub use worker_actor::WorkerActor;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort};
