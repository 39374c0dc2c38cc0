//! Message types for actor communication.

use jobs_core::{
    HealthReport, Job, JobEvent, JobId, JobPerformanceStats, JobType, JobsError, MetricsSnapshot,
    Schedule, ScheduleConfig, ScheduleId, SchedulePatch, WorkerInfo,
};
use ractor::RpcReplyPort;

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Claim jobs until the worker is at capacity.
    Poll,

    /// Renew leases and look for cancel requests.
    Heartbeat,

    /// A job task settled its job.
    Finished { job_id: JobId, failed: bool },

    /// Fire the cancellation token of a running job.
    CancelJob { job_id: JobId },

    /// Stop claiming; reply once no job is in flight.
    Drain { reply: RpcReplyPort<()> },

    /// Signal in-flight handlers and stop the worker.
    Stop,

    /// Get worker info.
    GetInfo { reply: RpcReplyPort<WorkerInfo> },
}

/// Messages for the SchedulerActor.
#[derive(Debug)]
pub enum SchedulerMessage {
    /// Enqueue jobs for every due schedule.
    Tick,

    Add {
        config: ScheduleConfig,
        reply: RpcReplyPort<Result<Schedule, JobsError>>,
    },

    Update {
        id: ScheduleId,
        patch: SchedulePatch,
        reply: RpcReplyPort<Result<Schedule, JobsError>>,
    },

    Remove {
        id: ScheduleId,
        reply: RpcReplyPort<bool>,
    },

    Get {
        id: ScheduleId,
        reply: RpcReplyPort<Option<Schedule>>,
    },

    List { reply: RpcReplyPort<Vec<Schedule>> },

    /// Enqueue a job for a schedule now, leaving its next run untouched.
    Trigger {
        id: ScheduleId,
        reply: RpcReplyPort<Result<Job, JobsError>>,
    },
}

/// Messages for the MonitorActor.
#[derive(Debug)]
pub enum MonitorMessage {
    /// An event forwarded from the broadcast channel.
    Event(Box<JobEvent>),

    /// Push a snapshot into the history ring.
    Sample,

    GetMetrics { reply: RpcReplyPort<MetricsSnapshot> },

    GetHistory {
        hours: u32,
        reply: RpcReplyPort<Vec<MetricsSnapshot>>,
    },

    GetHealth { reply: RpcReplyPort<HealthReport> },

    GetPerformance {
        job_type: Option<JobType>,
        reply: RpcReplyPort<Vec<JobPerformanceStats>>,
    },
}
