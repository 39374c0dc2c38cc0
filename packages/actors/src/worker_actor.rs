//! Worker actor for executing jobs.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use jobs_core::{
    ErrorClass, Job, JobError, JobEvent, JobId, JobType, WorkerInfo, WorkerStatus,
};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::handler::{JobContext, JobHandlerRegistry, ProgressReporter};
use crate::messages::WorkerMessage;
use crate::queue::JobQueue;

/// How long a stopped worker waits for signalled handlers to hand their
/// jobs back before abandoning them to lease expiry.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A job task owned by the worker.
struct RunningJob {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// State for the worker actor.
pub struct WorkerActorState {
    info: WorkerInfo,
    /// Supported types that also have a registered handler.
    claim_types: Vec<JobType>,
    queue: JobQueue,
    handlers: Arc<JobHandlerRegistry>,
    settings: Arc<ServiceConfig>,
    running: HashMap<JobId, RunningJob>,
    /// Parent of every job token; fired when the worker stops.
    shutdown: CancellationToken,
    drain_waiters: Vec<RpcReplyPort<()>>,
}

impl WorkerActorState {
    fn has_free_slot(&self) -> bool {
        self.running.len() < self.info.capacity
    }

    fn is_idle(&self) -> bool {
        self.running.is_empty()
    }

    fn snapshot(&self) -> WorkerInfo {
        let mut info = self.info.clone();
        info.current_load = self.running.len();
        info.running_jobs = self.running.keys().copied().collect();
        info.running_jobs.sort();
        info
    }

    fn publish_heartbeat(&self) {
        self.queue.publish(JobEvent::WorkerHeartbeat {
            worker_id: self.info.id.clone(),
            status: self.info.status,
            current_load: self.running.len(),
            capacity: self.info.capacity,
            timestamp: Utc::now(),
        });
    }

    fn answer_drain_waiters(&mut self) {
        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Spawn the task that runs `job` and reports back with `Finished`.
    fn start(&mut self, job: Job, myself: &ActorRef<WorkerMessage>) {
        let cancel = self.shutdown.child_token();
        let run = JobRun {
            queue: self.queue.clone(),
            handlers: self.handlers.clone(),
            settings: self.settings.clone(),
            worker_id: self.info.id.clone(),
            shutdown: self.shutdown.clone(),
            cancel: cancel.clone(),
        };
        let job_id = job.id;
        let myself = myself.clone();
        let task = tokio::spawn(async move {
            let failed = run.execute(job).await;
            // The worker may already be gone after a forced stop.
            let _ = myself.send_message(WorkerMessage::Finished { job_id, failed });
        });
        self.running.insert(job_id, RunningJob { cancel, task });
    }
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub id: String,
    pub capacity: usize,
    pub claim_types: Vec<JobType>,
    pub queue: JobQueue,
    pub handlers: Arc<JobHandlerRegistry>,
    pub settings: Arc<ServiceConfig>,
}

/// How a handler invocation ended.
enum Outcome {
    Completed(serde_json::Value),
    Failed(JobError),
    Cancelled,
}

/// Everything a job task needs once it leaves the actor.
struct JobRun {
    queue: JobQueue,
    handlers: Arc<JobHandlerRegistry>,
    settings: Arc<ServiceConfig>,
    worker_id: String,
    shutdown: CancellationToken,
    cancel: CancellationToken,
}

impl JobRun {
    /// Run the handler and settle the job. Returns true when the attempt failed.
    async fn execute(self, job: Job) -> bool {
        let outcome = self.invoke(&job).await;
        let failed = matches!(outcome, Outcome::Failed(_));

        let settled = match outcome {
            Outcome::Completed(result) => self.queue.complete(&job, &self.worker_id, result).await,
            _ if self.shutdown.is_cancelled() => self.queue.release(&job, &self.worker_id).await,
            Outcome::Cancelled => self.queue.settle_cancelled(&job, &self.worker_id).await,
            Outcome::Failed(error) => self.queue.fail(&job, &self.worker_id, error).await,
        };
        if let Err(e) = settled {
            tracing::warn!(
                "Worker {} could not settle job {}: {}",
                self.worker_id,
                job.id,
                e
            );
        }
        failed
    }

    async fn invoke(&self, job: &Job) -> Outcome {
        let Some(handler) = self.handlers.get(&job.job_type) else {
            return Outcome::Failed(JobError::new(
                format!("No handler for job type: {}", job.job_type),
                ErrorClass::NonRetryable,
            ));
        };

        let ctx = JobContext {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: job.attempts,
            correlation_id: job.correlation_id.clone(),
            payload: job.payload.clone(),
            progress: ProgressReporter::new(job.id, self.queue.clone(), self.worker_id.clone()),
            cancel: self.cancel.clone(),
        };
        let timeout = self.settings.timeout_for(&job.job_type);

        tracing::debug!("Running job {} (attempt {})", job.id, job.attempts);
        let execution = AssertUnwindSafe(handler.handle(ctx)).catch_unwind();
        match tokio::time::timeout(timeout, execution).await {
            Ok(Ok(Ok(result))) => Outcome::Completed(result),
            Ok(Ok(Err(e))) if e.class == ErrorClass::Cancelled => Outcome::Cancelled,
            Ok(Ok(Err(e))) => Outcome::Failed(JobError::new(e.message, e.class)),
            Ok(Err(panic)) => {
                let message = panic_message(&*panic);
                tracing::error!("Job {} panicked: {}", job.id, message);
                Outcome::Failed(JobError::new(
                    format!("Panic: {message}"),
                    ErrorClass::Retryable,
                ))
            }
            Err(_) => {
                self.cancel.cancel();
                Outcome::Failed(JobError::new(
                    format!("Job timed out after {timeout:?}"),
                    ErrorClass::Timeout,
                ))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawn a loop that sends `message` every `interval` until the actor is gone.
fn spawn_timer(
    myself: &ActorRef<WorkerMessage>,
    interval: Duration,
    message: fn() -> WorkerMessage,
) {
    let myself = myself.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if myself.send_message(message()).is_err() {
                break;
            }
        }
    });
}

/// Worker actor that claims jobs and runs up to `capacity` of them at once.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting worker: {} (capacity {}, types {:?})",
            args.id,
            args.capacity,
            args.claim_types
        );

        let now = Utc::now();
        let state = WorkerActorState {
            info: WorkerInfo {
                id: args.id,
                capacity: args.capacity,
                supported_types: args.claim_types.clone(),
                status: WorkerStatus::Active,
                current_load: 0,
                running_jobs: Vec::new(),
                last_heartbeat: now,
                processed_count: 0,
                failed_count: 0,
                started_at: now,
            },
            claim_types: args.claim_types,
            queue: args.queue,
            handlers: args.handlers,
            running: HashMap::new(),
            shutdown: CancellationToken::new(),
            drain_waiters: Vec::new(),
            settings: args.settings,
        };

        spawn_timer(&myself, state.settings.poll_interval, || WorkerMessage::Poll);
        spawn_timer(&myself, state.settings.heartbeat_interval, || {
            WorkerMessage::Heartbeat
        });
        myself.send_message(WorkerMessage::Poll)?;

        state.queue.publish(JobEvent::WorkerStarted {
            worker_id: state.info.id.clone(),
            capacity: state.info.capacity,
            timestamp: now,
        });
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                while state.info.status == WorkerStatus::Active && state.has_free_slot() {
                    let free = state.info.capacity - state.running.len();
                    match state
                        .queue
                        .claim(&state.info.id, &state.claim_types, free)
                        .await
                    {
                        Ok(Some(job)) => state.start(job, &myself),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("Worker {} failed to claim: {}", state.info.id, e);
                            break;
                        }
                    }
                }
            }

            WorkerMessage::Heartbeat => {
                for (job_id, running) in &state.running {
                    match state.queue.renew(*job_id, &state.info.id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(
                                "Worker {} lost the lease on job {}",
                                state.info.id,
                                job_id
                            );
                            running.cancel.cancel();
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!("Lease renewal for job {} failed: {}", job_id, e);
                        }
                    }
                    if let Ok(Some(job)) = state.queue.find(*job_id).await
                        && job.cancel_requested
                    {
                        running.cancel.cancel();
                    }
                }
                state.info.last_heartbeat = Utc::now();
                state.publish_heartbeat();
            }

            WorkerMessage::Finished { job_id, failed } => {
                state.running.remove(&job_id);
                state.info.processed_count += 1;
                if failed {
                    state.info.failed_count += 1;
                }
                match state.info.status {
                    WorkerStatus::Draining if state.is_idle() => {
                        tracing::info!("Worker {} drained", state.info.id);
                        state.answer_drain_waiters();
                    }
                    WorkerStatus::Active => myself.send_message(WorkerMessage::Poll)?,
                    _ => {}
                }
            }

            WorkerMessage::CancelJob { job_id } => {
                if let Some(running) = state.running.get(&job_id) {
                    tracing::debug!("Worker {} signalling job {}", state.info.id, job_id);
                    running.cancel.cancel();
                }
            }

            WorkerMessage::Drain { reply } => {
                if state.info.status == WorkerStatus::Active {
                    tracing::info!(
                        "Draining worker {} ({} in flight)",
                        state.info.id,
                        state.running.len()
                    );
                    state.info.status = WorkerStatus::Draining;
                }
                state.drain_waiters.push(reply);
                if state.is_idle() {
                    state.answer_drain_waiters();
                }
            }

            WorkerMessage::Stop => {
                tracing::info!("Stopping worker: {}", state.info.id);
                state.info.status = WorkerStatus::Stopped;
                state.shutdown.cancel();

                let (aborts, tasks): (Vec<AbortHandle>, Vec<JoinHandle<()>>) = state
                    .running
                    .drain()
                    .map(|(_, running)| (running.task.abort_handle(), running.task))
                    .unzip();
                if !tasks.is_empty()
                    && tokio::time::timeout(STOP_GRACE, futures_util::future::join_all(tasks))
                        .await
                        .is_err()
                {
                    tracing::warn!(
                        "Worker {} abandoned {} jobs to lease expiry",
                        state.info.id,
                        aborts.len()
                    );
                    for abort in aborts {
                        abort.abort();
                    }
                }
                state.answer_drain_waiters();
                myself.stop(None);
            }

            WorkerMessage::GetInfo { reply } => {
                let _ = reply.send(state.snapshot());
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.shutdown.cancel();
        state.queue.publish(JobEvent::WorkerStopped {
            worker_id: state.info.id.clone(),
            timestamp: Utc::now(),
        });
        tracing::info!(
            "Worker {} stopped after {} jobs ({} failed)",
            state.info.id,
            state.info.processed_count,
            state.info.failed_count
        );
        Ok(())
    }
}
