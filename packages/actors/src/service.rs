//! The job service: composition root and public API of the job system.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use jobs_core::{
    CancelOutcome, ComponentHealth, CreateJobRequest, HealthReport, HealthStatus, Job, JobEvent,
    JobFilter, JobId, JobPerformanceStats, JobStore, JobType, JobsError, MetricsSnapshot,
    Schedule, ScheduleConfig, ScheduleId, SchedulePatch, WorkerConfig, WorkerInfo,
};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorRef, ActorStatus, Message, RpcReplyPort};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::handler::{JobHandler, JobHandlerRegistry};
use crate::messages::{MonitorMessage, SchedulerMessage, WorkerMessage};
use crate::monitor::{MonitorActor, MonitorArgs};
use crate::queue::JobQueue;
use crate::scheduler::{ScheduleBook, SchedulerActor, SchedulerArgs};
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// Upper bound on any request/reply exchange with an actor.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

async fn call<M, T>(
    actor: &ActorRef<M>,
    build: impl FnOnce(RpcReplyPort<T>) -> M,
    timeout: Duration,
) -> Result<T, JobsError>
where
    M: Message,
    T: Send + 'static,
{
    match ractor::rpc::call(actor, build, Some(timeout)).await {
        Ok(CallResult::Success(value)) => Ok(value),
        Ok(CallResult::Timeout) => Err(JobsError::Actor(format!(
            "actor did not reply within {timeout:?}"
        ))),
        Ok(CallResult::SenderError) => Err(JobsError::Actor("actor dropped the reply".into())),
        Err(e) => Err(JobsError::Actor(e.to_string())),
    }
}

fn spawn_error(e: ractor::SpawnErr) -> JobsError {
    JobsError::Actor(format!("Failed to spawn actor: {e}"))
}

struct WorkerEntry {
    actor: ActorRef<WorkerMessage>,
    handle: JoinHandle<()>,
}

impl WorkerEntry {
    /// Ask the worker to stop claiming and wait until it is idle.
    async fn drain(&self, timeout: Duration) -> bool {
        matches!(
            ractor::rpc::call(&self.actor, |reply| WorkerMessage::Drain { reply }, Some(timeout))
                .await,
            Ok(CallResult::Success(()))
        )
    }

    /// Signal in-flight handlers and wait for the actor to exit.
    async fn stop(self) {
        if self.actor.send_message(WorkerMessage::Stop).is_err() {
            tracing::debug!("Worker {} already stopped", self.actor.get_id());
        }
        let _ = self.handle.await;
    }
}

/// Actors that only exist between `initialize` and `shutdown`.
struct Runtime {
    scheduler: ActorRef<SchedulerMessage>,
    scheduler_handle: JoinHandle<()>,
    monitor: ActorRef<MonitorMessage>,
    monitor_handle: JoinHandle<()>,
}

/// Entry point of the job system.
///
/// Job operations go straight to the store and work at any time. Worker,
/// schedule and monitoring operations need the actors started by
/// [`JobService::initialize`] and fail with [`JobsError::NotInitialized`]
/// before it.
pub struct JobService {
    config: Arc<ServiceConfig>,
    queue: JobQueue,
    handlers: Arc<JobHandlerRegistry>,
    workers: RwLock<HashMap<String, WorkerEntry>>,
    runtime: Mutex<Option<Runtime>>,
    worker_seq: AtomicU64,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, config: ServiceConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let queue = JobQueue::new(store, events, &config);
        Self {
            config: Arc::new(config),
            queue,
            handlers: Arc::new(JobHandlerRegistry::new()),
            workers: RwLock::new(HashMap::new()),
            runtime: Mutex::new(None),
            worker_seq: AtomicU64::new(0),
        }
    }

    /// A service over a fresh in-memory store.
    pub fn in_memory(config: ServiceConfig) -> Self {
        Self::new(Arc::new(jobs_db::MemoryJobStore::new()), config)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.queue.store()
    }

    /// The queue behind the job operations, for handlers that manage jobs.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Register a handler. Workers started afterwards can claim its type.
    pub fn register_handler<H: JobHandler>(&mut self, handler: H) {
        Arc::make_mut(&mut self.handlers).register(handler);
    }

    pub fn handlers(&self) -> &JobHandlerRegistry {
        &self.handlers
    }

    /// Receiver over every job, worker and schedule event.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.queue.subscribe()
    }

    pub async fn is_initialized(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    // ---- lifecycle ----

    /// Recover abandoned leases and start the monitor, the scheduler and the
    /// configured workers. Calling it again is a no-op.
    pub async fn initialize(&self) -> Result<(), JobsError> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }
        tracing::info!("Initializing job service");

        let mut explicit_ids = HashSet::new();
        for worker in &self.config.workers {
            self.claim_types_for(worker)?;
            if let Some(id) = &worker.id
                && !explicit_ids.insert(id.as_str())
            {
                return Err(JobsError::conflict(format!("worker '{id}' configured twice")));
            }
        }

        let recovered = self.queue.recover_expired().await?;
        if recovered > 0 {
            tracing::info!("Recovered {} jobs with abandoned leases", recovered);
        }

        let mut book = ScheduleBook::new();
        let now = Utc::now();
        for schedule in &self.config.schedules {
            book.add(schedule.clone(), now)?;
        }

        let (monitor, monitor_handle) = Actor::spawn(
            None,
            MonitorActor,
            MonitorArgs {
                config: self.config.monitor.clone(),
                store: self.queue.store().clone(),
                events: self.queue.events(),
            },
        )
        .await
        .map_err(spawn_error)?;

        let scheduler = Actor::spawn(
            None,
            SchedulerActor,
            SchedulerArgs {
                book,
                queue: self.queue.clone(),
                settings: self.config.clone(),
            },
        )
        .await;
        let (scheduler, scheduler_handle) = match scheduler {
            Ok(spawned) => spawned,
            Err(e) => {
                monitor.stop(None);
                let _ = monitor_handle.await;
                return Err(spawn_error(e));
            }
        };

        let mut started = Vec::with_capacity(self.config.workers.len());
        for worker in &self.config.workers {
            match self.spawn_worker(worker.clone()).await {
                Ok(id) => started.push(id),
                Err(e) => {
                    tracing::error!("Failed to start configured worker: {}", e);
                    let entries: Vec<WorkerEntry> = {
                        let mut workers = self.workers.write().await;
                        started.iter().filter_map(|id| workers.remove(id)).collect()
                    };
                    futures_util::future::join_all(entries.into_iter().map(WorkerEntry::stop))
                        .await;
                    scheduler.stop(None);
                    let _ = scheduler_handle.await;
                    monitor.stop(None);
                    let _ = monitor_handle.await;
                    return Err(e);
                }
            }
        }

        *runtime = Some(Runtime {
            scheduler,
            scheduler_handle,
            monitor,
            monitor_handle,
        });
        tracing::info!(
            "Job service initialized with {} workers and {} schedules",
            self.config.workers.len(),
            self.config.schedules.len()
        );
        Ok(())
    }

    /// Stop the scheduler, drain every worker within the grace period, then
    /// stop the monitor. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), JobsError> {
        let mut runtime = self.runtime.lock().await;
        let Some(rt) = runtime.take() else {
            return Ok(());
        };
        tracing::info!("Shutting down job service");

        rt.scheduler.stop(None);
        let _ = rt.scheduler_handle.await;

        let workers: Vec<(String, WorkerEntry)> = self.workers.write().await.drain().collect();
        let grace = self.config.shutdown_grace;
        let drained =
            futures_util::future::join_all(workers.iter().map(|(_, entry)| entry.drain(grace)))
                .await;
        for ((id, _), clean) in workers.iter().zip(&drained) {
            if !clean {
                tracing::warn!("Worker {} did not drain within {:?}, forcing stop", id, grace);
            }
        }
        futures_util::future::join_all(workers.into_iter().map(|(_, entry)| entry.stop())).await;

        rt.monitor.stop(None);
        let _ = rt.monitor_handle.await;

        tracing::info!("Job service shut down");
        Ok(())
    }

    async fn scheduler(&self) -> Result<ActorRef<SchedulerMessage>, JobsError> {
        self.runtime
            .lock()
            .await
            .as_ref()
            .map(|rt| rt.scheduler.clone())
            .ok_or(JobsError::NotInitialized)
    }

    async fn monitor(&self) -> Result<ActorRef<MonitorMessage>, JobsError> {
        self.runtime
            .lock()
            .await
            .as_ref()
            .map(|rt| rt.monitor.clone())
            .ok_or(JobsError::NotInitialized)
    }

    // ---- jobs ----

    /// Validate the payload against the type and persist a pending job.
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<Job, JobsError> {
        let job = request.into_job(self.config.default_max_retries)?;
        self.queue.enqueue(job).await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobsError> {
        self.queue.find(job_id).await
    }

    /// Jobs matching `filter`, newest first.
    pub async fn query_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, JobsError> {
        Ok(self.queue.store().query(filter).await?)
    }

    /// Cancel a job. Queued jobs are cancelled at once; running ones are
    /// flagged and their handler's token fires. `false` when the job had
    /// already finished.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool, JobsError> {
        match self.queue.cancel(job_id).await? {
            None => Err(JobsError::not_found("Job", job_id)),
            Some(CancelOutcome::AlreadyTerminal(_)) => Ok(false),
            Some(CancelOutcome::Cancelled(_)) => Ok(true),
            Some(CancelOutcome::Requested(job)) => {
                if let Some(worker_id) = &job.worker_id
                    && let Some(entry) = self.workers.read().await.get(worker_id)
                {
                    // Remote holders see the flag on their next heartbeat.
                    let _ = entry.actor.send_message(WorkerMessage::CancelJob { job_id });
                }
                Ok(true)
            }
        }
    }

    /// Re-arm a failed job. `false` unless the job is `Failed`.
    pub async fn retry_job(&self, job_id: JobId, force_reset: bool) -> Result<bool, JobsError> {
        Ok(self.queue.rearm(job_id, force_reset).await?.is_some())
    }

    /// Delete finished jobs older than `older_than`.
    pub async fn purge_jobs(&self, older_than: Duration) -> Result<u64, JobsError> {
        self.queue.purge_older_than(older_than).await
    }

    // ---- workers ----

    /// Types a worker built from `config` would claim, sorted.
    fn claim_types_for(&self, config: &WorkerConfig) -> Result<Vec<JobType>, JobsError> {
        if config.capacity == 0 {
            return Err(JobsError::validation("worker capacity must be at least 1"));
        }

        let mut claim_types: Vec<JobType> = if config.supported_types.is_empty() {
            self.handlers.job_types()
        } else {
            config
                .supported_types
                .iter()
                .filter(|t| self.handlers.has_handler(t))
                .cloned()
                .collect()
        };
        claim_types.sort();
        claim_types.dedup();
        if claim_types.is_empty() {
            return Err(JobsError::validation(
                "worker supports no job type with a registered handler",
            ));
        }
        Ok(claim_types)
    }

    async fn spawn_worker(&self, config: WorkerConfig) -> Result<String, JobsError> {
        let claim_types = self.claim_types_for(&config)?;

        let mut workers = self.workers.write().await;
        let id = match config.id {
            Some(id) if workers.contains_key(&id) => {
                return Err(JobsError::conflict(format!("worker '{id}' already exists")));
            }
            Some(id) => id,
            None => loop {
                let n = self.worker_seq.fetch_add(1, Ordering::SeqCst) + 1;
                let candidate = format!("worker-{n}");
                if !workers.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let (actor, handle) = Actor::spawn(
            None,
            WorkerActor,
            WorkerArgs {
                id: id.clone(),
                capacity: config.capacity,
                claim_types,
                queue: self.queue.clone(),
                handlers: self.handlers.clone(),
                settings: self.config.clone(),
            },
        )
        .await
        .map_err(spawn_error)?;
        workers.insert(id.clone(), WorkerEntry { actor, handle });
        Ok(id)
    }

    /// Start a worker. It claims the intersection of its supported types
    /// (all types when empty) and the registered handler types.
    pub async fn add_worker(&self, config: WorkerConfig) -> Result<String, JobsError> {
        let runtime = self.runtime.lock().await;
        if runtime.is_none() {
            return Err(JobsError::NotInitialized);
        }
        self.spawn_worker(config).await
    }

    /// Stop a worker. A graceful removal first waits up to the drain timeout
    /// for in-flight jobs to settle. Returns `true` only when it drained.
    pub async fn remove_worker(&self, worker_id: &str, graceful: bool) -> Result<bool, JobsError> {
        if !self.is_initialized().await {
            return Err(JobsError::NotInitialized);
        }
        let entry = self
            .workers
            .write()
            .await
            .remove(worker_id)
            .ok_or_else(|| JobsError::not_found("Worker", worker_id))?;

        let drained = graceful && entry.drain(self.config.drain_timeout).await;
        if graceful && !drained {
            tracing::warn!(
                "Worker {} did not drain within {:?}, forcing stop",
                worker_id,
                self.config.drain_timeout
            );
        }
        entry.stop().await;
        tracing::info!("Removed worker {}", worker_id);
        Ok(drained)
    }

    /// Current view of every worker, sorted by id.
    pub async fn get_worker_statuses(&self) -> Result<Vec<WorkerInfo>, JobsError> {
        if !self.is_initialized().await {
            return Err(JobsError::NotInitialized);
        }
        let workers = self.workers.read().await;
        let mut infos = Vec::with_capacity(workers.len());
        for (id, entry) in workers.iter() {
            match call(&entry.actor, |reply| WorkerMessage::GetInfo { reply }, RPC_TIMEOUT).await {
                Ok(info) => infos.push(info),
                Err(e) => tracing::warn!("Worker {} did not report: {}", id, e),
            }
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    // ---- schedules ----

    pub async fn add_schedule(&self, config: ScheduleConfig) -> Result<Schedule, JobsError> {
        let scheduler = self.scheduler().await?;
        call(
            &scheduler,
            |reply| SchedulerMessage::Add { config, reply },
            RPC_TIMEOUT,
        )
        .await?
    }

    pub async fn update_schedule(
        &self,
        id: ScheduleId,
        patch: SchedulePatch,
    ) -> Result<Schedule, JobsError> {
        let scheduler = self.scheduler().await?;
        call(
            &scheduler,
            |reply| SchedulerMessage::Update { id, patch, reply },
            RPC_TIMEOUT,
        )
        .await?
    }

    pub async fn remove_schedule(&self, id: ScheduleId) -> Result<bool, JobsError> {
        let scheduler = self.scheduler().await?;
        call(
            &scheduler,
            |reply| SchedulerMessage::Remove { id, reply },
            RPC_TIMEOUT,
        )
        .await
    }

    pub async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, JobsError> {
        let scheduler = self.scheduler().await?;
        call(
            &scheduler,
            |reply| SchedulerMessage::Get { id, reply },
            RPC_TIMEOUT,
        )
        .await
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>, JobsError> {
        let scheduler = self.scheduler().await?;
        call(&scheduler, |reply| SchedulerMessage::List { reply }, RPC_TIMEOUT).await
    }

    /// Enqueue a job for a schedule now, enabled or not.
    pub async fn trigger_schedule(&self, id: ScheduleId) -> Result<Job, JobsError> {
        let scheduler = self.scheduler().await?;
        call(
            &scheduler,
            |reply| SchedulerMessage::Trigger { id, reply },
            RPC_TIMEOUT,
        )
        .await?
    }

    // ---- monitoring ----

    pub async fn get_metrics(&self) -> Result<MetricsSnapshot, JobsError> {
        let monitor = self.monitor().await?;
        call(&monitor, |reply| MonitorMessage::GetMetrics { reply }, RPC_TIMEOUT).await
    }

    /// Sampled snapshots from the last `hours`, oldest first.
    pub async fn get_metrics_history(&self, hours: u32) -> Result<Vec<MetricsSnapshot>, JobsError> {
        let monitor = self.monitor().await?;
        call(
            &monitor,
            |reply| MonitorMessage::GetHistory { hours, reply },
            RPC_TIMEOUT,
        )
        .await
    }

    pub async fn get_health_check(&self) -> Result<HealthReport, JobsError> {
        let monitor = self.monitor().await?;
        let scheduler = self.scheduler().await?;
        let report = call(
            &monitor,
            |reply| MonitorMessage::GetHealth { reply },
            RPC_TIMEOUT,
        )
        .await?;

        let component = match scheduler.get_status() {
            ActorStatus::Running => {
                match call(&scheduler, |reply| SchedulerMessage::List { reply }, RPC_TIMEOUT).await
                {
                    Ok(schedules) => {
                        let enabled = schedules.iter().filter(|s| s.enabled).count();
                        ComponentHealth::new(
                            "scheduler",
                            HealthStatus::Healthy,
                            format!("{} schedules, {} enabled", schedules.len(), enabled),
                        )
                    }
                    Err(e) => {
                        ComponentHealth::new("scheduler", HealthStatus::Unhealthy, e.to_string())
                    }
                }
            }
            status => ComponentHealth::new(
                "scheduler",
                HealthStatus::Unhealthy,
                format!("scheduler is {status:?}"),
            ),
        };
        Ok(report.with_component(component))
    }

    /// Per-type execution statistics; every type seen so far when `None`.
    pub async fn get_job_performance_stats(
        &self,
        job_type: Option<JobType>,
    ) -> Result<Vec<JobPerformanceStats>, JobsError> {
        let monitor = self.monitor().await?;
        call(
            &monitor,
            |reply| MonitorMessage::GetPerformance { job_type, reply },
            RPC_TIMEOUT,
        )
        .await
    }
}
