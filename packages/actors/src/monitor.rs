//! Monitor actor: metrics, history and health from the event stream.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobs_core::{
    ComponentHealth, HealthReport, HealthStatus, JobCounts, JobEvent, JobPerformanceStats,
    JobStore, JobType, MetricsSnapshot, WorkerStatus,
};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::config::MonitorConfig;
use crate::messages::MonitorMessage;

/// Duration samples kept per job type for percentiles.
const TYPE_SAMPLES: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Outcome {
    at: DateTime<Utc>,
    failed: bool,
    duration_ms: u64,
}

#[derive(Debug, Default)]
struct TypeStats {
    completed: u64,
    failed: u64,
    retried: u64,
    durations: VecDeque<u64>,
}

#[derive(Debug, Clone)]
struct Pulse {
    status: WorkerStatus,
    current_load: usize,
    capacity: usize,
    last_seen: DateTime<Utc>,
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted.get(rank.clamp(1, sorted.len()) - 1).copied()
}

fn mean(samples: &[u64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<u64>() as f64 / samples.len() as f64)
    }
}

/// Pure aggregation behind the monitor actor.
#[derive(Debug)]
pub struct MetricsAggregator {
    config: MonitorConfig,
    counts: JobCounts,
    window: VecDeque<Outcome>,
    per_type: HashMap<JobType, TypeStats>,
    workers: HashMap<String, Pulse>,
    history: VecDeque<MetricsSnapshot>,
}

impl MetricsAggregator {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            counts: JobCounts::default(),
            window: VecDeque::new(),
            per_type: HashMap::new(),
            workers: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    pub fn counts(&self) -> JobCounts {
        self.counts
    }

    /// Replace live counters with counts read from the store.
    pub fn resync(&mut self, counts: JobCounts) {
        self.counts = counts;
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - to_chrono(self.config.window)
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let start = self.window_start(now);
        while self.window.front().is_some_and(|o| o.at < start) {
            self.window.pop_front();
        }
    }

    fn finished(&mut self, job_type: &JobType, outcome: Outcome, will_retry: bool) {
        self.window.push_back(outcome);
        let stats = self.per_type.entry(job_type.clone()).or_default();
        if !outcome.failed {
            stats.completed += 1;
            stats.durations.push_back(outcome.duration_ms);
            if stats.durations.len() > TYPE_SAMPLES {
                stats.durations.pop_front();
            }
        } else if will_retry {
            stats.retried += 1;
        } else {
            stats.failed += 1;
        }
    }

    pub fn record(&mut self, event: &JobEvent) {
        match event {
            JobEvent::JobEnqueued { job, .. } => self.counts.increment(job.status),
            JobEvent::JobStatusChanged {
                old_status,
                new_status,
                ..
            } => {
                self.counts.decrement(*old_status);
                self.counts.increment(*new_status);
            }
            JobEvent::JobCompleted {
                job_type,
                duration_ms,
                timestamp,
                ..
            } => {
                let outcome = Outcome {
                    at: *timestamp,
                    failed: false,
                    duration_ms: *duration_ms,
                };
                self.finished(job_type, outcome, false);
            }
            JobEvent::JobFailed {
                job_type,
                will_retry,
                duration_ms,
                timestamp,
                ..
            } => {
                let outcome = Outcome {
                    at: *timestamp,
                    failed: true,
                    duration_ms: *duration_ms,
                };
                self.finished(job_type, outcome, *will_retry);
            }
            JobEvent::WorkerStarted {
                worker_id,
                capacity,
                timestamp,
            } => {
                self.workers.insert(
                    worker_id.clone(),
                    Pulse {
                        status: WorkerStatus::Active,
                        current_load: 0,
                        capacity: *capacity,
                        last_seen: *timestamp,
                    },
                );
            }
            JobEvent::WorkerHeartbeat {
                worker_id,
                status,
                current_load,
                capacity,
                timestamp,
            } => {
                self.workers.insert(
                    worker_id.clone(),
                    Pulse {
                        status: *status,
                        current_load: *current_load,
                        capacity: *capacity,
                        last_seen: *timestamp,
                    },
                );
            }
            JobEvent::WorkerStopped { worker_id, .. } => {
                self.workers.remove(worker_id);
            }
            _ => {}
        }
        self.prune(event.timestamp());
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let start = self.window_start(now);
        let recent: Vec<&Outcome> = self.window.iter().filter(|o| o.at >= start).collect();
        let failures = recent.iter().filter(|o| o.failed).count();
        let mut durations: Vec<u64> = recent
            .iter()
            .filter(|o| !o.failed)
            .map(|o| o.duration_ms)
            .collect();
        durations.sort_unstable();

        let minutes = (self.config.window.as_secs_f64() / 60.0).max(1.0 / 60.0);
        let error_rate = if recent.is_empty() {
            0.0
        } else {
            failures as f64 / recent.len() as f64
        };

        MetricsSnapshot {
            timestamp: now,
            counts: self.counts,
            throughput_per_min: durations.len() as f64 / minutes,
            error_rate,
            avg_processing_ms: mean(&durations),
            p50_processing_ms: percentile(&durations, 0.50),
            p95_processing_ms: percentile(&durations, 0.95),
            active_workers: self
                .workers
                .values()
                .filter(|p| p.status == WorkerStatus::Active)
                .count(),
            total_capacity: self.workers.values().map(|p| p.capacity).sum(),
            current_load: self.workers.values().map(|p| p.current_load).sum(),
        }
    }

    /// Push a snapshot into the history ring.
    pub fn sample(&mut self, now: DateTime<Utc>) -> MetricsSnapshot {
        self.prune(now);
        let snapshot = self.snapshot(now);
        self.history.push_back(snapshot.clone());
        while self.history.len() > self.config.history_capacity() {
            self.history.pop_front();
        }
        snapshot
    }

    /// Snapshots from the last `hours`, oldest first.
    pub fn history(&self, hours: u32, now: DateTime<Utc>) -> Vec<MetricsSnapshot> {
        let since = now - chrono::Duration::hours(i64::from(hours));
        self.history
            .iter()
            .filter(|s| s.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn health(&self, now: DateTime<Utc>) -> HealthReport {
        let snapshot = self.snapshot(now);
        let config = &self.config;

        let depth = snapshot.counts.queue_depth();
        let queue = if depth > config.queue_unhealthy {
            ComponentHealth::new("queue", HealthStatus::Unhealthy, format!("{depth} jobs waiting"))
        } else if depth > config.queue_degraded {
            ComponentHealth::new("queue", HealthStatus::Degraded, format!("{depth} jobs waiting"))
        } else {
            ComponentHealth::new("queue", HealthStatus::Healthy, format!("{depth} jobs waiting"))
        };

        let stale_before = now - to_chrono(config.heartbeat_stale);
        let total = self.workers.len();
        let fresh = self
            .workers
            .values()
            .filter(|p| p.last_seen >= stale_before)
            .count();
        let workers = if total == 0 {
            ComponentHealth::new("workers", HealthStatus::Unhealthy, "no workers registered")
        } else if fresh == 0 {
            ComponentHealth::new(
                "workers",
                HealthStatus::Unhealthy,
                format!("all {total} workers are stale"),
            )
        } else if fresh < total {
            ComponentHealth::new(
                "workers",
                HealthStatus::Degraded,
                format!("{} of {total} workers are stale", total - fresh),
            )
        } else {
            ComponentHealth::new(
                "workers",
                HealthStatus::Healthy,
                format!("{total} workers reporting"),
            )
        };

        let rate = snapshot.error_rate;
        let message = format!("error rate {:.1}%", rate * 100.0);
        let errors = if rate > config.error_rate_unhealthy {
            ComponentHealth::new("errors", HealthStatus::Unhealthy, message)
        } else if rate > config.error_rate_degraded {
            ComponentHealth::new("errors", HealthStatus::Degraded, message)
        } else {
            ComponentHealth::new("errors", HealthStatus::Healthy, message)
        };

        HealthReport::new(vec![queue, workers, errors], snapshot)
    }

    /// Cumulative stats for one type, or every type seen so far.
    pub fn performance(&self, job_type: Option<&JobType>) -> Vec<JobPerformanceStats> {
        let build = |job_type: &JobType, stats: &TypeStats| {
            let mut sorted: Vec<u64> = stats.durations.iter().copied().collect();
            sorted.sort_unstable();
            JobPerformanceStats {
                job_type: job_type.clone(),
                completed: stats.completed,
                failed: stats.failed,
                retried: stats.retried,
                avg_duration_ms: mean(&sorted),
                p95_duration_ms: percentile(&sorted, 0.95),
            }
        };

        match job_type {
            Some(job_type) => vec![match self.per_type.get(job_type) {
                Some(stats) => build(job_type, stats),
                None => JobPerformanceStats::new(job_type.clone()),
            }],
            None => {
                let mut all: Vec<JobPerformanceStats> = self
                    .per_type
                    .iter()
                    .map(|(job_type, stats)| build(job_type, stats))
                    .collect();
                all.sort_by(|a, b| a.job_type.cmp(&b.job_type));
                all
            }
        }
    }
}

/// State for the monitor actor.
pub struct MonitorState {
    aggregator: MetricsAggregator,
    store: Arc<dyn JobStore>,
}

impl MonitorState {
    /// Best effort: a failing store leaves the live counters in place.
    async fn resync(&mut self) {
        match self.store.count_by_status().await {
            Ok(counts) => self.aggregator.resync(JobCounts::from_map(&counts)),
            Err(e) => tracing::warn!("Monitor could not read job counts: {}", e),
        }
    }
}

/// Monitor actor arguments.
pub struct MonitorArgs {
    pub config: MonitorConfig,
    pub store: Arc<dyn JobStore>,
    pub events: broadcast::Sender<JobEvent>,
}

/// Read-only observer of the event stream.
pub struct MonitorActor;

impl Actor for MonitorActor {
    type Msg = MonitorMessage;
    type State = MonitorState;
    type Arguments = MonitorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting job monitor");

        // Subscribe before reading counts so no transition falls in between.
        let mut events = args.events.subscribe();
        let sample_interval = args.config.sample_interval;
        let mut state = MonitorState {
            aggregator: MetricsAggregator::new(args.config),
            store: args.store,
        };
        state.resync().await;

        let forward_to = myself.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        tracing::trace!("{}", event.description());
                        if forward_to
                            .send_message(MonitorMessage::Event(Box::new(event)))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Monitor lagged behind, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let myself_clone = myself.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sample_interval).await;
                if myself_clone.send_message(MonitorMessage::Sample).is_err() {
                    break;
                }
            }
        });

        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            MonitorMessage::Event(event) => state.aggregator.record(&event),

            MonitorMessage::Sample => {
                state.resync().await;
                let snapshot = state.aggregator.sample(Utc::now());
                tracing::debug!(
                    "Metrics: {} waiting, {} running, {:.2} jobs/min, error rate {:.2}",
                    snapshot.counts.queue_depth(),
                    snapshot.counts.running,
                    snapshot.throughput_per_min,
                    snapshot.error_rate
                );
            }

            MonitorMessage::GetMetrics { reply } => {
                state.resync().await;
                let _ = reply.send(state.aggregator.snapshot(Utc::now()));
            }

            MonitorMessage::GetHistory { hours, reply } => {
                let _ = reply.send(state.aggregator.history(hours, Utc::now()));
            }

            MonitorMessage::GetHealth { reply } => {
                state.resync().await;
                let _ = reply.send(state.aggregator.health(Utc::now()));
            }

            MonitorMessage::GetPerformance { job_type, reply } => {
                let _ = reply.send(state.aggregator.performance(job_type.as_ref()));
            }
        }

        Ok(())
    }
}
