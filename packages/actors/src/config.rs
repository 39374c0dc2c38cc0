//! Service configuration.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use jobs_core::{JobType, JobsError, RetryPolicy, ScheduleConfig, WorkerConfig};

/// Monitor sampling and health thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Sliding window for throughput, error rate and percentiles.
    pub window: Duration,
    /// How often a snapshot is pushed into the history ring.
    pub sample_interval: Duration,
    /// How much history the ring keeps.
    pub retention: Duration,
    pub queue_degraded: u64,
    pub queue_unhealthy: u64,
    /// Heartbeats older than this count as stale.
    pub heartbeat_stale: Duration,
    pub error_rate_degraded: f64,
    pub error_rate_unhealthy: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5 * 60),
            sample_interval: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 60 * 60),
            queue_degraded: 100,
            queue_unhealthy: 1000,
            heartbeat_stale: Duration::from_secs(30),
            error_rate_degraded: 0.1,
            error_rate_unhealthy: 0.5,
        }
    }
}

impl MonitorConfig {
    /// Number of snapshots the history ring holds.
    pub fn history_capacity(&self) -> usize {
        let interval = self.sample_interval.as_secs().max(1);
        (self.retention.as_secs() / interval).max(1) as usize
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_heartbeat_stale(mut self, stale: Duration) -> Self {
        self.heartbeat_stale = stale;
        self
    }
}

/// Configuration for the job service and its actors.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// How long a claim stays valid without a heartbeat.
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// Idle wait between claim attempts.
    pub poll_interval: Duration,
    pub default_job_timeout: Duration,
    /// Per-type overrides of `default_job_timeout`.
    pub job_timeouts: HashMap<JobType, Duration>,
    pub retry: RetryPolicy,
    pub default_max_retries: u32,
    /// How long a graceful `remove_worker` waits for in-flight jobs.
    pub drain_timeout: Duration,
    /// How long `shutdown` waits for workers to drain.
    pub shutdown_grace: Duration,
    pub scheduler_tick: Duration,
    /// Jobs eligible for longer than this are claimed one tier higher.
    pub aging_threshold: Option<Duration>,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Workers started by `initialize`.
    pub workers: Vec<WorkerConfig>,
    /// Schedules registered by `initialize`.
    pub schedules: Vec<ScheduleConfig>,
    pub monitor: MonitorConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            default_job_timeout: Duration::from_secs(30 * 60),
            job_timeouts: HashMap::new(),
            retry: RetryPolicy::default(),
            default_max_retries: jobs_core::DEFAULT_MAX_RETRIES,
            drain_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            scheduler_tick: Duration::from_secs(1),
            aging_threshold: None,
            event_capacity: 1024,
            workers: Vec::new(),
            schedules: Vec::new(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Execution timeout for jobs of `job_type`.
    pub fn timeout_for(&self, job_type: &JobType) -> Duration {
        self.job_timeouts
            .get(job_type)
            .copied()
            .unwrap_or(self.default_job_timeout)
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_default_job_timeout(mut self, timeout: Duration) -> Self {
        self.default_job_timeout = timeout;
        self
    }

    pub fn with_job_timeout(mut self, job_type: JobType, timeout: Duration) -> Self {
        self.job_timeouts.insert(job_type, timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick;
        self
    }

    pub fn with_aging_threshold(mut self, threshold: Duration) -> Self {
        self.aging_threshold = Some(threshold);
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.schedules.push(schedule);
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Load overrides from `JOBS_*` environment variables.
    pub fn from_env() -> Result<Self, JobsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load overrides through `lookup`, starting from the defaults.
    ///
    /// Durations are whole seconds unless the variable ends in `_MS`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, JobsError> {
        let env = Env { lookup: &lookup };
        let mut config = Self::default();

        env.secs("JOBS_LEASE_TTL_SECS", &mut config.lease_ttl)?;
        env.secs("JOBS_HEARTBEAT_SECS", &mut config.heartbeat_interval)?;
        env.millis("JOBS_POLL_INTERVAL_MS", &mut config.poll_interval)?;
        env.secs("JOBS_JOB_TIMEOUT_SECS", &mut config.default_job_timeout)?;
        env.secs("JOBS_RETRY_BASE_SECS", &mut config.retry.base_delay)?;
        env.secs("JOBS_RETRY_MAX_SECS", &mut config.retry.max_delay)?;
        env.parse("JOBS_MAX_RETRIES", &mut config.default_max_retries)?;
        env.secs("JOBS_DRAIN_TIMEOUT_SECS", &mut config.drain_timeout)?;
        env.secs("JOBS_SHUTDOWN_GRACE_SECS", &mut config.shutdown_grace)?;
        env.millis("JOBS_SCHEDULER_TICK_MS", &mut config.scheduler_tick)?;
        env.parse("JOBS_EVENT_CAPACITY", &mut config.event_capacity)?;
        env.secs("JOBS_MONITOR_WINDOW_SECS", &mut config.monitor.window)?;
        env.secs("JOBS_MONITOR_SAMPLE_SECS", &mut config.monitor.sample_interval)?;

        let mut aging = 0u64;
        env.parse("JOBS_AGING_SECS", &mut aging)?;
        if aging > 0 {
            config.aging_threshold = Some(Duration::from_secs(aging));
        }

        let mut workers = 0usize;
        let mut capacity = 1usize;
        env.parse("JOBS_WORKERS", &mut workers)?;
        env.parse("JOBS_WORKER_CAPACITY", &mut capacity)?;
        config
            .workers
            .extend((0..workers).map(|_| WorkerConfig::new(capacity)));

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the actors cannot run with.
    pub fn validate(&self) -> Result<(), JobsError> {
        if self.lease_ttl <= self.heartbeat_interval {
            return Err(JobsError::validation(format!(
                "lease TTL {:?} must exceed heartbeat interval {:?}",
                self.lease_ttl, self.heartbeat_interval
            )));
        }
        if self.poll_interval.is_zero() || self.scheduler_tick.is_zero() {
            return Err(JobsError::validation(
                "poll interval and scheduler tick must be non-zero",
            ));
        }
        if self.event_capacity == 0 {
            return Err(JobsError::validation("event capacity must be non-zero"));
        }
        if self.workers.iter().any(|w| w.capacity == 0) {
            return Err(JobsError::validation("worker capacity must be at least 1"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(JobsError::validation(
                "retry base delay must not exceed the max delay",
            ));
        }
        Ok(())
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn parse<T: FromStr>(&self, key: &str, target: &mut T) -> Result<(), JobsError> {
        if let Some(raw) = (self.lookup)(key).filter(|v| !v.trim().is_empty()) {
            *target = raw
                .trim()
                .parse()
                .map_err(|_| JobsError::validation(format!("{key}: invalid value '{raw}'")))?;
        }
        Ok(())
    }

    fn secs(&self, key: &str, target: &mut Duration) -> Result<(), JobsError> {
        let mut secs = target.as_secs();
        self.parse(key, &mut secs)?;
        *target = Duration::from_secs(secs);
        Ok(())
    }

    fn millis(&self, key: &str, target: &mut Duration) -> Result<(), JobsError> {
        let mut millis = target.as_millis() as u64;
        self.parse(key, &mut millis)?;
        *target = Duration::from_millis(millis);
        Ok(())
    }
}
