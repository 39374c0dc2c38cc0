//! Scheduler actor: turns cron schedules into jobs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobs_core::{
    CreateJobRequest, CronExpr, Job, JobEvent, JobPayload, JobsError, Schedule, ScheduleConfig,
    ScheduleId, SchedulePatch,
};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::config::ServiceConfig;
use crate::messages::SchedulerMessage;
use crate::queue::JobQueue;

struct Entry {
    schedule: Schedule,
    cron: CronExpr,
}

impl Entry {
    fn refresh_next_run(&mut self, now: DateTime<Utc>) {
        self.schedule.next_run_at = if self.schedule.enabled {
            self.cron.next_after(now)
        } else {
            None
        };
    }
}

fn parse_cron(expression: &str) -> Result<CronExpr, JobsError> {
    CronExpr::parse(expression)
        .map_err(|e| JobsError::validation(format!("cron expression '{expression}': {e}")))
}

/// The schedule registry. Missed ticks are never backfilled: every change
/// computes the next run relative to the time of the change.
#[derive(Default)]
pub struct ScheduleBook {
    entries: BTreeMap<ScheduleId, Entry>,
}

impl ScheduleBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn name_taken(&self, name: &str, except: Option<ScheduleId>) -> bool {
        self.entries
            .values()
            .any(|e| e.schedule.name == name && Some(e.schedule.id) != except)
    }

    pub fn add(
        &mut self,
        config: ScheduleConfig,
        now: DateTime<Utc>,
    ) -> Result<Schedule, JobsError> {
        let name = config.name.trim().to_string();
        if name.is_empty() {
            return Err(JobsError::validation("schedule name must not be empty"));
        }
        if self.name_taken(&name, None) {
            return Err(JobsError::conflict(format!("schedule '{name}' already exists")));
        }
        let cron = parse_cron(&config.cron_expression)?;
        JobPayload::from_json(&config.job_type, config.payload_template.clone())?;

        let mut entry = Entry {
            schedule: Schedule {
                id: ScheduleId::new(),
                name,
                cron_expression: cron.as_str().to_string(),
                job_type: config.job_type,
                payload_template: config.payload_template,
                priority: config.priority,
                enabled: config.enabled,
                next_run_at: None,
                last_run_at: None,
                created_at: now,
                updated_at: now,
            },
            cron,
        };
        entry.refresh_next_run(now);
        let schedule = entry.schedule.clone();
        self.entries.insert(schedule.id, entry);
        Ok(schedule)
    }

    /// Apply a patch. Nothing changes unless the whole patch is valid.
    pub fn update(
        &mut self,
        id: ScheduleId,
        patch: SchedulePatch,
        now: DateTime<Utc>,
    ) -> Result<Schedule, JobsError> {
        if !self.entries.contains_key(&id) {
            return Err(JobsError::not_found("Schedule", id));
        }
        let name = match patch.name {
            Some(name) => {
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(JobsError::validation("schedule name must not be empty"));
                }
                if self.name_taken(&name, Some(id)) {
                    return Err(JobsError::conflict(format!("schedule '{name}' already exists")));
                }
                Some(name)
            }
            None => None,
        };
        let cron = patch.cron_expression.as_deref().map(parse_cron).transpose()?;

        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| JobsError::not_found("Schedule", id))?;
        if let Some(template) = &patch.payload_template {
            JobPayload::from_json(&entry.schedule.job_type, template.clone())?;
        }

        if let Some(name) = name {
            entry.schedule.name = name;
        }
        if let Some(cron) = cron {
            entry.schedule.cron_expression = cron.as_str().to_string();
            entry.cron = cron;
        }
        if let Some(template) = patch.payload_template {
            entry.schedule.payload_template = template;
        }
        if let Some(priority) = patch.priority {
            entry.schedule.priority = priority;
        }
        if let Some(enabled) = patch.enabled {
            entry.schedule.enabled = enabled;
        }
        entry.schedule.updated_at = now;
        entry.refresh_next_run(now);
        Ok(entry.schedule.clone())
    }

    pub fn remove(&mut self, id: ScheduleId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn get(&self, id: ScheduleId) -> Option<Schedule> {
        self.entries.get(&id).map(|e| e.schedule.clone())
    }

    /// All schedules, sorted by name.
    pub fn list(&self) -> Vec<Schedule> {
        let mut schedules: Vec<Schedule> =
            self.entries.values().map(|e| e.schedule.clone()).collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        schedules
    }

    /// Advance every enabled schedule due at `now` and return them as they
    /// were before advancing.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<Schedule> {
        let mut due = Vec::new();
        for entry in self.entries.values_mut() {
            if !entry.schedule.enabled || entry.schedule.next_run_at.is_none_or(|at| at > now) {
                continue;
            }
            due.push(entry.schedule.clone());
            entry.schedule.last_run_at = Some(now);
            entry.refresh_next_run(now);
        }
        due
    }

    /// Record a manual run without moving `next_run_at`.
    pub fn mark_triggered(&mut self, id: ScheduleId, now: DateTime<Utc>) -> Option<Schedule> {
        let entry = self.entries.get_mut(&id)?;
        entry.schedule.last_run_at = Some(now);
        Some(entry.schedule.clone())
    }
}

/// Job request for one run of `schedule`.
pub fn job_request(schedule: &Schedule) -> CreateJobRequest {
    CreateJobRequest::new(schedule.job_type.clone(), schedule.payload_template.clone())
        .with_priority(schedule.priority)
        .with_correlation_id(schedule.correlation_id())
}

/// State for the scheduler actor.
pub struct SchedulerState {
    book: ScheduleBook,
    queue: JobQueue,
    settings: Arc<ServiceConfig>,
}

impl SchedulerState {
    async fn enqueue(&self, schedule: &Schedule, manual: bool) -> Result<Job, JobsError> {
        let job = job_request(schedule).into_job(self.settings.default_max_retries)?;
        let job = self.queue.enqueue(job).await?;
        self.queue.publish(JobEvent::ScheduleTriggered {
            schedule_id: schedule.id,
            job_id: job.id,
            manual,
            timestamp: Utc::now(),
        });
        Ok(job)
    }
}

/// Scheduler actor arguments.
pub struct SchedulerArgs {
    pub book: ScheduleBook,
    pub queue: JobQueue,
    pub settings: Arc<ServiceConfig>,
}

/// Single actor that owns every schedule and ticks at a fixed resolution.
pub struct SchedulerActor;

impl Actor for SchedulerActor {
    type Msg = SchedulerMessage;
    type State = SchedulerState;
    type Arguments = SchedulerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting scheduler with {} schedules", args.book.len());

        let tick = args.settings.scheduler_tick;
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                if myself_clone.send_message(SchedulerMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(SchedulerState {
            book: args.book,
            queue: args.queue,
            settings: args.settings,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SchedulerMessage::Tick => {
                for schedule in state.book.take_due(Utc::now()) {
                    match state.enqueue(&schedule, false).await {
                        Ok(job) => tracing::info!(
                            "Schedule '{}' enqueued job {}",
                            schedule.name,
                            job.id
                        ),
                        Err(e) => tracing::warn!(
                            "Schedule '{}' failed to enqueue: {}",
                            schedule.name,
                            e
                        ),
                    }
                }
            }

            SchedulerMessage::Add { config, reply } => {
                let result = state.book.add(config, Utc::now());
                if let Ok(schedule) = &result {
                    tracing::info!(
                        "Added schedule '{}' ({}), next run {:?}",
                        schedule.name,
                        schedule.cron_expression,
                        schedule.next_run_at
                    );
                }
                let _ = reply.send(result);
            }

            SchedulerMessage::Update { id, patch, reply } => {
                let _ = reply.send(state.book.update(id, patch, Utc::now()));
            }

            SchedulerMessage::Remove { id, reply } => {
                let removed = state.book.remove(id);
                if removed {
                    tracing::info!("Removed schedule {}", id);
                }
                let _ = reply.send(removed);
            }

            SchedulerMessage::Get { id, reply } => {
                let _ = reply.send(state.book.get(id));
            }

            SchedulerMessage::List { reply } => {
                let _ = reply.send(state.book.list());
            }

            SchedulerMessage::Trigger { id, reply } => {
                let result = match state.book.mark_triggered(id, Utc::now()) {
                    Some(schedule) => state.enqueue(&schedule, true).await,
                    None => Err(JobsError::not_found("Schedule", id)),
                };
                let _ = reply.send(result);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use jobs_core::{JobFilter, JobType, Priority};

    fn noon_and_a_half() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 30).unwrap()
    }

    /// Tick once a second for `minutes` and count the runs that came due.
    fn simulate(book: &mut ScheduleBook, start: DateTime<Utc>, minutes: i64) -> usize {
        (1..=minutes * 60)
            .map(|s| book.take_due(start + Duration::seconds(s)).len())
            .sum()
    }

    #[test]
    fn every_minute_runs_five_times_in_five_minutes() {
        let mut book = ScheduleBook::new();
        let start = noon_and_a_half();
        book.add(
            ScheduleConfig::new("heartbeat", "* * * * *", JobType::HealthCheck),
            start,
        )
        .unwrap();

        assert_eq!(simulate(&mut book, start, 5), 5);
    }

    #[test]
    fn disabled_schedule_never_runs() {
        let mut book = ScheduleBook::new();
        let start = noon_and_a_half();
        let schedule = book
            .add(
                ScheduleConfig::new("heartbeat", "* * * * *", JobType::HealthCheck).disabled(),
                start,
            )
            .unwrap();

        assert_eq!(schedule.next_run_at, None);
        assert_eq!(simulate(&mut book, start, 5), 0);
    }

    #[test]
    fn enabling_does_not_backfill() {
        let mut book = ScheduleBook::new();
        let start = noon_and_a_half();
        let schedule = book
            .add(
                ScheduleConfig::new("heartbeat", "* * * * *", JobType::HealthCheck).disabled(),
                start,
            )
            .unwrap();

        let later = start + Duration::minutes(10);
        let enabled = book
            .update(schedule.id, SchedulePatch::enabled(true), later)
            .unwrap();
        assert_eq!(
            enabled.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 12, 11, 0).unwrap())
        );
        assert!(book.take_due(later).is_empty());
    }

    #[test]
    fn changing_cron_recomputes_next_run() {
        let mut book = ScheduleBook::new();
        let start = noon_and_a_half();
        let schedule = book
            .add(
                ScheduleConfig::new("nightly", "0 3 * * *", JobType::Cleanup),
                start,
            )
            .unwrap();
        assert_eq!(
            schedule.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 3, 3, 0, 0).unwrap())
        );

        let updated = book
            .update(schedule.id, SchedulePatch::cron("*/15 * * * *"), start)
            .unwrap();
        assert_eq!(
            updated.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 12, 15, 0).unwrap())
        );
    }

    #[test]
    fn rejects_conflicts_and_bad_input() {
        let mut book = ScheduleBook::new();
        let now = noon_and_a_half();
        book.add(ScheduleConfig::new("a", "* * * * *", JobType::HealthCheck), now)
            .unwrap();

        let duplicate = book.add(ScheduleConfig::new("a", "0 * * * *", JobType::HealthCheck), now);
        assert!(matches!(duplicate, Err(JobsError::Conflict(_))));

        let bad_cron = book.add(ScheduleConfig::new("b", "61 * * * *", JobType::HealthCheck), now);
        assert!(matches!(bad_cron, Err(JobsError::Validation(_))));

        let bad_payload = book.add(
            ScheduleConfig::new("c", "* * * * *", JobType::DigestGeneration)
                .with_payload(serde_json::json!({ "digest_id": 7 })),
            now,
        );
        assert!(matches!(bad_payload, Err(JobsError::Validation(_))));

        let missing = book.update(ScheduleId::new(), SchedulePatch::enabled(false), now);
        assert!(matches!(missing, Err(JobsError::NotFound { .. })));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn manual_trigger_keeps_next_run() {
        let mut book = ScheduleBook::new();
        let now = noon_and_a_half();
        let schedule = book
            .add(
                ScheduleConfig::new("nightly", "0 3 * * *", JobType::Cleanup).disabled(),
                now,
            )
            .unwrap();

        let triggered = book.mark_triggered(schedule.id, now).unwrap();
        assert_eq!(triggered.last_run_at, Some(now));
        assert_eq!(triggered.next_run_at, None);
    }

    #[test]
    fn job_request_carries_schedule_identity() {
        let mut book = ScheduleBook::new();
        let schedule = book
            .add(
                ScheduleConfig::new("pulse", "*/5 * * * *", JobType::HealthCheck)
                    .with_priority(Priority::High),
                noon_and_a_half(),
            )
            .unwrap();

        let job = job_request(&schedule).into_job(3).unwrap();
        assert_eq!(job.job_type, JobType::HealthCheck);
        assert_eq!(job.priority, Priority::High);
        assert_eq!(
            job.correlation_id.as_deref(),
            Some(format!("schedule:{}", schedule.id).as_str())
        );
    }

    #[test]
    fn list_is_sorted_by_name() {
        let mut book = ScheduleBook::new();
        let now = noon_and_a_half();
        for name in ["zeta", "alpha", "mid"] {
            book.add(ScheduleConfig::new(name, "@hourly", JobType::HealthCheck), now)
                .unwrap();
        }
        let names: Vec<String> = book.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn tick_loop_enqueues_overdue_schedule_once() {
        let store: Arc<dyn jobs_core::JobStore> = Arc::new(jobs_db::MemoryJobStore::new());
        let settings = Arc::new(
            ServiceConfig::default().with_scheduler_tick(std::time::Duration::from_millis(20)),
        );
        let (events, _) = tokio::sync::broadcast::channel(16);
        let queue = JobQueue::new(store.clone(), events, &settings);

        // Registered days ago, so its first run is long overdue.
        let mut book = ScheduleBook::new();
        let schedule = book
            .add(
                ScheduleConfig::new("nightly", "0 0 * * *", JobType::HealthCheck),
                Utc::now() - Duration::days(3),
            )
            .unwrap();

        let (actor, handle) = Actor::spawn(
            None,
            SchedulerActor,
            SchedulerArgs {
                book,
                queue,
                settings,
            },
        )
        .await
        .unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while store.query(JobFilter::default()).await.unwrap().is_empty()
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        // Several more ticks: the missed nights are not replayed.
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        let jobs = store.query(JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::HealthCheck);
        assert_eq!(
            jobs[0].correlation_id.as_deref(),
            Some(format!("schedule:{}", schedule.id).as_str())
        );

        let reply = ractor::rpc::call(
            &actor,
            |reply| SchedulerMessage::Get {
                id: schedule.id,
                reply,
            },
            None,
        )
        .await
        .unwrap();
        let ractor::rpc::CallResult::Success(Some(after)) = reply else {
            panic!("scheduler did not return the schedule");
        };
        let (last, next) = (after.last_run_at.unwrap(), after.next_run_at.unwrap());
        assert!(next > last);
        assert!(next > Utc::now());

        actor.stop(None);
        handle.await.unwrap();
    }
}
