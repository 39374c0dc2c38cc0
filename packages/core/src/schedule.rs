//! Recurring schedule definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::job::{JobType, Priority};

/// Unique identifier for a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub Ulid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cron trigger that enqueues jobs of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    pub cron_expression: String,
    pub job_type: JobType,
    pub payload_template: serde_json::Value,
    pub priority: Priority,
    pub enabled: bool,
    /// Next due time; `None` while disabled.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Correlation id stamped on jobs this schedule produces.
    pub fn correlation_id(&self) -> String {
        format!("schedule:{}", self.id)
    }
}

/// Input for creating a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    pub cron_expression: String,
    pub job_type: JobType,
    #[serde(default)]
    pub payload_template: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl ScheduleConfig {
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        job_type: JobType,
    ) -> Self {
        Self {
            name: name.into(),
            cron_expression: cron_expression.into(),
            job_type,
            payload_template: serde_json::Value::Null,
            priority: Priority::default(),
            enabled: true,
        }
    }

    pub fn with_payload(mut self, payload_template: serde_json::Value) -> Self {
        self.payload_template = payload_template;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Partial update of a schedule; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulePatch {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub payload_template: Option<serde_json::Value>,
    pub priority: Option<Priority>,
    pub enabled: Option<bool>,
}

impl SchedulePatch {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Default::default()
        }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            cron_expression: Some(expression.into()),
            ..Default::default()
        }
    }
}
