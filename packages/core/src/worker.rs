//! Worker descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobType};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Claiming and running jobs.
    #[default]
    Active,
    /// Finishing in-flight jobs, claiming nothing new.
    Draining,
    Stopped,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Active => write!(f, "active"),
            WorkerStatus::Draining => write!(f, "draining"),
            WorkerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Configuration for adding a worker to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Explicit id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Maximum concurrent jobs.
    pub capacity: usize,
    /// Job types this worker may claim. Empty means every registered type.
    #[serde(default)]
    pub supported_types: Vec<JobType>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: None,
            capacity: 1,
            supported_types: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = JobType>) -> Self {
        self.supported_types = types.into_iter().collect();
        self
    }
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub capacity: usize,
    pub supported_types: Vec<JobType>,
    pub status: WorkerStatus,
    pub current_load: usize,
    pub running_jobs: Vec<JobId>,
    pub last_heartbeat: DateTime<Utc>,
    pub processed_count: u64,
    pub failed_count: u64,
    pub started_at: DateTime<Utc>,
}
