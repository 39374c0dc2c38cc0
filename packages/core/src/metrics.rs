//! Metrics and health report types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobStatus, JobType};

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobCounts {
    pub pending: u64,
    pub running: u64,
    pub retrying: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobCounts {
    pub fn from_map(counts: &HashMap<JobStatus, u64>) -> Self {
        let get = |status| counts.get(&status).copied().unwrap_or(0);
        Self {
            pending: get(JobStatus::Pending),
            running: get(JobStatus::Running),
            retrying: get(JobStatus::Retrying),
            completed: get(JobStatus::Completed),
            failed: get(JobStatus::Failed),
            cancelled: get(JobStatus::Cancelled),
        }
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Retrying => self.retrying,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    fn slot(&mut self, status: JobStatus) -> &mut u64 {
        match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::Retrying => &mut self.retrying,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        }
    }

    pub fn increment(&mut self, status: JobStatus) {
        *self.slot(status) += 1;
    }

    pub fn decrement(&mut self, status: JobStatus) {
        let slot = self.slot(status);
        *slot = slot.saturating_sub(1);
    }

    /// Jobs waiting to be claimed.
    pub fn queue_depth(&self) -> u64 {
        self.pending + self.retrying
    }

    /// Jobs not yet terminal.
    pub fn active(&self) -> u64 {
        self.pending + self.running + self.retrying
    }

    pub fn total(&self) -> u64 {
        self.active() + self.completed + self.failed + self.cancelled
    }
}

/// Point-in-time aggregate of the job system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub counts: JobCounts,
    /// Completed jobs per minute over the sliding window.
    pub throughput_per_min: f64,
    /// Failed attempts over all finished attempts in the window, 0.0–1.0.
    pub error_rate: f64,
    pub avg_processing_ms: Option<f64>,
    pub p50_processing_ms: Option<u64>,
    pub p95_processing_ms: Option<u64>,
    pub active_workers: usize,
    pub total_capacity: usize,
    pub current_load: usize,
}

/// Health grade, ordered from best to worst.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
        }
    }
}

/// Aggregated health of the job system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub metrics: MetricsSnapshot,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(components: Vec<ComponentHealth>, metrics: MetricsSnapshot) -> Self {
        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or_default();
        Self {
            status,
            components,
            metrics,
            checked_at: Utc::now(),
        }
    }

    /// Add a component and re-grade the overall status.
    pub fn with_component(mut self, component: ComponentHealth) -> Self {
        self.status = self.status.max(component.status);
        self.components.push(component);
        self
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Cumulative execution statistics for one job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPerformanceStats {
    pub job_type: JobType,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub avg_duration_ms: Option<f64>,
    pub p95_duration_ms: Option<u64>,
}

impl JobPerformanceStats {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            completed: 0,
            failed: 0,
            retried: 0,
            avg_duration_ms: None,
            p95_duration_ms: None,
        }
    }

    /// Total processed jobs.
    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.processed();
        if total == 0 {
            None
        } else {
            Some((self.completed as f64 / total as f64) * 100.0)
        }
    }
}
